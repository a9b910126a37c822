//! Configuration module
//!
//! このモジュールはパルス計測と充電検出の設定、
//! および設定の永続化機能を提供します。

pub mod params;
pub mod storage;

// params.rsから主要な定数を再エクスポート
pub use params::*;

// storage.rsから構造体と永続化関数を再エクスポート
pub use storage::{
    initialize_default_config, load_or_initialize_config, read_config, write_config, MeterConfig,
};
