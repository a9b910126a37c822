//! タスクモジュール
//!
//! 各タスクの実装を分離して管理します。

pub mod charging;
pub mod mqtt;
pub mod network;
pub mod pulse;

// タスク関数を再エクスポート
pub use charging::charging_task;
pub use mqtt::mqtt_task;
pub use network::{connection_task, net_task, time_sync_task};
pub use pulse::pulse_task;
