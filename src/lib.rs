//! EVエネルギーメーター コアライブラリ
//!
//! 電力量計のパルス出力から電力・積算電力量を求め、EV充電セッションを検出する。
//! ハードウェアとネットワークには依存せず、境界はすべてトレイトで切り出している
//! （`store::Storage`、`accounting::EnergyPublisher`、`charging::SessionIo`）。
#![cfg_attr(not(test), no_std)]

mod fmt;

pub mod accounting;
pub mod charging;
pub mod commands;
pub mod config;
pub mod energy;
pub mod mailbox;
pub mod mqtt;
pub mod pulse;
pub mod store;
pub mod telemetry;
