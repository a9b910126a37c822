//! 充電セッションの永続化状態
//!
//! 開始確定時と終了確定時にだけ書き込む。起動時に `active` なら充電中から再開する。

use serde::{Deserialize, Serialize};

use crate::store::{Namespace, Record};

/// 進行中のセッションの開始時点の記録
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChargingSnapshot {
    pub active: bool,
    /// 開始時刻 [UNIX秒]（時刻未同期なら0）
    pub start_epoch: u64,
    pub start_energy_kwh: f32,
    pub start_battery_level_pct: f32,
    pub start_odometer_km: f32,
}

impl ChargingSnapshot {
    pub const fn inactive() -> Self {
        Self {
            active: false,
            start_epoch: 0,
            start_energy_kwh: 0.0,
            start_battery_level_pct: 0.0,
            start_odometer_km: 0.0,
        }
    }
}

/// 前回セッション終了時の値（待機電力量・電費の計算用）
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LastSessionEnd {
    pub energy_kwh: f32,
    pub odometer_km: f32,
}

/// 充電名前空間の永続化レコード（"CHG1"）
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ChargingRecord {
    pub snapshot: ChargingSnapshot,
    pub last_known: bool,
    pub last_end: f32,
    pub last_odo: f32,
}

impl Record for ChargingRecord {
    const NAMESPACE: Namespace = Namespace::Charging;
    const MAGIC: u32 = 0x3147_4843;
    const VERSION: u16 = 1;
}

impl ChargingRecord {
    pub fn new(snapshot: ChargingSnapshot, last_end: Option<LastSessionEnd>) -> Self {
        Self {
            snapshot,
            last_known: last_end.is_some(),
            last_end: last_end.map_or(0.0, |l| l.energy_kwh),
            last_odo: last_end.map_or(0.0, |l| l.odometer_km),
        }
    }

    pub fn last_session_end(&self) -> Option<LastSessionEnd> {
        self.last_known.then_some(LastSessionEnd {
            energy_kwh: self.last_end,
            odometer_km: self.last_odo,
        })
    }
}
