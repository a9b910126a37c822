//! セッション終了時のレコード生成
//!
//! CSVの列順:
//! 終了日, 終了時刻, 開始時刻, 終了時電力量, 待機電力量, 充電量,
//! 開始時SoC, 終了時SoC, 終了時航続距離[km], 終了時走行距離[km], 電費[Wh/km], 緯度, 経度

use core::fmt::Write;

use chrono::{Datelike, FixedOffset, TimeZone, Timelike};
use heapless::String;

use super::snapshot::{ChargingSnapshot, LastSessionEnd};
use crate::telemetry::VehicleTelemetry;

/// CSV1行の最大長
pub const CSV_MAX_LEN: usize = 192;

/// アップロード用ペイロード
pub type CsvPayload = String<CSV_MAX_LEN>;

/// 電費計算に使う最小走行距離 [km]
const MIN_DISTANCE_KM: f32 = 0.001;

/// レコード生成エラー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RecordError {
    /// CSVがバッファに収まらない
    TooLong,
}

/// 1回の充電セッションの記録
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SessionRecord {
    pub start_epoch: u64,
    pub end_epoch: u64,
    pub end_energy_kwh: f32,
    /// 前回終了から今回開始までの電力量（前回終了が不明なら `None`）
    pub standby_kwh: Option<f32>,
    pub charged_kwh: f32,
    pub start_level_pct: f32,
    pub end_level_pct: f32,
    pub end_range_km: f32,
    pub end_odometer_km: f32,
    pub wh_per_km: f32,
    pub latitude: f64,
    pub longitude: f64,
}

impl SessionRecord {
    /// 開始スナップショットと終了時の値からレコードを組み立てる
    ///
    /// 電費の距離は前回終了時の走行距離からの差分。前回終了が不明なら開始時からの差分を使う。
    pub fn build(
        start: &ChargingSnapshot,
        last_end: Option<LastSessionEnd>,
        end: &VehicleTelemetry,
        end_energy_kwh: f32,
        end_epoch: u64,
    ) -> Self {
        let charged_kwh = end_energy_kwh - start.start_energy_kwh;
        let end_odometer_km = end.odometer_km();

        let distance_km = match last_end {
            Some(last) => end_odometer_km - last.odometer_km,
            None => end_odometer_km - start.start_odometer_km,
        };
        let wh_per_km = if distance_km > MIN_DISTANCE_KM {
            charged_kwh * 1000.0 / distance_km
        } else {
            0.0
        };

        Self {
            start_epoch: start.start_epoch,
            end_epoch,
            end_energy_kwh,
            standby_kwh: last_end.map(|last| start.start_energy_kwh - last.energy_kwh),
            charged_kwh,
            start_level_pct: start.start_battery_level_pct,
            end_level_pct: end.battery_level_pct,
            end_range_km: end.range_km(),
            end_odometer_km,
            wh_per_km,
            latitude: end.latitude,
            longitude: end.longitude,
        }
    }

    /// CSV1行に整形する
    ///
    /// # Arguments
    /// * `utc_offset_minutes` - 日時表示のUTCオフセット [分]
    pub fn to_csv(&self, utc_offset_minutes: i16) -> Result<CsvPayload, RecordError> {
        let mut csv = CsvPayload::new();
        let end = LocalTime::from_epoch(self.end_epoch, utc_offset_minutes);
        let start = LocalTime::from_epoch(self.start_epoch, utc_offset_minutes);

        write!(
            csv,
            "{:04}-{:02}-{:02},{:02}:{:02},{:02}:{:02},{:.2},",
            end.year, end.month, end.day, end.hour, end.minute, start.hour, start.minute,
            self.end_energy_kwh
        )
        .map_err(|_| RecordError::TooLong)?;

        if let Some(standby) = self.standby_kwh {
            write!(csv, "{:.2}", standby).map_err(|_| RecordError::TooLong)?;
        }

        write!(
            csv,
            ",{:.2},{:.1},{:.1},{:.2},{:.0},{:.1},{:.6},{:.6}",
            self.charged_kwh,
            self.start_level_pct,
            self.end_level_pct,
            self.end_range_km,
            self.end_odometer_km,
            self.wh_per_km,
            self.latitude,
            self.longitude
        )
        .map_err(|_| RecordError::TooLong)?;

        Ok(csv)
    }
}

/// 表示用の現地時刻
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LocalTime {
    year: i32,
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
}

impl LocalTime {
    const EPOCH: LocalTime = LocalTime {
        year: 1970,
        month: 1,
        day: 1,
        hour: 0,
        minute: 0,
    };

    /// 時刻未同期（0）や変換できない値は 1970-01-01 00:00
    fn from_epoch(epoch: u64, utc_offset_minutes: i16) -> Self {
        if epoch == 0 {
            return Self::EPOCH;
        }
        let Some(offset) = FixedOffset::east_opt(utc_offset_minutes as i32 * 60) else {
            return Self::EPOCH;
        };
        let Ok(secs) = i64::try_from(epoch) else {
            return Self::EPOCH;
        };

        match offset.timestamp_opt(secs, 0).single() {
            Some(t) => Self {
                year: t.year(),
                month: t.month(),
                day: t.day(),
                hour: t.hour(),
                minute: t.minute(),
            },
            None => Self::EPOCH,
        }
    }
}
