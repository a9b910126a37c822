//! 電力量の計算と共有スナップショット
//!
//! パルスカウンタから積算電力量 [kWh] を、パルス間隔から瞬時電力 [W] を求める。
//! 計算結果は `SnapshotCell` に丸ごと書き込み、読み出し側は常に一貫したコピーを得る。

use core::cell::Cell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;

/// パルスカウンタ（パルス集計タスクのみが変更する）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EnergyCounters {
    /// 累積パルス数
    pub pulse_count: u32,
    /// リセット可能な小計パルス数
    pub subtotal_count: u16,
}

impl EnergyCounters {
    pub const fn new() -> Self {
        Self {
            pulse_count: 0,
            subtotal_count: 0,
        }
    }

    /// 1パルス加算（小計は16bitで折り返す）
    pub fn add_pulse(&mut self) {
        self.pulse_count = self.pulse_count.wrapping_add(1);
        self.subtotal_count = self.subtotal_count.wrapping_add(1);
    }

    /// 累積電力量 [kWh]
    pub fn energy_kwh(&self, pulses_per_kwh: u32) -> f32 {
        pulses_to_kwh(self.pulse_count, pulses_per_kwh)
    }

    /// 小計電力量 [kWh]
    pub fn subtotal_kwh(&self, pulses_per_kwh: u32) -> f32 {
        pulses_to_kwh(self.subtotal_count as u32, pulses_per_kwh)
    }
}

fn pulses_to_kwh(pulses: u32, pulses_per_kwh: u32) -> f32 {
    if pulses_per_kwh == 0 {
        return 0.0;
    }
    (pulses as f64 / pulses_per_kwh as f64) as f32
}

/// パルス間隔から瞬時電力を計算
///
/// `power = round((3_600_000 / (Δt + correction)) / pulses_per_kwh * 1000)` [W]
///
/// # Arguments
/// * `delta_us` - 連続する2パルスの間隔 [μs]
/// * `correction_us` - 間隔の校正値 [μs]
/// * `pulses_per_kwh` - 1kWhあたりのパルス数
///
/// # Returns
/// 電力 [W]。間隔が0以下、またはパルス定数が0の場合は `None`
pub fn power_from_interval(delta_us: u64, correction_us: i32, pulses_per_kwh: u32) -> Option<f32> {
    let period_us = delta_us as i64 + correction_us as i64;
    if period_us <= 0 || pulses_per_kwh == 0 {
        return None;
    }

    let watts = (3_600_000.0 / period_us as f64) / pulses_per_kwh as f64 * 1000.0;
    Some(libm::round(watts) as f32)
}

/// 公開用の電力量スナップショット
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EnergySnapshot {
    /// 瞬時電力 [W]
    pub power_w: f32,
    /// 累積電力量 [kWh]
    pub energy_kwh: f32,
    /// 小計電力量 [kWh]
    pub subtotal_kwh: f32,
}

impl EnergySnapshot {
    pub const fn new() -> Self {
        Self {
            power_w: 0.0,
            energy_kwh: 0.0,
            subtotal_kwh: 0.0,
        }
    }

    /// カウンタと電力からスナップショットを作成
    pub fn from_counters(power_w: f32, counters: &EnergyCounters, pulses_per_kwh: u32) -> Self {
        Self {
            power_w,
            energy_kwh: counters.energy_kwh(pulses_per_kwh),
            subtotal_kwh: counters.subtotal_kwh(pulses_per_kwh),
        }
    }
}

/// タスク間で共有するスナップショットセル
///
/// クリティカルセクション内で値全体をコピーするため、読み出しが途中状態になることはない。
/// 集計タスクが最初の値を書き込むまでは `None` を返す。
pub struct SnapshotCell {
    inner: Mutex<CriticalSectionRawMutex, Cell<Option<EnergySnapshot>>>,
}

impl SnapshotCell {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(Cell::new(None)),
        }
    }

    /// スナップショットを更新
    pub fn publish(&self, snapshot: EnergySnapshot) {
        self.inner.lock(|cell| cell.set(Some(snapshot)));
    }

    /// 最新のスナップショットを取得
    pub fn latest(&self) -> Option<EnergySnapshot> {
        self.inner.lock(|cell| cell.get())
    }

    /// 最新の累積電力量 [kWh]
    pub fn energy_kwh(&self) -> Option<f32> {
        self.latest().map(|s| s.energy_kwh)
    }
}

impl Default for SnapshotCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_one_second_interval() {
        // 100パルス/kWh、1秒間隔 → 36W
        assert_eq!(power_from_interval(1_000_000, 0, 100), Some(36.0));
    }

    #[test]
    fn test_power_formula_with_correction() {
        // 3_600_000 / 500_000 / 1000 * 1000 = 7.2 → 7
        assert_eq!(power_from_interval(499_000, 1_000, 1000), Some(7.0));
        // 1kWh/パルス、3.6秒間隔 → 1000W
        assert_eq!(power_from_interval(3_600_000, 0, 1), Some(1000.0));
    }

    #[test]
    fn test_power_rounds_to_nearest_watt() {
        // 3_600_000 / 7_000_000 / 100 * 1000 = 5.142.. → 5
        assert_eq!(power_from_interval(7_000_000, 0, 100), Some(5.0));
        // 3_600_000 / 2_400_000 / 100 * 1000 = 15.0
        assert_eq!(power_from_interval(2_400_000, 0, 100), Some(15.0));
        // 3_600_000 / 800_000 / 100 * 1000 = 45.0
        assert_eq!(power_from_interval(800_000, 0, 100), Some(45.0));
    }

    #[test]
    fn test_power_degenerate_interval() {
        assert_eq!(power_from_interval(0, 0, 100), None);
        assert_eq!(power_from_interval(500, -500, 100), None);
        assert_eq!(power_from_interval(1_000_000, 0, 0), None);
    }

    #[test]
    fn test_energy_from_counters() {
        let counters = EnergyCounters {
            pulse_count: 12_345,
            subtotal_count: 250,
        };
        let snapshot = EnergySnapshot::from_counters(36.0, &counters, 100);
        assert!((snapshot.energy_kwh - 123.45).abs() < 1e-3);
        assert!((snapshot.subtotal_kwh - 2.5).abs() < 1e-6);
        assert_eq!(snapshot.power_w, 36.0);
    }

    #[test]
    fn test_subtotal_wraps_at_u16() {
        let mut counters = EnergyCounters {
            pulse_count: 70_000,
            subtotal_count: u16::MAX,
        };
        counters.add_pulse();
        assert_eq!(counters.pulse_count, 70_001);
        assert_eq!(counters.subtotal_count, 0);
    }

    #[test]
    fn test_snapshot_cell_copy_semantics() {
        let cell = SnapshotCell::new();
        assert_eq!(cell.latest(), None);
        assert_eq!(cell.energy_kwh(), None);

        let snapshot = EnergySnapshot {
            power_w: 1.0,
            energy_kwh: 2.0,
            subtotal_kwh: 3.0,
        };
        cell.publish(snapshot);

        let mut copy = cell.latest().unwrap();
        copy.power_w = 99.0;
        assert_eq!(cell.latest(), Some(snapshot));
        assert_eq!(cell.energy_kwh(), Some(2.0));
    }
}
