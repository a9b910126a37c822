//! 設定パラメータの永続化構造体
//!
//! params.rsのパラメータのうち実行時に変更できるものを `Config` 名前空間に保存する

use serde::{Deserialize, Serialize};

use super::params;
use crate::store::{self, Namespace, Record, Storage, StoreError};

/// 設定データのマジックナンバー（"EVC1"のASCII）
pub const CONFIG_MAGIC: u32 = 0x3143_5645;

/// 現在の設定バージョン
pub const CONFIG_VERSION: u16 = 1;

/// 永続化される設定構造体
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MeterConfig {
    // === パルス計測 ===
    /// 1kWhあたりのパルス数
    pub pulses_per_kwh: u32,

    /// パルス間隔の補正値 [μs]
    pub pulse_time_correction_us: i32,

    /// カウンタ保存周期 [s]
    pub save_interval_s: u32,

    /// 1ループで処理するパルス数の上限
    pub pulse_batch: u8,

    // === 充電検出 ===
    /// アナログ入力しきい値
    pub charging_threshold: u16,

    /// ヒステリシス幅
    pub charging_hysteresis: u16,

    /// 充電開始の確定時間 [s]
    pub start_confirm_s: u32,

    /// 充電終了の確定時間 [s]
    pub end_confirm_s: u32,

    /// サンプリング周期 [ms]
    pub sample_interval_ms: u32,

    // === 表示 ===
    /// セッションレコードの時刻に使うUTCオフセット [分]
    pub utc_offset_minutes: i16,
}

impl MeterConfig {
    /// デフォルト設定を生成（params.rsの値を使用）
    pub const fn new() -> Self {
        Self {
            pulses_per_kwh: params::DEFAULT_PULSES_PER_KWH,
            pulse_time_correction_us: params::DEFAULT_PULSE_TIME_CORRECTION_US,
            save_interval_s: params::DEFAULT_SAVE_INTERVAL_S,
            pulse_batch: params::DEFAULT_PULSE_BATCH,
            charging_threshold: params::charging::DEFAULT_THRESHOLD,
            charging_hysteresis: params::charging::DEFAULT_HYSTERESIS,
            start_confirm_s: params::charging::DEFAULT_START_CONFIRM_S,
            end_confirm_s: params::charging::DEFAULT_END_CONFIRM_S,
            sample_interval_ms: params::charging::DEFAULT_SAMPLE_INTERVAL_MS,
            utc_offset_minutes: params::time::DEFAULT_UTC_OFFSET_MINUTES,
        }
    }

    /// 値の範囲を検証
    pub fn is_valid(&self) -> bool {
        self.pulses_per_kwh > 0
            && self.pulse_batch > 0
            && self.sample_interval_ms > 0
            && self.save_interval_s > 0
            && self.charging_hysteresis < self.charging_threshold
            && (-14 * 60..=14 * 60).contains(&self.utc_offset_minutes)
    }
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl Record for MeterConfig {
    const NAMESPACE: Namespace = Namespace::Config;
    const MAGIC: u32 = CONFIG_MAGIC;
    const VERSION: u16 = CONFIG_VERSION;
}

/// ストアから設定を読み込む
pub fn read_config<S: Storage + ?Sized>(store: &mut S) -> Result<MeterConfig, StoreError> {
    let config: MeterConfig = store::load(store)?;
    if !config.is_valid() {
        error!("Stored config out of range: {}", config);
        return Err(StoreError::Corrupt);
    }

    info!("Config loaded successfully: version={}", CONFIG_VERSION);
    Ok(config)
}

/// ストアに設定を書き込む
pub fn write_config<S: Storage + ?Sized>(
    store: &mut S,
    config: &MeterConfig,
) -> Result<(), StoreError> {
    store::save(store, config)?;
    info!("Config saved successfully");
    Ok(())
}

/// ストアをデフォルト設定で初期化
pub fn initialize_default_config<S: Storage + ?Sized>(
    store: &mut S,
) -> Result<MeterConfig, StoreError> {
    info!("Initializing store with default config");

    let config = MeterConfig::new();
    write_config(store, &config)?;

    Ok(config)
}

/// 設定を読み込み、失敗時はデフォルト設定で初期化
///
/// 初期化にも失敗した場合はメモリ上のデフォルト設定を返す
pub fn load_or_initialize_config<S: Storage + ?Sized>(store: &mut S) -> MeterConfig {
    match read_config(store) {
        Ok(config) => config,
        Err(e) => {
            warn!("Failed to load config: {}, initializing with defaults", e);
            match initialize_default_config(store) {
                Ok(config) => config,
                Err(e) => {
                    error!(
                        "Failed to initialize default config: {}, using in-memory defaults",
                        e
                    );
                    MeterConfig::new()
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::mock::MemoryStore;

    #[test]
    fn test_default_config() {
        let config = MeterConfig::default();
        assert_eq!(config.pulses_per_kwh, 100);
        assert_eq!(config.save_interval_s, 60);
        assert_eq!(config.charging_threshold, 2000);
        assert_eq!(config.charging_hysteresis, 100);
        assert!(config.is_valid());
    }

    #[test]
    fn test_first_boot_writes_defaults() {
        let mut store = MemoryStore::default();
        let config = load_or_initialize_config(&mut store);
        assert_eq!(config, MeterConfig::new());
        assert_eq!(store.writes, 1);
        assert!(store.config.is_some());
    }

    #[test]
    fn test_stored_config_is_used() {
        let mut store = MemoryStore::default();
        let custom = MeterConfig {
            pulses_per_kwh: 1000,
            start_confirm_s: 30,
            ..MeterConfig::new()
        };
        write_config(&mut store, &custom).unwrap();

        let loaded = load_or_initialize_config(&mut store);
        assert_eq!(loaded, custom);
        assert_eq!(store.writes, 1);
    }

    #[test]
    fn test_invalid_config_replaced() {
        let mut store = MemoryStore::default();
        let broken = MeterConfig {
            pulses_per_kwh: 0,
            ..MeterConfig::new()
        };
        write_config(&mut store, &broken).unwrap();

        let loaded = load_or_initialize_config(&mut store);
        assert_eq!(loaded, MeterConfig::new());
    }

    #[test]
    fn test_write_failure_falls_back_to_memory() {
        let mut store = MemoryStore {
            fail_writes: true,
            ..Default::default()
        };
        assert_eq!(load_or_initialize_config(&mut store), MeterConfig::new());
    }

    #[test]
    fn test_size_constraint() {
        let mut buf = [0u8; crate::store::RECORD_MAX_LEN];
        let bytes = postcard::to_slice(&MeterConfig::new(), &mut buf).unwrap();
        assert!(bytes.len() + 16 <= crate::store::flash_log::SLOT_PAYLOAD);
    }
}
