//! ファームウェア設定
//!
//! ピン割り当て・フラッシュ配置・ネットワーク接続先など、ボードとビルドに固有の値。
//! 計測・充電検出の実行時パラメータはライブラリ側の `MeterConfig`（フラッシュに保存）にある。

use ev_energy_meter::store::FlashLayout;

/// 入力ピンの有効/無効
///
/// ピンを配線していないボードでは `false` にすると、該当するサブシステムを起動しない。
pub mod pins {
    /// 電力量計のパルス入力（GPIO4、立ち下がりエッジ）
    pub const PULSE_INPUT_ENABLED: bool = true;

    /// 充電検出用アナログ入力（GPIO3、ADC1）
    pub const CHARGING_INPUT_ENABLED: bool = true;
}

/// フラッシュ配置（各名前空間に4KiBセクタを2つずつ、交互に使う）
///
/// 既定パーティションテーブルの `nvs` 領域（0x9000-0xEFFF）をちょうど使い切る。
pub const FLASH_LAYOUT: FlashLayout = FlashLayout {
    config: 0x9000,
    counters: 0xB000,
    charging: 0xD000,
};

/// 起動時のバナーに表示するチップ名
pub const CHIP: &str = "ESP32-C3 @ 160MHz";

/// Wi-Fi
pub mod wifi {
    pub const SSID: &str = env!("SSID");
    pub const PASSWORD: &str = env!("PASSWORD");

    /// 接続失敗時の再試行間隔 [ms]
    pub const RETRY_MS: u64 = 5_000;
}

/// MQTTブローカー
pub mod mqtt {
    use embassy_net::{IpAddress, Ipv4Address};

    pub const BROKER_IP: IpAddress = IpAddress::Ipv4(Ipv4Address::new(192, 168, 1, 10));
    pub const BROKER_PORT: u16 = 1883;
    pub const USERNAME: &str = env!("MQTT_USERNAME");
    pub const PASSWORD: &str = env!("MQTT_PASSWORD");

    /// rust-mqtt の送受信バッファ [byte]（Discoveryペイロードが収まる大きさ）
    pub const BUFFER_SIZE: usize = 1024;

    /// キープアライブ [s]
    pub const KEEP_ALIVE_S: u64 = 15;

    /// 再接続までの待ち [ms]
    pub const RECONNECT_MS: u64 = 5_000;
}

/// 車両API
pub mod vehicle {
    use const_format::formatcp;

    pub const API_BASE: &str = "https://owner-api.teslamotors.com";
    pub const VEHICLE_ID: &str = env!("TESLA_VEHICLE_ID");
    pub const TOKEN: &str = env!("TESLA_TOKEN");

    pub const VEHICLE_DATA_URL: &str =
        formatcp!("{API_BASE}/api/1/vehicles/{VEHICLE_ID}/vehicle_data");
    pub const WAKE_UP_URL: &str = formatcp!("{API_BASE}/api/1/vehicles/{VEHICLE_ID}/wake_up");
    pub const AUTHORIZATION: &str = formatcp!("Bearer {TOKEN}");

    /// 車両がスリープ中のときのステータス
    pub const STATUS_ASLEEP: u16 = 408;
}

/// セッションレコードの送信先
pub mod upload {
    pub const URL: &str = env!("UPLOAD_URL");
}

/// HTTPクライアント
pub mod http {
    /// 1リクエストのタイムアウト [s]
    pub const TIMEOUT_S: u64 = 10;

    /// 応答受信バッファ [byte]（vehicle_data応答全体が収まる大きさ）
    pub const RX_BUFFER_SIZE: usize = 8192;

    /// TLSレコードバッファ [byte]
    pub const TLS_BUFFER_SIZE: usize = 16640;
}

/// 時刻同期
pub mod time {
    pub const NTP_SERVER: &str = "pool.ntp.org";
    pub const NTP_PORT: u16 = 123;

    /// 同期成功後の再同期間隔 [s]
    pub const RESYNC_S: u64 = 6 * 60 * 60;

    /// 同期失敗時の再試行間隔 [s]
    pub const RETRY_S: u64 = 30;
}

/// 破棄パルス数のログ周期 [ms]
pub const DROPPED_LOG_INTERVAL_MS: u64 = 10_000;
