//! 計測・充電検出の設定パラメータ（デフォルト値）

/// 1kWhあたりのパルス数（デフォルト値）
pub const DEFAULT_PULSES_PER_KWH: u32 = 100;

/// パルス間隔の補正値 [μs]（デフォルト値）
pub const DEFAULT_PULSE_TIME_CORRECTION_US: i32 = 0;

/// カウンタ保存周期 [s]（フラッシュ書き込み回数を抑えるため1分単位でまとめる）
pub const DEFAULT_SAVE_INTERVAL_S: u32 = 60;

/// 1ループで処理するパルス数の上限
pub const DEFAULT_PULSE_BATCH: u8 = 1;

/// ISR→集計タスク間のパルスキュー長
pub const PULSE_QUEUE_DEPTH: usize = 10;

/// パルス待ちのタイムアウト [ms]
pub const PULSE_WAIT_TIMEOUT_MS: u64 = 1_000;

/// 充電検出パラメータ
pub mod charging {
    /// アナログ入力しきい値（ADC生値）（デフォルト値）
    pub const DEFAULT_THRESHOLD: u16 = 2000;

    /// ヒステリシス幅（ADC生値）（デフォルト値）
    pub const DEFAULT_HYSTERESIS: u16 = 100;

    /// 充電開始の確定時間 [s]（デフォルト値）
    pub const DEFAULT_START_CONFIRM_S: u32 = 10;

    /// 充電終了の確定時間 [s]（デフォルト値）
    pub const DEFAULT_END_CONFIRM_S: u32 = 10;

    /// サンプリング周期 [ms]（デフォルト値）
    pub const DEFAULT_SAMPLE_INTERVAL_MS: u32 = 1_000;

    /// 送信待ちセッションレコードの最大数
    pub const PENDING_UPLOAD_CAPACITY: usize = 4;

    /// 車両テレメトリ取得の試行回数
    pub const TELEMETRY_ATTEMPTS: u8 = 3;

    /// アップロードの試行回数
    pub const UPLOAD_ATTEMPTS: u8 = 3;

    /// 再試行間隔 [ms]
    pub const RETRY_BACKOFF_MS: u64 = 2_000;
}

/// 時刻設定
pub mod time {
    /// ローカル時刻のUTCオフセット [分]（デフォルト値）
    pub const DEFAULT_UTC_OFFSET_MINUTES: i16 = 0;
}
