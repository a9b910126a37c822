//! EV充電セッション
//!
//! - `detector`: アナログ値からの充電開始・終了の検出（ヒステリシス＋確定時間）
//! - `snapshot`: セッション開始時点の永続化状態
//! - `record`: 終了時のセッションレコードとCSV
//! - `upload`: 送信できなかったレコードのキュー
//! - `session`: 上記をまとめて外部処理（テレメトリ取得・送信）を呼び出す

pub mod detector;
pub mod record;
pub mod session;
pub mod snapshot;
pub mod upload;

pub use detector::{ChargingDetector, ChargingState, Confirmed, DetectorConfig, SampleClass};
pub use record::{CsvPayload, RecordError, SessionRecord};
pub use session::{ChargingSession, IoError, SessionIo, UploadTarget};
pub use snapshot::{ChargingRecord, ChargingSnapshot, LastSessionEnd};
pub use upload::PendingUploads;
