//! 充電セッション管理
//!
//! 検出器の確定イベントを受けて、開始時・終了時の車両テレメトリと電力量を取得し、
//! セッションレコードを生成・送信する。送信できなかったレコードは `PendingUploads` に積み、
//! 毎tick 1件ずつ再送する。
//!
//! 取得に失敗した場合は安全側の状態に留まる:
//! - 開始時の失敗 → Idle（何も保存しない）
//! - 終了時の失敗 → Charging（セッションを継続扱い）

use core::fmt::Write;

use heapless::String;

use super::detector::{ChargingDetector, ChargingState, Confirmed, DetectorConfig};
use super::record::SessionRecord;
use super::snapshot::{ChargingRecord, ChargingSnapshot, LastSessionEnd};
use super::upload::PendingUploads;
use crate::config::charging::{RETRY_BACKOFF_MS, TELEMETRY_ATTEMPTS, UPLOAD_ATTEMPTS};
use crate::config::MeterConfig;
use crate::energy::SnapshotCell;
use crate::mqtt::LogTopic;
use crate::store::{self, Storage, StoreError};
use crate::telemetry::{TelemetryError, VehicleTelemetry};

/// ネットワーク越しの処理のエラー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IoError {
    /// ネットワーク未接続
    Offline,
    /// リクエスト送信・応答受信の失敗
    Request,
    /// HTTPステータス異常
    Status(u16),
    /// テレメトリ応答の解析失敗
    Telemetry(TelemetryError),
}

impl IoError {
    pub fn as_str(&self) -> &'static str {
        match self {
            IoError::Offline => "network offline",
            IoError::Request => "request failed",
            IoError::Status(_) => "unexpected HTTP status",
            IoError::Telemetry(e) => e.as_str(),
        }
    }
}

impl From<TelemetryError> for IoError {
    fn from(e: TelemetryError) -> Self {
        IoError::Telemetry(e)
    }
}

/// アップロード先
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UploadTarget {
    /// 充電セッションの記録シート
    TeslaData,
}

impl UploadTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadTarget::TeslaData => "TeslaData",
        }
    }
}

/// セッション管理が使う外部処理
///
/// 実装はファームウェア側（HTTPクライアント・SNTP・MQTTキュー）。
/// 割り込みやパルス集計タスクからは呼ばない。
#[allow(async_fn_in_trait)]
pub trait SessionIo {
    /// 車両テレメトリを1回取得
    async fn fetch_telemetry(&mut self) -> Result<VehicleTelemetry, IoError>;

    /// CSVを1回送信
    async fn upload(&mut self, target: UploadTarget, payload: &str) -> Result<(), IoError>;

    /// 再試行の待ち
    async fn delay_ms(&mut self, ms: u64);

    /// 現在時刻 [UNIX秒]。未同期なら `None`
    fn epoch_now(&self) -> Option<u64>;

    /// ログ・ステータスの公開（ベストエフォート）
    fn log(&mut self, topic: LogTopic, message: &str);
}

type Message = String<128>;

fn message(prefix: &str, detail: &str) -> Message {
    let mut m = Message::new();
    let _ = write!(m, "{}{}", prefix, detail);
    m
}

/// 充電セッション
pub struct ChargingSession<'a, S> {
    store: S,
    meter: &'a SnapshotCell,
    detector: ChargingDetector,
    snapshot: ChargingSnapshot,
    last_end: Option<LastSessionEnd>,
    pending: PendingUploads,
    sample_interval_ms: u64,
    last_sample_ms: Option<u64>,
    utc_offset_minutes: i16,
}

impl<'a, S: Storage> ChargingSession<'a, S> {
    /// 保存済みの状態を読み込んで初期化する
    ///
    /// アクティブなスナップショットがあれば開始処理をやり直さずに Charging から再開する。
    pub fn restore<IO: SessionIo>(
        mut store: S,
        meter: &'a SnapshotCell,
        config: &MeterConfig,
        io: &mut IO,
    ) -> Self {
        let record = match store::load::<ChargingRecord, _>(&mut store) {
            Ok(record) => record,
            Err(StoreError::NotFound) => ChargingRecord::default(),
            Err(e) => {
                warn!("Stored charging session unreadable ({}), starting idle", e);
                ChargingRecord::default()
            }
        };

        let detector = ChargingDetector::restore(DetectorConfig::from(config), record.snapshot.active);
        if record.snapshot.active {
            info!("Charging session restored");
            io.log(LogTopic::Log, "Charging session restored from NVS");
        }

        Self {
            store,
            meter,
            detector,
            snapshot: record.snapshot,
            last_end: record.last_session_end(),
            pending: PendingUploads::new(),
            sample_interval_ms: config.sample_interval_ms.max(1) as u64,
            last_sample_ms: None,
            utc_offset_minutes: config.utc_offset_minutes,
        }
    }

    pub fn state(&self) -> ChargingState {
        self.detector.state()
    }

    pub fn is_charging(&self) -> bool {
        self.detector.is_charging()
    }

    pub fn snapshot(&self) -> &ChargingSnapshot {
        &self.snapshot
    }

    pub fn pending(&self) -> &PendingUploads {
        &self.pending
    }

    /// サンプリング周期に達しているか（ティッカーの揺らぎ分として周期の1/8を許容）
    pub fn sample_due(&self, now_ms: u64) -> bool {
        let slack = self.sample_interval_ms / 8;
        match self.last_sample_ms {
            Some(last) => now_ms.saturating_sub(last) + slack >= self.sample_interval_ms,
            None => true,
        }
    }

    /// 1tick分の処理
    ///
    /// 1. 未送信レコードを1件再送
    /// 2. サンプリング周期に達していればアナログ値を検出器に与える
    /// 3. 遷移が確定したら開始・終了処理を実行
    pub async fn tick<IO: SessionIo>(&mut self, now_ms: u64, analog: u16, io: &mut IO) {
        self.flush_pending(io).await;

        if !self.sample_due(now_ms) {
            return;
        }
        self.last_sample_ms = Some(now_ms);

        match self.detector.sample(now_ms, analog) {
            Some(Confirmed::Start) => {
                let captured = self.capture_start(io).await;
                self.detector.complete_start(captured);
            }
            Some(Confirmed::End) => {
                let finalized = self.finalize(io).await;
                self.detector.complete_end(finalized);
            }
            None => {}
        }
    }

    /// 開始スナップショットを取得して保存
    async fn capture_start<IO: SessionIo>(&mut self, io: &mut IO) -> bool {
        let telemetry = match fetch_telemetry(io).await {
            Ok(t) => t,
            Err(e) => {
                io.log(
                    LogTopic::Status,
                    &message("Charging start telemetry failed: ", e.as_str()),
                );
                return false;
            }
        };

        let Some(energy_kwh) = self.meter.energy_kwh() else {
            io.log(LogTopic::Status, "Charging start energy snapshot failed");
            return false;
        };

        self.snapshot = ChargingSnapshot {
            active: true,
            start_epoch: io.epoch_now().unwrap_or(0),
            start_energy_kwh: energy_kwh,
            start_battery_level_pct: telemetry.battery_level_pct,
            start_odometer_km: telemetry.odometer_km(),
        };
        self.persist();

        info!("Charging start captured: energy={} kWh", energy_kwh);
        io.log(LogTopic::Log, "Charging start captured");
        true
    }

    /// 終了時の値を取得し、レコードを送信してセッションを閉じる
    async fn finalize<IO: SessionIo>(&mut self, io: &mut IO) -> bool {
        let telemetry = match fetch_telemetry(io).await {
            Ok(t) => t,
            Err(e) => {
                io.log(
                    LogTopic::Status,
                    &message("Charging end telemetry failed: ", e.as_str()),
                );
                return false;
            }
        };

        let Some(end_energy_kwh) = self.meter.energy_kwh() else {
            io.log(LogTopic::Status, "Charging end energy snapshot failed");
            return false;
        };

        let end_epoch = io.epoch_now().unwrap_or(0);
        let record = SessionRecord::build(
            &self.snapshot,
            self.last_end,
            &telemetry,
            end_energy_kwh,
            end_epoch,
        );

        match record.to_csv(self.utc_offset_minutes) {
            Ok(csv) => match upload_with_retry(io, &csv).await {
                Ok(()) => io.log(LogTopic::Log, "TeslaData upload sent"),
                Err(e) => {
                    warn!("Session upload failed: {}", e);
                    self.pending.push(csv);
                    io.log(LogTopic::Log, "TeslaData upload pending (WiFi/API)");
                }
            },
            Err(e) => {
                error!("Session record not encodable: {}", e);
                io.log(LogTopic::Status, "TeslaData record dropped (CSV too long)");
            }
        }

        info!(
            "Charging session finalized: charged={} kWh",
            record.charged_kwh
        );

        self.last_end = Some(LastSessionEnd {
            energy_kwh: end_energy_kwh,
            odometer_km: record.end_odometer_km,
        });
        self.snapshot = ChargingSnapshot::inactive();
        self.persist();
        true
    }

    /// 未送信レコードを1件だけ再送
    async fn flush_pending<IO: SessionIo>(&mut self, io: &mut IO) {
        let Some(payload) = self.pending.front().cloned() else {
            return;
        };

        match io.upload(UploadTarget::TeslaData, &payload).await {
            Ok(()) => {
                self.pending.complete_front();
                info!("Pending upload sent ({} left)", self.pending.len());
                io.log(LogTopic::Log, "Pending TeslaData upload sent");
            }
            Err(e) => trace!("Pending upload still failing: {}", e),
        }
    }

    fn persist(&mut self) {
        let record = ChargingRecord::new(self.snapshot, self.last_end);
        if let Err(e) = store::save(&mut self.store, &record) {
            error!("Failed to save charging session: {}", e);
        }
    }
}

async fn fetch_telemetry<IO: SessionIo>(io: &mut IO) -> Result<VehicleTelemetry, IoError> {
    let mut last_error = IoError::Offline;
    for attempt in 0..TELEMETRY_ATTEMPTS {
        if attempt > 0 {
            io.delay_ms(RETRY_BACKOFF_MS).await;
        }
        match io.fetch_telemetry().await {
            Ok(telemetry) => return Ok(telemetry),
            Err(e) => {
                warn!("Telemetry attempt {} failed: {}", attempt + 1, e);
                last_error = e;
            }
        }
    }
    Err(last_error)
}

async fn upload_with_retry<IO: SessionIo>(io: &mut IO, payload: &str) -> Result<(), IoError> {
    let mut last_error = IoError::Offline;
    for attempt in 0..UPLOAD_ATTEMPTS {
        if attempt > 0 {
            io.delay_ms(RETRY_BACKOFF_MS).await;
        }
        match io.upload(UploadTarget::TeslaData, payload).await {
            Ok(()) => return Ok(()),
            Err(e) => last_error = e,
        }
    }
    Err(last_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::energy::EnergySnapshot;
    use crate::store::mock::MemoryStore;
    use embassy_futures::block_on;

    const HIGH: u16 = 3000;
    const LOW: u16 = 500;

    struct MockIo {
        telemetry: Result<VehicleTelemetry, IoError>,
        upload_ok: bool,
        fetch_calls: usize,
        uploads: Vec<std::string::String>,
        delays: Vec<u64>,
        logs: Vec<(LogTopic, std::string::String)>,
    }

    impl MockIo {
        fn new() -> Self {
            Self {
                telemetry: Ok(VehicleTelemetry {
                    range_miles: 150.0,
                    battery_level_pct: 50.0,
                    odometer_miles: 1000.0,
                    latitude: 1.0,
                    longitude: 2.0,
                }),
                upload_ok: true,
                fetch_calls: 0,
                uploads: Vec::new(),
                delays: Vec::new(),
                logs: Vec::new(),
            }
        }

        fn logged(&self, text: &str) -> bool {
            self.logs.iter().any(|(_, m)| m == text)
        }
    }

    impl SessionIo for MockIo {
        async fn fetch_telemetry(&mut self) -> Result<VehicleTelemetry, IoError> {
            self.fetch_calls += 1;
            self.telemetry
        }

        async fn upload(&mut self, _target: UploadTarget, payload: &str) -> Result<(), IoError> {
            if self.upload_ok {
                self.uploads.push(payload.into());
                Ok(())
            } else {
                Err(IoError::Offline)
            }
        }

        async fn delay_ms(&mut self, ms: u64) {
            self.delays.push(ms);
        }

        fn epoch_now(&self) -> Option<u64> {
            Some(1_700_000_000)
        }

        fn log(&mut self, topic: LogTopic, message: &str) {
            self.logs.push((topic, message.into()));
        }
    }

    fn meter(energy_kwh: f32) -> SnapshotCell {
        let cell = SnapshotCell::new();
        cell.publish(EnergySnapshot {
            power_w: 0.0,
            energy_kwh,
            subtotal_kwh: 0.0,
        });
        cell
    }

    /// 1秒間隔で `count` 回 tick する
    fn run<S: Storage>(
        session: &mut ChargingSession<'_, S>,
        io: &mut MockIo,
        start_ms: u64,
        count: u64,
        value: u16,
    ) {
        for i in 0..count {
            block_on(session.tick(start_ms + i * 1000, value, io));
        }
    }

    #[test]
    fn test_start_captured_and_persisted() {
        let cell = meter(100.0);
        let mut store = MemoryStore::default();
        let mut io = MockIo::new();
        let mut session = ChargingSession::restore(&mut store, &cell, &MeterConfig::new(), &mut io);

        run(&mut session, &mut io, 0, 10, HIGH);
        assert_eq!(session.state(), ChargingState::StartCandidate);
        assert_eq!(io.fetch_calls, 0);

        run(&mut session, &mut io, 10_000, 1, HIGH);
        assert_eq!(session.state(), ChargingState::Charging);
        assert_eq!(io.fetch_calls, 1);
        assert!(io.logged("Charging start captured"));

        let snapshot = *session.snapshot();
        assert!(snapshot.active);
        assert_eq!(snapshot.start_epoch, 1_700_000_000);
        assert_eq!(snapshot.start_energy_kwh, 100.0);
        assert_eq!(snapshot.start_battery_level_pct, 50.0);

        drop(session);
        let saved: ChargingRecord = store::load(&mut store).unwrap();
        assert_eq!(saved.snapshot, snapshot);
    }

    #[test]
    fn test_failed_start_stays_idle_without_persisting() {
        let cell = meter(100.0);
        let mut store = MemoryStore::default();
        let mut io = MockIo::new();
        io.telemetry = Err(IoError::Telemetry(TelemetryError::Incomplete));
        let mut session = ChargingSession::restore(&mut store, &cell, &MeterConfig::new(), &mut io);

        run(&mut session, &mut io, 0, 11, HIGH);
        assert_eq!(session.state(), ChargingState::Idle);
        assert!(!session.snapshot().active);
        assert_eq!(io.fetch_calls, TELEMETRY_ATTEMPTS as usize);
        assert_eq!(io.delays, vec![RETRY_BACKOFF_MS; TELEMETRY_ATTEMPTS as usize - 1]);
        assert!(io.logged("Charging start telemetry failed: vehicle_data incomplete"));

        drop(session);
        assert!(store.charging.is_none());
    }

    #[test]
    fn test_start_requires_energy_reading() {
        let cell = SnapshotCell::new();
        let mut store = MemoryStore::default();
        let mut io = MockIo::new();
        let mut session = ChargingSession::restore(&mut store, &cell, &MeterConfig::new(), &mut io);

        run(&mut session, &mut io, 0, 11, HIGH);
        assert_eq!(session.state(), ChargingState::Idle);
        assert!(io.logged("Charging start energy snapshot failed"));
    }

    #[test]
    fn test_restore_active_session_resumes_charging() {
        let cell = meter(100.0);
        let mut store = MemoryStore::default();
        let active = ChargingSnapshot {
            active: true,
            start_epoch: 1,
            start_energy_kwh: 90.0,
            start_battery_level_pct: 20.0,
            start_odometer_km: 1609.344,
        };
        store::save(&mut store, &ChargingRecord::new(active, None)).unwrap();

        let mut io = MockIo::new();
        let mut session = ChargingSession::restore(&mut store, &cell, &MeterConfig::new(), &mut io);
        assert_eq!(session.state(), ChargingState::Charging);
        assert!(io.logged("Charging session restored from NVS"));

        // 開始処理は再実行しない
        run(&mut session, &mut io, 0, 5, HIGH);
        assert_eq!(io.fetch_calls, 0);
        assert_eq!(session.snapshot().start_energy_kwh, 90.0);
    }

    #[test]
    fn test_end_with_failed_upload_is_queued_then_flushed() {
        let cell = meter(100.0);
        let mut store = MemoryStore::default();
        let mut io = MockIo::new();
        let mut session = ChargingSession::restore(&mut store, &cell, &MeterConfig::new(), &mut io);

        run(&mut session, &mut io, 0, 11, HIGH);
        assert_eq!(session.state(), ChargingState::Charging);

        cell.publish(EnergySnapshot {
            power_w: 0.0,
            energy_kwh: 110.0,
            subtotal_kwh: 0.0,
        });
        io.upload_ok = false;
        run(&mut session, &mut io, 20_000, 11, LOW);
        assert_eq!(session.state(), ChargingState::Idle);
        assert_eq!(session.pending().len(), 1);
        assert!(io.logged("TeslaData upload pending (WiFi/API)"));
        assert!(!session.snapshot().active);

        io.upload_ok = true;
        run(&mut session, &mut io, 31_000, 1, LOW);
        assert!(session.pending().is_empty());
        assert!(io.logged("Pending TeslaData upload sent"));
        assert_eq!(io.uploads.len(), 1);
        assert!(io.uploads[0].contains(",110.00,,10.00,50.0,50.0,"));

        drop(session);
        let saved: ChargingRecord = store::load(&mut store).unwrap();
        assert!(!saved.snapshot.active);
        assert_eq!(saved.last_session_end().unwrap().energy_kwh, 110.0);
    }

    #[test]
    fn test_oversized_record_dropped_with_status() {
        let cell = meter(100.0);
        let mut store = MemoryStore::default();
        let mut io = MockIo::new();
        let mut session = ChargingSession::restore(&mut store, &cell, &MeterConfig::new(), &mut io);

        run(&mut session, &mut io, 0, 11, HIGH);
        assert_eq!(session.state(), ChargingState::Charging);

        // 1e200 は小数6桁でCSV1行に収まらない
        if let Ok(telemetry) = io.telemetry.as_mut() {
            telemetry.latitude = 1e200;
        }
        run(&mut session, &mut io, 20_000, 11, LOW);

        assert_eq!(session.state(), ChargingState::Idle);
        assert!(session.pending().is_empty());
        assert!(io.uploads.is_empty());
        assert!(io
            .logs
            .iter()
            .any(|(topic, m)| *topic == LogTopic::Status
                && m == "TeslaData record dropped (CSV too long)"));
    }

    #[test]
    fn test_failed_finalize_stays_charging() {
        let cell = meter(100.0);
        let mut store = MemoryStore::default();
        let mut io = MockIo::new();
        let mut session = ChargingSession::restore(&mut store, &cell, &MeterConfig::new(), &mut io);

        run(&mut session, &mut io, 0, 11, HIGH);
        io.telemetry = Err(IoError::Request);
        run(&mut session, &mut io, 20_000, 11, LOW);

        assert_eq!(session.state(), ChargingState::Charging);
        assert!(session.snapshot().active);
        assert!(io.logged("Charging end telemetry failed: request failed"));
    }

    #[test]
    fn test_sampling_interval_gates_detector() {
        let cell = meter(100.0);
        let mut store = MemoryStore::default();
        let mut io = MockIo::new();
        let mut session = ChargingSession::restore(&mut store, &cell, &MeterConfig::new(), &mut io);

        block_on(session.tick(0, HIGH, &mut io));
        assert_eq!(session.state(), ChargingState::StartCandidate);

        // 周期内のサンプルは無視される
        block_on(session.tick(500, LOW, &mut io));
        assert_eq!(session.state(), ChargingState::StartCandidate);
        assert!(!session.sample_due(800));
        assert!(session.sample_due(990));
        assert!(session.sample_due(1_000));
    }
}
