//! パルス集計
//!
//! パルスチャネルからイベントを取り出し、カウンタ・電力・スナップショットを更新する。
//! カウンタを変更するのはこのモジュールの `PulseAccountant` だけで、
//! 外部からの変更要求（累積値の上書き・小計リセット）はメールボックス経由で受け取る。
//!
//! ## 1ループの処理順
//! 1. 累積値上書きリクエストの適用（変化があれば即保存）
//! 2. 小計リセットリクエストの適用（変化があれば即保存）
//! 3. パルスイベントの処理（上限 `batch` 件）
//! 4. 保存周期ごとに、前回保存から変化していれば保存

use core::fmt::Write;

use portable_atomic::{AtomicBool, Ordering};
use serde::{Deserialize, Serialize};

use crate::config::MeterConfig;
use crate::energy::{power_from_interval, EnergyCounters, EnergySnapshot, SnapshotCell};
use crate::mailbox::Mailbox;
use crate::pulse::{PulseChannel, PulseEvent};
use crate::store::{self, Namespace, Record, Storage, StoreError};

/// 計測値の公開先（MQTTなど）。送信はベストエフォート。
pub trait EnergyPublisher {
    /// スナップショットを公開
    fn publish_energy(&mut self, snapshot: &EnergySnapshot);

    /// ステータスメッセージを公開
    fn publish_status(&mut self, message: &str);

    /// 一般ログメッセージを公開
    fn publish_event(&mut self, message: &str);
}

impl<P: EnergyPublisher + ?Sized> EnergyPublisher for &mut P {
    fn publish_energy(&mut self, snapshot: &EnergySnapshot) {
        (**self).publish_energy(snapshot)
    }

    fn publish_status(&mut self, message: &str) {
        (**self).publish_status(message)
    }

    fn publish_event(&mut self, message: &str) {
        (**self).publish_event(message)
    }
}

/// タスク間で共有する計測状態
pub struct MeterShared {
    /// 最新の電力量スナップショット
    pub snapshot: SnapshotCell,
    counter_override: Mailbox<u32>,
    subtotal_reset: Mailbox<()>,
    ready: AtomicBool,
}

impl MeterShared {
    pub const fn new() -> Self {
        Self {
            snapshot: SnapshotCell::new(),
            counter_override: Mailbox::new(),
            subtotal_reset: Mailbox::new(),
            ready: AtomicBool::new(false),
        }
    }

    /// 累積パルス数の上書きを要求
    pub fn request_counter_override(&self, pulse_count: u32) {
        info!("Pulse counter override requested: {}", pulse_count);
        self.counter_override.post(pulse_count);
    }

    /// 小計リセットを要求
    pub fn request_subtotal_reset(&self) {
        info!("Subtotal reset requested");
        self.subtotal_reset.post(());
    }

    /// 集計タスクの初期化が完了したか（割り込み接続の前提条件）
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

impl Default for MeterShared {
    fn default() -> Self {
        Self::new()
    }
}

/// 集計タスクの動作パラメータ
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccountingSettings {
    pub pulses_per_kwh: u32,
    pub correction_us: i32,
    pub save_interval_ms: u64,
    pub batch: usize,
}

impl From<&MeterConfig> for AccountingSettings {
    fn from(config: &MeterConfig) -> Self {
        Self {
            pulses_per_kwh: config.pulses_per_kwh,
            correction_us: config.pulse_time_correction_us,
            save_interval_ms: config.save_interval_s as u64 * 1000,
            batch: config.pulse_batch.max(1) as usize,
        }
    }
}

/// カウンタの永続化レコード（"CNT1"）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterRecord {
    pub pulse_count: u32,
    /// 論理的には16bit
    pub subtotal_count: u32,
}

impl Record for CounterRecord {
    const NAMESPACE: Namespace = Namespace::Counters;
    const MAGIC: u32 = 0x3154_4E43;
    const VERSION: u16 = 1;
}

impl From<EnergyCounters> for CounterRecord {
    fn from(counters: EnergyCounters) -> Self {
        Self {
            pulse_count: counters.pulse_count,
            subtotal_count: counters.subtotal_count as u32,
        }
    }
}

impl From<CounterRecord> for EnergyCounters {
    fn from(record: CounterRecord) -> Self {
        Self {
            pulse_count: record.pulse_count,
            subtotal_count: record.subtotal_count as u16,
        }
    }
}

/// パルス集計器
pub struct PulseAccountant<'a, S, P> {
    shared: &'a MeterShared,
    store: S,
    publisher: P,
    settings: AccountingSettings,
    counters: EnergyCounters,
    /// 最後に保存したカウンタ
    persisted: EnergyCounters,
    last_pulse_us: Option<u64>,
    last_save_ms: u64,
    power_w: f32,
}

impl<'a, S: Storage, P: EnergyPublisher> PulseAccountant<'a, S, P> {
    /// カウンタを読み込み、初期スナップショットを公開して準備完了にする
    pub fn start(
        shared: &'a MeterShared,
        mut store: S,
        publisher: P,
        settings: AccountingSettings,
        now_ms: u64,
    ) -> Self {
        let counters = match store::load::<CounterRecord, _>(&mut store) {
            Ok(record) => {
                let counters = EnergyCounters::from(record);
                info!(
                    "Counters restored: total={} subtotal={}",
                    counters.pulse_count, counters.subtotal_count
                );
                counters
            }
            Err(StoreError::NotFound) => {
                info!("No stored counters, starting from zero");
                EnergyCounters::new()
            }
            Err(e) => {
                warn!("Stored counters unreadable ({}), starting from zero", e);
                EnergyCounters::new()
            }
        };

        let mut accountant = Self {
            shared,
            store,
            publisher,
            settings,
            counters,
            persisted: counters,
            last_pulse_us: None,
            last_save_ms: now_ms,
            power_w: 0.0,
        };

        accountant.publish();
        shared.ready.store(true, Ordering::Release);
        info!("Pulse accounting ready");

        accountant
    }

    /// 現在のカウンタ
    pub fn counters(&self) -> EnergyCounters {
        self.counters
    }

    /// 現在のスナップショット
    pub fn snapshot(&self) -> EnergySnapshot {
        EnergySnapshot::from_counters(self.power_w, &self.counters, self.settings.pulses_per_kwh)
    }

    /// 1ループあたりのパルス処理上限
    pub fn batch(&self) -> usize {
        self.settings.batch
    }

    /// 保留中のリクエストを適用
    pub fn apply_requests(&mut self) {
        if let Some(pulse_count) = self.shared.counter_override.take() {
            self.apply_counter_override(pulse_count);
        }
        if self.shared.subtotal_reset.take().is_some() {
            self.apply_subtotal_reset();
        }
    }

    fn apply_counter_override(&mut self, pulse_count: u32) {
        let changed = self.counters.pulse_count != pulse_count;
        self.counters.pulse_count = pulse_count;

        if changed {
            self.persist();
        }
        self.publish_adjusted();

        let mut message: heapless::String<64> = heapless::String::new();
        let _ = write!(message, "Pulse counter set: total={}", pulse_count);
        self.publisher.publish_status(&message);
    }

    fn apply_subtotal_reset(&mut self) {
        let mut message: heapless::String<96> = heapless::String::new();
        let _ = write!(
            message,
            "Subtotal reset handling: total={} subtotal={}",
            self.counters.pulse_count, self.counters.subtotal_count
        );
        self.publisher.publish_status(&message);

        let changed = self.counters.subtotal_count != 0;
        self.counters.subtotal_count = 0;

        if changed {
            self.persist();
        }
        self.publish_adjusted();

        info!("Subtotal reset applied");
        self.publisher.publish_event("Subtotal reset applied");
    }

    /// パルス1件を処理
    pub fn record_pulse(&mut self, event: PulseEvent) {
        self.counters.add_pulse();

        if let Some(last) = self.last_pulse_us {
            let delta_us = event.timestamp_us.wrapping_sub(last);
            if let Some(power_w) = power_from_interval(
                delta_us,
                self.settings.correction_us,
                self.settings.pulses_per_kwh,
            ) {
                self.power_w = power_w;
            }
        }
        self.last_pulse_us = Some(event.timestamp_us);

        self.publish();
    }

    /// チャネルに溜まっているパルスを待たずに処理（最大 `limit` 件）
    pub fn drain(&mut self, channel: &PulseChannel, limit: usize) -> usize {
        let mut handled = 0;
        while handled < limit {
            match channel.try_receive() {
                Ok(event) => {
                    self.record_pulse(event);
                    handled += 1;
                }
                Err(_) => break,
            }
        }
        handled
    }

    /// 保存周期に達していて、かつ変化があれば保存
    ///
    /// # Returns
    /// 保存を実行したか
    pub fn maybe_persist(&mut self, now_ms: u64) -> bool {
        if now_ms.saturating_sub(self.last_save_ms) < self.settings.save_interval_ms {
            return false;
        }
        self.last_save_ms = now_ms;

        if self.counters == self.persisted {
            return false;
        }
        self.persist()
    }

    fn persist(&mut self) -> bool {
        match store::save(&mut self.store, &CounterRecord::from(self.counters)) {
            Ok(()) => {
                debug!(
                    "Counters saved: total={} subtotal={}",
                    self.counters.pulse_count, self.counters.subtotal_count
                );
                self.persisted = self.counters;
                true
            }
            Err(e) => {
                error!("Failed to save counters: {}", e);
                false
            }
        }
    }

    fn publish(&mut self) {
        let snapshot = self.snapshot();
        self.shared.snapshot.publish(snapshot);
        self.publisher.publish_energy(&snapshot);
    }

    /// カウンタ変更後の公開。共有スナップショットは電力を保持し、外部へは0Wで送る
    fn publish_adjusted(&mut self) {
        let snapshot = self.snapshot();
        self.shared.snapshot.publish(snapshot);
        self.publisher.publish_energy(&EnergySnapshot {
            power_w: 0.0,
            ..snapshot
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::mock::MemoryStore;

    #[derive(Default)]
    struct RecordingPublisher {
        energy: Vec<EnergySnapshot>,
        status: Vec<String>,
        events: Vec<String>,
    }

    impl EnergyPublisher for RecordingPublisher {
        fn publish_energy(&mut self, snapshot: &EnergySnapshot) {
            self.energy.push(*snapshot);
        }

        fn publish_status(&mut self, message: &str) {
            self.status.push(message.to_string());
        }

        fn publish_event(&mut self, message: &str) {
            self.events.push(message.to_string());
        }
    }

    fn settings() -> AccountingSettings {
        AccountingSettings::from(&MeterConfig::new())
    }

    fn stored(total: u32, subtotal: u16) -> MemoryStore {
        let mut store = MemoryStore::default();
        let counters = EnergyCounters {
            pulse_count: total,
            subtotal_count: subtotal,
        };
        store::save(&mut store, &CounterRecord::from(counters)).unwrap();
        store.writes = 0;
        store
    }

    #[test]
    fn test_start_publishes_initial_snapshot_and_sets_ready() {
        let shared = MeterShared::new();
        let mut store = stored(250, 50);
        let mut publisher = RecordingPublisher::default();

        assert!(!shared.is_ready());
        let accountant = PulseAccountant::start(&shared, &mut store, &mut publisher, settings(), 0);

        assert!(shared.is_ready());
        assert_eq!(accountant.counters().pulse_count, 250);
        let snapshot = shared.snapshot.latest().unwrap();
        assert!((snapshot.energy_kwh - 2.5).abs() < 1e-6);
        assert!((snapshot.subtotal_kwh - 0.5).abs() < 1e-6);
        drop(accountant);
        assert_eq!(publisher.energy.len(), 1);
    }

    #[test]
    fn test_first_boot_starts_from_zero() {
        let shared = MeterShared::new();
        let mut store = MemoryStore::default();
        let accountant =
            PulseAccountant::start(&shared, &mut store, RecordingPublisher::default(), settings(), 0);
        assert_eq!(accountant.counters(), EnergyCounters::new());
    }

    #[test]
    fn test_pulses_increment_both_counters() {
        let shared = MeterShared::new();
        let mut store = stored(10, 3);
        let mut accountant =
            PulseAccountant::start(&shared, &mut store, RecordingPublisher::default(), settings(), 0);

        for i in 0..25u64 {
            accountant.record_pulse(PulseEvent {
                timestamp_us: i * 1_000_000,
            });
        }

        assert_eq!(accountant.counters().pulse_count, 35);
        assert_eq!(accountant.counters().subtotal_count, 28);
    }

    #[test]
    fn test_hundred_pulses_one_second_apart() {
        let shared = MeterShared::new();
        let mut store = MemoryStore::default();
        let mut accountant =
            PulseAccountant::start(&shared, &mut store, RecordingPublisher::default(), settings(), 0);

        for i in 0..100u64 {
            accountant.record_pulse(PulseEvent {
                timestamp_us: 5_000_000 + i * 1_000_000,
            });
        }

        let snapshot = shared.snapshot.latest().unwrap();
        assert!((snapshot.energy_kwh - 1.0).abs() < 1e-6);
        assert_eq!(snapshot.power_w, 36.0);
    }

    #[test]
    fn test_first_pulse_reports_no_power() {
        let shared = MeterShared::new();
        let mut store = MemoryStore::default();
        let mut accountant =
            PulseAccountant::start(&shared, &mut store, RecordingPublisher::default(), settings(), 0);

        accountant.record_pulse(PulseEvent {
            timestamp_us: 1_000_000,
        });
        assert_eq!(accountant.snapshot().power_w, 0.0);

        accountant.record_pulse(PulseEvent {
            timestamp_us: 2_000_000,
        });
        assert_eq!(accountant.snapshot().power_w, 36.0);
    }

    #[test]
    fn test_drain_respects_limit() {
        let shared = MeterShared::new();
        let channel = PulseChannel::new();
        let mut store = MemoryStore::default();
        let mut accountant =
            PulseAccountant::start(&shared, &mut store, RecordingPublisher::default(), settings(), 0);

        for i in 0..5u64 {
            channel.try_send(PulseEvent { timestamp_us: i }).unwrap();
        }

        assert_eq!(accountant.drain(&channel, 3), 3);
        assert_eq!(accountant.counters().pulse_count, 3);
        assert_eq!(accountant.drain(&channel, 10), 2);
        assert_eq!(accountant.drain(&channel, 10), 0);
    }

    #[test]
    fn test_periodic_persist_only_when_changed() {
        let shared = MeterShared::new();
        let mut store = MemoryStore::default();
        {
            let mut accountant = PulseAccountant::start(
                &shared,
                &mut store,
                RecordingPublisher::default(),
                settings(),
                0,
            );

            // 保存周期前は保存しない
            accountant.record_pulse(PulseEvent { timestamp_us: 1 });
            assert!(!accountant.maybe_persist(59_999));

            assert!(accountant.maybe_persist(60_000));

            // 変化がなければ再保存しない
            assert!(!accountant.maybe_persist(120_000));
        }
        assert_eq!(store.writes, 1);
    }

    #[test]
    fn test_restart_restores_persisted_counters() {
        let mut store = MemoryStore::default();
        {
            let shared = MeterShared::new();
            let mut accountant = PulseAccountant::start(
                &shared,
                &mut store,
                RecordingPublisher::default(),
                settings(),
                0,
            );
            for i in 0..7u64 {
                accountant.record_pulse(PulseEvent { timestamp_us: i });
            }
            assert!(accountant.maybe_persist(60_000));
        }

        let shared = MeterShared::new();
        let accountant =
            PulseAccountant::start(&shared, &mut store, RecordingPublisher::default(), settings(), 0);
        assert_eq!(
            accountant.counters(),
            EnergyCounters {
                pulse_count: 7,
                subtotal_count: 7,
            }
        );
    }

    #[test]
    fn test_subtotal_reset() {
        let shared = MeterShared::new();
        let mut store = stored(500, 120);
        let mut publisher = RecordingPublisher::default();
        {
            let mut accountant =
                PulseAccountant::start(&shared, &mut store, &mut publisher, settings(), 0);

            shared.request_subtotal_reset();
            accountant.apply_requests();

            assert_eq!(accountant.counters().pulse_count, 500);
            assert_eq!(accountant.counters().subtotal_count, 0);

            // 既に0なら保存しない
            shared.request_subtotal_reset();
            accountant.apply_requests();
        }
        assert_eq!(store.writes, 1);
        assert_eq!(
            publisher.status,
            ["Subtotal reset handling: total=500 subtotal=120"]
        );
        assert_eq!(publisher.events, ["Subtotal reset applied"]);

        let record: CounterRecord = store::load(&mut store).unwrap();
        assert_eq!(record.pulse_count, 500);
        assert_eq!(record.subtotal_count, 0);
    }

    #[test]
    fn test_counter_override() {
        let shared = MeterShared::new();
        let mut store = stored(500, 120);
        let mut publisher = RecordingPublisher::default();
        {
            let mut accountant =
                PulseAccountant::start(&shared, &mut store, &mut publisher, settings(), 0);
            accountant.record_pulse(PulseEvent { timestamp_us: 0 });
            accountant.record_pulse(PulseEvent {
                timestamp_us: 1_000_000,
            });
            assert_eq!(accountant.snapshot().power_w, 36.0);

            shared.request_counter_override(1_234_567);
            accountant.apply_requests();

            assert_eq!(accountant.counters().pulse_count, 1_234_567);
            assert_eq!(accountant.counters().subtotal_count, 122);
            assert_eq!(accountant.snapshot().power_w, 36.0);
        }
        assert_eq!(store.writes, 1);
        let last = publisher.energy.last().unwrap();
        assert!((last.energy_kwh - 12_345.67).abs() < 0.01);
        assert_eq!(last.power_w, 0.0);
        assert_eq!(shared.snapshot.latest().unwrap().power_w, 36.0);
    }

    #[test]
    fn test_subtotal_reset_keeps_measured_power() {
        let shared = MeterShared::new();
        let mut store = stored(500, 120);
        let mut publisher = RecordingPublisher::default();
        {
            let mut accountant =
                PulseAccountant::start(&shared, &mut store, &mut publisher, settings(), 0);
            accountant.record_pulse(PulseEvent { timestamp_us: 0 });
            accountant.record_pulse(PulseEvent {
                timestamp_us: 2_000_000,
            });

            shared.request_subtotal_reset();
            accountant.apply_requests();

            // 外部へは0Wで送るが、計測中の電力は保持する
            assert_eq!(accountant.snapshot().power_w, 18.0);
        }
        let last = publisher.energy.last().unwrap();
        assert_eq!(last.power_w, 0.0);
        assert_eq!(last.subtotal_kwh, 0.0);
        let latest = shared.snapshot.latest().unwrap();
        assert_eq!(latest.power_w, 18.0);
        assert_eq!(latest.subtotal_kwh, 0.0);
    }

    #[test]
    fn test_requests_not_applied_until_loop_runs() {
        let shared = MeterShared::new();
        let mut store = stored(10, 10);
        let mut accountant =
            PulseAccountant::start(&shared, &mut store, RecordingPublisher::default(), settings(), 0);

        shared.request_subtotal_reset();
        assert_eq!(accountant.counters().subtotal_count, 10);

        accountant.apply_requests();
        assert_eq!(accountant.counters().subtotal_count, 0);
    }

    #[test]
    fn test_save_failure_retried_next_interval() {
        let shared = MeterShared::new();
        let mut store = MemoryStore::default();
        store.fail_writes = true;
        {
            let mut accountant = PulseAccountant::start(
                &shared,
                &mut store,
                RecordingPublisher::default(),
                settings(),
                0,
            );
            accountant.record_pulse(PulseEvent { timestamp_us: 0 });
            assert!(!accountant.maybe_persist(60_000));
        }
        assert_eq!(store.writes, 0);
    }
}
