//! パルス集計タスク
//!
//! パルスチャネルを待ち（最大1秒）、カウンタ・電力・スナップショットを更新する。
//! 待ちがタイムアウトしてもリモート操作の適用と定期保存は毎ループ行う。

use embassy_time::{with_timeout, Duration, Instant};
use esp_storage::FlashStorage;
use ev_energy_meter::accounting::{AccountingSettings, PulseAccountant};
use ev_energy_meter::config::{MeterConfig, PULSE_WAIT_TIMEOUT_MS};
use ev_energy_meter::mqtt::{DeviceTopics, MqttPublisher};
use ev_energy_meter::store::FlashLogStore;

use crate::config::DROPPED_LOG_INTERVAL_MS;
use crate::hardware;
use crate::state::{CAPTURE, METER, OUTBOUND};

/// パルス集計タスク - パルスイベントからカウンタと電力を更新
#[embassy_executor::task]
pub async fn pulse_task(
    store: FlashLogStore<FlashStorage>,
    config: MeterConfig,
    topics: &'static DeviceTopics,
) {
    info!("Pulse accounting task started");

    let publisher = MqttPublisher::new(&OUTBOUND, topics);
    let mut accountant = PulseAccountant::start(
        &METER,
        store,
        publisher,
        AccountingSettings::from(&config),
        Instant::now().as_millis(),
    );

    // 集計の準備ができてから割り込みを接続する
    if hardware::arm_pulse_input() {
        info!("Pulse interrupt armed");
    } else {
        warn!("Pulse input not configured, counting remote updates only");
    }

    let channel = CAPTURE.channel();
    let wait = Duration::from_millis(PULSE_WAIT_TIMEOUT_MS);
    let mut last_dropped_check = Instant::now();

    loop {
        accountant.apply_requests();

        if let Ok(event) = with_timeout(wait, channel.receive()).await {
            accountant.record_pulse(event);
            let remaining = accountant.batch().saturating_sub(1);
            accountant.drain(channel, remaining);
        }

        accountant.maybe_persist(Instant::now().as_millis());

        if last_dropped_check.elapsed() >= Duration::from_millis(DROPPED_LOG_INTERVAL_MS) {
            last_dropped_check = Instant::now();
            let dropped = CAPTURE.take_dropped();
            if dropped > 0 {
                warn!("Pulse queue overflow: {} pulses dropped", dropped);
            }
        }
    }
}
