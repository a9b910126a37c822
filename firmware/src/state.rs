//! グローバル共有状態管理
//!
//! ISRとタスクの間で共有する静的インスタンス。中身の排他はライブラリ側の
//! クリティカルセクション（チャネル・スナップショットセル・メールボックス）で行う。

use ev_energy_meter::accounting::MeterShared;
use ev_energy_meter::mqtt::OutboundChannel;
use ev_energy_meter::pulse::{PulseCapture, PulseChannel};

/// GPIO割り込み → パルス集計タスクのパルスチャネル（容量10、満杯時は新しいパルスを破棄）
pub static PULSES: PulseChannel = PulseChannel::new();

/// パルス捕捉（GPIO割り込みハンドラから使用）
pub static CAPTURE: PulseCapture<'static> = PulseCapture::new(&PULSES);

/// 計測値スナップショットとリモート操作のメールボックス
pub static METER: MeterShared = MeterShared::new();

/// MQTT送信キュー（パルス集計・充電セッション → MQTTタスク）
pub static OUTBOUND: OutboundChannel = OutboundChannel::new();
