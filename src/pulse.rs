//! パルス入力のISR側インターフェース
//!
//! 電力量計のパルス出力エッジごとにタイムスタンプを捕捉し、
//! 有界チャネル経由でパルス集計タスクへ渡す。
//!
//! ## 動作
//! 1. GPIO割り込みでマイクロ秒タイムスタンプを取得
//! 2. `try_send` でチャネルに投入（ブロックしない、確保しない、I/Oしない）
//! 3. チャネルが満杯ならそのパルスは破棄し、破棄数だけを数える

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use portable_atomic::{AtomicU32, Ordering};

use crate::config::PULSE_QUEUE_DEPTH;

/// パルスイベント（ISRで捕捉したタイムスタンプ）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PulseEvent {
    /// 単調増加クロックのタイムスタンプ [μs]
    pub timestamp_us: u64,
}

/// ISR→集計タスク間のパルスチャネル
pub type PulseChannel = Channel<CriticalSectionRawMutex, PulseEvent, PULSE_QUEUE_DEPTH>;

/// パルス捕捉（ISRから呼ばれる）
pub struct PulseCapture<'a> {
    channel: &'a PulseChannel,
    dropped: AtomicU32,
}

impl<'a> PulseCapture<'a> {
    pub const fn new(channel: &'a PulseChannel) -> Self {
        Self {
            channel,
            dropped: AtomicU32::new(0),
        }
    }

    /// エッジ検出時の処理
    ///
    /// # Returns
    /// * `true` - キューに投入した
    /// * `false` - キュー満杯のため破棄した
    #[inline]
    pub fn on_edge(&self, timestamp_us: u64) -> bool {
        match self.channel.try_send(PulseEvent { timestamp_us }) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// 前回呼び出し以降に破棄したパルス数を取得してリセット
    pub fn take_dropped(&self) -> u32 {
        self.dropped.swap(0, Ordering::Relaxed)
    }

    /// 受信側のチャネル
    pub fn channel(&self) -> &'a PulseChannel {
        self.channel
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_are_fifo() {
        let channel = PulseChannel::new();
        let capture = PulseCapture::new(&channel);

        assert!(capture.on_edge(100));
        assert!(capture.on_edge(200));

        assert_eq!(channel.try_receive().unwrap().timestamp_us, 100);
        assert_eq!(channel.try_receive().unwrap().timestamp_us, 200);
        assert!(channel.try_receive().is_err());
    }

    #[test]
    fn test_full_queue_drops_newest() {
        let channel = PulseChannel::new();
        let capture = PulseCapture::new(&channel);

        for i in 0..PULSE_QUEUE_DEPTH as u64 {
            assert!(capture.on_edge(i));
        }
        assert!(!capture.on_edge(999));
        assert!(!capture.on_edge(1000));

        assert_eq!(capture.take_dropped(), 2);
        assert_eq!(capture.take_dropped(), 0);

        // 先に入ったイベントは残っている
        assert_eq!(channel.try_receive().unwrap().timestamp_us, 0);
        assert_eq!(channel.len(), PULSE_QUEUE_DEPTH - 1);
    }
}
