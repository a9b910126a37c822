//! 未送信レコードのキュー
//!
//! 送信できなかったセッションレコードを保持し、次の機会に古い順に再送する。
//! 満杯のときに新しいレコードが来たら最も古いものを捨てる（新しいセッションを優先）。

use heapless::Deque;

use super::record::CsvPayload;
use crate::config::charging::PENDING_UPLOAD_CAPACITY;

pub struct PendingUploads {
    queue: Deque<CsvPayload, PENDING_UPLOAD_CAPACITY>,
    dropped: u32,
}

impl PendingUploads {
    pub const fn new() -> Self {
        Self {
            queue: Deque::new(),
            dropped: 0,
        }
    }

    /// レコードを追加する。満杯なら最古のレコードを捨てて `true` を返す
    pub fn push(&mut self, payload: CsvPayload) -> bool {
        let mut evicted = false;
        if self.queue.is_full() {
            self.queue.pop_front();
            self.dropped = self.dropped.wrapping_add(1);
            warn!("Pending upload queue full, oldest record dropped");
            evicted = true;
        }
        // 直前に空きを作っているので失敗しない
        let _ = self.queue.push_back(payload);
        evicted
    }

    /// 次に送るレコード
    pub fn front(&self) -> Option<&CsvPayload> {
        self.queue.front()
    }

    /// 送信に成功したレコードを取り除く
    pub fn complete_front(&mut self) -> Option<CsvPayload> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// 捨てたレコードの累計
    pub fn dropped(&self) -> u32 {
        self.dropped
    }
}

impl Default for PendingUploads {
    fn default() -> Self {
        Self::new()
    }
}
