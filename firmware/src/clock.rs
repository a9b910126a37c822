//! 壁時計
//!
//! SNTPで得たUNIX時刻と起動からの経過時間の差を保持する。未同期の間は `None`。

use embassy_time::Instant;
use portable_atomic::{AtomicU64, Ordering};

/// 起動時点のUNIX時刻 [s]（0 = 未同期）
static BOOT_EPOCH_S: AtomicU64 = AtomicU64::new(0);

/// 同期結果を反映
pub fn set_epoch(epoch_s: u64) {
    let boot = epoch_s.saturating_sub(Instant::now().as_secs()).max(1);
    BOOT_EPOCH_S.store(boot, Ordering::Release);
}

/// 現在のUNIX時刻 [s]
pub fn epoch_now() -> Option<u64> {
    match BOOT_EPOCH_S.load(Ordering::Acquire) {
        0 => None,
        boot => Some(boot + Instant::now().as_secs()),
    }
}
