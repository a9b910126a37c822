//! タスク間リクエスト用の単一スロットメールボックス
//!
//! 書き込み側（ネットワークタスク）が `post` し、所有タスクが `take` で取り出して適用する。
//! 取り出しとクリアは同じクリティカルセクション内で行う。未処理の値は新しい値で上書きされる。

use core::cell::Cell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;

pub struct Mailbox<T: Copy> {
    slot: Mutex<CriticalSectionRawMutex, Cell<Option<T>>>,
}

impl<T: Copy> Mailbox<T> {
    pub const fn new() -> Self {
        Self {
            slot: Mutex::new(Cell::new(None)),
        }
    }

    /// リクエストを置く
    pub fn post(&self, value: T) {
        self.slot.lock(|slot| slot.set(Some(value)));
    }

    /// リクエストを取り出してスロットを空にする
    pub fn take(&self) -> Option<T> {
        self.slot.lock(|slot| slot.take())
    }

    /// 未処理のリクエストがあるか
    pub fn is_pending(&self) -> bool {
        self.slot.lock(|slot| slot.get().is_some())
    }
}

impl<T: Copy> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}
