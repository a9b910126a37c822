//! NORフラッシュ上の追記型レコードログ
//!
//! 名前空間ごとに2つの消去セクタを割り当て、交互に使う。各セクタは固定長スロットに分割し、
//! 書き込みは使用中セクタの空きスロットへの追記で行う。使用中セクタが埋まったら
//! もう一方のセクタを消去してそこへ書き、以前のセクタは次の切り替えまで残す。
//! 最新レコードは常にどちらかのセクタに残るため、消去直後の電源断でも失われない。
//!
//! スロット形式: `[len: u16 LE][!len: u16 LE][seq: u32 LE][payload ...]`
//! シーケンス番号とペイロードを先に書き、長さヘッダを最後に書くため、書き込み途中の電源断では
//! ヘッダが未書き込みのまま残り、そのスロットは無効として読み飛ばされる。
//! 読み出し時は両セクタで最大のシーケンス番号を持つ有効スロットが最新レコードとなる。

use embedded_storage::nor_flash::NorFlash;

use super::{Namespace, Storage, StoreError};

/// スロットサイズ [byte]
pub const SLOT_SIZE: usize = 128;

/// 長さヘッダ（len, !len）のサイズ [byte]
const LEN_HEADER: usize = 4;

/// スロットヘッダサイズ（長さヘッダ＋シーケンス番号） [byte]
const SLOT_HEADER: usize = LEN_HEADER + 4;

/// スロットに格納できる最大ペイロード [byte]
pub const SLOT_PAYLOAD: usize = SLOT_SIZE - SLOT_HEADER;

/// 1名前空間あたりのセクタ数
pub const SECTORS_PER_NAMESPACE: usize = 2;

/// 名前空間ごとの領域先頭オフセット（連続する2セクタ）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashLayout {
    pub config: u32,
    pub counters: u32,
    pub charging: u32,
}

impl FlashLayout {
    fn base(&self, namespace: Namespace) -> u32 {
        match namespace {
            Namespace::Config => self.config,
            Namespace::Counters => self.counters,
            Namespace::Charging => self.charging,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Slot {
    Valid { len: usize, seq: u32 },
    Erased,
    Dirty,
}

/// 有効スロットの位置
#[derive(Clone, Copy)]
struct Latest {
    sector: usize,
    index: usize,
    len: usize,
    seq: u32,
}

/// 1セクタのスキャン結果
#[derive(Clone, Copy, Default)]
struct SectorScan {
    /// セクタ内で最大のシーケンス番号を持つ有効スロット
    latest: Option<Latest>,
    /// 最後に使われているスロット（有効・汚れを問わない）
    last_used: Option<usize>,
}

/// 追記型フラッシュストア
pub struct FlashLogStore<F> {
    flash: F,
    layout: FlashLayout,
}

impl<F: NorFlash> FlashLogStore<F> {
    /// フラッシュと配置からストアを作成（配置の整合性を検証）
    pub fn new(flash: F, layout: FlashLayout) -> Result<Self, StoreError> {
        let erase = F::ERASE_SIZE as u32;
        let span = F::ERASE_SIZE * SECTORS_PER_NAMESPACE;
        let bases = [layout.config, layout.counters, layout.charging];

        let aligned = bases
            .iter()
            .all(|base| base % erase == 0 && (*base as usize + span) <= flash.capacity());
        let disjoint = bases.iter().enumerate().all(|(i, a)| {
            bases[i + 1..]
                .iter()
                .all(|b| (*a as usize + span) <= *b as usize || (*b as usize + span) <= *a as usize)
        });

        if !aligned
            || !disjoint
            || F::ERASE_SIZE % SLOT_SIZE != 0
            || LEN_HEADER % F::WRITE_SIZE != 0
            || LEN_HEADER % F::READ_SIZE != 0
        {
            error!("Flash layout does not match sector geometry");
            return Err(StoreError::Misaligned);
        }

        Ok(Self { flash, layout })
    }

    /// 内部のフラッシュを返す
    pub fn release(self) -> F {
        self.flash
    }

    const fn slots_per_sector() -> usize {
        F::ERASE_SIZE / SLOT_SIZE
    }

    fn sector_base(&self, namespace: Namespace, sector: usize) -> u32 {
        self.layout.base(namespace) + (sector * F::ERASE_SIZE) as u32
    }

    fn slot_offset(&self, namespace: Namespace, sector: usize, index: usize) -> u32 {
        self.sector_base(namespace, sector) + (index * SLOT_SIZE) as u32
    }

    fn read_slot(&mut self, offset: u32, buf: &mut [u8; SLOT_SIZE]) -> Result<Slot, StoreError> {
        self.flash.read(offset, buf).map_err(|_| {
            error!("Flash read failed at 0x{:08X}", offset);
            StoreError::FlashReadError
        })?;

        let len = u16::from_le_bytes([buf[0], buf[1]]);
        let check = u16::from_le_bytes([buf[2], buf[3]]);
        let seq = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);

        if len == !check && (len as usize) <= SLOT_PAYLOAD {
            Ok(Slot::Valid {
                len: len as usize,
                seq,
            })
        } else if buf.iter().all(|b| *b == 0xFF) {
            Ok(Slot::Erased)
        } else {
            Ok(Slot::Dirty)
        }
    }

    fn scan_sector(&mut self, namespace: Namespace, sector: usize) -> Result<SectorScan, StoreError> {
        let mut buf = [0u8; SLOT_SIZE];
        let mut scan = SectorScan::default();

        for index in 0..Self::slots_per_sector() {
            let offset = self.slot_offset(namespace, sector, index);
            match self.read_slot(offset, &mut buf)? {
                Slot::Valid { len, seq } => {
                    if scan.latest.map_or(true, |l| seq >= l.seq) {
                        scan.latest = Some(Latest {
                            sector,
                            index,
                            len,
                            seq,
                        });
                    }
                    scan.last_used = Some(index);
                }
                Slot::Dirty => scan.last_used = Some(index),
                Slot::Erased => {}
            }
        }

        Ok(scan)
    }

    fn scan(&mut self, namespace: Namespace) -> Result<[SectorScan; SECTORS_PER_NAMESPACE], StoreError> {
        Ok([self.scan_sector(namespace, 0)?, self.scan_sector(namespace, 1)?])
    }

    fn newest(scans: &[SectorScan; SECTORS_PER_NAMESPACE]) -> Option<Latest> {
        scans
            .iter()
            .filter_map(|scan| scan.latest)
            .max_by_key(|latest| latest.seq)
    }

    fn erase_sector(&mut self, namespace: Namespace, sector: usize) -> Result<(), StoreError> {
        let base = self.sector_base(namespace, sector);
        debug!("Erasing flash sector 0x{:08X} ({})", base, namespace);
        self.flash
            .erase(base, base + F::ERASE_SIZE as u32)
            .map_err(|_| {
                error!("Flash erase failed at 0x{:08X}", base);
                StoreError::FlashEraseError
            })
    }
}

impl<F: NorFlash> Storage for FlashLogStore<F> {
    fn read(&mut self, namespace: Namespace, buf: &mut [u8]) -> Result<Option<usize>, StoreError> {
        let scans = self.scan(namespace)?;
        let Some(latest) = Self::newest(&scans) else {
            return Ok(None);
        };
        if latest.len > buf.len() {
            return Err(StoreError::TooLarge);
        }

        let mut slot = [0u8; SLOT_SIZE];
        let offset = self.slot_offset(namespace, latest.sector, latest.index);
        self.read_slot(offset, &mut slot)?;
        buf[..latest.len].copy_from_slice(&slot[SLOT_HEADER..SLOT_HEADER + latest.len]);
        Ok(Some(latest.len))
    }

    fn write(&mut self, namespace: Namespace, data: &[u8]) -> Result<(), StoreError> {
        if data.len() > SLOT_PAYLOAD {
            return Err(StoreError::TooLarge);
        }

        let scans = self.scan(namespace)?;
        let newest = Self::newest(&scans);
        let active = newest.map_or(0, |latest| latest.sector);
        let seq = newest.map_or(1, |latest| latest.seq.wrapping_add(1));

        let (sector, index) = match scans[active].last_used {
            None => (active, 0),
            Some(last) if last + 1 < Self::slots_per_sector() => (active, last + 1),
            Some(_) => {
                // 最新レコードを含むセクタには触れず、もう一方へ切り替える
                let other = (active + 1) % SECTORS_PER_NAMESPACE;
                if scans[other].last_used.is_some() {
                    self.erase_sector(namespace, other)?;
                }
                (other, 0)
            }
        };

        let mut slot = [0xFFu8; SLOT_SIZE];
        let len = data.len() as u16;
        slot[0..2].copy_from_slice(&len.to_le_bytes());
        slot[2..4].copy_from_slice(&(!len).to_le_bytes());
        slot[4..8].copy_from_slice(&seq.to_le_bytes());
        slot[SLOT_HEADER..SLOT_HEADER + data.len()].copy_from_slice(data);

        let offset = self.slot_offset(namespace, sector, index);
        self.flash
            .write(offset + LEN_HEADER as u32, &slot[LEN_HEADER..])
            .and_then(|_| self.flash.write(offset, &slot[..LEN_HEADER]))
            .map_err(|_| {
                error!("Flash write failed at 0x{:08X}", offset);
                StoreError::FlashWriteError
            })?;

        trace!(
            "Record written: {} sector={} slot={} seq={} len={}",
            namespace,
            sector,
            index,
            seq,
            data.len()
        );
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod mem_flash {
    //! NOR特性（書き込みはビットを0にするだけ）を再現したRAMフラッシュ

    use embedded_storage::nor_flash::{
        ErrorType, NorFlash, NorFlashErrorKind, ReadNorFlash,
    };

    pub const SECTOR: usize = 512;

    pub struct MemFlash {
        pub data: Vec<u8>,
        pub erase_count: usize,
        /// 次の消去の直後に電源が落ちる（以降の書き込みはすべて失敗）
        pub cut_power_after_erase: bool,
        powered: bool,
    }

    impl MemFlash {
        pub fn new(sectors: usize) -> Self {
            Self {
                data: vec![0xFF; sectors * SECTOR],
                erase_count: 0,
                cut_power_after_erase: false,
                powered: true,
            }
        }

        /// 再起動（電源を戻す）
        pub fn power_cycle(&mut self) {
            self.cut_power_after_erase = false;
            self.powered = true;
        }
    }

    impl ErrorType for MemFlash {
        type Error = NorFlashErrorKind;
    }

    impl ReadNorFlash for MemFlash {
        const READ_SIZE: usize = 1;

        fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
            let start = offset as usize;
            let end = start + bytes.len();
            if end > self.data.len() {
                return Err(NorFlashErrorKind::OutOfBounds);
            }
            bytes.copy_from_slice(&self.data[start..end]);
            Ok(())
        }

        fn capacity(&self) -> usize {
            self.data.len()
        }
    }

    impl NorFlash for MemFlash {
        const WRITE_SIZE: usize = 4;
        const ERASE_SIZE: usize = SECTOR;

        fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
            if !self.powered {
                return Err(NorFlashErrorKind::Other);
            }
            if from as usize % SECTOR != 0 || to as usize % SECTOR != 0 {
                return Err(NorFlashErrorKind::NotAligned);
            }
            self.data[from as usize..to as usize].fill(0xFF);
            self.erase_count += 1;
            if self.cut_power_after_erase {
                self.powered = false;
            }
            Ok(())
        }

        fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
            if !self.powered {
                return Err(NorFlashErrorKind::Other);
            }
            if offset as usize % Self::WRITE_SIZE != 0 || bytes.len() % Self::WRITE_SIZE != 0 {
                return Err(NorFlashErrorKind::NotAligned);
            }
            for (cell, byte) in self.data[offset as usize..].iter_mut().zip(bytes) {
                *cell &= *byte;
            }
            Ok(())
        }
    }
}
