//! 永続化ストア
//!
//! 名前空間ごとに最新レコードを1つ保持する不揮発ストア。
//! レコードは postcard でシリアライズし、マジックナンバー・バージョン・CRC32 で検証する。

pub mod flash_log;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub use flash_log::{FlashLayout, FlashLogStore};

/// 1レコードの最大バイト数（エンベロープ・CRC込み）
pub const RECORD_MAX_LEN: usize = 120;

const CRC: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISCSI);

/// 保存領域の名前空間
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Namespace {
    /// 校正値・しきい値などの設定
    Config,
    /// パルスカウンタ（パルス集計タスク専用）
    Counters,
    /// 充電セッション（充電セッションタスク専用）
    Charging,
}

/// ストア操作のエラー型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StoreError {
    /// フラッシュ読み取りエラー
    FlashReadError,

    /// フラッシュ書き込みエラー
    FlashWriteError,

    /// フラッシュ消去エラー
    FlashEraseError,

    /// フラッシュ配置がセクタ境界・書き込み単位に合っていない
    Misaligned,

    /// レコード未保存
    NotFound,

    /// レコードが大きすぎる
    TooLarge,

    /// CRC検証エラー
    CrcMismatch,

    /// マジックナンバー不一致
    InvalidMagic,

    /// バージョン不一致
    VersionMismatch,

    /// デシリアライズ失敗
    Corrupt,
}

/// 名前空間単位の不揮発ストア
///
/// 書き込みは1回の呼び出しで完結する。ハンドルは各タスクが個別に所有する。
pub trait Storage {
    /// 最新レコードを `buf` に読み込み、そのバイト数を返す。未保存なら `Ok(None)`。
    fn read(&mut self, namespace: Namespace, buf: &mut [u8]) -> Result<Option<usize>, StoreError>;

    /// レコードを書き込む（以前のレコードを置き換える）
    fn write(&mut self, namespace: Namespace, data: &[u8]) -> Result<(), StoreError>;
}

impl<S: Storage + ?Sized> Storage for &mut S {
    fn read(&mut self, namespace: Namespace, buf: &mut [u8]) -> Result<Option<usize>, StoreError> {
        (**self).read(namespace, buf)
    }

    fn write(&mut self, namespace: Namespace, data: &[u8]) -> Result<(), StoreError> {
        (**self).write(namespace, data)
    }
}

/// 永続化されるレコード型
pub trait Record: Serialize + DeserializeOwned {
    /// 保存先の名前空間
    const NAMESPACE: Namespace;
    /// データ識別用マジックナンバー
    const MAGIC: u32;
    /// レイアウトのバージョン番号
    const VERSION: u16;
}

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    magic: u32,
    version: u16,
    body: T,
}

/// レコードを読み込み、ヘッダとCRCを検証する
pub fn load<R: Record, S: Storage + ?Sized>(store: &mut S) -> Result<R, StoreError> {
    let mut buf = [0u8; RECORD_MAX_LEN];
    let len = store
        .read(R::NAMESPACE, &mut buf)?
        .ok_or(StoreError::NotFound)?;

    let envelope: Envelope<R> =
        postcard::from_bytes_crc32(&buf[..len], CRC.digest()).map_err(|e| match e {
            postcard::Error::DeserializeBadCrc => StoreError::CrcMismatch,
            _ => StoreError::Corrupt,
        })?;

    if envelope.magic != R::MAGIC {
        error!(
            "Record header validation failed: namespace={}, magic=0x{:08X}",
            R::NAMESPACE,
            envelope.magic
        );
        return Err(StoreError::InvalidMagic);
    }
    if envelope.version != R::VERSION {
        error!(
            "Record version mismatch: namespace={}, version={}",
            R::NAMESPACE,
            envelope.version
        );
        return Err(StoreError::VersionMismatch);
    }

    Ok(envelope.body)
}

/// レコードをシリアライズして書き込む
pub fn save<R: Record, S: Storage + ?Sized>(store: &mut S, record: &R) -> Result<(), StoreError> {
    let mut buf = [0u8; RECORD_MAX_LEN];
    let envelope = Envelope {
        magic: R::MAGIC,
        version: R::VERSION,
        body: record,
    };
    let bytes = postcard::to_slice_crc32(&envelope, &mut buf, CRC.digest())
        .map_err(|_| StoreError::TooLarge)?;

    store.write(R::NAMESPACE, bytes)
}


#[cfg(test)]
mod tests {
    use super::mock::MemoryStore;
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        a: u32,
        b: f32,
    }

    impl Record for Sample {
        const NAMESPACE: Namespace = Namespace::Counters;
        const MAGIC: u32 = 0x5450_4D53;
        const VERSION: u16 = 1;
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct SampleV2 {
        a: u32,
        b: f32,
    }

    impl Record for SampleV2 {
        const NAMESPACE: Namespace = Namespace::Counters;
        const MAGIC: u32 = 0x5450_4D53;
        const VERSION: u16 = 2;
    }

    #[test]
    fn test_save_then_load() {
        let mut store = MemoryStore::default();
        save(&mut store, &Sample { a: 42, b: 1.5 }).unwrap();
        let loaded: Sample = load(&mut store).unwrap();
        assert_eq!(loaded, Sample { a: 42, b: 1.5 });
    }

    #[test]
    fn test_load_missing_record() {
        let mut store = MemoryStore::default();
        assert_eq!(load::<Sample, _>(&mut store), Err(StoreError::NotFound));
    }

    #[test]
    fn test_crc_mismatch_detected() {
        let mut store = MemoryStore::default();
        save(&mut store, &Sample { a: 7, b: 0.0 }).unwrap();
        let data = store.counters.as_mut().unwrap();
        data[6] ^= 0x01;
        assert!(matches!(
            load::<Sample, _>(&mut store),
            Err(StoreError::CrcMismatch) | Err(StoreError::Corrupt)
        ));
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let mut store = MemoryStore::default();
        save(&mut store, &SampleV2 { a: 1, b: 2.0 }).unwrap();
        assert_eq!(
            load::<Sample, _>(&mut store),
            Err(StoreError::VersionMismatch)
        );
    }
}
