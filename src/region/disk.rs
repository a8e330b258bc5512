//! Append-only overflow store behind spill and recall.
//!
//! Layout:
//!
//! ```text
//! file    : [magic u32 BE][version u16 BE] then records
//! record  : [key 16 bytes][payload_len u32 BE][crc64 u64 BE][payload]
//! ```
//!
//! Every record carries a CRC-64/ECMA checksum of its payload; a recall
//! that fails the length or checksum check surfaces `DiskAccess`, which
//! readers recover from by treating the entry as absent.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::Crc;

use crate::column::key::{ColumnKey, ENCODED_KEY_SIZE};
use crate::error::{Error, Result};
use crate::format::ValueKind;

const OVERFLOW_MAGIC: u32 = 0x4F56_4601; // "OVF" + format 1
const OVERFLOW_VERSION: u16 = 1;
const FILE_HEADER_SIZE: u64 = 6;
const RECORD_HEADER_SIZE: usize = ENCODED_KEY_SIZE + 4 + 8;

pub const CRC_64_ECMA: crc::Algorithm<u64> = crc::CRC_64_ECMA_182;

/// Handle to one spilled payload. Also carries the per-id monitor that
/// recall holds between the disk-region read lock and the instance lock.
pub struct DiskId {
    oplog_id: u64,
    offset: u64,
    len: u32,
    kind: ValueKind,
    monitor: Mutex<()>,
    destroyed: AtomicBool,
}

impl DiskId {
    pub fn oplog_id(&self) -> u64 {
        self.oplog_id
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    /// The per-id monitor. Held across the recheck-read-install sequence
    /// of a recall so concurrent recalls of one entry serialize.
    pub(crate) fn lock(&self) -> MutexGuard<'_, ()> {
        self.monitor.lock().unwrap()
    }

    /// Marks the spilled copy unusable; later recalls see the entry as
    /// destroyed.
    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for DiskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskId")
            .field("oplog_id", &self.oplog_id)
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("kind", &self.kind)
            .finish()
    }
}

struct Inner {
    file: File,
    offset: u64,
}

/// One region's overflow file.
pub struct DiskStore {
    path: PathBuf,
    oplog_id: u64,
    inner: Mutex<Inner>,
    crc64: Crc<u64>,
    closed: AtomicBool,
}

impl DiskStore {
    /// Creates the overflow file for `region` under `dir`, truncating any
    /// leftover from a previous incarnation.
    pub fn create(dir: &Path, region: &str) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let oplog_id = 1;
        let path = dir.join(format!("{region}-{oplog_id:08}.ovf"));
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.write_u32::<BigEndian>(OVERFLOW_MAGIC)?;
        file.write_u16::<BigEndian>(OVERFLOW_VERSION)?;
        file.flush()?;
        Ok(Self {
            path,
            oplog_id,
            inner: Mutex::new(Inner {
                file,
                offset: FILE_HEADER_SIZE,
            }),
            crc64: Crc::<u64>::new(&CRC_64_ECMA),
            closed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one spilled payload and returns its handle.
    pub fn append(&self, key: &ColumnKey, kind: ValueKind, payload: &[u8]) -> Result<Arc<DiskId>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::RegionDestroyed);
        }
        let mut inner = self.inner.lock()?;
        let offset = inner.offset;

        let mut record = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len());
        key.encode(&mut record)?;
        record.write_u32::<BigEndian>(payload.len() as u32)?;
        record.write_u64::<BigEndian>(self.crc64.checksum(payload))?;
        record.extend_from_slice(payload);

        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.write_all(&record)?;
        inner.file.flush()?;
        inner.offset = offset + record.len() as u64;

        tracing::debug!(
            oplog_id = self.oplog_id,
            offset,
            len = payload.len(),
            "spilled column payload"
        );
        Ok(Arc::new(DiskId {
            oplog_id: self.oplog_id,
            offset,
            len: payload.len() as u32,
            kind,
            monitor: Mutex::new(()),
            destroyed: AtomicBool::new(false),
        }))
    }

    /// Reads back one spilled payload, verifying record length and
    /// checksum. Errors here are the absent-entry kind, never fatal to
    /// readers.
    pub fn read(&self, id: &DiskId) -> Result<Vec<u8>> {
        if id.is_destroyed() {
            return Err(Error::EntryDestroyed);
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::RegionDestroyed);
        }
        let mut inner = self.inner.lock()?;
        inner
            .file
            .seek(SeekFrom::Start(id.offset))
            .map_err(|e| Error::DiskAccess(format!("seek to record: {e}")))?;

        let mut key_bytes = [0u8; ENCODED_KEY_SIZE];
        inner
            .file
            .read_exact(&mut key_bytes)
            .map_err(|e| Error::DiskAccess(format!("read record key: {e}")))?;
        let stored_len = inner
            .file
            .read_u32::<BigEndian>()
            .map_err(|e| Error::DiskAccess(format!("read record length: {e}")))?;
        if stored_len != id.len {
            return Err(Error::DiskAccess(format!(
                "torn record at {}: stored length {stored_len}, handle says {}",
                id.offset, id.len
            )));
        }
        let stored_crc = inner
            .file
            .read_u64::<BigEndian>()
            .map_err(|e| Error::DiskAccess(format!("read record checksum: {e}")))?;

        let mut payload = vec![0u8; stored_len as usize];
        inner
            .file
            .read_exact(&mut payload)
            .map_err(|e| Error::DiskAccess(format!("read record payload: {e}")))?;

        if self.crc64.checksum(&payload) != stored_crc {
            return Err(Error::DiskAccess(format!(
                "checksum mismatch at {}",
                id.offset
            )));
        }
        Ok(payload)
    }

    pub fn close(self) {
        self.closed.store(true, Ordering::SeqCst);
        tracing::debug!(path = %self.path.display(), "overflow store closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    fn create_store(dir: &TempDir) -> DiskStore {
        DiskStore::create(dir.path(), "orders").expect("create overflow store")
    }

    #[test]
    fn test_append_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = create_store(&dir);

        let key = ColumnKey::new(42, 7, 0);
        let payload = vec![0x0A, 0, 0, 0, 1, 2, 3, 4];
        let id = store.append(&key, ValueKind::Value, &payload).unwrap();

        assert_eq!(id.len(), payload.len() as u32);
        assert_eq!(id.kind(), ValueKind::Value);
        assert_eq!(store.read(&id).unwrap(), payload);
    }

    #[test]
    fn test_records_are_independent() {
        let dir = TempDir::new().unwrap();
        let store = create_store(&dir);

        let first = store
            .append(&ColumnKey::new(1, 0, 0), ValueKind::Value, &[1u8; 32])
            .unwrap();
        let second = store
            .append(&ColumnKey::new(1, 0, 1), ValueKind::Delta, &[2u8; 16])
            .unwrap();

        assert_eq!(store.read(&second).unwrap(), vec![2u8; 16]);
        assert_eq!(store.read(&first).unwrap(), vec![1u8; 32]);
    }

    #[test]
    fn test_destroyed_id_reads_as_entry_destroyed() {
        let dir = TempDir::new().unwrap();
        let store = create_store(&dir);

        let id = store
            .append(&ColumnKey::new(1, 0, 0), ValueKind::Value, &[0u8; 8])
            .unwrap();
        id.destroy();
        assert_eq!(store.read(&id).unwrap_err(), Error::EntryDestroyed);
    }

    #[test]
    fn test_corrupt_payload_fails_checksum() {
        let dir = TempDir::new().unwrap();
        let store = create_store(&dir);

        let id = store
            .append(&ColumnKey::new(1, 0, 0), ValueKind::Value, &[7u8; 64])
            .unwrap();

        // Flip a payload byte behind the store's back.
        let payload_start = id.offset() + RECORD_HEADER_SIZE as u64;
        {
            let mut inner = store.inner.lock().unwrap();
            inner.file.seek(SeekFrom::Start(payload_start)).unwrap();
            inner.file.write_all(&[0xFF]).unwrap();
            inner.file.flush().unwrap();
        }

        let err = store.read(&id).unwrap_err();
        assert!(matches!(err, Error::DiskAccess(_)));
        assert!(err.is_entry_absent());
    }
}
