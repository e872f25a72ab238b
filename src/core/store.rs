//! Purpose: Keyed blob containers the engine persists its records into.
//! Exports: `RecordStore`, `MemStore`, `DirStore`, `StoreStats`.
//! Role: Opaque key -> bytes boundary below `sink` and `source`.
//! Invariants: `put` is atomic per key; readers see either the old or the new record, never a mix.
//! Invariants: `DirStore` allows one writer per directory (exclusive lock on `LOCK`).
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use bytes::Bytes;
use fs2::FileExt;
use libc::{EACCES, EPERM};
use memmap2::Mmap;
use sha2::{Digest, Sha256};

use crate::core::error::{Error, ErrorKind, Result};

const LOCK_FILE: &str = "LOCK";
const RECORD_SUFFIX: &str = "rec";

pub trait RecordStore: Send + Sync {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;

    fn get(&self, key: &str) -> Result<Option<Bytes>>;

    fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    fn stats(&self) -> StoreStats;
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StoreStats {
    pub gets: u64,
    pub puts: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

#[derive(Debug, Default)]
struct StoreCounters {
    gets: AtomicU64,
    puts: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

impl StoreCounters {
    fn record_get(&self, len: usize) {
        self.gets.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(len as u64, Ordering::Relaxed);
    }

    fn record_put(&self, len: usize) {
        self.puts.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(len as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> StoreStats {
        StoreStats {
            gets: self.gets.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }
}

/// In-memory store used for tests and scratch datasets.
#[derive(Debug, Default)]
pub struct MemStore {
    records: RwLock<HashMap<String, Bytes>>,
    counters: StoreCounters,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn remove(&self, key: &str) -> Option<Bytes> {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    /// Sorted keys starting with `prefix`.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<String> = records
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

impl RecordStore for MemStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.counters.record_put(bytes.len());
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), Bytes::copy_from_slice(bytes));
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let found = self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned();
        if let Some(bytes) = &found {
            self.counters.record_get(bytes.len());
        }
        Ok(found)
    }

    fn contains(&self, key: &str) -> Result<bool> {
        Ok(self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key))
    }

    fn stats(&self) -> StoreStats {
        self.counters.snapshot()
    }
}

/// Directory-backed store: one memory-mapped file per record.
#[derive(Debug)]
pub struct DirStore {
    dir: PathBuf,
    lock: Option<File>,
    counters: StoreCounters,
}

impl DirStore {
    /// Opens `dir` for writing, creating it if needed; fails with `Busy` if another writer holds it.
    pub fn create(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .map_err(|err| Error::new(io_error_kind(&err)).with_path(&dir).with_source(err))?;
        let lock_path = dir.join(LOCK_FILE);
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)
            .map_err(|err| Error::new(io_error_kind(&err)).with_path(&lock_path).with_source(err))?;
        lock.try_lock_exclusive().map_err(|err| {
            Error::new(lock_error_kind(&err))
                .with_message("record directory is locked by another writer")
                .with_path(&lock_path)
                .with_source(err)
        })?;
        tracing::debug!(dir = %dir.display(), "record directory opened for writing");
        Ok(Self {
            dir,
            lock: Some(lock),
            counters: StoreCounters::default(),
        })
    }

    /// Opens an existing directory for reading; takes no lock.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let meta = fs::metadata(&dir)
            .map_err(|err| Error::new(io_error_kind(&err)).with_path(&dir).with_source(err))?;
        if !meta.is_dir() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("record store path is not a directory")
                .with_path(&dir));
        }
        Ok(Self {
            dir,
            lock: None,
            counters: StoreCounters::default(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_writable(&self) -> bool {
        self.lock.is_some()
    }

    pub fn record_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.{RECORD_SUFFIX}", record_file_stem(key)))
    }
}

impl RecordStore for DirStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        if self.lock.is_none() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("record store opened read-only")
                .with_key(key)
                .with_path(&self.dir));
        }
        let path = self.record_path(key);
        let tmp = path.with_extension("tmp");
        let io_err = |err: io::Error, at: &Path| {
            Error::new(io_error_kind(&err))
                .with_key(key)
                .with_path(at)
                .with_source(err)
        };
        let written = write_synced(&tmp, bytes)
            .map_err(|err| io_err(err, &tmp))
            .and_then(|()| fs::rename(&tmp, &path).map_err(|err| io_err(err, &path)));
        if let Err(err) = written {
            let _ = fs::remove_file(&tmp);
            return Err(err);
        }
        self.counters.record_put(bytes.len());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let path = self.record_path(key);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(Error::new(io_error_kind(&err))
                    .with_key(key)
                    .with_path(&path)
                    .with_source(err));
            }
        };
        let len = file
            .metadata()
            .map(|meta| meta.len())
            .map_err(|err| Error::new(ErrorKind::Io).with_path(&path).with_source(err))?;
        if len == 0 {
            self.counters.record_get(0);
            return Ok(Some(Bytes::new()));
        }
        // Records are replaced by rename, never rewritten in place, so the map stays stable.
        let mmap = unsafe {
            Mmap::map(&file)
                .map_err(|err| Error::new(ErrorKind::Io).with_path(&path).with_source(err))?
        };
        self.counters.record_get(mmap.len());
        Ok(Some(Bytes::from_owner(mmap)))
    }

    fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.record_path(key).is_file())
    }

    fn stats(&self) -> StoreStats {
        self.counters.snapshot()
    }
}

impl Drop for DirStore {
    fn drop(&mut self) {
        if let Some(lock) = &self.lock {
            let _ = lock.unlock();
        }
    }
}

fn record_file_stem(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(path)?;
    file.write_all(bytes)?;
    file.sync_data()
}

fn io_error_kind(err: &io::Error) -> ErrorKind {
    match err.kind() {
        io::ErrorKind::NotFound => ErrorKind::NotFound,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    }
}

fn lock_error_kind(err: &io::Error) -> ErrorKind {
    let errno = err.raw_os_error().unwrap_or_default();
    if errno == EACCES || errno == EPERM {
        return ErrorKind::Permission;
    }
    match err.kind() {
        io::ErrorKind::WouldBlock => ErrorKind::Busy,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    }
}

#[cfg(test)]
mod tests {
    use super::{lock_error_kind, record_file_stem, DirStore, MemStore, RecordStore};
    use crate::core::error::ErrorKind;

    #[test]
    fn mem_store_round_trips_and_counts() {
        let store = MemStore::new();
        assert!(store.get("a/NTH").expect("get").is_none());
        store.put("a/NTH", b"header").expect("put");
        store.put("b/NTH", b"other").expect("put");
        assert_eq!(store.get("a/NTH").expect("get").as_deref(), Some(&b"header"[..]));
        assert!(store.contains("b/NTH").expect("contains"));
        assert_eq!(store.keys_with_prefix("a/"), vec!["a/NTH".to_string()]);
        let stats = store.stats();
        assert_eq!(stats.puts, 2);
        assert_eq!(stats.gets, 1);
        assert_eq!(stats.bytes_read, 6);
    }

    #[test]
    fn dir_store_round_trips_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("records");
        {
            let store = DirStore::create(&root).expect("create");
            store.put("events/NPP0_1_2", &[9u8; 100]).expect("put");
            store.put("events/NPP0_1_2", &[7u8; 10]).expect("overwrite");
        }
        let store = DirStore::open(&root).expect("open");
        let bytes = store.get("events/NPP0_1_2").expect("get").expect("present");
        assert_eq!(bytes.as_ref(), &[7u8; 10]);
        assert!(store.get("events/NPP0_1_3").expect("get").is_none());
        assert!(!store.is_writable());
    }

    #[test]
    fn read_only_dir_store_rejects_writes() {
        let dir = tempfile::tempdir().expect("tempdir");
        drop(DirStore::create(dir.path()).expect("create"));
        let store = DirStore::open(dir.path()).expect("open");
        let err = store.put("k", b"v").expect_err("read-only");
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert_eq!(err.key(), Some("k"));
    }

    #[test]
    fn failed_put_leaves_no_temp_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = DirStore::create(dir.path()).expect("create");
        let path = store.record_path("events/NTH");
        // A non-empty directory at the record path makes the final rename fail.
        std::fs::create_dir(&path).expect("blocker dir");
        std::fs::write(path.join("keep"), b"x").expect("blocker file");

        let err = store.put("events/NTH", b"header").expect_err("rename fails");
        assert_eq!(err.key(), Some("events/NTH"));
        assert!(!path.with_extension("tmp").exists());
        assert_eq!(store.stats().puts, 0);
    }

    #[test]
    fn second_writer_is_busy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let _writer = DirStore::create(dir.path()).expect("create");
        let err = DirStore::create(dir.path()).expect_err("locked");
        assert_eq!(err.kind(), ErrorKind::Busy);
    }

    #[test]
    fn record_names_are_stable_hex() {
        let stem = record_file_stem("events/NTH");
        assert_eq!(stem.len(), 64);
        assert!(stem.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(stem, record_file_stem("events/NTH"));
        assert_ne!(stem, record_file_stem("events/NTF"));
    }

    #[test]
    fn lock_errors_map_to_expected_kinds() {
        let err = std::io::Error::from_raw_os_error(libc::EAGAIN);
        assert_eq!(lock_error_kind(&err), ErrorKind::Busy);

        let err = std::io::Error::from_raw_os_error(libc::EACCES);
        assert_eq!(lock_error_kind(&err), ErrorKind::Permission);

        let err = std::io::Error::from_raw_os_error(libc::EBADF);
        assert_eq!(lock_error_kind(&err), ErrorKind::Io);
    }
}
