//! # BlobStore — the Public Surface
//!
//! `BlobStore` ties the storage layer together: open/create with
//! cooperative locking and journal recovery, blob allocate/free/read/write
//! under transactions, the small-integer user index, and fetch-on-miss
//! through an injected [`BlobSource`].
//!
//! ## Opening
//!
//! ```ignore
//! use pagevault::{BlobStore, LockMode};
//!
//! let mut store = BlobStore::builder()
//!     .path("./tiles.pv")
//!     .create(true)
//!     .open()?;
//!
//! store.begin(LockMode::Append)?;
//! let blob = store.allocate(payload.len())?;
//! store.write_blob(blob, &payload)?;
//! store.set_index_entry(7, blob)?;
//! store.commit()?;
//! ```
//!
//! Opening runs, in order: the process-wide registry claim (one live
//! instance per canonical path), the non-blocking cooperative file lock,
//! and journal recovery — an interrupted transaction is rolled back
//! before any application logic sees the file.
//!
//! ## Transactions and Locks
//!
//! Every structural mutation happens between `begin` and `commit`.
//! `begin(level)` escalates the held file lock for the duration of the
//! transaction; `commit`/`end` restore the open-time level. Allocation
//! and writes need `Append`; anything that deletes — `free`, or a user
//! index growth that frees its old blob — needs `Exclusive`, because
//! deletion can invalidate concurrent readers.
//!
//! ## User Index
//!
//! The index is an ordinary blob of little-endian u32 slots, pointed to
//! by the header and grown allocate-copy-free (powers of two, at least
//! 64 slots). Slot value 0 means absent. `fetch(id)` consults the index
//! and, on a miss with a configured source, downloads the payload,
//! stores it, records the entry, and returns the blob — in its own
//! `Append` transaction when the caller has none open.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{bail, ensure, Result, WrapErr};
use tracing::debug;

use crate::storage::header::{
    StoreHeader, FLAG_FREE, HDR_OFF_INDEX_BLOB, SIZE_MASK,
};
use crate::storage::{
    check_store, offset_in_segment, segment_of, CheckReport, FreeLists, Journal, LockMode,
    OpenRegistry, RegistryGuard, SegmentMap, StoreLock, TxnPager, BLOB_HEADER_SIZE, META_PAGES,
    PAGE_SIZE,
};

/// Pluggable fetch-on-miss strategy: given an index id, produce the blob
/// payload (typically by downloading it). The store handles allocation,
/// writing, and indexing.
pub trait BlobSource {
    fn fetch(&self, id: u32) -> Result<Vec<u8>>;
}

impl<F> BlobSource for F
where
    F: Fn(u32) -> Result<Vec<u8>>,
{
    fn fetch(&self, id: u32) -> Result<Vec<u8>> {
        self(id)
    }
}

const INDEX_MIN_SLOTS: u32 = 64;

/// Builder for configuring and opening a [`BlobStore`].
pub struct StoreBuilder {
    path: Option<PathBuf>,
    lock_mode: LockMode,
    registry: Arc<OpenRegistry>,
    source: Option<Box<dyn BlobSource>>,
    create: bool,
}

impl StoreBuilder {
    fn new() -> Self {
        Self {
            path: None,
            lock_mode: LockMode::Append,
            registry: OpenRegistry::global(),
            source: None,
            create: false,
        }
    }

    pub fn path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn lock_mode(mut self, mode: LockMode) -> Self {
        self.lock_mode = mode;
        self
    }

    /// Injects an open-path registry; defaults to the process-global one.
    pub fn registry(mut self, registry: Arc<OpenRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn blob_source(mut self, source: impl BlobSource + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Create a fresh store instead of opening an existing one. Fails if
    /// the file already exists.
    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    pub fn open(self) -> Result<BlobStore> {
        let Some(path) = self.path else {
            bail!("store path not configured");
        };
        if self.create {
            BlobStore::create_at(&path, self.lock_mode, self.registry, self.source)
        } else {
            BlobStore::open_at(&path, self.lock_mode, self.registry, self.source)
        }
        .wrap_err_with(|| format!("failed to open store '{}'", path.display()))
    }
}

pub struct BlobStore {
    path: PathBuf,
    pager: TxnPager,
    lock: StoreLock,
    base_mode: LockMode,
    guid: [u8; 16],
    created_at: u64,
    source: Option<Box<dyn BlobSource>>,
    _guard: RegistryGuard,
}

impl BlobStore {
    pub fn builder() -> StoreBuilder {
        StoreBuilder::new()
    }

    /// Creates a fresh store with `Exclusive` access.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::builder()
            .path(path)
            .create(true)
            .lock_mode(LockMode::Exclusive)
            .open()
    }

    /// Opens an existing store.
    pub fn open<P: AsRef<Path>>(path: P, mode: LockMode) -> Result<Self> {
        Self::builder().path(path).lock_mode(mode).open()
    }

    fn create_at(
        path: &Path,
        mode: LockMode,
        registry: Arc<OpenRegistry>,
        source: Option<Box<dyn BlobSource>>,
    ) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create store file '{}'", path.display()))?;
        file.set_len(META_PAGES as u64 * PAGE_SIZE as u64)
            .wrap_err("failed to size fresh store file")?;

        let canonical = path
            .canonicalize()
            .wrap_err_with(|| format!("failed to canonicalize '{}'", path.display()))?;
        let guard = registry.register(canonical)?;
        let lock = StoreLock::acquire(&file, path, mode)?;

        let mut journal = Journal::open(path)?;
        journal.clear()?;

        let segments = SegmentMap::from_file(file, path)?;
        let mut pager = TxnPager::new(segments, journal);

        let header = StoreHeader::new(META_PAGES);
        let guid = header.guid();
        let created_at = header.created_at();
        pager.write_bytes(0, 0, zerocopy::IntoBytes::as_bytes(&header))?;
        pager.flush_all()?;

        Ok(Self {
            path: path.to_path_buf(),
            pager,
            lock,
            base_mode: mode,
            guid,
            created_at,
            source,
            _guard: guard,
        })
    }

    fn open_at(
        path: &Path,
        mode: LockMode,
        registry: Arc<OpenRegistry>,
        source: Option<Box<dyn BlobSource>>,
    ) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open store file '{}'", path.display()))?;

        let canonical = path
            .canonicalize()
            .wrap_err_with(|| format!("failed to canonicalize '{}'", path.display()))?;
        let guard = registry.register(canonical)?;
        let mut lock = StoreLock::acquire(&file, path, mode)?;

        // Recovery runs before any application logic. It needs the
        // append-level lock; the dirty check is repeated inside the
        // replay, since another process may have recovered while we
        // waited.
        let mut journal = Journal::open(path)?;
        if journal.is_dirty()? {
            lock.escalate(&file, path, LockMode::Append)?;
            journal.replay_into(&mut file, path)?;
            lock.downgrade(&file, path, mode)?;
        }

        let segments = SegmentMap::from_file(file, path)?;
        let mut pager = TxnPager::new(segments, journal);

        let header_bytes = pager.read_bytes(0, 0, std::mem::size_of::<StoreHeader>())?;
        let header = StoreHeader::from_bytes(&header_bytes)
            .wrap_err_with(|| format!("invalid store header in '{}'", path.display()))?;
        let total = header.total_pages();
        let guid = header.guid();
        let created_at = header.created_at();

        ensure!(
            total >= META_PAGES && total <= pager.segments().page_capacity(),
            "header claims {} pages but '{}' holds only {}",
            total,
            path.display(),
            pager.segments().page_capacity()
        );

        Ok(Self {
            path: path.to_path_buf(),
            pager,
            lock,
            base_mode: mode,
            guid,
            created_at,
            source,
            _guard: guard,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> usize {
        PAGE_SIZE
    }

    pub fn guid(&self) -> [u8; 16] {
        self.guid
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn lock_mode(&self) -> LockMode {
        self.lock.held()
    }

    pub fn total_pages(&mut self) -> Result<u32> {
        FreeLists::new(&mut self.pager).total_pages()
    }

    // ---- transactions ------------------------------------------------

    /// Opens a transaction, escalating the file lock to `level` for its
    /// duration. Blocks until the lock is available.
    pub fn begin(&mut self, level: LockMode) -> Result<()> {
        ensure!(!self.pager.in_txn(), "transaction already open");
        let Self { lock, pager, path, .. } = self;
        lock.escalate(pager.segments().file(), path, level)?;
        pager.begin()
    }

    /// Commits the open transaction; durable once this returns.
    pub fn commit(&mut self) -> Result<()> {
        self.pager.commit()?;
        self.restore_base_lock()
    }

    /// Abandons the open transaction, discarding all its changes. A no-op
    /// when idle.
    pub fn end(&mut self) -> Result<()> {
        self.pager.end();
        self.restore_base_lock()
    }

    pub fn in_transaction(&self) -> bool {
        self.pager.in_txn()
    }

    fn restore_base_lock(&mut self) -> Result<()> {
        let Self { lock, pager, path, base_mode, .. } = self;
        lock.downgrade(pager.segments().file(), path, *base_mode)
    }

    fn require_txn(&self, need: LockMode, what: &str) -> Result<()> {
        ensure!(
            self.pager.in_txn(),
            "{} requires an open transaction",
            what
        );
        ensure!(
            self.lock.held() >= need,
            "{} requires the {:?} lock, but only {:?} is held",
            what,
            need,
            self.lock.held()
        );
        Ok(())
    }

    // ---- blobs -------------------------------------------------------

    /// Allocates a blob for `payload_len` bytes; returns its id (first
    /// page). The payload is uninitialized until written.
    pub fn allocate(&mut self, payload_len: usize) -> Result<u32> {
        self.require_txn(LockMode::Append, "allocate")?;
        FreeLists::new(&mut self.pager).allocate(payload_len)
    }

    /// Frees a blob, returning its pages to the free lists.
    pub fn free(&mut self, blob: u32) -> Result<()> {
        self.require_txn(LockMode::Exclusive, "free")?;
        FreeLists::new(&mut self.pager).free(blob)
    }

    /// Payload size of a live blob in bytes.
    pub fn blob_len(&mut self, blob: u32) -> Result<usize> {
        self.live_header(blob).map(|h| (h & SIZE_MASK) as usize)
    }

    /// The blob's address for raw page access: `(segment, byte offset of
    /// the payload within that segment, payload length)`. A blob never
    /// crosses a segment boundary, so the payload is contiguous there.
    pub fn blob_location(&mut self, blob: u32) -> Result<(u32, usize, usize)> {
        let len = self.blob_len(blob)?;
        Ok((
            segment_of(blob),
            offset_in_segment(blob) + BLOB_HEADER_SIZE,
            len,
        ))
    }

    /// Copies the blob's payload out, honoring the open transaction's
    /// view when one is open.
    pub fn read_blob(&mut self, blob: u32) -> Result<Vec<u8>> {
        let len = self.blob_len(blob)?;
        let mut out = Vec::with_capacity(len);

        let mut page = blob;
        let mut offset = BLOB_HEADER_SIZE;
        let mut remaining = len;
        while remaining > 0 {
            let take = remaining.min(PAGE_SIZE - offset);
            out.extend_from_slice(&self.pager.read_bytes(page, offset, take)?);
            remaining -= take;
            page += 1;
            offset = 0;
        }
        Ok(out)
    }

    /// Writes `bytes` at the start of the blob's payload.
    pub fn write_blob(&mut self, blob: u32, bytes: &[u8]) -> Result<()> {
        self.require_txn(LockMode::Append, "write_blob")?;
        let len = self.blob_len(blob)?;
        ensure!(
            bytes.len() <= len,
            "payload of {} bytes does not fit blob {} of {} bytes",
            bytes.len(),
            blob,
            len
        );

        let mut page = blob;
        let mut offset = BLOB_HEADER_SIZE;
        let mut rest = bytes;
        while !rest.is_empty() {
            let take = rest.len().min(PAGE_SIZE - offset);
            self.pager.write_bytes(page, offset, &rest[..take])?;
            rest = &rest[take..];
            page += 1;
            offset = 0;
        }
        Ok(())
    }

    fn live_header(&mut self, blob: u32) -> Result<u32> {
        let total = self.total_pages()?;
        ensure!(
            blob >= META_PAGES && blob < total,
            "page {} is not a blob (store spans pages {}..{})",
            blob,
            META_PAGES,
            total
        );
        let header = self.pager.read_u32(blob, 0)?;
        ensure!(header & FLAG_FREE == 0, "blob {} is free", blob);
        Ok(header)
    }

    // ---- user index --------------------------------------------------

    /// Looks up an index entry; `None` when unset or out of range.
    pub fn index_entry(&mut self, id: u32) -> Result<Option<u32>> {
        let index = self.pager.read_u32(0, HDR_OFF_INDEX_BLOB)?;
        if index == 0 {
            return Ok(None);
        }
        let slots = (self.blob_len(index)? / 4) as u32;
        if id >= slots {
            return Ok(None);
        }
        let value = self.index_word(index, id)?;
        Ok((value != 0).then_some(value))
    }

    /// Points index entry `id` at `blob`, growing the index as needed.
    /// Growth that replaces an existing index blob frees the old one and
    /// therefore needs the `Exclusive` lock; first-time creation works
    /// under `Append`.
    pub fn set_index_entry(&mut self, id: u32, blob: u32) -> Result<()> {
        self.require_txn(LockMode::Append, "set_index_entry")?;

        let mut index = self.pager.read_u32(0, HDR_OFF_INDEX_BLOB)?;
        let slots = if index == 0 {
            0
        } else {
            (self.blob_len(index)? / 4) as u32
        };

        if id >= slots {
            index = self.grow_index(index, slots, id)?;
        }

        let (page, offset) = index_slot_position(index, id);
        self.pager.write_u32(page, offset, blob)
    }

    fn index_word(&mut self, index: u32, id: u32) -> Result<u32> {
        let (page, offset) = index_slot_position(index, id);
        self.pager.read_u32(page, offset)
    }

    fn grow_index(&mut self, old: u32, old_slots: u32, id: u32) -> Result<u32> {
        if old != 0 {
            self.require_txn(LockMode::Exclusive, "growing the user index")?;
        }
        let new_slots = (id + 1).next_power_of_two().max(INDEX_MIN_SLOTS);

        let mut lists = FreeLists::new(&mut self.pager);
        let new = lists.allocate(new_slots as usize * 4)?;

        // Fresh pages may be reused space; the index must start all-absent.
        let mut cleared = 0u32;
        while cleared < new_slots {
            let (page, offset) = index_slot_position(new, cleared);
            let run = (new_slots - cleared).min(((PAGE_SIZE - offset) / 4) as u32);
            self.pager.fill_zero(page, offset, run as usize * 4)?;
            cleared += run;
        }

        for slot in 0..old_slots {
            let value = self.index_word(old, slot)?;
            if value != 0 {
                let (page, offset) = index_slot_position(new, slot);
                self.pager.write_u32(page, offset, value)?;
            }
        }

        if old != 0 {
            FreeLists::new(&mut self.pager).free(old)?;
        }
        self.pager.write_u32(0, HDR_OFF_INDEX_BLOB, new)?;
        Ok(new)
    }

    /// Returns the blob for `id`, pulling it from the configured
    /// [`BlobSource`] on a miss. Runs its own `Append` transaction when
    /// none is open.
    pub fn fetch(&mut self, id: u32) -> Result<u32> {
        if let Some(blob) = self.index_entry(id)? {
            return Ok(blob);
        }

        let Some(source) = self.source.as_ref() else {
            bail!(
                "blob {} is not in the index and no blob source is configured",
                id
            );
        };
        let bytes = source
            .fetch(id)
            .wrap_err_with(|| format!("blob source failed for id {}", id))?;

        let own_txn = !self.pager.in_txn();
        if own_txn {
            self.begin(LockMode::Append)?;
        }
        let stored = self.store_fetched(id, &bytes);
        if own_txn {
            match stored {
                Ok(blob) => {
                    self.commit()?;
                    Ok(blob)
                }
                Err(e) => {
                    let _ = self.end();
                    Err(e)
                }
            }
        } else {
            stored
        }
    }

    fn store_fetched(&mut self, id: u32, bytes: &[u8]) -> Result<u32> {
        let blob = self.allocate(bytes.len())?;
        self.write_blob(blob, bytes)?;
        self.set_index_entry(id, blob)?;
        debug!(id, blob, len = bytes.len(), "fetched blob into store");
        Ok(blob)
    }

    // ---- diagnostics & lifecycle ------------------------------------

    /// Runs the full consistency check; the authoritative "is this file
    /// correctly formed" oracle.
    pub fn check(&mut self) -> Result<CheckReport> {
        ensure!(
            !self.pager.in_txn(),
            "consistency check requires an idle store"
        );
        check_store(&mut self.pager)
    }

    /// Flushes everything, truncates the file to its logical size
    /// (best-effort), and releases locks and the registry slot.
    pub fn close(mut self) -> Result<()> {
        self.pager.end();
        self.pager.flush_all()?;

        let total = self.total_pages()?;
        let segments = self.pager.segments_mut();
        segments.unmap_all();
        if let Err(e) = segments.file().set_len(total as u64 * PAGE_SIZE as u64) {
            // Physically larger than logical is harmless.
            debug!(path = %self.path.display(), "skipping close-time truncation: {}", e);
        }

        self.lock.release(self.pager.segments().file());
        Ok(())
    }
}

impl std::fmt::Debug for BlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStore")
            .field("path", &self.path)
            .field("lock", &self.lock.held())
            .field("in_txn", &self.pager.in_txn())
            .finish()
    }
}

/// Page and in-page byte offset of index slot `id` within the index blob
/// starting at page `index`.
fn index_slot_position(index: u32, id: u32) -> (u32, usize) {
    let byte = BLOB_HEADER_SIZE + id as usize * 4;
    (index + (byte / PAGE_SIZE) as u32, byte % PAGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_then_reopen_preserves_identity() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.pv");

        let guid = {
            let store = BlobStore::create(&path).unwrap();
            let guid = store.guid();
            store.close().unwrap();
            guid
        };

        let mut store = BlobStore::open(&path, LockMode::Read).unwrap();
        assert_eq!(store.guid(), guid);
        assert_eq!(store.total_pages().unwrap(), META_PAGES);
        store.close().unwrap();
    }

    #[test]
    fn create_refuses_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.pv");

        let store = BlobStore::create(&path).unwrap();
        store.close().unwrap();

        assert!(BlobStore::create(&path).is_err());
    }

    #[test]
    fn allocate_outside_transaction_is_rejected() {
        let dir = tempdir().unwrap();
        let mut store = BlobStore::create(dir.path().join("store.pv")).unwrap();

        assert!(store.allocate(100).is_err());
    }

    #[test]
    fn blob_roundtrip_across_pages() {
        let dir = tempdir().unwrap();
        let mut store = BlobStore::create(dir.path().join("store.pv")).unwrap();

        let payload: Vec<u8> = (0..PAGE_SIZE * 2 + 500).map(|i| i as u8).collect();

        store.begin(LockMode::Append).unwrap();
        let blob = store.allocate(payload.len()).unwrap();
        store.write_blob(blob, &payload).unwrap();
        store.commit().unwrap();

        assert_eq!(store.blob_len(blob).unwrap(), payload.len());
        assert_eq!(store.read_blob(blob).unwrap(), payload);

        let (segment, offset, len) = store.blob_location(blob).unwrap();
        assert_eq!(segment, 0);
        assert_eq!(offset, blob as usize * PAGE_SIZE + BLOB_HEADER_SIZE);
        assert_eq!(len, payload.len());
    }

    #[test]
    fn reading_a_free_blob_is_rejected() {
        let dir = tempdir().unwrap();
        let mut store = BlobStore::create(dir.path().join("store.pv")).unwrap();

        store.begin(LockMode::Exclusive).unwrap();
        let a = store.allocate(100).unwrap();
        let _b = store.allocate(100).unwrap();
        store.free(a).unwrap();
        store.commit().unwrap();

        assert!(store.read_blob(a).is_err());
    }

    #[test]
    fn index_entries_roundtrip_and_persist() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.pv");

        let blob = {
            let mut store = BlobStore::create(&path).unwrap();
            store.begin(LockMode::Append).unwrap();
            let blob = store.allocate(10).unwrap();
            store.set_index_entry(3, blob).unwrap();
            store.commit().unwrap();

            assert_eq!(store.index_entry(3).unwrap(), Some(blob));
            assert_eq!(store.index_entry(4).unwrap(), None);
            assert_eq!(store.index_entry(1_000_000).unwrap(), None);
            store.close().unwrap();
            blob
        };

        let mut store = BlobStore::open(&path, LockMode::Read).unwrap();
        assert_eq!(store.index_entry(3).unwrap(), Some(blob));
        store.close().unwrap();
    }

    #[test]
    fn index_growth_keeps_existing_entries() {
        let dir = tempdir().unwrap();
        let mut store = BlobStore::create(dir.path().join("store.pv")).unwrap();

        store.begin(LockMode::Exclusive).unwrap();
        let a = store.allocate(10).unwrap();
        let b = store.allocate(10).unwrap();
        store.set_index_entry(0, a).unwrap();
        store.set_index_entry(5, b).unwrap();
        // Far past the initial 64 slots: forces allocate-copy-free.
        store.set_index_entry(300, a).unwrap();
        store.commit().unwrap();

        assert_eq!(store.index_entry(0).unwrap(), Some(a));
        assert_eq!(store.index_entry(5).unwrap(), Some(b));
        assert_eq!(store.index_entry(300).unwrap(), Some(a));
        assert_eq!(store.index_entry(299).unwrap(), None);
        store.check().unwrap();
    }

    #[test]
    fn fetch_uses_source_once_and_indexes_result() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let dir = tempdir().unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_source = Arc::clone(&calls);

        let mut store = BlobStore::builder()
            .path(dir.path().join("store.pv"))
            .create(true)
            .lock_mode(LockMode::Exclusive)
            .blob_source(move |id: u32| -> Result<Vec<u8>> {
                calls_in_source.fetch_add(1, Ordering::SeqCst);
                Ok(vec![id as u8; 2000])
            })
            .open()
            .unwrap();

        let blob = store.fetch(9).unwrap();
        assert_eq!(store.read_blob(blob).unwrap(), vec![9u8; 2000]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Second fetch is served from the index.
        assert_eq!(store.fetch(9).unwrap(), blob);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fetch_without_source_fails_on_miss() {
        let dir = tempdir().unwrap();
        let mut store = BlobStore::create(dir.path().join("store.pv")).unwrap();

        assert!(store.fetch(1).is_err());
    }

    #[test]
    fn second_instance_on_same_path_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.pv");

        let store = BlobStore::create(&path).unwrap();
        let err = BlobStore::open(&path, LockMode::Read).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<crate::error::StoreError>(),
            Some(crate::error::StoreError::ConcurrencyViolation { .. })
        ));

        store.close().unwrap();
        BlobStore::open(&path, LockMode::Read).unwrap().close().unwrap();
    }

    #[test]
    fn close_truncates_to_logical_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.pv");

        let mut store = BlobStore::create(&path).unwrap();
        store.begin(LockMode::Exclusive).unwrap();
        let blob = store.allocate(PAGE_SIZE * 3).unwrap();
        store.commit().unwrap();

        store.begin(LockMode::Exclusive).unwrap();
        store.free(blob).unwrap();
        store.commit().unwrap();
        store.close().unwrap();

        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            META_PAGES as u64 * PAGE_SIZE as u64
        );
    }

    #[test]
    fn end_discards_uncommitted_work() {
        let dir = tempdir().unwrap();
        let mut store = BlobStore::create(dir.path().join("store.pv")).unwrap();

        store.begin(LockMode::Append).unwrap();
        let _blob = store.allocate(5000).unwrap();
        store.end().unwrap();

        assert_eq!(store.total_pages().unwrap(), META_PAGES);
        store.check().unwrap();
    }
}
