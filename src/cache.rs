//! The cache facade.
//!
//! [`Cache`] routes hashes to buckets, drives the locker handshake, owns the
//! tile pool, evicts under LRU pressure, and runs the recovery protocols.
//! Every public operation catches the internal signals (abandoned lock,
//! inconsistent bucket, ToC exhaustion) at this boundary, routes them to
//! [`CacheInner::recover_from_inconsistent_state`], and returns a neutral
//! result; no signal escapes to the client.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard};

use crate::bucket::{
    self, lru, map, Bucket, BucketData, BucketStateGuard, EntryRecord, ENTRY_FORMAT_VERSION,
    STATUS_NULL, STATUS_PENDING, STATUS_READY,
};
use crate::entry::{CacheEntryPtr, DeserializeStatus, PropertyMap};
use crate::error::{CacheError, Result};
use crate::locker::{CacheEntryLocker, EntryStatus};
use crate::segment::Segment;
use crate::shm::file_lock::FileLock;
use crate::shm::layout::{BucketSyncData, CacheIpcData, MappingSyncData, TilePoolSyncData};
use crate::shm::lock::{ShmCondVar, ShmMutexGuard, ShmReadGuard, ShmRwLock};
use crate::shm::region::{shared_name_for, SyncRegion};
use crate::shm::sem::NamedSemaphore;
use crate::storage::{FlushMode, MemoryFile, RamBuffer, Storage};
use crate::tiles::{
    file_index_of, owner_bucket_of, tile_byte_offset, tile_file_name, TileId,
};
use crate::{
    bucket_dir_name, bucket_index, BUCKET_COUNT, INTERPROCESS_LOCK_TIMEOUT, TILES_PER_BUCKET_PER_FILE,
    TILES_PER_FILE, TILE_BYTES, TILE_FILE_BYTES, TOC_GROW_BYTES,
};

/// Default steady-state size target: 8 GiB.
const DEFAULT_MAXIMUM_SIZE: u64 = 8 << 30;

/// Configuration for [`Cache::open`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    directory: Option<PathBuf>,
    maximum_size: u64,
    tile_storage: bool,
    robust: bool,
    lock_timeout: Duration,
}

impl CacheConfig {
    /// A cache backed by memory-mapped files under `directory`, shared with
    /// other processes and surviving restarts.
    pub fn persistent(directory: impl Into<PathBuf>) -> Self {
        CacheConfig {
            directory: Some(directory.into()),
            maximum_size: DEFAULT_MAXIMUM_SIZE,
            tile_storage: true,
            robust: false,
            lock_timeout: INTERPROCESS_LOCK_TIMEOUT,
        }
    }

    /// A process-local cache with the same structure and no files.
    pub fn in_memory() -> Self {
        CacheConfig {
            directory: None,
            maximum_size: DEFAULT_MAXIMUM_SIZE,
            tile_storage: true,
            robust: false,
            lock_timeout: INTERPROCESS_LOCK_TIMEOUT,
        }
    }

    /// Steady-state size target in bytes. 0 disables eviction.
    pub fn with_maximum_size(mut self, bytes: u64) -> Self {
        self.maximum_size = bytes;
        self
    }

    /// Disable the tile pool for metadata-only caches.
    pub fn with_tile_storage(mut self, enabled: bool) -> Self {
        self.tile_storage = enabled;
        self
    }

    /// Robust interprocess mode: timed locks, abandoned-lock detection, and
    /// the shared-region rebuild protocol. Persistent caches only.
    pub fn with_robust_interprocess(mut self, robust: bool) -> Self {
        self.robust = robust;
        self
    }

    /// Budget for one interprocess lock acquisition in robust mode.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }
}

/// Per-plugin memory report, see [`Cache::memory_stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PluginMemoryStats {
    pub count: u64,
    pub bytes: u64,
}

static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TOKEN: u64 = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
}

/// Opaque identity of the current thread, recorded in Pending entries to
/// detect same-thread re-entry. Never 0.
fn thread_token() -> u64 {
    THREAD_TOKEN.with(|t| *t)
}

enum Lookup {
    Found(EntryStatus),
    NotFound,
}

enum ReadOutcome {
    Ok,
    Failed,
    NeedsWriteLock,
}

fn mapping_raw(m: &MappingSyncData) -> *mut MappingSyncData {
    m as *const MappingSyncData as *mut MappingSyncData
}

fn pool_raw(p: &TilePoolSyncData) -> *mut TilePoolSyncData {
    p as *const TilePoolSyncData as *mut TilePoolSyncData
}

struct EvictorSignal {
    state: Mutex<EvictorState>,
    cond: Condvar,
}

#[derive(Default)]
struct EvictorState {
    pending: bool,
    shutdown: bool,
}

struct RecoveryGate {
    active: bool,
}

pub(crate) struct CacheInner {
    persistent: bool,
    robust: bool,
    tile_storage: bool,
    lock_timeout: Duration,
    directory: Option<PathBuf>,
    maximum_size: AtomicU64,
    /// The process-local reader/writer lock over the shared synchronization
    /// region: every operation read-holds it, the rebuild protocol
    /// write-holds it while the region is remapped.
    sync: RwLock<SyncRegion>,
    file_lock: Option<FileLock>,
    sem_valid: Option<NamedSemaphore>,
    sem_invalid: Option<NamedSemaphore>,
    shared_name: Option<String>,
    buckets: Vec<Bucket>,
    tile_files: RwLock<Vec<Storage>>,
    /// Pool generation this process last synchronized its file list to.
    tile_generation: AtomicU64,
    /// Whether any bucket was wiped (format mismatch) while attaching.
    any_wiped_at_attach: AtomicBool,
    recovery_gate: Mutex<RecoveryGate>,
    recovery_cond: Condvar,
    evictor: EvictorSignal,
}

/// The top-level cache object. Cheap to share behind `Arc` via the lockers
/// it hands out; dropping the `Cache` stops the background evictor.
pub struct Cache {
    inner: Arc<CacheInner>,
    evictor_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Cache {
    pub fn open(config: CacheConfig) -> Result<Cache> {
        let inner = Arc::new(CacheInner::open(config)?);

        let evictor_inner = Arc::clone(&inner);
        let handle = std::thread::Builder::new()
            .name("rendercache-evictor".into())
            .spawn(move || evictor_loop(evictor_inner))
            .map_err(CacheError::Io)?;

        Ok(Cache {
            inner,
            evictor_thread: Mutex::new(Some(handle)),
        })
    }

    /// Entry point of the handshake: look the template's hash up and return
    /// a locker describing what the caller must do next.
    pub fn get(&self, template: CacheEntryPtr) -> CacheEntryLocker {
        let hash = template.hash();
        let bucket_index = bucket_index(hash);
        let mut locker = CacheEntryLocker {
            inner: Arc::clone(&self.inner),
            resolved: template.clone(),
            template,
            hash,
            bucket_index,
            status: EntryStatus::MustCompute,
        };
        locker.run_lookup(Duration::ZERO, None);
        locker
    }

    /// Probe for an entry without allocating or visibly mutating anything.
    pub fn has(&self, hash: u64) -> bool {
        self.inner
            .run_recovering(false, |i| i.has_impl(hash))
    }

    /// Explicitly deallocate the entry for `hash`, returning its tiles.
    pub fn remove(&self, hash: u64) {
        self.inner.run_recovering((), |i| i.remove_impl(hash));
    }

    /// Wipe all buckets and recreate one empty tile file.
    pub fn clear(&self) {
        self.inner.run_recovering((), |i| {
            let sync = i.sync.read();
            i.wipe_all(sync.data())
        });
    }

    /// Evict least-recently-used entries until the total size fits under
    /// `maximum_size - bytes_to_free`. A no-op when the maximum size is 0.
    pub fn evict_lru(&self, bytes_to_free: u64) {
        self.inner
            .run_recovering((), |i| i.evict_impl(bytes_to_free));
    }

    pub fn set_maximum_size(&self, bytes: u64) {
        self.inner.maximum_size.store(bytes, Ordering::Relaxed);
        self.inner.request_eviction();
    }

    pub fn maximum_size(&self) -> u64 {
        self.inner.maximum_size.load(Ordering::Relaxed)
    }

    pub fn current_size(&self) -> u64 {
        self.inner.run_recovering(0, |i| {
            let sync = i.sync.read();
            i.total_size(sync.data())
        })
    }

    /// Per-plugin entry counts and byte totals (tile bytes included).
    pub fn memory_stats(&self) -> BTreeMap<String, PluginMemoryStats> {
        self.inner
            .run_recovering(BTreeMap::new(), |i| i.memory_stats_impl())
    }

    /// Persistent mode only: write dirty mapped pages back to disk.
    pub fn flush(&self, asynchronous: bool) {
        if !self.inner.persistent {
            return;
        }
        let mode = if asynchronous {
            FlushMode::Async
        } else {
            FlushMode::Sync
        };
        self.inner.run_recovering((), |i| i.flush_impl(mode));
    }

    pub fn is_persistent(&self) -> bool {
        self.inner.persistent
    }

    pub fn is_tile_storage_enabled(&self) -> bool {
        self.inner.tile_storage
    }

    pub fn directory(&self) -> Option<&Path> {
        self.inner.directory.as_deref()
    }

    /// Read existing tiles and/or allocate fresh ones for `entry`.
    ///
    /// `read_ids` are identifiers previously returned by an allocation;
    /// `alloc_hashes` carry one per-tile hash per tile to allocate (the
    /// tile's bucket is derived from the entry hash combined with it, which
    /// spreads an entry's tiles across buckets). The returned handle pins
    /// the tile pool read lock; drop it to unlock. Returns `None` when the
    /// entry vanished (the cache was wiped) or the identifiers are invalid.
    pub fn retrieve_and_lock_tiles(
        &self,
        entry: &CacheEntryPtr,
        read_ids: &[TileId],
        alloc_hashes: &[u64],
    ) -> Option<TilesLock<'_>> {
        if !self.inner.tile_storage {
            return None;
        }
        let inner: &CacheInner = &self.inner;
        inner.run_recovering(None, move |i| {
            i.retrieve_and_lock_tiles_impl(entry, read_ids, alloc_hashes)
                .map(Some)
        })
    }

    /// Return tiles held by `entry` to the pool: `local_indices` are
    /// positions in the entry's tile list, `cache_ids` the matching packed
    /// identifiers.
    pub fn release_tiles(&self, entry: &CacheEntryPtr, local_indices: &[usize], cache_ids: &[TileId]) {
        self.inner.run_recovering((), |i| {
            i.release_tiles_impl(entry.hash(), local_indices, cache_ids)
        });
    }

    /// Validity probe for a packed tile identifier.
    pub fn check_tile_index(&self, id: TileId) -> bool {
        self.inner.run_recovering(false, |i| {
            let sync = i.sync.read();
            let ipc = sync.data();
            let _pool = ipc.tile_pool.lock.read(i.timeout())?;
            let n_files = unsafe { (*pool_raw(&ipc.tile_pool)).n_files };
            Ok(file_index_of(id) < n_files && (crate::tiles::tile_index_of(id) as usize) < TILES_PER_FILE)
        })
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        {
            let mut state = self.inner.evictor.state.lock();
            state.shutdown = true;
            self.inner.evictor.cond.notify_all();
        }
        if let Some(handle) = self.evictor_thread.lock().take() {
            let _ = handle.join();
        }
    }
}

fn evictor_loop(inner: Arc<CacheInner>) {
    loop {
        {
            let mut state = inner.evictor.state.lock();
            while !state.pending && !state.shutdown {
                inner.evictor.cond.wait(&mut state);
            }
            if state.shutdown {
                return;
            }
            state.pending = false;
        }
        inner.run_recovering((), |i| i.evict_impl(0));
    }
}

/// Handle over tiles returned by [`Cache::retrieve_and_lock_tiles`].
///
/// Holds the tile-pool read lock (and the process-local region lock) for as
/// long as the caller works with the returned tile memory; dropping it
/// releases both.
pub struct TilesLock<'a> {
    /// Keeps the shared synchronization region mapped while `pool_lock`
    /// points into it.
    _sync_guard: RwLockReadGuard<'a, SyncRegion>,
    /// Keeps the tile file mappings alive while raw tile pointers exist.
    _files_guard: RwLockReadGuard<'a, Vec<Storage>>,
    /// The pool read lock, kept raw because its guard would borrow from
    /// `_sync_guard`; released in `Drop`.
    pool_lock: *const ShmRwLock,
    read_ptrs: Vec<*mut u8>,
    allocated: Vec<(TileId, *mut u8)>,
}

impl TilesLock<'_> {
    pub fn allocated_count(&self) -> usize {
        self.allocated.len()
    }

    pub fn allocated_ids(&self) -> Vec<TileId> {
        self.allocated.iter().map(|(id, _)| *id).collect()
    }

    /// Writable bytes of the `i`-th freshly allocated tile.
    pub fn allocated_tile_mut(&mut self, i: usize) -> &mut [u8] {
        let (_, ptr) = self.allocated[i];
        unsafe { std::slice::from_raw_parts_mut(ptr, TILE_BYTES) }
    }

    /// Bytes of the `i`-th existing tile requested through `read_ids`.
    pub fn existing_tile(&self, i: usize) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.read_ptrs[i], TILE_BYTES) }
    }

    /// Writable bytes of the `i`-th existing tile.
    pub fn existing_tile_mut(&mut self, i: usize) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.read_ptrs[i], TILE_BYTES) }
    }
}

impl Drop for TilesLock<'_> {
    fn drop(&mut self) {
        unsafe {
            (*self.pool_lock).force_unlock();
        }
    }
}

impl CacheInner {
    fn open(config: CacheConfig) -> Result<CacheInner> {
        let persistent = config.directory.is_some();
        if config.robust && !persistent {
            return Err(CacheError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "robust interprocess mode requires a persistent cache",
            )));
        }

        let mut file_lock = None;
        let mut sem_valid = None;
        let mut sem_invalid = None;
        let mut shared_name = None;

        let sync = if let Some(dir) = &config.directory {
            std::fs::create_dir_all(dir)?;
            let lock = FileLock::open_or_create(dir)?;
            if config.robust {
                let name = shared_name_for(dir);
                let sole_process = lock.try_lock_exclusive()?;
                if sole_process {
                    // Nobody else is attached: reset rendezvous state left
                    // behind by dead processes.
                    NamedSemaphore::remove(&format!("/{name}-valid"));
                    NamedSemaphore::remove(&format!("/{name}-invalid"));
                    SyncRegion::remove(&name);
                }
                sem_valid = Some(NamedSemaphore::open_or_create(
                    &format!("/{name}-valid"),
                    0,
                )?);
                sem_invalid = Some(NamedSemaphore::open_or_create(
                    &format!("/{name}-invalid"),
                    0,
                )?);
                let region = SyncRegion::open_or_create(&name)?;
                // Downgrade to the attachment-lifetime shared hold.
                lock.unlock()?;
                lock.lock_shared()?;
                shared_name = Some(name);
                file_lock = Some(lock);
                region
            } else {
                if !lock.try_lock_exclusive()? {
                    return Err(CacheError::Busy);
                }
                file_lock = Some(lock);
                // Single-process attachment: the locks need not outlive us.
                SyncRegion::local()?
            }
        } else {
            SyncRegion::local()?
        };

        let inner = CacheInner {
            persistent,
            robust: config.robust,
            tile_storage: config.tile_storage,
            lock_timeout: config.lock_timeout,
            directory: config.directory,
            maximum_size: AtomicU64::new(config.maximum_size),
            sync: RwLock::new(sync),
            file_lock,
            sem_valid,
            sem_invalid,
            shared_name,
            buckets: Vec::new(),
            tile_files: RwLock::new(Vec::new()),
            tile_generation: AtomicU64::new(0),
            any_wiped_at_attach: AtomicBool::new(false),
            recovery_gate: Mutex::new(RecoveryGate { active: false }),
            recovery_cond: Condvar::new(),
            evictor: EvictorSignal {
                state: Mutex::new(EvictorState::default()),
                cond: Condvar::new(),
            },
        };
        let mut inner = inner;
        inner.attach_buckets()?;
        inner.attach_tile_pool()?;
        Ok(inner)
    }

    fn attach_buckets(&mut self) -> Result<()> {
        let mut buckets = Vec::with_capacity(BUCKET_COUNT);
        let mut any_wiped = false;
        {
            let sync = self.sync.read();
            let ipc = sync.data();
            for i in 0..BUCKET_COUNT {
                let mut storage = if let Some(dir) = &self.directory {
                    let path = dir.join(bucket_dir_name(i)).join("Index");
                    Storage::File(MemoryFile::open_or_create(&path, TOC_GROW_BYTES)?)
                } else {
                    Storage::Ram(RamBuffer::new(TOC_GROW_BYTES))
                };

                let bsync = &ipc.buckets[i];
                let _toc = bsync.toc_lock.write(self.timeout())?;
                if self.persistent {
                    // The file may have grown between our open and the lock
                    // acquisition; remap at its settled length.
                    storage.unmap();
                    storage.map()?;
                }
                any_wiped |= unsafe { bucket::init_bucket_storage(&mut storage)? };
                if self.persistent {
                    unsafe {
                        let m = mapping_raw(&bsync.toc_mapping);
                        let _g = bsync.toc_mapping.guard.lock(self.timeout())?;
                        (*m).n_mapped += 1;
                    }
                }
                buckets.push(Bucket::new(i, storage));
            }
        }
        self.buckets = buckets;
        self.any_wiped_at_attach.store(any_wiped, Ordering::Relaxed);
        Ok(())
    }

    fn attach_tile_pool(&self) -> Result<()> {
        if !self.tile_storage {
            return Ok(());
        }
        let sync = self.sync.read();
        let ipc = sync.data();
        let _pool = ipc.tile_pool.lock.write(self.timeout())?;
        let mut files = self.tile_files.write();

        let mut found_existing = false;
        if let Some(dir) = &self.directory {
            loop {
                let path = dir.join(tile_file_name(files.len()));
                if !path.exists() {
                    break;
                }
                files.push(Storage::File(MemoryFile::open_or_create(
                    &path,
                    TILE_FILE_BYTES,
                )?));
                found_existing = true;
            }
        }

        unsafe {
            let p = pool_raw(&ipc.tile_pool);
            if (*p).n_files == 0 && !files.is_empty() {
                // Fresh synchronization region over a pre-existing cache.
                (*p).n_files = files.len() as u32;
            }
            self.tile_generation
                .store((*p).generation, Ordering::Relaxed);
        }

        if self.any_wiped_at_attach.load(Ordering::Relaxed) && found_existing {
            // A wiped bucket lost its share of the free-tile partition; the
            // only consistent continuation is a full reset.
            drop(files);
            drop(_pool);
            log::warn!("bucket format changed with live tile files; clearing cache");
            return self.wipe_all(ipc);
        }

        if files.is_empty() {
            self.create_tile_file_locked(ipc, &mut files)?;
        }
        Ok(())
    }

    fn timeout(&self) -> Option<Duration> {
        self.robust.then_some(self.lock_timeout)
    }

    fn wait_cond(&self, cond: &ShmCondVar, guard: &mut ShmMutexGuard<'_>) -> Result<()> {
        if self.robust {
            if !cond.timed_wait(guard, self.lock_timeout) {
                return Err(CacheError::AbandonedLock(self.lock_timeout));
            }
        } else {
            cond.wait(guard);
        }
        Ok(())
    }

    /// Take the bucket ToC lock shared, remapping first if another process
    /// resized the file (reader side of the growth protocol).
    fn ensure_toc_mapped<'i>(
        &self,
        ipc: &'i CacheIpcData,
        bkt: usize,
    ) -> Result<ShmReadGuard<'i>> {
        let bucket = &self.buckets[bkt];
        let bsync = &ipc.buckets[bkt];
        loop {
            let toc = bsync.toc_lock.read(self.timeout())?;
            if !self.persistent {
                return Ok(toc);
            }
            let valid = {
                let _g = bsync.toc_mapping.guard.lock(self.timeout())?;
                unsafe { (*mapping_raw(&bsync.toc_mapping)).mapping_valid != 0 }
            };
            if valid {
                return Ok(toc);
            }
            drop(toc);

            let mut st = bucket.storage.write();
            let mut g = bsync.toc_mapping.guard.lock(self.timeout())?;
            unsafe {
                let m = mapping_raw(&bsync.toc_mapping);
                if (*m).mapping_valid == 0 {
                    st.unmap();
                    if (*m).n_mapped > 0 {
                        (*m).n_mapped -= 1;
                    }
                    bsync.toc_mapping.unmapped.notify_one();
                    while (*m).mapping_valid == 0 {
                        self.wait_cond(&bsync.toc_mapping.remapped, &mut g)?;
                    }
                    st.map()?;
                    (*m).n_mapped += 1;
                }
            }
        }
    }

    /// Run `f` while this process is the only one with a valid mapping of
    /// the bucket's ToC (writer side of the growth protocol). The caller
    /// holds the ToC lock exclusively and the local storage write lock.
    unsafe fn with_sole_mapping(
        &self,
        bsync: &BucketSyncData,
        st: &mut Storage,
        f: impl FnOnce(&mut Storage) -> Result<()>,
    ) -> Result<()> {
        if !self.persistent {
            return f(st);
        }
        let m = mapping_raw(&bsync.toc_mapping);
        let mut g = bsync.toc_mapping.guard.lock(self.timeout())?;
        if (*m).mapping_valid == 0 {
            // Another process is mid-resize; fall in line as a reader first.
            st.unmap();
            if (*m).n_mapped > 0 {
                (*m).n_mapped -= 1;
            }
            bsync.toc_mapping.unmapped.notify_one();
            while (*m).mapping_valid == 0 {
                self.wait_cond(&bsync.toc_mapping.remapped, &mut g)?;
            }
            st.map()?;
            (*m).n_mapped += 1;
        }

        (*m).mapping_valid = 0;
        if (*m).n_mapped > 0 {
            (*m).n_mapped -= 1;
        }
        while (*m).n_mapped > 0 {
            self.wait_cond(&bsync.toc_mapping.unmapped, &mut g)?;
        }

        let result = f(st);

        (*m).n_mapped += 1;
        (*m).mapping_valid = 1;
        bsync.toc_mapping.remapped.notify_all();
        result
    }

    /// Grow a bucket's ToC so at least `min_free` more bytes are available.
    /// Called with no ToC lock held.
    fn grow_toc(&self, ipc: &CacheIpcData, bkt: usize, min_free: usize) -> Result<()> {
        let bucket = &self.buckets[bkt];
        let bsync = &ipc.buckets[bkt];
        let _toc = bsync.toc_lock.write(self.timeout())?;
        let mut st = bucket.storage.write();

        unsafe {
            self.with_sole_mapping(bsync, &mut st, |st| {
                let seg = bucket::segment_of(st);
                if seg.free_bytes() >= min_free as u64 {
                    // Another process already grew it past what we need.
                    return Ok(());
                }
                let old_len = seg.seg_len() as usize;
                let new_len =
                    (old_len + min_free.max(TOC_GROW_BYTES)).div_ceil(TOC_GROW_BYTES) * TOC_GROW_BYTES;
                log::debug!("growing bucket {bkt:02x} ToC {old_len} -> {new_len}");
                st.flush_all(FlushMode::Sync)?;
                st.resize(new_len, true)?;
                let mut seg = Segment::attach(st.ptr(), st.len())
                    .expect("bucket ToC segment lost its format during grow");
                seg.grow_to(new_len);
                Ok(())
            })
        }
    }

    /// One lookup pass over the bucket. With write rights it may take over
    /// or deallocate the entry; without, it reports what the caller should
    /// do next.
    #[allow(clippy::too_many_arguments)]
    unsafe fn lookup_and_set_status(
        &self,
        ipc: &CacheIpcData,
        bkt: usize,
        seg: &Segment,
        root: *mut BucketData,
        template: &CacheEntryPtr,
        hash: u64,
        has_write_rights: bool,
        time_spent: Duration,
        timeout: Option<Duration>,
        resolved: &mut CacheEntryPtr,
    ) -> Result<Lookup> {
        let Some(entry_off) = map::lookup(seg, root, hash) else {
            return Ok(Lookup::NotFound);
        };
        let entry = seg.get::<EntryRecord>(entry_off);

        if (*entry).version != ENTRY_FORMAT_VERSION {
            if has_write_rights {
                self.deallocate_entry(ipc, bkt, seg, root, entry_off)?;
            }
            return Ok(Lookup::NotFound);
        }

        match (*entry).status {
            STATUS_NULL => {
                // Abandoned placeholder; takeover needs write rights.
                if !has_write_rights {
                    return Ok(Lookup::NotFound);
                }
            }
            STATUS_PENDING => {
                let recursion = !template.allow_multiple_fetch_per_thread()
                    && (*entry).compute_owner == thread_token();
                if recursion {
                    log::debug!(
                        "thread re-entered pending entry {hash:016x}; taking it over to avoid deadlock"
                    );
                } else {
                    let expired = matches!(timeout, Some(t) if time_spent >= t);
                    if !expired {
                        return Ok(Lookup::Found(EntryStatus::ComputationPending));
                    }
                }
                if !has_write_rights {
                    return Ok(Lookup::NotFound);
                }
            }
            STATUS_READY => {
                match self.read_entry_payload(bkt, seg, entry, template, has_write_rights, resolved)
                {
                    ReadOutcome::Ok => {
                        let _lru = ipc.buckets[bkt].lru_mutex.lock(self.timeout())?;
                        lru::move_to_back(seg, root, entry_off);
                        return Ok(Lookup::Found(EntryStatus::Cached));
                    }
                    ReadOutcome::NeedsWriteLock => return Ok(Lookup::NotFound),
                    ReadOutcome::Failed => {
                        if has_write_rights {
                            self.deallocate_entry(ipc, bkt, seg, root, entry_off)?;
                        }
                        return Ok(Lookup::NotFound);
                    }
                }
            }
            _ => {
                // Unknown status word: the record is garbage.
                if has_write_rights {
                    self.deallocate_entry(ipc, bkt, seg, root, entry_off)?;
                }
                return Ok(Lookup::NotFound);
            }
        }

        // Null placeholder or expired Pending, and we hold write rights:
        // this thread takes the computation over.
        (*entry).status = STATUS_PENDING;
        (*entry).compute_owner = thread_token();
        Ok(Lookup::Found(EntryStatus::MustCompute))
    }

    unsafe fn read_entry_payload(
        &self,
        bkt: usize,
        seg: &Segment,
        entry: *mut EntryRecord,
        template: &CacheEntryPtr,
        has_write_rights: bool,
        resolved: &mut CacheEntryPtr,
    ) -> ReadOutcome {
        if self.persistent {
            if (*entry).props_off == 0 {
                return ReadOutcome::Failed;
            }
            let blob = std::slice::from_raw_parts(
                seg.ptr_at((*entry).props_off),
                (*entry).props_len as usize,
            );
            let props = match PropertyMap::decode(blob, (*entry).hash) {
                Ok(p) => p,
                Err(_) => return ReadOutcome::Failed,
            };
            match template.deserialize(&props, has_write_rights) {
                DeserializeStatus::Ok => ReadOutcome::Ok,
                DeserializeStatus::Failed => ReadOutcome::Failed,
                DeserializeStatus::NeedsWriteLock => {
                    if has_write_rights {
                        // Second of the two permitted attempts; give up.
                        log::warn!(
                            "entry {:016x} still wants write rights under the write lock",
                            (*entry).hash
                        );
                        ReadOutcome::Failed
                    } else {
                        ReadOutcome::NeedsWriteLock
                    }
                }
            }
        } else {
            let mut payloads = self.buckets[bkt].local_payloads.lock();
            match payloads.remove(&(*entry).hash) {
                Some(p) => {
                    *resolved = p.clone();
                    // Re-insert at the back, mirroring the LRU promotion.
                    payloads.insert((*entry).hash, p);
                    ReadOutcome::Ok
                }
                None => ReadOutcome::Failed,
            }
        }
    }

    /// Construct a Pending placeholder owned by this thread. Caller holds
    /// the bucket write lock and the state guard.
    unsafe fn create_pending_entry(
        &self,
        seg: &Segment,
        root: *mut BucketData,
        template: &CacheEntryPtr,
        hash: u64,
        bkt: usize,
    ) -> Result<()> {
        let entry_off = seg.alloc(std::mem::size_of::<EntryRecord>())?;
        let entry = seg.get::<EntryRecord>(entry_off);
        std::ptr::write_bytes(entry, 0, 1);
        (*entry).version = ENTRY_FORMAT_VERSION;
        (*entry).status = STATUS_PENDING;
        (*entry).hash = hash;
        (*entry).compute_owner = thread_token();
        (*entry).size = template.metadata_size() as u64;
        (*entry).set_plugin_id(template.plugin_id());

        if let Err(e) = map::insert(seg, root, hash, entry_off) {
            seg.dealloc(entry_off);
            return Err(e);
        }
        if !self.persistent {
            self.buckets[bkt]
                .local_payloads
                .lock()
                .insert(hash, template.clone());
        }
        Ok(())
    }

    /// Destroy an entry: return its tiles, unlink it from the LRU, release
    /// its segment allocations, and erase it from the map. Caller holds the
    /// bucket write lock and the state guard.
    unsafe fn deallocate_entry(
        &self,
        ipc: &CacheIpcData,
        bkt: usize,
        seg: &Segment,
        root: *mut BucketData,
        entry_off: u64,
    ) -> Result<()> {
        let entry = seg.get::<EntryRecord>(entry_off);
        let hash = (*entry).hash;
        let was_ready = (*entry).status == STATUS_READY;

        let tile_bytes = (*entry).tiles_len * TILE_BYTES as u64;
        if was_ready {
            (*root).size = (*root).size.saturating_sub((*entry).size);
        }
        (*root).size = (*root).size.saturating_sub(tile_bytes);

        let ids: Vec<TileId> = bucket::entry_tiles_slice(seg, entry).to_vec();
        for id in ids {
            // Dead pixels must never be written back to disk.
            self.invalidate_tile_bytes(id);
            let owner = owner_bucket_of(id);
            if owner == bkt {
                bucket::free_tiles_insert(seg, root, id)?;
            } else {
                // Cross-bucket return; the current bucket is held first and
                // the target never loops back here.
                let _toc = self.ensure_toc_mapped(ipc, owner)?;
                let ost = self.buckets[owner].storage.read();
                let oseg = bucket::segment_of(&ost);
                let oroot = bucket::root_of(&oseg);
                let _od = ipc.buckets[owner].data_lock.write(self.timeout())?;
                bucket::free_tiles_insert(&oseg, oroot, id)?;
            }
        }

        if was_ready {
            let _lru = ipc.buckets[bkt].lru_mutex.lock(self.timeout())?;
            lru::unlink(seg, root, entry_off);
        }

        if (*entry).props_off != 0 {
            seg.dealloc((*entry).props_off);
        }
        if (*entry).tiles_off != 0 {
            seg.dealloc((*entry).tiles_off);
        }
        map::remove(seg, root, hash);
        seg.dealloc(entry_off);
        self.buckets[bkt].local_payloads.lock().remove(&hash);
        Ok(())
    }

    fn invalidate_tile_bytes(&self, id: TileId) {
        let files = self.tile_files.read();
        if let Some(f) = files.get(file_index_of(id) as usize) {
            let _ = f.flush_range(FlushMode::Invalidate, tile_byte_offset(id), TILE_BYTES);
        }
    }

    /// The locker's lookup algorithm: a read pass, then a write pass that
    /// may take over, repair, or create the entry, growing the ToC once if
    /// the placeholder does not fit.
    pub(crate) fn locker_lookup(
        &self,
        template: &CacheEntryPtr,
        hash: u64,
        bkt: usize,
        time_spent: Duration,
        timeout: Option<Duration>,
    ) -> Result<(EntryStatus, CacheEntryPtr)> {
        let sync = self.sync.read();
        let ipc = sync.data();
        let bucket = &self.buckets[bkt];
        let bsync = &ipc.buckets[bkt];
        let mut resolved = template.clone();

        {
            let _toc = self.ensure_toc_mapped(ipc, bkt)?;
            let st = bucket.storage.read();
            let seg = unsafe { bucket::segment_of(&st) };
            let root = unsafe { bucket::root_of(&seg) };
            let _data = bsync.data_lock.read(self.timeout())?;
            if let Lookup::Found(status) = unsafe {
                self.lookup_and_set_status(
                    ipc, bkt, &seg, root, template, hash, false, time_spent, timeout,
                    &mut resolved,
                )
            }? {
                return Ok((status, resolved));
            }
        }

        for attempt in 0..2 {
            {
                let _toc = self.ensure_toc_mapped(ipc, bkt)?;
                let st = bucket.storage.read();
                let seg = unsafe { bucket::segment_of(&st) };
                let root = unsafe { bucket::root_of(&seg) };
                let _data = bsync.data_lock.write(self.timeout())?;
                let _state = unsafe { BucketStateGuard::enter(bkt, root) }?;
                match unsafe {
                    self.lookup_and_set_status(
                        ipc, bkt, &seg, root, template, hash, true, time_spent, timeout,
                        &mut resolved,
                    )
                }? {
                    Lookup::Found(status) => return Ok((status, resolved)),
                    Lookup::NotFound => {
                        match unsafe { self.create_pending_entry(&seg, root, template, hash, bkt) }
                        {
                            Ok(()) => return Ok((EntryStatus::MustCompute, resolved)),
                            Err(CacheError::OutOfTocMemory) => {}
                            Err(e) => return Err(e),
                        }
                    }
                }
            }
            if attempt == 0 {
                self.grow_toc(ipc, bkt, TOC_GROW_BYTES)?;
            }
        }

        // The placeholder could not be stored even after growing; the
        // caller computes anyway and insert() will no-op.
        Ok((EntryStatus::MustCompute, resolved))
    }

    /// Publish a computed entry: serialize, account, link into the LRU.
    pub(crate) fn locker_insert(&self, template: &CacheEntryPtr, hash: u64, bkt: usize) -> Result<()> {
        let sync = self.sync.read();
        let ipc = sync.data();
        let bucket = &self.buckets[bkt];
        let bsync = &ipc.buckets[bkt];

        // Serialize outside any lock.
        let blob = if self.persistent {
            let mut props = PropertyMap::new();
            if template.serialize(&mut props).is_err() {
                log::warn!("entry {hash:016x} failed to serialize; dropping its placeholder");
                return self.destroy_placeholder(ipc, bkt, hash);
            }
            Some(props.encode(hash))
        } else {
            None
        };

        for attempt in 0..2 {
            {
                let _toc = self.ensure_toc_mapped(ipc, bkt)?;
                let st = bucket.storage.read();
                let seg = unsafe { bucket::segment_of(&st) };
                let root = unsafe { bucket::root_of(&seg) };
                let _data = bsync.data_lock.write(self.timeout())?;
                let _state = unsafe { BucketStateGuard::enter(bkt, root) }?;

                let Some(entry_off) = (unsafe { map::lookup(&seg, root, hash) }) else {
                    // The cache was wiped while we computed.
                    return Ok(());
                };
                unsafe {
                    let entry = seg.get::<EntryRecord>(entry_off);
                    if (*entry).status == STATUS_READY && (*entry).compute_owner == 0 {
                        // A recursive path already published this entry.
                        return Ok(());
                    }

                    let mut out_of_memory = false;
                    if let Some(blob) = &blob {
                        match seg.alloc(blob.len()) {
                            Ok(blob_off) => {
                                std::ptr::copy_nonoverlapping(
                                    blob.as_ptr(),
                                    seg.ptr_at(blob_off),
                                    blob.len(),
                                );
                                if (*entry).props_off != 0 {
                                    seg.dealloc((*entry).props_off);
                                }
                                (*entry).props_off = blob_off;
                                (*entry).props_len = blob.len() as u64;
                            }
                            Err(CacheError::OutOfTocMemory) => out_of_memory = true,
                            Err(e) => return Err(e),
                        }
                    }

                    if !out_of_memory {
                        (*root).size += (*entry).size;
                        {
                            let _lru = bsync.lru_mutex.lock(self.timeout())?;
                            lru::push_back(&seg, root, entry_off);
                        }
                        (*entry).compute_owner = 0;
                        (*entry).status = STATUS_READY;
                        return Ok(());
                    }
                }
            }
            if attempt == 0 {
                let need = blob.as_ref().map_or(TOC_GROW_BYTES, |b| b.len());
                self.grow_toc(ipc, bkt, need)?;
            }
        }

        log::warn!("entry {hash:016x} does not fit in the ToC after growth; dropping it");
        self.destroy_placeholder(ipc, bkt, hash)
    }

    /// Drop the Pending placeholder for `hash` so waiters stop waiting.
    pub(crate) fn locker_abandon(&self, hash: u64, bkt: usize) -> Result<()> {
        let sync = self.sync.read();
        let ipc = sync.data();
        self.destroy_placeholder(ipc, bkt, hash)
    }

    fn destroy_placeholder(&self, ipc: &CacheIpcData, bkt: usize, hash: u64) -> Result<()> {
        let bucket = &self.buckets[bkt];
        let bsync = &ipc.buckets[bkt];
        let _toc = self.ensure_toc_mapped(ipc, bkt)?;
        let st = bucket.storage.read();
        let seg = unsafe { bucket::segment_of(&st) };
        let root = unsafe { bucket::root_of(&seg) };
        let _data = bsync.data_lock.write(self.timeout())?;
        let _state = unsafe { BucketStateGuard::enter(bkt, root) }?;
        if let Some(entry_off) = unsafe { map::lookup(&seg, root, hash) } {
            unsafe { self.deallocate_entry(ipc, bkt, &seg, root, entry_off)? };
        }
        Ok(())
    }

    pub(crate) fn has_impl(&self, hash: u64) -> Result<bool> {
        let sync = self.sync.read();
        let ipc = sync.data();
        let bkt = bucket_index(hash);
        let _toc = self.ensure_toc_mapped(ipc, bkt)?;
        let st = self.buckets[bkt].storage.read();
        let seg = unsafe { bucket::segment_of(&st) };
        let root = unsafe { bucket::root_of(&seg) };
        let _data = ipc.buckets[bkt].data_lock.read(self.timeout())?;
        Ok(unsafe { map::lookup(&seg, root, hash) }.is_some())
    }

    pub(crate) fn remove_impl(&self, hash: u64) -> Result<()> {
        let sync = self.sync.read();
        let ipc = sync.data();
        self.destroy_placeholder(ipc, bucket_index(hash), hash)
    }

    fn total_size(&self, ipc: &CacheIpcData) -> Result<u64> {
        let mut total = 0;
        for bkt in 0..BUCKET_COUNT {
            let _toc = self.ensure_toc_mapped(ipc, bkt)?;
            let st = self.buckets[bkt].storage.read();
            let seg = unsafe { bucket::segment_of(&st) };
            let root = unsafe { bucket::root_of(&seg) };
            let _data = ipc.buckets[bkt].data_lock.read(self.timeout())?;
            total += unsafe { (*root).size };
        }
        Ok(total)
    }

    pub(crate) fn evict_impl(&self, bytes_to_free: u64) -> Result<()> {
        let maximum = self.maximum_size.load(Ordering::Relaxed);
        if maximum == 0 {
            return Ok(());
        }
        let target = maximum.saturating_sub(bytes_to_free);

        let sync = self.sync.read();
        let ipc = sync.data();
        let mut current = self.total_size(ipc)?;

        while current > target {
            let mut progressed = false;
            for bkt in 0..BUCKET_COUNT {
                if current <= target {
                    break;
                }
                let freed = self.evict_bucket_front(ipc, bkt)?;
                if freed > 0 {
                    current = current.saturating_sub(freed);
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        Ok(())
    }

    /// Deallocate one bucket's LRU victim. Returns the bytes reclaimed.
    fn evict_bucket_front(&self, ipc: &CacheIpcData, bkt: usize) -> Result<u64> {
        let bsync = &ipc.buckets[bkt];
        let _toc = self.ensure_toc_mapped(ipc, bkt)?;
        let st = self.buckets[bkt].storage.read();
        let seg = unsafe { bucket::segment_of(&st) };
        let root = unsafe { bucket::root_of(&seg) };
        let _data = bsync.data_lock.write(self.timeout())?;
        let _state = unsafe { BucketStateGuard::enter(bkt, root) }?;

        let front = {
            let _lru = bsync.lru_mutex.lock(self.timeout())?;
            unsafe { (*root).lru_front }
        };
        if front == 0 {
            return Ok(0);
        }
        let freed = unsafe {
            let entry = seg.get::<EntryRecord>(front);
            (*entry).size + (*entry).tiles_len * TILE_BYTES as u64
        };
        unsafe { self.deallocate_entry(ipc, bkt, &seg, root, front)? };
        Ok(freed)
    }

    pub(crate) fn memory_stats_impl(&self) -> Result<BTreeMap<String, PluginMemoryStats>> {
        let sync = self.sync.read();
        let ipc = sync.data();
        let mut stats: BTreeMap<String, PluginMemoryStats> = BTreeMap::new();
        for bkt in 0..BUCKET_COUNT {
            let _toc = self.ensure_toc_mapped(ipc, bkt)?;
            let st = self.buckets[bkt].storage.read();
            let seg = unsafe { bucket::segment_of(&st) };
            let root = unsafe { bucket::root_of(&seg) };
            let _data = ipc.buckets[bkt].data_lock.read(self.timeout())?;
            let offsets = {
                let _lru = ipc.buckets[bkt].lru_mutex.lock(self.timeout())?;
                unsafe { lru::collect(&seg, root) }
            };
            for off in offsets {
                unsafe {
                    let entry = seg.get::<EntryRecord>(off);
                    let slot = stats.entry((*entry).plugin_id().to_owned()).or_default();
                    slot.count += 1;
                    slot.bytes += (*entry).size + (*entry).tiles_len * TILE_BYTES as u64;
                }
            }
        }
        Ok(stats)
    }

    pub(crate) fn flush_impl(&self, mode: FlushMode) -> Result<()> {
        let sync = self.sync.read();
        let ipc = sync.data();
        for bkt in 0..BUCKET_COUNT {
            let _toc = self.ensure_toc_mapped(ipc, bkt)?;
            let st = self.buckets[bkt].storage.read();
            st.flush_all(mode)?;
        }
        if self.tile_storage {
            let _pool = ipc.tile_pool.lock.read(self.timeout())?;
            let files = self.tile_files.read();
            for f in files.iter() {
                f.flush_all(mode)?;
            }
        }
        Ok(())
    }

    /// Add a tile file, handing `TILES_PER_BUCKET_PER_FILE` fresh slots to
    /// every bucket. Caller holds the pool lock exclusively and no bucket
    /// lock.
    fn create_tile_file_locked(
        &self,
        ipc: &CacheIpcData,
        files: &mut Vec<Storage>,
    ) -> Result<()> {
        let file_index = files.len();
        log::debug!("creating tile file {}", tile_file_name(file_index));
        let storage = if let Some(dir) = &self.directory {
            Storage::File(MemoryFile::open_or_create(
                &dir.join(tile_file_name(file_index)),
                TILE_FILE_BYTES,
            )?)
        } else {
            Storage::Ram(RamBuffer::new(TILE_FILE_BYTES))
        };
        files.push(storage);
        unsafe {
            (*pool_raw(&ipc.tile_pool)).n_files = files.len() as u32;
        }

        for bkt in 0..BUCKET_COUNT {
            for attempt in 0..2 {
                let done = {
                    let _toc = self.ensure_toc_mapped(ipc, bkt)?;
                    let st = self.buckets[bkt].storage.read();
                    let seg = unsafe { bucket::segment_of(&st) };
                    let root = unsafe { bucket::root_of(&seg) };
                    let _data = ipc.buckets[bkt].data_lock.write(self.timeout())?;
                    let mut ok = true;
                    for t in 0..TILES_PER_BUCKET_PER_FILE {
                        let tile_index = (bkt * TILES_PER_BUCKET_PER_FILE + t) as u32;
                        let id = crate::tiles::make_tile_id(tile_index, file_index as u32);
                        // Reattach ids idempotently: a reset bucket may
                        // already have been refilled by another process.
                        if unsafe { bucket::free_tiles_slice(&seg, root) }.contains(&id) {
                            continue;
                        }
                        match unsafe { bucket::free_tiles_insert(&seg, root, id) } {
                            Ok(()) => {}
                            Err(CacheError::OutOfTocMemory) if attempt == 0 => {
                                ok = false;
                                break;
                            }
                            Err(e) => return Err(e),
                        }
                    }
                    ok
                };
                if done {
                    break;
                }
                self.grow_toc(ipc, bkt, TOC_GROW_BYTES)?;
            }
        }
        Ok(())
    }

    /// Reconcile the local tile file list with the pool state. Caller holds
    /// the pool lock (shared or exclusive).
    fn refresh_tile_files(&self, ipc: &CacheIpcData, files: &mut Vec<Storage>) -> Result<()> {
        let (generation, n_files) = unsafe {
            let p = pool_raw(&ipc.tile_pool);
            ((*p).generation, (*p).n_files as usize)
        };
        if self.tile_generation.load(Ordering::Relaxed) != generation {
            files.clear();
            self.tile_generation.store(generation, Ordering::Relaxed);
        }
        if let Some(dir) = &self.directory {
            while files.len() < n_files {
                let path = dir.join(tile_file_name(files.len()));
                files.push(Storage::File(MemoryFile::open_or_create(
                    &path,
                    TILE_FILE_BYTES,
                )?));
            }
        }
        Ok(())
    }

    fn retrieve_and_lock_tiles_impl<'a>(
        &'a self,
        entry: &CacheEntryPtr,
        read_ids: &[TileId],
        alloc_hashes: &[u64],
    ) -> Result<TilesLock<'a>> {
        let sync_guard = self.sync.read();
        let entry_hash = entry.hash();

        let mut allocated: Vec<(TileId, *mut u8)> = Vec::with_capacity(alloc_hashes.len());
        let mut read_ptrs: Vec<*mut u8> = Vec::with_capacity(read_ids.len());
        let pool_lock_ptr;

        {
            let ipc = sync_guard.data();
            let mut pool_guard = Some(ipc.tile_pool.lock.read(self.timeout())?);
            {
                let mut files = self.tile_files.write();
                self.refresh_tile_files(ipc, &mut files)?;
            }

            // Allocation pass: pop the smallest free slot of each target
            // bucket, creating a new tile file when a bucket runs dry.
            for &tile_hash in alloc_hashes {
                let bkt = bucket_index(entry_hash.wrapping_add(tile_hash));
                loop {
                    let popped = {
                        let _toc = self.ensure_toc_mapped(ipc, bkt)?;
                        let st = self.buckets[bkt].storage.read();
                        let seg = unsafe { bucket::segment_of(&st) };
                        let root = unsafe { bucket::root_of(&seg) };
                        let _data = ipc.buckets[bkt].data_lock.write(self.timeout())?;
                        unsafe { bucket::free_tiles_pop_min(&seg, root) }
                    };
                    if let Some(id) = popped {
                        let fidx = file_index_of(id) as usize;
                        if fidx >= self.tile_files.read().len() {
                            // A file another process created; open it.
                            let mut files = self.tile_files.write();
                            self.refresh_tile_files(ipc, &mut files)?;
                        }
                        let files = self.tile_files.read();
                        if fidx >= files.len() {
                            // The id references a file the pool no longer
                            // knows about; treat the free set as corrupt.
                            return Err(CacheError::BucketInconsistent(bkt));
                        }
                        let ptr = unsafe { files[fidx].ptr().add(tile_byte_offset(id)) };
                        allocated.push((id, ptr));
                        break;
                    }

                    // Bucket is out of slots: grow the pool under the
                    // exclusive lock, then retake everything in pool → ToC
                    // → bucket order.
                    pool_guard = None;
                    {
                        let _pool_w = ipc.tile_pool.lock.write(self.timeout())?;
                        let mut files = self.tile_files.write();
                        self.refresh_tile_files(ipc, &mut files)?;
                        self.create_tile_file_locked(ipc, &mut files)?;
                    }
                    pool_guard = Some(ipc.tile_pool.lock.read(self.timeout())?);
                }
            }

            // Register the allocation on the entry before handing out
            // pointers; roll everything back if the entry vanished.
            if !allocated.is_empty() {
                let ids: Vec<TileId> = allocated.iter().map(|(id, _)| *id).collect();
                match self.append_tiles_to_entry(ipc, entry_hash, &ids) {
                    Ok(true) => {}
                    Ok(false) => {
                        log::debug!(
                            "entry {entry_hash:016x} vanished during tile allocation; rolling back"
                        );
                        self.return_tiles_to_owners(ipc, &ids, false)?;
                        return Err(CacheError::Aborted);
                    }
                    Err(e) => {
                        let _ = self.return_tiles_to_owners(ipc, &ids, false);
                        return Err(e);
                    }
                }
            }

            // Read-back pass for pre-existing tiles.
            {
                let files = self.tile_files.read();
                for &id in read_ids {
                    let fidx = file_index_of(id) as usize;
                    if fidx >= files.len()
                        || crate::tiles::tile_index_of(id) as usize >= TILES_PER_FILE
                    {
                        return Err(CacheError::Aborted);
                    }
                    read_ptrs.push(unsafe { files[fidx].ptr().add(tile_byte_offset(id)) });
                }
            }

            // Keep the pool read lock alive past this scope: the guard
            // would borrow `ipc`, so it is carried as a raw pointer and
            // released by TilesLock::drop.
            pool_lock_ptr = &ipc.tile_pool.lock as *const ShmRwLock;
            std::mem::forget(pool_guard.take().expect("pool read lock must be held"));
        }

        Ok(TilesLock {
            _sync_guard: sync_guard,
            _files_guard: self.tile_files.read(),
            pool_lock: pool_lock_ptr,
            read_ptrs,
            allocated,
        })
    }

    /// Append freshly allocated tile ids to the owning entry. Returns false
    /// when the entry no longer exists.
    fn append_tiles_to_entry(
        &self,
        ipc: &CacheIpcData,
        entry_hash: u64,
        ids: &[TileId],
    ) -> Result<bool> {
        let bkt = bucket_index(entry_hash);
        for attempt in 0..2 {
            {
                let _toc = self.ensure_toc_mapped(ipc, bkt)?;
                let st = self.buckets[bkt].storage.read();
                let seg = unsafe { bucket::segment_of(&st) };
                let root = unsafe { bucket::root_of(&seg) };
                let _data = ipc.buckets[bkt].data_lock.write(self.timeout())?;
                let _state = unsafe { BucketStateGuard::enter(bkt, root) }?;
                let Some(entry_off) = (unsafe { map::lookup(&seg, root, entry_hash) }) else {
                    return Ok(false);
                };
                unsafe {
                    let entry = seg.get::<EntryRecord>(entry_off);
                    match bucket::entry_tiles_push(&seg, entry, ids) {
                        Ok(()) => {
                            (*root).size += ids.len() as u64 * TILE_BYTES as u64;
                            return Ok(true);
                        }
                        Err(CacheError::OutOfTocMemory) if attempt == 0 => {}
                        Err(e) => return Err(e),
                    }
                }
            }
            self.grow_toc(ipc, bkt, ids.len() * 8 + TOC_GROW_BYTES)?;
        }
        Err(CacheError::OutOfTocMemory)
    }

    /// Reinsert tile ids into their structurally owning buckets' free sets.
    /// With `invalidate`, drop the tiles' cached pages first.
    fn return_tiles_to_owners(
        &self,
        ipc: &CacheIpcData,
        ids: &[TileId],
        invalidate: bool,
    ) -> Result<()> {
        for &id in ids {
            if invalidate {
                self.invalidate_tile_bytes(id);
            }
            let owner = owner_bucket_of(id);
            for attempt in 0..2 {
                let inserted = {
                    let _toc = self.ensure_toc_mapped(ipc, owner)?;
                    let st = self.buckets[owner].storage.read();
                    let seg = unsafe { bucket::segment_of(&st) };
                    let root = unsafe { bucket::root_of(&seg) };
                    let _data = ipc.buckets[owner].data_lock.write(self.timeout())?;
                    match unsafe { bucket::free_tiles_insert(&seg, root, id) } {
                        Ok(()) => true,
                        Err(CacheError::OutOfTocMemory) if attempt == 0 => false,
                        Err(e) => return Err(e),
                    }
                };
                if inserted {
                    break;
                }
                self.grow_toc(ipc, owner, TOC_GROW_BYTES)?;
            }
        }
        Ok(())
    }

    fn release_tiles_impl(
        &self,
        entry_hash: u64,
        local_indices: &[usize],
        cache_ids: &[TileId],
    ) -> Result<()> {
        let sync = self.sync.read();
        let ipc = sync.data();
        let bkt = bucket_index(entry_hash);

        let removed = {
            let _toc = self.ensure_toc_mapped(ipc, bkt)?;
            let st = self.buckets[bkt].storage.read();
            let seg = unsafe { bucket::segment_of(&st) };
            let root = unsafe { bucket::root_of(&seg) };
            let _data = ipc.buckets[bkt].data_lock.write(self.timeout())?;
            let _state = unsafe { BucketStateGuard::enter(bkt, root) }?;
            if let Some(entry_off) = unsafe { map::lookup(&seg, root, entry_hash) } {
                unsafe {
                    let entry = seg.get::<EntryRecord>(entry_off);
                    let removed = bucket::entry_tiles_remove_indices(&seg, entry, local_indices);
                    (*root).size = (*root)
                        .size
                        .saturating_sub(removed.len() as u64 * TILE_BYTES as u64);
                    removed
                }
            } else {
                // Entry already gone; fall back to the caller's identifiers.
                cache_ids.to_vec()
            }
        };

        self.return_tiles_to_owners(ipc, &removed, false)
    }

    /// Wipe every bucket and reset the tile pool to one empty file.
    fn wipe_all(&self, ipc: &CacheIpcData) -> Result<()> {
        log::warn!("wiping cache");
        for bkt in 0..BUCKET_COUNT {
            let bsync = &ipc.buckets[bkt];
            let _toc = bsync.toc_lock.write(self.timeout())?;
            let mut st = self.buckets[bkt].storage.write();
            unsafe {
                self.with_sole_mapping(bsync, &mut st, |st| {
                    bucket::format_bucket_storage(st).map_err(CacheError::Io)
                })?;
            }
            self.buckets[bkt].local_payloads.lock().clear();
        }

        if self.tile_storage {
            let _pool = ipc.tile_pool.lock.write(self.timeout())?;
            let mut files = self.tile_files.write();
            for storage in files.drain(..) {
                if let Storage::File(f) = storage {
                    let _ = f.remove();
                }
            }
            let generation = unsafe {
                let p = pool_raw(&ipc.tile_pool);
                (*p).generation += 1;
                (*p).n_files = 0;
                (*p).generation
            };
            self.tile_generation.store(generation, Ordering::Relaxed);
            self.create_tile_file_locked(ipc, &mut files)?;
        }
        Ok(())
    }

    pub(crate) fn request_eviction(&self) {
        let mut state = self.evictor.state.lock();
        state.pending = true;
        self.evictor.cond.notify_all();
    }

    /// Route an internal signal to recovery and hand back a neutral result.
    pub(crate) fn run_recovering<'a, T>(
        &'a self,
        default: T,
        f: impl FnOnce(&'a CacheInner) -> Result<T>,
    ) -> T {
        match f(self) {
            Ok(v) => v,
            Err(CacheError::Aborted) => default,
            Err(CacheError::SerializationFailed) => default,
            Err(CacheError::Busy) => default,
            Err(CacheError::Io(e)) => {
                log::warn!("cache operation failed: {e}");
                default
            }
            Err(e) => {
                log::warn!("cache inconsistency detected ({e}); recovering");
                self.recover_from_inconsistent_state();
                default
            }
        }
    }

    /// Rebuild the shared synchronization region (robust mode) and wipe the
    /// cache. Concurrent threads that also hit a timeout wait for the first
    /// one to finish.
    pub(crate) fn recover_from_inconsistent_state(&self) {
        {
            let mut gate = self.recovery_gate.lock();
            if gate.active {
                while gate.active {
                    self.recovery_cond.wait(&mut gate);
                }
                return;
            }
            gate.active = true;
        }

        if let Err(e) = self.recover_inner() {
            log::error!("cache recovery failed: {e}");
        }

        let mut gate = self.recovery_gate.lock();
        gate.active = false;
        self.recovery_cond.notify_all();
    }

    fn recover_inner(&self) -> Result<()> {
        if self.robust {
            self.rebuild_shared_region()?;
        }
        let sync = self.sync.read();
        self.wipe_all(sync.data())
    }

    /// The rebuild rendezvous: every attached process unmaps the shared
    /// segment, one of them recreates it, and everybody remaps before any
    /// lock is touched again.
    fn rebuild_shared_region(&self) -> Result<()> {
        let name = self.shared_name.as_ref().expect("robust mode has a name");
        let sem_valid = self.sem_valid.as_ref().expect("robust mode has semaphores");
        let sem_invalid = self.sem_invalid.as_ref().expect("robust mode has semaphores");
        let file_lock = self.file_lock.as_ref().expect("robust mode holds the lock");

        log::warn!("rebuilding shared synchronization region {name}");

        // Exclude every other thread of this process, then drop the
        // presumed-poisoned mapping.
        let mut sync = self.sync.write();
        *sync = SyncRegion::Detached;

        // Announce that we are inside the invalid zone.
        sem_invalid.post()?;

        // Wait until every live process reaches the rendezvous: once each
        // one has released its shared hold, the exclusive acquisition
        // succeeds.
        file_lock.unlock()?;
        file_lock.lock_exclusive()?;

        if !sem_valid.try_wait() {
            // First rebuilder: recreate the segment from scratch.
            SyncRegion::remove(name);
        }
        *sync = SyncRegion::open_or_create(name)?;

        // Announce our valid mapping, cancel our invalid announcement.
        sem_valid.post()?;
        sem_invalid.wait()?;

        // Back to the attachment-lifetime shared hold.
        file_lock.unlock()?;
        file_lock.lock_shared()?;

        // Spin until every participant has left the invalid zone, putting
        // back the tokens we consume while checking.
        while sem_invalid.try_wait() {
            sem_invalid.post()?;
            std::thread::sleep(Duration::from_millis(1));
        }

        // Our ToC mappings survived the rebuild; re-register them in the
        // fresh region.
        let ipc = sync.data();
        for bkt in 0..BUCKET_COUNT {
            let bsync = &ipc.buckets[bkt];
            let _g = bsync.toc_mapping.guard.lock(self.timeout())?;
            unsafe {
                (*mapping_raw(&bsync.toc_mapping)).n_mapped += 1;
            }
        }
        Ok(())
    }
}

impl Drop for CacheInner {
    fn drop(&mut self) {
        // Withdraw this process from the mapped-process counters so a
        // grower in another process does not wait for a ghost.
        if self.persistent && !self.buckets.is_empty() {
            let sync = self.sync.read();
            if matches!(&*sync, SyncRegion::Detached) {
                return;
            }
            let ipc = sync.data();
            for bkt in 0..BUCKET_COUNT {
                let bsync = &ipc.buckets[bkt];
                if let Ok(_g) = bsync.toc_mapping.guard.lock(Some(Duration::from_millis(100))) {
                    unsafe {
                        let m = mapping_raw(&bsync.toc_mapping);
                        if (*m).n_mapped > 0 {
                            (*m).n_mapped -= 1;
                        }
                    }
                    bsync.toc_mapping.unmapped.notify_one();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::CacheEntry;
    use crate::error::Result;
    use crate::tiles;

    /// A payload of patterned bytes, enough to exercise serialization,
    /// canaries, and size accounting.
    struct BlobEntry {
        hash: u64,
        plugin: String,
        size: usize,
        payload: Mutex<Vec<u8>>,
    }

    impl BlobEntry {
        fn computed(hash: u64, size: usize) -> Arc<Self> {
            Arc::new(BlobEntry {
                hash,
                plugin: "net.test.blob".into(),
                size,
                payload: Mutex::new(vec![hash as u8; size]),
            })
        }

        fn template(hash: u64, size: usize) -> Arc<Self> {
            Arc::new(BlobEntry {
                hash,
                plugin: "net.test.blob".into(),
                size,
                payload: Mutex::new(Vec::new()),
            })
        }
    }

    impl CacheEntry for BlobEntry {
        fn hash(&self) -> u64 {
            self.hash
        }

        fn metadata_size(&self) -> usize {
            self.size
        }

        fn plugin_id(&self) -> &str {
            &self.plugin
        }

        fn serialize(&self, props: &mut PropertyMap) -> Result<()> {
            props.set_u64("id", self.hash);
            props.set_bytes("payload", &self.payload.lock());
            Ok(())
        }

        fn deserialize(&self, props: &PropertyMap, _has_write_rights: bool) -> DeserializeStatus {
            if props.get_u64("id") != Some(self.hash) {
                return DeserializeStatus::Failed;
            }
            match props.get_bytes("payload") {
                Some(bytes) => {
                    *self.payload.lock() = bytes.to_vec();
                    DeserializeStatus::Ok
                }
                None => DeserializeStatus::Failed,
            }
        }
    }

    fn in_memory(maximum: u64) -> Cache {
        Cache::open(
            CacheConfig::in_memory()
                .with_maximum_size(maximum)
                .with_tile_storage(false),
        )
        .unwrap()
    }

    /// Hash whose bucket is `bucket` with low bits `low`.
    fn hash_in_bucket(bucket: u8, low: u64) -> u64 {
        ((bucket as u64) << 56) | (low & 0x00ff_ffff_ffff_ffff)
    }

    #[test]
    fn insert_then_hit_with_size_accounting() {
        let cache = in_memory(1024);
        let hash = hash_in_bucket(0x11, 1);

        let mut locker = cache.get(BlobEntry::computed(hash, 128) as CacheEntryPtr);
        assert_eq!(locker.status(), EntryStatus::MustCompute);
        locker.insert();

        assert_eq!(cache.current_size(), 128);
        assert!(cache.has(hash));

        let template = BlobEntry::template(hash, 128);
        let locker = cache.get(template.clone() as CacheEntryPtr);
        assert_eq!(locker.status(), EntryStatus::Cached);
        // The resolved payload carries the cached bytes.
        let resolved = locker.entry();
        assert_eq!(resolved.hash(), hash);
    }

    #[test]
    fn dropping_uncommitted_locker_releases_placeholder() {
        let cache = in_memory(1 << 20);
        let hash = hash_in_bucket(0x22, 9);
        {
            let locker = cache.get(BlobEntry::computed(hash, 64) as CacheEntryPtr);
            assert_eq!(locker.status(), EntryStatus::MustCompute);
            // Dropped without insert.
        }
        assert!(!cache.has(hash));
        let locker = cache.get(BlobEntry::computed(hash, 64) as CacheEntryPtr);
        assert_eq!(locker.status(), EntryStatus::MustCompute);
    }

    #[test]
    fn remove_forgets_an_entry() {
        let cache = in_memory(1 << 20);
        let hash = hash_in_bucket(0x33, 5);
        let mut locker = cache.get(BlobEntry::computed(hash, 100) as CacheEntryPtr);
        locker.insert();
        assert!(cache.has(hash));
        cache.remove(hash);
        assert!(!cache.has(hash));
        assert_eq!(cache.current_size(), 0);
    }

    #[test]
    fn clear_is_idempotent() {
        let cache = in_memory(1 << 20);
        for i in 0..4u64 {
            let mut locker =
                cache.get(BlobEntry::computed(hash_in_bucket(i as u8, i), 50) as CacheEntryPtr);
            locker.insert();
        }
        assert_eq!(cache.current_size(), 200);
        cache.clear();
        assert_eq!(cache.current_size(), 0);
        cache.clear();
        assert_eq!(cache.current_size(), 0);
        assert!(!cache.has(hash_in_bucket(0, 0)));
    }

    #[test]
    fn lru_eviction_keeps_most_recent() {
        let cache = in_memory(500);
        let hashes: Vec<u64> = (1..=10).map(|i| hash_in_bucket(0x44, i)).collect();
        for &h in &hashes {
            let mut locker = cache.get(BlobEntry::computed(h, 100) as CacheEntryPtr);
            assert_eq!(locker.status(), EntryStatus::MustCompute);
            locker.insert();
        }
        cache.evict_lru(0);
        assert!(cache.current_size() <= 500);
        for &h in &hashes[5..] {
            assert!(cache.has(h), "recent entry {h:x} evicted");
        }
        for &h in &hashes[..5] {
            assert!(!cache.has(h), "old entry {h:x} survived");
        }
    }

    #[test]
    fn eviction_is_a_noop_without_a_maximum() {
        let cache = in_memory(0);
        let mut locker =
            cache.get(BlobEntry::computed(hash_in_bucket(1, 1), 100) as CacheEntryPtr);
        locker.insert();
        cache.evict_lru(1 << 40);
        assert_eq!(cache.current_size(), 100);
    }

    #[test]
    fn oversized_entry_grows_the_toc() {
        let cache = in_memory(64 << 20);
        let hash = hash_in_bucket(0x55, 3);
        // Larger than the initial 512 KiB ToC segment.
        let size = TOC_GROW_BYTES + TOC_GROW_BYTES / 2;
        let mut locker = cache.get(BlobEntry::computed(hash, size) as CacheEntryPtr);
        assert_eq!(locker.status(), EntryStatus::MustCompute);
        locker.insert();

        let bkt = bucket_index(hash);
        assert!(cache.inner.buckets[bkt].storage.read().len() > TOC_GROW_BYTES);
        assert_eq!(cache.current_size(), size as u64);

        let template = BlobEntry::template(hash, size);
        let locker = cache.get(template.clone() as CacheEntryPtr);
        assert_eq!(locker.status(), EntryStatus::Cached);
        assert_eq!(template.payload.lock().len(), size);
    }

    #[test]
    fn memory_stats_group_by_plugin() {
        let cache = in_memory(1 << 20);
        for i in 0..3u64 {
            let mut locker =
                cache.get(BlobEntry::computed(hash_in_bucket(0x66, i), 100) as CacheEntryPtr);
            locker.insert();
        }
        let stats = cache.memory_stats();
        let blob = stats.get("net.test.blob").unwrap();
        assert_eq!(blob.count, 3);
        assert_eq!(blob.bytes, 300);
    }

    #[test]
    fn persistent_entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = || {
            CacheConfig::persistent(dir.path())
                .with_maximum_size(1 << 20)
                .with_tile_storage(false)
        };
        let hash = hash_in_bucket(0x77, 42);
        {
            let cache = Cache::open(config()).unwrap();
            let mut locker = cache.get(BlobEntry::computed(hash, 256) as CacheEntryPtr);
            assert_eq!(locker.status(), EntryStatus::MustCompute);
            locker.insert();
            cache.flush(false);
        }
        let cache = Cache::open(config()).unwrap();
        assert!(cache.has(hash));
        assert_eq!(cache.current_size(), 256);
        let template = BlobEntry::template(hash, 256);
        let locker = cache.get(template.clone() as CacheEntryPtr);
        assert_eq!(locker.status(), EntryStatus::Cached);
        assert_eq!(&*template.payload.lock(), &vec![hash as u8; 256]);
    }

    #[test]
    fn second_process_attachment_is_busy_when_not_robust() {
        let dir = tempfile::tempdir().unwrap();
        let config = || {
            CacheConfig::persistent(dir.path())
                .with_maximum_size(1 << 20)
                .with_tile_storage(false)
        };
        let _first = Cache::open(config()).unwrap();
        match Cache::open(config()) {
            Err(CacheError::Busy) => {}
            other => panic!("expected Busy, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn tiles_spread_across_buckets_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(
            CacheConfig::persistent(dir.path()).with_maximum_size(16 << 30),
        )
        .unwrap();

        let entry_hash = hash_in_bucket(0x00, 77);
        let entry = BlobEntry::computed(entry_hash, 64);
        let mut locker = cache.get(entry.clone() as CacheEntryPtr);
        assert_eq!(locker.status(), EntryStatus::MustCompute);
        locker.insert();

        let free_len = |bkt: usize| -> usize {
            let inner = &cache.inner;
            let sync = inner.sync.read();
            let ipc = sync.data();
            let _toc = inner.ensure_toc_mapped(ipc, bkt).unwrap();
            let st = inner.buckets[bkt].storage.read();
            let seg = unsafe { bucket::segment_of(&st) };
            let root = unsafe { bucket::root_of(&seg) };
            let _d = ipc.buckets[bkt].data_lock.read(None).unwrap();
            unsafe { bucket::free_tiles_slice(&seg, root).len() }
        };

        let t = TILES_PER_BUCKET_PER_FILE;
        assert_eq!(free_len(0x05), t);
        assert_eq!(free_len(0x07), t);

        // 2T+1 tiles: T+1 into bucket 0x05 (forcing a second tile file) and
        // T into bucket 0x07.
        let mut alloc_hashes: Vec<u64> = Vec::new();
        for i in 0..(t + 1) as u64 {
            // entry_hash + tile_hash must land in bucket 0x05.
            alloc_hashes.push(hash_in_bucket(0x05, i).wrapping_sub(entry_hash));
        }
        for i in 0..t as u64 {
            alloc_hashes.push(hash_in_bucket(0x07, i).wrapping_sub(entry_hash));
        }

        let ids = {
            let mut lock = cache
                .retrieve_and_lock_tiles(&(entry.clone() as CacheEntryPtr), &[], &alloc_hashes)
                .expect("allocation failed");
            assert_eq!(lock.allocated_count(), 2 * t + 1);
            // Write into the first allocated tile to prove the pointer maps.
            lock.allocated_tile_mut(0).fill(0xcd);
            lock.allocated_ids()
        };

        let files: std::collections::BTreeSet<u32> =
            ids.iter().map(|&id| tiles::file_index_of(id)).collect();
        let buckets: std::collections::BTreeSet<usize> =
            ids.iter().map(|&id| tiles::owner_bucket_of(id)).collect();
        assert!(files.len() >= 2, "expected two tile files, got {files:?}");
        assert_eq!(buckets, [0x05usize, 0x07].into_iter().collect());

        // Accounting includes the tile bytes.
        assert_eq!(
            cache.current_size(),
            64 + ids.len() as u64 * TILE_BYTES as u64
        );

        // Destroying the entry returns every tile to its owning bucket:
        // both partitions now span the two files completely.
        cache.remove(entry_hash);
        assert_eq!(free_len(0x05), 2 * t);
        assert_eq!(free_len(0x07), 2 * t);
        assert_eq!(cache.current_size(), 0);

        // Read-back of a released identifier is still address-valid.
        assert!(cache.check_tile_index(ids[0]));
    }

    #[test]
    fn abandoned_lock_triggers_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(
            CacheConfig::persistent(dir.path())
                .with_maximum_size(1 << 20)
                .with_tile_storage(false)
                .with_robust_interprocess(true)
                .with_lock_timeout(Duration::from_millis(200)),
        )
        .unwrap();

        let hash = hash_in_bucket(0x99, 13);
        let mut locker = cache.get(BlobEntry::computed(hash, 100) as CacheEntryPtr);
        locker.insert();
        assert!(cache.has(hash));

        // Simulate a crashed process: write-lock the bucket without ever
        // releasing (no guard is created).
        {
            let sync = cache.inner.sync.read();
            let ipc = sync.data();
            assert!(ipc.buckets[bucket_index(hash)].data_lock.try_write());
        }

        // The next lookup times out, runs the rebuild protocol, wipes the
        // cache, and reports a computable entry.
        let start = std::time::Instant::now();
        let locker = cache.get(BlobEntry::template(hash, 100) as CacheEntryPtr);
        assert_eq!(locker.status(), EntryStatus::MustCompute);
        assert!(start.elapsed() < Duration::from_secs(5));
        drop(locker);

        assert_eq!(cache.current_size(), 0);
        assert!(!cache.has(hash));

        // The rebuilt cache is fully functional.
        let mut locker = cache.get(BlobEntry::computed(hash, 100) as CacheEntryPtr);
        assert_eq!(locker.status(), EntryStatus::MustCompute);
        locker.insert();
        assert!(cache.has(hash));
    }

    #[test]
    fn serialization_canary_rejects_mismatched_payload() {
        struct LyingEntry {
            hash: u64,
        }
        impl CacheEntry for LyingEntry {
            fn hash(&self) -> u64 {
                self.hash
            }
            fn metadata_size(&self) -> usize {
                16
            }
            fn plugin_id(&self) -> &str {
                "net.test.liar"
            }
            fn serialize(&self, props: &mut PropertyMap) -> Result<()> {
                props.set_u64("x", 1);
                Ok(())
            }
            fn deserialize(&self, _props: &PropertyMap, _w: bool) -> DeserializeStatus {
                DeserializeStatus::Failed
            }
        }

        let cache = in_memory(1 << 20);
        // Non-persistent caches do not deserialize, so run this against the
        // persistent path instead.
        drop(cache);
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(
            CacheConfig::persistent(dir.path())
                .with_maximum_size(1 << 20)
                .with_tile_storage(false),
        )
        .unwrap();

        let hash = hash_in_bucket(0xaa, 4);
        let mut locker = cache.get(Arc::new(LyingEntry { hash }) as CacheEntryPtr);
        locker.insert();
        assert!(cache.has(hash));

        // A template that refuses to deserialize sees MustCompute and the
        // bad entry is dropped from the cache.
        let locker = cache.get(Arc::new(LyingEntry { hash }) as CacheEntryPtr);
        assert_eq!(locker.status(), EntryStatus::MustCompute);
        drop(locker);
        assert!(!cache.has(hash));
    }
}
