//! One shard of the cache.
//!
//! A bucket owns a ToC storage managed as a [`Segment`] heap. At the
//! segment's root sits [`BucketData`]: the hash→entry map, the LRU list
//! endpoints, the free-tile set, the format version, the accounting size,
//! and the consistency state flag. Entry records, the map table, tile-id
//! arrays, and serialized property blobs are segment allocations linked by
//! relative offsets.
//!
//! Locking is the caller's job (the facade holds the shm locks); functions
//! here are `unsafe` raw-offset manipulations in the style of the rest of
//! the shared-memory code.

pub mod lru;
pub mod map;

use hashlink::LinkedHashMap;
use parking_lot::{Mutex, RwLock};

use crate::entry::CacheEntryPtr;
use crate::error::{CacheError, Result};
use crate::segment::Segment;
use crate::storage::Storage;
use crate::{TILES_PER_BUCKET_PER_FILE, TOC_GROW_BYTES};

/// Bumped when the ToC layout changes; a mismatching bucket is wiped.
pub const TOC_FORMAT_VERSION: u32 = 1;
/// Version word carried by every entry record.
pub const ENTRY_FORMAT_VERSION: u32 = 1;

pub const STATE_OK: u32 = 0;
pub const STATE_INCONSISTENT: u32 = 1;

pub const STATUS_NULL: u32 = 0;
pub const STATUS_PENDING: u32 = 1;
pub const STATUS_READY: u32 = 2;

const PLUGIN_ID_BYTES: usize = 60;

/// Root record of a bucket ToC segment.
#[repr(C)]
pub struct BucketData {
    pub version: u32,
    pub state: u32,
    /// Σ entry.size over Ready entries, plus tile bytes held by entries.
    pub size: u64,
    pub map_off: u64,
    pub map_cap: u64,
    pub map_len: u64,
    pub lru_front: u64,
    pub lru_back: u64,
    pub free_tiles_off: u64,
    pub free_tiles_len: u64,
    pub free_tiles_cap: u64,
}

/// Per-hash record living in the ToC segment.
///
/// The LRU node is embedded (`lru_prev`/`lru_next`/`hash`) so linking an
/// entry costs no extra allocation. An entry enters the LRU list when it
/// becomes Ready; Pending placeholders are only reachable through the map.
#[repr(C)]
pub struct EntryRecord {
    pub version: u32,
    pub status: u32,
    pub hash: u64,
    /// Thread token of the computing thread; 0 when nobody owns the
    /// computation. Meaningless outside the owning process.
    pub compute_owner: u64,
    /// Serialized metadata size in bytes, excluding tile bytes.
    pub size: u64,
    pub lru_prev: u64,
    pub lru_next: u64,
    pub tiles_off: u64,
    pub tiles_len: u64,
    pub tiles_cap: u64,
    pub props_off: u64,
    pub props_len: u64,
    pub plugin_id_len: u32,
    pub plugin_id: [u8; PLUGIN_ID_BYTES],
}

impl EntryRecord {
    pub fn plugin_id(&self) -> &str {
        let len = (self.plugin_id_len as usize).min(PLUGIN_ID_BYTES);
        std::str::from_utf8(&self.plugin_id[..len]).unwrap_or("")
    }

    pub fn set_plugin_id(&mut self, id: &str) {
        let bytes = id.as_bytes();
        let len = bytes.len().min(PLUGIN_ID_BYTES);
        self.plugin_id[..len].copy_from_slice(&bytes[..len]);
        self.plugin_id_len = len as u32;
    }
}

/// Process-local half of one bucket.
pub struct Bucket {
    pub index: usize,
    /// The ToC storage. The outer lock only disciplines threads of this
    /// process; cross-process exclusion comes from the shm ToC lock.
    pub storage: RwLock<Storage>,
    /// Non-persistent payloads, keyed by hash, in LRU order. Persistent
    /// caches leave this empty.
    pub local_payloads: Mutex<LinkedHashMap<u64, CacheEntryPtr>>,
}

impl Bucket {
    pub fn new(index: usize, storage: Storage) -> Self {
        Bucket {
            index,
            storage: RwLock::new(storage),
            local_payloads: Mutex::new(LinkedHashMap::new()),
        }
    }
}

/// Attach to the segment inside a bucket storage.
///
/// # Safety
/// The storage must be mapped and formatted (see [`init_bucket_storage`]).
pub unsafe fn segment_of(storage: &Storage) -> Segment {
    Segment::attach(storage.ptr(), storage.len()).expect("bucket ToC segment lost its format")
}

/// Root record pointer of an attached segment.
///
/// # Safety
/// The segment's root must have been constructed.
pub unsafe fn root_of(seg: &Segment) -> *mut BucketData {
    let off = seg.root_off();
    debug_assert_ne!(off, 0, "bucket root not constructed");
    seg.get::<BucketData>(off)
}

/// Format a fresh segment inside `storage` and construct an empty root.
///
/// # Safety
/// No other thread or process may be using the storage.
pub unsafe fn format_bucket_storage(storage: &mut Storage) -> std::io::Result<()> {
    if storage.len() < TOC_GROW_BYTES {
        storage.resize(TOC_GROW_BYTES, false)?;
    } else {
        storage.clear()?;
    }
    let seg = Segment::format(storage.ptr(), storage.len());
    construct_root(&seg).expect("fresh ToC segment cannot be out of memory");
    Ok(())
}

/// Open a bucket storage: attach if the format and version line up, wipe and
/// re-create otherwise. Returns true when the bucket was wiped.
///
/// # Safety
/// Caller holds the bucket ToC lock exclusively.
pub unsafe fn init_bucket_storage(storage: &mut Storage) -> std::io::Result<bool> {
    if let Some(seg) = Segment::attach(storage.ptr(), storage.len()) {
        let root_off = seg.root_off();
        if root_off != 0 {
            let root = seg.get::<BucketData>(root_off);
            if (*root).version == TOC_FORMAT_VERSION {
                // Segment may have grown beyond what this process last saw.
                return Ok(false);
            }
            log::warn!(
                "bucket ToC format version {} != {}, wiping",
                (*root).version,
                TOC_FORMAT_VERSION
            );
        }
    }
    format_bucket_storage(storage)?;
    Ok(true)
}

unsafe fn construct_root(seg: &Segment) -> Result<()> {
    let root_off = seg.alloc(std::mem::size_of::<BucketData>())?;
    let root = seg.get::<BucketData>(root_off);
    std::ptr::write_bytes(root, 0, 1);
    (*root).version = TOC_FORMAT_VERSION;
    (*root).state = STATE_OK;
    let (map_off, map_cap) = map::create(seg)?;
    (*root).map_off = map_off;
    (*root).map_cap = map_cap;
    let free_cap = TILES_PER_BUCKET_PER_FILE as u64;
    (*root).free_tiles_off = seg.alloc(free_cap as usize * 8)?;
    (*root).free_tiles_cap = free_cap;
    seg.set_root_off(root_off);
    Ok(())
}

/// RAII guard implementing the corruption tripwire: a write path finding the
/// bucket already `Inconsistent` means a previous mutation never finished.
pub struct BucketStateGuard {
    root: *mut BucketData,
}

impl BucketStateGuard {
    /// # Safety
    /// `root` must be valid for the guard's lifetime and the caller must
    /// hold the bucket data lock exclusively.
    pub unsafe fn enter(bucket_index: usize, root: *mut BucketData) -> Result<Self> {
        if (*root).state != STATE_OK {
            return Err(CacheError::BucketInconsistent(bucket_index));
        }
        (*root).state = STATE_INCONSISTENT;
        Ok(BucketStateGuard { root })
    }
}

impl Drop for BucketStateGuard {
    fn drop(&mut self) {
        unsafe {
            (*self.root).state = STATE_OK;
        }
    }
}

// --- free-tile set: a sorted u64 array in the segment ---

/// # Safety
/// Caller holds the bucket data lock exclusively.
pub unsafe fn free_tiles_insert(seg: &Segment, root: *mut BucketData, id: u64) -> Result<()> {
    if (*root).free_tiles_len == (*root).free_tiles_cap {
        let new_cap = ((*root).free_tiles_cap * 2).max(TILES_PER_BUCKET_PER_FILE as u64);
        let new_off = seg.alloc(new_cap as usize * 8)?;
        let old = seg.get::<u64>((*root).free_tiles_off);
        let new = seg.get::<u64>(new_off);
        std::ptr::copy_nonoverlapping(old, new, (*root).free_tiles_len as usize);
        seg.dealloc((*root).free_tiles_off);
        (*root).free_tiles_off = new_off;
        (*root).free_tiles_cap = new_cap;
    }
    let len = (*root).free_tiles_len as usize;
    let arr = std::slice::from_raw_parts_mut(seg.get::<u64>((*root).free_tiles_off), len + 1);
    let pos = arr[..len].partition_point(|&x| x < id);
    arr.copy_within(pos..len, pos + 1);
    arr[pos] = id;
    (*root).free_tiles_len += 1;
    Ok(())
}

/// Pop the smallest free tile identifier.
///
/// # Safety
/// Caller holds the bucket data lock exclusively.
pub unsafe fn free_tiles_pop_min(seg: &Segment, root: *mut BucketData) -> Option<u64> {
    let len = (*root).free_tiles_len as usize;
    if len == 0 {
        return None;
    }
    let arr = std::slice::from_raw_parts_mut(seg.get::<u64>((*root).free_tiles_off), len);
    let id = arr[0];
    arr.copy_within(1..len, 0);
    (*root).free_tiles_len -= 1;
    Some(id)
}

/// # Safety
/// Caller holds the bucket data lock (shared is enough).
pub unsafe fn free_tiles_slice<'a>(seg: &Segment, root: *const BucketData) -> &'a [u64] {
    std::slice::from_raw_parts(
        seg.get::<u64>((*root).free_tiles_off),
        (*root).free_tiles_len as usize,
    )
}

// --- per-entry tile-id list ---

/// Append tile identifiers to an entry's list, growing it in the segment.
///
/// # Safety
/// Caller holds the bucket data lock exclusively.
pub unsafe fn entry_tiles_push(seg: &Segment, entry: *mut EntryRecord, ids: &[u64]) -> Result<()> {
    let need = (*entry).tiles_len + ids.len() as u64;
    if need > (*entry).tiles_cap {
        let new_cap = need.next_power_of_two().max(8);
        let new_off = seg.alloc(new_cap as usize * 8)?;
        if (*entry).tiles_off != 0 {
            let old = seg.get::<u64>((*entry).tiles_off);
            std::ptr::copy_nonoverlapping(old, seg.get::<u64>(new_off), (*entry).tiles_len as usize);
            seg.dealloc((*entry).tiles_off);
        }
        (*entry).tiles_off = new_off;
        (*entry).tiles_cap = new_cap;
    }
    let dst = seg
        .get::<u64>((*entry).tiles_off)
        .add((*entry).tiles_len as usize);
    std::ptr::copy_nonoverlapping(ids.as_ptr(), dst, ids.len());
    (*entry).tiles_len = need;
    Ok(())
}

/// # Safety
/// Caller holds the bucket data lock (shared is enough).
pub unsafe fn entry_tiles_slice<'a>(seg: &Segment, entry: *const EntryRecord) -> &'a [u64] {
    if (*entry).tiles_off == 0 {
        return &[];
    }
    std::slice::from_raw_parts(
        seg.get::<u64>((*entry).tiles_off),
        (*entry).tiles_len as usize,
    )
}

/// Remove list positions `local_indices` from an entry's tile list,
/// returning the removed identifiers in position order.
///
/// # Safety
/// Caller holds the bucket data lock exclusively.
pub unsafe fn entry_tiles_remove_indices(
    seg: &Segment,
    entry: *mut EntryRecord,
    local_indices: &[usize],
) -> Vec<u64> {
    if (*entry).tiles_off == 0 {
        return Vec::new();
    }
    let len = (*entry).tiles_len as usize;
    let arr = std::slice::from_raw_parts_mut(seg.get::<u64>((*entry).tiles_off), len);
    let mut removed = Vec::with_capacity(local_indices.len());
    let mut drop_mark = vec![false; len];
    for &i in local_indices {
        if i < len && !drop_mark[i] {
            drop_mark[i] = true;
            removed.push(arr[i]);
        }
    }
    let mut write = 0;
    for read in 0..len {
        if !drop_mark[read] {
            arr[write] = arr[read];
            write += 1;
        }
    }
    (*entry).tiles_len = write as u64;
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::RamBuffer;

    #[test]
    fn root_is_reconstructed_on_version_mismatch() {
        let mut storage = Storage::Ram(RamBuffer::new(TOC_GROW_BYTES));
        unsafe {
            assert!(init_bucket_storage(&mut storage).unwrap());
            // Second init attaches without wiping.
            assert!(!init_bucket_storage(&mut storage).unwrap());
            // Corrupt the version word.
            let seg = segment_of(&storage);
            (*root_of(&seg)).version = 999;
            assert!(init_bucket_storage(&mut storage).unwrap());
            let seg = segment_of(&storage);
            assert_eq!((*root_of(&seg)).version, TOC_FORMAT_VERSION);
        }
    }

    #[test]
    fn state_guard_trips_on_reentry() {
        let mut storage = Storage::Ram(RamBuffer::new(TOC_GROW_BYTES));
        unsafe {
            format_bucket_storage(&mut storage).unwrap();
            let seg = segment_of(&storage);
            let root = root_of(&seg);
            let guard = BucketStateGuard::enter(7, root).unwrap();
            assert!(matches!(
                BucketStateGuard::enter(7, root),
                Err(CacheError::BucketInconsistent(7))
            ));
            drop(guard);
            assert!(BucketStateGuard::enter(7, root).is_ok());
        }
    }

    #[test]
    fn free_tiles_stay_sorted_and_pop_smallest() {
        let mut storage = Storage::Ram(RamBuffer::new(TOC_GROW_BYTES));
        unsafe {
            format_bucket_storage(&mut storage).unwrap();
            let seg = segment_of(&storage);
            let root = root_of(&seg);
            for id in [50u64, 10, 30, 20, 40] {
                free_tiles_insert(&seg, root, id).unwrap();
            }
            assert_eq!(free_tiles_slice(&seg, root), &[10, 20, 30, 40, 50]);
            assert_eq!(free_tiles_pop_min(&seg, root), Some(10));
            assert_eq!(free_tiles_pop_min(&seg, root), Some(20));
            assert_eq!((*root).free_tiles_len, 3);
        }
    }

    #[test]
    fn free_tiles_grow_past_initial_capacity() {
        let mut storage = Storage::Ram(RamBuffer::new(TOC_GROW_BYTES));
        unsafe {
            format_bucket_storage(&mut storage).unwrap();
            let seg = segment_of(&storage);
            let root = root_of(&seg);
            let n = TILES_PER_BUCKET_PER_FILE as u64 * 3;
            for id in 0..n {
                free_tiles_insert(&seg, root, id).unwrap();
            }
            assert_eq!((*root).free_tiles_len, n);
            assert_eq!(free_tiles_pop_min(&seg, root), Some(0));
        }
    }

    #[test]
    fn entry_tile_list_push_and_remove() {
        let mut storage = Storage::Ram(RamBuffer::new(TOC_GROW_BYTES));
        unsafe {
            format_bucket_storage(&mut storage).unwrap();
            let seg = segment_of(&storage);
            let entry_off = seg.alloc(std::mem::size_of::<EntryRecord>()).unwrap();
            let entry = seg.get::<EntryRecord>(entry_off);
            std::ptr::write_bytes(entry, 0, 1);

            entry_tiles_push(&seg, entry, &[1, 2, 3]).unwrap();
            entry_tiles_push(&seg, entry, &[4, 5, 6, 7, 8, 9, 10, 11, 12]).unwrap();
            assert_eq!(entry_tiles_slice(&seg, entry).len(), 12);

            let removed = entry_tiles_remove_indices(&seg, entry, &[0, 2, 11]);
            assert_eq!(removed, vec![1, 3, 12]);
            assert_eq!(
                entry_tiles_slice(&seg, entry),
                &[2, 4, 5, 6, 7, 8, 9, 10, 11]
            );
        }
    }

    #[test]
    fn plugin_id_truncates_cleanly() {
        let mut e: EntryRecord = unsafe { std::mem::zeroed() };
        e.set_plugin_id("net.example.blur");
        assert_eq!(e.plugin_id(), "net.example.blur");
        let long = "x".repeat(100);
        e.set_plugin_id(&long);
        assert_eq!(e.plugin_id().len(), PLUGIN_ID_BYTES);
    }
}
