//! `#[repr(C)]` structures that live in the shared synchronization region.
//!
//! All structs use fixed-size fields and explicit padding so the layout is
//! identical across compilations and processes. The region holds nothing but
//! synchronization state: every lock, condition, and mapping-validity flag
//! of the cache, for all 256 buckets plus the tile pool. Cache data itself
//! lives in the per-bucket ToC files and the tile files.

use super::lock::{ShmCondVar, ShmMutex, ShmRwLock};
use crate::BUCKET_COUNT;

/// Magic bytes validating the region across attaches.
pub const IPC_MAGIC: u64 = u64::from_le_bytes(*b"RCIPCD01");

/// Bumped when this file changes shape; mismatch forces a rebuild.
pub const IPC_VERSION: u32 = 1;

/// Fixed size of the shared synchronization segment: generous headroom over
/// `size_of::<CacheIpcData>()`, rounded to pages by the region code.
pub const IPC_SEGMENT_BYTES: usize = 512 * 1024;

/// Mapping-validity state for one resizable mapped file, driving the growth
/// protocol: a writer that needs to resize flips `mapping_valid`, drains
/// `n_mapped` to zero, resizes, then broadcasts `remapped`.
///
/// `mapping_valid` and `n_mapped` are only touched under `guard`.
#[repr(C, align(8))]
pub struct MappingSyncData {
    pub guard: ShmMutex,
    /// Signaled by a reader after it unmapped and decremented `n_mapped`;
    /// the resizing writer waits here until the count reaches zero.
    pub unmapped: ShmCondVar,
    /// Broadcast by the writer once the file is resized and `mapping_valid`
    /// is true again; readers wait here before remapping.
    pub remapped: ShmCondVar,
    pub mapping_valid: u32,
    pub n_mapped: u32,
    _pad: [u8; 120],
}

const _: () = assert!(std::mem::size_of::<MappingSyncData>() == 512);

/// Synchronization state of one bucket.
#[repr(C, align(8))]
pub struct BucketSyncData {
    /// Guards the ToC mapping: shared to read the segment, exclusive to
    /// resize or remap it.
    pub toc_lock: ShmRwLock,
    /// Guards the bucket data structures: shared for lookups, exclusive for
    /// any map/size/free-tiles mutation.
    pub data_lock: ShmRwLock,
    /// Innermost lock, covering only the LRU list pointers.
    pub lru_mutex: ShmMutex,
    pub toc_mapping: MappingSyncData,
}

const _: () = assert!(std::mem::size_of::<BucketSyncData>() == 256 + 256 + 128 + 512);

/// Synchronization state of the tile pool.
///
/// Tile files have a fixed size and are never remapped in place, so instead
/// of the full mapping-drain protocol the pool carries a generation counter:
/// `clear()` bumps it, and attached processes reopen their file list when
/// their cached generation lags. A deleted-but-still-mapped file remains
/// readable until the straggler unmaps, which keeps stale pointers harmless.
#[repr(C, align(8))]
pub struct TilePoolSyncData {
    /// Shared while reading or writing bytes of an existing tile, exclusive
    /// to add a tile file or reset the pool.
    pub lock: ShmRwLock,
    /// Number of tile files currently in the pool.
    pub n_files: u32,
    _pad: u32,
    /// Bumped on every pool reset.
    pub generation: u64,
    _pad2: [u8; 240],
}

const _: () = assert!(std::mem::size_of::<TilePoolSyncData>() == 512);

/// Root record of the shared synchronization region.
#[repr(C, align(8))]
pub struct CacheIpcData {
    pub magic: u64,
    pub version: u32,
    _pad: u32,
    pub tile_pool: TilePoolSyncData,
    pub buckets: [BucketSyncData; BUCKET_COUNT],
}

const _: () = assert!(std::mem::size_of::<CacheIpcData>() <= IPC_SEGMENT_BYTES);

impl CacheIpcData {
    /// Initialize every primitive in a zeroed region.
    ///
    /// # Safety
    /// `this` must point to at least `IPC_SEGMENT_BYTES` of zeroed memory
    /// not yet visible to any other participant.
    pub unsafe fn init(this: *mut CacheIpcData) -> std::io::Result<()> {
        ShmRwLock::init(std::ptr::addr_of_mut!((*this).tile_pool.lock))?;
        (*this).tile_pool.n_files = 0;
        (*this).tile_pool.generation = 0;
        for i in 0..BUCKET_COUNT {
            let bucket = std::ptr::addr_of_mut!((*this).buckets[i]);
            ShmRwLock::init(std::ptr::addr_of_mut!((*bucket).toc_lock))?;
            ShmRwLock::init(std::ptr::addr_of_mut!((*bucket).data_lock))?;
            ShmMutex::init(std::ptr::addr_of_mut!((*bucket).lru_mutex))?;
            Self::init_mapping(std::ptr::addr_of_mut!((*bucket).toc_mapping))?;
        }
        (*this).version = IPC_VERSION;
        (*this).magic = IPC_MAGIC;
        Ok(())
    }

    unsafe fn init_mapping(mapping: *mut MappingSyncData) -> std::io::Result<()> {
        ShmMutex::init(std::ptr::addr_of_mut!((*mapping).guard))?;
        ShmCondVar::init(std::ptr::addr_of_mut!((*mapping).unmapped))?;
        ShmCondVar::init(std::ptr::addr_of_mut!((*mapping).remapped))?;
        (*mapping).mapping_valid = 1;
        (*mapping).n_mapped = 0;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.magic == IPC_MAGIC && self.version == IPC_VERSION
    }
}
