//! Multi-process, crash-tolerant, sharded LRU cache for compositing
//! pipelines.
//!
//! The cache stores the expensive byproducts of image-processing nodes —
//! metadata entries plus fixed-size pixel tiles — addressed by a 64-bit
//! content hash. In persistent mode everything lives in memory-mapped files
//! under one cache directory, shared by every process that attaches to it
//! and surviving restarts; in non-persistent mode the same structure runs
//! over process-local buffers.
//!
//! The hash space is split into 256 buckets, each with its own mapped
//! table-of-contents file, hash map, LRU list, and share of the tile pool.
//! Concurrent computation of one entry is coordinated by the
//! [`CacheEntryLocker`] handshake returned from [`Cache::get`]; robust mode
//! adds timed interprocess locks and a recovery protocol that rebuilds the
//! shared synchronization region when a lock holder dies.

mod bucket;
mod cache;
mod entry;
mod error;
mod locker;
mod segment;
mod shm;
mod storage;
mod tiles;

use std::time::Duration;

pub use cache::{Cache, CacheConfig, PluginMemoryStats, TilesLock};
pub use entry::{CacheEntry, CacheEntryPtr, DeserializeStatus, PropertyMap, PropertyValue};
pub use error::{CacheError, Result};
pub use locker::{CacheEntryLocker, EntryStatus};
pub use storage::FlushMode;
pub use tiles::{
    file_index_of, make_tile_id, owner_bucket_of, tile_index_of, tile_size_px, TileBitDepth,
    TileId,
};

/// Number of shards; a power of 16 so a bucket is named by hex digits.
pub const BUCKET_COUNT: usize = 256;
/// Hex digits in a bucket directory name.
pub const BUCKET_DIGITS: usize = 2;
/// Unit by which bucket ToC files grow.
pub const TOC_GROW_BYTES: usize = 512 * 1024;
/// Bytes per pixel tile.
pub const TILE_BYTES: usize = 16384;
/// Tile slots owned by one bucket in each tile file.
pub const TILES_PER_BUCKET_PER_FILE: usize = 256;
/// Tile slots per tile file.
pub const TILES_PER_FILE: usize = BUCKET_COUNT * TILES_PER_BUCKET_PER_FILE;
/// Size of one tile file (1 GiB).
pub const TILE_FILE_BYTES: usize = TILE_BYTES * TILES_PER_FILE;
/// Budget for one interprocess lock acquisition in robust mode; exceeding
/// it presumes the holder dead and triggers recovery.
pub const INTERPROCESS_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Bucket selected by the two top hex digits of the hash.
pub fn bucket_index(hash: u64) -> usize {
    (hash >> 56) as usize & (BUCKET_COUNT - 1)
}

/// Directory name of a bucket under the cache directory.
pub fn bucket_dir_name(index: usize) -> String {
    format!("{index:02x}")
}
