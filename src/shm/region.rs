//! The shared synchronization segment.
//!
//! In persistent mode this is a named memory-mapped file under the system
//! shm directory holding one [`CacheIpcData`]; every process attached to the
//! same cache directory maps the same file. In non-persistent mode the
//! identical record is allocated on the process heap, so the rest of the
//! cache is oblivious to the difference.
//!
//! Creation races between processes are serialized with an exclusive flock
//! on the segment file itself while it is being initialized.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use super::layout::{CacheIpcData, IPC_SEGMENT_BYTES};
use crate::storage::page_size;

/// Where the segment files live.
fn shm_dir() -> PathBuf {
    if cfg!(target_os = "linux") {
        PathBuf::from("/dev/shm")
    } else {
        std::env::temp_dir()
    }
}

/// Stable per-cache-directory name for the segment and the semaphores.
pub fn shared_name_for(cache_dir: &Path) -> String {
    let canonical = cache_dir
        .canonicalize()
        .unwrap_or_else(|_| cache_dir.to_path_buf());
    let mut hasher = DefaultHasher::new();
    canonical.hash(&mut hasher);
    format!("rendercache-{:016x}", hasher.finish())
}

pub enum SyncRegion {
    Shm { mmap: MmapMut, path: PathBuf },
    Local { data: *mut CacheIpcData },
    /// Transient state during a robust-mode rebuild: the old mapping is
    /// gone and the new one is not created yet. No cache operation runs
    /// while a region is detached (the rebuilder holds the process-local
    /// write lock over the region).
    Detached,
}

// The contained pointers address process-shared pthread objects; access is
// coordinated by those objects themselves.
unsafe impl Send for SyncRegion {}
unsafe impl Sync for SyncRegion {}

impl SyncRegion {
    fn segment_len() -> usize {
        let page = page_size();
        IPC_SEGMENT_BYTES.div_ceil(page) * page
    }

    /// Map (creating and initializing if needed) the named segment.
    pub fn open_or_create(name: &str) -> io::Result<Self> {
        let path = shm_dir().join(name);
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        // Serialize initialization against other attaching processes.
        let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }

        let len = Self::segment_len();
        let needs_init = (file.metadata()?.len() as usize) < len;
        if needs_init {
            file.set_len(len as u64)?;
        }
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        let data = mmap.as_mut_ptr() as *mut CacheIpcData;
        if needs_init || !unsafe { (*data).is_initialized() } {
            log::debug!("initializing shared synchronization segment {path:?}");
            mmap.fill(0);
            unsafe { CacheIpcData::init(data)? };
        }
        unsafe {
            libc::flock(file.as_raw_fd(), libc::LOCK_UN);
        }
        Ok(SyncRegion::Shm { mmap, path })
    }

    /// Remove the named segment file so the next attach recreates it.
    pub fn remove(name: &str) {
        let _ = fs::remove_file(shm_dir().join(name));
    }

    /// Allocate the record on the heap (non-persistent mode).
    pub fn local() -> io::Result<Self> {
        let layout = Layout::new::<CacheIpcData>();
        let data = unsafe { alloc_zeroed(layout) } as *mut CacheIpcData;
        if data.is_null() {
            return Err(io::Error::new(io::ErrorKind::OutOfMemory, "alloc failed"));
        }
        unsafe { CacheIpcData::init(data)? };
        Ok(SyncRegion::Local { data })
    }

    pub fn data(&self) -> &CacheIpcData {
        match self {
            SyncRegion::Shm { mmap, .. } => unsafe { &*(mmap.as_ptr() as *const CacheIpcData) },
            SyncRegion::Local { data } => unsafe { &**data },
            SyncRegion::Detached => unreachable!("synchronization region used while detached"),
        }
    }
}

impl Drop for SyncRegion {
    fn drop(&mut self) {
        if let SyncRegion::Local { data } = self {
            unsafe { dealloc(*data as *mut u8, Layout::new::<CacheIpcData>()) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_region_initializes() {
        let region = SyncRegion::local().unwrap();
        assert!(region.data().is_initialized());
        // Locks must be functional right away.
        let g = region.data().buckets[0].data_lock.read(None).unwrap();
        drop(g);
    }

    #[test]
    fn shm_region_round_trips_between_handles() {
        let name = format!("rendercache-test-region-{}", std::process::id());
        let a = SyncRegion::open_or_create(&name).unwrap();
        assert!(a.data().is_initialized());
        // A second attach sees the already-initialized region.
        let b = SyncRegion::open_or_create(&name).unwrap();
        assert!(b.data().is_initialized());
        let g = a.data().buckets[3].data_lock.write(None).unwrap();
        assert!(!b.data().buckets[3].data_lock.try_write());
        drop(g);
        assert!(b.data().buckets[3].data_lock.try_write());
        SyncRegion::remove(&name);
    }

    #[test]
    fn names_are_stable_per_directory() {
        let dir = tempfile::tempdir().unwrap();
        let a = shared_name_for(dir.path());
        let b = shared_name_for(dir.path());
        assert_eq!(a, b);
        let other = tempfile::tempdir().unwrap();
        assert_ne!(a, shared_name_for(other.path()));
    }
}
