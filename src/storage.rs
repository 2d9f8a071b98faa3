//! Storage backends for ToC segments and tile files.
//!
//! Two backends behind one enum: [`MemoryFile`] maps a file with mmap and is
//! shared across processes, [`RamBuffer`] is a process-local buffer with the
//! same surface. Structured data inside a storage is always reached through
//! raw pointers and relative offsets, so a remap (or a `Vec` reallocation)
//! never invalidates anything that has been written.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

/// How to flush a mapped range back to (or away from) the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Synchronous write-back of dirty pages.
    Sync,
    /// Schedule write-back, return immediately.
    Async,
    /// Invalidate cached pages so dead data is never written to disk.
    Invalidate,
}

/// A memory-mapped file.
pub struct MemoryFile {
    path: PathBuf,
    file: fs::File,
    mmap: Option<MmapMut>,
}

impl MemoryFile {
    /// Open `path`, creating it when absent, and ensure it is at least
    /// `min_len` bytes long. The whole file is mapped.
    pub fn open_or_create(path: &Path, min_len: usize) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len() as usize;
        if len < min_len {
            file.set_len(min_len as u64)?;
        }
        let mut storage = MemoryFile {
            path: path.to_path_buf(),
            file,
            mmap: None,
        };
        storage.map()?;
        Ok(storage)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.mmap.as_ref().map_or(0, |m| m.len())
    }

    pub fn ptr(&self) -> *mut u8 {
        self.mmap
            .as_ref()
            .map_or(std::ptr::null_mut(), |m| m.as_ptr() as *mut u8)
    }

    /// Drop the mapping. The file stays open; [`MemoryFile::map`] restores it.
    pub fn unmap(&mut self) {
        self.mmap = None;
    }

    /// (Re-)map the whole file at its current on-disk length.
    pub fn map(&mut self) -> io::Result<()> {
        // Safety: the file is owned for the lifetime of the mapping; all
        // cross-process access is coordinated by the cache lock protocol.
        self.mmap = Some(unsafe { MmapMut::map_mut(&self.file)? });
        Ok(())
    }

    /// Resize the backing file and remap.
    ///
    /// With `preserve` the existing prefix survives (pending writes are
    /// flushed first). Without it the file is truncated to zero before being
    /// extended, discarding the previous contents.
    pub fn resize(&mut self, new_len: usize, preserve: bool) -> io::Result<()> {
        if preserve {
            if let Some(m) = &self.mmap {
                m.flush()?;
            }
        }
        self.mmap = None;
        if !preserve {
            self.file.set_len(0)?;
        }
        self.file.set_len(new_len as u64)?;
        self.map()
    }

    pub fn flush_range(&self, mode: FlushMode, offset: usize, len: usize) -> io::Result<()> {
        let Some(m) = &self.mmap else {
            return Ok(());
        };
        if len == 0 || offset >= m.len() {
            return Ok(());
        }
        let len = len.min(m.len() - offset);
        match mode {
            FlushMode::Sync => m.flush_range(offset, len),
            FlushMode::Async => m.flush_async_range(offset, len),
            FlushMode::Invalidate => {
                // msync(MS_INVALIDATE) wants a page-aligned address.
                let page = page_size();
                let start = offset - (offset % page);
                let length = len + (offset - start);
                let ret = unsafe {
                    libc::msync(
                        m.as_ptr().add(start) as *mut libc::c_void,
                        length,
                        libc::MS_INVALIDATE,
                    )
                };
                if ret != 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            }
        }
    }

    /// Unmap and delete the backing file.
    pub fn remove(mut self) -> io::Result<()> {
        self.mmap = None;
        fs::remove_file(&self.path)
    }
}

pub fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// A process-local resizable buffer with the [`MemoryFile`] surface.
///
/// Backed by `u64` words so the base pointer satisfies the alignment of every
/// `#[repr(C)]` record stored inside.
pub struct RamBuffer {
    words: Vec<u64>,
    len: usize,
}

impl RamBuffer {
    pub fn new(len: usize) -> Self {
        RamBuffer {
            words: vec![0; len.div_ceil(8)],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn ptr(&self) -> *mut u8 {
        self.words.as_ptr() as *mut u8
    }

    pub fn resize(&mut self, new_len: usize, preserve: bool) {
        if !preserve {
            self.words.clear();
        }
        self.words.resize(new_len.div_ceil(8), 0);
        if !preserve {
            self.words.fill(0);
        }
        self.len = new_len;
    }
}

/// A uniform handle over the two backends.
pub enum Storage {
    File(MemoryFile),
    Ram(RamBuffer),
}

impl Storage {
    pub fn len(&self) -> usize {
        match self {
            Storage::File(f) => f.len(),
            Storage::Ram(r) => r.len(),
        }
    }

    pub fn ptr(&self) -> *mut u8 {
        match self {
            Storage::File(f) => f.ptr(),
            Storage::Ram(r) => r.ptr(),
        }
    }

    #[allow(dead_code)]
    pub fn path(&self) -> Option<&Path> {
        match self {
            Storage::File(f) => Some(f.path()),
            Storage::Ram(_) => None,
        }
    }

    pub fn resize(&mut self, new_len: usize, preserve: bool) -> io::Result<()> {
        match self {
            Storage::File(f) => f.resize(new_len, preserve),
            Storage::Ram(r) => {
                r.resize(new_len, preserve);
                Ok(())
            }
        }
    }

    /// Zero the storage at its current length, discarding the contents.
    pub fn clear(&mut self) -> io::Result<()> {
        let len = self.len();
        self.resize(len, false)
    }

    pub fn flush_range(&self, mode: FlushMode, offset: usize, len: usize) -> io::Result<()> {
        match self {
            Storage::File(f) => f.flush_range(mode, offset, len),
            Storage::Ram(_) => Ok(()),
        }
    }

    pub fn flush_all(&self, mode: FlushMode) -> io::Result<()> {
        self.flush_range(mode, 0, self.len())
    }

    /// Growth-protocol hook: drop the mapping without touching the file.
    pub fn unmap(&mut self) {
        if let Storage::File(f) = self {
            f.unmap();
        }
    }

    /// Growth-protocol hook: restore a mapping dropped by [`Storage::unmap`].
    pub fn map(&mut self) -> io::Result<()> {
        match self {
            Storage::File(f) => f.map(),
            Storage::Ram(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_resize_preserving_keeps_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage");
        let mut s = MemoryFile::open_or_create(&path, 4096).unwrap();
        unsafe {
            std::ptr::write_bytes(s.ptr(), 0xab, 16);
        }
        s.resize(8192, true).unwrap();
        assert_eq!(s.len(), 8192);
        let byte = unsafe { *s.ptr().add(15) };
        assert_eq!(byte, 0xab);
    }

    #[test]
    fn file_resize_destructive_zeroes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage");
        let mut s = MemoryFile::open_or_create(&path, 4096).unwrap();
        unsafe {
            std::ptr::write_bytes(s.ptr(), 0xab, 16);
        }
        s.resize(4096, false).unwrap();
        let byte = unsafe { *s.ptr() };
        assert_eq!(byte, 0);
    }

    #[test]
    fn reopen_sees_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage");
        {
            let s = MemoryFile::open_or_create(&path, 4096).unwrap();
            unsafe {
                std::ptr::write_bytes(s.ptr(), 0x17, 8);
            }
            s.flush_range(FlushMode::Sync, 0, 8).unwrap();
        }
        let s = MemoryFile::open_or_create(&path, 4096).unwrap();
        let byte = unsafe { *s.ptr().add(7) };
        assert_eq!(byte, 0x17);
    }

    #[test]
    fn ram_buffer_is_aligned_and_resizable() {
        let mut r = RamBuffer::new(100);
        assert_eq!(r.ptr() as usize % 8, 0);
        unsafe {
            std::ptr::write_bytes(r.ptr(), 0xff, 100);
        }
        r.resize(200, true);
        assert_eq!(unsafe { *r.ptr().add(99) }, 0xff);
        r.resize(50, false);
        assert_eq!(unsafe { *r.ptr() }, 0);
    }
}
