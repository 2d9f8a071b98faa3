//! Advisory lock over the cache directory.
//!
//! A `flock` on `<dir>/Lock` marks an attachment. Robust mode holds it
//! shared for the lifetime of the attachment and upgrades to exclusive
//! during a shared-region rebuild; non-robust persistent mode takes it
//! exclusive so a second process falls back to a process-local cache.

use std::fs;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;

pub const LOCK_FILE_NAME: &str = "Lock";

pub struct FileLock {
    file: fs::File,
}

impl FileLock {
    pub fn open_or_create(dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(LOCK_FILE_NAME))?;
        Ok(FileLock { file })
    }

    fn flock(&self, op: libc::c_int) -> io::Result<()> {
        let ret = unsafe { libc::flock(self.file.as_raw_fd(), op) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Blocking shared acquisition. Converts an exclusive hold in place.
    pub fn lock_shared(&self) -> io::Result<()> {
        self.flock(libc::LOCK_SH)
    }

    /// Blocking exclusive acquisition. Converts a shared hold in place.
    pub fn lock_exclusive(&self) -> io::Result<()> {
        self.flock(libc::LOCK_EX)
    }

    /// Returns false when another process holds the lock.
    pub fn try_lock_exclusive(&self) -> io::Result<bool> {
        match self.flock(libc::LOCK_EX | libc::LOCK_NB) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn unlock(&self) -> io::Result<()> {
        self.flock(libc::LOCK_UN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusive_lock_is_reentrant_per_fd_but_visible() {
        let dir = tempfile::tempdir().unwrap();
        let a = FileLock::open_or_create(dir.path()).unwrap();
        assert!(a.try_lock_exclusive().unwrap());

        // A second descriptor in the same process behaves like another
        // process for flock purposes.
        let b = FileLock::open_or_create(dir.path()).unwrap();
        assert!(!b.try_lock_exclusive().unwrap());

        a.unlock().unwrap();
        assert!(b.try_lock_exclusive().unwrap());
    }

    #[test]
    fn shared_then_upgrade() {
        let dir = tempfile::tempdir().unwrap();
        let a = FileLock::open_or_create(dir.path()).unwrap();
        a.lock_shared().unwrap();
        let b = FileLock::open_or_create(dir.path()).unwrap();
        b.lock_shared().unwrap();
        // Upgrade blocks while another shared holder exists.
        assert!(!a.try_lock_exclusive().unwrap());
        b.unlock().unwrap();
        assert!(a.try_lock_exclusive().unwrap());
    }
}
