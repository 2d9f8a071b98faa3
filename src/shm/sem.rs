//! Named POSIX semaphores used by the shared-region rebuild protocol.
//!
//! Two semaphores coordinate the rebuild: a "valid" semaphore counting
//! processes that hold a valid mapping of the rebuilt region, and an
//! "invalid" semaphore counting processes that have unmapped and are inside
//! the rebuild rendezvous.

use std::ffi::CString;
use std::io;

pub struct NamedSemaphore {
    sem: *mut libc::sem_t,
    name: CString,
}

// sem_t handles are usable from any thread of the opening process.
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

impl NamedSemaphore {
    /// Open the semaphore, creating it with `initial` when absent. `name`
    /// must start with a slash and contain no further slashes.
    pub fn open_or_create(name: &str, initial: u32) -> io::Result<Self> {
        let cname = CString::new(name).map_err(|_| io::ErrorKind::InvalidInput)?;
        let sem = unsafe {
            libc::sem_open(
                cname.as_ptr(),
                libc::O_CREAT,
                0o644 as libc::mode_t,
                initial,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(NamedSemaphore { sem, name: cname })
    }

    pub fn post(&self) -> io::Result<()> {
        let ret = unsafe { libc::sem_post(self.sem) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Block until the semaphore can be decremented.
    pub fn wait(&self) -> io::Result<()> {
        loop {
            let ret = unsafe { libc::sem_wait(self.sem) };
            if ret == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    /// Decrement without blocking. Returns false when the count was zero.
    pub fn try_wait(&self) -> bool {
        unsafe { libc::sem_trywait(self.sem) == 0 }
    }

    /// Remove the name from the system. Existing handles stay usable.
    pub fn unlink(&self) {
        unsafe {
            libc::sem_unlink(self.name.as_ptr());
        }
    }

    /// Remove a semaphore by name without opening it. Used by the sole
    /// surviving process to reset rendezvous state at attach time.
    pub fn remove(name: &str) {
        if let Ok(cname) = CString::new(name) {
            unsafe {
                libc::sem_unlink(cname.as_ptr());
            }
        }
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        unsafe {
            libc::sem_close(self.sem);
        }
    }
}
