//! Cross-process synchronization primitives stored in shared memory.
//!
//! POSIX pthread mutexes, rwlocks, and condition variables initialized with
//! `PTHREAD_PROCESS_SHARED`, living at fixed offsets inside a mapped region
//! so every attached process addresses the same object. Each primitive
//! over-allocates its slot: pthread_rwlock_t is 56 bytes on x86_64 Linux but
//! 200 bytes on macOS arm64.
//!
//! Timed acquisition is a try-lock loop against a deadline rather than
//! `pthread_mutex_timedlock`, which does not exist everywhere. A timeout is
//! reported as [`CacheError::AbandonedLock`]: the presumption is that the
//! holder died while the lock was held.

use std::io;
use std::time::{Duration, Instant};

use crate::error::{CacheError, Result};

/// Slot sizes reserved in the shared region.
pub const RWLOCK_SLOT: usize = 256;
pub const MUTEX_SLOT: usize = 128;
pub const COND_SLOT: usize = 128;

const _: () = assert!(std::mem::size_of::<libc::pthread_rwlock_t>() <= RWLOCK_SLOT);
const _: () = assert!(std::mem::size_of::<libc::pthread_mutex_t>() <= MUTEX_SLOT);
const _: () = assert!(std::mem::size_of::<libc::pthread_cond_t>() <= COND_SLOT);

/// Pause between try-lock attempts while waiting on a timed acquisition.
const SPIN_SLEEP: Duration = Duration::from_micros(200);

fn os_err(ret: i32) -> io::Error {
    io::Error::from_raw_os_error(ret)
}

/// Spin `try_it` against `timeout`. `None` means block via `lock_it`.
fn timed_acquire(
    timeout: Option<Duration>,
    lock_it: impl Fn(),
    try_it: impl Fn() -> bool,
) -> Result<()> {
    let Some(timeout) = timeout else {
        lock_it();
        return Ok(());
    };
    // Always try once first so an immediately free lock never times out.
    if try_it() {
        return Ok(());
    }
    let start = Instant::now();
    loop {
        std::thread::sleep(SPIN_SLEEP);
        if try_it() {
            return Ok(());
        }
        if start.elapsed() >= timeout {
            return Err(CacheError::AbandonedLock(timeout));
        }
    }
}

/// A process-shared mutex inside a mapped region.
#[repr(C, align(8))]
pub struct ShmMutex {
    storage: [u8; MUTEX_SLOT],
}

impl ShmMutex {
    /// Initialize the pthread object in place.
    ///
    /// # Safety
    /// `this` must point into zeroed shared memory; call once per region
    /// lifetime, before any other process uses the lock.
    pub unsafe fn init(this: *mut ShmMutex) -> io::Result<()> {
        let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
        let ret = libc::pthread_mutexattr_init(&mut attr);
        if ret != 0 {
            return Err(os_err(ret));
        }
        let ret = libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
        if ret != 0 {
            libc::pthread_mutexattr_destroy(&mut attr);
            return Err(os_err(ret));
        }
        let ret = libc::pthread_mutex_init((*this).raw(), &attr);
        libc::pthread_mutexattr_destroy(&mut attr);
        if ret != 0 {
            return Err(os_err(ret));
        }
        Ok(())
    }

    fn raw(&self) -> *mut libc::pthread_mutex_t {
        self.storage.as_ptr() as *mut libc::pthread_mutex_t
    }

    pub fn try_lock(&self) -> bool {
        unsafe { libc::pthread_mutex_trylock(self.raw()) == 0 }
    }

    pub fn lock(&self, timeout: Option<Duration>) -> Result<ShmMutexGuard<'_>> {
        timed_acquire(
            timeout,
            || unsafe {
                let ret = libc::pthread_mutex_lock(self.raw());
                debug_assert_eq!(ret, 0, "pthread_mutex_lock failed: {ret}");
            },
            || self.try_lock(),
        )?;
        Ok(ShmMutexGuard { mutex: self })
    }

    unsafe fn unlock(&self) {
        let ret = libc::pthread_mutex_unlock(self.raw());
        debug_assert_eq!(ret, 0, "pthread_mutex_unlock failed: {ret}");
    }
}

pub struct ShmMutexGuard<'a> {
    mutex: &'a ShmMutex,
}

impl Drop for ShmMutexGuard<'_> {
    fn drop(&mut self) {
        unsafe { self.mutex.unlock() };
    }
}

/// A process-shared condition variable paired with [`ShmMutex`].
#[repr(C, align(8))]
pub struct ShmCondVar {
    storage: [u8; COND_SLOT],
}

impl ShmCondVar {
    /// # Safety
    /// Same contract as [`ShmMutex::init`].
    pub unsafe fn init(this: *mut ShmCondVar) -> io::Result<()> {
        let mut attr: libc::pthread_condattr_t = std::mem::zeroed();
        let ret = libc::pthread_condattr_init(&mut attr);
        if ret != 0 {
            return Err(os_err(ret));
        }
        let ret = libc::pthread_condattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
        if ret != 0 {
            libc::pthread_condattr_destroy(&mut attr);
            return Err(os_err(ret));
        }
        let ret = libc::pthread_cond_init((*this).raw(), &attr);
        libc::pthread_condattr_destroy(&mut attr);
        if ret != 0 {
            return Err(os_err(ret));
        }
        Ok(())
    }

    fn raw(&self) -> *mut libc::pthread_cond_t {
        self.storage.as_ptr() as *mut libc::pthread_cond_t
    }

    /// Atomically release the guard's mutex and sleep until notified.
    pub fn wait(&self, guard: &mut ShmMutexGuard<'_>) {
        unsafe {
            let ret = libc::pthread_cond_wait(self.raw(), guard.mutex.raw());
            debug_assert_eq!(ret, 0, "pthread_cond_wait failed: {ret}");
        }
    }

    /// Like [`ShmCondVar::wait`] but bounded. Returns false on timeout.
    pub fn timed_wait(&self, guard: &mut ShmMutexGuard<'_>, timeout: Duration) -> bool {
        let mut now = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        unsafe {
            libc::clock_gettime(libc::CLOCK_REALTIME, &mut now);
        }
        let nsec = now.tv_nsec as i64 + timeout.subsec_nanos() as i64;
        let deadline = libc::timespec {
            tv_sec: now.tv_sec + timeout.as_secs() as libc::time_t + (nsec / 1_000_000_000) as libc::time_t,
            tv_nsec: (nsec % 1_000_000_000) as _,
        };
        let ret =
            unsafe { libc::pthread_cond_timedwait(self.raw(), guard.mutex.raw(), &deadline) };
        ret != libc::ETIMEDOUT
    }

    pub fn notify_one(&self) {
        unsafe {
            libc::pthread_cond_signal(self.raw());
        }
    }

    pub fn notify_all(&self) {
        unsafe {
            libc::pthread_cond_broadcast(self.raw());
        }
    }
}

/// A process-shared read-write lock inside a mapped region.
#[repr(C, align(8))]
#[derive(Debug)]
pub struct ShmRwLock {
    storage: [u8; RWLOCK_SLOT],
}

impl ShmRwLock {
    /// # Safety
    /// Same contract as [`ShmMutex::init`].
    pub unsafe fn init(this: *mut ShmRwLock) -> io::Result<()> {
        let mut attr: libc::pthread_rwlockattr_t = std::mem::zeroed();
        let ret = libc::pthread_rwlockattr_init(&mut attr);
        if ret != 0 {
            return Err(os_err(ret));
        }
        let ret = libc::pthread_rwlockattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
        if ret != 0 {
            libc::pthread_rwlockattr_destroy(&mut attr);
            return Err(os_err(ret));
        }
        let ret = libc::pthread_rwlock_init((*this).raw(), &attr);
        libc::pthread_rwlockattr_destroy(&mut attr);
        if ret != 0 {
            return Err(os_err(ret));
        }
        Ok(())
    }

    fn raw(&self) -> *mut libc::pthread_rwlock_t {
        self.storage.as_ptr() as *mut libc::pthread_rwlock_t
    }

    pub fn try_read(&self) -> bool {
        unsafe { libc::pthread_rwlock_tryrdlock(self.raw()) == 0 }
    }

    pub fn try_write(&self) -> bool {
        unsafe { libc::pthread_rwlock_trywrlock(self.raw()) == 0 }
    }

    /// Shared acquisition; `timeout` of `None` blocks.
    pub fn read(&self, timeout: Option<Duration>) -> Result<ShmReadGuard<'_>> {
        timed_acquire(
            timeout,
            || unsafe {
                let ret = libc::pthread_rwlock_rdlock(self.raw());
                debug_assert_eq!(ret, 0, "pthread_rwlock_rdlock failed: {ret}");
            },
            || self.try_read(),
        )?;
        Ok(ShmReadGuard { lock: self })
    }

    /// Exclusive acquisition; `timeout` of `None` blocks.
    pub fn write(&self, timeout: Option<Duration>) -> Result<ShmWriteGuard<'_>> {
        timed_acquire(
            timeout,
            || unsafe {
                let ret = libc::pthread_rwlock_wrlock(self.raw());
                debug_assert_eq!(ret, 0, "pthread_rwlock_wrlock failed: {ret}");
            },
            || self.try_write(),
        )?;
        Ok(ShmWriteGuard { lock: self })
    }

    unsafe fn unlock(&self) {
        let ret = libc::pthread_rwlock_unlock(self.raw());
        debug_assert_eq!(ret, 0, "pthread_rwlock_unlock failed: {ret}");
    }

    /// Release a hold whose guard was deliberately forgotten (the tile-lock
    /// handle keeps the pool lock as a raw pointer to avoid a
    /// self-referential struct).
    ///
    /// # Safety
    /// The calling thread must hold the lock with no live guard for it.
    pub(crate) unsafe fn force_unlock(&self) {
        self.unlock();
    }
}

pub struct ShmReadGuard<'a> {
    lock: &'a ShmRwLock,
}

impl Drop for ShmReadGuard<'_> {
    fn drop(&mut self) {
        unsafe { self.lock.unlock() };
    }
}

#[derive(Debug)]
pub struct ShmWriteGuard<'a> {
    lock: &'a ShmRwLock,
}

impl Drop for ShmWriteGuard<'_> {
    fn drop(&mut self) {
        unsafe { self.lock.unlock() };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn boxed_mutex() -> Box<ShmMutex> {
        let m: Box<ShmMutex> = Box::new(unsafe { std::mem::zeroed() });
        unsafe { ShmMutex::init(&*m as *const _ as *mut ShmMutex).unwrap() };
        m
    }

    fn boxed_rwlock() -> Box<ShmRwLock> {
        let l: Box<ShmRwLock> = Box::new(unsafe { std::mem::zeroed() });
        unsafe { ShmRwLock::init(&*l as *const _ as *mut ShmRwLock).unwrap() };
        l
    }

    #[test]
    fn mutex_excludes() {
        let m = boxed_mutex();
        let g = m.lock(None).unwrap();
        assert!(!m.try_lock());
        drop(g);
        assert!(m.try_lock());
        unsafe { m.unlock() };
    }

    #[test]
    fn rwlock_shared_then_exclusive() {
        let l = boxed_rwlock();
        let r1 = l.read(None).unwrap();
        let r2 = l.read(None).unwrap();
        assert!(!l.try_write());
        drop(r1);
        drop(r2);
        let w = l.write(None).unwrap();
        assert!(!l.try_read());
        drop(w);
    }

    #[test]
    fn timed_write_acquisition_times_out() {
        let l = boxed_rwlock();
        let _r = l.read(None).unwrap();
        let err = l.write(Some(Duration::from_millis(50))).unwrap_err();
        assert!(matches!(err, CacheError::AbandonedLock(_)));
    }

    #[test]
    fn timed_acquisition_succeeds_when_free() {
        let l = boxed_rwlock();
        let g = l.write(Some(Duration::from_millis(50)));
        assert!(g.is_ok());
    }

    #[test]
    fn condvar_wakes_waiter() {
        struct Shared {
            mutex: ShmMutex,
            cond: ShmCondVar,
        }
        let shared: Arc<Shared> = Arc::new(unsafe { std::mem::zeroed() });
        unsafe {
            ShmMutex::init(&shared.mutex as *const _ as *mut ShmMutex).unwrap();
            ShmCondVar::init(&shared.cond as *const _ as *mut ShmCondVar).unwrap();
        }
        let flag = Arc::new(AtomicU32::new(0));

        let s2 = Arc::clone(&shared);
        let f2 = Arc::clone(&flag);
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            let _g = s2.mutex.lock(None).unwrap();
            f2.store(1, Ordering::SeqCst);
            s2.cond.notify_all();
        });

        let mut g = shared.mutex.lock(None).unwrap();
        while flag.load(Ordering::SeqCst) == 0 {
            assert!(shared.cond.timed_wait(&mut g, Duration::from_secs(5)));
        }
        drop(g);
        t.join().unwrap();
    }
}
