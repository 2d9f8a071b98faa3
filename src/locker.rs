//! The per-lookup handshake object.
//!
//! [`crate::Cache::get`] returns a [`CacheEntryLocker`] describing how the
//! caller relates to the entry for its hash:
//!
//! - [`EntryStatus::Cached`] — the entry was found and deserialized into the
//!   template; nothing left to do.
//! - [`EntryStatus::MustCompute`] — this locker claimed a Pending
//!   placeholder; the caller computes the payload and calls
//!   [`CacheEntryLocker::insert`]. Dropping the locker first destroys the
//!   placeholder so other waiters do not wait forever.
//! - [`EntryStatus::ComputationPending`] — another thread owns the Pending
//!   placeholder; poll with [`CacheEntryLocker::wait_for_pending`].
//!
//! Waiting polls the lookup with exponential backoff instead of blocking on
//! an interprocess condition tied to the entry record: the record's memory
//! can be invalidated by a ToC remap while a waiter sleeps, and polling
//! keeps ToC locks short.

use std::sync::Arc;
use std::time::Duration;

use crate::cache::CacheInner;
use crate::entry::CacheEntryPtr;

/// Observable state of a locker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Cached,
    MustCompute,
    ComputationPending,
}

/// Initial sleep of the pending-entry poll loop.
pub(crate) const WAIT_POLL_INITIAL: Duration = Duration::from_millis(20);
/// Backoff multiplier between polls.
pub(crate) const WAIT_POLL_BACKOFF: f64 = 1.2;

pub struct CacheEntryLocker {
    pub(crate) inner: Arc<CacheInner>,
    pub(crate) template: CacheEntryPtr,
    /// The entry the caller should read: the template itself in persistent
    /// mode, or the stored process-local payload on a non-persistent hit.
    pub(crate) resolved: CacheEntryPtr,
    pub(crate) hash: u64,
    pub(crate) bucket_index: usize,
    pub(crate) status: EntryStatus,
}

impl CacheEntryLocker {
    pub fn status(&self) -> EntryStatus {
        self.status
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    /// The payload object carrying the cached data after a hit.
    pub fn entry(&self) -> &CacheEntryPtr {
        &self.resolved
    }

    /// Publish the computed payload. Valid only in `MustCompute`; a no-op
    /// (reported as success) when the cache was wiped underneath us.
    pub fn insert(&mut self) {
        if self.status != EntryStatus::MustCompute {
            return;
        }
        let inner = Arc::clone(&self.inner);
        inner.run_recovering((), |i| {
            i.locker_insert(&self.template, self.hash, self.bucket_index)
        });
        self.status = EntryStatus::Cached;
        self.inner.request_eviction();
    }

    /// Poll until the producing thread publishes, the timeout elapses, or
    /// the placeholder disappears.
    ///
    /// With a timeout, once it elapses the lookup takes the entry over and
    /// this returns [`EntryStatus::MustCompute`]; `None` polls forever
    /// (until the entry resolves one way or the other).
    pub fn wait_for_pending(&mut self, timeout: Option<Duration>) -> EntryStatus {
        let mut sleep = WAIT_POLL_INITIAL;
        let mut spent = Duration::ZERO;
        while self.status == EntryStatus::ComputationPending {
            std::thread::sleep(sleep);
            spent += sleep;
            sleep = Duration::from_secs_f64(sleep.as_secs_f64() * WAIT_POLL_BACKOFF);
            self.run_lookup(spent, timeout);
        }
        self.status
    }

    pub(crate) fn run_lookup(&mut self, time_spent: Duration, timeout: Option<Duration>) {
        let inner = Arc::clone(&self.inner);
        let (status, resolved) = inner.run_recovering(
            (EntryStatus::MustCompute, self.template.clone()),
            |i| i.locker_lookup(&self.template, self.hash, self.bucket_index, time_spent, timeout),
        );
        self.status = status;
        self.resolved = resolved;
    }
}

impl Drop for CacheEntryLocker {
    fn drop(&mut self) {
        // An uncommitted MustCompute locker owns a Pending placeholder that
        // would starve every waiter; destroy it.
        if self.status == EntryStatus::MustCompute {
            let inner = Arc::clone(&self.inner);
            inner.run_recovering((), |i| i.locker_abandon(self.hash, self.bucket_index));
        }
    }
}
