use thiserror::Error;

/// Internal signals and construction-time failures.
///
/// The lock/corruption signals (`AbandonedLock`, `BucketInconsistent`) never
/// escape the cache facade: they are caught at the public API boundary and
/// routed to the recovery path. `Busy` and `Io` can only surface from
/// [`crate::Cache::open`].
#[derive(Debug, Error)]
pub enum CacheError {
    /// A timed interprocess lock acquisition exceeded its budget. The holder
    /// is presumed dead and the shared state must be rebuilt.
    #[error("interprocess lock timed out after {0:?}, holder presumed dead")]
    AbandonedLock(std::time::Duration),

    /// A write path entered a bucket whose state flag was still
    /// `Inconsistent`: a previous mutation never completed.
    #[error("bucket {0:02x} left in an inconsistent state")]
    BucketInconsistent(usize),

    /// The bucket ToC segment allocator ran out of memory. The caller grows
    /// the ToC and retries at most once.
    #[error("bucket table-of-contents segment out of memory")]
    OutOfTocMemory,

    /// An entry payload could not be read back faithfully (bad canary, type
    /// mismatch, truncated blob). The entry is removed from the cache.
    #[error("cache entry failed to round-trip through its serialized form")]
    SerializationFailed,

    /// The surrounding operation was cancelled; propagated without recovery.
    #[error("operation aborted")]
    Aborted,

    /// Non-robust persistent mode only: the cache directory is exclusively
    /// locked by another process.
    #[error("cache directory locked by another process")]
    Busy,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CacheError>;
