//! Interprocess plumbing.
//!
//! Everything that lets several processes share one cache directory lives
//! here: process-shared pthread primitives ([`lock`]), the fixed-size
//! synchronization segment holding them ([`layout`], [`region`]), the
//! directory file lock ([`file_lock`]), and the named semaphores used by the
//! robust-mode rebuild protocol ([`sem`]).

pub mod file_lock;
pub mod layout;
pub mod lock;
pub mod region;
pub mod sem;
