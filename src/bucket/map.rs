//! Hash → entry-offset map inside a bucket ToC segment.
//!
//! Open addressing with linear probing over `(hash, entry_off)` slots;
//! an `entry_off` of 0 marks an empty slot (offset 0 is the segment
//! header, never a payload). Removal uses backward-shift deletion to keep
//! the probe invariant without tombstones. The table doubles through the
//! segment allocator once it reaches 50% load, so a rehash can fail with
//! `OutOfTocMemory` like any other allocation; the caller grows the ToC
//! and retries.

use super::BucketData;
use crate::error::Result;
use crate::segment::Segment;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct MapSlot {
    pub hash: u64,
    pub entry_off: u64,
}

const SLOT_BYTES: u64 = std::mem::size_of::<MapSlot>() as u64;
const _: () = assert!(std::mem::size_of::<MapSlot>() == 16);

pub const INITIAL_CAPACITY: u64 = 64;

unsafe fn slot(seg: &Segment, table_off: u64, idx: u64) -> *mut MapSlot {
    seg.get::<MapSlot>(table_off + idx * SLOT_BYTES)
}

/// Allocate and zero a fresh table. Returns `(offset, capacity)`.
///
/// # Safety
/// Caller holds the bucket data lock exclusively.
pub unsafe fn create(seg: &Segment) -> Result<(u64, u64)> {
    let off = seg.alloc((INITIAL_CAPACITY * SLOT_BYTES) as usize)?;
    std::ptr::write_bytes(seg.ptr_at(off), 0, (INITIAL_CAPACITY * SLOT_BYTES) as usize);
    Ok((off, INITIAL_CAPACITY))
}

/// Find the entry offset stored for `hash`.
///
/// # Safety
/// Caller holds the bucket data lock (shared is enough).
pub unsafe fn lookup(seg: &Segment, root: *const BucketData, hash: u64) -> Option<u64> {
    let cap = (*root).map_cap;
    let mask = cap.wrapping_sub(1);
    let mut idx = hash & mask;
    for _ in 0..cap {
        let s = &*slot(seg, (*root).map_off, idx);
        if s.entry_off == 0 {
            return None;
        }
        if s.hash == hash {
            return Some(s.entry_off);
        }
        idx = (idx + 1) & mask;
    }
    None
}

/// Insert `hash → entry_off`, growing the table at 50% load.
///
/// # Safety
/// Caller holds the bucket data lock exclusively. `hash` must not already
/// be present.
pub unsafe fn insert(seg: &Segment, root: *mut BucketData, hash: u64, entry_off: u64) -> Result<()> {
    debug_assert_ne!(entry_off, 0);
    if ((*root).map_len + 1) * 2 > (*root).map_cap {
        grow(seg, root)?;
    }
    insert_into(seg, (*root).map_off, (*root).map_cap, hash, entry_off);
    (*root).map_len += 1;
    Ok(())
}

unsafe fn insert_into(seg: &Segment, table_off: u64, cap: u64, hash: u64, entry_off: u64) {
    let mask = cap.wrapping_sub(1);
    let mut idx = hash & mask;
    for _ in 0..cap {
        let s = &mut *slot(seg, table_off, idx);
        if s.entry_off == 0 {
            s.hash = hash;
            s.entry_off = entry_off;
            return;
        }
        idx = (idx + 1) & mask;
    }
    debug_assert!(false, "bucket map is full");
}

unsafe fn grow(seg: &Segment, root: *mut BucketData) -> Result<()> {
    let old_off = (*root).map_off;
    let old_cap = (*root).map_cap;
    let new_cap = old_cap * 2;
    let new_off = seg.alloc((new_cap * SLOT_BYTES) as usize)?;
    std::ptr::write_bytes(seg.ptr_at(new_off), 0, (new_cap * SLOT_BYTES) as usize);
    for i in 0..old_cap {
        let s = *slot(seg, old_off, i);
        if s.entry_off != 0 {
            insert_into(seg, new_off, new_cap, s.hash, s.entry_off);
        }
    }
    seg.dealloc(old_off);
    (*root).map_off = new_off;
    (*root).map_cap = new_cap;
    Ok(())
}

/// Remove `hash`, returning the entry offset it mapped to.
///
/// Backward-shift deletion: probe-chain successors whose ideal position
/// lies at or before the vacated slot move back to fill it.
///
/// # Safety
/// Caller holds the bucket data lock exclusively.
pub unsafe fn remove(seg: &Segment, root: *mut BucketData, hash: u64) -> Option<u64> {
    let cap = (*root).map_cap;
    let mask = cap.wrapping_sub(1);
    let table = (*root).map_off;

    let mut idx = hash & mask;
    let mut found = None;
    for _ in 0..cap {
        let s = &*slot(seg, table, idx);
        if s.entry_off == 0 {
            return None;
        }
        if s.hash == hash {
            found = Some((idx, s.entry_off));
            break;
        }
        idx = (idx + 1) & mask;
    }
    let (mut empty, entry_off) = found?;

    let mut j = (empty + 1) & mask;
    loop {
        let sj = *slot(seg, table, j);
        if sj.entry_off == 0 {
            break;
        }
        let ideal = sj.hash & mask;
        let should_move = if empty <= j {
            ideal <= empty || ideal > j
        } else {
            ideal <= empty && ideal > j
        };
        if should_move {
            *slot(seg, table, empty) = sj;
            empty = j;
        }
        j = (j + 1) & mask;
    }

    let s = &mut *slot(seg, table, empty);
    s.hash = 0;
    s.entry_off = 0;
    (*root).map_len -= 1;
    Some(entry_off)
}
