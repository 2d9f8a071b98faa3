//! Intrusive LRU list threaded through entry records.
//!
//! The node is embedded in [`EntryRecord`]: `lru_prev`/`lru_next` hold
//! payload offsets of neighboring entries (0 = end of list), and the
//! record's `hash` field doubles as the reverse lookup for eviction. The
//! list front is the eviction victim; the back is the most recent access.
//!
//! All functions assume the bucket LRU mutex is held.

use super::{BucketData, EntryRecord};
use crate::segment::Segment;

unsafe fn entry(seg: &Segment, off: u64) -> *mut EntryRecord {
    seg.get::<EntryRecord>(off)
}

/// Detach an entry from the list, fixing up the endpoints.
///
/// # Safety
/// `off` must be a linked entry (or an unlinked one with zeroed links, in
/// which case this is a no-op unless it is the sole front/back).
pub unsafe fn unlink(seg: &Segment, root: *mut BucketData, off: u64) {
    let e = entry(seg, off);
    let prev = (*e).lru_prev;
    let next = (*e).lru_next;

    if prev != 0 {
        (*entry(seg, prev)).lru_next = next;
    } else if (*root).lru_front == off {
        (*root).lru_front = next;
    }
    if next != 0 {
        (*entry(seg, next)).lru_prev = prev;
    } else if (*root).lru_back == off {
        (*root).lru_back = prev;
    }
    (*e).lru_prev = 0;
    (*e).lru_next = 0;
}

/// Append an unlinked entry at the most-recent end.
///
/// # Safety
/// `off` must not already be linked.
pub unsafe fn push_back(seg: &Segment, root: *mut BucketData, off: u64) {
    let e = entry(seg, off);
    (*e).lru_prev = (*root).lru_back;
    (*e).lru_next = 0;
    if (*root).lru_back != 0 {
        (*entry(seg, (*root).lru_back)).lru_next = off;
    } else {
        (*root).lru_front = off;
    }
    (*root).lru_back = off;
}

/// Touch an entry: move it to the most-recent end unless it is there
/// already.
///
/// # Safety
/// `off` must be a linked entry.
pub unsafe fn move_to_back(seg: &Segment, root: *mut BucketData, off: u64) {
    if (*root).lru_back == off {
        return;
    }
    unlink(seg, root, off);
    push_back(seg, root, off);
}

/// Walk the list front to back, collecting entry offsets.
///
/// # Safety
/// The list must be consistent; caller holds the LRU mutex.
pub unsafe fn collect(seg: &Segment, root: *const BucketData) -> Vec<u64> {
    let mut out = Vec::new();
    let mut cur = (*root).lru_front;
    while cur != 0 {
        out.push(cur);
        cur = (*entry(seg, cur)).lru_next;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::{format_bucket_storage, root_of, segment_of};
    use crate::storage::{RamBuffer, Storage};
    use crate::TOC_GROW_BYTES;

    unsafe fn new_entry(seg: &Segment, hash: u64) -> u64 {
        let off = seg.alloc(std::mem::size_of::<EntryRecord>()).unwrap();
        let e = seg.get::<EntryRecord>(off);
        std::ptr::write_bytes(e, 0, 1);
        (*e).hash = hash;
        off
    }

    fn with_list(f: impl FnOnce(&Segment, *mut BucketData)) {
        let mut storage = Storage::Ram(RamBuffer::new(TOC_GROW_BYTES));
        unsafe {
            format_bucket_storage(&mut storage).unwrap();
            let seg = segment_of(&storage);
            let root = root_of(&seg);
            f(&seg, root);
        }
    }

    #[test]
    fn push_back_orders_front_to_back() {
        with_list(|seg, root| unsafe {
            let a = new_entry(seg, 1);
            let b = new_entry(seg, 2);
            let c = new_entry(seg, 3);
            push_back(seg, root, a);
            push_back(seg, root, b);
            push_back(seg, root, c);
            assert_eq!(collect(seg, root), vec![a, b, c]);
            assert_eq!((*root).lru_front, a);
            assert_eq!((*root).lru_back, c);
        });
    }

    #[test]
    fn unlink_middle_and_endpoints() {
        with_list(|seg, root| unsafe {
            let a = new_entry(seg, 1);
            let b = new_entry(seg, 2);
            let c = new_entry(seg, 3);
            for off in [a, b, c] {
                push_back(seg, root, off);
            }
            unlink(seg, root, b);
            assert_eq!(collect(seg, root), vec![a, c]);
            unlink(seg, root, a);
            assert_eq!(collect(seg, root), vec![c]);
            unlink(seg, root, c);
            assert_eq!(collect(seg, root), Vec::<u64>::new());
            assert_eq!((*root).lru_front, 0);
            assert_eq!((*root).lru_back, 0);
        });
    }

    #[test]
    fn move_to_back_promotes() {
        with_list(|seg, root| unsafe {
            let a = new_entry(seg, 1);
            let b = new_entry(seg, 2);
            let c = new_entry(seg, 3);
            for off in [a, b, c] {
                push_back(seg, root, off);
            }
            move_to_back(seg, root, a);
            assert_eq!(collect(seg, root), vec![b, c, a]);
            // Promoting the back is a no-op.
            move_to_back(seg, root, a);
            assert_eq!(collect(seg, root), vec![b, c, a]);
        });
    }

    #[test]
    fn reverse_links_stay_symmetric() {
        with_list(|seg, root| unsafe {
            let offs: Vec<u64> = (0..10).map(|i| new_entry(seg, i)).collect();
            for &off in &offs {
                push_back(seg, root, off);
            }
            move_to_back(seg, root, offs[4]);
            move_to_back(seg, root, offs[0]);
            unlink(seg, root, offs[7]);

            // Forward walk then backward walk must agree.
            let forward = collect(seg, root);
            let mut backward = Vec::new();
            let mut cur = (*root).lru_back;
            while cur != 0 {
                backward.push(cur);
                cur = (*seg.get::<EntryRecord>(cur)).lru_prev;
            }
            backward.reverse();
            assert_eq!(forward, backward);
            assert_eq!(forward.len(), 9);
        });
    }
}
