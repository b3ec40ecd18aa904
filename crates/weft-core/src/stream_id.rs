//! Stream id allocation.
//!
//! Clients allocate odd ids starting at 1, servers even ids starting at 2,
//! so both sides can open streams without coordination. Ids are 31 bits;
//! allocation wraps around, skipping 0 and any id still registered.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::frame::STREAM_ID_MASK;

/// Allocates stream ids for one side of a connection.
///
/// The counter is 64-bit so the pre-mask value keeps growing monotonically;
/// `is_before_or_current` can then distinguish "already issued" from "never
/// issued" even after the 31-bit id space wraps.
pub struct StreamIdAllocator {
    // Holds the NEXT id to hand out (pre-mask).
    next: AtomicU64,
    parity: u64,
}

impl StreamIdAllocator {
    /// Odd ids: 1, 3, 5, ...
    pub fn client() -> Self {
        Self {
            next: AtomicU64::new(1),
            parity: 1,
        }
    }

    /// Even ids: 2, 4, 6, ...
    pub fn server() -> Self {
        Self {
            next: AtomicU64::new(2),
            parity: 0,
        }
    }

    /// Allocate the next id not currently in use.
    ///
    /// `in_use` is consulted after masking to 31 bits; ids that collide
    /// with a live stream are skipped, as is the reserved id 0 on
    /// wraparound.
    pub fn next(&self, mut in_use: impl FnMut(u32) -> bool) -> u32 {
        loop {
            let raw = self.next.fetch_add(2, Ordering::AcqRel);
            let id = (raw & STREAM_ID_MASK as u64) as u32;
            if id == 0 || in_use(id) {
                continue;
            }
            return id;
        }
    }

    /// True if `id` has our parity and was already issued.
    ///
    /// Used to tell a late frame for a finished local stream apart from a
    /// frame for an id that was never allocated at all.
    pub fn is_before_or_current(&self, id: u32) -> bool {
        if id == 0 || (id as u64 & 1) != self.parity {
            return false;
        }
        let next = self.next.load(Ordering::Acquire);
        (id as u64) < next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_client_allocates_odd() {
        let alloc = StreamIdAllocator::client();
        let ids: Vec<u32> = (0..4).map(|_| alloc.next(|_| false)).collect();
        assert_eq!(ids, vec![1, 3, 5, 7]);
    }

    #[test]
    fn test_server_allocates_even() {
        let alloc = StreamIdAllocator::server();
        let ids: Vec<u32> = (0..4).map(|_| alloc.next(|_| false)).collect();
        assert_eq!(ids, vec![2, 4, 6, 8]);
    }

    #[test]
    fn test_skips_live_ids() {
        let alloc = StreamIdAllocator::client();
        let live: HashSet<u32> = [5, 9].into_iter().collect();
        let ids: Vec<u32> = (0..3).map(|_| alloc.next(|id| live.contains(&id))).collect();
        assert_eq!(ids, vec![1, 3, 7]);
    }

    #[test]
    fn test_is_before_or_current() {
        let alloc = StreamIdAllocator::client();
        assert!(!alloc.is_before_or_current(1));
        let id = alloc.next(|_| false);
        assert_eq!(id, 1);
        assert!(alloc.is_before_or_current(1));
        assert!(!alloc.is_before_or_current(3));
        // Wrong parity is never ours.
        assert!(!alloc.is_before_or_current(2));
        assert!(!alloc.is_before_or_current(0));
    }

    #[test]
    fn test_concurrent_allocation_is_unique() {
        let alloc = std::sync::Arc::new(StreamIdAllocator::client());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let alloc = alloc.clone();
            handles.push(std::thread::spawn(move || {
                (0..100).map(|_| alloc.next(|_| false)).collect::<Vec<_>>()
            }));
        }
        let mut seen = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert!(id % 2 == 1);
                assert!(seen.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(seen.len(), 400);
    }
}
