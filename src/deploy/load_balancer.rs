// src/deploy/load_balancer.rs
//! Lock-free slot allocator for the interpreter pool
//!
//! Each interpreter slot has an atomic usage counter on its own cache line.
//! Acquisition scans every slot starting from the caller's cursor:
//!
//! ```text
//! cursor ─▶ [1] [0] [2] [1]      fast path: CAS 0 → 1 on the first idle slot
//!            ▲   ▲
//!            │   └── taken
//!            └────── skipped, remembered as least loaded so far
//!
//! no idle slot ─▶ fetch_add on the least-loaded slot seen (slow path)
//! ```
//!
//! Counts are a load hint, not a lock: the slow path can pick a slot whose
//! count changed after it was read.

use crossbeam::utils::CachePadded;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::trace;

/// Per-caller scan position
///
/// Keeping one cursor per thread (or per task) gives each caller its own
/// round-robin order without thread-local storage in the balancer itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BalancerCursor {
    last: usize,
}

impl BalancerCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slot the next scan starts from
    pub fn position(&self) -> usize {
        self.last
    }
}

/// Atomic least-loaded slot allocator
pub struct LoadBalancer {
    /// Usage count per slot
    uses: Box<[CachePadded<AtomicU64>]>,

    /// Number of slots acquisition may hand out
    limit: AtomicUsize,
}

impl LoadBalancer {
    /// Create a balancer over `n` slots
    ///
    /// # Panics
    ///
    /// Panics if `n` is zero.
    pub fn new(n: usize) -> Self {
        assert!(n > 0, "load balancer needs at least one slot");

        let uses = (0..n)
            .map(|_| CachePadded::new(AtomicU64::new(0)))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            uses,
            limit: AtomicUsize::new(n),
        }
    }

    /// Total number of slots
    pub fn len(&self) -> usize {
        self.uses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uses.is_empty()
    }

    /// Only hand out the first `n` slots (clamped to `1..=len`)
    pub fn set_resource_limit(&self, n: usize) {
        let n = n.clamp(1, self.uses.len());
        self.limit.store(n, Ordering::SeqCst);
    }

    pub fn resource_limit(&self) -> usize {
        self.limit.load(Ordering::SeqCst)
    }

    /// Current usage count of `slot`
    pub fn usage(&self, slot: usize) -> u64 {
        self.uses[slot].load(Ordering::SeqCst)
    }

    /// Pick a slot, preferring an idle one; never blocks or fails
    pub fn acquire(&self, cursor: &mut BalancerCursor) -> usize {
        let n = self.resource_limit();
        let mut last = cursor.last;
        let mut min_users = u64::MAX;
        let mut min_idx = 0;

        for _ in 0..n {
            if last >= n {
                last = 0;
            }

            match self.uses[last].compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => {
                    cursor.last = last;
                    trace!("Acquired idle slot {}", last);
                    return last;
                }
                Err(prev) => {
                    if prev < min_users {
                        min_users = prev;
                        min_idx = last;
                    }
                }
            }

            last += 1;
        }

        // Every slot was busy; share the least loaded one we saw
        cursor.last = last;
        self.uses[min_idx].fetch_add(1, Ordering::SeqCst);
        metrics::counter!("deploy_balancer_slow_path_total").increment(1);
        trace!("All slots busy, sharing slot {} ({} users)", min_idx, min_users);
        min_idx
    }

    /// Release a slot returned by [`acquire`](Self::acquire)
    pub fn free(&self, slot: usize) {
        let prev = self.uses[slot].fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "freed idle slot {}", slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::sync::Barrier;

    #[test]
    fn test_slots_are_cache_padded() {
        assert!(std::mem::size_of::<CachePadded<AtomicU64>>() >= 64);
    }

    #[test]
    fn test_round_robin_from_cursor() {
        let balancer = LoadBalancer::new(4);
        let mut cursor = BalancerCursor::new();

        let acquired: Vec<usize> = (0..4).map(|_| balancer.acquire(&mut cursor)).collect();
        assert_eq!(acquired, vec![0, 1, 2, 3]);

        balancer.free(2);
        assert_eq!(balancer.acquire(&mut cursor), 2);
        assert_eq!(balancer.usage(2), 1);
    }

    #[test]
    fn test_free_returns_slot_to_fast_path() {
        let balancer = LoadBalancer::new(3);
        let mut cursor = BalancerCursor::new();

        let slot = balancer.acquire(&mut cursor);
        balancer.free(slot);
        assert_eq!(balancer.usage(slot), 0);

        assert_eq!(balancer.acquire(&mut cursor), slot);
        assert_eq!(balancer.usage(slot), 1);
    }

    #[test]
    fn test_slow_path_picks_least_loaded() {
        let balancer = LoadBalancer::new(3);
        let mut cursor = BalancerCursor::new();
        for _ in 0..3 {
            balancer.acquire(&mut cursor);
        }

        // Load slot 0 and 2 further so slot 1 is the least loaded
        balancer.uses[0].fetch_add(2, Ordering::SeqCst);
        balancer.uses[2].fetch_add(1, Ordering::SeqCst);

        assert_eq!(balancer.acquire(&mut cursor), 1);
        assert_eq!(balancer.usage(1), 2);
    }

    #[test]
    fn test_resource_limit() {
        let balancer = LoadBalancer::new(4);
        balancer.set_resource_limit(2);
        let mut cursor = BalancerCursor::new();

        for _ in 0..10 {
            assert!(balancer.acquire(&mut cursor) < 2);
        }
        assert_eq!(balancer.usage(2) + balancer.usage(3), 0);

        balancer.set_resource_limit(0);
        assert_eq!(balancer.resource_limit(), 1);
        balancer.set_resource_limit(100);
        assert_eq!(balancer.resource_limit(), 4);
    }

    #[test]
    fn test_concurrent_acquire_is_distinct() {
        let n = 8;
        let balancer = LoadBalancer::new(n);
        let barrier = Barrier::new(n);

        let slots: HashSet<usize> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..n)
                .map(|_| {
                    scope.spawn(|| {
                        let mut cursor = BalancerCursor::new();
                        barrier.wait();
                        balancer.acquire(&mut cursor)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(slots, (0..n).collect());
    }

    proptest! {
        #[test]
        fn prop_n_acquisitions_are_distinct(n in 1usize..32, start in 0usize..64) {
            let balancer = LoadBalancer::new(n);
            let mut cursor = BalancerCursor { last: start };

            let slots: HashSet<usize> = (0..n).map(|_| balancer.acquire(&mut cursor)).collect();
            prop_assert_eq!(slots, (0..n).collect::<HashSet<_>>());
        }

        #[test]
        fn prop_usage_returns_to_zero(n in 1usize..16, extra in 0usize..32) {
            let balancer = LoadBalancer::new(n);
            let mut cursor = BalancerCursor::new();

            let slots: Vec<usize> = (0..n + extra).map(|_| balancer.acquire(&mut cursor)).collect();
            prop_assert!(slots.iter().all(|&slot| slot < n));
            for slot in slots {
                balancer.free(slot);
            }
            prop_assert!((0..n).all(|slot| balancer.usage(slot) == 0));
        }
    }
}
