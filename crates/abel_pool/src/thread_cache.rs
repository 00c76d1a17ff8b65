// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::any::TypeId;
use std::cell::RefCell;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::time::Instant;

use crate::descriptor::TypeDescriptor;

/// One idle cell plus the moment it was parked.
struct IdleCell {
    cell: NonNull<u8>,
    parked_at: Instant,
}

/// The per-thread free list of one pooled type.
///
/// Cells are reused LIFO (the most recently released cell is the most likely
/// to still be cache-hot) and washed FIFO (the front of the list is the
/// thread's oldest idle cell).
pub(crate) struct ThreadCache {
    desc: &'static TypeDescriptor,
    free: Vec<IdleCell>,
}

impl ThreadCache {
    fn new(desc: &'static TypeDescriptor) -> Self {
        Self { desc, free: Vec::new() }
    }

    /// Takes the most recently parked cell, if any.
    pub(crate) fn take(&mut self) -> Option<NonNull<u8>> {
        let taken = self.free.pop().map(|idle| idle.cell);
        self.wash(Instant::now());
        taken
    }

    /// Parks a released cell, or destroys it when the cache sits at the high
    /// water mark and there is no shared pool to spill to.
    pub(crate) fn park(&mut self, cell: NonNull<u8>) {
        let now = Instant::now();

        if self.free.len() >= self.desc.high_water_mark && self.desc.shared.is_none() {
            // SAFETY: The cell is exclusively ours and of the descriptor's type.
            unsafe { (self.desc.destroy)(cell) };
        } else {
            self.free.push(IdleCell { cell, parked_at: now });
            self.maybe_spill();
        }

        self.wash(now);
    }

    /// Pulls a transfer batch from the shared pool into this cache.
    /// Returns `false` if the shared pool had nothing to give.
    pub(crate) fn refill(&mut self) -> bool {
        let Some(shared) = &self.desc.shared else {
            return false;
        };

        let mut transferred = Vec::with_capacity(self.desc.transfer_batch_size);
        let taken = shared.take_batch(shared.home_node(), &mut transferred, self.desc.transfer_batch_size);

        let now = Instant::now();
        self.free.extend(transferred.into_iter().map(|cell| IdleCell { cell, parked_at: now }));

        taken != 0
    }

    /// Spills one transfer batch to the shared pool when the cache has grown
    /// beyond its minimum size plus one batch.
    fn maybe_spill(&mut self) {
        let Some(shared) = &self.desc.shared else {
            return;
        };

        let keep = self.desc.min_thread_cache_size;
        if self.free.len() <= keep + self.desc.transfer_batch_size {
            return;
        }

        let spilled = self.free.split_off(self.free.len() - self.desc.transfer_batch_size);
        shared.put_batch(shared.home_node(), spilled.into_iter().map(|idle| idle.cell));
    }

    /// Lazy erosion toward the low water mark, driven by acquire/release
    /// traffic instead of a timer. The pool is only interesting while it is
    /// being used, so this suffices.
    fn wash(&mut self, now: Instant) {
        // Everything above the high water mark goes at once; spilling already
        // happened in `park` for backends that have somewhere to spill to.
        while self.free.len() > self.desc.high_water_mark {
            self.destroy_front();
        }

        // One idle victim per event keeps the work per call bounded.
        if self.free.len() > self.desc.low_water_mark
            && let Some(oldest) = self.free.first()
            && now.duration_since(oldest.parked_at) >= self.desc.max_idle
        {
            self.destroy_front();
        }
    }

    fn destroy_front(&mut self) {
        let idle = self.free.remove(0);

        // SAFETY: Parked cells are exclusively owned by this cache and came
        // from the matching descriptor's `create`.
        unsafe { (self.desc.destroy)(idle.cell) };
    }

    #[cfg(test)]
    pub(crate) fn idle_count(&self) -> usize {
        self.free.len()
    }

    #[cfg(test)]
    pub(crate) fn backdate_all(&mut self, by: std::time::Duration) {
        for idle in &mut self.free {
            idle.parked_at -= by;
        }
    }

    #[cfg(test)]
    pub(crate) fn wash_now(&mut self) {
        self.wash(Instant::now());
    }
}

impl Drop for ThreadCache {
    /// Runs when the owning thread exits. Cells still parked here outlive the
    /// thread by spilling to the shared pool; without one they are destroyed.
    ///
    /// A pooled type's `Drop` must not release cells of another pooled type
    /// from this destructor path.
    fn drop(&mut self) {
        if let Some(shared) = &self.desc.shared {
            let home = shared.home_node();
            shared.put_batch(home, self.free.drain(..).map(|idle| idle.cell));
            return;
        }

        for idle in self.free.drain(..) {
            // SAFETY: As in `destroy_front`.
            unsafe { (self.desc.destroy)(idle.cell) };
        }
    }
}

thread_local! {
    static CACHES: RefCell<HashMap<TypeId, ThreadCache>> = RefCell::new(HashMap::new());
}

/// Runs `f` against the current thread's cache for the type identified by
/// `type_id`/`desc`, creating the cache on first use.
pub(crate) fn with_cache<R>(type_id: TypeId, desc: &'static TypeDescriptor, f: impl FnOnce(&mut ThreadCache) -> R) -> R {
    CACHES.with(|caches| {
        let mut caches = caches.borrow_mut();
        let cache = caches.entry(type_id).or_insert_with(|| ThreadCache::new(desc));
        f(cache)
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::descriptor::descriptor_of;
    use crate::testing::LiveCounted;
    use crate::traits::{PoolBackend, Pooled};

    struct Washed(LiveCounted);

    impl Washed {
        const LIVE: &'static str = "abel_pool::thread_cache::Washed";
    }

    impl Pooled for Washed {
        const BACKEND: PoolBackend = PoolBackend::ThreadLocal;
        const LOW_WATER_MARK: usize = 2;
        const HIGH_WATER_MARK: usize = 8;
        const MAX_IDLE: Duration = Duration::from_secs(60);

        fn create() -> Box<Self> {
            Box::new(Self(LiveCounted::new(Self::LIVE)))
        }
    }

    fn fresh_cache() -> ThreadCache {
        ThreadCache::new(descriptor_of::<Washed>())
    }

    fn park_fresh(cache: &mut ThreadCache, count: usize) {
        for _ in 0..count {
            let cell = (cache.desc.create)();
            cache.park(cell);
        }
    }

    #[test]
    fn take_returns_most_recent_first() {
        let mut cache = fresh_cache();
        park_fresh(&mut cache, 3);

        let last_in = cache.free.last().expect("cache is not empty").cell;
        assert_eq!(cache.take(), Some(last_in));

        drop(cache);
    }

    #[test]
    fn release_above_high_water_destroys() {
        struct Capped(LiveCounted);

        impl Capped {
            const LIVE: &'static str = "abel_pool::thread_cache::Capped";
        }

        impl Pooled for Capped {
            const BACKEND: PoolBackend = PoolBackend::ThreadLocal;
            const LOW_WATER_MARK: usize = 2;
            const HIGH_WATER_MARK: usize = 8;

            fn create() -> Box<Self> {
                Box::new(Self(LiveCounted::new(Self::LIVE)))
            }
        }

        let mut cache = ThreadCache::new(descriptor_of::<Capped>());
        park_fresh(&mut cache, Capped::HIGH_WATER_MARK + 5);

        // The five over-cap cells were destroyed on arrival.
        assert_eq!(cache.idle_count(), Capped::HIGH_WATER_MARK);
        assert_eq!(LiveCounted::count(Capped::LIVE), Capped::HIGH_WATER_MARK);

        drop(cache);
        assert_eq!(LiveCounted::count(Capped::LIVE), 0);
    }

    #[test]
    fn idle_cells_erode_toward_low_water() {
        let mut cache = fresh_cache();
        park_fresh(&mut cache, 6);
        assert_eq!(cache.idle_count(), 6);

        cache.backdate_all(Duration::from_secs(120));

        // One victim per wash event, stopping at the low water mark.
        for expected in (Washed::LOW_WATER_MARK..6).rev() {
            cache.wash_now();
            assert_eq!(cache.idle_count(), expected);
        }

        cache.wash_now();
        assert_eq!(cache.idle_count(), Washed::LOW_WATER_MARK);

        drop(cache);
    }

    #[test]
    fn fresh_cells_are_not_washed() {
        let mut cache = fresh_cache();
        park_fresh(&mut cache, 6);

        cache.wash_now();
        assert_eq!(cache.idle_count(), 6);

        drop(cache);
    }
}
