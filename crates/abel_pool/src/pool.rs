// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::any::TypeId;
use std::ptr::NonNull;

use crate::descriptor::descriptor_of;
use crate::handle::PooledPtr;
use crate::thread_cache::with_cache;
use crate::traits::{PoolBackend, Pooled};

/// Acquires a live cell of `T` from its pool.
///
/// Never fails: when every cache and shared pool is empty a fresh cell is
/// constructed, and allocation failure aborts the process.
///
/// `T::on_acquire` has already run by the time this returns.
#[must_use]
pub fn acquire<T: Pooled>() -> PooledPtr<T> {
    let desc = descriptor_of::<T>();

    let cell = match T::BACKEND {
        PoolBackend::Disabled => (desc.create)(),
        PoolBackend::ThreadLocal => {
            with_cache(TypeId::of::<T>(), desc, |cache| cache.take()).unwrap_or_else(|| (desc.create)())
        }
        PoolBackend::NodeShared | PoolBackend::Global => with_cache(TypeId::of::<T>(), desc, |cache| {
            cache.take().or_else(|| {
                // Miss: pull one transfer batch down from the shared pool
                // before falling back to construction.
                if cache.refill() { cache.take() } else { None }
            })
        })
        .unwrap_or_else(|| (desc.create)()),
    };

    // SAFETY: The cell is live, exclusively ours and of type `T`.
    unsafe { (desc.on_acquire)(cell) };

    PooledPtr::new(cell.cast())
}

/// Returns a cell to its pool. Used by `PooledPtr::drop`.
pub(crate) fn release_cell<T: Pooled>(ptr: NonNull<T>) {
    let desc = descriptor_of::<T>();
    let cell = ptr.cast::<u8>();

    // SAFETY: The cell is live, exclusively ours and of type `T`.
    unsafe { (desc.on_release)(cell) };

    match T::BACKEND {
        PoolBackend::Disabled => {
            // SAFETY: Ownership was transferred to us by the caller.
            unsafe { (desc.destroy)(cell) };
        }
        PoolBackend::ThreadLocal | PoolBackend::NodeShared | PoolBackend::Global => {
            with_cache(TypeId::of::<T>(), desc, |cache| cache.park(cell));
        }
    }
}

/// Returns a leaked cell to its pool.
///
/// # Safety
///
/// `ptr` must come from [`PooledPtr::leak`] with the same `T`, and must not
/// have been released already.
pub unsafe fn release_raw<T: Pooled>(ptr: NonNull<T>) {
    release_cell::<T>(ptr);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::testing::LiveCounted;

    #[test]
    fn thread_local_cell_is_reused() {
        struct Reused {
            generation: u32,
        }

        impl Pooled for Reused {
            const BACKEND: PoolBackend = PoolBackend::ThreadLocal;

            fn create() -> Box<Self> {
                Box::new(Self { generation: 0 })
            }
        }

        let mut first = acquire::<Reused>();
        first.generation = 1;
        let first_addr = std::ptr::from_ref(&*first) as usize;
        drop(first);

        // LIFO reuse on the same thread: we get the very cell back.
        let second = acquire::<Reused>();
        assert_eq!(std::ptr::from_ref(&*second) as usize, first_addr);
        assert_eq!(second.generation, 1);
    }

    #[test]
    fn hooks_run_on_both_transitions() {
        static ACQUIRED: AtomicUsize = AtomicUsize::new(0);
        static RELEASED: AtomicUsize = AtomicUsize::new(0);

        struct Hooked;

        impl Pooled for Hooked {
            const BACKEND: PoolBackend = PoolBackend::ThreadLocal;

            fn create() -> Box<Self> {
                Box::new(Self)
            }

            fn on_acquire(&mut self) {
                ACQUIRED.fetch_add(1, Ordering::Relaxed);
            }

            fn on_release(&mut self) {
                RELEASED.fetch_add(1, Ordering::Relaxed);
            }
        }

        let handle = acquire::<Hooked>();
        assert_eq!(ACQUIRED.load(Ordering::Relaxed), 1);
        assert_eq!(RELEASED.load(Ordering::Relaxed), 0);

        drop(handle);
        assert_eq!(RELEASED.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn disabled_backend_constructs_and_destroys_every_time() {
        struct Throwaway(LiveCounted);

        impl Throwaway {
            const LIVE: &'static str = "abel_pool::pool::Throwaway";
        }

        impl Pooled for Throwaway {
            const BACKEND: PoolBackend = PoolBackend::Disabled;

            fn create() -> Box<Self> {
                Box::new(Self(LiveCounted::new(Self::LIVE)))
            }
        }

        let handle = acquire::<Throwaway>();
        assert_eq!(LiveCounted::count(Throwaway::LIVE), 1);

        drop(handle);
        assert_eq!(LiveCounted::count(Throwaway::LIVE), 0);
    }

    #[test]
    fn global_backend_recycles_across_threads() {
        struct Shared {
            stamp: u64,
        }

        impl Pooled for Shared {
            const BACKEND: PoolBackend = PoolBackend::Global;
            // Spill on the very first release so the other thread can see it.
            const MIN_THREAD_CACHE_SIZE: usize = 0;
            const TRANSFER_BATCH_SIZE: usize = 1;

            fn create() -> Box<Self> {
                Box::new(Self { stamp: 0 })
            }
        }

        // Fill the shared pool from a producer thread. The thread-exit drain
        // spills whatever its cache still holds.
        thread::spawn(|| {
            let mut cell = acquire::<Shared>();
            cell.stamp = 0xfeed;
            drop(cell);
        })
        .join()
        .expect("producer thread must not panic");

        // A consumer on a different thread gets the recycled cell.
        let stamp = thread::spawn(|| {
            let cell = acquire::<Shared>();
            cell.stamp
        })
        .join()
        .expect("consumer thread must not panic");

        assert_eq!(stamp, 0xfeed);
    }

    #[test]
    #[cfg_attr(miri, ignore)] // Talks to the real OS for NUMA topology.
    fn node_shared_backend_recycles_across_threads() {
        struct NodeLocal {
            stamp: u64,
        }

        impl Pooled for NodeLocal {
            const BACKEND: PoolBackend = PoolBackend::NodeShared;
            const MIN_THREAD_CACHE_SIZE: usize = 0;
            const TRANSFER_BATCH_SIZE: usize = 1;

            fn create() -> Box<Self> {
                Box::new(Self { stamp: 0 })
            }
        }

        thread::spawn(|| {
            let mut cell = acquire::<NodeLocal>();
            cell.stamp = 0xbeef;
            drop(cell);
        })
        .join()
        .expect("producer thread must not panic");

        // The producer's thread-exit drain parked the cell on its node's
        // shared pool; a consumer (cross-node steals allowed) finds it.
        let stamp = thread::spawn(|| {
            let cell = acquire::<NodeLocal>();
            cell.stamp
        })
        .join()
        .expect("consumer thread must not panic");

        assert_eq!(stamp, 0xbeef);
    }

    #[test]
    fn wash_settles_between_water_marks() {
        struct Pulsed(LiveCounted);

        impl Pulsed {
            const LIVE: &'static str = "abel_pool::pool::Pulsed";
        }

        impl Pooled for Pulsed {
            const BACKEND: PoolBackend = PoolBackend::ThreadLocal;
            const LOW_WATER_MARK: usize = 16;
            const HIGH_WATER_MARK: usize = 128;
            const MAX_IDLE: Duration = Duration::from_millis(300);

            fn create() -> Box<Self> {
                Box::new(Self(LiveCounted::new(Self::LIVE)))
            }
        }

        // A burst of a thousand live cells, all released back.
        let burst: Vec<_> = (0..1000).map(|_| acquire::<Pulsed>()).collect();
        assert_eq!(LiveCounted::count(Pulsed::LIVE), 1000);
        drop(burst);

        // Releases above the cap were destroyed on arrival: the live count
        // stabilizes at the high water mark after one wash cycle.
        assert_eq!(LiveCounted::count(Pulsed::LIVE), Pulsed::HIGH_WATER_MARK);

        // Once the idle deadline passes, traffic erodes the cache one cell
        // per event until the low water mark holds.
        thread::sleep(Duration::from_millis(400));
        for _ in 0..1000 {
            if LiveCounted::count(Pulsed::LIVE) <= Pulsed::LOW_WATER_MARK + 1 {
                break;
            }
            drop(acquire::<Pulsed>());
        }

        let live = LiveCounted::count(Pulsed::LIVE);
        assert!(live >= Pulsed::LOW_WATER_MARK);
        assert!(live <= Pulsed::LOW_WATER_MARK + 1);
    }
}
