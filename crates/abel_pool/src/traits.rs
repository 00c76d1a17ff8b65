// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Duration;

/// Selects the recycling backend for a pooled type.
///
/// The choice is fixed at compile time: a single acquire/release call site
/// compiles down to the selected backend with no run-time dispatch.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PoolBackend {
    /// Do not pool at all. Every acquire constructs a fresh cell and every
    /// release destroys it.
    ///
    /// Pooling makes object lifetimes hard to follow in a debugger; this
    /// backend exists so it can be switched off per type.
    Disabled,

    /// Cells are cached on the thread that released them and never migrate.
    ///
    /// The only backend whose hooks run without any atomic operations.
    /// Performs poorly for producer/consumer patterns where one thread
    /// allocates and another frees - nothing is ever reused in that case.
    ThreadLocal,

    /// A small thread cache on top of a shared pool per NUMA node, with bulk
    /// transfers between the two.
    ///
    /// Fits workloads where the producer and consumer co-reside on the same
    /// socket, e.g. fibers inside one scheduling group.
    NodeShared,

    /// A small thread cache on top of a single process-wide pool.
    ///
    /// The safe default when the allocation pattern has no usable locality.
    Global,
}

/// A type that can be recycled through the object pool.
///
/// The associated constants are the pool's traits and never change at run
/// time. Water marks and the idle deadline only apply to backends with a
/// per-thread cache (all except [`PoolBackend::Disabled`]).
pub trait Pooled: Sized + Send + 'static {
    /// The recycling backend for this type.
    const BACKEND: PoolBackend;

    /// The per-thread cache is not washed below this many cells.
    const LOW_WATER_MARK: usize = 0;

    /// A release that would grow the per-thread cache beyond this many cells
    /// destroys (or spills) the cell instead.
    const HIGH_WATER_MARK: usize = usize::MAX;

    /// Cells idle longer than this become wash victims once the cache is
    /// above [`Self::LOW_WATER_MARK`].
    const MAX_IDLE: Duration = Duration::from_secs(10);

    /// For [`PoolBackend::NodeShared`] and [`PoolBackend::Global`]: the
    /// thread cache spills to the shared pool only above this size.
    const MIN_THREAD_CACHE_SIZE: usize = 0;

    /// Number of cells moved per refill/spill between the thread cache and a
    /// shared pool.
    const TRANSFER_BATCH_SIZE: usize = 16;

    /// Constructs a fresh cell.
    ///
    /// Allocation failure aborts the process; this is an infrastructure
    /// primitive and callers are not expected to handle exhaustion.
    fn create() -> Box<Self>;

    /// Runs after the cell leaves the pool, before the caller sees it.
    ///
    /// Must not acquire from the same pool.
    fn on_acquire(&mut self) {}

    /// Runs before the cell enters the pool.
    ///
    /// Typically releases precious resources (file handles, large buffers)
    /// the pool should not keep alive. Must not acquire from the same pool.
    fn on_release(&mut self) {}
}
