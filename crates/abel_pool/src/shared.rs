// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::ptr::NonNull;
use std::sync::Mutex;

use many_cpus::SystemHardware;

use crate::traits::PoolBackend;

const ERR_POISONED_LOCK: &str = "lock poisoned - pool invariants may not hold, not safe to continue";

/// An erased cell parked in a shared pool.
///
/// Cells are only ever produced from `Box<T>` where `T: Pooled + Send`, so
/// moving them between threads through the shared pool is sound.
pub(crate) struct ParkedCell(pub(crate) NonNull<u8>);

// SAFETY: A parked cell is exclusively owned by the pool and the underlying
// type is required to be Send by the `Pooled` trait bound.
unsafe impl Send for ParkedCell {}

/// Cross-thread storage behind the per-thread caches.
///
/// For [`PoolBackend::Global`] this is a single free list; for
/// [`PoolBackend::NodeShared`] one free list per NUMA memory region, with
/// cross-node steals only when the node-local list is empty.
pub(crate) struct SharedPool {
    nodes: Vec<Mutex<Vec<ParkedCell>>>,
}

impl SharedPool {
    pub(crate) fn for_backend(backend: PoolBackend) -> Option<Self> {
        match backend {
            PoolBackend::Disabled | PoolBackend::ThreadLocal => None,
            PoolBackend::Global => Some(Self {
                nodes: vec![Mutex::new(Vec::new())],
            }),
            PoolBackend::NodeShared => {
                let node_count = memory_region_count();

                Some(Self {
                    nodes: (0..node_count).map(|_| Mutex::new(Vec::new())).collect(),
                })
            }
        }
    }

    /// The shared free list the current thread transfers through.
    pub(crate) fn home_node(&self) -> usize {
        if self.nodes.len() == 1 {
            return 0;
        }

        // Region ids above what we saw at initialization (hotplug) fold back
        // onto a valid list rather than growing the pool.
        (SystemHardware::current().current_memory_region_id() as usize) % self.nodes.len()
    }

    /// Moves up to `batch` cells into `out`, preferring the home node and
    /// stealing from other nodes only when the home list is empty.
    ///
    /// Returns the number of cells transferred.
    pub(crate) fn take_batch(&self, home: usize, out: &mut Vec<NonNull<u8>>, batch: usize) -> usize {
        let taken = Self::drain_into(&self.nodes[home], out, batch);
        if taken != 0 {
            return taken;
        }

        for (index, node) in self.nodes.iter().enumerate() {
            if index == home {
                continue;
            }

            let stolen = Self::drain_into(node, out, batch);
            if stolen != 0 {
                return stolen;
            }
        }

        0
    }

    /// Parks `cells` on the home node's free list.
    pub(crate) fn put_batch(&self, home: usize, cells: impl Iterator<Item = NonNull<u8>>) {
        let mut node = self.nodes[home].lock().expect(ERR_POISONED_LOCK);
        node.extend(cells.map(ParkedCell));
    }

    /// Destroys every parked cell. Only for process teardown in tests.
    #[cfg(test)]
    pub(crate) fn drain_all(&self, destroy: unsafe fn(NonNull<u8>)) {
        for node in &self.nodes {
            let mut node = node.lock().expect(ERR_POISONED_LOCK);
            for cell in node.drain(..) {
                // SAFETY: Parked cells are exclusively owned by the pool and
                // came from the matching descriptor's `create`.
                unsafe { destroy(cell.0) };
            }
        }
    }

    fn drain_into(node: &Mutex<Vec<ParkedCell>>, out: &mut Vec<NonNull<u8>>, batch: usize) -> usize {
        let mut node = node.lock().expect(ERR_POISONED_LOCK);
        let take = batch.min(node.len());
        let start = node.len() - take;
        out.extend(node.drain(start..).map(|cell| cell.0));
        take
    }
}

/// Number of NUMA memory regions visible to this process, at least one.
fn memory_region_count() -> usize {
    let processors = SystemHardware::current().all_processors();

    let mut highest = 0_usize;
    for processor in &processors {
        highest = highest.max(processor.memory_region_id() as usize);
    }

    highest + 1
}
