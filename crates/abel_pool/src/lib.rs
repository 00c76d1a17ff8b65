// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Typed object pool with pluggable recycling backends.
//!
//! A pool hands out cells of a single type `T` and takes them back when the
//! caller is done, so the cost of constructing `T` is paid rarely instead of
//! on every use. Which recycling strategy fits depends entirely on the
//! allocation pattern of the call sites, so the strategy is part of the type:
//! every pooled type implements [`Pooled`] and names one of the
//! [`PoolBackend`] variants in its trait implementation.
//!
//! * [`PoolBackend::ThreadLocal`] - cells never leave the thread that
//!   released them. The fastest option when producer and consumer are the
//!   same thread; no atomic operations on the hot path.
//! * [`PoolBackend::NodeShared`] - a small thread cache on top of a shared
//!   pool per NUMA node. Fits producer/consumer pairs that co-reside on one
//!   socket.
//! * [`PoolBackend::Global`] - a thread cache on top of one process-wide
//!   pool. The fallback when no locality pattern applies.
//! * [`PoolBackend::Disabled`] - no pooling at all; every acquire constructs
//!   and every release destroys. Useful when debugging object lifetimes.
//!
//! Acquiring returns a [`PooledPtr`], a linear handle that owns exactly one
//! cell and returns it to the originating backend on drop.
//!
//! ```
//! use std::time::Duration;
//!
//! use abel_pool::{PoolBackend, Pooled, acquire};
//!
//! struct Scratch {
//!     bytes: Vec<u8>,
//! }
//!
//! impl Pooled for Scratch {
//!     const BACKEND: PoolBackend = PoolBackend::ThreadLocal;
//!     const LOW_WATER_MARK: usize = 8;
//!     const HIGH_WATER_MARK: usize = 64;
//!     const MAX_IDLE: Duration = Duration::from_secs(10);
//!
//!     fn create() -> Box<Self> {
//!         Box::new(Self { bytes: Vec::with_capacity(4096) })
//!     }
//!
//!     fn on_release(&mut self) {
//!         self.bytes.clear();
//!     }
//! }
//!
//! let mut scratch = acquire::<Scratch>();
//! scratch.bytes.extend_from_slice(b"transient work");
//! drop(scratch); // Returns the cell to the current thread's cache.
//! ```
//!
//! # Failure semantics
//!
//! This is an infrastructure primitive: acquiring never fails. If the
//! underlying allocator cannot provide storage the process aborts, which for
//! this layer beats propagating an error nobody can meaningfully handle.
//! Releasing is infallible.
//!
//! # Hooks
//!
//! `on_acquire` runs after a cell leaves the pool and `on_release` runs
//! before it enters the pool. Hooks run synchronously on the calling thread
//! and must not acquire from the same pool.

mod descriptor;
mod handle;
mod pool;
mod shared;
mod thread_cache;
mod traits;

pub use descriptor::{TypeDescriptor, descriptor_of};
pub use handle::PooledPtr;
pub use pool::{acquire, release_raw};
pub use traits::{PoolBackend, Pooled};

#[cfg(test)]
mod testing;
