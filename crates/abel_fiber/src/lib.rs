// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Fiber runtime internals.
//!
//! The building blocks that let a runtime schedule very large numbers of
//! cheap user-space fibers over a fixed pool of OS worker threads:
//!
//! * [`RunQueue`] - a bounded, lock-free MPMC queue of ready fibers with
//!   work stealing. Each entry can be pinned to the scheduling group that
//!   pushed it via its `unstealable` flag.
//! * [`scheduling_parameters`] - derives how many scheduling groups to
//!   create, how many workers each owns, and whether to partition groups by
//!   NUMA node, from a workload profile and the machine topology.
//! * The stack allocator (unix) - guard-paged user stacks and canary-checked
//!   system stacks, both recycled through the typed object pool.
//!
//! Fiber records themselves are opaque here: the queue carries `Copy`
//! handles (pointers or ids), and stacks are raw memory regions. Context
//! switching and the worker loop live a layer above.

mod run_queue;
mod scheduling;
#[cfg(unix)]
mod stack;

pub use run_queue::RunQueue;
pub use scheduling::{SchedulingParameters, SchedulingProfile, scheduling_parameters};
#[cfg(unix)]
pub use stack::{
    SYSTEM_STACK_SIZE, StackConfig, SystemStack, UserStack, acquire_system_stack, acquire_user_stack, configure_stacks,
};
