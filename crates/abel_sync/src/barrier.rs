// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::{Condvar, Mutex};

const ERR_POISONED_LOCK: &str = "lock poisoned - barrier state may not hold, not safe to continue";

/// A rendezvous point for a fixed set of threads.
///
/// Each of the `n` participants calls [`block`][Self::block], which suspends
/// until all have arrived. Exactly one call returns `true` - the one whose
/// exit drove the participant count to zero - and that caller is the only
/// one that may safely free the barrier, since every other participant has
/// provably left by then.
///
/// Unlike the standard library's barrier, this one is single-use; that is
/// what makes the "last one out frees it" contract possible.
#[derive(Debug)]
pub struct Barrier {
    state: Mutex<BarrierState>,
    all_blocked: Condvar,
}

#[derive(Debug)]
struct BarrierState {
    num_to_block: usize,
    num_to_exit: usize,
}

impl Barrier {
    /// A barrier for `n` participants.
    #[must_use]
    pub fn new(n: usize) -> Self {
        Self {
            state: Mutex::new(BarrierState {
                num_to_block: n,
                num_to_exit: n,
            }),
            all_blocked: Condvar::new(),
        }
    }

    /// Blocks until all `n` participants have arrived.
    ///
    /// Returns `true` for exactly one caller: the last to leave.
    ///
    /// # Panics
    ///
    /// Panics when called more than `n` times.
    pub fn block(&self) -> bool {
        let mut state = self.state.lock().expect(ERR_POISONED_LOCK);

        assert!(state.num_to_block > 0, "block() called too many times");
        state.num_to_block -= 1;

        if state.num_to_block == 0 {
            self.all_blocked.notify_all();
        }
        while state.num_to_block > 0 {
            state = self.all_blocked.wait(state).expect(ERR_POISONED_LOCK);
        }

        // Determine which thread can safely free this barrier: when
        // num_to_exit reaches zero every other participant has released the
        // mutex and will not touch the barrier again.
        state.num_to_exit -= 1;
        state.num_to_exit == 0
    }
}
