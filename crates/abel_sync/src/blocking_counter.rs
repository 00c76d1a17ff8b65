// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::{Condvar, Mutex};

const ERR_POISONED_LOCK: &str = "lock poisoned - counter state may not hold, not safe to continue";

/// Blocks one thread until `n` events have happened.
///
/// Worker threads call [`decrement`][Self::decrement] as they finish; a
/// single coordinator calls [`wait`][Self::wait], which returns once the
/// count reaches zero. At that point every decrementer has released the
/// internal lock, so the coordinator may safely free the counter.
///
/// Only one thread may call `wait`. To release several threads at once, use
/// a [`Barrier`][crate::Barrier] instead.
#[derive(Debug)]
pub struct BlockingCounter {
    state: Mutex<CounterState>,
    reached_zero: Condvar,
}

#[derive(Debug)]
struct CounterState {
    count: usize,
    num_waiting: usize,
}

impl BlockingCounter {
    /// A counter expecting `n` decrements.
    #[must_use]
    pub fn new(n: usize) -> Self {
        Self {
            state: Mutex::new(CounterState { count: n, num_waiting: 0 }),
            reached_zero: Condvar::new(),
        }
    }

    /// Records one event. Returns `true` iff this call drove the count to
    /// zero.
    ///
    /// # Panics
    ///
    /// Panics when called more than `n` times.
    pub fn decrement(&self) -> bool {
        let mut state = self.state.lock().expect(ERR_POISONED_LOCK);

        assert!(state.count > 0, "decrement() called too many times");
        state.count -= 1;

        if state.count == 0 {
            self.reached_zero.notify_one();
            return true;
        }
        false
    }

    /// Blocks until the count reaches zero. May be called at most once.
    ///
    /// # Panics
    ///
    /// Panics if another thread is already waiting.
    pub fn wait(&self) {
        let mut state = self.state.lock().expect(ERR_POISONED_LOCK);

        // Supporting several waiters would need an exit counter like the
        // barrier's; one waiter is all the use cases need.
        assert_eq!(state.num_waiting, 0, "multiple threads called wait()");
        state.num_waiting += 1;

        while state.count > 0 {
            state = self.reached_zero.wait(state).expect(ERR_POISONED_LOCK);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    use static_assertions::assert_impl_all;

    use super::*;

    #[test]
    fn zero_count_does_not_block() {
        let counter = BlockingCounter::new(0);

        counter.wait();
    }

    #[test]
    fn only_the_final_decrement_reports_zero() {
        let counter = BlockingCounter::new(3);

        assert!(!counter.decrement());
        assert!(!counter.decrement());
        assert!(counter.decrement());
    }

    #[test]
    fn wait_returns_after_all_decrements() {
        let counter = Arc::new(BlockingCounter::new(4));
        let released = Arc::new(AtomicBool::new(false));

        let waiter = {
            let counter = Arc::clone(&counter);
            let released = Arc::clone(&released);
            thread::spawn(move || {
                counter.wait();
                released.store(true, Ordering::SeqCst);
            })
        };

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    let _ = counter.decrement();
                })
            })
            .collect();

        for worker in workers {
            worker.join().expect("worker must not panic");
        }
        waiter.join().expect("waiter must not panic");

        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    #[should_panic(expected = "decrement() called too many times")]
    fn over_decrement_panics() {
        let counter = BlockingCounter::new(1);

        assert!(counter.decrement());
        let _ = counter.decrement();
    }

    #[test]
    fn thread_safe_type() {
        assert_impl_all!(BlockingCounter: Send, Sync);
    }
}
