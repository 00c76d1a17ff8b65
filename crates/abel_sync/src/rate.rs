// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Lets every `n`-th event through, starting with the first.
///
/// Thread-safe; one atomic increment per [`feed`][Self::feed]. Typically
/// used to throttle log statements on hot paths.
#[derive(Debug)]
pub struct EveryN {
    num: AtomicUsize,
    modulus: usize,
}

impl EveryN {
    /// # Panics
    ///
    /// Panics unless `n > 1`; a gate that lets everything through is a
    /// mistake at the call site.
    #[must_use]
    pub fn new(n: usize) -> Self {
        assert!(n > 1);

        Self {
            num: AtomicUsize::new(0),
            modulus: n,
        }
    }

    /// Records one event; `true` for events 0, n, 2n, ...
    pub fn feed(&self) -> bool {
        let n = self.num.fetch_add(1, Ordering::Relaxed);
        n % self.modulus == 0
    }
}

/// Lets only the first `n` events through.
#[derive(Debug)]
pub struct FirstN {
    num: AtomicUsize,
    max_count: usize,
}

impl FirstN {
    #[must_use]
    pub fn new(n: usize) -> Self {
        Self {
            num: AtomicUsize::new(0),
            max_count: n,
        }
    }

    /// Records one event; `true` exactly `n` times.
    pub fn feed(&self) -> bool {
        let n = self.num.fetch_add(1, Ordering::Relaxed);
        n < self.max_count
    }
}

/// Lets at most one event per wall-clock second through.
#[derive(Debug)]
pub struct EverySecond {
    last_stamp: AtomicU64,
}

impl EverySecond {
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_stamp: AtomicU64::new(0),
        }
    }

    /// Records one event; `true` iff no event passed during the current
    /// wall-clock second. Under contention, the compare-exchange elects one
    /// winner per second.
    pub fn feed(&self) -> bool {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("the clock does not predate the epoch")
            .as_secs();

        let last = self.last_stamp.load(Ordering::Relaxed);
        if now <= last {
            return false;
        }

        self.last_stamp
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }
}

impl Default for EverySecond {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    #[test]
    fn every_n_passes_one_in_n() {
        let gate = EveryN::new(3);

        let passed: Vec<bool> = (0..9).map(|_| gate.feed()).collect();
        assert_eq!(passed, [true, false, false, true, false, false, true, false, false]);
    }

    #[test]
    #[should_panic]
    #[expect(clippy::should_panic_without_expect, reason = "the assert carries no message")]
    fn every_n_rejects_degenerate_rates() {
        drop(EveryN::new(1));
    }

    #[test]
    fn first_n_passes_exactly_n() {
        let gate = FirstN::new(4);

        let passed = (0..100).filter(|_| gate.feed()).count();
        assert_eq!(passed, 4);
    }

    #[test]
    fn first_zero_passes_nothing() {
        let gate = FirstN::new(0);

        assert!(!gate.feed());
    }

    #[test]
    fn every_second_passes_once_per_second() {
        let gate = EverySecond::new();

        // The first feed of a second wins; everything after loses until the
        // clock ticks over. The clock may tick once mid-test, so at most one
        // of the follow-up feeds may win.
        assert!(gate.feed());
        let winners = (0..2).filter(|_| gate.feed()).count();
        assert!(winners <= 1);
    }

    #[test]
    fn thread_safe_type() {
        assert_impl_all!(EveryN: Send, Sync);
        assert_impl_all!(FirstN: Send, Sync);
        assert_impl_all!(EverySecond: Send, Sync);
    }
}
