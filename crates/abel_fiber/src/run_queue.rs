// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering, fence};

/// A bounded MPMC queue of ready fibers, in the style of Vyukov's bounded
/// queue: every cell carries its own sequence number, so producers and
/// consumers operate on disjoint cells without touching each other's cache
/// lines. That is what keeps [`steal`][Self::steal] scalable across many
/// workers.
///
/// Entries are `Copy` handles (fiber pointers or ids); the queue never runs
/// destructors for them. Each entry carries an `unstealable` flag pinning it
/// to the scheduling group that pushed it: [`pop`][Self::pop] ignores the
/// flag, [`steal`][Self::steal] refuses to take a pinned entry.
///
/// # Sequence protocol
///
/// For cell index `i` of a queue with capacity `C`, the sequence value moves
/// through three states per round `r`:
///
/// * `i + r*C` - empty, waiting for the producer of that turn;
/// * `i + r*C + 1` - full, waiting for the consumer of that turn;
/// * `i + (r+1)*C` - consumed and reset for the next producer round.
///
/// Producers release-store the sequence after writing the payload; consumers
/// acquire-load it before reading. A sequentially consistent fence sits
/// between the two loads that decide whether to enter the claim CAS, to
/// prevent store-load reordering on architectures with store buffers.
pub struct RunQueue<T> {
    capacity: usize,
    mask: usize,
    head: CacheAligned<AtomicUsize>,
    tail: CacheAligned<AtomicUsize>,
    cells: Box<[QueueCell<T>]>,
}

#[repr(align(64))]
struct CacheAligned<T>(T);

struct QueueCell<T> {
    seq: AtomicUsize,
    unstealable: AtomicBool,
    fiber: UnsafeCell<MaybeUninit<T>>,
}

// SAFETY: Cell payloads are handed across threads through the sequence
// protocol, which guarantees exclusive access to a cell between the claim
// CAS and the sequence release-store.
unsafe impl<T: Send> Sync for RunQueue<T> {}
// SAFETY: As above; the queue owns no thread-affine state.
unsafe impl<T: Send> Send for RunQueue<T> {}

impl<T: Copy> RunQueue<T> {
    /// Creates a queue with room for `capacity` entries.
    ///
    /// # Panics
    ///
    /// Panics unless `capacity` is a power of two.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "capacity must be a power of 2");

        let cells = (0..capacity)
            .map(|index| QueueCell {
                seq: AtomicUsize::new(index),
                unstealable: AtomicBool::new(false),
                fiber: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();

        Self {
            capacity,
            mask: capacity - 1,
            head: CacheAligned(AtomicUsize::new(0)),
            tail: CacheAligned(AtomicUsize::new(0)),
            cells,
        }
    }

    /// Enqueues one fiber. Returns `false` if the queue was observed full.
    ///
    /// A cell that has been consumed but not yet reset also reports full
    /// without retrying; whether to retry is the caller's call.
    pub fn push(&self, fiber: T, unstealable: bool) -> bool {
        loop {
            let head = self.head.0.load(Ordering::Relaxed);
            fence(Ordering::SeqCst);
            let cell = &self.cells[head & self.mask];
            let seq = cell.seq.load(Ordering::Acquire);

            if seq == head {
                if self
                    .head
                    .0
                    .compare_exchange_weak(head, head.wrapping_add(1), Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    // SAFETY: The CAS claimed this cell for us; no one else
                    // touches it until the sequence store below.
                    unsafe { (*cell.fiber.get()).write(fiber) };
                    cell.unstealable.store(unstealable, Ordering::Relaxed);
                    cell.seq.store(head.wrapping_add(1), Ordering::Release);
                    return true;
                }
                // Fall-through: lost the claim race.
            } else if seq.wrapping_add(self.capacity) == head.wrapping_add(1) {
                // Overrun: the cell from the previous round has been consumed
                // but not reset yet.
                //
                // Note that this thread may be delayed arbitrarily long
                // between loading `head` and `seq`, so this branch can be
                // taken even if the queue was drained in the meantime. The
                // method linearizes at the load of `seq`; callers must
                // tolerate such false positives.
                return false;
            }
            // We've been too late; retry.
            std::hint::spin_loop();
        }
    }

    /// Atomically enqueues all of `fibers`, or nothing.
    ///
    /// Succeeds iff a contiguous range of free cells could be claimed.
    /// Returns `false` - claiming nothing - when the range does not fit or
    /// when any cell in it is still consumed-but-not-reset; retrying is the
    /// caller's explicit option.
    pub fn push_batch(&self, fibers: &[T], unstealable: bool) -> bool {
        let batch = fibers.len();
        debug_assert!(batch > 0 && batch <= self.capacity);

        loop {
            let head_was = self.head.0.load(Ordering::Relaxed);
            let head = head_was.wrapping_add(batch);
            fence(Ordering::SeqCst);
            let last_seq = self.cells[head.wrapping_sub(1) & self.mask].seq.load(Ordering::Acquire);

            // See if the last cell we are trying to claim is unoccupied.
            if last_seq == head.wrapping_sub(1) {
                // First check that the entire range is clean.
                for index in 0..batch {
                    let at = head_was.wrapping_add(index);
                    let seq = self.cells[at & self.mask].seq.load(Ordering::Acquire);
                    if seq != at && seq.wrapping_add(self.capacity) == at.wrapping_add(1) {
                        // This cell hasn't been fully reset. Bail out.
                        return false;
                    }
                }

                // Try claiming the entire range at once.
                if self
                    .head
                    .0
                    .compare_exchange_weak(head_was, head, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    for (index, fiber) in fibers.iter().enumerate() {
                        let at = head_was.wrapping_add(index);
                        let cell = &self.cells[at & self.mask];
                        debug_assert_eq!(cell.seq.load(Ordering::Relaxed), at);

                        // SAFETY: The range CAS claimed every cell in
                        // [head_was, head) for us.
                        unsafe { (*cell.fiber.get()).write(*fiber) };
                        cell.unstealable.store(unstealable, Ordering::Relaxed);
                        cell.seq.store(at.wrapping_add(1), Ordering::Release);
                    }
                    return true;
                }
                // Fall-through: lost the claim race.
            } else if last_seq.wrapping_add(self.capacity) == head {
                // Overrun; as in `push`.
                return false;
            }
            std::hint::spin_loop();
        }
    }

    /// Dequeues the oldest fiber, pinned or not.
    pub fn pop(&self) -> Option<T> {
        self.pop_if(|_| true)
    }

    /// Dequeues the oldest fiber whose `unstealable` flag is clear.
    ///
    /// Gives up - without retrying - as soon as the head entry is pinned or
    /// the queue looks empty. An apparently empty queue may in fact have
    /// held an entry that a concurrent `pop` took first; such false
    /// negatives are inherent and callers must tolerate them.
    pub fn steal(&self) -> Option<T> {
        self.pop_if(|cell| !cell.unstealable.load(Ordering::Relaxed))
    }

    /// A point-in-time emptiness approximation, for load statistics only.
    #[must_use]
    pub fn is_empty_unreliable(&self) -> bool {
        self.head.0.load(Ordering::Relaxed) <= self.tail.0.load(Ordering::Relaxed)
    }

    fn pop_if(&self, want: impl Fn(&QueueCell<T>) -> bool) -> Option<T> {
        loop {
            let tail = self.tail.0.load(Ordering::Relaxed);
            fence(Ordering::SeqCst);
            let cell = &self.cells[tail & self.mask];
            let seq = cell.seq.load(Ordering::Acquire);

            if seq == tail.wrapping_add(1) {
                // Test before claiming ownership.
                if !want(cell) {
                    return None;
                }
                if self
                    .tail
                    .0
                    .compare_exchange_weak(tail, tail.wrapping_add(1), Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    // Pair with the producer's release store of `seq` before
                    // reading the payload.
                    let _ = cell.seq.load(Ordering::Acquire);

                    // SAFETY: The CAS claimed this cell; the producer's
                    // release store published the payload.
                    let fiber = unsafe { (*cell.fiber.get()).assume_init_read() };
                    // Reset the cell for the next producer round.
                    cell.seq.store(tail.wrapping_add(self.capacity), Ordering::Release);
                    return Some(fiber);
                }
            } else if seq == tail // Not filled yet.
                || seq.wrapping_add(self.capacity) == tail
            // Wrap-around.
            {
                // Underrun.
                return None;
            }
            std::hint::spin_loop();
        }
    }
}

impl<T> fmt::Debug for RunQueue<T> {
    #[cfg_attr(test, mutants::skip)] // We have no contract to test here - can return anything.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunQueue").field("capacity", &self.capacity).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use static_assertions::assert_impl_all;

    use super::*;

    #[test]
    fn fifo_order_single_thread() {
        let queue = RunQueue::new(8);

        for value in 0..8_usize {
            assert!(queue.push(value, false));
        }
        for value in 0..8_usize {
            assert_eq!(queue.pop(), Some(value));
        }
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn full_queue_rejects_the_next_push() {
        let queue = RunQueue::new(8);

        for value in 0..8_usize {
            assert!(queue.push(value, false));
        }
        assert!(!queue.push(8, false));

        // One pop makes room for exactly one more push.
        assert_eq!(queue.pop(), Some(0));
        assert!(queue.push(8, false));
        assert!(!queue.push(9, false));
    }

    #[test]
    fn steal_skips_a_pinned_head() {
        let queue = RunQueue::new(8);

        assert!(queue.push(0xa_usize, true));
        assert!(queue.push(0xb_usize, false));

        // The queue is non-empty, but its head entry is pinned to the group
        // that pushed it.
        assert_eq!(queue.steal(), None);

        assert_eq!(queue.pop(), Some(0xa));
        assert_eq!(queue.steal(), Some(0xb));
    }

    #[test]
    fn push_batch_is_all_or_nothing() {
        let queue = RunQueue::new(8);

        assert!(queue.push_batch(&[1_usize, 2, 3], false));

        // Five free cells left; a batch of six must claim nothing.
        assert!(!queue.push_batch(&[4, 5, 6, 7, 8, 9], false));
        assert!(queue.push_batch(&[4, 5, 6, 7, 8], false));

        for value in 1..=8_usize {
            assert_eq!(queue.pop(), Some(value));
        }
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn sequence_wraps_around_many_rounds() {
        let queue = RunQueue::new(4);

        for round in 0..1000_usize {
            assert!(queue.push(round, false));
            assert_eq!(queue.pop(), Some(round));
        }
        assert!(queue.is_empty_unreliable());
    }

    #[test]
    fn pinned_entries_still_pop_in_order() {
        let queue = RunQueue::new(8);

        assert!(queue.push(1_usize, false));
        assert!(queue.push(2_usize, true));
        assert!(queue.push(3_usize, false));

        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));
    }

    #[test]
    fn concurrent_producers_and_consumers_lose_nothing() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 10_000;

        let queue = Arc::new(RunQueue::new(64));
        let sum = Arc::new(AtomicUsize::new(0));
        let taken = Arc::new(AtomicUsize::new(0));

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                let sum = Arc::clone(&sum);
                let taken = Arc::clone(&taken);
                thread::spawn(move || {
                    while taken.load(Ordering::Relaxed) < PRODUCERS * PER_PRODUCER {
                        if let Some(value) = queue.pop() {
                            sum.fetch_add(value, Ordering::Relaxed);
                            taken.fetch_add(1, Ordering::Relaxed);
                        } else {
                            std::hint::spin_loop();
                        }
                    }
                })
            })
            .collect();

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for value in 1..=PER_PRODUCER {
                        while !queue.push(value, false) {
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        for producer in producers {
            producer.join().expect("producer must not panic");
        }
        for consumer in consumers {
            consumer.join().expect("consumer must not panic");
        }

        let expected = PRODUCERS * (PER_PRODUCER * (PER_PRODUCER + 1) / 2);
        assert_eq!(sum.load(Ordering::Relaxed), expected);
    }

    #[test]
    fn same_thread_pushes_pop_in_push_order() {
        let queue = Arc::new(RunQueue::new(16));

        let pusher = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for value in 0..1000_usize {
                    while !queue.push(value, false) {
                        thread::yield_now();
                    }
                }
            })
        };

        let mut last_seen = None;
        let mut seen = 0;
        while seen < 1000 {
            if let Some(value) = queue.pop() {
                if let Some(last) = last_seen {
                    assert!(value > last, "single-producer values popped out of order");
                }
                last_seen = Some(value);
                seen += 1;
            }
        }

        pusher.join().expect("pusher must not panic");
    }

    #[test]
    fn thread_safe_type() {
        assert_impl_all!(RunQueue<usize>: Send, Sync);
    }
}
