// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::io::IoSlice;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};
use std::time::Duration;

use abel_buf::IoBuf;
use abel_pool::{PoolBackend, Pooled, acquire, release_raw};
use smallvec::SmallVec;

use crate::error::{Error, Result};
use crate::stream::IoStream;

/// Per-invocation cap on gathered iovecs, mirroring what one `writev` call
/// can take.
const MAX_IOVECS: usize = 1024;

/// How many iovecs we gather before spilling to the heap.
const INLINE_IOVECS: usize = 64;

/// One queued buffer, pool-recycled. The caller's context value travels with
/// the buffer and comes back from [`WriteQueue::flush`] once every byte of
/// the buffer has hit the stream.
struct WriteNode {
    buffer: IoBuf,
    ctx: usize,
    next: AtomicPtr<WriteNode>,
}

impl Pooled for WriteNode {
    const BACKEND: PoolBackend = PoolBackend::ThreadLocal;
    const LOW_WATER_MARK: usize = 8192;
    const HIGH_WATER_MARK: usize = usize::MAX;
    const MAX_IDLE: Duration = Duration::from_secs(10);
    const MIN_THREAD_CACHE_SIZE: usize = 2048;
    const TRANSFER_BATCH_SIZE: usize = 2048;

    fn create() -> Box<Self> {
        Box::new(Self {
            buffer: IoBuf::new(),
            ctx: 0,
            next: AtomicPtr::new(ptr::null_mut()),
        })
    }

    fn on_release(&mut self) {
        // The payload must not survive into the next user of the node.
        self.buffer.clear();
    }
}

/// The outcome of one [`WriteQueue::flush`].
#[derive(Debug)]
pub struct FlushResult {
    /// Bytes the stream actually accepted.
    pub written: usize,

    /// Context values of every fully drained buffer, in append order.
    pub drained: Vec<usize>,

    /// Whether the queue is now empty. The next append after an emptied
    /// queue returns `true` again, handing flush responsibility back.
    pub emptied: bool,

    /// Whether the stream accepted less than it was offered.
    pub short_write: bool,
}

#[repr(align(64))]
struct CacheAligned<T>(T);

/// An MPSC list of outbound buffers feeding `writev`.
///
/// Any thread may [`append`]; the thread that sees `true` returned owns
/// flushing until a flush reports `emptied`. Batching buffers through one
/// `writev` is substantially cheaper than a `write` per buffer, and the
/// single-consumer discipline lets one worker own a connection's outbound
/// side without contention.
///
/// At most one thread may be inside [`flush`] at a time; that is what the
/// append/emptied hand-off protocol guarantees when followed.
///
/// [`append`]: Self::append
/// [`flush`]: Self::flush
pub struct WriteQueue {
    /// Where the consumer resumes. Only valid while the queue is non-empty;
    /// reset by the first append after an empty period.
    head: CacheAligned<AtomicPtr<WriteNode>>,

    /// Where producers splice themselves on. Null iff the queue is empty.
    tail: CacheAligned<AtomicPtr<WriteNode>>,
}

impl WriteQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            head: CacheAligned(AtomicPtr::new(ptr::null_mut())),
            tail: CacheAligned(AtomicPtr::new(ptr::null_mut())),
        }
    }

    /// Appends a buffer with its context value.
    ///
    /// Returns `true` iff the queue was empty, i.e. this caller transitioned
    /// it to non-empty and is now responsible for arming a flush.
    #[must_use]
    pub fn append(&self, buffer: IoBuf, ctx: usize) -> bool {
        let mut node = acquire::<WriteNode>();
        node.next.store(ptr::null_mut(), Ordering::Relaxed);
        node.buffer = buffer;
        node.ctx = ctx;

        let raw = node.leak().as_ptr();

        // The exchange atomically makes us the new tail; we then splice into
        // the previous tail's `next` (or into `head` if there was none).
        let prev = self.tail.0.swap(raw, Ordering::AcqRel);
        if prev.is_null() {
            self.head.0.store(raw, Ordering::Release);
        } else {
            // SAFETY: A previous tail stays alive until the consumer walks
            // past it, which it cannot do before observing our splice.
            let prev = unsafe { &*prev };
            debug_assert!(prev.next.load(Ordering::Acquire).is_null());
            prev.next.store(raw, Ordering::Release);
        }

        prev.is_null()
    }

    /// Drains up to `max_bytes` bytes through one `writev` call.
    ///
    /// Must only be called by the current flush owner, on a non-empty queue.
    ///
    /// # Errors
    ///
    /// [`Error::Closed`] when the stream accepted zero bytes, and
    /// [`Error::StdIo`] for everything the stream itself reports -
    /// including `WouldBlock`, which callers treat as "re-arm and retry".
    /// Nothing has been consumed from the queue in either case.
    ///
    /// # Panics
    ///
    /// Panics if the queue is empty (the append/emptied protocol was not
    /// followed).
    pub fn flush(&self, io: &mut dyn IoStream, max_bytes: usize) -> Result<FlushResult> {
        let head = self.head.0.load(Ordering::Acquire);
        assert!(!head.is_null(), "flush on an empty write queue");

        // Gather one writev's worth of iovecs.
        let mut regions: SmallVec<[IoSlice<'_>; INLINE_IOVECS]> = SmallVec::new();
        let mut flushing = 0_usize;

        let mut current = head;
        'gather: while !current.is_null() {
            // SAFETY: Nodes between head and tail stay alive until this
            // consumer frees them below.
            let node = unsafe { &*current };
            for slice in node.buffer.iter() {
                if regions.len() == MAX_IOVECS {
                    break 'gather;
                }
                let take = slice.len().min(max_bytes - flushing);
                regions.push(IoSlice::new(&slice[..take]));
                flushing += take;
                if flushing == max_bytes {
                    break 'gather;
                }
            }
            current = node.next.load(Ordering::Acquire);
        }

        let written = io.writev(&regions).map_err(Error::StdIo)?;
        if written == 0 {
            tracing::debug!(offered = flushing, "write stream closed by peer");
            return Err(Error::Closed);
        }
        drop(regions);
        debug_assert!(written <= flushing);

        // Rewind from head, consuming nodes the writev fully covered. There
        // is no need to reload `head`; nobody else moves it.
        let mut drained = Vec::new();
        let mut left = written;
        let mut emptied = false;

        let mut current = head;
        loop {
            // SAFETY: As above; this consumer owns everything from head on.
            let node = unsafe { &mut *current };

            let len = node.buffer.byte_size();
            if len > left {
                // The straddling buffer keeps its unwritten remainder.
                node.buffer.skip(left);
                self.head.0.store(current, Ordering::Release);
                break;
            }

            left -= len;
            drained.push(node.ctx);

            let next = node.next.load(Ordering::Acquire);
            if next.is_null() {
                debug_assert_eq!(left, 0);

                // Try to mark the queue empty. A failed CAS means an append
                // is racing us; its splice will be visible shortly.
                if self.tail.0.compare_exchange(current, ptr::null_mut(), Ordering::Relaxed, Ordering::Relaxed).is_ok() {
                    emptied = true;
                    // `head` is stale now; the next append resets it.
                } else {
                    let next = loop {
                        let next = node.next.load(Ordering::Acquire);
                        if !next.is_null() {
                            break next;
                        }
                        std::hint::spin_loop();
                    };
                    self.head.0.store(next, Ordering::Release);
                }

                Self::free(current);
                break;
            }

            Self::free(current);
            current = next;
        }

        Ok(FlushResult {
            written,
            drained,
            emptied,
            short_write: written != flushing,
        })
    }

    fn free(node: *mut WriteNode) {
        // SAFETY: The consumer exclusively owns drained nodes, and every
        // node came from the WriteNode pool via `append`.
        unsafe { release_raw::<WriteNode>(NonNull::new_unchecked(node)) };
    }
}

impl Default for WriteQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WriteQueue {
    fn drop(&mut self) {
        // `head` may be stale after a flush that emptied the queue; one
        // sentinel append repairs it before the walk.
        let _ = self.append(IoBuf::new(), 0);

        let mut current = self.head.0.load(Ordering::Acquire);
        while !current.is_null() {
            // SAFETY: No producers or consumers remain; the list is ours.
            let next = unsafe { &*current }.next.load(Ordering::Acquire);
            Self::free(current);
            current = next;
        }
    }
}

impl std::fmt::Debug for WriteQueue {
    #[cfg_attr(test, mutants::skip)] // We have no contract to test here - can return anything.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteQueue")
            .field("empty", &self.tail.0.load(Ordering::Relaxed).is_null())
            .finish()
    }
}
