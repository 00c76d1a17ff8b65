// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Vectored stream I/O over chained buffers.
//!
//! Two operations connect [`IoBuf`][abel_buf::IoBuf] to a byte stream, both
//! built to amortize syscalls through vectored I/O:
//!
//! * [`read_into`] drains a stream into a buffer with one `readv` per batch
//!   of up to eight pool-fresh blocks, reporting [`ReadStatus`];
//! * [`WriteQueue`] collects outbound buffers from any number of producer
//!   threads into an MPSC list and lets a single consumer push them out with
//!   one `writev` per [`flush`][WriteQueue::flush].
//!
//! The flush owner is elected by the queue itself: the appender that
//! transitions the queue from empty to non-empty is told so and arms the
//! flush; a flush whose result says `emptied` hands the role back.
//!
//! Streams plug in through the [`IoStream`] trait, implemented here for the
//! standard TCP and Unix stream types.

mod error;
mod read;
mod stream;
mod write_queue;

pub use error::{Error, Result};
pub use read::{ReadStatus, read_into};
pub use stream::IoStream;
pub use write_queue::{FlushResult, WriteQueue};

#[cfg(test)]
mod testing;
