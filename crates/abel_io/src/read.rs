// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::cell::RefCell;
use std::io::{self, IoSliceMut};
use std::mem::MaybeUninit;

use abel_buf::{ExclusiveBlock, IoBuf, NativeBlockSize};
use smallvec::SmallVec;

use crate::stream::IoStream;

/// How a scatter-gather read ended.
#[derive(Debug)]
pub enum ReadStatus {
    /// The stream has no more bytes to give right now; re-arm the readiness
    /// wait. Reported both for a short `readv` and for `WouldBlock`.
    Drained,

    /// The requested byte budget was read in full; the stream may hold more.
    MaxBytesRead,

    /// The remote side closed the connection.
    Eof,

    /// A permanent error; the caller is expected to close the stream.
    Error(io::Error),
}

/// One `readv` covers at most this many fresh blocks.
const MAX_BLOCKS_PER_READ: usize = 8;

thread_local! {
    /// Fresh native blocks standing by for the next read, refilled on entry
    /// so the fast path never touches the pool per block.
    static BLOCK_CACHE: RefCell<Vec<ExclusiveBlock>> = const { RefCell::new(Vec::new()) };
}

/// Reads up to `max_bytes` bytes from `io`, appending them to `to`.
///
/// Issues one `readv` per batch of up to eight blocks and keeps going until
/// the budget is met, the stream runs dry, or the stream ends. Returns the
/// final status and the number of bytes appended.
pub fn read_into(io: &mut dyn IoStream, to: &mut IoBuf, max_bytes: usize) -> (ReadStatus, usize) {
    let mut bytes_read = 0;

    while bytes_read < max_bytes {
        let mut short_read = false;
        let read = read_partial(io, to, max_bytes - bytes_read, &mut short_read);

        let read = match read {
            Ok(0) => return (ReadStatus::Eof, bytes_read),
            Ok(read) => read,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return (ReadStatus::Drained, bytes_read),
            Err(e) => return (ReadStatus::Error(e), bytes_read),
        };

        bytes_read += read;

        if short_read {
            debug_assert!(bytes_read < max_bytes);
            return (ReadStatus::Drained, bytes_read);
        }
    }

    debug_assert_eq!(bytes_read, max_bytes);
    (ReadStatus::MaxBytesRead, bytes_read)
}

/// One `readv` over the per-thread block cache. `short_read` reports whether
/// the stream gave less than was asked of it.
fn read_partial(io: &mut dyn IoStream, to: &mut IoBuf, max_bytes: usize, short_read: &mut bool) -> io::Result<usize> {
    BLOCK_CACHE.with(|cache| {
        let mut cache = cache.borrow_mut();
        while cache.len() < MAX_BLOCKS_PER_READ {
            cache.push(ExclusiveBlock::acquire(NativeBlockSize::Small));
        }

        // Gather unfilled block regions, back to front. Using blocks from the
        // back keeps the removal below a cheap pop.
        let mut bytes_to_read = 0;
        let mut regions: SmallVec<[IoSliceMut<'_>; MAX_BLOCKS_PER_READ]> = SmallVec::new();
        let mut blocks = cache.iter_mut().rev();

        while bytes_to_read != max_bytes && regions.len() != MAX_BLOCKS_PER_READ {
            let block = blocks.next().expect("cache holds one block per possible region");
            let len = block.capacity().min(max_bytes - bytes_to_read);

            let unfilled: &mut [MaybeUninit<u8>] = &mut block.spare_capacity_mut()[..len];
            // SAFETY: The region is only ever written through this slice
            // (the stream fills it); no one reads uninitialized bytes.
            let unfilled = unsafe { &mut *(std::ptr::from_mut(unfilled) as *mut [u8]) };

            regions.push(IoSliceMut::new(unfilled));
            bytes_to_read += len;
        }

        let result = io.readv(&mut regions)?;
        drop(regions);

        if result == 0 {
            return Ok(0);
        }
        debug_assert!(result <= bytes_to_read);
        *short_read = result != bytes_to_read;

        // Move the filled blocks out of the cache and into `to`.
        let mut bytes_left = result;
        while bytes_left > 0 {
            let block = cache.pop().expect("the filled regions all came from cached blocks");
            let len = bytes_left.min(block.capacity());

            // SAFETY: The stream initialized the first `len` bytes of this
            // block; earlier regions fill completely before later ones see
            // any bytes.
            to.append_slice(unsafe { block.into_slice(len) });
            bytes_left -= len;
        }

        Ok(result)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ReadStep, ScriptedStream};

    #[test]
    fn short_read_reports_drained() {
        let mut io = ScriptedStream::with_reads([ReadStep::Data(b"partial".to_vec())]);
        let mut buf = IoBuf::new();

        let (status, bytes_read) = read_into(&mut io, &mut buf, 1024);

        assert!(matches!(status, ReadStatus::Drained));
        assert_eq!(bytes_read, 7);
        assert_eq!(buf.flatten(usize::MAX), b"partial");
    }

    #[test]
    fn exact_budget_reports_max_bytes_read() {
        let mut io = ScriptedStream::with_reads([ReadStep::Data(b"12345678".to_vec())]);
        let mut buf = IoBuf::new();

        let (status, bytes_read) = read_into(&mut io, &mut buf, 8);

        assert!(matches!(status, ReadStatus::MaxBytesRead));
        assert_eq!(bytes_read, 8);
    }

    #[test]
    fn closed_stream_reports_eof() {
        let mut io = ScriptedStream::with_reads([ReadStep::Eof]);
        let mut buf = IoBuf::new();

        let (status, bytes_read) = read_into(&mut io, &mut buf, 1024);

        assert!(matches!(status, ReadStatus::Eof));
        assert_eq!(bytes_read, 0);
    }

    #[test]
    fn eof_after_data_keeps_the_data() {
        // Exactly eight full blocks: the first readv is not short, so the
        // loop issues another and sees the close.
        let payload = vec![b'x'; 8 * 4096];
        let mut io = ScriptedStream::with_reads([ReadStep::Data(payload.clone()), ReadStep::Eof]);
        let mut buf = IoBuf::new();

        let (status, bytes_read) = read_into(&mut io, &mut buf, 1 << 20);

        assert!(matches!(status, ReadStatus::Eof));
        assert_eq!(bytes_read, payload.len());
        assert_eq!(buf.byte_size(), payload.len());
    }

    #[test]
    fn would_block_reports_drained() {
        let mut io = ScriptedStream::with_reads([ReadStep::Fail(io::ErrorKind::WouldBlock)]);
        let mut buf = IoBuf::new();

        let (status, bytes_read) = read_into(&mut io, &mut buf, 1024);

        assert!(matches!(status, ReadStatus::Drained));
        assert_eq!(bytes_read, 0);
    }

    #[test]
    fn hard_failure_reports_error() {
        let mut io = ScriptedStream::with_reads([ReadStep::Fail(io::ErrorKind::ConnectionReset)]);
        let mut buf = IoBuf::new();

        let (status, _) = read_into(&mut io, &mut buf, 1024);

        assert!(matches!(status, ReadStatus::Error(e) if e.kind() == io::ErrorKind::ConnectionReset));
    }

    #[test]
    fn large_read_spans_multiple_blocks() {
        let payload = vec![b'y'; 3 * 4096 + 17];
        let mut io = ScriptedStream::with_reads([ReadStep::Data(payload.clone())]);
        let mut buf = IoBuf::new();

        let (status, bytes_read) = read_into(&mut io, &mut buf, 1 << 20);

        assert!(matches!(status, ReadStatus::Drained));
        assert_eq!(bytes_read, payload.len());
        assert_eq!(buf.iter().count(), 4);
        assert_eq!(buf.flatten(usize::MAX), payload);
    }
}
