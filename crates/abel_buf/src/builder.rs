// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::mem::MaybeUninit;
use std::ptr;
use std::slice;

use crate::block::{ExclusiveBlock, NativeBlockSize};
use crate::buf::IoBuf;
use crate::slice::BufSlice;

/// Payloads below this many bytes are copied into the current block even
/// when reattaching them by reference would technically be zero-copy.
/// Copying small payloads keeps internal fragmentation down.
const APPEND_VIA_COPY_THRESHOLD: usize = 128;

/// Upper bound for a single [`reserve`][IoBufBuilder::reserve] call. A
/// reservation must fit in one contiguous block with room to spare.
const MAX_RESERVATION: usize = 1024;

/// Appends bytes to the tail of an [`IoBuf`] under construction.
///
/// The builder owns one current native block and an offset into it, which
/// makes a small append one bounds check plus a `memcpy`. When the block
/// saturates it is flushed into the output buffer as a slice and a fresh
/// block is taken from the pool.
///
/// Large incoming slices and buffers are reattached by reference instead of
/// copied, preserving the zero-copy property through the builder.
///
/// ```
/// use abel_buf::IoBufBuilder;
///
/// let mut builder = IoBufBuilder::new();
/// builder.append("content-length: ");
/// builder.append(b"42\r\n");
///
/// let message = builder.destructive_get();
/// assert_eq!(message.byte_size(), 20);
/// ```
pub struct IoBufBuilder {
    buf: IoBuf,
    current: ExclusiveBlock,
    used: usize,
}

impl IoBufBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: IoBuf::new(),
            current: ExclusiveBlock::acquire(NativeBlockSize::Small),
            used: 0,
        }
    }

    /// Unwritten remainder of the current block, for callers that fill bytes
    /// in place. Declare how much was filled with
    /// [`mark_written`][Self::mark_written].
    pub fn unfilled(&mut self) -> &mut [MaybeUninit<u8>] {
        self.make_writable();

        let available = self.space_available();
        let start = self.write_ptr().cast::<MaybeUninit<u8>>();

        // SAFETY: The builder exclusively owns the current block, and the
        // range [used, capacity) is in bounds.
        unsafe { slice::from_raw_parts_mut(start, available) }
    }

    /// Bytes left in the current block. Writing more than this forces a new
    /// block.
    #[must_use]
    pub fn space_available(&self) -> usize {
        self.current.capacity() - self.used
    }

    /// Declares that the first `n` bytes of [`unfilled`][Self::unfilled]
    /// now hold data.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds [`space_available`][Self::space_available].
    pub fn mark_written(&mut self, n: usize) {
        assert!(n <= self.space_available(), "overflowing the current block");
        self.used += n;
    }

    /// Returns `n` contiguous bytes at the tail to be overwritten before the
    /// buffer is consumed. The bytes count as written immediately.
    ///
    /// If the current block has less than `n` bytes of room it is flushed
    /// and a fresh block taken, so the reservation never straddles blocks.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds 1024.
    pub fn reserve(&mut self, n: usize) -> &mut [MaybeUninit<u8>] {
        assert!(n <= MAX_RESERVATION, "at most {MAX_RESERVATION} bytes may be reserved in a single call");

        self.make_writable();
        if self.space_available() < n {
            self.flush_current();
        }

        let start = self.write_ptr().cast::<MaybeUninit<u8>>();
        self.used += n;

        // SAFETY: As in `unfilled`; the range was just claimed and stays
        // inside the exclusively owned current block.
        unsafe { slice::from_raw_parts_mut(start, n) }
    }

    /// Appends a copy of `bytes`, spilling into fresh blocks as needed.
    pub fn append(&mut self, bytes: impl AsRef<[u8]>) {
        let mut bytes = bytes.as_ref();

        while !bytes.is_empty() {
            self.make_writable();
            let n = bytes.len().min(self.space_available());

            // SAFETY: `n` is bounded by the remaining capacity of the
            // exclusively owned current block; the source is a live slice.
            unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), self.write_ptr(), n) };

            self.used += n;
            bytes = &bytes[n..];
        }
    }

    /// Appends one byte.
    pub fn append_byte(&mut self, byte: u8) {
        self.make_writable();

        // SAFETY: `make_writable` guarantees at least one spare byte.
        unsafe { self.write_ptr().write(byte) };
        self.used += 1;
    }

    /// Appends a slice: small ones are copied for locality, large ones are
    /// reattached by reference.
    pub fn append_slice(&mut self, slice: BufSlice) {
        if slice.len() < APPEND_VIA_COPY_THRESHOLD && self.space_available() >= slice.len() {
            self.append(slice.data());
            return;
        }

        // A dirty current block must flush first to keep bytes ordered.
        if self.used > 0 {
            self.flush_current();
        }
        self.buf.append_slice(slice);
    }

    /// Appends a whole buffer: small ones are copied, large ones have their
    /// slice chain spliced in without copying.
    pub fn append_buf(&mut self, mut buffer: IoBuf) {
        if buffer.byte_size() < APPEND_VIA_COPY_THRESHOLD && self.space_available() >= buffer.byte_size() {
            for slice in buffer.iter() {
                self.append(slice);
            }
            return;
        }

        if self.used > 0 {
            self.flush_current();
        }
        self.buf.append(&mut buffer);
    }

    /// Total bytes written so far.
    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.buf.byte_size() + self.used
    }

    /// Flushes the current block and yields the accumulated buffer,
    /// consuming the builder.
    #[must_use]
    pub fn destructive_get(mut self) -> IoBuf {
        self.flush_current();
        self.buf
    }

    /// Starts a fresh block when the current one is saturated, so every
    /// write path sees at least one spare byte.
    fn make_writable(&mut self) {
        if self.space_available() == 0 {
            self.flush_current();
        }
    }

    /// Moves the written prefix of the current block into the output buffer
    /// and takes a fresh block.
    fn flush_current(&mut self) {
        if self.used == 0 {
            return; // The current block is clean, no need to flush it.
        }

        let full = std::mem::replace(&mut self.current, ExclusiveBlock::acquire(NativeBlockSize::Small));
        let written = std::mem::take(&mut self.used);
        self.buf.append_slice(BufSlice::from_block(full.share(), 0, written));
    }

    fn write_ptr(&mut self) -> *mut u8 {
        // SAFETY: `used` never exceeds the block capacity.
        unsafe { self.current.as_mut_ptr().add(self.used) }
    }
}

impl Default for IoBufBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for IoBufBuilder {
    #[cfg_attr(test, mutants::skip)] // We have no contract to test here - can return anything.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoBufBuilder")
            .field("byte_size", &self.byte_size())
            .field("used", &self.used)
            .finish()
    }
}
