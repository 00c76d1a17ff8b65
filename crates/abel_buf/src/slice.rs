// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::slice;

use crate::block::Block;

/// A view over `len` initialized bytes of a [`Block`], starting at `offset`.
///
/// A slice shares ownership of its block with every other slice cut from it;
/// the block is released only when the last slice goes away. Consuming bytes
/// from the front ([`skip`]) or cutting bytes off the back ([`truncate`])
/// changes only this view, never the block.
///
/// [`skip`]: Self::skip
/// [`truncate`]: Self::truncate
#[derive(Clone)]
pub struct BufSlice {
    block: Block,
    offset: usize,
    len: usize,
}

impl BufSlice {
    /// Type-safety invariant: `offset + len` is within the block and the
    /// covered range holds initialized bytes. Both filling paths (builder,
    /// scatter-gather read) uphold this by construction.
    pub(crate) fn from_block(block: Block, offset: usize, len: usize) -> Self {
        debug_assert!(offset.checked_add(len).is_some_and(|end| end <= block.len()));

        Self { block, offset, len }
    }

    /// A slice referencing static data. Zero-copy and infallible; the block
    /// has no storage to release.
    #[must_use]
    pub fn from_static(bytes: &'static [u8]) -> Self {
        // SAFETY: Static data is valid forever and immutable.
        let block = unsafe { Block::referencing(bytes.as_ptr(), bytes.len(), None) };

        Self::from_block(block, 0, bytes.len())
    }

    /// A slice owning the given container.
    #[must_use]
    pub fn owning(bytes: impl Into<Box<[u8]>>) -> Self {
        let bytes = bytes.into();
        let len = bytes.len();

        Self::from_block(Block::owning(bytes), 0, len)
    }

    /// A slice referencing a caller-managed memory region. `completion` runs
    /// when the last slice over the region is dropped, which is the caller's
    /// signal that the region is safe to release.
    ///
    /// # Safety
    ///
    /// The region `[ptr, ptr + len)` must stay valid and unmutated until
    /// `completion` runs.
    #[must_use]
    pub unsafe fn referencing<F>(ptr: *const u8, len: usize, completion: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        // SAFETY: Forwarded from the caller.
        let block = unsafe { Block::referencing(ptr, len, Some(Box::new(completion))) };

        Self::from_block(block, 0, len)
    }

    /// The bytes this slice views.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        // SAFETY: The type-safety invariant of `from_block` guarantees the
        // range is in bounds and initialized, and blocks are immutable once
        // shared.
        unsafe { slice::from_raw_parts(self.block.as_ptr().add(self.offset), self.len) }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Discards `n` bytes from the front of the view.
    ///
    /// `n` must be less than [`len`][Self::len]; a slice that would become
    /// empty is removed from its chain instead, never skipped to zero.
    pub fn skip(&mut self, n: usize) {
        debug_assert!(n < self.len);
        self.offset += n;
        self.len -= n;
    }

    /// Shortens the view to its first `n` bytes. `n` must not exceed
    /// [`len`][Self::len].
    pub fn truncate(&mut self, n: usize) {
        debug_assert!(n <= self.len);
        self.len = n;
    }

    pub(crate) fn shares_block_with(&self, other: &Self) -> bool {
        std::ptr::eq(self.block.as_ptr(), other.block.as_ptr())
    }
}

impl From<Vec<u8>> for BufSlice {
    fn from(bytes: Vec<u8>) -> Self {
        Self::owning(bytes)
    }
}

impl From<String> for BufSlice {
    fn from(text: String) -> Self {
        Self::owning(text.into_bytes())
    }
}

impl fmt::Debug for BufSlice {
    #[cfg_attr(test, mutants::skip)] // We have no contract to test here - can return anything.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufSlice")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use static_assertions::assert_impl_all;

    use super::*;

    #[test]
    fn owning_slice_views_its_bytes() {
        let slice = BufSlice::owning(b"hello world".to_vec());

        assert_eq!(slice.data(), b"hello world");
        assert_eq!(slice.len(), 11);
        assert!(!slice.is_empty());
    }

    #[test]
    fn skip_and_truncate_narrow_the_view() {
        let mut slice = BufSlice::owning(b"hello world".to_vec());

        slice.skip(6);
        assert_eq!(slice.data(), b"world");

        slice.truncate(3);
        assert_eq!(slice.data(), b"wor");
    }

    #[test]
    fn clones_share_the_block() {
        let slice = BufSlice::owning(b"shared".to_vec());
        let mut clone = slice.clone();
        clone.skip(2);

        assert!(slice.shares_block_with(&clone));
        assert_eq!(slice.data(), b"shared");
        assert_eq!(clone.data(), b"ared");
    }

    #[test]
    fn from_static_is_zero_copy() {
        static GREETING: &[u8] = b"hi there";

        let slice = BufSlice::from_static(GREETING);
        assert_eq!(slice.data().as_ptr(), GREETING.as_ptr());
    }

    #[test]
    fn referencing_runs_completion_when_all_views_drop() {
        static COMPLETIONS: AtomicUsize = AtomicUsize::new(0);

        let region = b"pinned region".to_vec();

        // SAFETY: `region` is dropped only after both slices are gone.
        let slice = unsafe {
            BufSlice::referencing(region.as_ptr(), region.len(), || {
                COMPLETIONS.fetch_add(1, Ordering::Relaxed);
            })
        };

        let clone = slice.clone();
        drop(slice);
        assert_eq!(COMPLETIONS.load(Ordering::Relaxed), 0);

        drop(clone);
        assert_eq!(COMPLETIONS.load(Ordering::Relaxed), 1);

        drop(region);
    }

    #[test]
    fn thread_safe_type() {
        assert_impl_all!(BufSlice: Send, Sync);
    }
}
