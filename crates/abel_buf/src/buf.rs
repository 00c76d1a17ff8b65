// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::VecDeque;
use std::fmt;

use crate::builder::IoBufBuilder;
use crate::slice::BufSlice;

/// An ordered chain of byte slices treated as one logical byte sequence.
///
/// The bytes are not required to be consecutive in memory: an `IoBuf` is a
/// list of [`BufSlice`]s over reference-counted blocks, plus a cached total
/// byte count. This is what makes zero-copy composition work - appending
/// another buffer splices its slice chain instead of copying bytes, and
/// [`cut`] splits a buffer by cloning at most one slice.
///
/// Two invariants hold at every observable state:
///
/// * no slice in the chain is empty;
/// * the cached byte count equals the sum of the slice lengths.
///
/// Cloning is cheap-ish: the slice list is copied, the underlying blocks are
/// shared. Moving is cheaper; prefer it.
///
/// An `IoBuf` is safe to move across threads but is not safe for concurrent
/// mutation.
///
/// [`cut`]: Self::cut
#[derive(Clone, Default)]
pub struct IoBuf {
    byte_size: usize,
    slices: VecDeque<BufSlice>,
}

impl IoBuf {
    /// An empty buffer. Does not allocate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a buffer holding a copy of `bytes`.
    ///
    /// The copy makes this slow by the standards of this type; prefer the
    /// zero-copy constructors of [`BufSlice`] where the data already lives
    /// somewhere stable.
    #[must_use]
    pub fn copied_from_slice(bytes: &[u8]) -> Self {
        let mut builder = IoBufBuilder::new();
        builder.append(bytes);
        builder.destructive_get()
    }

    /// Total bytes across all slices. O(1).
    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        debug_assert_eq!(self.slices.is_empty(), self.byte_size == 0);
        self.byte_size == 0
    }

    /// The leading contiguous run of bytes.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is empty.
    #[must_use]
    pub fn first_slice(&self) -> &[u8] {
        self.slices.front().expect("first_slice on an empty buffer").data()
    }

    /// Discards the first `n` bytes, releasing fully consumed slices to
    /// their blocks.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds [`byte_size`][Self::byte_size].
    pub fn skip(&mut self, mut n: usize) {
        assert!(n <= self.byte_size, "skipping past the end of the buffer");

        self.byte_size -= n;
        while n > 0 {
            let front = self.slices.front_mut().expect("byte accounting guarantees a slice");
            if n < front.len() {
                front.skip(n);
                break;
            }

            n -= front.len();
            drop(self.slices.pop_front());
        }
    }

    /// Removes and returns the first `n` bytes as a new buffer.
    ///
    /// A slice straddling the cut point is cloned; both halves share the
    /// underlying block.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds [`byte_size`][Self::byte_size].
    #[must_use]
    pub fn cut(&mut self, n: usize) -> Self {
        assert!(n <= self.byte_size, "cutting past the end of the buffer");

        let mut cut = Self::new();
        let mut left = n;

        while left > 0 && left >= self.slices.front().expect("byte accounting guarantees a slice").len() {
            let slice = self.slices.pop_front().expect("checked non-empty above");
            left -= slice.len();
            cut.slices.push_back(slice);
        }

        if left > 0 {
            let front = self.slices.front_mut().expect("byte accounting guarantees a slice");
            let mut head = front.clone();
            head.truncate(left);
            cut.slices.push_back(head);
            front.skip(left);
        }

        cut.byte_size = n;
        self.byte_size -= n;
        cut
    }

    /// Pushes one slice to the tail. Empty slices are dropped - the chain
    /// never holds one.
    pub fn append_slice(&mut self, slice: BufSlice) {
        if slice.is_empty() {
            return;
        }

        self.byte_size += slice.len();
        self.slices.push_back(slice);
    }

    /// Moves the entire slice chain of `other` to the tail, leaving `other`
    /// empty. No bytes are copied.
    pub fn append(&mut self, other: &mut Self) {
        self.byte_size += std::mem::take(&mut other.byte_size);
        self.slices.append(&mut other.slices);
    }

    /// Frees all slices.
    pub fn clear(&mut self) {
        self.byte_size = 0;
        self.slices.clear();
    }

    /// The slice views in order. Finite; call again to restart.
    ///
    /// Every yielded slice is non-empty.
    pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
        self.slices.iter().map(BufSlice::data)
    }

    /// Copies the whole sequence (up to `max_bytes`) into one contiguous
    /// vector. Slow path, for diagnostics and protocol corner cases.
    #[must_use]
    pub fn flatten(&self, max_bytes: usize) -> Vec<u8> {
        let total = max_bytes.min(self.byte_size);
        let mut flat = Vec::with_capacity(total);

        for slice in self.iter() {
            let want = total - flat.len();
            if want == 0 {
                break;
            }
            flat.extend_from_slice(&slice[..want.min(slice.len())]);
        }

        flat
    }

    /// Copies bytes until (and including) the first occurrence of `delim`,
    /// bounded by `max_bytes`. Returns everything up to the bound when the
    /// delimiter does not occur.
    #[must_use]
    pub fn flatten_until(&self, delim: &[u8], max_bytes: usize) -> Vec<u8> {
        assert!(!delim.is_empty(), "delimiter must not be empty");

        if self.is_empty() {
            return Vec::new();
        }

        let mut flat = Vec::new();
        for slice in self.iter() {
            if flat.len() >= max_bytes {
                break;
            }

            // Re-scan only the suffix that could contain a delimiter
            // straddling the slice boundary.
            let rescan_from = flat.len().saturating_sub(delim.len());
            flat.extend_from_slice(slice);

            if let Some(pos) = find(&flat[rescan_from..], delim) {
                flat.truncate(rescan_from + pos + delim.len());
                break;
            }
        }

        flat.truncate(max_bytes.min(flat.len()));
        flat
    }

    /// Copies the first `out.len()` bytes into `out`.
    ///
    /// # Panics
    ///
    /// Panics if the buffer holds fewer bytes than `out` wants.
    pub fn flatten_to(&self, out: &mut [u8]) {
        assert!(out.len() <= self.byte_size, "not enough buffered data");

        let mut copied = 0;
        for slice in self.iter() {
            if copied == out.len() {
                break;
            }
            let len = slice.len().min(out.len() - copied);
            out[copied..copied + len].copy_from_slice(&slice[..len]);
            copied += len;
        }
    }

    #[cfg(test)]
    pub(crate) fn slice_count(&self) -> usize {
        self.slices.len()
    }

    #[cfg(test)]
    pub(crate) fn slices(&self) -> impl Iterator<Item = &BufSlice> {
        self.slices.iter()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

impl fmt::Debug for IoBuf {
    #[cfg_attr(test, mutants::skip)] // We have no contract to test here - can return anything.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoBuf")
            .field("byte_size", &self.byte_size)
            .field("slices", &self.slices.len())
            .finish()
    }
}
