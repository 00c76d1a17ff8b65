// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::mem::MaybeUninit;
use std::num::NonZero;
use std::sync::Arc;
use std::time::Duration;

use abel_pool::{PoolBackend, Pooled, PooledPtr, acquire};
use new_zealand::nz;

/// Capacity of the block size the builder and the read path work with.
pub(crate) const SMALL_BLOCK_SIZE: NonZero<usize> = nz!(4096);
pub(crate) const LARGE_BLOCK_SIZE: NonZero<usize> = nz!(65_536);
pub(crate) const HUGE_BLOCK_SIZE: NonZero<usize> = nz!(1_048_576);

/// One pooled chunk of contiguous bytes.
///
/// Aligned to the cache line so adjacent blocks never share one. The bytes
/// start uninitialized; whoever fills a block is responsible for only ever
/// exposing the written prefix through slices.
#[repr(align(64))]
pub(crate) struct NativeBlock<const SIZE: usize> {
    bytes: [MaybeUninit<u8>; SIZE],
}

impl<const SIZE: usize> NativeBlock<SIZE> {
    fn new_boxed() -> Box<Self> {
        // Via new_uninit so the larger variants never sit on the stack.
        let block = Box::<Self>::new_uninit();

        // SAFETY: Every byte of the type is MaybeUninit, so "uninitialized"
        // is a fully valid state for it.
        unsafe { block.assume_init() }
    }

    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.bytes.as_ptr().cast()
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut u8 {
        self.bytes.as_mut_ptr().cast()
    }
}

pub(crate) type SmallBlock = NativeBlock<{ SMALL_BLOCK_SIZE.get() }>;
pub(crate) type LargeBlock = NativeBlock<{ LARGE_BLOCK_SIZE.get() }>;
pub(crate) type HugeBlock = NativeBlock<{ HUGE_BLOCK_SIZE.get() }>;

impl Pooled for SmallBlock {
    const BACKEND: PoolBackend = PoolBackend::ThreadLocal;
    const LOW_WATER_MARK: usize = 16384; // 64M per node.
    const HIGH_WATER_MARK: usize = usize::MAX;
    const MAX_IDLE: Duration = Duration::from_secs(10);
    const MIN_THREAD_CACHE_SIZE: usize = 4096; // 16M per thread.
    const TRANSFER_BATCH_SIZE: usize = 1024; // Extra 4M.

    fn create() -> Box<Self> {
        Self::new_boxed()
    }
}

impl Pooled for LargeBlock {
    const BACKEND: PoolBackend = PoolBackend::ThreadLocal;
    const LOW_WATER_MARK: usize = 1024; // 64M per node.
    const HIGH_WATER_MARK: usize = usize::MAX;
    const MAX_IDLE: Duration = Duration::from_secs(10);
    const MIN_THREAD_CACHE_SIZE: usize = 256; // 16M per thread.
    const TRANSFER_BATCH_SIZE: usize = 64; // Extra 4M.

    fn create() -> Box<Self> {
        Self::new_boxed()
    }
}

impl Pooled for HugeBlock {
    const BACKEND: PoolBackend = PoolBackend::ThreadLocal;
    const LOW_WATER_MARK: usize = 128; // 128M per node.
    const HIGH_WATER_MARK: usize = usize::MAX;
    const MAX_IDLE: Duration = Duration::from_secs(10);
    const MIN_THREAD_CACHE_SIZE: usize = 64; // 64M per thread.
    const TRANSFER_BATCH_SIZE: usize = 16; // Extra 16M.

    fn create() -> Box<Self> {
        Self::new_boxed()
    }
}

/// The native block capacities the pool hands out.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum NativeBlockSize {
    /// 4 KiB.
    #[default]
    Small,
    /// 64 KiB.
    Large,
    /// 1 MiB.
    Huge,
}

/// Exclusive ownership of a native block that is still being filled.
///
/// This is the writable stage of a block's life, used by the builder and by
/// scatter-gather read paths that fill blocks directly from the kernel. Once
/// the written prefix is final, [`into_slice`][Self::into_slice] converts
/// the handle into a [`BufSlice`] with shared ownership; there is no way
/// back to exclusive.
pub struct ExclusiveBlock {
    inner: ExclusiveInner,
}

enum ExclusiveInner {
    Small(PooledPtr<SmallBlock>),
    Large(PooledPtr<LargeBlock>),
    Huge(PooledPtr<HugeBlock>),
}

impl ExclusiveBlock {
    /// Takes a fresh block of the given capacity from its pool.
    #[must_use]
    pub fn acquire(size: NativeBlockSize) -> Self {
        let inner = match size {
            NativeBlockSize::Small => ExclusiveInner::Small(acquire::<SmallBlock>()),
            NativeBlockSize::Large => ExclusiveInner::Large(acquire::<LargeBlock>()),
            NativeBlockSize::Huge => ExclusiveInner::Huge(acquire::<HugeBlock>()),
        };

        Self { inner }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        match self.inner {
            ExclusiveInner::Small(_) => SMALL_BLOCK_SIZE.get(),
            ExclusiveInner::Large(_) => LARGE_BLOCK_SIZE.get(),
            ExclusiveInner::Huge(_) => HUGE_BLOCK_SIZE.get(),
        }
    }

    /// The block's bytes, none of which are initialized yet as far as this
    /// handle knows.
    pub fn spare_capacity_mut(&mut self) -> &mut [MaybeUninit<u8>] {
        let capacity = self.capacity();
        let start = self.as_mut_ptr().cast::<MaybeUninit<u8>>();

        // SAFETY: This handle exclusively owns the block, and `capacity`
        // bytes is exactly its extent.
        unsafe { std::slice::from_raw_parts_mut(start, capacity) }
    }

    /// Converts this block into a slice over its first `len` bytes, giving
    /// up exclusive ownership.
    ///
    /// # Safety
    ///
    /// The first `len` bytes of the block must have been initialized.
    #[must_use]
    pub unsafe fn into_slice(self, len: usize) -> crate::BufSlice {
        crate::BufSlice::from_block(self.share(), 0, len)
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut u8 {
        match &mut self.inner {
            ExclusiveInner::Small(block) => block.as_mut_ptr(),
            ExclusiveInner::Large(block) => block.as_mut_ptr(),
            ExclusiveInner::Huge(block) => block.as_mut_ptr(),
        }
    }

    pub(crate) fn share(self) -> Block {
        let storage = match self.inner {
            ExclusiveInner::Small(block) => BlockStorage::Small(block),
            ExclusiveInner::Large(block) => BlockStorage::Large(block),
            ExclusiveInner::Huge(block) => BlockStorage::Huge(block),
        };

        Block { storage: Arc::new(storage) }
    }
}

impl fmt::Debug for ExclusiveBlock {
    #[cfg_attr(test, mutants::skip)] // We have no contract to test here - can return anything.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExclusiveBlock").field("capacity", &self.capacity()).finish()
    }
}

/// Shared ownership of one contiguous byte region.
///
/// Dropping the last clone releases the storage: native blocks return to
/// their pool, owning storage is freed, and referenced storage runs its
/// completion callback.
#[derive(Clone)]
pub(crate) struct Block {
    storage: Arc<BlockStorage>,
}

impl Block {
    pub(crate) fn owning(bytes: Box<[u8]>) -> Self {
        Self {
            storage: Arc::new(BlockStorage::Owned(bytes)),
        }
    }

    /// # Safety
    ///
    /// The caller must guarantee the region stays valid and unmutated until
    /// the last clone of this block is dropped.
    pub(crate) unsafe fn referencing(ptr: *const u8, len: usize, completion: Option<Box<dyn FnOnce() + Send>>) -> Self {
        Self {
            storage: Arc::new(BlockStorage::Referenced(ReferencedRegion { ptr, len, completion })),
        }
    }

    pub(crate) fn as_ptr(&self) -> *const u8 {
        match &*self.storage {
            BlockStorage::Small(block) => block.as_ptr(),
            BlockStorage::Large(block) => block.as_ptr(),
            BlockStorage::Huge(block) => block.as_ptr(),
            BlockStorage::Owned(bytes) => bytes.as_ptr(),
            BlockStorage::Referenced(region) => region.ptr,
        }
    }

    /// Capacity of the region. For a native block this is the full block
    /// size, not the written prefix; slices track the latter.
    pub(crate) fn len(&self) -> usize {
        match &*self.storage {
            BlockStorage::Small(_) => SMALL_BLOCK_SIZE.get(),
            BlockStorage::Large(_) => LARGE_BLOCK_SIZE.get(),
            BlockStorage::Huge(_) => HUGE_BLOCK_SIZE.get(),
            BlockStorage::Owned(bytes) => bytes.len(),
            BlockStorage::Referenced(region) => region.len,
        }
    }
}

impl fmt::Debug for Block {
    #[cfg_attr(test, mutants::skip)] // We have no contract to test here - can return anything.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block").field("len", &self.len()).finish()
    }
}

enum BlockStorage {
    Small(PooledPtr<SmallBlock>),
    Large(PooledPtr<LargeBlock>),
    Huge(PooledPtr<HugeBlock>),
    Owned(Box<[u8]>),
    Referenced(ReferencedRegion),
}

struct ReferencedRegion {
    ptr: *const u8,
    len: usize,
    completion: Option<Box<dyn FnOnce() + Send>>,
}

impl Drop for ReferencedRegion {
    fn drop(&mut self) {
        if let Some(completion) = self.completion.take() {
            completion();
        }
    }
}

// SAFETY: The creator of a referenced region promises (it is an unsafe
// constructor) that the region stays valid wherever the block travels, and
// the bytes are never mutated through it.
unsafe impl Send for ReferencedRegion {}

// SAFETY: As above; only immutable access exists.
unsafe impl Sync for ReferencedRegion {}
