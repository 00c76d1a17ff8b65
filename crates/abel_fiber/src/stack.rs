// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Fiber stack lifecycle.
//!
//! Two stack types exist:
//!
//! * *User stacks* run user code. Their size is configured once at startup
//!   ([`configure_stacks`]) and a guard page below the stack traps overflow.
//!   They are memory-map heavy (the guard page costs a dedicated VMA), so
//!   their cache water marks stay modest to keep the process clear of the
//!   `vm.max_map_count` limit.
//!
//! * *System stacks* run only runtime-internal code, are small, statically
//!   sized and have no guard page. Overflow detection falls to two canary
//!   words at the stack limit, checked whenever a stack passes through the
//!   pool. Under AddressSanitizer the canary window is shadow-poisoned
//!   instead, which catches the overflow at the overflowing store itself.

use std::mem::MaybeUninit;
use std::ptr::NonNull;
use std::sync::OnceLock;
use std::time::Duration;

use abel_pool::{PoolBackend, Pooled, PooledPtr, acquire};

/// One-shot startup configuration for user stacks.
#[derive(Clone, Copy, Debug)]
pub struct StackConfig {
    /// Bytes of usable stack per fiber, rounded up to the page size.
    pub stack_size: usize,

    /// Whether a guard page precedes each user stack.
    pub guard_page_enabled: bool,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            stack_size: 128 * 1024,
            guard_page_enabled: true,
        }
    }
}

static CONFIG: OnceLock<StackConfig> = OnceLock::new();

/// Applies the stack configuration, once per process, before the first stack
/// is created. Returns `false` when the configuration was already fixed
/// (explicitly, or implicitly by an earlier stack allocation).
pub fn configure_stacks(config: StackConfig) -> bool {
    CONFIG.set(config).is_ok()
}

fn effective_config() -> &'static StackConfig {
    CONFIG.get_or_init(StackConfig::default)
}

fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

    *PAGE_SIZE.get_or_init(|| {
        // SAFETY: sysconf is always safe to call.
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        usize::try_from(page).expect("page size is always a small positive integer")
    })
}

/// Logs the diagnostic and takes the process down. Infrastructure-level
/// invariants are not worth limping past.
#[cold]
pub(crate) fn die(message: &str) -> ! {
    tracing::error!("{message}");
    std::process::abort();
}

/// A guard-paged region of memory a fiber executes user code on.
///
/// The region is `stack_size` usable bytes; stacks grow downward from
/// [`stack_top`][Self::stack_top] and overflow traps on the guard page just
/// below [`limit`][Self::limit].
#[derive(Debug)]
pub struct UserStack {
    region: NonNull<u8>,
    total_len: usize,
    guard_len: usize,
}

impl UserStack {
    /// Lowest usable address of the stack.
    #[must_use]
    pub fn limit(&self) -> *mut u8 {
        // SAFETY: guard_len is within the mapped region.
        unsafe { self.region.as_ptr().add(self.guard_len) }
    }

    /// One past the highest usable address; where a fiber's stack pointer
    /// starts.
    #[must_use]
    pub fn stack_top(&self) -> *mut u8 {
        // SAFETY: total_len is the extent of the mapped region.
        unsafe { self.region.as_ptr().add(self.total_len) }
    }

    /// Usable bytes between [`limit`][Self::limit] and
    /// [`stack_top`][Self::stack_top].
    #[must_use]
    pub fn size(&self) -> usize {
        self.total_len - self.guard_len
    }

    fn map_new() -> Self {
        let config = effective_config();
        let page = page_size();

        let usable = config.stack_size.div_ceil(page).max(1) * page;
        let guard_len = if config.guard_page_enabled { page } else { 0 };
        let total_len = usable + guard_len;

        // SAFETY: A fresh anonymous private mapping, no file descriptor.
        let region = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if region == libc::MAP_FAILED {
            die("out of memory: cannot map a fiber stack");
        }

        if guard_len > 0 {
            // The guard page sits at the low-address end, where a growing
            // stack would run into it.
            //
            // SAFETY: The range is within the mapping we just created.
            if unsafe { libc::mprotect(region, guard_len, libc::PROT_NONE) } != 0 {
                die("cannot protect the guard page of a fiber stack");
            }
        }

        Self {
            region: NonNull::new(region.cast()).expect("MAP_FAILED was handled above"),
            total_len,
            guard_len,
        }
    }
}

impl Drop for UserStack {
    fn drop(&mut self) {
        // SAFETY: We mapped exactly this region in `map_new`.
        if unsafe { libc::munmap(self.region.as_ptr().cast(), self.total_len) } != 0 {
            die("cannot unmap a fiber stack");
        }
    }
}

// SAFETY: The stack region is exclusively owned plain memory.
unsafe impl Send for UserStack {}

impl Pooled for UserStack {
    const BACKEND: PoolBackend = PoolBackend::ThreadLocal;
    const LOW_WATER_MARK: usize = 512;
    // Don't set the high water mark too large, or we risk running out of
    // `vm.max_map_count`.
    const HIGH_WATER_MARK: usize = 16384;
    const MAX_IDLE: Duration = Duration::from_secs(10);
    const MIN_THREAD_CACHE_SIZE: usize = 32;
    // Allocating more stacks than necessary also risks the map count limit.
    const TRANSFER_BATCH_SIZE: usize = 128;

    fn create() -> Box<Self> {
        let stack = Box::new(Self::map_new());

        // Poisoned immediately; un-poisoned prior to use. This catches
        // use-after-free of the stack as well.
        #[cfg(feature = "asan")]
        asan::poison(stack.limit(), stack.size());

        stack
    }

    #[cfg(feature = "asan")]
    fn on_acquire(&mut self) {
        asan::unpoison(self.limit(), self.size());
    }

    #[cfg(feature = "asan")]
    fn on_release(&mut self) {
        asan::poison(self.limit(), self.size());
    }
}

/// Allocates a user stack from the current thread's cache.
#[must_use]
pub fn acquire_user_stack() -> PooledPtr<UserStack> {
    acquire::<UserStack>()
}

/// Bytes at the low end of a system stack left shadow-poisoned to act as a
/// guard region.
#[cfg(feature = "asan")]
const SYSTEM_STACK_POISONED_SIZE: usize = 4096;

/// Size of a system stack. Runtime-internal code keeps its frames small, so
/// this never needs to grow.
#[cfg(feature = "asan")]
pub const SYSTEM_STACK_SIZE: usize = 16384 + SYSTEM_STACK_POISONED_SIZE;
#[cfg(not(feature = "asan"))]
pub const SYSTEM_STACK_SIZE: usize = 16384 * 2;

// EncodeHex("FlareStackCanary"): 466c617265537461 636b43616e617279
const STACK_CANARY0: u64 = 0x466c_6172_6553_7461;
const STACK_CANARY1: u64 = 0x636b_4361_6e61_7279;

/// A statically sized stack for runtime-internal code, with no guard page.
///
/// The two 64-bit words at the stack limit hold canary values; a canary that
/// has been overwritten means a frame ran past the limit, and the process
/// aborts when the stack passes through the pool. Changing the canary
/// constants invalidates any cached system stack and requires a full
/// restart.
#[repr(align(16))]
pub struct SystemStack {
    bytes: [MaybeUninit<u8>; SYSTEM_STACK_SIZE],
}

impl SystemStack {
    /// Lowest address of the stack region (the stack limit).
    #[must_use]
    pub fn limit(&mut self) -> *mut u8 {
        self.bytes.as_mut_ptr().cast()
    }

    /// One past the highest address; where the stack pointer starts.
    #[must_use]
    pub fn stack_top(&mut self) -> *mut u8 {
        // SAFETY: One-past-the-end of the owned array.
        unsafe { self.limit().add(SYSTEM_STACK_SIZE) }
    }

    fn new_boxed() -> Box<Self> {
        // Via new_uninit so the array never sits on the creating stack.
        let stack = Box::<Self>::new_uninit();

        // SAFETY: Every byte of the type is MaybeUninit.
        unsafe { stack.assume_init() }
    }

    #[cfg(any(not(feature = "asan"), test))]
    fn initialize_canaries(&mut self) {
        let words = self.limit().cast::<u64>();

        // SAFETY: The region is ours and 16-byte aligned, so both word
        // slots are in bounds and aligned.
        unsafe {
            words.write(STACK_CANARY0);
            words.add(1).write(STACK_CANARY1);
        }
    }

    /// Whether both canary words still hold their constants.
    #[cfg(any(not(feature = "asan"), test))]
    fn canaries_intact(&self) -> bool {
        let words = self.bytes.as_ptr().cast::<u64>();

        // SAFETY: As in `initialize_canaries`; the words were initialized at
        // creation.
        unsafe { words.read() == STACK_CANARY0 && words.add(1).read() == STACK_CANARY1 }
    }

    #[cfg(not(feature = "asan"))]
    fn verify_canaries(&self) {
        if !self.canaries_intact() {
            die("a stack canary was overwritten - the stack is corrupted");
        }
    }
}

impl std::fmt::Debug for SystemStack {
    #[cfg_attr(test, mutants::skip)] // We have no contract to test here - can return anything.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemStack").field("size", &SYSTEM_STACK_SIZE).finish()
    }
}

impl Pooled for SystemStack {
    const BACKEND: PoolBackend = PoolBackend::ThreadLocal;
    const LOW_WATER_MARK: usize = 4096;
    const HIGH_WATER_MARK: usize = usize::MAX;
    const MAX_IDLE: Duration = Duration::from_secs(10);
    const MIN_THREAD_CACHE_SIZE: usize = 128;
    const TRANSFER_BATCH_SIZE: usize = 512;

    fn create() -> Box<Self> {
        let mut stack = Self::new_boxed();

        // Canary values are of no use under ASan; there the bytes at the
        // stack limit are poisoned instead, which catches the overflow at
        // the overflowing store rather than at deallocation.
        #[cfg(not(feature = "asan"))]
        stack.initialize_canaries();

        #[cfg(feature = "asan")]
        asan::poison(stack.limit(), SYSTEM_STACK_SIZE);

        stack
    }

    fn on_acquire(&mut self) {
        #[cfg(not(feature = "asan"))]
        self.verify_canaries();

        // The first bytes stay poisoned, playing the role of a guard page.
        #[cfg(feature = "asan")]
        {
            let (usable, len) = self.usable_region();
            asan::unpoison(usable, len);
        }
    }

    fn on_release(&mut self) {
        // Don't overflow our stack.
        #[cfg(not(feature = "asan"))]
        self.verify_canaries();

        #[cfg(feature = "asan")]
        {
            let (usable, len) = self.usable_region();
            asan::poison(usable, len);
        }
    }
}

#[cfg(feature = "asan")]
impl SystemStack {
    fn usable_region(&mut self) -> (*mut u8, usize) {
        // SAFETY: The poisoned window is within the owned array.
        let usable = unsafe { self.limit().add(SYSTEM_STACK_POISONED_SIZE) };
        (usable, SYSTEM_STACK_SIZE - SYSTEM_STACK_POISONED_SIZE)
    }
}

/// Allocates a system stack from the current thread's cache, verifying its
/// canaries on the way out.
#[must_use]
pub fn acquire_system_stack() -> PooledPtr<SystemStack> {
    acquire::<SystemStack>()
}

#[cfg(feature = "asan")]
mod asan {
    unsafe extern "C" {
        fn __asan_poison_memory_region(addr: *const core::ffi::c_void, size: usize);
        fn __asan_unpoison_memory_region(addr: *const core::ffi::c_void, size: usize);
    }

    pub(super) fn poison(addr: *mut u8, size: usize) {
        // SAFETY: Callers pass a region they own.
        unsafe { __asan_poison_memory_region(addr.cast(), size) };
    }

    pub(super) fn unpoison(addr: *mut u8, size: usize) {
        // SAFETY: Callers pass a region they own.
        unsafe { __asan_unpoison_memory_region(addr.cast(), size) };
    }
}
