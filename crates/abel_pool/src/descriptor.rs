// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::any::TypeId;
use std::collections::HashMap;
use std::mem;
use std::ptr::NonNull;
use std::sync::{LazyLock, Mutex};
use std::time::Duration;

use crate::shared::SharedPool;
use crate::traits::{PoolBackend, Pooled};

/// The process-wide description of one pooled type.
///
/// Exactly one descriptor exists per type; its address is the type's
/// identity for every erased code path (thread caches, shared pools, the
/// wash). The function pointers perform construction, destruction and the
/// acquire/release hooks without virtual dispatch.
pub struct TypeDescriptor {
    pub(crate) type_name: &'static str,
    pub(crate) size: usize,
    pub(crate) align: usize,

    pub(crate) backend: PoolBackend,
    pub(crate) low_water_mark: usize,
    pub(crate) high_water_mark: usize,
    pub(crate) max_idle: Duration,
    pub(crate) min_thread_cache_size: usize,
    pub(crate) transfer_batch_size: usize,

    pub(crate) create: fn() -> NonNull<u8>,
    pub(crate) destroy: unsafe fn(NonNull<u8>),
    pub(crate) on_acquire: unsafe fn(NonNull<u8>),
    pub(crate) on_release: unsafe fn(NonNull<u8>),

    /// Shared storage behind the thread caches; `None` for backends without
    /// cross-thread transfers.
    pub(crate) shared: Option<SharedPool>,
}

impl TypeDescriptor {
    /// The name of the pooled type, for diagnostics.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Size in bytes of one cell.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Alignment in bytes of one cell.
    #[must_use]
    pub fn align(&self) -> usize {
        self.align
    }
}

impl std::fmt::Debug for TypeDescriptor {
    #[cfg_attr(test, mutants::skip)] // We have no contract to test here - can return anything.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("type_name", &self.type_name)
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}

fn create_cell<T: Pooled>() -> NonNull<u8> {
    // Box aborts the process on allocation failure, which is exactly the
    // failure semantics this layer wants.
    let raw = Box::into_raw(T::create());

    // SAFETY: Box::into_raw never returns null.
    unsafe { NonNull::new_unchecked(raw) }.cast()
}

unsafe fn destroy_cell<T: Pooled>(cell: NonNull<u8>) {
    // SAFETY: The caller guarantees `cell` was produced by `create_cell::<T>`
    // for the same `T` and is not referenced anywhere else.
    drop(unsafe { Box::from_raw(cell.cast::<T>().as_ptr()) });
}

unsafe fn on_acquire_cell<T: Pooled>(cell: NonNull<u8>) {
    // SAFETY: The caller guarantees `cell` is a live, exclusively held cell
    // of type `T`.
    unsafe { cell.cast::<T>().as_mut() }.on_acquire();
}

unsafe fn on_release_cell<T: Pooled>(cell: NonNull<u8>) {
    // SAFETY: As in `on_acquire_cell`.
    unsafe { cell.cast::<T>().as_mut() }.on_release();
}

/// One leaked descriptor per `TypeId`, created on first use. Leaking keeps
/// the address stable for the lifetime of the process, which is what makes
/// the address usable as the type's identity.
static REGISTRY: LazyLock<Mutex<HashMap<TypeId, &'static TypeDescriptor>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

const ERR_POISONED_LOCK: &str = "lock poisoned - pool invariants may not hold, not safe to continue";

/// Returns the process-wide descriptor of `T`, creating it on first use.
pub fn descriptor_of<T: Pooled>() -> &'static TypeDescriptor {
    let mut registry = REGISTRY.lock().expect(ERR_POISONED_LOCK);

    registry.entry(TypeId::of::<T>()).or_insert_with(|| {
        tracing::debug!(type_name = std::any::type_name::<T>(), backend = ?T::BACKEND, "registering pool descriptor");

        let descriptor = TypeDescriptor {
            type_name: std::any::type_name::<T>(),
            size: mem::size_of::<T>(),
            align: mem::align_of::<T>(),
            backend: T::BACKEND,
            low_water_mark: T::LOW_WATER_MARK,
            high_water_mark: T::HIGH_WATER_MARK,
            max_idle: T::MAX_IDLE,
            min_thread_cache_size: T::MIN_THREAD_CACHE_SIZE,
            transfer_batch_size: T::TRANSFER_BATCH_SIZE,
            create: create_cell::<T>,
            destroy: destroy_cell::<T>,
            on_acquire: on_acquire_cell::<T>,
            on_release: on_release_cell::<T>,
            shared: SharedPool::for_backend(T::BACKEND),
        };

        Box::leak(Box::new(descriptor))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Widget(#[expect(dead_code, reason = "field only gives the type a size")] u64);

    impl Pooled for Widget {
        const BACKEND: PoolBackend = PoolBackend::ThreadLocal;

        fn create() -> Box<Self> {
            Box::new(Self(0))
        }
    }

    #[test]
    fn descriptor_identity_is_stable() {
        let a = descriptor_of::<Widget>();
        let b = descriptor_of::<Widget>();

        assert!(std::ptr::eq(a, b));
    }

    #[test]
    fn descriptor_reflects_type() {
        let desc = descriptor_of::<Widget>();

        assert_eq!(desc.size(), size_of::<Widget>());
        assert_eq!(desc.align(), align_of::<Widget>());
        assert_eq!(desc.backend, PoolBackend::ThreadLocal);
        assert!(desc.type_name().contains("Widget"));
    }

    #[test]
    fn distinct_types_get_distinct_descriptors() {
        struct Other;

        impl Pooled for Other {
            const BACKEND: PoolBackend = PoolBackend::Disabled;

            fn create() -> Box<Self> {
                Box::new(Self)
            }
        }

        let a = descriptor_of::<Widget>();
        let b = descriptor_of::<Other>();

        assert!(!std::ptr::eq(a, b));
    }
}
