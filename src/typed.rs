//! Typed façade over [`Cache`]
//!
//! Installs a default-construct hook and a drop hook for one element type,
//! so every pointer handed out refers to a live, value-initialized `T`.
//! Adds no behavior beyond that.

use std::marker::PhantomData;
use std::mem;
use std::ptr::{self, NonNull};

use crate::cache::{Cache, CacheStats, ObjectCallback, DEFAULT_ALIGN};
use crate::error::Result;

/// Object cache for a concrete element type.
pub struct TypedCache<T: Default + 'static> {
    cache: Cache,
    _marker: PhantomData<T>,
}

impl<T: Default + 'static> TypedCache<T> {
    /// Create a typed cache with natural alignment for `T`, single-threaded
    /// use declared.
    ///
    /// # Panics
    ///
    /// Panics for zero-sized `T`.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_options(name, None, false)
    }

    /// Create a typed cache with an explicit alignment and thread-safety
    /// declaration. `align` of `None` uses the larger of `T`'s alignment and
    /// the cache default.
    pub fn with_options(name: impl Into<String>, align: Option<usize>, thread_safe: bool) -> Self {
        let ctor: ObjectCallback = Box::new(|p, _| {
            // SAFETY: the cache hands out slots of at least size_of::<T>()
            // bytes, aligned for T per the alignment chosen below.
            unsafe { ptr::write(p as *mut T, T::default()) }
        });
        let dtor: ObjectCallback = Box::new(|p, _| {
            // SAFETY: every freed slot holds the live T written by the
            // construct hook.
            unsafe { ptr::drop_in_place(p as *mut T) }
        });
        let align = align.unwrap_or_else(|| mem::align_of::<T>().max(DEFAULT_ALIGN));
        Self {
            cache: Cache::with_options(
                name,
                mem::size_of::<T>(),
                Some(align),
                Some(ctor),
                Some(dtor),
                thread_safe,
            ),
            _marker: PhantomData,
        }
    }

    /// Allocate a slot holding a default-constructed `T`.
    pub fn alloc(&self) -> Result<NonNull<T>> {
        self.cache.alloc().map(NonNull::cast)
    }

    /// Drop the `T` in the slot and return the slot to its slab.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`alloc`](TypedCache::alloc) on this
    /// cache and not freed since.
    pub unsafe fn free(&self, ptr: NonNull<T>) {
        // SAFETY: forwarded from the caller.
        unsafe { self.cache.free(ptr.as_ptr() as *mut u8) }
    }

    /// Slot stride in bytes.
    pub fn effective_size(&self) -> usize {
        self.cache.effective_size()
    }

    /// Objects per slab.
    pub fn slab_maxbuf(&self) -> usize {
        self.cache.slab_maxbuf()
    }

    /// Snapshot of the underlying cache's slab population.
    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }
}
