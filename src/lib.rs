// slabcache - fixed-size object cache
// Carves page-aligned slabs into equal-size slots and recycles them.

#![warn(rust_2018_idioms)]

//! Fixed-size object cache.
//!
//! A [`Cache`] is parameterized with one object size and hands out aligned
//! slots carved from page-aligned *slabs*. Each slab keeps its own free
//! list, and the cache keeps partially-full slabs at the front of its slab
//! list so allocation never scans.
//!
//! # Architecture
//!
//! ```text
//! Cache("connections", 96 bytes)
//!   ├─→ Slab (partial, 3/42 in use)   ← alloc always pops here
//!   ├─→ Slab (partial, 40/42 in use)
//!   └─→ Slab (full, 42/42 in use)     ← full slabs sink to the back
//! ```
//!
//! Two storage regimes sit behind the same interface:
//!
//! - **Small objects** (size ≤ page/8): one slab is exactly one page, the
//!   slab header lives in the tail of that page, and the free list is
//!   threaded through the free slots themselves. The owning slab of any
//!   pointer is recovered by rounding down to the page base.
//! - **Large objects**: the backing block spans several pages, bookkeeping
//!   lives off-slab in a buffer-control array, and an address lookup map
//!   finds the owning record on free.
//!
//! # Example
//!
//! ```
//! use slabcache::Cache;
//!
//! let cache = Cache::new("widgets", 24);
//! let obj = cache.alloc().expect("out of memory");
//! unsafe { cache.free(obj.as_ptr()) };
//! ```

pub mod bench;
pub mod cache;
pub mod page;
mod slab;
pub mod stress_tests;
pub mod typed;

// Re-exports for convenience
pub use cache::{Cache, CacheStats, ObjectCallback, DEFAULT_ALIGN};
pub use typed::TypedCache;

/// Allocator error types
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("out of memory: could not acquire {requested} bytes of page-aligned backing")]
        OutOfMemory { requested: usize },
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
