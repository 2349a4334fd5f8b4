//! Fixed-size object cache
//!
//! A [`Cache`] owns a circular list of slabs and serves one object size.
//! Small objects (size ≤ page/8) pack into single-page slabs whose header
//! sits in the tail of the page; large objects use multi-page backing
//! blocks with off-slab bookkeeping and an address lookup map.
//!
//! Allocation only ever inspects the head of the slab list: partial slabs
//! stay in front, full slabs sink to the back, and a slab that loses its
//! last object is handed back to the OS.

use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, info};

use crate::error::Result;
use crate::page::{self, alloc_pages, free_pages};
use crate::slab::{BufCtl, Slab, SlabList};

/// Object alignment applied when none is requested.
pub const DEFAULT_ALIGN: usize = 8;

/// Large-regime slabs always carry this many objects.
const LARGE_SLAB_OBJECTS: usize = 8;

/// Construct/destruct hook. Receives the object address and the nominal
/// object size. Must not re-enter the cache it is installed on.
pub type ObjectCallback = Box<dyn Fn(*mut u8, usize) + Send + Sync>;

/// Fixed-size object cache over page-aligned slabs.
///
/// Geometry (effective size, objects per slab, storage regime) is frozen at
/// construction; no slab is allocated until the first [`alloc`](Cache::alloc).
pub struct Cache {
    name: String,
    object_size: usize,
    effective_size: usize,
    small_threshold: usize,
    slab_maxbuf: usize,
    ctor: Option<ObjectCallback>,
    dtor: Option<ObjectCallback>,
    thread_safe: bool,
    inner: Mutex<CacheInner>,
}

struct CacheInner {
    slabs: SlabList,
    /// Object address → owning buffer-control record (large regime only).
    large_lookup: HashMap<usize, *mut BufCtl>,
}

// SAFETY: every raw pointer behind `inner` references memory exclusively
// owned by this cache (slab pages, heap slab headers, bufctl arrays), and
// all access to that state goes through the mutex. The callbacks are
// required to be Send + Sync by `ObjectCallback`.
unsafe impl Send for Cache {}
unsafe impl Sync for Cache {}

impl Cache {
    /// Create a cache with default alignment, no callbacks, single-threaded
    /// use declared.
    pub fn new(name: impl Into<String>, object_size: usize) -> Self {
        Self::with_options(name, object_size, None, None, None, false)
    }

    /// Create a cache with explicit options.
    ///
    /// # Arguments
    /// * `align` - object alignment; `None` means 8. Must be a power of two
    ///   no smaller than a machine word.
    /// * `ctor` / `dtor` - invoked on every object handed out / returned.
    /// * `thread_safe` - declare that the cache will be shared across
    ///   threads.
    ///
    /// # Panics
    ///
    /// Panics when `object_size` is zero, when the alignment is invalid, or
    /// when no object of the requested size fits a slab.
    pub fn with_options(
        name: impl Into<String>,
        object_size: usize,
        align: Option<usize>,
        ctor: Option<ObjectCallback>,
        dtor: Option<ObjectCallback>,
        thread_safe: bool,
    ) -> Self {
        let name = name.into();
        assert!(object_size > 0, "object size must be non-zero");
        let align = align.unwrap_or(DEFAULT_ALIGN);
        assert!(align.is_power_of_two(), "alignment must be a power of two");
        // The small-regime free list stores a pointer in each free slot's
        // first word, so every slot must be able to hold one.
        assert!(
            align >= mem::size_of::<usize>(),
            "alignment must be at least a machine word"
        );

        let pg = page::page_size();
        let effective_size = align * ((object_size + align - 1) / align);
        let small_threshold = pg / 8;
        let slab_maxbuf = if object_size <= small_threshold {
            (pg - mem::size_of::<Slab>()) / effective_size
        } else {
            LARGE_SLAB_OBJECTS
        };
        assert!(
            slab_maxbuf >= 1,
            "no object of effective size {} fits a slab",
            effective_size
        );

        info!(
            name = %name,
            object_size,
            effective_size,
            slab_maxbuf,
            thread_safe,
            "created object cache"
        );

        Self {
            name,
            object_size,
            effective_size,
            small_threshold,
            slab_maxbuf,
            ctor,
            dtor,
            thread_safe,
            inner: Mutex::new(CacheInner {
                slabs: SlabList::new(),
                large_lookup: HashMap::new(),
            }),
        }
    }

    /// Allocate one object slot.
    ///
    /// The returned pointer addresses an `effective_size()`-byte region
    /// aligned as requested at construction. When a construct callback is
    /// installed it has already run on the slot.
    pub fn alloc(&self) -> Result<NonNull<u8>> {
        let mut inner = self.lock_inner();

        if inner.slabs.is_empty() {
            self.grow(&mut inner)?;
        }
        // The list keeps partial slabs in front, so a full head means every
        // slab is full.
        // SAFETY: the head of a non-empty list is a live slab we own.
        if unsafe { (*inner.slabs.head()).in_use } == self.slab_maxbuf {
            self.grow(&mut inner)?;
        }

        let head = inner.slabs.head();
        // SAFETY: `head` is live and not full, so its free list is non-empty.
        let buf = unsafe {
            let slab = &mut *head;
            let buf = if self.is_small_object() {
                let buf = slab.free_list;
                debug_assert!(!buf.is_null(), "free list empty on a non-full slab");
                slab.free_list = *(buf as *mut *mut u8);
                buf
            } else {
                let ctl = slab.free_list as *mut BufCtl;
                debug_assert!(!ctl.is_null(), "free list empty on a non-full slab");
                slab.free_list = (*ctl).next as *mut u8;
                (*ctl).buf
            };
            slab.in_use += 1;
            buf
        };

        if let Some(ctor) = &self.ctor {
            ctor(buf, self.object_size);
        }

        // SAFETY: `head` stays linked and live across the callback.
        unsafe {
            if (*head).in_use == self.slab_maxbuf {
                inner.slabs.move_to_back(head);
            }
        }

        // SAFETY: slots are carved from non-null backing blocks.
        Ok(unsafe { NonNull::new_unchecked(buf) })
    }

    /// Return an object slot. Null is ignored.
    ///
    /// When a destruct callback is installed it runs on the slot before the
    /// slot rejoins its slab's free list. A slab that loses its last object
    /// is released to the OS together with all of its bookkeeping.
    ///
    /// # Safety
    ///
    /// `buf` must be null or a pointer previously returned by [`alloc`]
    /// on this cache and not freed since. Violations are detected and
    /// asserted where the structure allows (large-regime lookup miss,
    /// small-regime page-base mismatch) but cannot be detected in general.
    ///
    /// [`alloc`]: Cache::alloc
    pub unsafe fn free(&self, buf: *mut u8) {
        if buf.is_null() {
            return;
        }
        let mut inner = self.lock_inner();
        if self.is_small_object() {
            // SAFETY: forwarded from the caller.
            unsafe { self.free_small(&mut inner, buf) }
        } else {
            // SAFETY: forwarded from the caller.
            unsafe { self.free_large(&mut inner, buf) }
        }
    }

    /// Release every slab unconditionally.
    ///
    /// Destruct callbacks do not run: objects still outstanding at this
    /// point are a caller bug, and their memory is reclaimed wholesale. The
    /// cache itself stays usable and regrows on the next [`alloc`](Cache::alloc).
    pub fn destroy(&self) {
        let mut inner = self.lock_inner();
        self.destroy_locked(&mut inner);
    }

    /// Cache name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Nominal object size as given at construction.
    pub fn object_size(&self) -> usize {
        self.object_size
    }

    /// Object size rounded up to the alignment; the stride between slots.
    pub fn effective_size(&self) -> usize {
        self.effective_size
    }

    /// Objects per slab.
    pub fn slab_maxbuf(&self) -> usize {
        self.slab_maxbuf
    }

    /// Whether cross-thread sharing was declared at construction.
    pub fn thread_safe(&self) -> bool {
        self.thread_safe
    }

    /// True when the cache uses the small-object storage regime.
    pub fn is_small_object(&self) -> bool {
        self.object_size <= self.small_threshold
    }

    /// Point-in-time snapshot of the slab population.
    pub fn stats(&self) -> CacheStats {
        let inner = self.lock_inner();
        let mut stats = CacheStats::default();
        let head = inner.slabs.head();
        if !head.is_null() {
            let mut cur = head;
            loop {
                // SAFETY: every linked slab is live and owned by this cache.
                let in_use = unsafe { (*cur).in_use };
                stats.slab_count += 1;
                stats.in_use += in_use;
                stats.free_objects += self.slab_maxbuf - in_use;
                stats.per_slab_in_use.push(in_use);
                cur = unsafe { (*cur).next };
                if cur == head {
                    break;
                }
            }
        }
        stats.lookup_entries = inner.large_lookup.len();
        stats
    }

    /// Lock the cache state. Recovers from poisoning: state mutations are
    /// ordered so that a panicking callback or assertion leaves the
    /// structure consistent.
    fn lock_inner(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create one empty slab and put it at the front of the slab list.
    ///
    /// A failed backing allocation leaves the cache unchanged.
    fn grow(&self, inner: &mut CacheInner) -> Result<()> {
        let pg = page::page_size();
        if self.is_small_object() {
            let base = alloc_pages(pg)?.as_ptr();
            // SAFETY: the block is one fresh page; the header occupies its
            // tail and the slots occupy the front, so nothing overlaps.
            unsafe {
                let slab = base.add(pg - mem::size_of::<Slab>()) as *mut Slab;
                ptr::write(slab, Slab::new(base, pg));
                (*slab).free_list = base;

                // Thread the free list through the slots in address order;
                // the last slot terminates the chain.
                let mut p = base;
                let last = base.add(self.effective_size * (self.slab_maxbuf - 1));
                while p < last {
                    let next = p.add(self.effective_size);
                    *(p as *mut *mut u8) = next;
                    p = next;
                }
                *(last as *mut *mut u8) = ptr::null_mut();

                inner.slabs.push_front(slab);
            }
            debug!(cache = %self.name, base = ?base, objects = self.slab_maxbuf, "grew small-object slab");
        } else {
            let need = self.effective_size * self.slab_maxbuf;
            let mem_size = (need + pg - 1) / pg * pg;
            let base = alloc_pages(mem_size)?.as_ptr();

            let slab = Box::into_raw(Box::new(Slab::new(base, mem_size)));
            let ctls: Box<[BufCtl]> = (0..self.slab_maxbuf).map(|_| BufCtl::null()).collect();
            let ctls = Box::into_raw(ctls) as *mut BufCtl;
            // SAFETY: `slab` and `ctls` were just allocated; slot addresses
            // stay inside the backing block by construction.
            unsafe {
                (*slab).bufctls = ctls;
                for i in 0..self.slab_maxbuf {
                    let ctl = ctls.add(i);
                    (*ctl).buf = base.add(i * self.effective_size);
                    (*ctl).slab = slab;
                    (*ctl).next = if i + 1 < self.slab_maxbuf {
                        ctls.add(i + 1)
                    } else {
                        ptr::null_mut()
                    };
                    inner.large_lookup.insert((*ctl).buf as usize, ctl);
                }
                (*slab).free_list = ctls as *mut u8;
                inner.slabs.push_front(slab);
            }
            debug!(cache = %self.name, base = ?base, bytes = mem_size, "grew large-object slab");
        }
        Ok(())
    }

    /// # Safety
    ///
    /// `buf` must satisfy the contract of [`free`](Cache::free); the caller
    /// holds the state lock.
    unsafe fn free_small(&self, inner: &mut CacheInner, buf: *mut u8) {
        let pg = page::page_size();
        let base = (buf as usize & !(pg - 1)) as *mut u8;
        // The slab header sits in the tail of the object's own page.
        // SAFETY: for any pointer from this cache, `base` is the slab page.
        unsafe {
            let slab = base.add(pg - mem::size_of::<Slab>()) as *mut Slab;
            assert_eq!(
                (*slab).mem_base,
                base,
                "attempt to free a pointer that was not allocated from this cache"
            );
            debug_assert!((*slab).in_use > 0);

            if let Some(dtor) = &self.dtor {
                dtor(buf, self.object_size);
            }

            *(buf as *mut *mut u8) = (*slab).free_list;
            (*slab).free_list = buf;
            (*slab).in_use -= 1;

            if (*slab).in_use == 0 {
                inner.slabs.unlink(slab);
                debug!(cache = %self.name, base = ?base, "released empty small-object slab");
                free_pages(NonNull::new_unchecked(base), pg);
            } else if (*slab).in_use == self.slab_maxbuf - 1 {
                // Leaving the full state: back into the partial prefix.
                inner.slabs.move_to_front(slab);
            }
        }
    }

    /// # Safety
    ///
    /// `buf` must satisfy the contract of [`free`](Cache::free); the caller
    /// holds the state lock.
    unsafe fn free_large(&self, inner: &mut CacheInner, buf: *mut u8) {
        let ctl = inner
            .large_lookup
            .get(&(buf as usize))
            .copied()
            .expect("attempt to free a pointer that was not allocated from this cache");
        // SAFETY: the lookup map only holds records of live slabs.
        unsafe {
            let slab = (*ctl).slab;

            if let Some(dtor) = &self.dtor {
                dtor(buf, self.object_size);
            }

            (*ctl).next = (*slab).free_list as *mut BufCtl;
            (*slab).free_list = ctl as *mut u8;
            debug_assert!((*slab).in_use > 0);
            (*slab).in_use -= 1;

            if (*slab).in_use == 0 {
                self.release_large_slab(inner, slab);
            } else if (*slab).in_use == self.slab_maxbuf - 1 {
                inner.slabs.move_to_front(slab);
            }
        }
    }

    /// Unlink an empty large-regime slab and release the backing block, the
    /// bufctl array, the heap header, and the lookup entries.
    ///
    /// # Safety
    ///
    /// `slab` must be a live large-regime slab linked into the list, and the
    /// caller holds the state lock.
    unsafe fn release_large_slab(&self, inner: &mut CacheInner, slab: *mut Slab) {
        // SAFETY: per the contract above; all resources were created in
        // `grow` with matching layouts.
        unsafe {
            let ctls = (*slab).bufctls;
            for i in 0..self.slab_maxbuf {
                inner.large_lookup.remove(&((*ctls.add(i)).buf as usize));
            }
            inner.slabs.unlink(slab);
            debug!(cache = %self.name, base = ?(*slab).mem_base, "released empty large-object slab");
            free_pages(NonNull::new_unchecked((*slab).mem_base), (*slab).mem_size);
            drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
                ctls,
                self.slab_maxbuf,
            )));
            drop(Box::from_raw(slab));
        }
    }

    fn destroy_locked(&self, inner: &mut CacheInner) {
        let mut released = 0usize;
        while !inner.slabs.is_empty() {
            let slab = inner.slabs.head();
            // SAFETY: the head of a non-empty list is live and ours.
            unsafe {
                if self.is_small_object() {
                    inner.slabs.unlink(slab);
                    free_pages(NonNull::new_unchecked((*slab).mem_base), (*slab).mem_size);
                } else {
                    self.release_large_slab(inner, slab);
                }
            }
            released += 1;
        }
        debug!(cache = %self.name, slabs = released, "destroyed cache slabs");
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("name", &self.name)
            .field("object_size", &self.object_size)
            .field("effective_size", &self.effective_size)
            .field("slab_maxbuf", &self.slab_maxbuf)
            .field("small_object", &self.is_small_object())
            .field("thread_safe", &self.thread_safe)
            .finish()
    }
}

/// Point-in-time snapshot of a cache's slab population.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Slabs currently backing the cache.
    pub slab_count: usize,
    /// Objects handed out and not yet returned.
    pub in_use: usize,
    /// Free slots across all slabs.
    pub free_objects: usize,
    /// In-use count per slab, walked from the front of the slab list.
    pub per_slab_in_use: Vec<usize>,
    /// Entries in the address lookup map (large regime only).
    pub lookup_entries: usize,
}
