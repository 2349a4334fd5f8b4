//! Slab and buffer-control records, plus the slab list discipline
//!
//! A `Slab` describes one page-aligned backing block. In the small-object
//! regime the header is written into the tail of its own page; in the
//! large-object regime it lives on the general heap next to an array of
//! `BufCtl` records, one per object slot.
//!
//! The cache chains slabs into a circular doubly-linked list with explicit
//! head and tail. The list invariant is that partially-full slabs precede
//! fully-full ones, so the head is always the right slab to allocate from.

use std::ptr;

/// Per-slab header.
///
/// `free_list` points at the first free slot (small regime) or the first
/// free [`BufCtl`] (large regime); it is `null` when the slab is full.
#[repr(C)]
pub(crate) struct Slab {
    pub(crate) prev: *mut Slab,
    pub(crate) next: *mut Slab,
    pub(crate) free_list: *mut u8,
    /// Start of the buffer-control array; null in the small regime.
    pub(crate) bufctls: *mut BufCtl,
    /// Objects currently handed out from this slab.
    pub(crate) in_use: usize,
    /// Base of the page-aligned backing block.
    pub(crate) mem_base: *mut u8,
    /// Size of the backing block in bytes.
    pub(crate) mem_size: usize,
}

impl Slab {
    pub(crate) fn new(mem_base: *mut u8, mem_size: usize) -> Self {
        Self {
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
            free_list: ptr::null_mut(),
            bufctls: ptr::null_mut(),
            in_use: 0,
            mem_base,
            mem_size,
        }
    }
}

/// Large-regime per-object bookkeeping record.
///
/// Remembers the object address, the next free record, and the owning slab.
#[repr(C)]
pub(crate) struct BufCtl {
    pub(crate) buf: *mut u8,
    pub(crate) next: *mut BufCtl,
    pub(crate) slab: *mut Slab,
}

impl BufCtl {
    pub(crate) const fn null() -> Self {
        Self {
            buf: ptr::null_mut(),
            next: ptr::null_mut(),
            slab: ptr::null_mut(),
        }
    }
}

/// Circular doubly-linked list of slabs with distinguished head and tail.
///
/// Every linked slab has non-null `prev`/`next`; an unlinked slab has both
/// null. The list never owns the slabs, it only chains them.
pub(crate) struct SlabList {
    head: *mut Slab,
    tail: *mut Slab,
}

impl SlabList {
    pub(crate) const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    pub(crate) fn head(&self) -> *mut Slab {
        self.head
    }

    pub(crate) fn tail(&self) -> *mut Slab {
        self.tail
    }

    /// Insert an unlinked slab at the front.
    ///
    /// # Safety
    ///
    /// `slab` must be a valid, live slab that is not linked into any list.
    pub(crate) unsafe fn push_front(&mut self, slab: *mut Slab) {
        // SAFETY: the caller guarantees `slab` and all linked slabs are live.
        unsafe {
            if self.head.is_null() {
                (*slab).prev = slab;
                (*slab).next = slab;
                self.tail = slab;
            } else {
                (*slab).next = self.head;
                (*slab).prev = self.tail;
                (*self.head).prev = slab;
                (*self.tail).next = slab;
            }
            self.head = slab;
        }
    }

    /// Insert an unlinked slab at the back.
    ///
    /// # Safety
    ///
    /// `slab` must be a valid, live slab that is not linked into any list.
    pub(crate) unsafe fn push_back(&mut self, slab: *mut Slab) {
        // SAFETY: the caller guarantees `slab` and all linked slabs are live.
        unsafe {
            if self.head.is_null() {
                (*slab).prev = slab;
                (*slab).next = slab;
                self.head = slab;
            } else {
                (*slab).next = self.head;
                (*slab).prev = self.tail;
                (*self.head).prev = slab;
                (*self.tail).next = slab;
            }
            self.tail = slab;
        }
    }

    /// Remove a slab from the list, leaving its links null.
    ///
    /// # Safety
    ///
    /// `slab` must be linked into this list.
    pub(crate) unsafe fn unlink(&mut self, slab: *mut Slab) {
        // SAFETY: the caller guarantees `slab` is linked here and live.
        unsafe {
            if (*slab).next == slab {
                // Sole element
                self.head = ptr::null_mut();
                self.tail = ptr::null_mut();
            } else {
                (*(*slab).prev).next = (*slab).next;
                (*(*slab).next).prev = (*slab).prev;
                if self.head == slab {
                    self.head = (*slab).next;
                }
                if self.tail == slab {
                    self.tail = (*slab).prev;
                }
            }
            (*slab).prev = ptr::null_mut();
            (*slab).next = ptr::null_mut();
        }
    }

    /// Move a linked slab to the front. No-op when it already is the head.
    ///
    /// # Safety
    ///
    /// `slab` must be linked into this list.
    pub(crate) unsafe fn move_to_front(&mut self, slab: *mut Slab) {
        if self.head == slab {
            return;
        }
        // SAFETY: forwarded from the caller.
        unsafe {
            self.unlink(slab);
            self.push_front(slab);
        }
    }

    /// Move a linked slab to the back. No-op when it already is the tail.
    ///
    /// # Safety
    ///
    /// `slab` must be linked into this list.
    pub(crate) unsafe fn move_to_back(&mut self, slab: *mut Slab) {
        if self.tail == slab {
            return;
        }
        // SAFETY: forwarded from the caller.
        unsafe {
            self.unlink(slab);
            self.push_back(slab);
        }
    }
}
