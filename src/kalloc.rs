//! Physical memory allocator.
//!
//! Hands out whole 4096-byte frames between the end of the kernel
//! image and PHYSTOP, for user pages, page-table pages, kernel
//! stacks and pipe buffers. Each CPU owns a freelist under its own
//! lock; a CPU whose list runs dry steals a batch from another CPU,
//! taking one foreign lock at a time and never while holding its own,
//! so no acquisition cycle can form.
//!
//! The allocator doubles as the `#[global_allocator]`: every `alloc`
//! request in this kernel fits in one frame, so `Box` and `Arc` are
//! backed by frames too and allocation failure surfaces as
//! `AllocError` instead of a panic.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

use array_macro::array;

use crate::{
    cpu::{CpuTable, IntrGuard},
    param::{NCPU, PAGESIZE, PHYSTOP},
    spinlock::SpinLock,
};

/// upper bound on pages taken from one victim CPU per refill.
const NSTEAL: usize = 64;

// junk bytes, to surface reads of freed or uninitialized pages.
const FREE_JUNK: u8 = 0x01;
const ALLOC_JUNK: u8 = 0x05;

#[global_allocator]
pub static KMEM: Kmem = Kmem::new();

// first frame-aligned address past the kernel image, set once at init
// and read-only afterwards; used for the free() range check.
static HEAP_START: AtomicUsize = AtomicUsize::new(0);

#[alloc_error_handler]
fn alloc_error_handler(layout: Layout) -> ! {
    panic!("allocation error: {:?}", layout)
}

pub fn heap_init() {
    extern "C" {
        fn end(); // see kernel.ld linker script
    }
    let heap_start = align_up(end as usize, PAGESIZE);
    HEAP_START.store(heap_start, Ordering::Relaxed);

    // the boot CPU starts with every frame; other CPUs steal.
    for pa in (heap_start..PHYSTOP).step_by(PAGESIZE) {
        KMEM.free_page(pa as *mut u8);
    }
}

struct Run {
    next: *mut Run,
}

struct FreeList {
    head: *mut Run,
}

unsafe impl Send for FreeList {}

impl FreeList {
    const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
        }
    }

    fn push(&mut self, pa: *mut u8) {
        let run = pa as *mut Run;
        unsafe { (*run).next = self.head };
        self.head = run;
    }

    fn pop(&mut self) -> Option<*mut u8> {
        if self.head.is_null() {
            return None;
        }
        let run = self.head;
        self.head = unsafe { (*run).next };
        Some(run as *mut u8)
    }

    /// Detach up to `max` pages as a private chain `(head, count)`.
    fn take(&mut self, max: usize) -> (*mut Run, usize) {
        let taken = self.head;
        let mut count = 0;
        let mut tail: *mut Run = ptr::null_mut();

        let mut run = self.head;
        while !run.is_null() && count < max {
            tail = run;
            count += 1;
            run = unsafe { (*run).next };
        }

        self.head = run;
        if !tail.is_null() {
            unsafe { (*tail).next = ptr::null_mut() };
        }
        (taken, count)
    }
}

pub struct Kmem {
    lists: [SpinLock<FreeList>; NCPU],
}

impl Kmem {
    const fn new() -> Self {
        Self {
            lists: array![_ => SpinLock::new(FreeList::new(), "kmem"); NCPU],
        }
    }

    /// Allocate one frame, filled with junk. None when every CPU's
    /// list is empty.
    pub fn alloc_page(&self) -> Option<*mut u8> {
        let id = {
            let _intr = IntrGuard::new();
            CpuTable::cpu_id()
        };

        let mut list = self.lists[id].lock();
        if let Some(pa) = list.pop() {
            drop(list);
            unsafe { ptr::write_bytes(pa, ALLOC_JUNK, PAGESIZE) };
            return Some(pa);
        }
        drop(list);

        self.steal(id)
    }

    /// Refill from other CPUs: visit each victim in turn, detach up
    /// to NSTEAL pages under the victim's lock alone, then install
    /// them under our own.
    fn steal(&self, id: usize) -> Option<*mut u8> {
        for di in 1..NCPU {
            let victim = (id + di) % NCPU;

            let mut vlist = self.lists[victim].lock();
            let (chain, count) = vlist.take(NSTEAL);
            drop(vlist);

            if count == 0 {
                continue;
            }

            let mut list = self.lists[id].lock();
            let mut run = chain;
            while !run.is_null() {
                let next = unsafe { (*run).next };
                list.push(run as *mut u8);
                run = next;
            }
            let pa = list.pop().unwrap();
            drop(list);

            unsafe { ptr::write_bytes(pa, ALLOC_JUNK, PAGESIZE) };
            return Some(pa);
        }

        None
    }

    /// Return a frame to the current CPU's list.
    pub fn free_page(&self, pa: *mut u8) {
        let addr = pa as usize;
        if addr % PAGESIZE != 0 || addr < HEAP_START.load(Ordering::Relaxed) || addr >= PHYSTOP {
            panic!("free_page: {:#x}", addr);
        }

        unsafe { ptr::write_bytes(pa, FREE_JUNK, PAGESIZE) };

        let id = {
            let _intr = IntrGuard::new();
            CpuTable::cpu_id()
        };
        self.lists[id].lock().push(pa);
    }
}

unsafe impl GlobalAlloc for Kmem {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // one frame serves any kernel allocation.
        if layout.size() > PAGESIZE || layout.align() > PAGESIZE {
            return ptr::null_mut();
        }
        self.alloc_page().unwrap_or(ptr::null_mut())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.free_page(ptr);
    }
}

#[inline]
fn align_up(addr: usize, align: usize) -> usize {
    (addr + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use alloc::boxed::Box;

    use super::*;

    #[test_case]
    fn simple_allocation() {
        let v1 = Box::new(41);
        let v2 = Box::new(13);
        assert_eq!(41, *v1);
        assert_eq!(13, *v2);
    }

    #[test_case]
    fn many_boxes_long_lived() {
        let long_lived = Box::new(1);
        for i in 0..1000 {
            let x = Box::new(i);
            assert_eq!(i, *x);
        }
        assert_eq!(1, *long_lived);
    }

    #[test_case]
    fn page_round_trip() {
        let pa = KMEM.alloc_page().expect("out of memory");
        assert_eq!(0, pa as usize % PAGESIZE);
        unsafe {
            // alloc fills with junk, not zeroes.
            assert_eq!(ALLOC_JUNK, ptr::read(pa));
            ptr::write(pa, 0xee);
        }
        KMEM.free_page(pa);

        // frames come back most-recently-freed first.
        let pb = KMEM.alloc_page().expect("out of memory");
        assert_eq!(pa, pb);
        KMEM.free_page(pb);
    }

    #[test_case]
    fn batch_alloc_free() {
        let mut pages = [ptr::null_mut(); 64];
        for slot in pages.iter_mut() {
            *slot = KMEM.alloc_page().expect("out of memory");
        }
        for slot in pages.iter() {
            KMEM.free_page(*slot);
        }
    }
}
