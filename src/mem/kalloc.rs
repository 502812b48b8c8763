//! Physical memory allocator, for user processes,
//! kernel stacks, page-table pages,
//! and pipe buffers. Allocates whole 4096-byte pages.

use crate::{
    riscv::{memlayout::PHYSTOP, pg_round_up, PGSIZE},
    sync::spinlock::SpinMutex,
};
use core::ptr::{addr_of_mut, null_mut, write_bytes};

extern "C" {
    /// First address after kernel. Defined by kernel.ld.
    static mut end: [u8; 0];
}

/// A free page, threaded through the page itself.
struct Run {
    next: *mut Run,
}

struct FreeList {
    head: *mut Run,
}
unsafe impl Send for FreeList {}

static KMEM: SpinMutex<FreeList> = SpinMutex::new(FreeList { head: null_mut() });

pub unsafe fn kinit() {
    freerange(addr_of_mut!(end).cast(), PHYSTOP as *mut u8);
}

unsafe fn freerange(pa_start: *mut u8, pa_end: *mut u8) {
    let mut p = pg_round_up(pa_start as u64) as *mut u8;

    while p.add(PGSIZE as usize) <= pa_end {
        kfree(p);
        p = p.add(PGSIZE as usize);
    }
}

/// Free the page of physical memory pointed at by pa,
/// which normally should have been returned by a call
/// to kalloc(). The exception is when initializing the
/// allocator - see kinit above.
pub unsafe fn kfree(pa: *mut u8) {
    if (pa as u64) % PGSIZE != 0
        || pa < addr_of_mut!(end).cast::<u8>()
        || pa as u64 >= PHYSTOP
    {
        panic!("kfree");
    }

    // Fill with junk to catch dangling refs.
    write_bytes(pa, 1, PGSIZE as usize);

    let run: *mut Run = pa.cast();

    let mut kmem = KMEM.lock();
    (*run).next = kmem.head;
    kmem.head = run;
}

/// Allocate one 4096-byte page of physical memory.
///
/// Returns a pointer that the kernel can use,
/// or null if the memory cannot be allocated.
/// The page is filled with junk; callers that need
/// zeroed memory must clear it themselves.
pub unsafe fn kalloc() -> *mut u8 {
    let run;
    {
        let mut kmem = KMEM.lock();
        run = kmem.head;
        if !run.is_null() {
            kmem.head = (*run).next;
        }
    }

    if !run.is_null() {
        write_bytes(run.cast::<u8>(), 5, PGSIZE as usize);
    }

    run.cast()
}
