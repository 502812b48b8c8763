//! The Sv39 page-table engine: builds and walks three-level page
//! tables, maps ranges, and copies between address spaces.

use crate::{
    mem::kalloc::{kalloc, kfree},
    proc::proc_mapstacks,
    riscv::{
        make_satp,
        memlayout::{KERNBASE, PHYSTOP, PLIC, TRAMPOLINE, UART0, VIRTIO0},
        pa2pte, pg_round_down, pg_round_up, pte2pa, pte_flags, px, sfence_vma, w_satp, Pagetable,
        Pte, PteFlags, MAXVA, PGSIZE,
    },
};
use core::ptr::{addr_of, copy, null_mut, write_bytes};

extern "C" {
    /// kernel.ld sets this to end of kernel code.
    static etext: [u8; 0];
    /// trampoline code, linked in its own page by kernel.ld.
    static trampoline: [u8; 0];
}

/// The kernel's pagetable.
static mut KERNEL_PAGETABLE: Pagetable = null_mut();

/// Make a direct-map page table for the kernel.
unsafe fn kvmmake() -> Pagetable {
    let pagetable = kalloc() as Pagetable;
    write_bytes(pagetable.cast::<u8>(), 0, PGSIZE as usize);

    let rw = PteFlags::R | PteFlags::W;

    // UART registers
    kvmmap(pagetable, UART0, UART0, PGSIZE, rw);

    // VirtIO MMIO disk interface
    kvmmap(pagetable, VIRTIO0, VIRTIO0, PGSIZE, rw);

    // PLIC
    kvmmap(pagetable, PLIC, PLIC, 0x40_0000, rw);

    let etext_addr = addr_of!(etext) as u64;

    // Map kernel text executable and read-only.
    kvmmap(
        pagetable,
        KERNBASE,
        KERNBASE,
        etext_addr - KERNBASE,
        PteFlags::R | PteFlags::X,
    );

    // Map kernel data and the physical RAM we'll make use of.
    kvmmap(pagetable, etext_addr, etext_addr, PHYSTOP - etext_addr, rw);

    // Map the trampoline for trap entry/exit to
    // the highest virtual address in the kernel.
    kvmmap(
        pagetable,
        TRAMPOLINE,
        addr_of!(trampoline) as u64,
        PGSIZE,
        PteFlags::R | PteFlags::X,
    );

    // Allocate and map a kernel stack for each process.
    proc_mapstacks(pagetable);

    pagetable
}

/// Initialize the one kernel_pagetable.
pub unsafe fn kvminit() {
    KERNEL_PAGETABLE = kvmmake();
}

/// Switch the hardware pagetable register to the kernel's
/// pagetable and enable paging.
pub unsafe fn kvminithart() {
    // Wait for any previous writes to the pagetable memory to finish.
    sfence_vma();

    w_satp(make_satp(KERNEL_PAGETABLE));

    // Flush stale entries from the TLB.
    sfence_vma();
}

/// Return the address of the PTE in pagetable `pagetable`
/// that corresponds to virtual address `va`. If `alloc` is
/// true, create any required pagetable pages.
///
/// The RISC-V Sv39 scheme has three levels of pagetable
/// pages. A pagetable page contains 512 64-bit PTEs.
///
/// A 64-bit virtual address is split into five fields:
/// - 39..64: must be zero.
/// - 30..39: 9 bits of level 2 index.
/// - 21..30: 9 bits of level 1 index.
/// - 12..21: 9 bits of level 0 index.
/// -  0..12: 12 bits of byte offset within the page.
pub unsafe fn walk(mut pagetable: Pagetable, va: u64, alloc: bool) -> *mut Pte {
    if va >= MAXVA {
        panic!("walk");
    }

    for level in [2usize, 1] {
        let pte = &mut (*pagetable)[px(level, va)];

        if pte_flags(*pte).contains(PteFlags::V) {
            pagetable = pte2pa(*pte) as Pagetable;
        } else {
            if !alloc {
                return null_mut();
            }

            pagetable = kalloc() as Pagetable;
            if pagetable.is_null() {
                return null_mut();
            }

            write_bytes(pagetable.cast::<u8>(), 0, PGSIZE as usize);
            *pte = pa2pte(pagetable as u64) | PteFlags::V.bits();
        }
    }

    &mut (*pagetable)[px(0, va)]
}

/// Look up a virtual address and return the physical address,
/// or 0 if not mapped.
///
/// Can only be used to look up user pages.
pub unsafe fn walkaddr(pagetable: Pagetable, va: u64) -> u64 {
    if va >= MAXVA {
        return 0;
    }

    let pte = walk(pagetable, va, false);
    if pte.is_null() {
        return 0;
    }
    if !pte_flags(*pte).contains(PteFlags::V | PteFlags::U) {
        return 0;
    }

    pte2pa(*pte)
}

/// Add a mapping to the kernel page table.
///
/// Only used when booting.
/// Does not flush TLB or enable paging.
pub unsafe fn kvmmap(pagetable: Pagetable, va: u64, pa: u64, size: u64, perm: PteFlags) {
    if mappages(pagetable, va, size, pa, perm).is_err() {
        panic!("kvmmap");
    }
}

/// Create PTEs for virtual addresses starting at `va`
/// that refer to physical addresses starting at `pa`.
///
/// `va` and `size` might not be page-aligned.
/// Returns Err if walk() couldn't allocate a needed pagetable page,
/// in which case the caller is expected to tear down whatever it
/// was building.
pub unsafe fn mappages(
    pagetable: Pagetable,
    va: u64,
    size: u64,
    mut pa: u64,
    perm: PteFlags,
) -> Result<(), ()> {
    if size == 0 {
        panic!("mappages: size");
    }

    let mut a = pg_round_down(va);
    let last = pg_round_down(va + size - 1);

    loop {
        let pte = walk(pagetable, a, true);
        if pte.is_null() {
            return Err(());
        }
        if pte_flags(*pte).contains(PteFlags::V) {
            panic!("mappages: remap");
        }

        *pte = pa2pte(pa) | (perm | PteFlags::V).bits();

        if a == last {
            break;
        }
        a += PGSIZE;
        pa += PGSIZE;
    }

    Ok(())
}

/// Remove `npages` of mappings starting from `va`.
///
/// `va` must be page-aligned. The mappings must exist.
/// Optionally free the physical memory.
pub unsafe fn uvmunmap(pagetable: Pagetable, va: u64, npages: u64, do_free: bool) {
    if va % PGSIZE != 0 {
        panic!("uvmunmap: not aligned");
    }

    let mut a = va;
    while a < va + npages * PGSIZE {
        let pte = walk(pagetable, a, false);
        if pte.is_null() {
            panic!("uvmunmap: walk");
        }
        if !pte_flags(*pte).contains(PteFlags::V) {
            panic!("uvmunmap: not mapped");
        }
        if pte_flags(*pte) == PteFlags::V {
            panic!("uvmunmap: not a leaf");
        }
        if do_free {
            kfree(pte2pa(*pte) as *mut u8);
        }

        *pte = 0;
        a += PGSIZE;
    }
}

/// Create an empty user pagetable.
///
/// Returns null if out of memory.
pub unsafe fn uvmcreate() -> Pagetable {
    let pagetable = kalloc() as Pagetable;
    if pagetable.is_null() {
        return null_mut();
    }
    write_bytes(pagetable.cast::<u8>(), 0, PGSIZE as usize);
    pagetable
}

/// Load the initcode into address 0 of pagetable
/// for the very first process.
///
/// `src.len()` must be less than a page.
pub unsafe fn uvmfirst(pagetable: Pagetable, src: &[u8]) {
    if src.len() >= PGSIZE as usize {
        panic!("uvmfirst: more than a page");
    }

    let mem = kalloc();
    write_bytes(mem, 0, PGSIZE as usize);
    if mappages(
        pagetable,
        0,
        PGSIZE,
        mem as u64,
        PteFlags::W | PteFlags::R | PteFlags::X | PteFlags::U,
    )
    .is_err()
    {
        panic!("uvmfirst: mappages");
    }
    copy(src.as_ptr(), mem, src.len());
}

/// Allocate PTEs and physical memory to grow the process from
/// `oldsz` to `newsz`, which need not be page aligned.
///
/// Returns the new size or 0 on error; on error, everything
/// added by this call has been deallocated again.
pub unsafe fn uvmalloc(pagetable: Pagetable, mut oldsz: u64, newsz: u64, xperm: PteFlags) -> u64 {
    if newsz < oldsz {
        return oldsz;
    }

    oldsz = pg_round_up(oldsz);
    let mut a = oldsz;

    while a < newsz {
        let mem = kalloc();
        if mem.is_null() {
            uvmdealloc(pagetable, a, oldsz);
            return 0;
        }

        write_bytes(mem, 0, PGSIZE as usize);

        if mappages(
            pagetable,
            a,
            PGSIZE,
            mem as u64,
            PteFlags::R | PteFlags::U | xperm,
        )
        .is_err()
        {
            kfree(mem);
            uvmdealloc(pagetable, a, oldsz);
            return 0;
        }

        a += PGSIZE;
    }

    newsz
}

/// Deallocate user pages to bring the process size from `oldsz` to
/// `newsz`.
///
/// `oldsz` and `newsz` need not be page-aligned, nor does `newsz` need
/// to be less than `oldsz`. `oldsz` can be larger than the actual
/// process size. Returns the new process size.
pub unsafe fn uvmdealloc(pagetable: Pagetable, oldsz: u64, newsz: u64) -> u64 {
    if newsz >= oldsz {
        return oldsz;
    }

    if pg_round_up(newsz) < pg_round_up(oldsz) {
        let npages = (pg_round_up(oldsz) - pg_round_up(newsz)) / PGSIZE;
        uvmunmap(pagetable, pg_round_up(newsz), npages, true);
    }

    newsz
}

/// Recursively free pagetable pages.
///
/// All leaf mappings must have already been removed.
unsafe fn freewalk(pagetable: Pagetable) {
    // There are 2^9 = 512 PTEs in a pagetable page.
    for i in 0..512 {
        let pte = &mut (*pagetable)[i];
        let flags = pte_flags(*pte);

        if flags.contains(PteFlags::V)
            && !flags.intersects(PteFlags::R | PteFlags::W | PteFlags::X)
        {
            // This PTE points to a lower-level pagetable.
            freewalk(pte2pa(*pte) as Pagetable);
            *pte = 0;
        } else if flags.contains(PteFlags::V) {
            panic!("freewalk: leaf");
        }
    }
    kfree(pagetable.cast());
}

/// Free user memory pages, then free pagetable pages.
pub unsafe fn uvmfree(pagetable: Pagetable, sz: u64) {
    if sz > 0 {
        uvmunmap(pagetable, 0, pg_round_up(sz) / PGSIZE, true);
    }
    freewalk(pagetable);
}

/// Given a parent process's pagetable, copy its memory into
/// a child's pagetable.
///
/// Copies both the pagetable and the physical memory.
/// Frees any allocated pages on failure.
pub unsafe fn uvmcopy(old: Pagetable, new: Pagetable, sz: u64) -> Result<(), ()> {
    let mut i = 0;

    while i < sz {
        let pte = walk(old, i, false);
        if pte.is_null() {
            panic!("uvmcopy: pte should exist");
        }
        if !pte_flags(*pte).contains(PteFlags::V) {
            panic!("uvmcopy: page not present");
        }

        let pa = pte2pa(*pte);
        let flags = pte_flags(*pte);

        let mem = kalloc();
        if mem.is_null() {
            uvmunmap(new, 0, i / PGSIZE, true);
            return Err(());
        }

        copy(pa as *const u8, mem, PGSIZE as usize);

        if mappages(new, i, PGSIZE, mem as u64, flags).is_err() {
            kfree(mem);
            uvmunmap(new, 0, i / PGSIZE, true);
            return Err(());
        }

        i += PGSIZE;
    }

    Ok(())
}

/// Mark a PTE invalid for user access.
///
/// Used by exec for the user stack guard page.
pub unsafe fn uvmclear(pagetable: Pagetable, va: u64) {
    let pte = walk(pagetable, va, false);
    if pte.is_null() {
        panic!("uvmclear");
    }
    *pte &= !PteFlags::U.bits();
}

/// Copy from kernel to user.
///
/// Copy `len` bytes from `src` to virtual address `dstva`
/// in a given pagetable.
pub unsafe fn copyout(
    pagetable: Pagetable,
    mut dstva: u64,
    mut src: *const u8,
    mut len: u64,
) -> Result<(), ()> {
    while len > 0 {
        let va0 = pg_round_down(dstva);
        let pa0 = walkaddr(pagetable, va0);
        if pa0 == 0 {
            return Err(());
        }

        let mut n = PGSIZE - (dstva - va0);
        if n > len {
            n = len;
        }
        copy(src, (pa0 + (dstva - va0)) as *mut u8, n as usize);

        len -= n;
        src = src.add(n as usize);
        dstva = va0 + PGSIZE;
    }
    Ok(())
}

/// Copy from user to kernel.
///
/// Copy `len` bytes to `dst` from virtual address `srcva`
/// in a given pagetable.
pub unsafe fn copyin(
    pagetable: Pagetable,
    mut dst: *mut u8,
    mut srcva: u64,
    mut len: u64,
) -> Result<(), ()> {
    while len > 0 {
        let va0 = pg_round_down(srcva);
        let pa0 = walkaddr(pagetable, va0);
        if pa0 == 0 {
            return Err(());
        }

        let mut n = PGSIZE - (srcva - va0);
        if n > len {
            n = len;
        }
        copy((pa0 + (srcva - va0)) as *const u8, dst, n as usize);

        len -= n;
        dst = dst.add(n as usize);
        srcva = va0 + PGSIZE;
    }
    Ok(())
}

/// Copy a null-terminated string from user to kernel.
///
/// Copy bytes to `dst` from virtual address `srcva` in a given
/// pagetable, until a b'\0' or `dst.len()` is reached.
pub unsafe fn copyinstr(pagetable: Pagetable, dst: &mut [u8], mut srcva: u64) -> Result<(), ()> {
    let mut max = dst.len();
    let mut di = 0;
    let mut got_null = false;

    while !got_null && max > 0 {
        let va0 = pg_round_down(srcva);
        let pa0 = walkaddr(pagetable, va0);
        if pa0 == 0 {
            return Err(());
        }

        let mut n = (PGSIZE - (srcva - va0)) as usize;
        if n > max {
            n = max;
        }

        let mut p = (pa0 + (srcva - va0)) as *const u8;
        while n > 0 {
            if *p == 0 {
                dst[di] = 0;
                got_null = true;
                break;
            }
            dst[di] = *p;

            n -= 1;
            max -= 1;
            p = p.add(1);
            di += 1;
        }

        srcva = va0 + PGSIZE;
    }

    if got_null {
        Ok(())
    } else {
        Err(())
    }
}
