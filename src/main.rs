#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), no_main)]
#![allow(dead_code)]
#![allow(clippy::missing_safety_doc)]

#[cfg(target_arch = "riscv64")]
mod asm;
mod bio;
mod buf;
mod console;
mod exec;
mod file;
mod fs;
mod mem;
mod param;
mod pipe;
mod proc;
mod riscv;
mod start;
mod sync;
mod syscall;
mod trap;
mod virtio_disk;

use core::sync::atomic::{AtomicBool, Ordering};
use proc::cpuid;

static STARTED: AtomicBool = AtomicBool::new(false);

/// start() jumps here in supervisor mode on all CPUs.
#[cfg(not(test))]
#[no_mangle]
pub unsafe extern "C" fn main() -> ! {
    if cpuid() == 0 {
        console::consoleinit();
        console::printf::printfinit();
        println!();
        println!("xv7 kernel is booting");
        println!();
        mem::kalloc::kinit(); // physical page allocator
        mem::vm::kvminit(); // create kernel page table
        mem::vm::kvminithart(); // turn on paging
        proc::procinit(); // process table
        trap::trapinithart(); // install kernel trap vector
        riscv::plic::plicinit(); // set up interrupt controller
        riscv::plic::plicinithart(); // ask PLIC for device interrupts
        bio::binit(); // buffer cache
        fs::iinit(); // inode table
        file::fileinit(); // file table
        virtio_disk::virtio_disk_init(); // emulated hard disk
        proc::userinit(); // first user process
        log::info!("hart 0 up, starting followers");
        STARTED.store(true, Ordering::Release);
    } else {
        while !STARTED.load(Ordering::Acquire) {}
        println!("hart {} starting", cpuid());
        mem::vm::kvminithart(); // turn on paging
        trap::trapinithart(); // install kernel trap vector
        riscv::plic::plicinithart(); // ask PLIC for device interrupts
    }

    proc::scheduler::scheduler();
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    // Let the panic output through even if some CPU died holding the
    // print lock.
    console::printf::PR.locking.store(false, Ordering::Relaxed);
    println!("panic: {}", info);
    // Freeze UART output from other CPUs, then this one.
    console::printf::PANICKED.store(true, Ordering::Relaxed);
    loop {
        core::hint::spin_loop();
    }
}
