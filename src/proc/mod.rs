pub mod context;
pub mod cpu;
pub mod process;
pub mod scheduler;
pub mod trapframe;

pub use cpu::cpuid;

use self::process::{Proc, ProcState, INITPROC, PROC};
use crate::{
    mem::{
        kalloc::kalloc,
        vm::{kvmmap, uvmfirst},
    },
    param::NPROC,
    riscv::{memlayout::kstack, Pagetable, PteFlags, PGSIZE},
};
use core::ptr::addr_of_mut;

/// Allocate a page for each process's kernel stack.
/// Map it high in memory, followed by an invalid guard page.
pub unsafe fn proc_mapstacks(kpgtbl: Pagetable) {
    for i in 0..NPROC {
        let pa = kalloc();
        if pa.is_null() {
            panic!("kalloc");
        }
        let va = kstack(i as u64);
        kvmmap(kpgtbl, va, pa as u64, PGSIZE, PteFlags::R | PteFlags::W);
    }
}

/// Initialize the process table.
pub unsafe fn procinit() {
    for (i, p) in PROC.iter_mut().enumerate() {
        p.kstack = kstack(i as u64);
    }
}

/// A user program that calls exec("/init"),
/// assembled from user/initcode.S.
/// od -t xC user/initcode
const INITCODE: [u8; 52] = [
    0x17, 0x05, 0x00, 0x00, 0x13, 0x05, 0x45, 0x02, 0x97, 0x05, 0x00, 0x00, 0x93, 0x85, 0x35, 0x02,
    0x93, 0x08, 0x70, 0x00, 0x73, 0x00, 0x00, 0x00, 0x93, 0x08, 0x20, 0x00, 0x73, 0x00, 0x00, 0x00,
    0xef, 0xf0, 0x9f, 0xff, 0x2f, 0x69, 0x6e, 0x69, 0x74, 0x00, 0x00, 0x24, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00,
];

/// Set up the first user process.
pub unsafe fn userinit() {
    let p = Proc::alloc().expect("userinit");
    INITPROC = addr_of_mut!(*p);

    // Allocate one user page and copy initcode's
    // instructions and data into it.
    uvmfirst(p.pagetable, &INITCODE);
    p.sz = PGSIZE;

    // Prepare for the very first "return" from kernel to user.
    (*p.trapframe).epc = 0; // user program counter
    (*p.trapframe).sp = PGSIZE; // user stack pointer

    p.set_name(b"initcode");
    p.cwd = crate::fs::namei(b"/");

    p.state = ProcState::Runnable;

    p.lock.release();
}

/// Print a process listing to the console, for debugging.
/// Runs when a user types ^P on the console.
/// No lock, to avoid wedging a stuck machine further.
pub unsafe fn procdump() {
    crate::println!();
    for p in PROC.iter() {
        if p.state == ProcState::Unused {
            continue;
        }
        let state = match p.state {
            ProcState::Unused => "unused",
            ProcState::Used => "used",
            ProcState::Sleeping => "sleep ",
            ProcState::Runnable => "runble",
            ProcState::Running => "run   ",
            ProcState::Zombie => "zombie",
        };
        let len = p.name.iter().position(|&c| c == 0).unwrap_or(p.name.len());
        let name = core::str::from_utf8(&p.name[..len]).unwrap_or("???");
        crate::println!("{} {} {}", p.pid, state, name);
    }
}

/// Per-slot scheduling counters, as reported by getpinfo(2).
#[repr(C)]
pub struct Pstat {
    pub pid: [i32; NPROC],
    pub tickets: [u32; NPROC],
    pub ticks: [u32; NPROC],
}

impl Pstat {
    pub const fn new() -> Pstat {
        Pstat {
            pid: [0; NPROC],
            tickets: [0; NPROC],
            ticks: [0; NPROC],
        }
    }
}

/// Fill ps with one entry per process-table slot, in table order.
pub unsafe fn procinfo(ps: &mut Pstat) {
    for (i, p) in PROC.iter_mut().enumerate() {
        p.lock.acquire();
        ps.pid[i] = p.pid;
        ps.tickets[i] = p.tickets;
        ps.ticks[i] = p.ticks;
        p.lock.release();
    }
}
