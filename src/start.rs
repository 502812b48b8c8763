use crate::{param::NCPU, riscv::*};
use core::{arch::asm, ptr::addr_of};

extern "C" {
    /// main() in main.rs.
    fn main() -> !;
    /// Machine-mode timer vector, in asm.rs.
    fn timervec();
}

/// Scratch area per CPU for machine-mode timer interrupts.
#[no_mangle]
static mut timer_scratch: [[u64; 5]; NCPU] = [[0; 5]; NCPU];

/// Boot stack: entry sets sp to stack0 + 4096 * (hartid + 1),
/// one 4096-byte stack per CPU.
#[no_mangle]
static mut stack0: Stack0 = Stack0([0; 4096 * NCPU]);

#[repr(C, align(16))]
struct Stack0([u8; 4096 * NCPU]);

/// entry jumps here in machine mode on stack0.
#[no_mangle]
pub unsafe extern "C" fn start() -> ! {
    // Set M Previous Privilege mode to Supervisor, for mret.
    let mut x = r_mstatus();
    x &= !MSTATUS_MPP_MASK;
    x |= MSTATUS_MPP_S;
    w_mstatus(x);

    // Set M Exception Program Counter to main, for mret.
    w_mepc(main as usize as u64);

    // Disable paging for now.
    w_satp(0);

    // Delegate all interrupts and exceptions to supervisor mode.
    w_medeleg(0xffff);
    w_mideleg(0xffff);
    w_sie(r_sie() | SIE_SEIE | SIE_STIE | SIE_SSIE);

    // Configure Physical Memory Protection to give
    // supervisor mode access to all of physical memory.
    w_pmpaddr0(0x3f_ffff_ffff_ffff);
    w_pmpcfg0(0xf);

    // Ask for clock interrupts.
    timerinit();

    // Keep each CPU's hartid in its tp register, for cpuid().
    w_tp(r_mhartid());

    // Switch to supervisor mode and jump to main().
    asm!("mret", options(noreturn));
}

/// Arrange to receive timer interrupts.
///
/// They will arrive in machine mode at timervec in asm.rs, which
/// turns them into supervisor software interrupts for devintr() in
/// trap.rs.
unsafe fn timerinit() {
    // Each CPU has a separate source of timer interrupts.
    let id = r_mhartid();

    // Ask the CLINT for a timer interrupt.
    // cycles; about 1/10th second in qemu.
    let interval = 1_000_000u64;
    let mtimecmp = memlayout::clint_mtimecmp(id) as *mut u64;
    mtimecmp.write_volatile((memlayout::CLINT_MTIME as *const u64).read_volatile() + interval);

    // Prepare information in scratch[] for timervec.
    // scratch[0..=2]: space for timervec to save registers.
    // scratch[3]: address of CLINT MTIMECMP register.
    // scratch[4]: desired interval (in cycles) between timer interrupts.
    let scratch = &mut timer_scratch[id as usize];
    scratch[3] = memlayout::clint_mtimecmp(id);
    scratch[4] = interval;
    w_mscratch(addr_of!(scratch[0]) as u64);

    // Set the machine-mode trap handler.
    w_mtvec(timervec as usize as u64);

    // Enable machine-mode interrupts.
    w_mstatus(r_mstatus() | MSTATUS_MIE);

    // Enable machine-mode timer interrupts.
    w_mie(r_mie() | MIE_MTIE);
}
