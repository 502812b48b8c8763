use super::*;
use core::arch::asm;

/// Which hart (core) is this?
#[inline(always)]
pub unsafe fn r_mhartid() -> u64 {
    #[cfg(target_arch = "riscv64")]
    {
        let x: u64;
        asm!("csrr {}, mhartid", out(reg) x);
        x
    }
    #[cfg(not(target_arch = "riscv64"))]
    unreachable!("riscv64-only CSR access")
}

// Machine Status Register, mstatus
#[inline(always)]
pub unsafe fn r_mstatus() -> u64 {
    #[cfg(target_arch = "riscv64")]
    {
        let x: u64;
        asm!("csrr {}, mstatus", out(reg) x);
        x
    }
    #[cfg(not(target_arch = "riscv64"))]
    unreachable!("riscv64-only CSR access")
}
#[inline(always)]
pub unsafe fn w_mstatus(x: u64) {
    #[cfg(target_arch = "riscv64")]
    asm!("csrw mstatus, {}", in(reg) x);
    #[cfg(not(target_arch = "riscv64"))]
    {
        let _ = x;
        unreachable!("riscv64-only CSR access")
    }
}

// Machine Exception Program Counter.
// MEPC holds the instruction address to which a return from exception will go.
#[inline(always)]
pub unsafe fn w_mepc(x: u64) {
    #[cfg(target_arch = "riscv64")]
    asm!("csrw mepc, {}", in(reg) x);
    #[cfg(not(target_arch = "riscv64"))]
    {
        let _ = x;
        unreachable!("riscv64-only CSR access")
    }
}

// Supervisor Status Register, sstatus
#[inline(always)]
pub unsafe fn r_sstatus() -> u64 {
    #[cfg(target_arch = "riscv64")]
    {
        let x: u64;
        asm!("csrr {}, sstatus", out(reg) x);
        x
    }
    #[cfg(not(target_arch = "riscv64"))]
    unreachable!("riscv64-only CSR access")
}
#[inline(always)]
pub unsafe fn w_sstatus(x: u64) {
    #[cfg(target_arch = "riscv64")]
    asm!("csrw sstatus, {}", in(reg) x);
    #[cfg(not(target_arch = "riscv64"))]
    {
        let _ = x;
        unreachable!("riscv64-only CSR access")
    }
}

// Supervisor Interrupt Pending
#[inline(always)]
pub unsafe fn r_sip() -> u64 {
    #[cfg(target_arch = "riscv64")]
    {
        let x: u64;
        asm!("csrr {}, sip", out(reg) x);
        x
    }
    #[cfg(not(target_arch = "riscv64"))]
    unreachable!("riscv64-only CSR access")
}
#[inline(always)]
pub unsafe fn w_sip(x: u64) {
    #[cfg(target_arch = "riscv64")]
    asm!("csrw sip, {}", in(reg) x);
    #[cfg(not(target_arch = "riscv64"))]
    {
        let _ = x;
        unreachable!("riscv64-only CSR access")
    }
}

// Supervisor Interrupt Enable
#[inline(always)]
pub unsafe fn r_sie() -> u64 {
    #[cfg(target_arch = "riscv64")]
    {
        let x: u64;
        asm!("csrr {}, sie", out(reg) x);
        x
    }
    #[cfg(not(target_arch = "riscv64"))]
    unreachable!("riscv64-only CSR access")
}
#[inline(always)]
pub unsafe fn w_sie(x: u64) {
    #[cfg(target_arch = "riscv64")]
    asm!("csrw sie, {}", in(reg) x);
    #[cfg(not(target_arch = "riscv64"))]
    {
        let _ = x;
        unreachable!("riscv64-only CSR access")
    }
}

// Machine-mode Interrupt Enable
#[inline(always)]
pub unsafe fn r_mie() -> u64 {
    #[cfg(target_arch = "riscv64")]
    {
        let x: u64;
        asm!("csrr {}, mie", out(reg) x);
        x
    }
    #[cfg(not(target_arch = "riscv64"))]
    unreachable!("riscv64-only CSR access")
}
#[inline(always)]
pub unsafe fn w_mie(x: u64) {
    #[cfg(target_arch = "riscv64")]
    asm!("csrw mie, {}", in(reg) x);
    #[cfg(not(target_arch = "riscv64"))]
    {
        let _ = x;
        unreachable!("riscv64-only CSR access")
    }
}

// Supervisor Exception Program Counter.
// SEPC holds the instruction address to which a return from exception will go.
#[inline(always)]
pub unsafe fn r_sepc() -> u64 {
    #[cfg(target_arch = "riscv64")]
    {
        let x: u64;
        asm!("csrr {}, sepc", out(reg) x);
        x
    }
    #[cfg(not(target_arch = "riscv64"))]
    unreachable!("riscv64-only CSR access")
}
#[inline(always)]
pub unsafe fn w_sepc(x: u64) {
    #[cfg(target_arch = "riscv64")]
    asm!("csrw sepc, {}", in(reg) x);
    #[cfg(not(target_arch = "riscv64"))]
    {
        let _ = x;
        unreachable!("riscv64-only CSR access")
    }
}

// Machine Exception Delegation
#[inline(always)]
pub unsafe fn w_medeleg(x: u64) {
    #[cfg(target_arch = "riscv64")]
    asm!("csrw medeleg, {}", in(reg) x);
    #[cfg(not(target_arch = "riscv64"))]
    {
        let _ = x;
        unreachable!("riscv64-only CSR access")
    }
}

// Machine Interrupt Delegation
#[inline(always)]
pub unsafe fn w_mideleg(x: u64) {
    #[cfg(target_arch = "riscv64")]
    asm!("csrw mideleg, {}", in(reg) x);
    #[cfg(not(target_arch = "riscv64"))]
    {
        let _ = x;
        unreachable!("riscv64-only CSR access")
    }
}

// Supervisor Trap-Vector Base Address
#[inline(always)]
pub unsafe fn w_stvec(x: u64) {
    #[cfg(target_arch = "riscv64")]
    asm!("csrw stvec, {}", in(reg) x);
    #[cfg(not(target_arch = "riscv64"))]
    {
        let _ = x;
        unreachable!("riscv64-only CSR access")
    }
}

// Machine-mode Interrupt Vector
#[inline(always)]
pub unsafe fn w_mtvec(x: u64) {
    #[cfg(target_arch = "riscv64")]
    asm!("csrw mtvec, {}", in(reg) x);
    #[cfg(not(target_arch = "riscv64"))]
    {
        let _ = x;
        unreachable!("riscv64-only CSR access")
    }
}

// Physical Memory Protection
#[inline(always)]
pub unsafe fn w_pmpcfg0(x: u64) {
    #[cfg(target_arch = "riscv64")]
    asm!("csrw pmpcfg0, {}", in(reg) x);
    #[cfg(not(target_arch = "riscv64"))]
    {
        let _ = x;
        unreachable!("riscv64-only CSR access")
    }
}
#[inline(always)]
pub unsafe fn w_pmpaddr0(x: u64) {
    #[cfg(target_arch = "riscv64")]
    asm!("csrw pmpaddr0, {}", in(reg) x);
    #[cfg(not(target_arch = "riscv64"))]
    {
        let _ = x;
        unreachable!("riscv64-only CSR access")
    }
}

// Supervisor Address Translation and Protection.
// SATP holds the address of the page table.
#[inline(always)]
pub unsafe fn r_satp() -> u64 {
    #[cfg(target_arch = "riscv64")]
    {
        let x: u64;
        asm!("csrr {}, satp", out(reg) x);
        x
    }
    #[cfg(not(target_arch = "riscv64"))]
    unreachable!("riscv64-only CSR access")
}
#[inline(always)]
pub unsafe fn w_satp(x: u64) {
    #[cfg(target_arch = "riscv64")]
    asm!("csrw satp, {}", in(reg) x);
    #[cfg(not(target_arch = "riscv64"))]
    {
        let _ = x;
        unreachable!("riscv64-only CSR access")
    }
}

#[inline(always)]
pub unsafe fn w_mscratch(x: u64) {
    #[cfg(target_arch = "riscv64")]
    asm!("csrw mscratch, {}", in(reg) x);
    #[cfg(not(target_arch = "riscv64"))]
    {
        let _ = x;
        unreachable!("riscv64-only CSR access")
    }
}

// Supervisor Trap Cause
#[inline(always)]
pub unsafe fn r_scause() -> u64 {
    #[cfg(target_arch = "riscv64")]
    {
        let x: u64;
        asm!("csrr {}, scause", out(reg) x);
        x
    }
    #[cfg(not(target_arch = "riscv64"))]
    unreachable!("riscv64-only CSR access")
}

// Supervisor Trap Value
#[inline(always)]
pub unsafe fn r_stval() -> u64 {
    #[cfg(target_arch = "riscv64")]
    {
        let x: u64;
        asm!("csrr {}, stval", out(reg) x);
        x
    }
    #[cfg(not(target_arch = "riscv64"))]
    unreachable!("riscv64-only CSR access")
}

// Enable device interrupts
#[inline(always)]
pub unsafe fn intr_on() {
    w_sstatus(r_sstatus() | SSTATUS_SIE);
}

// Disable device interrupts
#[inline(always)]
pub unsafe fn intr_off() {
    w_sstatus(r_sstatus() & !SSTATUS_SIE);
}

// Are device interrupts enabled?
#[inline(always)]
pub unsafe fn intr_get() -> bool {
    r_sstatus() & SSTATUS_SIE != 0
}

// Read and write TP (thread pointer), which xv7 uses
// to hold this core's hartid, the index into cpus[].
#[inline(always)]
pub unsafe fn r_tp() -> u64 {
    #[cfg(target_arch = "riscv64")]
    {
        let x: u64;
        asm!("mv {}, tp", out(reg) x);
        x
    }
    #[cfg(not(target_arch = "riscv64"))]
    unreachable!("riscv64-only register access")
}
#[inline(always)]
pub unsafe fn w_tp(x: u64) {
    #[cfg(target_arch = "riscv64")]
    asm!("mv tp, {}", in(reg) x);
    #[cfg(not(target_arch = "riscv64"))]
    {
        let _ = x;
        unreachable!("riscv64-only register access")
    }
}

// Flush the TLB.
#[inline(always)]
pub unsafe fn sfence_vma() {
    // The "zero, zero" means flush all TLB entries.
    #[cfg(target_arch = "riscv64")]
    asm!("sfence.vma zero, zero");
    #[cfg(not(target_arch = "riscv64"))]
    unreachable!("riscv64-only instruction")
}
