use crate::{
    console::uart::uartintr,
    proc::{
        cpu::cpuid,
        process::{exit, Proc, ProcState},
        scheduler::{r#yield, wakeup},
    },
    riscv::{
        self,
        memlayout::{TRAMPOLINE, UART0_IRQ, VIRTIO0_IRQ},
        plic::{plic_claim, plic_complete},
    },
    sync::spinlock::SpinMutex,
    syscall::syscall,
    virtio_disk::virtio_disk_intr,
};
use core::{mem::transmute, ptr::addr_of};

extern "C" {
    // in asm.rs
    fn kernelvec();
    static trampoline: [u8; 0];
    static uservec: [u8; 0];
    static userret: [u8; 0];
}

pub static CLOCK_TICKS: SpinMutex<u32> = SpinMutex::new(0);

/// The channel timed sleeps wait on; clockintr() wakes it every tick.
pub fn ticks_chan() -> usize {
    addr_of!(CLOCK_TICKS) as usize
}

/// Set up to take exceptions and traps while in the kernel.
pub unsafe fn trapinithart() {
    riscv::w_stvec(kernelvec as usize as u64);
}

/// Handle an interrupt, exception, or system call from user space.
///
/// Called from the trampoline's uservec.
#[no_mangle]
pub unsafe extern "C" fn usertrap() -> ! {
    if riscv::r_sstatus() & riscv::SSTATUS_SPP != 0 {
        panic!("usertrap: not from user mode");
    }

    // Send interrupts and exceptions to kerneltrap(),
    // since we're now in the kernel.
    riscv::w_stvec(kernelvec as usize as u64);

    let p = Proc::current().unwrap();

    // Save user program counter.
    (*p.trapframe).epc = riscv::r_sepc();

    let mut which_dev = 0;
    if riscv::r_scause() == 8 {
        // System call.

        if p.is_killed() {
            exit(-1);
        }

        // sepc points to the ecall instruction,
        // but we want to return to the next instruction.
        (*p.trapframe).epc += 4;

        // An interrupt will change sepc, scause, and sstatus,
        // so enable only now that we're done with those registers.
        riscv::intr_on();

        syscall();
    } else {
        which_dev = devintr();
        if which_dev == 0 {
            log::warn!(
                "usertrap(): unexpected scause {:#x} pid={}",
                riscv::r_scause(),
                p.pid
            );
            log::warn!(
                "            sepc={:#x} stval={:#x}",
                riscv::r_sepc(),
                riscv::r_stval()
            );
            p.set_killed();
        }
    }

    if p.is_killed() {
        exit(-1);
    }

    // Give up the CPU if this is a timer interrupt.
    if which_dev == 2 {
        r#yield();
    }

    usertrapret();
}

/// Return to user space.
pub unsafe fn usertrapret() -> ! {
    let p = Proc::current().unwrap();

    // We're about to switch the destination of traps from
    // kerneltrap() to usertrap(), so turn off interrupts until
    // we're back in user space, where usertrap() is correct.
    riscv::intr_off();

    // Send syscalls, interrupts, and exceptions to uservec in the
    // trampoline.
    let trampoline_base = addr_of!(trampoline) as u64;
    let trampoline_uservec = TRAMPOLINE + (addr_of!(uservec) as u64 - trampoline_base);
    riscv::w_stvec(trampoline_uservec);

    // Set up trapframe values that uservec will need when
    // the process next traps into the kernel.
    (*p.trapframe).kernel_satp = riscv::r_satp(); // kernel page table
    (*p.trapframe).kernel_sp = p.kstack + riscv::PGSIZE; // process's kernel stack
    (*p.trapframe).kernel_trap = usertrap as usize as u64;
    (*p.trapframe).kernel_hartid = riscv::r_tp(); // hartid for cpuid()

    // Set up the registers that the trampoline's sret will use
    // to get to user space.

    // Set S Previous Privilege mode to User.
    let mut x = riscv::r_sstatus();
    x &= !riscv::SSTATUS_SPP; // clear SPP to 0 for user mode
    x |= riscv::SSTATUS_SPIE; // enable interrupts in user mode
    riscv::w_sstatus(x);

    // Set S Exception Program Counter to the saved user pc.
    riscv::w_sepc((*p.trapframe).epc);

    // Tell the trampoline the user page table to switch to.
    let satp = riscv::make_satp(p.pagetable);

    // Jump to userret in the trampoline at the top of memory, which
    // switches to the user page table, restores user registers,
    // and switches to user mode with sret.
    let trampoline_userret = TRAMPOLINE + (addr_of!(userret) as u64 - trampoline_base);
    let trampoline_userret: extern "C" fn(u64) -> ! =
        transmute(trampoline_userret as usize as *const ());
    trampoline_userret(satp)
}

/// Interrupts and exceptions from kernel code go here via kernelvec,
/// on whatever the current kernel stack is.
#[no_mangle]
pub unsafe extern "C" fn kerneltrap() {
    let sepc = riscv::r_sepc();
    let sstatus = riscv::r_sstatus();
    let scause = riscv::r_scause();

    if sstatus & riscv::SSTATUS_SPP == 0 {
        panic!("kerneltrap: not from supervisor mode");
    }
    if riscv::intr_get() {
        panic!("kerneltrap: interrupts enabled");
    }

    let which_dev = devintr();
    if which_dev == 0 {
        crate::println!("scause {:#x}", scause);
        crate::println!("sepc={:#x} stval={:#x}", riscv::r_sepc(), riscv::r_stval());
        panic!("kerneltrap");
    }

    // Give up the CPU if this is a timer interrupt.
    if which_dev == 2
        && Proc::current()
            .map(|p| p.state == ProcState::Running)
            .unwrap_or(false)
    {
        r#yield();
    }

    // The yield() may have caused some traps to occur,
    // so restore trap registers for use by kernelvec's sret.
    riscv::w_sepc(sepc);
    riscv::w_sstatus(sstatus);
}

fn clockintr() {
    let mut ticks = CLOCK_TICKS.lock();
    *ticks += 1;
    unsafe {
        wakeup(ticks_chan());
    }
}

/// Check if it's an external interrupt or software interrupt,
/// and handle it.
///
/// Returns 2 if timer interrupt, 1 if other device, 0 if not
/// recognized.
unsafe fn devintr() -> i32 {
    let scause = riscv::r_scause();

    if scause & 0x8000_0000_0000_0000 != 0 && scause & 0xff == 9 {
        // This is a supervisor external interrupt, via PLIC.

        // irq indicates which device interrupted.
        let irq = plic_claim();

        if irq == UART0_IRQ {
            uartintr();
        } else if irq == VIRTIO0_IRQ {
            virtio_disk_intr();
        } else if irq != 0 {
            log::warn!("unexpected device interrupt irq={}", irq);
        }

        // The PLIC allows each device to raise at most one
        // interrupt at a time; tell the PLIC the device is
        // now allowed to interrupt again.
        if irq != 0 {
            plic_complete(irq);
        }

        1
    } else if scause == 0x8000_0000_0000_0001 {
        // Software interrupt from a machine-mode timer interrupt,
        // forwarded by timervec in asm.rs.

        // If the running process asked for an alarm, account its tick
        // and invoke the handler whenever the interval divides the
        // count.
        if let Some(p) = Proc::current() {
            if p.alarmticks != 0 {
                p.ticks += 1;
                if p.ticks % p.alarmticks == 0 {
                    let handler: extern "C" fn() = transmute(p.alarmhandler as usize as *const ());
                    handler();
                }
            }
        }

        if cpuid() == 0 {
            clockintr();
        }

        // Acknowledge the software interrupt by
        // clearing the SSIP bit in sip.
        riscv::w_sip(riscv::r_sip() & !2);

        2
    } else {
        0
    }
}
