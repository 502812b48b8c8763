use super::{context::Context, process::Proc};
use crate::{param::NCPU, riscv::r_tp};
use core::ptr::{addr_of_mut, null_mut};

/// Per-CPU state.
pub struct Cpu {
    /// The process running on this cpu, or null.
    pub proc: *mut Proc,
    /// swtch() here to enter scheduler().
    pub context: Context,
    /// Depth of push_off() nesting.
    pub interrupt_disable_layers: i32,
    /// Were interrupts enabled before push_off()?
    pub previous_interrupts_enabled: bool,
}

static mut CPUS: [Cpu; NCPU] = [const { Cpu::new() }; NCPU];

impl Cpu {
    pub const fn new() -> Cpu {
        Cpu {
            proc: null_mut(),
            context: Context::new(),
            interrupt_disable_layers: 0,
            previous_interrupts_enabled: false,
        }
    }

    /// Return this CPU's cpu struct.
    /// Interrupts must be disabled.
    pub unsafe fn current() -> &'static mut Cpu {
        &mut *Cpu::current_ptr()
    }

    pub unsafe fn current_ptr() -> *mut Cpu {
        addr_of_mut!(CPUS[cpuid()])
    }
}

/// Which hart (core) is this?
///
/// Must be called with interrupts disabled, to prevent a race with
/// the process being moved to a different CPU.
pub unsafe fn cpuid() -> usize {
    r_tp() as usize
}
