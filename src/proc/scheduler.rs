//! The per-CPU scheduler loop and the sleep/wakeup machinery.
//!
//! Scheduling is lottery-based: every Runnable process holds at least
//! one ticket, and each scheduling round draws a winner from a
//! pseudo-random stream with probability proportional to its holding.

use super::{
    context::Context,
    cpu::{cpuid, Cpu},
    process::{Proc, ProcState, PROC},
};
use crate::{
    param::{NCPU, NPROC, ROOTDEV},
    riscv::{intr_get, intr_on},
    sync::spinlock::Spinlock,
};
use core::{
    ptr::{addr_of_mut, null_mut},
    sync::atomic::{AtomicBool, Ordering},
};

extern "C" {
    /// Context switch, in asm.rs: save current callee-saved registers
    /// in old, load them from new.
    fn swtch(old: *mut Context, new: *const Context);
}

/// xorshift64: a small, fast generator, plenty for proportional-share
/// draws. Never yields zero from a nonzero seed.
struct Xorshift64 {
    state: u64,
}

impl Xorshift64 {
    const fn new(seed: u64) -> Xorshift64 {
        Xorshift64 {
            state: if seed == 0 { 1 } else { seed },
        }
    }

    fn next(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }
}

/// Per-CPU draw streams, seeded differently per hart.
static mut RNG: [Xorshift64; NCPU] = {
    let mut rng = [const { Xorshift64::new(1) }; NCPU];
    let mut i = 0;
    while i < NCPU {
        rng[i] = Xorshift64::new(0x9e37_79b9_7f4a_7c15u64.wrapping_mul(i as u64 + 1));
        i += 1;
    }
    rng
};

/// Given the prefix sums of ticket counts over the process table,
/// return the slot holding the winning ticket: the smallest index
/// whose prefix sum exceeds the draw. Slots that were not Runnable
/// repeat the previous prefix value and so can never win.
fn holder_of(prefix: &[u64; NPROC], winner: u64) -> Option<usize> {
    let mut prev = 0;
    for (i, &sum) in prefix.iter().enumerate() {
        if sum > winner && sum != prev {
            return Some(i);
        }
        prev = sum;
    }
    None
}

/// Per-CPU process scheduler.
/// Each CPU calls scheduler() after setting itself up.
/// Scheduler never returns. It loops, doing:
///  - choose a process to run via a lottery over Runnable tickets.
///  - swtch to start running that process.
///  - eventually that process transfers control
///    via swtch back to the scheduler.
pub unsafe fn scheduler() -> ! {
    let c = Cpu::current();
    c.proc = null_mut();

    loop {
        // The most recent process to run may have had interrupts
        // turned off; enable them to avoid a deadlock if all
        // processes are waiting. Also lets an idle hart take timer
        // interrupts while nothing is Runnable.
        intr_on();

        // Build prefix sums of ticket counts over Runnable slots.
        // Unlocked reads; the winner is re-checked under its lock
        // before we commit to running it.
        let mut total: u64 = 0;
        let mut prefix = [0u64; NPROC];
        for (i, p) in PROC.iter().enumerate() {
            if p.state == ProcState::Runnable {
                total += p.tickets as u64;
            }
            prefix[i] = total;
        }

        if total == 0 {
            // Nothing to run; spin until a wakeup or timer interrupt
            // makes someone Runnable.
            continue;
        }

        let winner = RNG[cpuid()].next() % total;
        let Some(i) = holder_of(&prefix, winner) else {
            continue;
        };

        let p = &mut PROC[i];
        p.lock.acquire();
        if p.state == ProcState::Runnable {
            // Switch to the chosen process. It is the process's job
            // to release its lock and then reacquire it
            // before jumping back to us.
            p.state = ProcState::Running;
            c.proc = addr_of_mut!(*p);
            swtch(addr_of_mut!(c.context), &p.context);

            // Process is done running for now.
            // It should have changed its p.state before coming back.
            c.proc = null_mut();
        }
        p.lock.release();
    }
}

/// Switch to the scheduler. Must hold only p.lock and have changed
/// proc.state. Saves and restores previous_interrupts_enabled because
/// it is a property of this kernel thread, not this CPU.
pub unsafe fn sched() {
    let p = Proc::current().unwrap();
    let c = Cpu::current();

    if !p.lock.holding() {
        panic!("sched p->lock");
    }
    if c.interrupt_disable_layers != 1 {
        panic!("sched locks");
    }
    if p.state == ProcState::Running {
        panic!("sched running");
    }
    if intr_get() {
        panic!("sched interruptible");
    }

    let previous_interrupts_enabled = c.previous_interrupts_enabled;
    swtch(addr_of_mut!(p.context), &c.context);
    Cpu::current().previous_interrupts_enabled = previous_interrupts_enabled;
}

/// Give up the CPU for one scheduling round.
pub unsafe fn r#yield() {
    let p = Proc::current().unwrap();
    p.lock.acquire();
    p.state = ProcState::Runnable;
    sched();
    p.lock.release();
}

/// A fork child's very first scheduling by scheduler()
/// will swtch to forkret.
pub unsafe extern "C" fn forkret() {
    static FIRST: AtomicBool = AtomicBool::new(true);

    // Still holding p.lock from scheduler.
    Proc::current().unwrap().lock.release();

    if FIRST.swap(false, Ordering::AcqRel) {
        // File system initialization must be run in the context of a
        // regular process (e.g., because it calls sleep), and thus
        // cannot be run from main().
        crate::fs::fsinit(ROOTDEV);
    }

    crate::trap::usertrapret();
}

/// Atomically release lk and sleep on chan.
/// Reacquires lk when awakened.
pub unsafe fn sleep(chan: usize, lk: &Spinlock) {
    let p = Proc::current().unwrap();

    // Must acquire p.lock in order to change p.state and then call
    // sched. Once we hold p.lock, we can be guaranteed that we won't
    // miss any wakeup (wakeup locks p.lock), so it's okay to release
    // lk.
    p.lock.acquire();
    lk.release();

    // Go to sleep.
    p.chan = chan;
    p.state = ProcState::Sleeping;

    sched();

    // Tidy up.
    p.chan = 0;

    // Reacquire original lock.
    p.lock.release();
    lk.acquire();
}

/// Wake up all processes sleeping on chan.
/// Must be called without any p.lock.
pub unsafe fn wakeup(chan: usize) {
    let me = Proc::current_ptr();

    for p in PROC.iter_mut() {
        if addr_of_mut!(*p) != me {
            p.lock.acquire();
            if p.state == ProcState::Sleeping && p.chan == chan {
                p.state = ProcState::Runnable;
            }
            p.lock.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xorshift_is_nonzero_and_varies() {
        let mut rng = Xorshift64::new(42);
        let a = rng.next();
        let b = rng.next();
        assert_ne!(a, 0);
        assert_ne!(a, b);

        // A zero seed must not produce the all-zero fixed point.
        let mut rng = Xorshift64::new(0);
        assert_ne!(rng.next(), 0);
    }

    #[test]
    fn holder_of_picks_by_prefix_sum() {
        // Slots 1 and 3 runnable with 5 and 3 tickets.
        let mut prefix = [0u64; NPROC];
        prefix[1] = 5;
        for i in 2..NPROC {
            prefix[i] = 5;
        }
        for i in 3..NPROC {
            prefix[i] = 8;
        }
        assert_eq!(holder_of(&prefix, 0), Some(1));
        assert_eq!(holder_of(&prefix, 4), Some(1));
        assert_eq!(holder_of(&prefix, 5), Some(3));
        assert_eq!(holder_of(&prefix, 7), Some(3));
        assert_eq!(holder_of(&prefix, 8), None);
    }

    #[test]
    fn idle_slots_never_win() {
        // A slot whose prefix repeats the previous value held no
        // tickets this round and must never be chosen.
        let mut prefix = [0u64; NPROC];
        for i in 2..NPROC {
            prefix[i] = 7;
        }
        for w in 0..7 {
            assert_eq!(holder_of(&prefix, w), Some(2));
        }
    }

    #[test]
    fn lottery_is_proportional() {
        // Two processes with 1 and 99 tickets: over 10_000 draws the
        // big holder must win at least 95% of the time.
        let mut prefix = [0u64; NPROC];
        prefix[0] = 1;
        for i in 1..NPROC {
            prefix[i] = 100;
        }

        let mut rng = Xorshift64::new(0xdead_beef);
        let mut big = 0u32;
        for _ in 0..10_000 {
            let winner = rng.next() % 100;
            if holder_of(&prefix, winner) == Some(1) {
                big += 1;
            }
        }
        assert!(big >= 9_500, "99-ticket process won only {big} of 10000");
    }
}
