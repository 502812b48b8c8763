//! Mutual exclusion spin locks.

use crate::proc::cpu::Cpu;
use crate::riscv::{intr_get, intr_off, intr_on};
use core::{
    cell::{Cell, UnsafeCell},
    ops::{Deref, DerefMut, Drop},
    ptr::null_mut,
    sync::atomic::{AtomicBool, Ordering},
};

/// A non-sleeping lock. Acquiring disables interrupts on the local CPU
/// for as long as the lock is held.
pub struct Spinlock {
    locked: AtomicBool,
    /// The CPU holding the lock, for the recursion and release checks.
    cpu: Cell<*mut Cpu>,
}
unsafe impl Sync for Spinlock {}

impl Spinlock {
    pub const fn new() -> Spinlock {
        Spinlock {
            locked: AtomicBool::new(false),
            cpu: Cell::new(null_mut()),
        }
    }

    /// Acquire the lock.
    /// Loops (spins) until the lock is acquired.
    pub unsafe fn acquire(&self) {
        // Disable interrupts to avoid deadlock.
        push_off();

        if self.holding() {
            panic!("acquire");
        }

        while self.locked.swap(true, Ordering::Acquire) {
            core::hint::spin_loop();
        }

        // Record info about lock acquisition for holding() and debugging.
        self.cpu.set(Cpu::current_ptr());
    }

    /// Release the lock.
    pub unsafe fn release(&self) {
        if !self.holding() {
            panic!("release");
        }

        self.cpu.set(null_mut());
        self.locked.store(false, Ordering::Release);

        pop_off();
    }

    /// Check whether this cpu is holding the lock.
    /// Interrupts must be off.
    pub unsafe fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed) && self.cpu.get() == Cpu::current_ptr()
    }

    pub fn lock(&self) -> SpinlockGuard<'_> {
        unsafe {
            self.acquire();
        }
        SpinlockGuard { lock: self }
    }
}

pub struct SpinlockGuard<'l> {
    pub lock: &'l Spinlock,
}
impl<'l> Drop for SpinlockGuard<'l> {
    fn drop(&mut self) {
        unsafe { self.lock.release() }
    }
}

/// A spinlock that owns the data it protects.
pub struct SpinMutex<T> {
    lock: Spinlock,
    inner: UnsafeCell<T>,
}
unsafe impl<T> Sync for SpinMutex<T> where T: Send {}

impl<T> SpinMutex<T> {
    pub const fn new(value: T) -> SpinMutex<T> {
        SpinMutex {
            lock: Spinlock::new(),
            inner: UnsafeCell::new(value),
        }
    }
    pub fn lock(&self) -> SpinMutexGuard<'_, T> {
        unsafe {
            self.lock.acquire();
        }
        SpinMutexGuard { mutex: self }
    }
}

pub struct SpinMutexGuard<'m, T> {
    pub mutex: &'m SpinMutex<T>,
}
impl<'m, T> SpinMutexGuard<'m, T> {
    /// Sleep until `wakeup(chan)` is called somewhere else,
    /// yielding the lock until then.
    pub unsafe fn sleep(&mut self, chan: usize) {
        crate::proc::scheduler::sleep(chan, &self.mutex.lock);
    }
}
impl<'m, T> Deref for SpinMutexGuard<'m, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.mutex.inner.get() }
    }
}
impl<'m, T> DerefMut for SpinMutexGuard<'m, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.mutex.inner.get() }
    }
}
impl<'m, T> Drop for SpinMutexGuard<'m, T> {
    fn drop(&mut self) {
        unsafe { self.mutex.lock.release() }
    }
}

// push_off/pop_off are like intr_off()/intr_on() except that they are
// matched: it takes two pop_off()s to undo two push_off()s. Also, if
// interrupts are initially off, then push_off, pop_off leaves them off.

pub unsafe fn push_off() {
    let old = intr_get();
    let cpu = Cpu::current();

    intr_off();
    if cpu.interrupt_disable_layers == 0 {
        cpu.previous_interrupts_enabled = old;
    }
    cpu.interrupt_disable_layers += 1;
}

pub unsafe fn pop_off() {
    let cpu = Cpu::current();

    if intr_get() {
        panic!("pop_off - interruptible");
    }
    if cpu.interrupt_disable_layers < 1 {
        panic!("pop_off");
    }

    cpu.interrupt_disable_layers -= 1;

    if cpu.interrupt_disable_layers == 0 && cpu.previous_interrupts_enabled {
        intr_on();
    }
}
