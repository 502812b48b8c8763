//! Long-term locks for processes. Safe to hold across blocking I/O
//! and scheduling, unlike a spinlock.

use super::spinlock::Spinlock;
use crate::proc::{
    process::Proc,
    scheduler::{sleep, wakeup},
};
use core::cell::Cell;

pub struct Sleeplock {
    /// Is the lock held? Protected by lk.
    locked: Cell<bool>,
    /// Spinlock protecting this sleep lock.
    lk: Spinlock,
    /// The PID holding the lock, for holding().
    pid: Cell<i32>,
}
unsafe impl Sync for Sleeplock {}

impl Sleeplock {
    pub const fn new() -> Sleeplock {
        Sleeplock {
            locked: Cell::new(false),
            lk: Spinlock::new(),
            pid: Cell::new(0),
        }
    }

    fn chan(&self) -> usize {
        self as *const Sleeplock as usize
    }

    pub unsafe fn acquire(&self) {
        self.lk.acquire();
        while self.locked.get() {
            sleep(self.chan(), &self.lk);
        }
        self.locked.set(true);
        self.pid.set(Proc::current().unwrap().pid);
        self.lk.release();
    }

    pub unsafe fn release(&self) {
        self.lk.acquire();
        self.locked.set(false);
        self.pid.set(0);
        wakeup(self.chan());
        self.lk.release();
    }

    /// Check whether the current process is holding the lock.
    pub unsafe fn holding(&self) -> bool {
        self.lk.acquire();
        let held = self.locked.get() && self.pid.get() == Proc::current().unwrap().pid;
        self.lk.release();
        held
    }
}
