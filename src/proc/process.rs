use super::{
    context::Context,
    cpu::Cpu,
    scheduler::{sched, wakeup},
    trapframe::Trapframe,
};
use crate::{
    file::{fileclose, filedup, File},
    fs::{self, log::begin_op, log::end_op, Inode},
    mem::{
        kalloc::{kalloc, kfree},
        vm::{
            copyin, copyout, mappages, uvmalloc, uvmcopy, uvmcreate, uvmdealloc, uvmfree, uvmunmap,
        },
    },
    param::{NOFILE, NPROC},
    riscv::{
        memlayout::{TRAMPOLINE, TRAPFRAME},
        Pagetable, PteFlags, PGSIZE,
    },
    sync::spinlock::Spinlock,
};
use core::{
    ptr::{addr_of, addr_of_mut, copy, null_mut},
    sync::atomic::{AtomicI32, Ordering},
};

extern "C" {
    /// trampoline code, linked in its own page by kernel.ld.
    static trampoline: [u8; 0];
}

pub static mut PROC: [Proc; NPROC] = [const { Proc::new() }; NPROC];

pub static mut INITPROC: *mut Proc = null_mut();

static NEXT_PID: AtomicI32 = AtomicI32::new(1);

/// Helps ensure that wakeups of wait()ing parents are not lost.
/// Helps obey the memory model when using p.parent.
/// Must be acquired before any p.lock.
pub static WAIT_LOCK: Spinlock = Spinlock::new();

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub enum ProcState {
    #[default]
    Unused,
    Used,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ProcError {
    MaxProcesses,
    Allocation,
    NoChildren,
    Killed,
    PageError,
}

/// Per-process state.
pub struct Proc {
    pub lock: Spinlock,

    // p.lock must be held when using these:
    /// Process state
    pub state: ProcState,
    /// If non-zero, sleeping on chan
    pub chan: usize,
    /// If true, have been killed
    pub killed: bool,
    /// Exit status to be returned to parent's wait
    pub xstate: i32,
    /// Process ID
    pub pid: i32,

    // WAIT_LOCK must be held when using this:
    /// Parent process
    pub parent: *mut Proc,

    // These are private to the process, so p.lock need not be held.
    /// Virtual address of kernel stack
    pub kstack: u64,
    /// Size of process memory (bytes)
    pub sz: u64,
    /// User page table
    pub pagetable: Pagetable,
    /// Data page for the trampoline
    pub trapframe: *mut Trapframe,
    /// swtch() here to run process
    pub context: Context,
    /// Open files
    pub ofile: [*mut File; NOFILE],
    /// Current directory
    pub cwd: *mut Inode,
    /// Process name (debugging)
    pub name: [u8; 16],
    /// Lottery tickets held
    pub tickets: u32,
    /// Alarm interval in ticks; 0 when no alarm is set
    pub alarmticks: u32,
    /// User-space alarm handler
    pub alarmhandler: u64,
    /// Timer ticks consumed
    pub ticks: u32,
}

impl Proc {
    pub const fn new() -> Proc {
        Proc {
            lock: Spinlock::new(),
            state: ProcState::Unused,
            chan: 0,
            killed: false,
            xstate: 0,
            pid: 0,
            parent: null_mut(),
            kstack: 0,
            sz: 0,
            pagetable: null_mut(),
            trapframe: null_mut(),
            context: Context::new(),
            ofile: [null_mut(); NOFILE],
            cwd: null_mut(),
            name: [0; 16],
            tickets: 0,
            alarmticks: 0,
            alarmhandler: 0,
            ticks: 0,
        }
    }

    /// Return the current proc, or None if none.
    pub fn current() -> Option<&'static mut Proc> {
        unsafe {
            let p = Proc::current_ptr();
            if p.is_null() {
                None
            } else {
                Some(&mut *p)
            }
        }
    }

    pub unsafe fn current_ptr() -> *mut Proc {
        crate::sync::spinlock::push_off();
        let p = Cpu::current().proc;
        crate::sync::spinlock::pop_off();
        p
    }

    fn alloc_pid() -> i32 {
        NEXT_PID.fetch_add(1, Ordering::Relaxed)
    }

    /// Copy name into the fixed-size debugging name field.
    pub fn set_name(&mut self, name: &[u8]) {
        let n = name.len().min(self.name.len() - 1);
        self.name[..n].copy_from_slice(&name[..n]);
        self.name[n..].fill(0);
    }

    /// Look in the process table for an Unused slot.
    /// If found, initialize state required to run in the kernel,
    /// and return with the slot's lock held.
    /// If there are no free slots, or a memory allocation fails,
    /// return an error.
    pub unsafe fn alloc() -> Result<&'static mut Proc, ProcError> {
        let mut found: Option<&'static mut Proc> = None;
        for p in PROC.iter_mut() {
            p.lock.acquire();
            if p.state == ProcState::Unused {
                found = Some(p);
                break;
            }
            p.lock.release();
        }
        let Some(p) = found else {
            return Err(ProcError::MaxProcesses);
        };

        p.pid = Proc::alloc_pid();
        p.state = ProcState::Used;

        // Allocate a trapframe page.
        p.trapframe = kalloc() as *mut Trapframe;
        if p.trapframe.is_null() {
            p.free();
            p.lock.release();
            return Err(ProcError::Allocation);
        }

        // An empty user page table.
        p.pagetable = proc_pagetable(p);
        if p.pagetable.is_null() {
            p.free();
            p.lock.release();
            return Err(ProcError::Allocation);
        }

        // Set up new context to start executing at forkret,
        // which returns to user space.
        p.context.clear();
        p.context.ra = super::scheduler::forkret as usize as u64;
        p.context.sp = p.kstack + PGSIZE;

        p.ticks = 0;
        p.alarmticks = 0;
        p.alarmhandler = 0;
        p.tickets = 1;

        Ok(p)
    }

    /// Free a proc structure and the data hanging from it,
    /// including user pages.
    /// self.lock must be held.
    pub unsafe fn free(&mut self) {
        if !self.trapframe.is_null() {
            kfree(self.trapframe.cast());
        }
        self.trapframe = null_mut();
        if !self.pagetable.is_null() {
            proc_freepagetable(self.pagetable, self.sz);
        }
        self.pagetable = null_mut();
        self.sz = 0;
        self.pid = 0;
        self.parent = null_mut();
        self.name[0] = 0;
        self.chan = 0;
        self.killed = false;
        self.xstate = 0;
        self.state = ProcState::Unused;
    }

    pub fn is_killed(&self) -> bool {
        unsafe {
            self.lock.acquire();
            let k = self.killed;
            self.lock.release();
            k
        }
    }

    pub fn set_killed(&mut self) {
        unsafe {
            self.lock.acquire();
            self.killed = true;
            self.lock.release();
        }
    }
}

/// Create a user page table for a given process, with no user memory,
/// but with trampoline and trapframe pages.
pub unsafe fn proc_pagetable(p: &Proc) -> Pagetable {
    // An empty page table.
    let pagetable = uvmcreate();
    if pagetable.is_null() {
        return null_mut();
    }

    // Map the trampoline code (for system call return)
    // at the highest user virtual address.
    // Only the supervisor uses it, on the way
    // to/from user space, so not PteFlags::U.
    if mappages(
        pagetable,
        TRAMPOLINE,
        PGSIZE,
        addr_of!(trampoline) as u64,
        PteFlags::R | PteFlags::X,
    )
    .is_err()
    {
        uvmfree(pagetable, 0);
        return null_mut();
    }

    // Map the trapframe page just below the trampoline page, for
    // the trampoline's uservec/userret.
    if mappages(
        pagetable,
        TRAPFRAME,
        PGSIZE,
        p.trapframe as u64,
        PteFlags::R | PteFlags::W,
    )
    .is_err()
    {
        uvmunmap(pagetable, TRAMPOLINE, 1, false);
        uvmfree(pagetable, 0);
        return null_mut();
    }

    pagetable
}

/// Free a process's page table, and free the
/// physical memory it refers to.
pub unsafe fn proc_freepagetable(pagetable: Pagetable, sz: u64) {
    uvmunmap(pagetable, TRAMPOLINE, 1, false);
    uvmunmap(pagetable, TRAPFRAME, 1, false);
    uvmfree(pagetable, sz);
}

/// Grow or shrink user memory by n bytes.
pub unsafe fn growproc(n: i32) -> Result<(), ()> {
    let p = Proc::current().unwrap();
    let mut sz = p.sz;

    if n > 0 {
        sz = uvmalloc(p.pagetable, sz, sz + n as u64, PteFlags::W);
        if sz == 0 {
            return Err(());
        }
    } else if n < 0 {
        sz = uvmdealloc(p.pagetable, sz, sz.wrapping_add(n as i64 as u64));
    }

    p.sz = sz;
    Ok(())
}

/// Create a new process, copying the parent.
/// Sets up the child kernel stack to return as if from fork().
pub unsafe fn fork() -> Result<i32, ProcError> {
    let p = Proc::current().unwrap();
    let np = Proc::alloc()?;

    // Copy user memory from parent to child.
    if uvmcopy(p.pagetable, np.pagetable, p.sz).is_err() {
        np.free();
        np.lock.release();
        return Err(ProcError::Allocation);
    }
    np.sz = p.sz;
    np.tickets = p.tickets;

    // Copy saved user registers.
    copy(p.trapframe.cast_const(), np.trapframe, 1);

    // Cause fork to return 0 in the child.
    (*np.trapframe).a0 = 0;

    // Increment reference counts on open file descriptors.
    for (i, f) in p.ofile.iter().enumerate() {
        if !f.is_null() {
            np.ofile[i] = filedup(*f);
        }
    }
    np.cwd = fs::idup(p.cwd);

    np.name = p.name;

    let pid = np.pid;

    np.lock.release();

    WAIT_LOCK.acquire();
    np.parent = addr_of_mut!(*p);
    WAIT_LOCK.release();

    np.lock.acquire();
    np.state = ProcState::Runnable;
    np.lock.release();

    Ok(pid)
}

/// Pass p's abandoned children to init.
/// Caller must hold WAIT_LOCK.
unsafe fn reparent(p: *mut Proc) {
    for pp in PROC.iter_mut() {
        if pp.parent == p {
            pp.parent = INITPROC;
            wakeup(INITPROC as usize);
        }
    }
}

/// Exit the current process. Does not return.
/// An exited process remains in the zombie state
/// until its parent calls wait().
pub unsafe fn exit(status: i32) -> ! {
    let p = Proc::current().unwrap();

    if addr_of_mut!(*p) == INITPROC {
        panic!("init exiting");
    }

    // Close all open files.
    for f in p.ofile.iter_mut() {
        if !f.is_null() {
            fileclose(*f);
            *f = null_mut();
        }
    }

    begin_op();
    fs::iput(p.cwd);
    end_op();
    p.cwd = null_mut();

    WAIT_LOCK.acquire();

    // Give any children to init.
    reparent(addr_of_mut!(*p));

    // Parent might be sleeping in wait().
    wakeup(p.parent as usize);

    p.lock.acquire();
    p.xstate = status;
    p.state = ProcState::Zombie;

    WAIT_LOCK.release();

    // Jump into the scheduler, never to return.
    sched();
    panic!("zombie exit");
}

/// Wait for a child process to exit, and return its pid.
pub unsafe fn wait(addr: u64) -> Result<i32, ProcError> {
    let p = Proc::current().unwrap();
    let self_ptr = addr_of_mut!(*p);

    WAIT_LOCK.acquire();

    loop {
        // Scan through the table looking for exited children.
        let mut havekids = false;

        for pp in PROC.iter_mut() {
            if pp.parent == self_ptr {
                // Make sure the child isn't still in exit() or swtch().
                pp.lock.acquire();

                havekids = true;
                if pp.state == ProcState::Zombie {
                    // Found one.
                    let pid = pp.pid;
                    if addr != 0
                        && copyout(
                            p.pagetable,
                            addr,
                            addr_of!(pp.xstate).cast(),
                            core::mem::size_of::<i32>() as u64,
                        )
                        .is_err()
                    {
                        pp.lock.release();
                        WAIT_LOCK.release();
                        return Err(ProcError::PageError);
                    }
                    pp.free();
                    pp.lock.release();
                    WAIT_LOCK.release();
                    return Ok(pid);
                }
                pp.lock.release();
            }
        }

        // No point waiting if we don't have any children.
        if !havekids {
            WAIT_LOCK.release();
            return Err(ProcError::NoChildren);
        }
        if p.is_killed() {
            WAIT_LOCK.release();
            return Err(ProcError::Killed);
        }

        // Wait for a child to exit.
        super::scheduler::sleep(self_ptr as usize, &WAIT_LOCK);
    }
}

/// Kill the process with the given pid.
/// The victim won't exit until it tries to return
/// to user space (see usertrap() in trap.rs).
pub unsafe fn kill(pid: i32) -> i32 {
    for p in PROC.iter_mut() {
        p.lock.acquire();
        if p.pid == pid {
            p.killed = true;
            if p.state == ProcState::Sleeping {
                // Wake process from sleep().
                p.state = ProcState::Runnable;
            }
            p.lock.release();
            return 0;
        }
        p.lock.release();
    }

    -1
}

/// Copy to either a user address, or kernel address,
/// depending on user_dst.
pub unsafe fn either_copyout(user_dst: bool, dst: u64, src: *const u8, len: u64) -> Result<(), ()> {
    if user_dst {
        let p = Proc::current().unwrap();
        copyout(p.pagetable, dst, src, len)
    } else {
        copy(src, dst as *mut u8, len as usize);
        Ok(())
    }
}

/// Copy from either a user address, or kernel address,
/// depending on user_src.
pub unsafe fn either_copyin(dst: *mut u8, user_src: bool, src: u64, len: u64) -> Result<(), ()> {
    if user_src {
        let p = Proc::current().unwrap();
        copyin(p.pagetable, dst, src, len)
    } else {
        copy(src as *const u8, dst, len as usize);
        Ok(())
    }
}
