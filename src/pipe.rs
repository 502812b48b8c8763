use crate::{
    file::{filealloc, fileclose, File, FileKind},
    mem::{
        kalloc::{kalloc, kfree},
        vm::{copyin, copyout},
    },
    proc::{
        process::Proc,
        scheduler::{sleep, wakeup},
    },
    sync::spinlock::Spinlock,
};
use core::ptr::{addr_of, null_mut};

pub const PIPESIZE: usize = 512;

pub struct Pipe {
    lock: Spinlock,
    data: [u8; PIPESIZE],
    /// Number of bytes read
    nread: u32,
    /// Number of bytes written
    nwrite: u32,
    /// Read fd is still open
    readopen: bool,
    /// Write fd is still open
    writeopen: bool,
}

unsafe fn read_chan(pi: *const Pipe) -> usize {
    addr_of!((*pi).nread) as usize
}

unsafe fn write_chan(pi: *const Pipe) -> usize {
    addr_of!((*pi).nwrite) as usize
}

/// Allocate a pipe and two files wrapping its ends.
pub unsafe fn pipealloc(f0: &mut *mut File, f1: &mut *mut File) -> Result<(), ()> {
    *f0 = filealloc();
    *f1 = filealloc();

    // The pipe lives in a kernel page of its own.
    let pi = kalloc() as *mut Pipe;

    if pi.is_null() || f0.is_null() || f1.is_null() {
        if !pi.is_null() {
            kfree(pi.cast());
        }
        if !f0.is_null() {
            fileclose(*f0);
        }
        if !f1.is_null() {
            fileclose(*f1);
        }
        return Err(());
    }

    pi.write(Pipe {
        lock: Spinlock::new(),
        data: [0; PIPESIZE],
        nread: 0,
        nwrite: 0,
        readopen: true,
        writeopen: true,
    });

    (**f0).kind = FileKind::Pipe;
    (**f0).readable = true;
    (**f0).writable = false;
    (**f0).pipe = pi;

    (**f1).kind = FileKind::Pipe;
    (**f1).readable = false;
    (**f1).writable = true;
    (**f1).pipe = pi;

    Ok(())
}

/// Close one end of the pipe; frees it when both ends are gone.
pub unsafe fn pipeclose(pi: *mut Pipe, writable: bool) {
    (*pi).lock.acquire();
    if writable {
        (*pi).writeopen = false;
        wakeup(read_chan(pi));
    } else {
        (*pi).readopen = false;
        wakeup(write_chan(pi));
    }

    if !(*pi).readopen && !(*pi).writeopen {
        (*pi).lock.release();
        kfree(pi.cast());
    } else {
        (*pi).lock.release();
    }
}

/// Write n bytes from user address addr. Sleeps while the ring is
/// full; fails once the read end closes or the writer is killed.
pub unsafe fn pipewrite(pi: *mut Pipe, addr: u64, n: i32) -> i32 {
    let p = Proc::current().unwrap();
    let mut i = 0;

    (*pi).lock.acquire();
    while i < n {
        if !(*pi).readopen || p.is_killed() {
            (*pi).lock.release();
            return -1;
        }
        if (*pi).nwrite == (*pi).nread + PIPESIZE as u32 {
            // Ring is full.
            wakeup(read_chan(pi));
            sleep(write_chan(pi), &(*pi).lock);
        } else {
            let mut c = 0u8;
            if copyin(p.pagetable, &mut c, addr + i as u64, 1).is_err() {
                break;
            }
            let w = (*pi).nwrite as usize % PIPESIZE;
            (*pi).data[w] = c;
            (*pi).nwrite += 1;
            i += 1;
        }
    }
    wakeup(read_chan(pi));
    (*pi).lock.release();

    i
}

/// Read up to n bytes into user address addr. Sleeps while the ring
/// is empty and a writer remains.
pub unsafe fn piperead(pi: *mut Pipe, addr: u64, n: i32) -> i32 {
    let p = Proc::current().unwrap();

    (*pi).lock.acquire();
    while (*pi).nread == (*pi).nwrite && (*pi).writeopen {
        // Pipe is empty.
        if p.is_killed() {
            (*pi).lock.release();
            return -1;
        }
        sleep(read_chan(pi), &(*pi).lock);
    }

    let mut i = 0;
    while i < n {
        if (*pi).nread == (*pi).nwrite {
            break;
        }
        let r = (*pi).nread as usize % PIPESIZE;
        let c = (*pi).data[r];
        (*pi).nread += 1;
        if copyout(p.pagetable, addr + i as u64, &c, 1).is_err() {
            break;
        }
        i += 1;
    }
    wakeup(write_chan(pi));
    (*pi).lock.release();

    i
}
