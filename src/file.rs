//! Support functions for system calls that involve file descriptors.

use crate::{
    fs::{
        self,
        log::{begin_op, end_op},
        stat::Stat,
        Inode,
    },
    mem::vm::copyout,
    param::{MAXOPBLOCKS, NDEV, NFILE},
    pipe::{pipeclose, piperead, pipewrite, Pipe},
    proc::process::Proc,
    sync::spinlock::Spinlock,
};
use core::ptr::{addr_of, null_mut};

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub enum FileKind {
    #[default]
    None,
    Pipe,
    Inode,
    Device,
}

pub struct File {
    pub kind: FileKind,
    /// Reference count, protected by FTABLE_LOCK
    pub refcnt: i32,
    pub readable: bool,
    pub writable: bool,
    /// FileKind::Pipe
    pub pipe: *mut Pipe,
    /// FileKind::Inode and FileKind::Device
    pub ip: *mut Inode,
    /// FileKind::Inode
    pub off: u32,
    /// FileKind::Device
    pub major: i16,
}

impl File {
    const fn new() -> File {
        File {
            kind: FileKind::None,
            refcnt: 0,
            readable: false,
            writable: false,
            pipe: null_mut(),
            ip: null_mut(),
            off: 0,
            major: 0,
        }
    }
}

/// Map major device number to device read/write functions.
/// read/write take a user virtual address and a byte count.
#[derive(Copy, Clone)]
pub struct Devsw {
    pub read: Option<fn(u64, i32) -> i32>,
    pub write: Option<fn(u64, i32) -> i32>,
}

pub static mut DEVSW: [Devsw; NDEV] = [Devsw {
    read: None,
    write: None,
}; NDEV];

/// Major device number of the console.
pub const CONSOLE: usize = 1;

static FTABLE_LOCK: Spinlock = Spinlock::new();
static mut FTABLE: [File; NFILE] = [const { File::new() }; NFILE];

pub fn fileinit() {
    // FTABLE and its lock are statically initialized.
}

/// Allocate a file structure.
pub unsafe fn filealloc() -> *mut File {
    FTABLE_LOCK.acquire();
    for f in FTABLE.iter_mut() {
        if f.refcnt == 0 {
            f.refcnt = 1;
            FTABLE_LOCK.release();
            return f;
        }
    }
    FTABLE_LOCK.release();
    null_mut()
}

/// Increment ref count for file f.
pub unsafe fn filedup(f: *mut File) -> *mut File {
    FTABLE_LOCK.acquire();
    if (*f).refcnt < 1 {
        panic!("filedup");
    }
    (*f).refcnt += 1;
    FTABLE_LOCK.release();
    f
}

/// Close file f. (Decrement ref count, close when reaches 0.)
pub unsafe fn fileclose(f: *mut File) {
    FTABLE_LOCK.acquire();
    if (*f).refcnt < 1 {
        panic!("fileclose");
    }
    (*f).refcnt -= 1;
    if (*f).refcnt > 0 {
        FTABLE_LOCK.release();
        return;
    }

    let kind = (*f).kind;
    let pipe = (*f).pipe;
    let ip = (*f).ip;
    let writable = (*f).writable;
    (*f).refcnt = 0;
    (*f).kind = FileKind::None;
    FTABLE_LOCK.release();

    match kind {
        FileKind::Pipe => pipeclose(pipe, writable),
        FileKind::Inode | FileKind::Device => {
            begin_op();
            fs::iput(ip);
            end_op();
        }
        FileKind::None => {}
    }
}

/// Get metadata about file f.
/// addr is a user virtual address, pointing to a Stat.
pub unsafe fn filestat(f: *mut File, addr: u64) -> i32 {
    let p = Proc::current().unwrap();

    if matches!((*f).kind, FileKind::Inode | FileKind::Device) {
        let mut st = Stat {
            dev: 0,
            ino: 0,
            kind: 0,
            nlink: 0,
            size: 0,
        };
        fs::ilock((*f).ip);
        fs::stati((*f).ip, &mut st);
        fs::iunlock((*f).ip);
        if copyout(
            p.pagetable,
            addr,
            addr_of!(st).cast(),
            core::mem::size_of::<Stat>() as u64,
        )
        .is_err()
        {
            return -1;
        }
        return 0;
    }
    -1
}

/// Read from file f.
/// addr is a user virtual address.
pub unsafe fn fileread(f: *mut File, addr: u64, n: i32) -> i32 {
    if !(*f).readable {
        return -1;
    }

    match (*f).kind {
        FileKind::Pipe => piperead((*f).pipe, addr, n),
        FileKind::Device => {
            if (*f).major < 0 || (*f).major as usize >= NDEV {
                return -1;
            }
            let Some(read) = DEVSW[(*f).major as usize].read else {
                return -1;
            };
            read(addr, n)
        }
        FileKind::Inode => {
            fs::ilock((*f).ip);
            let r = fs::readi((*f).ip, true, addr, (*f).off, n as u32);
            if r > 0 {
                (*f).off += r as u32;
            }
            fs::iunlock((*f).ip);
            r
        }
        FileKind::None => panic!("fileread"),
    }
}

/// Write to file f.
/// addr is a user virtual address.
pub unsafe fn filewrite(f: *mut File, addr: u64, n: i32) -> i32 {
    if !(*f).writable {
        return -1;
    }

    match (*f).kind {
        FileKind::Pipe => pipewrite((*f).pipe, addr, n),
        FileKind::Device => {
            if (*f).major < 0 || (*f).major as usize >= NDEV {
                return -1;
            }
            let Some(write) = DEVSW[(*f).major as usize].write else {
                return -1;
            };
            write(addr, n)
        }
        FileKind::Inode => {
            // Write a few blocks at a time to avoid exceeding the
            // maximum log transaction size, including i-node,
            // indirect block, allocation blocks, and 2 blocks of
            // slop for non-aligned writes. This really belongs
            // lower down, since writei() might be writing a device
            // like the console.
            let max = ((MAXOPBLOCKS - 1 - 1 - 2) / 2 * fs::BSIZE) as i32;
            let mut i = 0;
            while i < n {
                let mut n1 = n - i;
                if n1 > max {
                    n1 = max;
                }

                begin_op();
                fs::ilock((*f).ip);
                let r = fs::writei((*f).ip, true, addr + i as u64, (*f).off, n1 as u32);
                if r > 0 {
                    (*f).off += r as u32;
                }
                fs::iunlock((*f).ip);
                end_op();

                if r != n1 {
                    // Error from writei.
                    break;
                }
                i += r;
            }
            if i == n {
                n
            } else {
                -1
            }
        }
        FileKind::None => panic!("filewrite"),
    }
}
