//! The write-ahead log, allowing concurrent FS system calls.
//!
//! A log transaction contains the updates of multiple FS system
//! calls. The log system only commits when there are no FS system
//! calls active. Thus there is never any reasoning required about
//! whether a commit might write an uncommitted system call's
//! updates to disk.
//!
//! A system call should call begin_op()/end_op() to mark its start
//! and end. Usually begin_op() just increments the count of
//! in-progress FS system calls and returns. But if it thinks the
//! log is close to running out, it sleeps until the last
//! outstanding end_op() commits.
//!
//! The log is a physical re-do log containing disk blocks. The
//! on-disk log format:
//!   header block, containing block #s for block A, B, C, ...
//!   block A
//!   block B
//!   block C
//!   ...

use super::Superblock;
use crate::{
    bio::{bpin, bread, brelse, bunpin, bwrite},
    buf::Buf,
    param::{LOGSIZE, MAXOPBLOCKS},
    proc::scheduler::{sleep, wakeup},
    sync::spinlock::Spinlock,
};
use core::ptr::addr_of;

/// Contents of the header block, used for both the on-disk header
/// block and to keep track in memory of logged block numbers before
/// commit.
#[repr(C)]
struct LogHeader {
    n: u32,
    block: [u32; LOGSIZE],
}

struct Log {
    start: u32,
    size: u32,
    /// How many FS sys calls are executing.
    outstanding: u32,
    /// In commit(), please wait.
    committing: bool,
    dev: u32,
    lh: LogHeader,
}

static LOG_LOCK: Spinlock = Spinlock::new();

static mut LOG: Log = Log {
    start: 0,
    size: 0,
    outstanding: 0,
    committing: false,
    dev: 0,
    lh: LogHeader {
        n: 0,
        block: [0; LOGSIZE],
    },
};

fn log_chan() -> usize {
    unsafe { addr_of!(LOG) as usize }
}

pub unsafe fn initlog(dev: u32, sb: &Superblock) {
    if core::mem::size_of::<LogHeader>() >= super::BSIZE {
        panic!("initlog: too big logheader");
    }

    LOG.start = sb.logstart;
    LOG.size = sb.nlog;
    LOG.dev = dev;
    recover_from_log();
}

/// Copy committed blocks from log to their home location.
unsafe fn install_trans(recovering: bool) {
    for tail in 0..LOG.lh.n {
        // read log block
        let lbuf = bread(LOG.dev, LOG.start + tail + 1);
        // read dst
        let dbuf = bread(LOG.dev, LOG.lh.block[tail as usize]);
        // copy block to dst
        dbuf.data.copy_from_slice(&lbuf.data);
        // write dst to disk
        bwrite(dbuf);
        if !recovering {
            bunpin(dbuf);
        }
        brelse(lbuf);
        brelse(dbuf);
    }
}

/// Read the log header from disk into the in-memory log header.
unsafe fn read_head() {
    let buf = bread(LOG.dev, LOG.start);
    let lh = buf.data.as_ptr() as *const LogHeader;
    LOG.lh.n = (*lh).n;
    for i in 0..LOG.lh.n as usize {
        LOG.lh.block[i] = (*lh).block[i];
    }
    brelse(buf);
}

/// Write the in-memory log header to disk.
/// This is the true point at which the current transaction commits.
unsafe fn write_head() {
    let buf = bread(LOG.dev, LOG.start);
    let hb = buf.data.as_mut_ptr() as *mut LogHeader;
    (*hb).n = LOG.lh.n;
    for i in 0..LOG.lh.n as usize {
        (*hb).block[i] = LOG.lh.block[i];
    }
    bwrite(buf);
    brelse(buf);
}

unsafe fn recover_from_log() {
    read_head();
    // if committed, copy from log to disk
    install_trans(true);
    LOG.lh.n = 0;
    // clear the log
    write_head();
}

/// Called at the start of each FS system call.
pub unsafe fn begin_op() {
    LOG_LOCK.acquire();
    loop {
        if LOG.committing {
            sleep(log_chan(), &LOG_LOCK);
        } else if LOG.lh.n as usize + (LOG.outstanding as usize + 1) * MAXOPBLOCKS > LOGSIZE {
            // This op might exhaust log space; wait for commit.
            sleep(log_chan(), &LOG_LOCK);
        } else {
            LOG.outstanding += 1;
            LOG_LOCK.release();
            break;
        }
    }
}

/// Called at the end of each FS system call.
/// Commits if this was the last outstanding operation.
pub unsafe fn end_op() {
    let mut do_commit = false;

    LOG_LOCK.acquire();
    LOG.outstanding -= 1;
    if LOG.committing {
        panic!("log.committing");
    }
    if LOG.outstanding == 0 {
        do_commit = true;
        LOG.committing = true;
    } else {
        // begin_op() may be waiting for log space,
        // and decrementing log.outstanding has decreased
        // the amount of reserved space.
        wakeup(log_chan());
    }
    LOG_LOCK.release();

    if do_commit {
        // Call commit w/o holding locks, since not allowed
        // to sleep with locks.
        commit();
        LOG_LOCK.acquire();
        LOG.committing = false;
        wakeup(log_chan());
        LOG_LOCK.release();
    }
}

/// Copy modified blocks from cache to log.
unsafe fn write_log() {
    for tail in 0..LOG.lh.n {
        // log block
        let to = bread(LOG.dev, LOG.start + tail + 1);
        // cache block
        let from = bread(LOG.dev, LOG.lh.block[tail as usize]);
        to.data.copy_from_slice(&from.data);
        // write the log
        bwrite(to);
        brelse(from);
        brelse(to);
    }
}

unsafe fn commit() {
    if LOG.lh.n > 0 {
        // Write modified blocks from cache to log.
        write_log();
        // Write header to disk -- the real commit.
        write_head();
        // Now install writes to home locations.
        install_trans(false);
        LOG.lh.n = 0;
        // Erase the transaction from the log.
        write_head();
    }
}

/// Record the block number and pin the buffer in the cache by
/// increasing its refcount. commit()/write_log() will do the disk
/// write.
///
/// log_write() replaces bwrite(); a typical use is:
///   bp = bread(...)
///   modify bp.data[]
///   log_write(bp)
///   brelse(bp)
pub unsafe fn log_write(b: &mut Buf) {
    LOG_LOCK.acquire();

    if LOG.lh.n as usize >= LOGSIZE || LOG.lh.n >= LOG.size - 1 {
        panic!("too big a transaction");
    }
    if LOG.outstanding < 1 {
        panic!("log_write outside of trans");
    }

    let mut i = 0;
    while i < LOG.lh.n as usize {
        // log absorption
        if LOG.lh.block[i] == b.blockno {
            break;
        }
        i += 1;
    }
    LOG.lh.block[i] = b.blockno;
    if i == LOG.lh.n as usize {
        // Add new block to log.
        bpin(b);
        LOG.lh.n += 1;
    }

    LOG_LOCK.release();
}
