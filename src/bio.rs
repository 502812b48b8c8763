//! Buffer cache.
//!
//! The buffer cache holds cached copies of disk block contents in a
//! fixed pool of buffers threaded onto an LRU list. Caching disk
//! blocks in memory reduces the number of disk reads and also
//! provides a synchronization point for disk blocks used by multiple
//! processes.
//!
//! Interface:
//! - To get a buffer for a particular disk block, call bread.
//! - After changing buffer data, call bwrite to write it to disk.
//! - When done with the buffer, call brelse.
//! - Do not use the buffer after calling brelse.
//! - Only one process at a time can use a buffer,
//!   so do not keep them longer than necessary.

use crate::{
    buf::Buf, param::NBUF, sync::spinlock::Spinlock, virtio_disk::virtio_disk_rw,
};

/// The LRU list: a doubly linked list over slot indices with a
/// sentinel at index NBUF. head.next is the most recently used
/// buffer, head.prev the least.
struct LruList {
    prev: [usize; NBUF + 1],
    next: [usize; NBUF + 1],
}

const HEAD: usize = NBUF;

impl LruList {
    const fn new() -> LruList {
        LruList {
            prev: [HEAD; NBUF + 1],
            next: [HEAD; NBUF + 1],
        }
    }

    /// Build the initial list containing every slot.
    fn init(&mut self) {
        self.prev[HEAD] = HEAD;
        self.next[HEAD] = HEAD;
        for i in 0..NBUF {
            self.push_front(i);
        }
    }

    fn unlink(&mut self, i: usize) {
        let (p, n) = (self.prev[i], self.next[i]);
        self.next[p] = n;
        self.prev[n] = p;
    }

    fn push_front(&mut self, i: usize) {
        let n = self.next[HEAD];
        self.next[i] = n;
        self.prev[i] = HEAD;
        self.prev[n] = i;
        self.next[HEAD] = i;
    }
}

struct Bcache {
    lock: Spinlock,
    lru: LruList,
    buf: [Buf; NBUF],
}

static mut BCACHE: Bcache = Bcache {
    lock: Spinlock::new(),
    lru: LruList::new(),
    buf: [const { Buf::new() }; NBUF],
};

pub unsafe fn binit() {
    BCACHE.lru.init();
}

/// Look through the buffer cache for block `blockno` on device `dev`.
/// If not found, recycle the least recently used unused buffer.
/// In either case, return a sleep-locked buffer.
unsafe fn bget(dev: u32, blockno: u32) -> &'static mut Buf {
    BCACHE.lock.acquire();

    // Is the block already cached?
    let mut i = BCACHE.lru.next[HEAD];
    while i != HEAD {
        let b = &mut BCACHE.buf[i];
        if b.dev == dev && b.blockno == blockno {
            b.refcnt += 1;
            BCACHE.lock.release();
            b.lock.acquire();
            return b;
        }
        i = BCACHE.lru.next[i];
    }

    // Not cached.
    // Recycle the least recently used (LRU) unused buffer.
    let mut i = BCACHE.lru.prev[HEAD];
    while i != HEAD {
        let b = &mut BCACHE.buf[i];
        if b.refcnt == 0 {
            b.dev = dev;
            b.blockno = blockno;
            b.valid = false;
            b.refcnt = 1;
            BCACHE.lock.release();
            b.lock.acquire();
            return b;
        }
        i = BCACHE.lru.prev[i];
    }

    panic!("bget: no buffers");
}

/// Return a sleep-locked buffer with the contents of the indicated
/// block.
pub unsafe fn bread(dev: u32, blockno: u32) -> &'static mut Buf {
    let b = bget(dev, blockno);
    if !b.valid {
        virtio_disk_rw(b, false);
        b.valid = true;
    }
    b
}

/// Write b's contents to disk. Must be sleep-locked.
pub unsafe fn bwrite(b: &mut Buf) {
    if !b.lock.holding() {
        panic!("bwrite");
    }
    virtio_disk_rw(b, true);
}

fn slot_of(b: &Buf) -> usize {
    unsafe { (b as *const Buf).offset_from(BCACHE.buf.as_ptr()) as usize }
}

/// Release a sleep-locked buffer.
/// Moves it to the head of the LRU list when no one is using it.
pub unsafe fn brelse(b: &mut Buf) {
    if !b.lock.holding() {
        panic!("brelse");
    }

    b.lock.release();

    BCACHE.lock.acquire();
    b.refcnt -= 1;
    if b.refcnt == 0 {
        // No one is waiting for it.
        let i = slot_of(b);
        BCACHE.lru.unlink(i);
        BCACHE.lru.push_front(i);
    }
    BCACHE.lock.release();
}

/// Keep a buffer resident across a release, for the log.
pub unsafe fn bpin(b: &mut Buf) {
    BCACHE.lock.acquire();
    b.refcnt += 1;
    BCACHE.lock.release();
}

pub unsafe fn bunpin(b: &mut Buf) {
    BCACHE.lock.acquire();
    b.refcnt -= 1;
    BCACHE.lock.release();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(l: &LruList) -> [usize; NBUF] {
        let mut out = [0; NBUF];
        let mut i = l.next[HEAD];
        let mut n = 0;
        while i != HEAD {
            out[n] = i;
            n += 1;
            i = l.next[i];
        }
        assert_eq!(n, NBUF);
        out
    }

    #[test]
    fn init_links_every_slot() {
        let mut l = LruList::new();
        l.init();
        // push_front of 0..NBUF leaves the last push at the head.
        let o = order(&l);
        assert_eq!(o[0], NBUF - 1);
        assert_eq!(o[NBUF - 1], 0);
        // Least-recent end of the list is reachable backwards too.
        assert_eq!(l.prev[HEAD], 0);
    }

    #[test]
    fn move_to_front_after_release() {
        let mut l = LruList::new();
        l.init();
        // Releasing the least-recently-used slot moves it to the front.
        let lru = l.prev[HEAD];
        l.unlink(lru);
        l.push_front(lru);
        assert_eq!(l.next[HEAD], lru);
        assert_ne!(l.prev[HEAD], lru);
    }

    #[test]
    fn unlink_then_reinsert_is_stable() {
        let mut l = LruList::new();
        l.init();
        let o0 = order(&l);
        let mid = o0[NBUF / 2];
        l.unlink(mid);
        l.push_front(mid);
        let o1 = order(&l);
        assert_eq!(o1[0], mid);
        // Relative order of the others is preserved.
        let mut a = o0.iter().filter(|&&x| x != mid);
        let mut b = o1[1..].iter();
        loop {
            match (a.next(), b.next()) {
                (Some(x), Some(y)) => assert_eq!(x, y),
                (None, None) => break,
                _ => panic!("length mismatch"),
            }
        }
    }
}
