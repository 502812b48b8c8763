//! Virtio block device driver.
//!
//! For the qemu MMIO interface, and virtio descriptors.
//! The virtio spec: https://docs.oasis-open.org/virtio/virtio/v1.1/virtio-v1.1.pdf
//! qemu ... -drive file=fs.img,if=none,format=raw,id=x0
//!          -device virtio-blk-device,drive=x0,bus=virtio-mmio-bus.0

use crate::{
    buf::Buf,
    fs::BSIZE,
    mem::kalloc::kalloc,
    proc::scheduler::{sleep, wakeup},
    riscv::{memlayout::VIRTIO0, PGSIZE},
    sync::spinlock::Spinlock,
};
use core::{
    ptr::{addr_of, addr_of_mut, null_mut, write_bytes},
    sync::atomic::{fence, Ordering},
};

// Virtio MMIO control registers, mapped starting at VIRTIO0.
// From qemu virtio_mmio.h

/// 0x74726976
const VIRTIO_MMIO_MAGIC_VALUE: u64 = 0x000;
/// Version - should be 2.
const VIRTIO_MMIO_VERSION: u64 = 0x004;
/// Device type; 1 is network, 2 is disk.
const VIRTIO_MMIO_DEVICE_ID: u64 = 0x008;
/// 0x554d4551
const VIRTIO_MMIO_VENDOR_ID: u64 = 0x00c;
const VIRTIO_MMIO_DEVICE_FEATURES: u64 = 0x010;
const VIRTIO_MMIO_DRIVER_FEATURES: u64 = 0x020;
/// Select queue, write-only.
const VIRTIO_MMIO_QUEUE_SEL: u64 = 0x030;
/// Max size of current queue, read-only.
const VIRTIO_MMIO_QUEUE_NUM_MAX: u64 = 0x034;
/// Size of current queue, write-only.
const VIRTIO_MMIO_QUEUE_NUM: u64 = 0x038;
/// Ready bit.
const VIRTIO_MMIO_QUEUE_READY: u64 = 0x044;
/// Write-only.
const VIRTIO_MMIO_QUEUE_NOTIFY: u64 = 0x050;
/// Read-only.
const VIRTIO_MMIO_INTERRUPT_STATUS: u64 = 0x060;
/// Write-only.
const VIRTIO_MMIO_INTERRUPT_ACK: u64 = 0x064;
/// Read/write.
const VIRTIO_MMIO_STATUS: u64 = 0x070;
/// Physical address for descriptor table, write-only.
const VIRTIO_MMIO_QUEUE_DESC_LOW: u64 = 0x080;
const VIRTIO_MMIO_QUEUE_DESC_HIGH: u64 = 0x084;
/// Physical address for available ring, write-only.
const VIRTIO_MMIO_DRIVER_DESC_LOW: u64 = 0x090;
const VIRTIO_MMIO_DRIVER_DESC_HIGH: u64 = 0x094;
/// Physical address for used ring, write-only.
const VIRTIO_MMIO_DEVICE_DESC_LOW: u64 = 0x0a0;
const VIRTIO_MMIO_DEVICE_DESC_HIGH: u64 = 0x0a4;

// Status register bits, from qemu virtio_config.h.
const VIRTIO_CONFIG_S_ACKNOWLEDGE: u32 = 1;
const VIRTIO_CONFIG_S_DRIVER: u32 = 2;
const VIRTIO_CONFIG_S_DRIVER_OK: u32 = 4;
const VIRTIO_CONFIG_S_FEATURES_OK: u32 = 8;

// Device feature bits
/// Disk is read-only.
const VIRTIO_BLK_F_RO: u32 = 5;
/// Supports SCSI command passthrough.
const VIRTIO_BLK_F_SCSI: u32 = 7;
/// Writeback mode available in config.
const VIRTIO_BLK_F_CONFIG_WCE: u32 = 11;
/// Support more than one vq.
const VIRTIO_BLK_F_MQ: u32 = 12;
const VIRTIO_F_ANY_LAYOUT: u32 = 27;
const VIRTIO_RING_F_INDIRECT_DESC: u32 = 28;
const VIRTIO_RING_F_EVENT_IDX: u32 = 29;

/// This many virtio descriptors. Must be a power of two.
const NUM: usize = 8;

unsafe fn reg_read(r: u64) -> u32 {
    ((VIRTIO0 + r) as *const u32).read_volatile()
}

unsafe fn reg_write(r: u64, v: u32) {
    ((VIRTIO0 + r) as *mut u32).write_volatile(v);
}

/// A single descriptor, from the spec.
#[repr(C)]
struct VirtqDesc {
    addr: u64,
    len: u32,
    flags: u16,
    next: u16,
}

/// Chained with another descriptor.
const VRING_DESC_F_NEXT: u16 = 1;
/// Device writes (vs read).
const VRING_DESC_F_WRITE: u16 = 2;

/// The entire avail ring, from the spec.
#[repr(C)]
struct VirtqAvail {
    /// Always zero.
    flags: u16,
    /// Driver will write ring[idx] next.
    idx: u16,
    /// Descriptor numbers of chain heads.
    ring: [u16; NUM],
    unused: u16,
}

/// One entry in the "used" ring, with which the device tells the
/// driver about completed requests.
#[repr(C)]
struct VirtqUsedElem {
    /// Index of start of completed descriptor chain.
    id: u32,
    len: u32,
}

#[repr(C)]
struct VirtqUsed {
    /// Always zero.
    flags: u16,
    /// Device increments it when it adds a ring[] entry.
    idx: u16,
    ring: [VirtqUsedElem; NUM],
}

// These are specific to virtio block devices (disks),
// described in section 5.2 of the spec.

/// Read the disk.
const VIRTIO_BLK_T_IN: u32 = 0;
/// Write the disk.
const VIRTIO_BLK_T_OUT: u32 = 1;

/// The format of the first descriptor in a disk request. To be
/// followed by two more descriptors containing the block and a
/// one-byte status.
#[repr(C)]
struct VirtioBlkReq {
    kind: u32,
    reserved: u32,
    sector: u64,
}

struct Info {
    b: *mut Buf,
    status: u8,
}

struct Disk {
    /// A set (not a ring) of DMA descriptors, with which the driver
    /// tells the device where to read and write individual disk
    /// operations. Most commands consist of a "chain" (linked list)
    /// of a couple of these descriptors.
    desc: *mut VirtqDesc,
    /// A ring in which the driver writes descriptor numbers that the
    /// driver would like the device to process. Only includes the
    /// head descriptor of each chain.
    avail: *mut VirtqAvail,
    /// A ring in which the device writes descriptor numbers that the
    /// device has finished processing (just the head of each chain).
    used: *mut VirtqUsed,

    // Our own book-keeping.
    /// Is a descriptor free?
    free: [bool; NUM],
    /// We've looked this far in used[2..NUM].
    used_idx: u16,

    /// Track info about in-flight operations, for use when the
    /// completion interrupt arrives. Indexed by first descriptor
    /// index of the chain.
    info: [Info; NUM],

    /// Disk command headers. One-for-one with descriptors,
    /// for convenience.
    ops: [VirtioBlkReq; NUM],
}

static VDISK_LOCK: Spinlock = Spinlock::new();

static mut DISK: Disk = Disk {
    desc: null_mut(),
    avail: null_mut(),
    used: null_mut(),
    free: [false; NUM],
    used_idx: 0,
    info: [const {
        Info {
            b: null_mut(),
            status: 0,
        }
    }; NUM],
    ops: [const {
        VirtioBlkReq {
            kind: 0,
            reserved: 0,
            sector: 0,
        }
    }; NUM],
};

pub unsafe fn virtio_disk_init() {
    if reg_read(VIRTIO_MMIO_MAGIC_VALUE) != 0x7472_6976
        || reg_read(VIRTIO_MMIO_VERSION) != 2
        || reg_read(VIRTIO_MMIO_DEVICE_ID) != 2
        || reg_read(VIRTIO_MMIO_VENDOR_ID) != 0x554d_4551
    {
        panic!("could not find virtio disk");
    }

    // Reset the device.
    let mut status = 0;
    reg_write(VIRTIO_MMIO_STATUS, status);

    // Set ACKNOWLEDGE status bit.
    status |= VIRTIO_CONFIG_S_ACKNOWLEDGE;
    reg_write(VIRTIO_MMIO_STATUS, status);

    // Set DRIVER status bit.
    status |= VIRTIO_CONFIG_S_DRIVER;
    reg_write(VIRTIO_MMIO_STATUS, status);

    // Negotiate features.
    let mut features = reg_read(VIRTIO_MMIO_DEVICE_FEATURES);
    features &= !(1 << VIRTIO_BLK_F_RO);
    features &= !(1 << VIRTIO_BLK_F_SCSI);
    features &= !(1 << VIRTIO_BLK_F_CONFIG_WCE);
    features &= !(1 << VIRTIO_BLK_F_MQ);
    features &= !(1 << VIRTIO_F_ANY_LAYOUT);
    features &= !(1 << VIRTIO_RING_F_EVENT_IDX);
    features &= !(1 << VIRTIO_RING_F_INDIRECT_DESC);
    reg_write(VIRTIO_MMIO_DRIVER_FEATURES, features);

    // Tell the device that feature negotiation is complete.
    status |= VIRTIO_CONFIG_S_FEATURES_OK;
    reg_write(VIRTIO_MMIO_STATUS, status);

    // Re-read status to ensure FEATURES_OK is set.
    if reg_read(VIRTIO_MMIO_STATUS) & VIRTIO_CONFIG_S_FEATURES_OK == 0 {
        panic!("virtio disk FEATURES_OK unset");
    }

    // Initialize queue 0.
    reg_write(VIRTIO_MMIO_QUEUE_SEL, 0);

    // Ensure queue 0 is not in use.
    if reg_read(VIRTIO_MMIO_QUEUE_READY) != 0 {
        panic!("virtio disk should not be ready");
    }

    // Check maximum queue size.
    let max = reg_read(VIRTIO_MMIO_QUEUE_NUM_MAX);
    if max == 0 {
        panic!("virtio disk has no queue 0");
    }
    if max < NUM as u32 {
        panic!("virtio disk max queue too short");
    }

    // Allocate and zero queue memory.
    DISK.desc = kalloc() as *mut VirtqDesc;
    DISK.avail = kalloc() as *mut VirtqAvail;
    DISK.used = kalloc() as *mut VirtqUsed;
    if DISK.desc.is_null() || DISK.avail.is_null() || DISK.used.is_null() {
        panic!("virtio disk kalloc");
    }
    write_bytes(DISK.desc.cast::<u8>(), 0, PGSIZE as usize);
    write_bytes(DISK.avail.cast::<u8>(), 0, PGSIZE as usize);
    write_bytes(DISK.used.cast::<u8>(), 0, PGSIZE as usize);

    // Set queue size.
    reg_write(VIRTIO_MMIO_QUEUE_NUM, NUM as u32);

    // Write physical addresses.
    reg_write(VIRTIO_MMIO_QUEUE_DESC_LOW, DISK.desc as u64 as u32);
    reg_write(VIRTIO_MMIO_QUEUE_DESC_HIGH, (DISK.desc as u64 >> 32) as u32);
    reg_write(VIRTIO_MMIO_DRIVER_DESC_LOW, DISK.avail as u64 as u32);
    reg_write(
        VIRTIO_MMIO_DRIVER_DESC_HIGH,
        (DISK.avail as u64 >> 32) as u32,
    );
    reg_write(VIRTIO_MMIO_DEVICE_DESC_LOW, DISK.used as u64 as u32);
    reg_write(VIRTIO_MMIO_DEVICE_DESC_HIGH, (DISK.used as u64 >> 32) as u32);

    // Queue is ready.
    reg_write(VIRTIO_MMIO_QUEUE_READY, 1);

    // All NUM descriptors start out unused.
    DISK.free = [true; NUM];

    // Tell the device we're completely ready.
    status |= VIRTIO_CONFIG_S_DRIVER_OK;
    reg_write(VIRTIO_MMIO_STATUS, status);

    // plicinit and plicinithart arrange for interrupts from
    // VIRTIO0_IRQ.
}

/// Find a free descriptor, mark it non-free, return its index.
unsafe fn alloc_desc() -> Option<usize> {
    for i in 0..NUM {
        if DISK.free[i] {
            DISK.free[i] = false;
            return Some(i);
        }
    }
    None
}

/// Mark a descriptor as free.
unsafe fn free_desc(i: usize) {
    if i >= NUM {
        panic!("free_desc: out of range");
    }
    if DISK.free[i] {
        panic!("free_desc: already free");
    }
    let d = &mut *DISK.desc.add(i);
    d.addr = 0;
    d.len = 0;
    d.flags = 0;
    d.next = 0;
    DISK.free[i] = true;
    wakeup(addr_of!(DISK.free[0]) as usize);
}

/// Free a chain of descriptors.
unsafe fn free_chain(mut i: usize) {
    loop {
        let d = &*DISK.desc.add(i);
        let flag = d.flags;
        let next = d.next;
        free_desc(i);
        if flag & VRING_DESC_F_NEXT != 0 {
            i = next as usize;
        } else {
            break;
        }
    }
}

/// Allocate three descriptors (they need not be contiguous).
/// Disk transfers always use three descriptors.
unsafe fn alloc3_desc(idx: &mut [usize; 3]) -> bool {
    for i in 0..3 {
        match alloc_desc() {
            Some(d) => idx[i] = d,
            None => {
                for &j in idx.iter().take(i) {
                    free_desc(j);
                }
                return false;
            }
        }
    }
    true
}

pub unsafe fn virtio_disk_rw(b: &mut Buf, write: bool) {
    // The spec's section 5.2 says that legacy block operations use
    // three descriptors: one for type/reserved/sector, one for the
    // data, one for a 1-byte status result.
    let sector = b.blockno as u64 * (BSIZE as u64 / 512);

    VDISK_LOCK.acquire();

    // Allocate the three descriptors.
    let mut idx = [0usize; 3];
    while !alloc3_desc(&mut idx) {
        sleep(addr_of!(DISK.free[0]) as usize, &VDISK_LOCK);
    }

    // Format the three descriptors.

    let buf0 = &mut DISK.ops[idx[0]];
    buf0.kind = if write {
        VIRTIO_BLK_T_OUT // write the disk
    } else {
        VIRTIO_BLK_T_IN // read the disk
    };
    buf0.reserved = 0;
    buf0.sector = sector;

    let d0 = &mut *DISK.desc.add(idx[0]);
    d0.addr = buf0 as *const VirtioBlkReq as u64;
    d0.len = core::mem::size_of::<VirtioBlkReq>() as u32;
    d0.flags = VRING_DESC_F_NEXT;
    d0.next = idx[1] as u16;

    let d1 = &mut *DISK.desc.add(idx[1]);
    d1.addr = b.data.as_mut_ptr() as u64;
    d1.len = BSIZE as u32;
    d1.flags = if write {
        0 // device reads b.data
    } else {
        VRING_DESC_F_WRITE // device writes b.data
    };
    d1.flags |= VRING_DESC_F_NEXT;
    d1.next = idx[2] as u16;

    DISK.info[idx[0]].status = 0xff; // device writes 0 on success
    let d2 = &mut *DISK.desc.add(idx[2]);
    d2.addr = addr_of_mut!(DISK.info[idx[0]].status) as u64;
    d2.len = 1;
    d2.flags = VRING_DESC_F_WRITE; // device writes the status
    d2.next = 0;

    // Record struct Buf for virtio_disk_intr().
    b.disk = true;
    DISK.info[idx[0]].b = b;

    // Tell the device the first index in our chain of descriptors.
    let avail = &mut *DISK.avail;
    avail.ring[avail.idx as usize % NUM] = idx[0] as u16;

    fence(Ordering::SeqCst);

    // Tell the device another avail ring entry is available.
    avail.idx = avail.idx.wrapping_add(1);

    fence(Ordering::SeqCst);

    reg_write(VIRTIO_MMIO_QUEUE_NOTIFY, 0); // value is queue number

    // Wait for virtio_disk_intr() to say the request has finished.
    while b.disk {
        sleep(b as *const Buf as usize, &VDISK_LOCK);
    }

    DISK.info[idx[0]].b = null_mut();
    free_chain(idx[0]);

    VDISK_LOCK.release();
}

pub unsafe fn virtio_disk_intr() {
    VDISK_LOCK.acquire();

    // The device won't raise a second interrupt until we tell it we've
    // seen this one. This read and write must happen before anything
    // else, and together.
    reg_write(
        VIRTIO_MMIO_INTERRUPT_ACK,
        reg_read(VIRTIO_MMIO_INTERRUPT_STATUS) & 0x3,
    );

    fence(Ordering::SeqCst);

    // The device increments used.idx when it adds
    // an entry to the used ring.
    let used = &*DISK.used;
    while DISK.used_idx != used.idx {
        fence(Ordering::SeqCst);
        let id = used.ring[DISK.used_idx as usize % NUM].id as usize;

        if DISK.info[id].status != 0 {
            panic!("virtio_disk_intr status");
        }

        let b = DISK.info[id].b;
        (*b).disk = false; // disk is done with this buf
        wakeup(b as usize);

        DISK.used_idx = DISK.used_idx.wrapping_add(1);
    }

    VDISK_LOCK.release();
}
