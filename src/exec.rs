use crate::{
    fs::{
        self,
        log::{begin_op, end_op},
        Inode,
    },
    mem::vm::{copyout, uvmalloc, uvmclear, walkaddr},
    param::{MAXARG, MAXPATH},
    proc::process::{proc_freepagetable, proc_pagetable, Proc},
    riscv::{pg_round_up, Pagetable, PteFlags, PGSIZE},
};
use arrayvec::ArrayVec;
use core::mem::size_of;

// Format of an ELF executable file.

pub const ELF_MAGIC: u32 = 0x464c_457f; // "\x7FELF" in little endian

/// File header.
#[repr(C)]
struct ElfHeader {
    magic: u32, // must equal ELF_MAGIC
    elf: [u8; 12],
    kind: u16,
    machine: u16,
    version: u32,
    entry: u64,
    phoff: u64,
    shoff: u64,
    flags: u32,
    ehsize: u16,
    phentsize: u16,
    phnum: u16,
    shentsize: u16,
    shnum: u16,
    shstrndx: u16,
}

/// Program section header.
#[repr(C)]
struct ProgHeader {
    kind: u32,
    flags: u32,
    off: u64,
    vaddr: u64,
    paddr: u64,
    filesz: u64,
    memsz: u64,
    align: u64,
}

/// Values for ProgHeader kind.
const ELF_PROG_LOAD: u32 = 1;

/// Flag bits for ProgHeader flags.
const ELF_PROG_FLAG_EXEC: u32 = 1;
const ELF_PROG_FLAG_WRITE: u32 = 2;

fn flags2perm(flags: u32) -> PteFlags {
    let mut perm = PteFlags::empty();
    if flags & ELF_PROG_FLAG_EXEC != 0 {
        perm |= PteFlags::X;
    }
    if flags & ELF_PROG_FLAG_WRITE != 0 {
        perm |= PteFlags::W;
    }
    perm
}

/// Replace the current process image with the program at path.
/// Returns argc (which lands in a0, the first argument to
/// main(argc, argv)), or Err on any failure, in which case the
/// calling image is untouched.
pub unsafe fn exec(path: &[u8; MAXPATH], argv: &ArrayVec<*mut u8, MAXARG>) -> Result<u64, ()> {
    let p = Proc::current().unwrap();

    begin_op();

    let ip = fs::namei(path);
    if ip.is_null() {
        end_op();
        return Err(());
    }
    fs::ilock(ip);

    let mut pagetable: Pagetable = core::ptr::null_mut();
    let mut sz: u64 = 0;

    // The cleanup common to every failure path after this point.
    unsafe fn bad(pagetable: Pagetable, sz: u64, ip: *mut Inode) -> Result<u64, ()> {
        if !pagetable.is_null() {
            proc_freepagetable(pagetable, sz);
        }
        if !ip.is_null() {
            fs::iunlockput(ip);
            end_op();
        }
        Err(())
    }

    // Check ELF header.
    let mut elf = core::mem::zeroed::<ElfHeader>();
    if fs::readi(
        ip,
        false,
        &mut elf as *mut ElfHeader as u64,
        0,
        size_of::<ElfHeader>() as u32,
    ) != size_of::<ElfHeader>() as i32
        || elf.magic != ELF_MAGIC
    {
        return bad(pagetable, sz, ip);
    }

    pagetable = proc_pagetable(p);
    if pagetable.is_null() {
        return bad(pagetable, sz, ip);
    }

    // Load program into memory.
    let mut off = elf.phoff;
    for _ in 0..elf.phnum {
        let mut ph = core::mem::zeroed::<ProgHeader>();
        if fs::readi(
            ip,
            false,
            &mut ph as *mut ProgHeader as u64,
            off as u32,
            size_of::<ProgHeader>() as u32,
        ) != size_of::<ProgHeader>() as i32
        {
            return bad(pagetable, sz, ip);
        }
        off += size_of::<ProgHeader>() as u64;

        if ph.kind != ELF_PROG_LOAD {
            continue;
        }
        if ph.memsz < ph.filesz
            || ph.vaddr + ph.memsz < ph.vaddr
            || ph.vaddr % PGSIZE != 0
        {
            return bad(pagetable, sz, ip);
        }

        let sz1 = uvmalloc(pagetable, sz, ph.vaddr + ph.memsz, flags2perm(ph.flags));
        if sz1 == 0 {
            return bad(pagetable, sz, ip);
        }
        sz = sz1;

        if loadseg(pagetable, ph.vaddr, ip, ph.off as u32, ph.filesz as u32).is_err() {
            return bad(pagetable, sz, ip);
        }
    }
    fs::iunlockput(ip);
    end_op();

    let oldsz = p.sz;

    // Allocate two pages at the next page boundary.
    // Make the first inaccessible as a stack guard.
    // Use the second as the user stack.
    sz = pg_round_up(sz);
    let sz1 = uvmalloc(pagetable, sz, sz + 2 * PGSIZE, PteFlags::W);
    if sz1 == 0 {
        return bad(pagetable, sz, core::ptr::null_mut());
    }
    sz = sz1;
    uvmclear(pagetable, sz - 2 * PGSIZE);
    let mut sp = sz;
    let stackbase = sp - PGSIZE;

    // Push argument strings, prepare rest of stack in ustack.
    let mut ustack = ArrayVec::<u64, { MAXARG + 1 }>::new();
    for &arg in argv.iter() {
        let len = strlen(arg);
        sp -= len as u64 + 1;
        sp -= sp % 16; // riscv sp must be 16-byte aligned
        if sp < stackbase {
            return bad(pagetable, sz, core::ptr::null_mut());
        }
        if copyout(pagetable, sp, arg, len as u64 + 1).is_err() {
            return bad(pagetable, sz, core::ptr::null_mut());
        }
        ustack.push(sp);
    }
    ustack.push(0);

    // Push the array of argv[] pointers.
    let argv_bytes = (ustack.len() * size_of::<u64>()) as u64;
    sp -= argv_bytes;
    sp -= sp % 16;
    if sp < stackbase {
        return bad(pagetable, sz, core::ptr::null_mut());
    }
    if copyout(pagetable, sp, ustack.as_ptr().cast(), argv_bytes).is_err() {
        return bad(pagetable, sz, core::ptr::null_mut());
    }

    // Arguments to user main(argc, argv).
    // argc is returned via the system call return value, which goes
    // in a0.
    (*p.trapframe).a1 = sp;

    // Save program name for debugging.
    let end = path.iter().position(|&c| c == 0).unwrap_or(path.len());
    let last = match path[..end].iter().rposition(|&c| c == b'/') {
        Some(i) => i + 1,
        None => 0,
    };
    p.set_name(&path[last..end]);

    // Commit to the user image.
    let oldpagetable = p.pagetable;
    p.pagetable = pagetable;
    p.sz = sz;
    (*p.trapframe).epc = elf.entry; // initial program counter = main
    (*p.trapframe).sp = sp; // initial stack pointer
    proc_freepagetable(oldpagetable, oldsz);

    Ok(argv.len() as u64)
}

/// Load a program segment into pagetable at virtual address va.
/// va must be page-aligned and the pages from va to va+sz must
/// already be mapped.
unsafe fn loadseg(pagetable: Pagetable, va: u64, ip: *mut Inode, offset: u32, sz: u32) -> Result<(), ()> {
    let mut i = 0;
    while i < sz {
        let pa = walkaddr(pagetable, va + i as u64);
        if pa == 0 {
            panic!("loadseg: address should exist");
        }
        let n = if sz - i < PGSIZE as u32 {
            sz - i
        } else {
            PGSIZE as u32
        };
        if fs::readi(ip, false, pa, offset + i, n) != n as i32 {
            return Err(());
        }
        i += PGSIZE as u32;
    }

    Ok(())
}

unsafe fn strlen(s: *const u8) -> usize {
    let mut n = 0;
    while *s.add(n) != 0 {
        n += 1;
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags2perm_maps_elf_bits() {
        assert_eq!(flags2perm(0), PteFlags::empty());
        assert_eq!(flags2perm(ELF_PROG_FLAG_EXEC), PteFlags::X);
        assert_eq!(flags2perm(ELF_PROG_FLAG_WRITE), PteFlags::W);
        assert_eq!(
            flags2perm(ELF_PROG_FLAG_EXEC | ELF_PROG_FLAG_WRITE),
            PteFlags::X | PteFlags::W
        );
    }

    #[test]
    fn headers_have_elf_layout() {
        assert_eq!(core::mem::size_of::<ElfHeader>(), 64);
        assert_eq!(core::mem::size_of::<ProgHeader>(), 56);
    }
}
