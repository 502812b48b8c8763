//! System call argument fetch, dispatch, and the per-call handlers.

use crate::{
    exec::exec,
    file::{filealloc, fileclose, filedup, fileread, filestat, filewrite, File, FileKind},
    fs::{
        self,
        log::{begin_op, end_op},
        stat::{T_DEVICE, T_DIR, T_FILE},
        Inode, DIRSIZ,
    },
    mem::{
        kalloc::{kalloc, kfree},
        vm::{copyin, copyinstr, copyout},
    },
    param::{MAXARG, MAXPATH, NDEV, NOFILE},
    pipe::pipealloc,
    proc::{self, process::Proc, procinfo, Pstat},
    riscv::PGSIZE,
    sync::spinlock::SpinMutex,
    trap::{ticks_chan, CLOCK_TICKS},
};
use arrayvec::ArrayVec;
use bitflags::bitflags;
use core::{
    mem::size_of,
    ptr::{addr_of, addr_of_mut, null_mut},
};

bitflags! {
    /// open(2) mode bits. O_RDONLY is the absence of all of them.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct OpenFlags: i32 {
        const WRONLY = 0x001;
        const RDWR = 0x002;
        const CREATE = 0x200;
        const TRUNC = 0x400;
    }
}

/// Total number of read(2) invocations since boot.
pub static READ_COUNT: SpinMutex<u32> = SpinMutex::new(0);

/// Fetch the u64 at addr from the current process.
unsafe fn fetchaddr(addr: u64) -> Result<u64, ()> {
    let p = Proc::current().unwrap();

    // Both tests needed, in case of overflow.
    if addr >= p.sz || addr + size_of::<u64>() as u64 > p.sz {
        return Err(());
    }

    let mut val = 0u64;
    copyin(
        p.pagetable,
        addr_of_mut!(val).cast(),
        addr,
        size_of::<u64>() as u64,
    )?;
    Ok(val)
}

/// Fetch the nul-terminated string at addr from the current process.
/// Returns the string length, not including the nul.
unsafe fn fetchstr(addr: u64, buf: &mut [u8]) -> Result<usize, ()> {
    let p = Proc::current().unwrap();
    copyinstr(p.pagetable, buf, addr)?;
    Ok(buf.iter().position(|&c| c == 0).unwrap_or(buf.len()))
}

unsafe fn argraw(n: usize) -> u64 {
    let p = Proc::current().unwrap();
    let tf = &*p.trapframe;
    match n {
        0 => tf.a0,
        1 => tf.a1,
        2 => tf.a2,
        3 => tf.a3,
        4 => tf.a4,
        5 => tf.a5,
        _ => panic!("argraw"),
    }
}

/// Fetch the nth 32-bit system call argument.
unsafe fn argint(n: usize) -> i32 {
    argraw(n) as i32
}

/// Retrieve an argument as a pointer.
/// Doesn't check for legality, since copyin/copyout will do that.
unsafe fn argaddr(n: usize) -> u64 {
    argraw(n)
}

/// Fetch the nth word-sized system call argument as a file
/// descriptor and return both the descriptor and the corresponding
/// File.
unsafe fn argfd(n: usize) -> Result<(usize, *mut File), ()> {
    let fd = argraw(n) as usize;
    if fd >= NOFILE {
        return Err(());
    }
    let f = Proc::current().unwrap().ofile[fd];
    if f.is_null() {
        return Err(());
    }
    Ok((fd, f))
}

/// Fetch the nth word-sized system call argument as a
/// nul-terminated string, copied into buf.
/// Returns the string length if ok (excluding nul), or Err.
unsafe fn argstr(n: usize, buf: &mut [u8]) -> Result<usize, ()> {
    let addr = argaddr(n);
    fetchstr(addr, buf)
}

/// Allocate a file descriptor for the given file.
/// Takes over the file reference from the caller on success.
unsafe fn fdalloc(f: *mut File) -> Result<usize, ()> {
    let p = Proc::current().unwrap();
    for (fd, slot) in p.ofile.iter_mut().enumerate() {
        if slot.is_null() {
            *slot = f;
            return Ok(fd);
        }
    }
    Err(())
}

/// Is the directory dp empty except for "." and ".." ?
unsafe fn isdirempty(dp: *mut Inode) -> bool {
    let desize = size_of::<fs::Dirent>() as u32;
    let mut de = fs::Dirent {
        inum: 0,
        name: [0; DIRSIZ],
    };

    let mut off = 2 * desize;
    while off < (*dp).size {
        if fs::readi(dp, false, addr_of_mut!(de) as u64, off, desize) != desize as i32 {
            panic!("isdirempty: readi");
        }
        if de.inum != 0 {
            return false;
        }
        off += desize;
    }
    true
}

fn name_of(buf: &[u8]) -> [u8; DIRSIZ] {
    let mut name = [0u8; DIRSIZ];
    let n = buf
        .iter()
        .position(|&c| c == 0)
        .unwrap_or(buf.len())
        .min(DIRSIZ);
    name[..n].copy_from_slice(&buf[..n]);
    name
}

/// Create a new inode at path, returning it locked.
/// Shared by open(O_CREATE), mkdir, and mknod.
unsafe fn create(path: &[u8], typ: i16, major: i16, minor: i16) -> *mut Inode {
    let mut name = [0u8; DIRSIZ];
    let dp = fs::nameiparent(path, &mut name);
    if dp.is_null() {
        return null_mut();
    }

    fs::ilock(dp);

    let ip = fs::dirlookup(dp, &name, None);
    if !ip.is_null() {
        fs::iunlockput(dp);
        fs::ilock(ip);
        if typ == T_FILE && matches!((*ip).typ, T_FILE | T_DEVICE) {
            return ip;
        }
        fs::iunlockput(ip);
        return null_mut();
    }

    let ip = fs::ialloc((*dp).dev, typ);
    fs::ilock(ip);
    (*ip).major = major;
    (*ip).minor = minor;
    (*ip).nlink = 1;
    fs::iupdate(ip);

    let mut ok = true;
    if typ == T_DIR {
        // Create "." and ".." entries.
        ok = fs::dirlink(ip, &name_of(b"."), (*ip).inum).is_ok()
            && fs::dirlink(ip, &name_of(b".."), (*dp).inum).is_ok();
    }
    if ok {
        ok = fs::dirlink(dp, &name, (*ip).inum).is_ok();
    }

    if !ok {
        // Something went wrong; de-allocate ip.
        (*ip).nlink = 0;
        fs::iupdate(ip);
        fs::iunlockput(ip);
        fs::iunlockput(dp);
        return null_mut();
    }

    if typ == T_DIR {
        // Now that success is guaranteed:
        (*dp).nlink += 1; // for ".."
        fs::iupdate(dp);
    }

    fs::iunlockput(dp);

    ip
}

pub enum Syscall {
    Fork,
    Exit,
    Wait,
    Pipe,
    Read,
    Kill,
    Exec,
    Fstat,
    Chdir,
    Dup,
    Getpid,
    Sbrk,
    Sleep,
    Uptime,
    Open,
    Write,
    Mknod,
    Unlink,
    Link,
    Mkdir,
    Close,
    Readcount,
    Alarm,
    Settickets,
    Getpinfo,
}

const ERR: u64 = -1i64 as u64;

impl Syscall {
    pub unsafe fn call(&self) -> u64 {
        match self {
            Syscall::Fork => match proc::process::fork() {
                Ok(pid) => pid as u64,
                Err(_) => ERR,
            },
            Syscall::Exit => {
                let n = argint(0);
                proc::process::exit(n)
            }
            Syscall::Wait => {
                let addr = argaddr(0);
                match proc::process::wait(addr) {
                    Ok(pid) => pid as u64,
                    Err(_) => ERR,
                }
            }
            Syscall::Pipe => {
                // User pointer to array of two integers.
                let fdarray = argaddr(0);
                let p = Proc::current().unwrap();

                let mut rf: *mut File = null_mut();
                let mut wf: *mut File = null_mut();
                if pipealloc(&mut rf, &mut wf).is_err() {
                    return ERR;
                }

                let Ok(fd0) = fdalloc(rf) else {
                    fileclose(rf);
                    fileclose(wf);
                    return ERR;
                };
                let Ok(fd1) = fdalloc(wf) else {
                    p.ofile[fd0] = null_mut();
                    fileclose(rf);
                    fileclose(wf);
                    return ERR;
                };

                let fds = [fd0 as i32, fd1 as i32];
                if copyout(
                    p.pagetable,
                    fdarray,
                    fds.as_ptr().cast(),
                    size_of::<[i32; 2]>() as u64,
                )
                .is_err()
                {
                    p.ofile[fd0] = null_mut();
                    p.ofile[fd1] = null_mut();
                    fileclose(rf);
                    fileclose(wf);
                    return ERR;
                }
                0
            }
            Syscall::Read => {
                let Ok((_, f)) = argfd(0) else {
                    return ERR;
                };
                let addr = argaddr(1);
                let n = argint(2);

                *READ_COUNT.lock() += 1;

                fileread(f, addr, n) as i64 as u64
            }
            Syscall::Kill => {
                let pid = argint(0);
                proc::process::kill(pid) as i64 as u64
            }
            Syscall::Exec => {
                let mut path = [0u8; MAXPATH];
                if argstr(0, &mut path).is_err() {
                    return ERR;
                }
                let uargv = argaddr(1);

                let mut argv = ArrayVec::<*mut u8, MAXARG>::new();
                let mut ok = true;
                let mut i = 0;
                loop {
                    if i >= MAXARG {
                        ok = false;
                        break;
                    }
                    let Ok(uarg) = fetchaddr(uargv + (size_of::<u64>() * i) as u64) else {
                        ok = false;
                        break;
                    };
                    if uarg == 0 {
                        break;
                    }

                    let buf = kalloc();
                    if buf.is_null() {
                        ok = false;
                        break;
                    }
                    argv.push(buf);

                    if fetchstr(uarg, core::slice::from_raw_parts_mut(buf, PGSIZE as usize))
                        .is_err()
                    {
                        ok = false;
                        break;
                    }
                    i += 1;
                }

                let ret = if ok { exec(&path, &argv) } else { Err(()) };

                for buf in argv {
                    kfree(buf);
                }

                match ret {
                    Ok(argc) => argc,
                    Err(_) => ERR,
                }
            }
            Syscall::Fstat => {
                let Ok((_, f)) = argfd(0) else {
                    return ERR;
                };
                // User pointer to struct Stat.
                let addr = argaddr(1);
                filestat(f, addr) as i64 as u64
            }
            Syscall::Chdir => {
                let mut path = [0u8; MAXPATH];
                let p = Proc::current().unwrap();

                begin_op();
                if argstr(0, &mut path).is_err() {
                    end_op();
                    return ERR;
                }
                let ip = fs::namei(&path);
                if ip.is_null() {
                    end_op();
                    return ERR;
                }
                fs::ilock(ip);
                if (*ip).typ != T_DIR {
                    fs::iunlockput(ip);
                    end_op();
                    return ERR;
                }
                fs::iunlock(ip);
                fs::iput(p.cwd);
                end_op();
                p.cwd = ip;
                0
            }
            Syscall::Dup => {
                let Ok((_, f)) = argfd(0) else {
                    return ERR;
                };
                let Ok(fd) = fdalloc(f) else {
                    return ERR;
                };
                filedup(f);
                fd as u64
            }
            Syscall::Getpid => Proc::current().unwrap().pid as u64,
            Syscall::Sbrk => {
                let n = argint(0);
                let addr = Proc::current().unwrap().sz;
                if proc::process::growproc(n).is_err() {
                    return ERR;
                }
                addr
            }
            Syscall::Sleep => {
                let n = argint(0);
                let mut ticks = CLOCK_TICKS.lock();
                let ticks0 = *ticks;
                while ticks.wrapping_sub(ticks0) < n as u32 {
                    if Proc::current().unwrap().is_killed() {
                        return ERR;
                    }
                    // Sleep until the next clock tick.
                    ticks.sleep(ticks_chan());
                }
                0
            }
            // How many clock tick interrupts have occurred since start.
            Syscall::Uptime => *CLOCK_TICKS.lock() as u64,
            Syscall::Open => {
                let mut path = [0u8; MAXPATH];
                if argstr(0, &mut path).is_err() {
                    return ERR;
                }
                let omode = argint(1);
                let flags = OpenFlags::from_bits_truncate(omode);

                begin_op();

                let ip;
                if flags.contains(OpenFlags::CREATE) {
                    ip = create(&path, T_FILE, 0, 0);
                    if ip.is_null() {
                        end_op();
                        return ERR;
                    }
                } else {
                    ip = fs::namei(&path);
                    if ip.is_null() {
                        end_op();
                        return ERR;
                    }
                    fs::ilock(ip);
                    if (*ip).typ == T_DIR && omode != 0 {
                        // Directories may only be opened read-only.
                        fs::iunlockput(ip);
                        end_op();
                        return ERR;
                    }
                }

                if (*ip).typ == T_DEVICE && ((*ip).major < 0 || (*ip).major as usize >= NDEV) {
                    fs::iunlockput(ip);
                    end_op();
                    return ERR;
                }

                let f = filealloc();
                let fd = if f.is_null() { Err(()) } else { fdalloc(f) };
                let Ok(fd) = fd else {
                    if !f.is_null() {
                        fileclose(f);
                    }
                    fs::iunlockput(ip);
                    end_op();
                    return ERR;
                };

                if (*ip).typ == T_DEVICE {
                    (*f).kind = FileKind::Device;
                    (*f).major = (*ip).major;
                } else {
                    (*f).kind = FileKind::Inode;
                    (*f).off = 0;
                }
                (*f).ip = ip;
                (*f).readable = !flags.contains(OpenFlags::WRONLY);
                (*f).writable =
                    flags.contains(OpenFlags::WRONLY) || flags.contains(OpenFlags::RDWR);

                if flags.contains(OpenFlags::TRUNC) && (*ip).typ == T_FILE {
                    fs::itrunc(ip);
                }

                fs::iunlock(ip);
                end_op();

                fd as u64
            }
            Syscall::Write => {
                let Ok((_, f)) = argfd(0) else {
                    return ERR;
                };
                let addr = argaddr(1);
                let n = argint(2);
                filewrite(f, addr, n) as i64 as u64
            }
            Syscall::Mknod => {
                let mut path = [0u8; MAXPATH];

                begin_op();
                let major = argint(1);
                let minor = argint(2);
                if argstr(0, &mut path).is_err() {
                    end_op();
                    return ERR;
                }
                let ip = create(&path, T_DEVICE, major as i16, minor as i16);
                if ip.is_null() {
                    end_op();
                    return ERR;
                }
                fs::iunlockput(ip);
                end_op();
                0
            }
            Syscall::Unlink => {
                let mut path = [0u8; MAXPATH];
                if argstr(0, &mut path).is_err() {
                    return ERR;
                }

                begin_op();
                let mut name = [0u8; DIRSIZ];
                let dp = fs::nameiparent(&path, &mut name);
                if dp.is_null() {
                    end_op();
                    return ERR;
                }

                fs::ilock(dp);

                unsafe fn bad(dp: *mut Inode) -> u64 {
                    fs::iunlockput(dp);
                    end_op();
                    ERR
                }

                // Cannot unlink "." or "..".
                if name == name_of(b".") || name == name_of(b"..") {
                    return bad(dp);
                }

                let mut off = 0u32;
                let ip = fs::dirlookup(dp, &name, Some(&mut off));
                if ip.is_null() {
                    return bad(dp);
                }
                fs::ilock(ip);

                if (*ip).nlink < 1 {
                    panic!("unlink: nlink < 1");
                }
                if (*ip).typ == T_DIR && !isdirempty(ip) {
                    fs::iunlockput(ip);
                    return bad(dp);
                }

                let desize = size_of::<fs::Dirent>() as u32;
                let de = fs::Dirent {
                    inum: 0,
                    name: [0; DIRSIZ],
                };
                if fs::writei(dp, false, addr_of!(de) as u64, off, desize) != desize as i32 {
                    panic!("unlink: writei");
                }
                if (*ip).typ == T_DIR {
                    (*dp).nlink -= 1;
                    fs::iupdate(dp);
                }
                fs::iunlockput(dp);

                (*ip).nlink -= 1;
                fs::iupdate(ip);
                fs::iunlockput(ip);

                end_op();
                0
            }
            Syscall::Link => {
                let mut old = [0u8; MAXPATH];
                let mut new = [0u8; MAXPATH];
                if argstr(0, &mut old).is_err() || argstr(1, &mut new).is_err() {
                    return ERR;
                }

                begin_op();
                let ip = fs::namei(&old);
                if ip.is_null() {
                    end_op();
                    return ERR;
                }

                fs::ilock(ip);
                if (*ip).typ == T_DIR {
                    fs::iunlockput(ip);
                    end_op();
                    return ERR;
                }

                (*ip).nlink += 1;
                fs::iupdate(ip);
                fs::iunlock(ip);

                let mut name = [0u8; DIRSIZ];
                let dp = fs::nameiparent(&new, &mut name);
                let mut ok = false;
                if !dp.is_null() {
                    fs::ilock(dp);
                    if (*dp).dev == (*ip).dev && fs::dirlink(dp, &name, (*ip).inum).is_ok() {
                        ok = true;
                        fs::iunlockput(dp);
                    } else {
                        fs::iunlockput(dp);
                    }
                }

                if ok {
                    fs::iput(ip);
                    end_op();
                    0
                } else {
                    fs::ilock(ip);
                    (*ip).nlink -= 1;
                    fs::iupdate(ip);
                    fs::iunlockput(ip);
                    end_op();
                    ERR
                }
            }
            Syscall::Mkdir => {
                let mut path = [0u8; MAXPATH];

                begin_op();
                if argstr(0, &mut path).is_err() {
                    end_op();
                    return ERR;
                }
                let ip = create(&path, T_DIR, 0, 0);
                if ip.is_null() {
                    end_op();
                    return ERR;
                }
                fs::iunlockput(ip);
                end_op();
                0
            }
            Syscall::Close => {
                let Ok((fd, f)) = argfd(0) else {
                    return ERR;
                };
                Proc::current().unwrap().ofile[fd] = null_mut();
                fileclose(f);
                0
            }
            // Total times processes have called the read() system call.
            Syscall::Readcount => *READ_COUNT.lock() as u64,
            Syscall::Alarm => {
                // After every n ticks of CPU time this process
                // consumes, call the handler.
                let n = argint(0);
                let handler = argaddr(1);
                let p = Proc::current().unwrap();
                p.alarmticks = n as u32;
                p.alarmhandler = handler;
                0
            }
            Syscall::Settickets => {
                let n = argint(0);
                if n < 1 {
                    return ERR;
                }
                Proc::current().unwrap().tickets = n as u32;
                0
            }
            Syscall::Getpinfo => {
                let addr = argaddr(0);
                let p = Proc::current().unwrap();

                let mut ps = Pstat::new();
                procinfo(&mut ps);

                if copyout(
                    p.pagetable,
                    addr,
                    addr_of!(ps).cast(),
                    size_of::<Pstat>() as u64,
                )
                .is_err()
                {
                    return ERR;
                }
                0
            }
        }
    }
}

impl TryFrom<usize> for Syscall {
    type Error = ();

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Syscall::Fork),
            2 => Ok(Syscall::Exit),
            3 => Ok(Syscall::Wait),
            4 => Ok(Syscall::Pipe),
            5 => Ok(Syscall::Read),
            6 => Ok(Syscall::Kill),
            7 => Ok(Syscall::Exec),
            8 => Ok(Syscall::Fstat),
            9 => Ok(Syscall::Chdir),
            10 => Ok(Syscall::Dup),
            11 => Ok(Syscall::Getpid),
            12 => Ok(Syscall::Sbrk),
            13 => Ok(Syscall::Sleep),
            14 => Ok(Syscall::Uptime),
            15 => Ok(Syscall::Open),
            16 => Ok(Syscall::Write),
            17 => Ok(Syscall::Mknod),
            18 => Ok(Syscall::Unlink),
            19 => Ok(Syscall::Link),
            20 => Ok(Syscall::Mkdir),
            21 => Ok(Syscall::Close),
            22 => Ok(Syscall::Readcount),
            23 => Ok(Syscall::Alarm),
            24 => Ok(Syscall::Settickets),
            25 => Ok(Syscall::Getpinfo),
            _ => Err(()),
        }
    }
}

pub unsafe fn syscall() {
    let p = Proc::current().unwrap();
    let num = (*p.trapframe).a7 as usize;

    (*p.trapframe).a0 = match Syscall::try_from(num) {
        Ok(call) => call.call(),
        Err(_) => {
            log::warn!("{} unknown sys call {}", p.pid, num);
            ERR
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syscall_numbers_round_trip() {
        for n in 1..=25usize {
            let call = Syscall::try_from(n);
            assert!(call.is_ok(), "number {n} must dispatch");
        }
        assert!(Syscall::try_from(0).is_err());
        assert!(Syscall::try_from(26).is_err());
    }

    #[test]
    fn open_flags_decode() {
        let f = OpenFlags::from_bits_truncate(0x601);
        assert!(f.contains(OpenFlags::WRONLY));
        assert!(f.contains(OpenFlags::CREATE));
        assert!(f.contains(OpenFlags::TRUNC));
        assert!(!f.contains(OpenFlags::RDWR));
        // O_RDONLY is all bits clear.
        assert_eq!(OpenFlags::from_bits_truncate(0), OpenFlags::empty());
    }

    #[test]
    fn dirent_names_compare_padded() {
        assert_eq!(name_of(b"."), name_of(b".\0\0"));
        assert_ne!(name_of(b"."), name_of(b".."));
        // Oversized names are truncated to DIRSIZ.
        assert_eq!(
            name_of(b"aaaaaaaaaaaaaaaaaa"),
            name_of(b"aaaaaaaaaaaaaa")
        );
    }
}
