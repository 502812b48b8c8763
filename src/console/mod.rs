//! Console input and output, to the uart.
//!
//! Reads are a line at a time. Implements special input characters:
//! - newline: end of line
//! - DEL: erase one character
//! - ctrl-p: print process list

pub mod printf;
pub mod uart;

use crate::{
    file::{CONSOLE, DEVSW},
    mem::vm::copyin,
    param::INPUT_BUF_SIZE,
    proc::{
        process::{either_copyout, Proc},
        procdump,
        scheduler::wakeup,
    },
    sync::spinlock::{SpinMutex, SpinMutexGuard},
};

/// Sentinel passed to consputc() to rub out the last character.
pub const BACKSPACE: i32 = 0x100;

/// Control-x
const fn ctrl(x: u8) -> u8 {
    x - b'@'
}

struct Console {
    buf: [u8; INPUT_BUF_SIZE],
    /// Next byte consumed by consoleread()
    read_index: usize,
    /// First byte not yet visible to consoleread()
    write_index: usize,
    /// Next byte stored by consoleintr()
    edit_index: usize,
}

static CONS: SpinMutex<Console> = SpinMutex::new(Console {
    buf: [0; INPUT_BUF_SIZE],
    read_index: 0,
    write_index: 0,
    edit_index: 0,
});

fn cons_chan(cons: &SpinMutexGuard<'_, Console>) -> usize {
    &cons.read_index as *const usize as usize
}

/// Send one character to the UART.
///
/// Called by printf(), and to echo input characters,
/// but not from write().
pub fn consputc(c: i32) {
    unsafe {
        if c == BACKSPACE {
            // The user typed backspace; overwrite with a space.
            uart::uartputc_sync(0x08);
            uart::uartputc_sync(b' ');
            uart::uartputc_sync(0x08);
        } else {
            uart::uartputc_sync(c as u8);
        }
    }
}

/// User write()s to the console go here.
/// src is a user virtual address. Returns the number of bytes written.
fn consolewrite(src: u64, n: i32) -> i32 {
    let p = Proc::current().unwrap();

    for i in 0..n {
        let mut c = 0u8;
        if unsafe { copyin(p.pagetable, &mut c, src + i as u64, 1) }.is_err() {
            return i;
        }
        unsafe { uart::uartputc(c) };
    }

    n
}

/// User read()s from the console go here.
///
/// Copy (up to) a whole input line to dst, a user virtual address.
/// Returns the number of bytes read, or -1 if the caller was killed
/// while waiting for input.
fn consoleread(mut dst: u64, mut n: i32) -> i32 {
    let target = n;
    let mut cons = CONS.lock();

    while n > 0 {
        // Wait until the interrupt handler has put
        // some input into the buffer.
        while cons.read_index == cons.write_index {
            if Proc::current().unwrap().is_killed() {
                return -1;
            }
            let chan = cons_chan(&cons);
            unsafe { cons.sleep(chan) };
        }

        let c = cons.buf[cons.read_index % INPUT_BUF_SIZE];
        cons.read_index += 1;

        // Copy the input byte to the user-space buffer.
        if unsafe { either_copyout(true, dst, &c, 1) }.is_err() {
            break;
        }

        dst += 1;
        n -= 1;

        if c == b'\n' {
            // A whole line has arrived; return to
            // the user-level read().
            break;
        }
    }

    target - n
}

/// The console input interrupt handler.
///
/// uartintr() calls this for input characters. Do erase processing,
/// append to the buffer, and wake up consoleread() if a whole line
/// has arrived.
pub fn consoleintr(c: u8) {
    let mut cons = CONS.lock();

    match c {
        _ if c == ctrl(b'P') => {
            // Print process list.
            unsafe { procdump() };
        }
        0x7f => {
            // Backspace/delete key.
            if cons.edit_index != cons.write_index {
                cons.edit_index -= 1;
                consputc(BACKSPACE);
            }
        }
        _ => {
            if c != 0 && cons.edit_index - cons.read_index < INPUT_BUF_SIZE {
                let c = if c == b'\r' { b'\n' } else { c };

                // Echo back to the user.
                consputc(c as i32);

                // Store for consumption by consoleread().
                let i = cons.edit_index % INPUT_BUF_SIZE;
                cons.buf[i] = c;
                cons.edit_index += 1;

                if c == b'\n' || cons.edit_index - cons.read_index == INPUT_BUF_SIZE {
                    // A whole line (or the whole buffer) has arrived;
                    // wake up consoleread().
                    cons.write_index = cons.edit_index;
                    unsafe { wakeup(cons_chan(&cons)) };
                }
            }
        }
    }
}

pub unsafe fn consoleinit() {
    uart::uartinit();

    // Connect read and write system calls
    // to consoleread and consolewrite.
    DEVSW[CONSOLE].read = Some(consoleread);
    DEVSW[CONSOLE].write = Some(consolewrite);
}
