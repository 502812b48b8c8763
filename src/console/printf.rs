//! Formatted console output, and the kernel's `log` backend.

use crate::{console::consputc, sync::spinlock::Spinlock};
use core::{
    fmt::{self, Write},
    sync::atomic::{AtomicBool, Ordering},
};

/// Set on panic; freezes UART output from all CPUs.
pub static PANICKED: AtomicBool = AtomicBool::new(false);

/// Lock to avoid interleaving concurrent printf's. panic() clears
/// `locking` so its own output can never deadlock on the lock.
pub static PR: Printer = Printer {
    lock: Spinlock::new(),
    locking: AtomicBool::new(true),
};

pub struct Printer {
    lock: Spinlock,
    pub locking: AtomicBool,
}

struct ConsoleWriter;

impl Write for ConsoleWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for b in s.bytes() {
            consputc(b as i32);
        }
        Ok(())
    }
}

#[doc(hidden)]
pub fn print_args(args: fmt::Arguments<'_>) {
    let locking = PR.locking.load(Ordering::Relaxed);
    if locking {
        unsafe { PR.lock.acquire() };
    }

    let _ = ConsoleWriter.write_fmt(args);

    if locking {
        unsafe { PR.lock.release() };
    }
}

/// Print formatted text to the console.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::console::printf::print_args(core::format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => {{
        $crate::print!($($arg)*);
        $crate::print!("\n");
    }};
}

/// The `log` facade backend: every `log::info!`/`warn!`/... in the
/// kernel lands on the console through the printf lock.
struct KernelLog;

static LOGGER: KernelLog = KernelLog;

impl log::Log for KernelLog {
    fn enabled(&self, _metadata: &log::Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &log::Record<'_>) {
        if self.enabled(record.metadata()) {
            crate::println!("[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

pub fn printfinit() {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(log::LevelFilter::Info);
}
