//! Driver for the 16550a UART.

use crate::{
    console::consoleintr,
    console::printf::PANICKED,
    param::UART_TX_BUF_SIZE,
    riscv::memlayout::UART0,
    sync::spinlock::{pop_off, push_off, SpinMutex, SpinMutexGuard},
};
use core::sync::atomic::Ordering;

// The UART control registers, memory-mapped at address UART0.
const RECEIVE_HOLDING_REG: u64 = 0;
const TRANSMIT_HOLDING_REG: u64 = 0;
const INT_ENABLE_REG: u64 = 1;
const RX_ENABLE: u8 = 1 << 0;
const TX_ENABLE: u8 = 1 << 1;
const FIFO_CTRL_REG: u64 = 2;
const FIFO_ENABLE: u8 = 1 << 0;
const FIFO_CLEAR: u8 = 3 << 1;
const LINE_CONTROL_REG: u64 = 3;
const EIGHT_BITS: u8 = 3 << 0;
const BAUD_LATCH: u8 = 1 << 7;
const LINE_STATUS_REG: u64 = 5;
const RX_READY: u8 = 1 << 0;
const TX_IDLE: u8 = 1 << 5;
const DISABLE_INTERRUPTS: u8 = 0x00;

unsafe fn read_reg(reg: u64) -> u8 {
    ((UART0 + reg) as *const u8).read_volatile()
}

unsafe fn write_reg(reg: u64, v: u8) {
    ((UART0 + reg) as *mut u8).write_volatile(v);
}

/// The transmit ring buffer.
struct UartTx {
    buf: [u8; UART_TX_BUF_SIZE],
    /// Next write to buf
    write_index: u64,
    /// Next read from buf
    read_index: u64,
}

static TX: SpinMutex<UartTx> = SpinMutex::new(UartTx {
    buf: [0; UART_TX_BUF_SIZE],
    write_index: 0,
    read_index: 0,
});

fn tx_chan(tx: &SpinMutexGuard<'_, UartTx>) -> usize {
    &tx.read_index as *const u64 as usize
}

pub unsafe fn uartinit() {
    write_reg(INT_ENABLE_REG, DISABLE_INTERRUPTS);

    // Set baud rate to 38.4K.
    write_reg(LINE_CONTROL_REG, BAUD_LATCH);
    write_reg(0, 0x03);
    write_reg(1, 0x00);

    // Leave set-baud mode and set word length to 8 bits, no parity.
    write_reg(LINE_CONTROL_REG, EIGHT_BITS);

    // Reset and enable FIFOs.
    write_reg(FIFO_CTRL_REG, FIFO_ENABLE | FIFO_CLEAR);

    // Enable transmit and receive interrupts.
    write_reg(INT_ENABLE_REG, TX_ENABLE | RX_ENABLE);
}

/// Add a character to the output ring and start sending.
///
/// Blocks if the ring is full. Because it may block, it can't be
/// called from interrupts; it's only suitable for use by write().
pub unsafe fn uartputc(c: u8) {
    let mut tx = TX.lock();

    if PANICKED.load(Ordering::Relaxed) {
        loop {}
    }

    while tx.write_index == tx.read_index + UART_TX_BUF_SIZE as u64 {
        // Buffer is full; wait for uartstart() to open up space.
        let chan = tx_chan(&tx);
        tx.sleep(chan);
    }

    let i = (tx.write_index % UART_TX_BUF_SIZE as u64) as usize;
    tx.buf[i] = c;
    tx.write_index += 1;
    uartstart(&mut tx);
}

/// Write a character to the UART without using interrupts.
///
/// For kernel printf() and echoing; spins until the UART is ready.
pub unsafe fn uartputc_sync(c: u8) {
    push_off();

    if PANICKED.load(Ordering::Relaxed) {
        loop {}
    }

    // Wait for Transmit Holding Empty.
    while read_reg(LINE_STATUS_REG) & TX_IDLE == 0 {}

    write_reg(TRANSMIT_HOLDING_REG, c);

    pop_off();
}

/// If the UART is idle and a character is waiting in the ring, send
/// it. Caller must hold the TX lock.
unsafe fn uartstart(tx: &mut SpinMutexGuard<'_, UartTx>) {
    while tx.write_index != tx.read_index && read_reg(LINE_STATUS_REG) & TX_IDLE != 0 {
        // Maybe uartputc() is waiting for space in the buffer.
        crate::proc::scheduler::wakeup(tx_chan(tx));

        let i = (tx.read_index % UART_TX_BUF_SIZE as u64) as usize;
        let c = tx.buf[i];
        tx.read_index += 1;

        write_reg(TRANSMIT_HOLDING_REG, c);
    }
}

/// Read one input character from the UART, if one is waiting.
unsafe fn uartgetc() -> Option<u8> {
    if read_reg(LINE_STATUS_REG) & RX_READY != 0 {
        Some(read_reg(RECEIVE_HOLDING_REG))
    } else {
        None
    }
}

/// Handle a UART interrupt: raised because input has arrived, or the
/// UART is ready for more output, or both. Called from devintr().
pub unsafe fn uartintr() {
    // Read and process incoming characters.
    while let Some(c) = uartgetc() {
        consoleintr(c);
    }

    // Send buffered characters.
    let mut tx = TX.lock();
    uartstart(&mut tx);
}
