//! Driver for the 16550a UART qemu's virt machine emulates.
//!
//! Output is interrupt-driven through a small ring buffer: `putc`
//! sleeps when the ring is full and the transmit interrupt drains it.
//! `putc_sync` bypasses the ring for printf and echoes, spinning on
//! the transmit-ready bit instead, so it works before processes exist
//! and while panicking.

use core::{num::Wrapping, ptr, sync::atomic::Ordering};

use crate::{
    console,
    cpu::CPU_TABLE,
    param::UART0,
    proc::Event,
    process::PROCESS_TABLE,
    spinlock::SpinLock,
    PANICKED,
};

const RHR: usize = 0; // receive holding register
const THR: usize = 0; // transmit holding register
const IER: usize = 1; // interrupt enable register
const FCR: usize = 2; // FIFO control register
const LCR: usize = 3; // line control register
const LSR: usize = 5; // line status register

const LSR_RX_READY: u8 = 1 << 0;
const LSR_TX_IDLE: u8 = 1 << 5;

pub fn init() {
    unsafe {
        // disable interrupts.
        ptr::write_volatile((UART0 + IER) as *mut u8, 0x00);
        // set baud rate: special mode, then the divisor LSB/MSB.
        ptr::write_volatile((UART0 + LCR) as *mut u8, 0x80);
        ptr::write_volatile((UART0 + 0) as *mut u8, 0x03);
        ptr::write_volatile((UART0 + 1) as *mut u8, 0x00);
        // leave set-baud mode, 8 data bits.
        ptr::write_volatile((UART0 + LCR) as *mut u8, 0x03);
        // reset and enable FIFOs.
        ptr::write_volatile((UART0 + FCR) as *mut u8, 0x07);
        // enable transmit and receive interrupts.
        ptr::write_volatile((UART0 + IER) as *mut u8, 0x03);
    }
}

/// Blocking output that doesn't use interrupts: for kernel printf
/// and input echoing. Spins until the transmit register is empty.
pub fn putc_sync(c: u8) {
    if PANICKED.load(Ordering::Relaxed) {
        loop {}
    }

    unsafe {
        while ptr::read_volatile((UART0 + LSR) as *const u8) & LSR_TX_IDLE == 0 {}
        ptr::write_volatile((UART0 + THR) as *mut u8, c);
    }
}

/// The UART interrupt handler, called from the trap core for both
/// incoming bytes and transmit-complete.
pub fn intr() {
    loop {
        if unsafe { ptr::read_volatile((UART0 + LSR) as *const u8) } & LSR_RX_READY == 0 {
            break;
        }
        let c = unsafe { ptr::read_volatile((UART0 + RHR) as *const u8) };
        console::intr(c);
    }

    let mut uart_tx = UART_TX.lock();
    uart_tx.start();
    drop(uart_tx);
}

const UART_TX_BUF_SIZE: usize = 32;

pub struct UartTx {
    w: usize, // next slot putc writes
    r: usize, // next slot start transmits
    buf: [u8; UART_TX_BUF_SIZE],
}

pub static UART_TX: SpinLock<UartTx> = SpinLock::new(
    UartTx {
        w: 0,
        r: 0,
        buf: [0; UART_TX_BUF_SIZE],
    },
    "uart",
);

impl UartTx {
    /// Push buffered bytes into the device while it will take them.
    /// Called with the lock held, from putc and from the interrupt.
    fn start(&mut self) {
        loop {
            if self.w == self.r {
                // transmit buffer is empty.
                return;
            }

            if unsafe { ptr::read_volatile((UART0 + LSR) as *const u8) } & LSR_TX_IDLE == 0 {
                // the holding register is full; the UART will
                // interrupt when it wants another byte.
                return;
            }

            let c = self.buf[self.r % UART_TX_BUF_SIZE];
            self.r += 1;

            // a putc may be waiting for space in the buffer.
            unsafe { PROCESS_TABLE.wakeup(Event::UartTx) };

            unsafe { ptr::write_volatile((UART0 + THR) as *mut u8, c) };
        }
    }
}

impl SpinLock<UartTx> {
    /// Buffered output for the console device file; sleeps until the
    /// interrupt handler opens up ring space.
    pub fn putc(&self, c: u8) {
        let mut guard = self.lock();

        if PANICKED.load(Ordering::Relaxed) {
            loop {}
        }

        loop {
            if guard.w == (Wrapping(guard.r) + Wrapping(UART_TX_BUF_SIZE)).0 {
                // buffer is full; wait for start() to drain it.
                let p = unsafe { CPU_TABLE.my_proc() };
                guard = p.sleep(Event::UartTx, guard);
            } else {
                let w = guard.w;
                guard.buf[w % UART_TX_BUF_SIZE] = c;
                guard.w += 1;
                guard.start();
                drop(guard);
                return;
            }
        }
    }
}
