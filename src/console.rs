//! Console input and output. Output goes to the UART; input arrives
//! through the UART interrupt and is cooked one line at a time:
//! erase (backspace), kill line (ctrl-u), end of file (ctrl-d).
//!
//! The console is the device file with major number 1.

use crate::{
    cpu::CPU_TABLE,
    error::{KernelError, Result},
    proc::{either_copy_in, either_copy_out, Event},
    process::PROCESS_TABLE,
    spinlock::SpinLock,
    uart,
};

pub const CONSOLE_MAJOR: u16 = 1;

const INPUT_BUF: usize = 128;

const CTRL_D: u8 = 0x04;
const CTRL_H: u8 = 0x08;
const CTRL_U: u8 = 0x15;
const DEL: u8 = 0x7f;

pub fn init() {
    uart::init();
}

/// Synchronous output for printf; works with interrupts off.
pub fn putc(c: u8) {
    uart::putc_sync(c);
}

static CONS: SpinLock<Console> = SpinLock::new(Console::new(), "cons");

struct Console {
    buf: [u8; INPUT_BUF],
    r: usize, // read index
    w: usize, // write index
    e: usize, // edit index
}

impl Console {
    const fn new() -> Self {
        Self {
            buf: [0; INPUT_BUF],
            r: 0,
            w: 0,
            e: 0,
        }
    }
}

/// echo one byte; erase renders as backspace-space-backspace.
fn echo(c: u8) {
    if c == CTRL_H || c == DEL {
        uart::putc_sync(CTRL_H);
        uart::putc_sync(b' ');
        uart::putc_sync(CTRL_H);
    } else {
        uart::putc_sync(c);
    }
}

/// The console half of the UART receive interrupt: cook the byte into
/// the line buffer and wake readers on a full line.
pub fn intr(c: u8) {
    let mut cons = CONS.lock();

    match c {
        CTRL_U => {
            // kill the uncommitted line.
            while cons.e != cons.w && cons.buf[(cons.e - 1) % INPUT_BUF] != b'\n' {
                cons.e -= 1;
                echo(CTRL_H);
            }
        }
        CTRL_H | DEL => {
            if cons.e != cons.w {
                cons.e -= 1;
                echo(CTRL_H);
            }
        }
        _ => {
            if c != 0 && cons.e - cons.r < INPUT_BUF {
                let c = if c == b'\r' { b'\n' } else { c };
                echo(c);

                let e = cons.e;
                cons.buf[e % INPUT_BUF] = c;
                cons.e += 1;

                if c == b'\n' || c == CTRL_D || cons.e - cons.r == INPUT_BUF {
                    // a whole line (or eof, or a full buffer) is
                    // ready for consumers.
                    cons.w = cons.e;
                    unsafe { PROCESS_TABLE.wakeup(Event::ConsoleInput) };
                }
            }
        }
    }

    drop(cons);
}

/// Read up to n bytes into dst, blocking until a full line arrived.
pub fn read(is_user: bool, mut dst: *mut u8, n: usize) -> Result<usize> {
    let mut left = n;
    let mut cons = CONS.lock();

    while left > 0 {
        // wait for the interrupt handler to commit a line.
        while cons.r == cons.w {
            let p = unsafe { CPU_TABLE.my_proc() };
            if p.is_killed() {
                drop(cons);
                return Err(KernelError::Interrupted);
            }
            cons = p.sleep(Event::ConsoleInput, cons);
        }

        let c = cons.buf[cons.r % INPUT_BUF];
        cons.r += 1;

        if c == CTRL_D {
            if left < n {
                // leave the ctrl-d for the next read, so this one
                // returns the partial line.
                cons.r -= 1;
            }
            break;
        }

        if either_copy_out(is_user, dst, &c as *const u8, 1).is_err() {
            break;
        }
        dst = unsafe { dst.add(1) };
        left -= 1;

        if c == b'\n' {
            break;
        }
    }

    drop(cons);
    Ok(n - left)
}

/// Write n bytes from src through the buffered transmit path.
pub fn write(is_user: bool, mut src: *const u8, n: usize) -> Result<usize> {
    for i in 0..n {
        let mut c = 0u8;
        if either_copy_in(is_user, &mut c as *mut u8, src, 1).is_err() {
            return Ok(i);
        }
        uart::UART_TX.putc(c);
        src = unsafe { src.add(1) };
    }

    Ok(n)
}
