//! Console input and output, and the kernel printer.
//!
//! The console is the device file with major number 1. Writes stream
//! bytes to the UART; reads return cooked input, line by line, with
//! backspace, kill-line and end-of-file editing. Input arrives through
//! `intr`, the UART receive interrupt of this machine.

use crate::addr::UVAddr;
use crate::errno::KernelError;
use crate::kernel::{Kernel, KernelCtx};
use crate::lock::Sleepablelock;

/// Major device number of the console.
pub const CONSOLE_MAJOR: u16 = 1;

const INPUT_BUF: usize = 128;

const CTRL_D: u8 = 0x04;
const CTRL_P: u8 = 0x10;
const CTRL_U: u8 = 0x15;
const BACKSPACE: u8 = 0x7f;

struct Cons {
    buf: [u8; INPUT_BUF],
    /// Read index.
    r: usize,
    /// Write index (consumed by readers up to here).
    w: usize,
    /// Edit index (input being typed).
    e: usize,
}

pub struct Console {
    inner: Sleepablelock<Cons>,
}

impl Console {
    pub fn new() -> Self {
        Self {
            inner: Sleepablelock::new(
                "cons",
                Cons {
                    buf: [0; INPUT_BUF],
                    r: 0,
                    w: 0,
                    e: 0,
                },
            ),
        }
    }

    /// User write to the console: copy from user memory, send to the
    /// UART. Returns the number of bytes written.
    pub fn write(&self, ctx: &KernelCtx, src: UVAddr, n: usize) -> Result<usize, KernelError> {
        let mut written = 0;
        let mut chunk = [0u8; 64];
        while written < n {
            let m = usize::min(chunk.len(), n - written);
            let copied = ctx
                .data_mut()
                .memory
                .as_mut()
                .expect("console write: no memory")
                .copy_in(&mut chunk[..m], src + written);
            if copied.is_err() {
                break;
            }
            for &b in &chunk[..m] {
                ctx.kernel().hal.uart.putc(b);
            }
            written += m;
        }
        Ok(written)
    }

    /// User read from the console; blocks until a whole line has
    /// arrived.
    pub fn read(&self, ctx: &KernelCtx, dst: UVAddr, n: usize) -> Result<usize, KernelError> {
        let mut cons = self.inner.lock();
        let mut copied = 0;
        while copied < n {
            // Wait until interrupt handler has put some input into
            // cons.buffer.
            while cons.r == cons.w {
                if ctx.proc().killed() {
                    return Err(KernelError::Invalid);
                }
                cons.sleep(ctx);
            }
            let c = cons.buf[cons.r % INPUT_BUF];
            cons.r += 1;

            if c == CTRL_D {
                if copied > 0 {
                    // Save ^D for next time, to make sure the caller
                    // gets a 0-byte result.
                    cons.r -= 1;
                }
                break;
            }

            let copy = cons.reacquire_after(|| {
                ctx.data_mut()
                    .memory
                    .as_mut()
                    .expect("console read: no memory")
                    .copy_out(dst + copied, &[c])
            });
            if copy.is_err() {
                break;
            }
            copied += 1;
            if c == b'\n' {
                // A whole line has arrived; return it.
                break;
            }
        }
        Ok(copied)
    }

    /// Console input interrupt handler: accumulate a line, echoing as
    /// we go, and wake readers when one is ready.
    pub(crate) fn intr(&self, kernel: &Kernel, c: u8) {
        let mut cons = self.inner.lock();
        match c {
            CTRL_P => {
                drop(cons);
                crate::proc::procdump(kernel);
                return;
            }
            CTRL_U => {
                while cons.e != cons.w && cons.buf[(cons.e - 1) % INPUT_BUF] != b'\n' {
                    cons.e -= 1;
                    echo_erase(kernel);
                }
            }
            BACKSPACE | 0x08 => {
                if cons.e != cons.w {
                    cons.e -= 1;
                    echo_erase(kernel);
                }
            }
            _ => {
                if cons.e - cons.r < INPUT_BUF {
                    let c = if c == b'\r' { b'\n' } else { c };
                    kernel.hal.uart.putc(c);
                    let e = cons.e;
                    cons.buf[e % INPUT_BUF] = c;
                    cons.e += 1;
                    if c == b'\n' || c == CTRL_D || cons.e - cons.r == INPUT_BUF {
                        cons.w = cons.e;
                        cons.wakeup(kernel);
                    }
                }
            }
        }
    }
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

fn echo_erase(kernel: &Kernel) {
    kernel.hal.uart.putc(0x08);
    kernel.hal.uart.putc(b' ');
    kernel.hal.uart.putc(0x08);
}

/// Deliver one byte of console input, as the UART interrupt would.
pub fn intr(kernel: &Kernel, c: u8) {
    kernel.console.intr(kernel, c);
}

/// Kernel console output, serialized by the printer lock.
pub fn kernel_print(kernel: &Kernel, args: core::fmt::Arguments<'_>) {
    let _guard = kernel.printer.lock();
    kernel.hal.uart.put_str(&args.to_string());
}

#[macro_export]
macro_rules! kprint {
    ($kernel:expr, $($arg:tt)*) => {
        $crate::console::kernel_print(&*$kernel, ::core::format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! kprintln {
    ($kernel:expr) => {
        $crate::kprint!($kernel, "\n")
    };
    ($kernel:expr, $($arg:tt)*) => {
        $crate::console::kernel_print(
            &*$kernel,
            ::core::format_args!("{}\n", ::core::format_args!($($arg)*)),
        )
    };
}
