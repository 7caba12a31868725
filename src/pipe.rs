//! Pipes.
//!
//! A pipe is a fixed ring buffer with one read end and one write end,
//! each an open file. Readers and writers sleep on separate channels;
//! the byte counters only ever grow, and their difference is the fill.

use std::sync::Arc;

use crate::addr::UVAddr;
use crate::errno::KernelError;
use crate::file::{File, FileType, RcFile};
use crate::kernel::{Kernel, KernelCtx};
use crate::lock::Spinlock;
use crate::proc::WaitChannel;

pub const PIPESIZE: usize = 512;

struct PipeInner {
    data: [u8; PIPESIZE],
    /// Bytes read so far.
    nread: u32,
    /// Bytes written so far.
    nwrite: u32,
    readopen: bool,
    writeopen: bool,
}

pub struct Pipe {
    inner: Spinlock<PipeInner>,
    /// Waiting for data.
    read_wc: WaitChannel,
    /// Waiting for room.
    write_wc: WaitChannel,
}

impl Pipe {
    /// Allocate a pipe and its two file handles (read end, write end).
    pub fn alloc(ctx: &KernelCtx) -> Result<(RcFile, RcFile), KernelError> {
        let kernel = ctx.kernel();
        let pipe = Arc::new(Pipe {
            inner: Spinlock::new(
                "pipe",
                PipeInner {
                    data: [0; PIPESIZE],
                    nread: 0,
                    nwrite: 0,
                    readopen: true,
                    writeopen: true,
                },
            ),
            read_wc: WaitChannel::new(),
            write_wc: WaitChannel::new(),
        });

        let read_end = File::new(FileType::Pipe { pipe: pipe.clone() }, true, false);
        let write_end = File::new(FileType::Pipe { pipe }, false, true);
        let f0 = match kernel.ftable.alloc(read_end) {
            Ok(f) => f,
            Err(_) => return Err(KernelError::TooManyOpen),
        };
        let f1 = match kernel.ftable.alloc(write_end) {
            Ok(f) => f,
            Err(_) => {
                f0.close(ctx);
                return Err(KernelError::TooManyOpen);
            }
        };
        Ok((f0, f1))
    }

    pub fn read(&self, ctx: &KernelCtx, dst: UVAddr, n: usize) -> Result<usize, KernelError> {
        let mut guard = self.inner.lock();
        while guard.nread == guard.nwrite && guard.writeopen {
            if ctx.proc().killed() {
                return Err(KernelError::Invalid);
            }
            self.read_wc.sleep(&mut guard, ctx);
        }
        let mut copied = 0;
        while copied < n && guard.nread != guard.nwrite {
            let byte = guard.data[guard.nread as usize % PIPESIZE];
            let ok = ctx
                .data_mut()
                .memory
                .as_mut()
                .expect("pipe read: no memory")
                .copy_out(dst + copied, &[byte]);
            if ok.is_err() {
                break;
            }
            guard.nread = guard.nread.wrapping_add(1);
            copied += 1;
        }
        self.write_wc.wakeup(ctx.kernel());
        drop(guard);
        Ok(copied)
    }

    pub fn write(&self, ctx: &KernelCtx, src: UVAddr, n: usize) -> Result<usize, KernelError> {
        let mut written = 0;
        let mut guard = self.inner.lock();
        while written < n {
            if !guard.readopen || ctx.proc().killed() {
                return Err(KernelError::Io);
            }
            if guard.nwrite == guard.nread.wrapping_add(PIPESIZE as u32) {
                // Buffer full; let readers drain it.
                self.read_wc.wakeup(ctx.kernel());
                self.write_wc.sleep(&mut guard, ctx);
                continue;
            }
            let mut byte = [0u8; 1];
            let ok = ctx
                .data_mut()
                .memory
                .as_mut()
                .expect("pipe write: no memory")
                .copy_in(&mut byte, src + written);
            if ok.is_err() {
                break;
            }
            let slot = guard.nwrite as usize % PIPESIZE;
            guard.data[slot] = byte[0];
            guard.nwrite = guard.nwrite.wrapping_add(1);
            written += 1;
        }
        self.read_wc.wakeup(ctx.kernel());
        drop(guard);
        Ok(written)
    }

    /// Close one end. The pipe itself goes away when the last file
    /// handle drops its `Arc`.
    pub fn close(&self, kernel: &Kernel, writable: bool) {
        let mut guard = self.inner.lock();
        if writable {
            guard.writeopen = false;
            self.read_wc.wakeup(kernel);
        } else {
            guard.readopen = false;
            self.write_wc.wakeup(kernel);
        }
        drop(guard);
    }
}
