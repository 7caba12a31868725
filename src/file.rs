//! Open files and the system-wide file table.
//!
//! A `File` is a pipe end, an inode-backed file with an offset, or a
//! device. Handles (`RcFile`) are reference counted slots of a fixed
//! table; the table lock covers only the counts — the file body is
//! written when a slot goes from free to used and read-only after
//! that, except the inode offset, which is accessed under the file's
//! inode sleep lock.

use core::cell::UnsafeCell;
use std::sync::Arc;

use array_macro::array;

use crate::addr::UVAddr;
use crate::console::CONSOLE_MAJOR;
use crate::errno::KernelError;
use crate::fs::{RcInode, Stat};
use crate::kernel::{Kernel, KernelCtx};
use crate::lock::Spinlock;
use crate::param::{BSIZE, MAXOPBLOCKS, NDEV, NFILE};
use crate::pipe::Pipe;

/// Map of major device number to device operations.
#[derive(Clone, Copy)]
pub struct Devsw {
    pub read: fn(&KernelCtx, UVAddr, usize) -> Result<usize, KernelError>,
    pub write: fn(&KernelCtx, UVAddr, usize) -> Result<usize, KernelError>,
}

pub enum FileType {
    None,
    Pipe {
        pipe: Arc<Pipe>,
    },
    Inode {
        ip: RcInode,
        /// Byte offset of the next transfer; accessed only while the
        /// inode's sleep lock is held.
        off: UnsafeCell<u32>,
    },
    Device {
        ip: RcInode,
        major: u16,
    },
}

pub struct File {
    pub typ: FileType,
    readable: bool,
    writable: bool,
}

// SAFETY: `off` is only touched under the file's inode sleep lock; the
// other fields are immutable while the slot is referenced.
unsafe impl Send for File {}
unsafe impl Sync for File {}

impl File {
    pub const fn new(typ: FileType, readable: bool, writable: bool) -> Self {
        Self {
            typ,
            readable,
            writable,
        }
    }

    const fn none() -> Self {
        Self::new(FileType::None, false, false)
    }

    /// Read from the file into user memory at `addr`.
    pub fn read(&self, ctx: &KernelCtx, addr: UVAddr, n: usize) -> Result<usize, KernelError> {
        if !self.readable {
            return Err(KernelError::BadFd);
        }
        match &self.typ {
            FileType::Pipe { pipe } => pipe.read(ctx, addr, n),
            FileType::Inode { ip, off } => {
                let mut guard = ip.lock(ctx);
                // SAFETY: the inode lock is held.
                let cur = unsafe { *off.get() };
                match guard.read_user(ctx, addr, cur, n as u32) {
                    Ok(count) => {
                        // SAFETY: as above.
                        unsafe { *off.get() = cur + count as u32 };
                        guard.free(ctx);
                        Ok(count)
                    }
                    Err(e) => {
                        guard.free(ctx);
                        Err(e)
                    }
                }
            }
            FileType::Device { major, .. } => {
                let dev = devsw(*major).ok_or(KernelError::NoDevice)?;
                (dev.read)(ctx, addr, n)
            }
            FileType::None => panic!("File::read"),
        }
    }

    /// Write user memory at `addr` to the file. Inode writes are
    /// chunked so a single transaction never exceeds the log's cap:
    /// i-node, indirect blocks, allocation blocks, and two blocks of
    /// slop for non-aligned writes.
    pub fn write(&self, ctx: &KernelCtx, addr: UVAddr, n: usize) -> Result<usize, KernelError> {
        if !self.writable {
            return Err(KernelError::BadFd);
        }
        match &self.typ {
            FileType::Pipe { pipe } => pipe.write(ctx, addr, n),
            FileType::Inode { ip, off } => {
                let max = (MAXOPBLOCKS - 1 - 1 - 2) / 2 * BSIZE;
                let mut done = 0;
                while done < n {
                    let chunk = usize::min(n - done, max);
                    let tx = ctx.kernel().fs.begin_tx(ctx);
                    let mut guard = ip.lock(ctx);
                    // SAFETY: the inode lock is held.
                    let cur = unsafe { *off.get() };
                    let wrote =
                        guard.write_user(ctx, addr + done, cur, chunk as u32, &tx);
                    match wrote {
                        Ok(count) => {
                            // SAFETY: as above.
                            unsafe { *off.get() = cur + count as u32 };
                            guard.free(ctx);
                            tx.end(ctx);
                            if count < chunk {
                                return Err(KernelError::NoSpace);
                            }
                            done += count;
                        }
                        Err(e) => {
                            guard.free(ctx);
                            tx.end(ctx);
                            return Err(e);
                        }
                    }
                }
                Ok(done)
            }
            FileType::Device { major, .. } => {
                let dev = devsw(*major).ok_or(KernelError::NoDevice)?;
                (dev.write)(ctx, addr, n)
            }
            FileType::None => panic!("File::write"),
        }
    }

    /// Copy the file's metadata to user memory at `addr`.
    pub fn stat(&self, ctx: &KernelCtx, addr: UVAddr) -> Result<usize, KernelError> {
        match &self.typ {
            FileType::Inode { ip, .. } | FileType::Device { ip, .. } => {
                let guard = ip.lock(ctx);
                let st: Stat = guard.stat();
                guard.free(ctx);
                ctx.data_mut()
                    .memory
                    .as_mut()
                    .expect("fstat: no memory")
                    .copy_out(addr, zerocopy::AsBytes::as_bytes(&st))
                    .map_err(|_| KernelError::Invalid)?;
                Ok(0)
            }
            _ => Err(KernelError::BadFd),
        }
    }
}

/// Device dispatch table. Fixed at boot; the console is major 1.
fn devsw(major: u16) -> Option<Devsw> {
    if major as usize >= NDEV {
        return None;
    }
    match major {
        CONSOLE_MAJOR => Some(Devsw {
            read: console_read,
            write: console_write,
        }),
        _ => None,
    }
}

fn console_read(ctx: &KernelCtx, addr: UVAddr, n: usize) -> Result<usize, KernelError> {
    ctx.kernel().console.read(ctx, addr, n)
}

fn console_write(ctx: &KernelCtx, addr: UVAddr, n: usize) -> Result<usize, KernelError> {
    ctx.kernel().console.write(ctx, addr, n)
}

/// The system-wide table of open files.
pub struct FTable {
    /// Reference count per slot; zero means free.
    ctl: Spinlock<[u32; NFILE]>,
    files: [UnsafeCell<File>; NFILE],
}

// SAFETY: slot contents are written only on the free -> used edge and
// cleared on the last close, both while the holder is exclusive.
unsafe impl Sync for FTable {}

impl FTable {
    pub fn new() -> Self {
        Self {
            ctl: Spinlock::new("ftable", [0; NFILE]),
            files: array![_ => UnsafeCell::new(File::none()); NFILE],
        }
    }

    /// Claim a slot for `file`. Returns the file back if the table is
    /// full.
    pub fn alloc(&self, file: File) -> Result<RcFile, File> {
        let mut ctl = self.ctl.lock();
        for idx in 0..NFILE {
            if ctl[idx] == 0 {
                ctl[idx] = 1;
                // SAFETY: the slot was free and we hold the table lock;
                // nobody else can observe it yet.
                unsafe { *self.files[idx].get() = file };
                return Ok(RcFile { idx });
            }
        }
        Err(file)
    }

    /// Replace the body of a freshly allocated, still-private file.
    pub(crate) fn set(&self, rc: &RcFile, file: File) {
        let ctl = self.ctl.lock();
        assert_eq!(ctl[rc.idx], 1, "FTable::set: shared file");
        // SAFETY: single reference, held by the caller; nothing else
        // has seen the slot.
        unsafe { *self.files[rc.idx].get() = file };
    }
}

impl Default for FTable {
    fn default() -> Self {
        Self::new()
    }
}

/// A handle on one open-file slot. Must be released with `close`;
/// silently dropping one is a bug.
pub struct RcFile {
    idx: usize,
}

impl RcFile {
    /// Shared view of the file body. Valid for as long as the caller
    /// holds any reference to the slot.
    pub fn file(&self, kernel: &'static Kernel) -> &'static File {
        // SAFETY: refcnt >= 1 while the handle lives, and the body is
        // not rewritten while referenced.
        unsafe { &*kernel.ftable.files[self.idx].get() }
    }

    /// Take another reference to the same open file.
    pub fn dup(&self, kernel: &Kernel) -> RcFile {
        let mut ctl = kernel.ftable.ctl.lock();
        assert!(ctl[self.idx] >= 1, "filedup");
        ctl[self.idx] += 1;
        RcFile { idx: self.idx }
    }

    /// Drop this reference; the last one disposes of the underlying
    /// object (and may free an unlinked inode, hence the transaction).
    pub fn close(self, ctx: &KernelCtx) {
        let kernel = ctx.kernel();
        let taken = {
            let mut ctl = kernel.ftable.ctl.lock();
            assert!(ctl[self.idx] >= 1, "fileclose");
            ctl[self.idx] -= 1;
            if ctl[self.idx] > 0 {
                None
            } else {
                // SAFETY: count just hit zero and we hold the table
                // lock; no other reference exists.
                Some(unsafe { core::mem::replace(&mut *kernel.ftable.files[self.idx].get(), File::none()) })
            }
        };
        core::mem::forget(self);
        let Some(file) = taken else { return };
        match file.typ {
            FileType::None => (),
            FileType::Pipe { pipe } => pipe.close(kernel, file.writable),
            FileType::Inode { ip, .. } | FileType::Device { ip, .. } => {
                let tx = kernel.fs.begin_tx(ctx);
                ip.put(&tx, ctx);
                tx.end(ctx);
            }
        }
    }
}

impl Drop for RcFile {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            panic!("RcFile must be released with close()");
        }
    }
}

const _: () = assert!((CONSOLE_MAJOR as usize) < NDEV);
