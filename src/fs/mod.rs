//! The log-backed inode file system.
//!
//! Layered bottom to top: free-block allocation over the on-disk
//! bitmap, the write-ahead log, inodes with a multi-level block map,
//! directories, and path resolution. Every mutation happens inside a
//! `begin_tx`/`end` bracket so a crash either shows the whole
//! operation or none of it.

mod inode;
mod log;
mod path;
mod stat;
mod superblock;

pub use inode::{
    block_path, ireclaim, BlockPath, Dinode, Dirent, Inode, InodeGuard, InodeInner, InodeType,
    Itable, RcInode, DIRENT_SIZE, DIRSIZ, IPB, MAXFILE, NDIRECT, NINDIRECT, NINDIRECT2, NINDIRECT3,
};
pub use log::Log;
pub use path::{namei, namei_nofollow, nameiparent, FileName};
pub use stat::Stat;
pub use superblock::{Superblock, BPB, FSMAGIC, ROOTINO};

use crate::kernel::{Kernel, KernelCtx};
use crate::lock::{Sleepablelock, Spinlock};

pub struct FileSystem {
    sb: Spinlock<Option<Superblock>>,
    pub log: Sleepablelock<Log>,
    pub itable: Itable,
}

impl FileSystem {
    pub fn new() -> Self {
        Self {
            sb: Spinlock::new("fs", None),
            log: Sleepablelock::new("log", Log::empty()),
            itable: Itable::new(),
        }
    }

    /// The superblock, available once the file system is mounted.
    pub fn superblock(&self) -> Superblock {
        self.sb.lock().expect("fs: not mounted")
    }

    /// Open a transaction bracket around a set of mutations.
    pub fn begin_tx<'s>(&'s self, ctx: &KernelCtx) -> FsTransaction<'s> {
        self.log.begin_op(ctx);
        FsTransaction {
            fs: self,
            ended: false,
        }
    }
}

impl Default for FileSystem {
    fn default() -> Self {
        Self::new()
    }
}

/// Mount the file system: read and check the superblock, replay the
/// log, and reclaim orphaned inodes. Runs in the first process's
/// context because recovery does buffered I/O.
pub fn fs_init(kernel: &'static Kernel, dev: u32, ctx: &KernelCtx) {
    let buf = kernel.bcache.get(dev, 1, ctx);
    let sb = Superblock::from_buf(&buf);
    buf.free(ctx);
    if sb.magic != FSMAGIC {
        panic!("invalid file system");
    }
    *kernel.fs.sb.lock() = Some(sb);

    {
        let mut log = kernel.fs.log.lock();
        let (start, size) = (sb.logstart, sb.nlog);
        log.reacquire_after(|| {
            // SAFETY: nothing else can use the log before the mount
            // finishes; the lock is released only for the disk I/O.
            let log = unsafe { &mut *kernel.fs.log.get_mut_raw() };
            log.setup(dev, start, size, ctx);
        });
    }

    ireclaim(kernel, dev, ctx);
}

/// An open transaction. Dropping one without `end` is a bug.
pub struct FsTransaction<'s> {
    fs: &'s FileSystem,
    ended: bool,
}

impl FsTransaction<'_> {
    /// Close the bracket; the last closer commits.
    pub fn end(mut self, ctx: &KernelCtx) {
        self.ended = true;
        self.fs.log.end_op(ctx);
    }

    /// Route a modified buffer through the log.
    pub fn write(&self, buf: crate::bio::Buf, ctx: &KernelCtx) {
        self.fs.log.write(buf, ctx);
    }

    /// Zero a disk block.
    fn bzero(&self, dev: u32, bno: u32, ctx: &KernelCtx) {
        let mut buf = ctx.kernel().bcache.get(dev, bno, ctx);
        buf.data_mut().fill(0);
        self.write(buf, ctx);
    }

    /// Allocate a zeroed disk block, or 0 if out of space.
    pub fn balloc(&self, dev: u32, ctx: &KernelCtx) -> Option<u32> {
        let sb = self.fs.superblock();
        let mut base = 0;
        while base < sb.size {
            let mut buf = ctx.kernel().bcache.get(dev, sb.bblock(base), ctx);
            let mut found = None;
            for bit in 0..BPB {
                if base + bit >= sb.size {
                    break;
                }
                let mask = 1u8 << (bit % 8);
                let byte = (bit / 8) as usize;
                if buf.data()[byte] & mask == 0 {
                    // Mark block in use.
                    buf.data_mut()[byte] |= mask;
                    found = Some(base + bit);
                    break;
                }
            }
            match found {
                Some(bno) => {
                    self.write(buf, ctx);
                    self.bzero(dev, bno, ctx);
                    return Some(bno);
                }
                None => buf.free(ctx),
            }
            base += BPB;
        }
        crate::kprintln!(ctx.kernel(), "balloc: out of blocks");
        None
    }

    /// Free a disk block. Freeing a free block is fatal.
    pub fn bfree(&self, dev: u32, bno: u32, ctx: &KernelCtx) {
        let sb = self.fs.superblock();
        let mut buf = ctx.kernel().bcache.get(dev, sb.bblock(bno), ctx);
        let bit = bno % BPB;
        let mask = 1u8 << (bit % 8);
        let byte = (bit / 8) as usize;
        if buf.data()[byte] & mask == 0 {
            panic!("freeing free block");
        }
        buf.data_mut()[byte] &= !mask;
        self.write(buf, ctx);
    }
}

impl Drop for FsTransaction<'_> {
    fn drop(&mut self) {
        if !self.ended && !std::thread::panicking() {
            panic!("transaction dropped without end()");
        }
    }
}
