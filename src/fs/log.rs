//! Simple logging that allows concurrent FS system calls.
//!
//! A log transaction contains the updates of multiple FS system
//! calls. The logging system only commits when there are no FS system
//! calls active, so there is never any reasoning required about
//! whether a commit might write an uncommitted system call's updates
//! to disk.
//!
//! A system call brackets its file-system mutations between
//! `begin_op` and `end_op`. Usually `begin_op` just increments the
//! count of in-progress calls and returns; if it thinks the log is
//! close to running out, it sleeps until the last outstanding `end_op`
//! commits.
//!
//! The log is a physical re-do log of disk blocks. On disk it is a
//! header block holding the block numbers, followed by the blocks
//! themselves; the header write is the commit point.

use core::mem;

use arrayvec::ArrayVec;
use itertools::izip;
use static_assertions::const_assert;

use crate::bio::{Buf, BufUnlocked};
use crate::kernel::KernelCtx;
use crate::lock::Sleepablelock;
use crate::param::{BSIZE, LOGSIZE, MAXOPBLOCKS};

/// Contents of the on-disk header block.
#[repr(C)]
struct LogHeader {
    n: u32,
    block: [u32; LOGSIZE],
}

const_assert!(mem::size_of::<LogHeader>() <= BSIZE);

pub struct Log {
    dev: u32,
    start: u32,
    size: u32,

    /// How many FS sys calls are executing?
    outstanding: i32,

    /// In commit(); please wait.
    committing: bool,

    /// Blocks pinned in the cache until commit, in log order.
    bufs: ArrayVec<BufUnlocked, LOGSIZE>,
}

impl Log {
    pub const fn empty() -> Self {
        Self {
            dev: 0,
            start: 0,
            size: 0,
            outstanding: 0,
            committing: false,
            bufs: ArrayVec::new_const(),
        }
    }

    /// Point the log at its on-disk area and replay anything a crash
    /// left committed but not installed.
    pub fn setup(&mut self, dev: u32, start: u32, size: u32, ctx: &KernelCtx) {
        self.dev = dev;
        self.start = start;
        self.size = size;
        self.recover(ctx);
    }

    fn recover(&mut self, ctx: &KernelCtx) {
        self.read_head(ctx);
        self.install_trans(ctx);
        self.write_head(ctx);
    }

    /// Read the log header from disk, pinning the named blocks.
    fn read_head(&mut self, ctx: &KernelCtx) {
        let buf = ctx.kernel().bcache.get(self.dev, self.start, ctx);
        // SAFETY: buffer data is 8-aligned and LogHeader is plain
        // words inside the block.
        let (n, blocks) = unsafe {
            let head = &*(buf.data().as_ptr() as *const LogHeader);
            (head.n, head.block)
        };
        buf.free(ctx);

        for blockno in &blocks[..n as usize] {
            let pinned = ctx.kernel().bcache.get(self.dev, *blockno, ctx).unlock(ctx);
            self.bufs.push(pinned);
        }
    }

    /// Write the in-memory header to disk. This is the true point at
    /// which the current transaction commits.
    fn write_head(&mut self, ctx: &KernelCtx) {
        let mut buf = ctx.kernel().bcache.get(self.dev, self.start, ctx);
        {
            let data = buf.data_mut();
            // SAFETY: as in read_head, and the buffer lock is held.
            let head = unsafe { &mut *(data.as_mut_ptr() as *mut LogHeader) };
            head.n = self.bufs.len() as u32;
            for (slot, pinned) in izip!(&mut head.block, &self.bufs) {
                *slot = pinned.blockno;
            }
        }
        buf.write_through(ctx);
        buf.free(ctx);
    }

    /// Copy modified blocks from the cache into the log area.
    fn write_log(&mut self, ctx: &KernelCtx) {
        for (tail, pinned) in self.bufs.iter().enumerate() {
            let from = ctx.kernel().bcache.get(self.dev, pinned.blockno, ctx);
            let mut to = ctx
                .kernel()
                .bcache
                .get(self.dev, self.start + tail as u32 + 1, ctx);
            to.data_mut().copy_from_slice(from.data());
            to.write_through(ctx);
            from.free(ctx);
            to.free(ctx);
        }
    }

    /// Copy committed blocks from the log to their home locations.
    fn install_trans(&mut self, ctx: &KernelCtx) {
        let dev = self.dev;
        let start = self.start;
        for (tail, pinned) in self.bufs.drain(..).enumerate() {
            let log_buf = ctx.kernel().bcache.get(dev, start + tail as u32 + 1, ctx);
            let mut dst = pinned.lock(ctx);
            dst.data_mut().copy_from_slice(log_buf.data());
            dst.write_through(ctx);
            log_buf.free(ctx);
            dst.free(ctx);
        }
    }

    fn commit(&mut self, ctx: &KernelCtx) {
        if !self.bufs.is_empty() {
            self.write_log(ctx);
            // The real commit.
            self.write_head(ctx);
            self.install_trans(ctx);
            // Erase the transaction from the log.
            self.write_head(ctx);
        }
    }

    /// Record that `buf` belongs to the running transaction and keep
    /// it pinned in the cache until commit. Replaces a direct write.
    fn append(&mut self, buf: Buf, ctx: &KernelCtx) {
        assert!(
            self.bufs.len() < LOGSIZE && (self.bufs.len() as u32) < self.size - 1,
            "too big a transaction"
        );
        assert!(self.outstanding >= 1, "log write outside of trans");

        // Absorption: a block already in the transaction stays where
        // it is.
        if self.bufs.iter().all(|pinned| pinned.blockno != buf.blockno) {
            self.bufs.push(buf.unlock(ctx));
        } else {
            buf.free(ctx);
        }
    }
}

impl Sleepablelock<Log> {
    /// Called at the start of each FS system call.
    pub fn begin_op(&self, ctx: &KernelCtx) {
        let mut guard = self.lock();
        loop {
            if guard.committing
                || guard.bufs.len() as i32 + (guard.outstanding + 1) * MAXOPBLOCKS as i32
                    > LOGSIZE as i32
            {
                // This op might exhaust log space; wait for commit.
                guard.sleep(ctx);
            } else {
                guard.outstanding += 1;
                break;
            }
        }
    }

    /// Called at the end of each FS system call; commits if this was
    /// the last outstanding operation.
    pub fn end_op(&self, ctx: &KernelCtx) {
        let mut guard = self.lock();
        guard.outstanding -= 1;
        assert!(!guard.committing, "end_op: committing");

        if guard.outstanding == 0 {
            // No transaction can be running, and none can start while
            // committing is set.
            guard.committing = true;
            guard.reacquire_after(|| {
                // SAFETY: committing excludes every other log writer,
                // so the unlocked access cannot race.
                let log = unsafe { &mut *self.get_mut_raw() };
                log.commit(ctx);
            });
            guard.committing = false;
        }

        // Waiters may have been blocked on log space or on the commit.
        guard.wakeup(ctx.kernel());
    }

    /// `log_write`: route a transaction's block through the log.
    pub fn write(&self, buf: Buf, ctx: &KernelCtx) {
        let mut guard = self.lock();
        guard.append(buf, ctx);
    }
}
