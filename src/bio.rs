//! Buffer cache.
//!
//! A fixed pool of block buffers keyed by `(device, blockno)`. Lookup
//! is hashed; a miss recycles the least recently used buffer with no
//! live references. The cache lock covers the keys, the hash buckets
//! and the recency list; each buffer's contents are protected by its
//! own sleep lock, held across the device read so concurrent consumers
//! of the same block observe at most one load.
//!
//! Interface:
//! * To get a buffer for a particular disk block, call `get`.
//! * After changing buffer data inside a transaction, hand the buffer
//!   to `FsTransaction::write`; `write_through` is the raw path the
//!   log installer uses.
//! * When done with a buffer, call `free`.

use core::mem::{self, ManuallyDrop};

use array_macro::array;
use arrayvec::ArrayVec;

use crate::kernel::KernelCtx;
use crate::lock::{SleepLock, SleepLockGuard, Spinlock};
use crate::param::{BSIZE, NBUF};

/// Hash buckets for `(dev, blockno)` keys.
const NBUCKET: usize = 13;

fn bucket(dev: u32, blockno: u32) -> usize {
    ((dev as usize) ^ (blockno as usize)) % NBUCKET
}

/// Block-sized buffer data. Aligned so on-disk records can be read in
/// place.
#[repr(align(8))]
pub struct BufData(pub [u8; BSIZE]);

pub struct BufInner {
    /// Has data been read from disk?
    valid: bool,
    /// Is writeback owed?
    dirty: bool,
    data: BufData,
}

pub struct BufEntry {
    inner: SleepLock<BufInner>,
}

impl BufEntry {
    const fn new() -> Self {
        Self {
            inner: SleepLock::new(
                "buffer",
                BufInner {
                    valid: false,
                    dirty: false,
                    data: BufData([0; BSIZE]),
                },
            ),
        }
    }
}

#[derive(Clone, Copy)]
struct BufKey {
    dev: u32,
    blockno: u32,
    refcnt: u32,
    in_use: bool,
}

struct BcacheCtl {
    keys: [BufKey; NBUF],
    buckets: [ArrayVec<usize, NBUF>; NBUCKET],
    /// All buffer indices ordered by recency; front is the least
    /// recently used.
    lru: ArrayVec<usize, NBUF>,
}

impl BcacheCtl {
    fn new() -> Self {
        let mut lru = ArrayVec::new();
        for idx in 0..NBUF {
            lru.push(idx);
        }
        Self {
            keys: [BufKey {
                dev: 0,
                blockno: 0,
                refcnt: 0,
                in_use: false,
            }; NBUF],
            buckets: array![_ => ArrayVec::new(); NBUCKET],
            lru,
        }
    }

    fn touch(&mut self, idx: usize) {
        if let Some(pos) = self.lru.iter().position(|&i| i == idx) {
            self.lru.remove(pos);
            self.lru.push(idx);
        }
    }
}

pub struct Bcache {
    ctl: Spinlock<BcacheCtl>,
    entries: [BufEntry; NBUF],
}

impl Bcache {
    pub fn new() -> Self {
        Self {
            ctl: Spinlock::new("bcache", BcacheCtl::new()),
            entries: array![_ => BufEntry::new(); NBUF],
        }
    }

    /// Return a locked buffer with the contents of the indicated block.
    pub fn get(&'static self, dev: u32, blockno: u32, ctx: &KernelCtx) -> Buf {
        let mut ctl = self.ctl.lock();
        let h = bucket(dev, blockno);

        // Already cached?
        let hit = ctl.buckets[h]
            .iter()
            .copied()
            .find(|&i| ctl.keys[i].dev == dev && ctl.keys[i].blockno == blockno);
        let idx = match hit {
            Some(idx) => {
                ctl.keys[idx].refcnt += 1;
                idx
            }
            None => {
                // Recycle the least recently used unreferenced buffer.
                let idx = ctl
                    .lru
                    .iter()
                    .copied()
                    .find(|&i| ctl.keys[i].refcnt == 0)
                    .unwrap_or_else(|| panic!("bget: no buffers"));
                if ctl.keys[idx].in_use {
                    let old = bucket(ctl.keys[idx].dev, ctl.keys[idx].blockno);
                    ctl.buckets[old].retain(|&mut i| i != idx);
                }
                ctl.keys[idx] = BufKey {
                    dev,
                    blockno,
                    refcnt: 1,
                    in_use: true,
                };
                ctl.buckets[h].push(idx);
                // SAFETY: refcnt was zero, so no process holds or can
                // acquire the sleep lock until we publish the new key.
                unsafe { (*self.entries[idx].inner.get_mut_raw()).valid = false };
                idx
            }
        };
        drop(ctl);

        let guard = self.entries[idx].inner.lock(ctx);
        let mut buf = Buf {
            cache: self,
            idx,
            dev,
            blockno,
            guard: ManuallyDrop::new(guard),
        };
        if !buf.inner().valid {
            ctx.kernel().hal.disk.read(blockno, &mut buf.inner_mut().data.0);
            buf.inner_mut().valid = true;
        }
        buf
    }

    /// Write every dirty cached block of `dev` to the device.
    pub fn flush(&'static self, dev: u32, ctx: &KernelCtx) {
        for idx in 0..NBUF {
            let mut ctl = self.ctl.lock();
            if !ctl.keys[idx].in_use || ctl.keys[idx].dev != dev {
                continue;
            }
            ctl.keys[idx].refcnt += 1;
            let blockno = ctl.keys[idx].blockno;
            drop(ctl);

            let guard = self.entries[idx].inner.lock(ctx);
            let mut buf = Buf {
                cache: self,
                idx,
                dev,
                blockno,
                guard: ManuallyDrop::new(guard),
            };
            if buf.inner().valid && buf.inner().dirty {
                buf.write_through(ctx);
            }
            buf.free(ctx);
        }
    }

    fn release_ref(&self, idx: usize) {
        let mut ctl = self.ctl.lock();
        assert!(ctl.keys[idx].refcnt >= 1, "brelse");
        ctl.keys[idx].refcnt -= 1;
        if ctl.keys[idx].refcnt == 0 {
            ctl.touch(idx);
        }
    }
}

impl Default for Bcache {
    fn default() -> Self {
        Self::new()
    }
}

/// A locked buffer. Must be released with `free` (or handed to the
/// log); silently dropping one is a bug.
pub struct Buf {
    cache: &'static Bcache,
    idx: usize,
    pub dev: u32,
    pub blockno: u32,
    guard: ManuallyDrop<SleepLockGuard<'static, BufInner>>,
}

impl Buf {
    fn inner(&self) -> &BufInner {
        &self.guard
    }

    fn inner_mut(&mut self) -> &mut BufInner {
        &mut self.guard
    }

    pub fn data(&self) -> &[u8; BSIZE] {
        &self.inner().data.0
    }

    pub fn data_mut(&mut self) -> &mut [u8; BSIZE] {
        let inner = self.inner_mut();
        inner.dirty = true;
        &mut inner.data.0
    }

    pub fn dirty(&self) -> bool {
        self.inner().dirty
    }

    /// Write the buffer's contents to the device now, bypassing the
    /// log. Only the log installer and `flush` should want this.
    pub fn write_through(&mut self, ctx: &KernelCtx) {
        let blockno = self.blockno;
        ctx.kernel().hal.disk.write(blockno, &self.inner().data.0);
        self.inner_mut().dirty = false;
    }

    pub fn cache_index(&self) -> usize {
        self.idx
    }

    /// Release the sleep lock but keep the reference, pinning the
    /// buffer in the cache. The log uses this to hold blocks until
    /// commit.
    pub fn unlock(mut self, ctx: &KernelCtx) -> BufUnlocked {
        // SAFETY: `self` is forgotten below and never used again.
        let guard = unsafe { ManuallyDrop::take(&mut self.guard) };
        guard.free(ctx);
        let unlocked = BufUnlocked {
            cache: self.cache,
            idx: self.idx,
            dev: self.dev,
            blockno: self.blockno,
        };
        mem::forget(self);
        unlocked
    }

    /// Release the lock and drop the reference.
    pub fn free(self, ctx: &KernelCtx) {
        self.unlock(ctx).free();
    }
}

impl Drop for Buf {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            panic!("Buf must be released with free()");
        }
    }
}

/// A referenced but unlocked buffer.
pub struct BufUnlocked {
    cache: &'static Bcache,
    idx: usize,
    pub dev: u32,
    pub blockno: u32,
}

impl BufUnlocked {
    /// Reacquire the buffer's lock.
    pub fn lock(self, ctx: &KernelCtx) -> Buf {
        let guard = self.cache.entries[self.idx].inner.lock(ctx);
        let mut buf = Buf {
            cache: self.cache,
            idx: self.idx,
            dev: self.dev,
            blockno: self.blockno,
            guard: ManuallyDrop::new(guard),
        };
        if !buf.inner().valid {
            let blockno = buf.blockno;
            ctx.kernel().hal.disk.read(blockno, &mut buf.inner_mut().data.0);
            buf.inner_mut().valid = true;
        }
        mem::forget(self);
        buf
    }

    /// Drop the pinned reference.
    pub fn free(self) {
        self.cache.release_ref(self.idx);
        mem::forget(self);
    }
}

impl Drop for BufUnlocked {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            panic!("BufUnlocked must be released with free()");
        }
    }
}
