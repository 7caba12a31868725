//! Inodes.
//!
//! An inode describes a single unnamed file. The on-disk structure
//! holds the file's type, link count, size, the block map — ten direct
//! pointers plus single, double and triple indirect pointers — and the
//! extended metadata (mode, owner, timestamps, allocated-block count).
//!
//! The kernel keeps a fixed table of in-use inodes in memory to
//! provide a place for synchronizing access to inodes used by multiple
//! processes. The in-memory inode adds book-keeping that is not stored
//! on disk: the table reference count and `valid`.
//!
//! * Allocation: an inode is allocated if its on-disk type is nonzero.
//!   `Itable::alloc_inode` allocates; `RcInode::put` frees when the
//!   reference and link counts have both fallen to zero — inside the
//!   caller's transaction, before the table slot can be reused.
//! * Referencing: `get_inode` finds or creates a table entry and
//!   increments its count; `put` decrements it. A positive count keeps
//!   the entry pinned.
//! * Valid: the cached copy of the disk inode is only meaningful after
//!   the first `lock`, which reads it in lazily.
//! * Locked: the sleep lock serializes every field other than the
//!   count, device and number, and all content I/O.
//!
//! Thus a typical sequence is:
//!   ip = get_inode(dev, inum)
//!   guard = ip.lock()
//!   ... examine and modify through the guard ...
//!   guard.free()
//!   ip.put(tx)

use core::mem::{self, ManuallyDrop};
use core::ptr;

use array_macro::array;
use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use crate::errno::KernelError;
use crate::fs::{FsTransaction, Stat};
use crate::kernel::{Kernel, KernelCtx};
use crate::kprintln;
use crate::lock::{SleepLock, SleepLockGuard, Spinlock};
use crate::param::{BSIZE, NINODE, ROOTDEV};

/// Direct block pointers per inode.
pub const NDIRECT: usize = 10;

/// Block pointers per indirect block.
pub const NINDIRECT: usize = BSIZE / mem::size_of::<u32>();
pub const NINDIRECT2: usize = NINDIRECT * NINDIRECT;
pub const NINDIRECT3: usize = NINDIRECT * NINDIRECT * NINDIRECT;

/// Largest file, in blocks.
pub const MAXFILE: usize = NDIRECT + NINDIRECT + NINDIRECT2 + NINDIRECT3;

/// Inodes per block.
pub const IPB: usize = BSIZE / mem::size_of::<Dinode>();

/// Longest file name in a directory entry, not NUL-terminated.
pub const DIRSIZ: usize = 62;

pub const DIRENT_SIZE: usize = mem::size_of::<Dirent>();

const T_NONE: i16 = 0;
const T_DIR: i16 = 1;
const T_FILE: i16 = 2;
const T_DEVICE: i16 = 3;
const T_SYMLINK: i16 = 4;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InodeType {
    None,
    Dir,
    File,
    Device { major: u16, minor: u16 },
    Symlink,
}

impl InodeType {
    pub fn code(self) -> i16 {
        match self {
            InodeType::None => T_NONE,
            InodeType::Dir => T_DIR,
            InodeType::File => T_FILE,
            InodeType::Device { .. } => T_DEVICE,
            InodeType::Symlink => T_SYMLINK,
        }
    }
}

/// On-disk inode structure: 128 bytes, 32 per block.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct Dinode {
    /// File type; 0 means free.
    pub typ: i16,
    /// Major device number (device files only).
    pub major: i16,
    /// Minor device number (device files only).
    pub minor: i16,
    /// Number of links to inode in file system.
    pub nlink: i16,
    /// Size of file (bytes).
    pub size: u32,
    /// Data block addresses: NDIRECT direct, then single, double and
    /// triple indirect roots.
    pub addrs: [u32; NDIRECT + 3],
    /// File mode bits.
    pub mode: u16,
    /// Owning user.
    pub uid: u16,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    /// Blocks allocated on behalf of this inode.
    pub blocks: u32,
    /// Reserved for future layout changes.
    pub pad: [u8; 44],
}

const_assert!(mem::size_of::<Dinode>() == 128);
const_assert!(BSIZE % mem::size_of::<Dinode>() == 0);
const_assert!(IPB == 32);

/// A directory is a file holding a sequence of these.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct Dirent {
    /// Inode number; 0 marks a free slot.
    pub inum: u16,
    /// Not NUL-terminated when exactly DIRSIZ bytes long.
    pub name: [u8; DIRSIZ],
}

const_assert!(BSIZE % mem::size_of::<Dirent>() == 0);

impl Dirent {
    pub fn empty() -> Dirent {
        Dirent {
            inum: 0,
            name: [0; DIRSIZ],
        }
    }

    pub fn new(inum: u16, name: &[u8]) -> Dirent {
        let mut de = Dirent::empty();
        de.inum = inum;
        let n = usize::min(name.len(), DIRSIZ);
        de.name[..n].copy_from_slice(&name[..n]);
        de
    }

    /// The stored name, without trailing NULs.
    pub fn name_bytes(&self) -> &[u8] {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(DIRSIZ);
        &self.name[..len]
    }

    fn name_matches(&self, name: &[u8]) -> bool {
        let n = usize::min(name.len(), DIRSIZ);
        self.name_bytes() == &name[..n]
    }
}

/// In-memory copy of a disk inode, plus `valid`.
pub struct InodeInner {
    /// Has this been read from disk?
    pub valid: bool,
    pub typ: InodeType,
    pub nlink: i16,
    pub size: u32,
    pub addr_direct: [u32; NDIRECT],
    /// Single, double, triple indirect roots.
    pub addr_indirect: [u32; 3],
    pub mode: u16,
    pub uid: u16,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    pub blocks: u32,
}

impl InodeInner {
    const fn new() -> Self {
        Self {
            valid: false,
            typ: InodeType::None,
            nlink: 0,
            size: 0,
            addr_direct: [0; NDIRECT],
            addr_indirect: [0; 3],
            mode: 0,
            uid: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
            blocks: 0,
        }
    }
}

pub struct Inode {
    lock: SleepLock<InodeInner>,
}

#[derive(Clone, Copy)]
struct IKey {
    dev: u32,
    inum: u32,
    refcnt: u32,
}

/// The in-memory inode table. The control lock guards the keys and
/// reference counts; everything else is behind each inode's sleep
/// lock.
pub struct Itable {
    ctl: Spinlock<[IKey; NINODE]>,
    nodes: [Inode; NINODE],
}

impl Itable {
    pub fn new() -> Self {
        Self {
            ctl: Spinlock::new(
                "itable",
                [IKey {
                    dev: 0,
                    inum: 0,
                    refcnt: 0,
                }; NINODE],
            ),
            nodes: array![_ => Inode { lock: SleepLock::new("inode", InodeInner::new()) }; NINODE],
        }
    }

    /// Find the inode with number `inum` on device `dev` and return an
    /// in-memory handle. Does not lock it and does not read it from
    /// disk.
    pub fn get_inode(&self, dev: u32, inum: u32) -> RcInode {
        let mut ctl = self.ctl.lock();
        let mut free = None;
        for idx in 0..NINODE {
            let key = ctl[idx];
            if key.refcnt > 0 && key.dev == dev && key.inum == inum {
                ctl[idx].refcnt += 1;
                return RcInode { idx, dev, inum };
            }
            if free.is_none() && key.refcnt == 0 {
                free = Some(idx);
            }
        }
        let idx = free.unwrap_or_else(|| panic!("iget: no inodes"));
        ctl[idx] = IKey {
            dev,
            inum,
            refcnt: 1,
        };
        // SAFETY: the slot's count was zero, so nobody holds or can
        // acquire its sleep lock until the new key is published.
        unsafe { (*self.nodes[idx].lock.get_mut_raw()).valid = false };
        RcInode { idx, dev, inum }
    }

    /// Allocate a fresh inode of the given type on `dev`, by scanning
    /// the on-disk table for a free slot.
    pub fn alloc_inode(
        &self,
        dev: u32,
        typ: InodeType,
        tx: &FsTransaction<'_>,
        ctx: &KernelCtx,
    ) -> Result<RcInode, KernelError> {
        if typ == InodeType::None {
            return Err(KernelError::Invalid);
        }
        let sb = ctx.kernel().fs.superblock();
        for inum in 1..sb.ninodes {
            let mut buf = ctx.kernel().bcache.get(dev, sb.iblock(inum), ctx);
            // SAFETY: dinodes are packed in the block, and the buffer
            // data is sufficiently aligned.
            let dip = unsafe {
                &mut *(buf.data_mut().as_mut_ptr() as *mut Dinode).add(inum as usize % IPB)
            };
            if dip.typ != T_NONE {
                buf.free(ctx);
                continue;
            }
            // A free inode: claim it on disk.
            *dip = Dinode::new_zeroed();
            dip.typ = typ.code();
            if let InodeType::Device { major, minor } = typ {
                dip.major = major as i16;
                dip.minor = minor as i16;
            }
            dip.mode = 0o644;
            dip.uid = 0;
            dip.ctime = time_now(ctx);
            tx.write(buf, ctx);
            return Ok(self.get_inode(dev, inum));
        }
        kprintln!(
            ctx.kernel(),
            "ialloc: no free inodes available (checked {} inodes)",
            sb.ninodes - 1
        );
        Err(KernelError::InodeTableFull)
    }

    pub fn root(&self) -> RcInode {
        self.get_inode(ROOTDEV, super::ROOTINO)
    }
}

impl Default for Itable {
    fn default() -> Self {
        Self::new()
    }
}

/// A referenced inode handle. Must be released with `put`; silently
/// dropping one is a bug.
pub struct RcInode {
    idx: usize,
    pub dev: u32,
    pub inum: u32,
}

impl RcInode {
    /// Take another table reference to the same inode.
    pub fn dup(&self, kernel: &Kernel) -> RcInode {
        let mut ctl = kernel.fs.itable.ctl.lock();
        assert!(ctl[self.idx].refcnt >= 1, "idup");
        ctl[self.idx].refcnt += 1;
        RcInode {
            idx: self.idx,
            dev: self.dev,
            inum: self.inum,
        }
    }

    /// Lock the inode, reading it from disk if this is its first use.
    pub fn lock(&self, ctx: &KernelCtx) -> InodeGuard {
        let kernel = ctx.kernel();
        let guard = kernel.fs.itable.nodes[self.idx].lock.lock(ctx);
        let mut guard = InodeGuard {
            guard: ManuallyDrop::new(guard),
            dev: self.dev,
            inum: self.inum,
        };
        if !guard.valid {
            let sb = kernel.fs.superblock();
            let buf = kernel.bcache.get(self.dev, sb.iblock(self.inum), ctx);
            // SAFETY: dinodes are packed in the block; read by copy.
            let dip: Dinode = unsafe {
                ptr::read((buf.data().as_ptr() as *const Dinode).add(self.inum as usize % IPB))
            };
            buf.free(ctx);
            guard.typ = match dip.typ {
                T_DIR => InodeType::Dir,
                T_FILE => InodeType::File,
                T_DEVICE => InodeType::Device {
                    major: dip.major as u16,
                    minor: dip.minor as u16,
                },
                T_SYMLINK => InodeType::Symlink,
                _ => InodeType::None,
            };
            guard.nlink = dip.nlink;
            guard.size = dip.size;
            guard.addr_direct.copy_from_slice(&dip.addrs[..NDIRECT]);
            guard.addr_indirect.copy_from_slice(&dip.addrs[NDIRECT..]);
            guard.mode = dip.mode;
            guard.uid = dip.uid;
            guard.atime = dip.atime;
            guard.mtime = dip.mtime;
            guard.ctime = dip.ctime;
            guard.blocks = dip.blocks;
            guard.valid = true;
            assert!(guard.typ != InodeType::None, "ilock: no type");
        }
        guard
    }

    /// Drop a reference. If that was the last reference and the inode
    /// has no links, truncate and free it on disk — which is why every
    /// `put` happens inside a transaction.
    pub fn put(self, tx: &FsTransaction<'_>, ctx: &KernelCtx) {
        let itable = &ctx.kernel().fs.itable;
        let mut ctl = itable.ctl.lock();
        if ctl[self.idx].refcnt == 1 {
            // SAFETY: ours is the only reference, so no one can hold
            // the sleep lock or change these fields underneath us.
            let (valid, nlink) = unsafe {
                let inner = &*itable.nodes[self.idx].lock.get_mut_raw();
                (inner.valid, inner.nlink)
            };
            if valid && nlink == 0 {
                // No links and no other references: truncate and free.
                // The sleep lock cannot block here for the same reason.
                drop(ctl);
                let mut guard = self.lock(ctx);
                guard.trunc(tx, ctx);
                guard.typ = InodeType::None;
                guard.update(tx, ctx);
                guard.valid = false;
                guard.free(ctx);
                let mut ctl = itable.ctl.lock();
                ctl[self.idx].refcnt -= 1;
                mem::forget(self);
                return;
            }
        }
        ctl[self.idx].refcnt -= 1;
        drop(ctl);
        mem::forget(self);
    }
}

impl Drop for RcInode {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            panic!("RcInode must be released with put()");
        }
    }
}

/// A locked inode. Dereferences to the cached disk inode; must be
/// released with `free`.
pub struct InodeGuard {
    guard: ManuallyDrop<SleepLockGuard<'static, InodeInner>>,
    pub dev: u32,
    pub inum: u32,
}

impl core::ops::Deref for InodeGuard {
    type Target = InodeInner;

    fn deref(&self) -> &InodeInner {
        &self.guard
    }
}

impl core::ops::DerefMut for InodeGuard {
    fn deref_mut(&mut self) -> &mut InodeInner {
        &mut self.guard
    }
}

impl Drop for InodeGuard {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            panic!("InodeGuard must be released with free()");
        }
    }
}

impl InodeGuard {
    /// Unlock the inode.
    pub fn free(mut self, ctx: &KernelCtx) {
        // SAFETY: `self` is forgotten below and never used again.
        let guard = unsafe { ManuallyDrop::take(&mut self.guard) };
        guard.free(ctx);
        mem::forget(self);
    }

    /// Copy the cached inode back to disk. Must be called after every
    /// change to a field that lives on disk.
    pub fn update(&self, tx: &FsTransaction<'_>, ctx: &KernelCtx) {
        let sb = ctx.kernel().fs.superblock();
        let mut buf = ctx.kernel().bcache.get(self.dev, sb.iblock(self.inum), ctx);
        {
            // SAFETY: dinodes are packed in the block, and the buffer
            // lock is held.
            let dip = unsafe {
                &mut *(buf.data_mut().as_mut_ptr() as *mut Dinode).add(self.inum as usize % IPB)
            };
            dip.typ = self.typ.code();
            let (major, minor) = match self.typ {
                InodeType::Device { major, minor } => (major as i16, minor as i16),
                _ => (0, 0),
            };
            dip.major = major;
            dip.minor = minor;
            dip.nlink = self.nlink;
            dip.size = self.size;
            dip.addrs[..NDIRECT].copy_from_slice(&self.addr_direct);
            dip.addrs[NDIRECT..].copy_from_slice(&self.addr_indirect);
            dip.mode = self.mode;
            dip.uid = self.uid;
            dip.atime = self.atime;
            dip.mtime = self.mtime;
            dip.ctime = self.ctime;
            dip.blocks = self.blocks;
            dip.pad = [0; 44];
        }
        tx.write(buf, ctx);
    }

    /// Discard the inode's contents, freeing every data block
    /// reachable through the direct and indirect pointers.
    pub fn trunc(&mut self, tx: &FsTransaction<'_>, ctx: &KernelCtx) {
        let dev = self.dev;
        for slot in 0..NDIRECT {
            let addr = self.addr_direct[slot];
            if addr != 0 {
                tx.bfree(dev, addr, ctx);
                self.addr_direct[slot] = 0;
            }
        }
        for (slot, depth) in [(0, 1), (1, 2), (2, 3)] {
            let addr = self.addr_indirect[slot];
            if addr != 0 {
                free_indirect(tx, ctx, dev, addr, depth);
                self.addr_indirect[slot] = 0;
            }
        }
        self.size = 0;
        self.blocks = 0;
        self.update(tx, ctx);
    }

    /// Disk address of the `bn`th block of this inode, or 0 when the
    /// block was never written.
    pub fn bmap(&mut self, bn: usize, ctx: &KernelCtx) -> u32 {
        self.bmap_internal(bn, None, ctx)
    }

    /// Like `bmap`, but allocates missing blocks — including the
    /// intermediate indirect blocks — lazily. Returns 0 when the disk
    /// is full; whatever was allocated along the way is kept for the
    /// next attempt.
    pub fn bmap_or_alloc(&mut self, bn: usize, tx: &FsTransaction<'_>, ctx: &KernelCtx) -> u32 {
        self.bmap_internal(bn, Some(tx), ctx)
    }

    fn bmap_internal(
        &mut self,
        bn: usize,
        tx: Option<&FsTransaction<'_>>,
        ctx: &KernelCtx,
    ) -> u32 {
        let dev = self.dev;
        match block_path(bn) {
            BlockPath::Direct(slot) => {
                let mut addr = self.addr_direct[slot];
                if addr == 0 {
                    let Some(tx) = tx else { return 0 };
                    let Some(fresh) = tx.balloc(dev, ctx) else { return 0 };
                    self.addr_direct[slot] = fresh;
                    self.blocks += 1;
                    addr = fresh;
                }
                addr
            }
            BlockPath::Indirect { slot, depth, idx } => {
                let mut addr = self.addr_indirect[slot];
                if addr == 0 {
                    let Some(tx) = tx else { return 0 };
                    let Some(fresh) = tx.balloc(dev, ctx) else { return 0 };
                    self.addr_indirect[slot] = fresh;
                    self.blocks += 1;
                    addr = fresh;
                }
                for level in 0..depth {
                    let mut buf = ctx.kernel().bcache.get(dev, addr, ctx);
                    let entry = read_u32(buf.data(), idx[level]);
                    addr = if entry != 0 {
                        buf.free(ctx);
                        entry
                    } else {
                        let Some(tx) = tx else {
                            buf.free(ctx);
                            return 0;
                        };
                        let Some(fresh) = tx.balloc(dev, ctx) else {
                            buf.free(ctx);
                            return 0;
                        };
                        write_u32(buf.data_mut(), idx[level], fresh);
                        self.blocks += 1;
                        tx.write(buf, ctx);
                        fresh
                    };
                }
                addr
            }
        }
    }

    /// Read from the inode's content. `f(dst_off, src)` places each
    /// piece; reading stops early at a hole. Touches atime.
    fn read_internal<F>(
        &mut self,
        mut off: u32,
        mut n: u32,
        mut f: F,
        ctx: &KernelCtx,
    ) -> Result<usize, KernelError>
    where
        F: FnMut(u32, &[u8]) -> Result<(), KernelError>,
    {
        if off > self.size || off.wrapping_add(n) < off {
            return Ok(0);
        }
        if off + n > self.size {
            n = self.size - off;
        }
        let bsize = BSIZE as u32;
        let mut tot: u32 = 0;
        while tot < n {
            let addr = self.bmap((off / bsize) as usize, ctx);
            if addr == 0 {
                break;
            }
            let buf = ctx.kernel().bcache.get(self.dev, addr, ctx);
            let m = u32::min(n - tot, bsize - off % bsize);
            let begin = (off % bsize) as usize;
            let res = f(tot, &buf.data()[begin..begin + m as usize]);
            buf.free(ctx);
            res?;
            tot += m;
            off += m;
        }
        if tot > 0 {
            self.atime = time_now(ctx);
        }
        Ok(tot as usize)
    }

    /// Read into kernel memory. Never fails; short only at a hole or
    /// end of file.
    pub fn read_bytes_kernel(&mut self, dst: &mut [u8], off: u32, ctx: &KernelCtx) -> usize {
        self.read_internal(
            off,
            dst.len() as u32,
            |dst_off, src| {
                dst[dst_off as usize..dst_off as usize + src.len()].copy_from_slice(src);
                Ok(())
            },
            ctx,
        )
        .expect("read_bytes_kernel")
    }

    /// Read one fixed-size record from the inode.
    pub fn read_kernel<T: AsBytes + FromBytes>(
        &mut self,
        dst: &mut T,
        off: u32,
        ctx: &KernelCtx,
    ) -> Result<(), KernelError> {
        let read = self.read_bytes_kernel(dst.as_bytes_mut(), off, ctx);
        if read == mem::size_of::<T>() {
            Ok(())
        } else {
            Err(KernelError::Io)
        }
    }

    /// Read into user memory at `dst`.
    pub fn read_user(
        &mut self,
        ctx: &KernelCtx,
        dst: crate::addr::UVAddr,
        off: u32,
        n: u32,
    ) -> Result<usize, KernelError> {
        self.read_internal(
            off,
            n,
            |dst_off, src| {
                ctx.data_mut()
                    .memory
                    .as_mut()
                    .expect("read_user: no memory")
                    .copy_out(dst + dst_off as usize, src)
                    .map_err(|_| KernelError::Invalid)
            },
            ctx,
        )
    }

    /// Write to the inode's content, allocating blocks as needed.
    /// Returns the bytes written, which is short of `n` if the disk
    /// filled up or `f` failed. Touches mtime.
    fn write_internal<F>(
        &mut self,
        mut off: u32,
        n: u32,
        mut f: F,
        tx: &FsTransaction<'_>,
        ctx: &KernelCtx,
    ) -> Result<usize, KernelError>
    where
        F: FnMut(u32, &mut [u8]) -> Result<(), KernelError>,
    {
        if off > self.size {
            return Err(KernelError::Invalid);
        }
        if off.checked_add(n).ok_or(KernelError::Invalid)? as usize > MAXFILE * BSIZE {
            return Err(KernelError::Invalid);
        }
        let bsize = BSIZE as u32;
        let mut tot: u32 = 0;
        while tot < n {
            let addr = self.bmap_or_alloc((off / bsize) as usize, tx, ctx);
            if addr == 0 {
                break;
            }
            let mut buf = ctx.kernel().bcache.get(self.dev, addr, ctx);
            let m = u32::min(n - tot, bsize - off % bsize);
            let begin = (off % bsize) as usize;
            if f(tot, &mut buf.data_mut()[begin..begin + m as usize]).is_ok() {
                tx.write(buf, ctx);
            } else {
                buf.free(ctx);
                break;
            }
            tot += m;
            off += m;
        }
        if off > self.size {
            self.size = off;
        }
        if tot > 0 {
            self.mtime = time_now(ctx);
        }
        // Write the inode back even if the size didn't change, because
        // bmap may have added blocks to the pointer arrays.
        self.update(tx, ctx);
        Ok(tot as usize)
    }

    pub fn write_bytes_kernel(
        &mut self,
        src: &[u8],
        off: u32,
        tx: &FsTransaction<'_>,
        ctx: &KernelCtx,
    ) -> Result<usize, KernelError> {
        self.write_internal(
            off,
            src.len() as u32,
            |src_off, dst| {
                dst.copy_from_slice(&src[src_off as usize..src_off as usize + dst.len()]);
                Ok(())
            },
            tx,
            ctx,
        )
    }

    /// Write one fixed-size record to the inode.
    pub fn write_kernel<T: AsBytes>(
        &mut self,
        src: &T,
        off: u32,
        tx: &FsTransaction<'_>,
        ctx: &KernelCtx,
    ) -> Result<(), KernelError> {
        let written = self.write_bytes_kernel(src.as_bytes(), off, tx, ctx)?;
        if written == mem::size_of::<T>() {
            Ok(())
        } else {
            Err(KernelError::Io)
        }
    }

    /// Write from user memory at `src`. A fault in the source ends the
    /// write early, like the disk filling up.
    pub fn write_user(
        &mut self,
        ctx: &KernelCtx,
        src: crate::addr::UVAddr,
        off: u32,
        n: u32,
        tx: &FsTransaction<'_>,
    ) -> Result<usize, KernelError> {
        self.write_internal(
            off,
            n,
            |src_off, dst| {
                ctx.data_mut()
                    .memory
                    .as_mut()
                    .expect("write_user: no memory")
                    .copy_in(dst, src + src_off as usize)
                    .map_err(|_| KernelError::Invalid)
            },
            tx,
            ctx,
        )
    }

    /// Look for a directory entry by name; returns the entry's inode
    /// and its byte offset.
    pub fn dirlookup(
        &mut self,
        name: &[u8],
        ctx: &KernelCtx,
    ) -> Result<(RcInode, u32), KernelError> {
        assert!(self.typ == InodeType::Dir, "dirlookup not DIR");
        let mut off = 0;
        while off < self.size {
            let mut de = Dirent::empty();
            self.read_kernel(&mut de, off, ctx).expect("dirlookup read");
            if de.inum != 0 && de.name_matches(name) {
                let ip = ctx.kernel().fs.itable.get_inode(self.dev, de.inum as u32);
                return Ok((ip, off));
            }
            off += DIRENT_SIZE as u32;
        }
        Err(KernelError::NoEntry)
    }

    /// Write a new directory entry (`name`, `inum`) into this
    /// directory, reusing a free slot when there is one.
    pub fn dirlink(
        &mut self,
        name: &[u8],
        inum: u32,
        tx: &FsTransaction<'_>,
        ctx: &KernelCtx,
    ) -> Result<(), KernelError> {
        // The name must not be present.
        if let Ok((ip, _)) = self.dirlookup(name, ctx) {
            ip.put(tx, ctx);
            return Err(KernelError::Exists);
        }

        // Look for an empty slot.
        let mut off = 0;
        while off < self.size {
            let mut de = Dirent::empty();
            self.read_kernel(&mut de, off, ctx).expect("dirlink read");
            if de.inum == 0 {
                break;
            }
            off += DIRENT_SIZE as u32;
        }

        let de = Dirent::new(inum as u16, name);
        self.write_kernel(&de, off, tx, ctx)
            .map_err(|_| KernelError::NoSpace)
    }

    /// Is the directory empty except for "." and ".."?
    pub fn is_dir_empty(&mut self, ctx: &KernelCtx) -> bool {
        let mut off = (2 * DIRENT_SIZE) as u32;
        while off < self.size {
            let mut de = Dirent::empty();
            self.read_kernel(&mut de, off, ctx).expect("is_dir_empty read");
            if de.inum != 0 {
                return false;
            }
            off += DIRENT_SIZE as u32;
        }
        true
    }

    pub fn stat(&self) -> Stat {
        Stat {
            dev: self.dev as i32,
            ino: self.inum,
            typ: self.typ.code(),
            nlink: self.nlink,
            _pad: 0,
            size: self.size as u64,
        }
    }
}

/// Free one indirect tree rooted at `addr`; `depth` is 1 for a block
/// of leaf pointers.
fn free_indirect(tx: &FsTransaction<'_>, ctx: &KernelCtx, dev: u32, addr: u32, depth: usize) {
    let buf = ctx.kernel().bcache.get(dev, addr, ctx);
    let mut entries = vec![0u32; NINDIRECT];
    for (slot, entry) in entries.iter_mut().enumerate() {
        *entry = read_u32(buf.data(), slot);
    }
    buf.free(ctx);
    for entry in entries {
        if entry != 0 {
            if depth == 1 {
                tx.bfree(dev, entry, ctx);
            } else {
                free_indirect(tx, ctx, dev, entry, depth - 1);
            }
        }
    }
    tx.bfree(dev, addr, ctx);
}

/// Reclaim orphans at mount: any on-disk inode that is allocated but
/// has no links lost its last reference in a crash, so drop that
/// reference again and let `put` free it.
pub fn ireclaim(kernel: &'static Kernel, dev: u32, ctx: &KernelCtx) {
    let sb = kernel.fs.superblock();
    for inum in 1..sb.ninodes {
        let buf = kernel.bcache.get(dev, sb.iblock(inum), ctx);
        // SAFETY: dinodes are packed in the block; read by copy.
        let dip: Dinode = unsafe {
            ptr::read((buf.data().as_ptr() as *const Dinode).add(inum as usize % IPB))
        };
        buf.free(ctx);
        if dip.typ != T_NONE && dip.nlink == 0 {
            kprintln!(kernel, "ireclaim: orphaned inode {}", inum);
            let ip = kernel.fs.itable.get_inode(dev, inum);
            let tx = kernel.fs.begin_tx(ctx);
            let guard = ip.lock(ctx);
            guard.free(ctx);
            ip.put(&tx, ctx);
            tx.end(ctx);
        }
    }
}

/// Where logical block `bn` of an inode lives.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BlockPath {
    Direct(usize),
    Indirect {
        /// Which indirect root: 0 single, 1 double, 2 triple.
        slot: usize,
        /// Pointer blocks between the root and the data.
        depth: usize,
        /// Index to follow at each level.
        idx: [usize; 3],
    },
}

pub fn block_path(bn: usize) -> BlockPath {
    if bn < NDIRECT {
        return BlockPath::Direct(bn);
    }
    let bn = bn - NDIRECT;
    if bn < NINDIRECT {
        return BlockPath::Indirect {
            slot: 0,
            depth: 1,
            idx: [bn, 0, 0],
        };
    }
    let bn = bn - NINDIRECT;
    if bn < NINDIRECT2 {
        return BlockPath::Indirect {
            slot: 1,
            depth: 2,
            idx: [bn / NINDIRECT, bn % NINDIRECT, 0],
        };
    }
    let bn = bn - NINDIRECT2;
    if bn < NINDIRECT3 {
        return BlockPath::Indirect {
            slot: 2,
            depth: 3,
            idx: [bn / NINDIRECT2, (bn / NINDIRECT) % NINDIRECT, bn % NINDIRECT],
        };
    }
    panic!("bmap: out of range");
}

fn read_u32(data: &[u8; BSIZE], slot: usize) -> u32 {
    let off = slot * 4;
    u32::from_ne_bytes(data[off..off + 4].try_into().unwrap())
}

fn write_u32(data: &mut [u8; BSIZE], slot: usize, value: u32) {
    let off = slot * 4;
    data[off..off + 4].copy_from_slice(&value.to_ne_bytes());
}

fn time_now(ctx: &KernelCtx) -> u32 {
    *ctx.kernel().ticks.lock() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_path_boundaries() {
        assert_eq!(block_path(0), BlockPath::Direct(0));
        assert_eq!(block_path(NDIRECT - 1), BlockPath::Direct(NDIRECT - 1));
        assert_eq!(
            block_path(NDIRECT),
            BlockPath::Indirect {
                slot: 0,
                depth: 1,
                idx: [0, 0, 0]
            }
        );
        assert_eq!(
            block_path(NDIRECT + NINDIRECT - 1),
            BlockPath::Indirect {
                slot: 0,
                depth: 1,
                idx: [NINDIRECT - 1, 0, 0]
            }
        );
        assert_eq!(
            block_path(NDIRECT + NINDIRECT),
            BlockPath::Indirect {
                slot: 1,
                depth: 2,
                idx: [0, 0, 0]
            }
        );
        let last_double = NDIRECT + NINDIRECT + NINDIRECT2 - 1;
        assert_eq!(
            block_path(last_double),
            BlockPath::Indirect {
                slot: 1,
                depth: 2,
                idx: [NINDIRECT - 1, NINDIRECT - 1, 0]
            }
        );
        assert_eq!(
            block_path(last_double + 1),
            BlockPath::Indirect {
                slot: 2,
                depth: 3,
                idx: [0, 0, 0]
            }
        );
        assert_eq!(
            block_path(MAXFILE - 1),
            BlockPath::Indirect {
                slot: 2,
                depth: 3,
                idx: [NINDIRECT - 1, NINDIRECT - 1, NINDIRECT - 1]
            }
        );
    }

    #[test]
    #[should_panic(expected = "bmap: out of range")]
    fn block_path_rejects_past_maxfile() {
        let _ = block_path(MAXFILE);
    }

    #[test]
    fn dirent_names_truncate_and_compare() {
        let de = Dirent::new(7, b"hello");
        assert_eq!(de.name_bytes(), b"hello");
        assert!(de.name_matches(b"hello"));
        assert!(!de.name_matches(b"hell"));

        let long = [b'x'; 80];
        let de = Dirent::new(8, &long);
        assert_eq!(de.name_bytes().len(), DIRSIZ);
        assert!(de.name_matches(&long));
    }

    #[test]
    fn dinode_layout_is_packed() {
        assert_eq!(mem::size_of::<Dinode>(), 128);
        assert_eq!(mem::size_of::<Dirent>(), 64);
        assert_eq!(IPB, 32);
        assert_eq!(NINDIRECT, 1024);
    }
}
