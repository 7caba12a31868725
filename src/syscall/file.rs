//! File, directory and pipe system calls.

use core::cell::UnsafeCell;

use super::{argaddr, argint, argstr, fetch_addr, fetch_str};
use crate::addr::UVAddr;
use crate::errno::KernelError;
use crate::exec;
use crate::file::{File, FileType, RcFile};
use crate::fs::{self, FsTransaction, InodeGuard, InodeType, RcInode, Dirent};
use crate::kernel::KernelCtx;
use crate::param::{MAXARG, NDEV, NOFILE};
use crate::pipe::Pipe;

pub const O_RDONLY: u32 = 0x000;
pub const O_WRONLY: u32 = 0x001;
pub const O_RDWR: u32 = 0x002;
pub const O_CREATE: u32 = 0x200;
pub const O_TRUNC: u32 = 0x400;

/// The n'th argument as an open file descriptor.
fn argfd(ctx: &KernelCtx, n: usize) -> Result<(usize, &'static File), KernelError> {
    let fd = argint(ctx, n);
    if fd < 0 || fd as usize >= NOFILE {
        return Err(KernelError::BadFd);
    }
    let fd = fd as usize;
    let file = {
        let data = ctx.data();
        match &data.open_files[fd] {
            Some(rc) => rc.file(ctx.kernel()),
            None => return Err(KernelError::BadFd),
        }
    };
    Ok((fd, file))
}

/// Store `rc` in the lowest free slot of the caller's fd table.
fn fdalloc(ctx: &KernelCtx, rc: RcFile) -> Result<usize, KernelError> {
    let free = {
        let data = ctx.data();
        data.open_files.iter().position(|f| f.is_none())
    };
    match free {
        Some(fd) => {
            ctx.data_mut().open_files[fd] = Some(rc);
            Ok(fd)
        }
        None => {
            rc.close(ctx);
            Err(KernelError::TooManyOpen)
        }
    }
}

/// Create a new inode at `path` and return it locked. Opening an
/// existing file with O_CREATE succeeds when the types agree.
fn create(
    ctx: &KernelCtx,
    tx: &FsTransaction<'_>,
    path: &[u8],
    typ: InodeType,
) -> Result<(RcInode, InodeGuard), KernelError> {
    let kernel = ctx.kernel();
    let (dp, name) = fs::nameiparent(ctx, tx, path)?;
    let mut dguard = dp.lock(ctx);

    if let Ok((ip, _)) = dguard.dirlookup(&name, ctx) {
        dguard.free(ctx);
        dp.put(tx, ctx);
        if typ == InodeType::File {
            let guard = ip.lock(ctx);
            if guard.typ == InodeType::File || matches!(guard.typ, InodeType::Device { .. }) {
                return Ok((ip, guard));
            }
            guard.free(ctx);
        }
        ip.put(tx, ctx);
        return Err(KernelError::Exists);
    }

    let ip = match kernel.fs.itable.alloc_inode(dp.dev, typ, tx, ctx) {
        Ok(ip) => ip,
        Err(e) => {
            dguard.free(ctx);
            dp.put(tx, ctx);
            return Err(e);
        }
    };
    let mut guard = ip.lock(ctx);
    guard.nlink = 1;
    guard.update(tx, ctx);

    if typ == InodeType::Dir {
        // "." and ".." — no extra link count for "." itself.
        if guard.dirlink(b".", ip.inum, tx, ctx).is_err()
            || guard.dirlink(b"..", dp.inum, tx, ctx).is_err()
        {
            panic!("create dots");
        }
    }

    if dguard.dirlink(&name, ip.inum, tx, ctx).is_err() {
        // Undo the allocation; put will reclaim the inode.
        guard.nlink = 0;
        guard.update(tx, ctx);
        guard.free(ctx);
        ip.put(tx, ctx);
        dguard.free(ctx);
        dp.put(tx, ctx);
        return Err(KernelError::NoSpace);
    }

    if typ == InodeType::Dir {
        // The new directory's ".." links back to dp.
        dguard.nlink += 1;
        dguard.update(tx, ctx);
    }

    dguard.free(ctx);
    dp.put(tx, ctx);
    Ok((ip, guard))
}

pub fn sys_open(ctx: &KernelCtx) -> Result<usize, KernelError> {
    let path = argstr(ctx, 0)?;
    let omode = argint(ctx, 1) as u32;
    let kernel = ctx.kernel();

    let tx = kernel.fs.begin_tx(ctx);
    let (ip, mut guard) = if omode & O_CREATE != 0 {
        match create(ctx, &tx, &path, InodeType::File) {
            Ok(v) => v,
            Err(e) => {
                tx.end(ctx);
                return Err(e);
            }
        }
    } else {
        let ip = match fs::namei(ctx, &tx, &path) {
            Ok(ip) => ip,
            Err(e) => {
                tx.end(ctx);
                return Err(e);
            }
        };
        let guard = ip.lock(ctx);
        (ip, guard)
    };

    if guard.typ == InodeType::Dir && omode != O_RDONLY {
        guard.free(ctx);
        ip.put(&tx, ctx);
        tx.end(ctx);
        return Err(KernelError::IsDirectory);
    }
    let mut dev_major = None;
    if let InodeType::Device { major, .. } = guard.typ {
        if major as usize >= NDEV {
            guard.free(ctx);
            ip.put(&tx, ctx);
            tx.end(ctx);
            return Err(KernelError::NoDevice);
        }
        dev_major = Some(major);
    }

    let readable = omode & O_WRONLY == 0;
    let writable = omode & (O_WRONLY | O_RDWR) != 0;

    // Claim the file slot and an fd before moving the inode in, so a
    // failure here can back out without nesting a transaction.
    let rc = match kernel.ftable.alloc(File::new(FileType::None, readable, writable)) {
        Ok(rc) => rc,
        Err(empty) => {
            drop(empty);
            guard.free(ctx);
            ip.put(&tx, ctx);
            tx.end(ctx);
            return Err(KernelError::TooManyOpen);
        }
    };
    let free_fd = {
        let data = ctx.data();
        data.open_files.iter().position(|f| f.is_none())
    };
    let Some(fd) = free_fd else {
        rc.close(ctx);
        guard.free(ctx);
        ip.put(&tx, ctx);
        tx.end(ctx);
        return Err(KernelError::TooManyOpen);
    };

    if omode & O_TRUNC != 0 && guard.typ == InodeType::File {
        guard.trunc(&tx, ctx);
    }

    let typ = match dev_major {
        Some(major) => FileType::Device { ip, major },
        None => FileType::Inode {
            ip,
            off: UnsafeCell::new(0),
        },
    };
    kernel.ftable.set(&rc, File::new(typ, readable, writable));
    guard.free(ctx);
    tx.end(ctx);

    ctx.data_mut().open_files[fd] = Some(rc);
    Ok(fd)
}

pub fn sys_close(ctx: &KernelCtx) -> Result<usize, KernelError> {
    let fd = argint(ctx, 0);
    if fd < 0 || fd as usize >= NOFILE {
        return Err(KernelError::BadFd);
    }
    let rc = {
        let data = ctx.data_mut();
        data.open_files[fd as usize].take()
    };
    let rc = rc.ok_or(KernelError::BadFd)?;
    rc.close(ctx);
    Ok(0)
}

pub fn sys_dup(ctx: &KernelCtx) -> Result<usize, KernelError> {
    let (fd, _) = argfd(ctx, 0)?;
    let rc = {
        let data = ctx.data();
        data.open_files[fd]
            .as_ref()
            .expect("dup: fd vanished")
            .dup(ctx.kernel())
    };
    fdalloc(ctx, rc)
}

pub fn sys_read(ctx: &KernelCtx) -> Result<usize, KernelError> {
    let (_, file) = argfd(ctx, 0)?;
    let addr = argaddr(ctx, 1);
    let n = argint(ctx, 2);
    if n < 0 {
        return Err(KernelError::Invalid);
    }
    file.read(ctx, addr, n as usize)
}

pub fn sys_write(ctx: &KernelCtx) -> Result<usize, KernelError> {
    let (_, file) = argfd(ctx, 0)?;
    let addr = argaddr(ctx, 1);
    let n = argint(ctx, 2);
    if n < 0 {
        return Err(KernelError::Invalid);
    }
    file.write(ctx, addr, n as usize)
}

pub fn sys_fstat(ctx: &KernelCtx) -> Result<usize, KernelError> {
    let (_, file) = argfd(ctx, 0)?;
    let addr = argaddr(ctx, 1);
    file.stat(ctx, addr)
}

pub fn sys_pipe(ctx: &KernelCtx) -> Result<usize, KernelError> {
    let fdarray = argaddr(ctx, 0);
    let (f0, f1) = Pipe::alloc(ctx)?;

    let fd0 = match fdalloc(ctx, f0) {
        Ok(fd) => fd,
        Err(e) => {
            f1.close(ctx);
            return Err(e);
        }
    };
    let fd1 = match fdalloc(ctx, f1) {
        Ok(fd) => fd,
        Err(e) => {
            let rc = ctx.data_mut().open_files[fd0].take().expect("pipe fd0");
            rc.close(ctx);
            return Err(e);
        }
    };

    let mut bytes = [0u8; 8];
    bytes[..4].copy_from_slice(&(fd0 as i32).to_ne_bytes());
    bytes[4..].copy_from_slice(&(fd1 as i32).to_ne_bytes());
    let copied = ctx
        .data_mut()
        .memory
        .as_mut()
        .expect("pipe: no memory")
        .copy_out(fdarray, &bytes);
    if copied.is_err() {
        for fd in [fd0, fd1] {
            let rc = ctx.data_mut().open_files[fd].take().expect("pipe fds");
            rc.close(ctx);
        }
        return Err(KernelError::Invalid);
    }
    Ok(0)
}

pub fn sys_mkdir(ctx: &KernelCtx) -> Result<usize, KernelError> {
    let path = argstr(ctx, 0)?;
    let tx = ctx.kernel().fs.begin_tx(ctx);
    match create(ctx, &tx, &path, InodeType::Dir) {
        Ok((ip, guard)) => {
            guard.free(ctx);
            ip.put(&tx, ctx);
            tx.end(ctx);
            Ok(0)
        }
        Err(e) => {
            tx.end(ctx);
            Err(e)
        }
    }
}

pub fn sys_mknod(ctx: &KernelCtx) -> Result<usize, KernelError> {
    let path = argstr(ctx, 0)?;
    let major = argint(ctx, 1) as u16;
    let minor = argint(ctx, 2) as u16;
    let tx = ctx.kernel().fs.begin_tx(ctx);
    match create(ctx, &tx, &path, InodeType::Device { major, minor }) {
        Ok((ip, guard)) => {
            guard.free(ctx);
            ip.put(&tx, ctx);
            tx.end(ctx);
            Ok(0)
        }
        Err(e) => {
            tx.end(ctx);
            Err(e)
        }
    }
}

pub fn sys_chdir(ctx: &KernelCtx) -> Result<usize, KernelError> {
    let path = argstr(ctx, 0)?;
    let kernel = ctx.kernel();
    let tx = kernel.fs.begin_tx(ctx);
    let ip = match fs::namei(ctx, &tx, &path) {
        Ok(ip) => ip,
        Err(e) => {
            tx.end(ctx);
            return Err(e);
        }
    };
    let guard = ip.lock(ctx);
    if guard.typ != InodeType::Dir {
        guard.free(ctx);
        ip.put(&tx, ctx);
        tx.end(ctx);
        return Err(KernelError::NotDirectory);
    }
    guard.free(ctx);
    let old = ctx.data_mut().cwd.replace(ip);
    if let Some(old) = old {
        old.put(&tx, ctx);
    }
    tx.end(ctx);
    Ok(0)
}

/// Add a second directory entry for an existing inode.
pub fn sys_link(ctx: &KernelCtx) -> Result<usize, KernelError> {
    let old = argstr(ctx, 0)?;
    let new = argstr(ctx, 1)?;
    let kernel = ctx.kernel();
    let tx = kernel.fs.begin_tx(ctx);

    let ip = match fs::namei_nofollow(ctx, &tx, &old) {
        Ok(ip) => ip,
        Err(e) => {
            tx.end(ctx);
            return Err(e);
        }
    };
    let mut guard = ip.lock(ctx);
    if guard.typ == InodeType::Dir {
        guard.free(ctx);
        ip.put(&tx, ctx);
        tx.end(ctx);
        return Err(KernelError::IsDirectory);
    }
    if guard.nlink == i16::MAX {
        guard.free(ctx);
        ip.put(&tx, ctx);
        tx.end(ctx);
        return Err(KernelError::TooManyLinks);
    }
    guard.nlink += 1;
    guard.update(&tx, ctx);
    guard.free(ctx);

    match link_into(ctx, &tx, &ip, &new) {
        Ok(()) => {
            ip.put(&tx, ctx);
            tx.end(ctx);
            Ok(0)
        }
        Err(e) => {
            let mut guard = ip.lock(ctx);
            guard.nlink -= 1;
            guard.update(&tx, ctx);
            guard.free(ctx);
            ip.put(&tx, ctx);
            tx.end(ctx);
            Err(e)
        }
    }
}

fn link_into(
    ctx: &KernelCtx,
    tx: &FsTransaction<'_>,
    ip: &RcInode,
    new: &[u8],
) -> Result<(), KernelError> {
    let (dp, name) = fs::nameiparent(ctx, tx, new)?;
    let mut dguard = dp.lock(ctx);
    if dp.dev != ip.dev {
        dguard.free(ctx);
        dp.put(tx, ctx);
        return Err(KernelError::Invalid);
    }
    let linked = dguard.dirlink(&name, ip.inum, tx, ctx);
    dguard.free(ctx);
    dp.put(tx, ctx);
    linked
}

pub fn sys_unlink(ctx: &KernelCtx) -> Result<usize, KernelError> {
    let path = argstr(ctx, 0)?;
    let kernel = ctx.kernel();
    let tx = kernel.fs.begin_tx(ctx);

    let (dp, name) = match fs::nameiparent(ctx, &tx, &path) {
        Ok(v) => v,
        Err(e) => {
            tx.end(ctx);
            return Err(e);
        }
    };
    let mut dguard = dp.lock(ctx);

    // Cannot unlink "." or "..".
    if name.as_slice() == b"." || name.as_slice() == b".." {
        dguard.free(ctx);
        dp.put(&tx, ctx);
        tx.end(ctx);
        return Err(KernelError::Invalid);
    }

    let (ip, off) = match dguard.dirlookup(&name, ctx) {
        Ok(v) => v,
        Err(e) => {
            dguard.free(ctx);
            dp.put(&tx, ctx);
            tx.end(ctx);
            return Err(e);
        }
    };
    let mut guard = ip.lock(ctx);
    assert!(guard.nlink >= 1, "unlink: nlink < 1");

    if guard.typ == InodeType::Dir && !guard.is_dir_empty(ctx) {
        guard.free(ctx);
        ip.put(&tx, ctx);
        dguard.free(ctx);
        dp.put(&tx, ctx);
        tx.end(ctx);
        return Err(KernelError::Invalid);
    }

    let zero = Dirent::empty();
    dguard
        .write_kernel(&zero, off, &tx, ctx)
        .expect("unlink: writei");
    if guard.typ == InodeType::Dir {
        // The victim's ".." no longer references dp.
        dguard.nlink -= 1;
        dguard.update(&tx, ctx);
    }
    dguard.free(ctx);
    dp.put(&tx, ctx);

    guard.nlink -= 1;
    guard.update(&tx, ctx);
    guard.free(ctx);
    ip.put(&tx, ctx);

    tx.end(ctx);
    Ok(0)
}

pub fn sys_symlink(ctx: &KernelCtx) -> Result<usize, KernelError> {
    let target = argstr(ctx, 0)?;
    let linkpath = argstr(ctx, 1)?;
    let kernel = ctx.kernel();
    let tx = kernel.fs.begin_tx(ctx);

    let (dp, name) = match fs::nameiparent(ctx, &tx, &linkpath) {
        Ok(v) => v,
        Err(e) => {
            tx.end(ctx);
            return Err(e);
        }
    };
    let mut dguard = dp.lock(ctx);

    if let Ok((existing, _)) = dguard.dirlookup(&name, ctx) {
        existing.put(&tx, ctx);
        dguard.free(ctx);
        dp.put(&tx, ctx);
        tx.end(ctx);
        return Err(KernelError::Exists);
    }

    let ip = match kernel.fs.itable.alloc_inode(dp.dev, InodeType::Symlink, &tx, ctx) {
        Ok(ip) => ip,
        Err(e) => {
            dguard.free(ctx);
            dp.put(&tx, ctx);
            tx.end(ctx);
            return Err(e);
        }
    };
    let mut guard = ip.lock(ctx);
    guard.nlink = 1;
    guard.update(&tx, ctx);

    // The link's content is the target path.
    let written = guard.write_bytes_kernel(&target, 0, &tx, ctx);
    let stored = matches!(written, Ok(n) if n == target.len());
    if !stored || dguard.dirlink(&name, ip.inum, &tx, ctx).is_err() {
        guard.nlink = 0;
        guard.update(&tx, ctx);
        guard.free(ctx);
        ip.put(&tx, ctx);
        dguard.free(ctx);
        dp.put(&tx, ctx);
        tx.end(ctx);
        return Err(KernelError::NoSpace);
    }

    guard.free(ctx);
    ip.put(&tx, ctx);
    dguard.free(ctx);
    dp.put(&tx, ctx);
    tx.end(ctx);
    Ok(0)
}

pub fn sys_readlink(ctx: &KernelCtx) -> Result<usize, KernelError> {
    let path = argstr(ctx, 0)?;
    let buf = argaddr(ctx, 1);
    let n = argint(ctx, 2);
    if n < 0 {
        return Err(KernelError::Invalid);
    }
    let kernel = ctx.kernel();
    let tx = kernel.fs.begin_tx(ctx);

    let ip = match fs::namei_nofollow(ctx, &tx, &path) {
        Ok(ip) => ip,
        Err(e) => {
            tx.end(ctx);
            return Err(e);
        }
    };
    let mut guard = ip.lock(ctx);
    if guard.typ != InodeType::Symlink {
        guard.free(ctx);
        ip.put(&tx, ctx);
        tx.end(ctx);
        return Err(KernelError::Invalid);
    }
    let len = u32::min(guard.size, n as u32);
    let read = guard.read_user(ctx, buf, 0, len);
    guard.free(ctx);
    ip.put(&tx, ctx);
    tx.end(ctx);
    match read {
        Ok(count) if count == len as usize => Ok(count),
        _ => Err(KernelError::Invalid),
    }
}

pub fn sys_exec(ctx: &KernelCtx) -> Result<usize, KernelError> {
    let path = argstr(ctx, 0)?;
    let uargv = argaddr(ctx, 1);

    let mut argv = Vec::new();
    loop {
        if argv.len() > MAXARG {
            return Err(KernelError::Invalid);
        }
        let p = fetch_addr(ctx, uargv + argv.len() * 8)?;
        if p == 0 {
            break;
        }
        argv.push(fetch_str(ctx, UVAddr::new(p as usize))?);
    }
    exec::kexec(ctx, &path, &argv)
}
