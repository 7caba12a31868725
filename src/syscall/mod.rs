//! System-call dispatch.
//!
//! Calls are numbered from 1 in a contiguous range; the trap handler
//! routes here with the number in a7 and the arguments in a0–a5.
//! Arguments are pulled out of the trap frame by position as typed
//! temporaries; string and pointer arguments are validated by the copy
//! primitives that consume them, not here.
//!
//! On the way out, an error stores its code in the process's
//! last-error slot and hands -1 to user space; success clears the slot
//! (except for `geterrno` itself, which must be re-readable) and hands
//! back the raw value.

mod file;
mod proc;

pub use file::{O_CREATE, O_RDONLY, O_RDWR, O_TRUNC, O_WRONLY};

use arrayvec::ArrayVec;

use crate::addr::UVAddr;
use crate::errno::KernelError;
use crate::kernel::KernelCtx;
use crate::kprintln;
use crate::param::MAXPATH;

pub const SYS_FORK: u64 = 1;
pub const SYS_EXIT: u64 = 2;
pub const SYS_WAIT: u64 = 3;
pub const SYS_PIPE: u64 = 4;
pub const SYS_READ: u64 = 5;
pub const SYS_KILL: u64 = 6;
pub const SYS_EXEC: u64 = 7;
pub const SYS_FSTAT: u64 = 8;
pub const SYS_CHDIR: u64 = 9;
pub const SYS_DUP: u64 = 10;
pub const SYS_GETPID: u64 = 11;
pub const SYS_SBRK: u64 = 12;
pub const SYS_PAUSE: u64 = 13;
pub const SYS_UPTIME: u64 = 14;
pub const SYS_OPEN: u64 = 15;
pub const SYS_WRITE: u64 = 16;
pub const SYS_MKNOD: u64 = 17;
pub const SYS_UNLINK: u64 = 18;
pub const SYS_LINK: u64 = 19;
pub const SYS_MKDIR: u64 = 20;
pub const SYS_CLOSE: u64 = 21;
pub const SYS_SETPRIORITY: u64 = 22;
pub const SYS_GETPRIORITY: u64 = 23;
pub const SYS_GETERRNO: u64 = 24;
pub const SYS_SET_SCHEDULER: u64 = 25;
pub const SYS_SYMLINK: u64 = 26;
pub const SYS_READLINK: u64 = 27;

/// `sbrk` allocation modes.
pub const SBRK_EAGER: u32 = 0;
pub const SBRK_LAZY: u32 = 1;

/// The dispatcher.
pub fn syscall(ctx: &KernelCtx) {
    let num = ctx.trap_frame().a[7];
    let result = dispatch(ctx, num);
    match result {
        Ok(value) => {
            if num != SYS_GETERRNO {
                ctx.data_mut().errno = 0;
            }
            ctx.trap_frame_mut().a[0] = value as u64;
        }
        Err(e) => {
            ctx.data_mut().errno = e.code();
            ctx.trap_frame_mut().a[0] = u64::MAX; // -1
        }
    }
}

fn dispatch(ctx: &KernelCtx, num: u64) -> Result<usize, KernelError> {
    match num {
        SYS_FORK => proc::sys_fork(ctx),
        SYS_EXIT => proc::sys_exit(ctx),
        SYS_WAIT => proc::sys_wait(ctx),
        SYS_PIPE => file::sys_pipe(ctx),
        SYS_READ => file::sys_read(ctx),
        SYS_KILL => proc::sys_kill(ctx),
        SYS_EXEC => file::sys_exec(ctx),
        SYS_FSTAT => file::sys_fstat(ctx),
        SYS_CHDIR => file::sys_chdir(ctx),
        SYS_DUP => file::sys_dup(ctx),
        SYS_GETPID => proc::sys_getpid(ctx),
        SYS_SBRK => proc::sys_sbrk(ctx),
        SYS_PAUSE => proc::sys_pause(ctx),
        SYS_UPTIME => proc::sys_uptime(ctx),
        SYS_OPEN => file::sys_open(ctx),
        SYS_WRITE => file::sys_write(ctx),
        SYS_MKNOD => file::sys_mknod(ctx),
        SYS_UNLINK => file::sys_unlink(ctx),
        SYS_LINK => file::sys_link(ctx),
        SYS_MKDIR => file::sys_mkdir(ctx),
        SYS_CLOSE => file::sys_close(ctx),
        SYS_SETPRIORITY => proc::sys_setpriority(ctx),
        SYS_GETPRIORITY => proc::sys_getpriority(ctx),
        SYS_GETERRNO => proc::sys_geterrno(ctx),
        SYS_SET_SCHEDULER => proc::sys_set_scheduler(ctx),
        SYS_SYMLINK => file::sys_symlink(ctx),
        SYS_READLINK => file::sys_readlink(ctx),
        _ => {
            kprintln!(
                ctx.kernel(),
                "{} {}: unknown sys call {}",
                ctx.pid(),
                ctx.data().name_str(),
                num
            );
            Err(KernelError::NotImplemented)
        }
    }
}

/// Raw n'th argument register.
fn argraw(ctx: &KernelCtx, n: usize) -> u64 {
    assert!(n < 6, "argraw");
    ctx.trap_frame().a[n]
}

/// The n'th argument as a 32-bit integer.
pub fn argint(ctx: &KernelCtx, n: usize) -> i32 {
    argraw(ctx, n) as i32
}

/// The n'th argument as a 64-bit integer.
pub fn arglong(ctx: &KernelCtx, n: usize) -> i64 {
    argraw(ctx, n) as i64
}

/// The n'th argument as a user address. Not validated here; the copy
/// primitives that use it will reject bad addresses.
pub fn argaddr(ctx: &KernelCtx, n: usize) -> UVAddr {
    UVAddr::new(argraw(ctx, n) as usize)
}

/// The n'th argument as a NUL-terminated user string.
pub fn argstr(ctx: &KernelCtx, n: usize) -> Result<ArrayVec<u8, MAXPATH>, KernelError> {
    fetch_str(ctx, argaddr(ctx, n))
}

/// Copy a NUL-terminated string from user memory.
pub fn fetch_str(ctx: &KernelCtx, addr: UVAddr) -> Result<ArrayVec<u8, MAXPATH>, KernelError> {
    let mut buf = [0u8; MAXPATH];
    let len = ctx
        .data_mut()
        .memory
        .as_mut()
        .expect("fetch_str: no memory")
        .copy_in_str(&mut buf, addr)
        .map_err(|e| {
            if e == KernelError::NameTooLong {
                e
            } else {
                KernelError::Invalid
            }
        })?;
    let mut out = ArrayVec::new();
    out.try_extend_from_slice(&buf[..len]).unwrap();
    Ok(out)
}

/// Read a u64 from user memory, with the address-space bounds check.
pub fn fetch_addr(ctx: &KernelCtx, addr: UVAddr) -> Result<u64, KernelError> {
    let memory = ctx.data_mut().memory.as_mut().expect("fetch_addr: no memory");
    if addr.value() >= memory.size() || addr.value() + 8 > memory.size() {
        return Err(KernelError::Invalid);
    }
    let mut bytes = [0u8; 8];
    memory
        .copy_in(&mut bytes, addr)
        .map_err(|_| KernelError::Invalid)?;
    Ok(u64::from_ne_bytes(bytes))
}
