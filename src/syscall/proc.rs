//! Process-related system calls.

use super::{argint, arglong, argaddr, SBRK_EAGER, SYS_GETERRNO};
use crate::errno::KernelError;
use crate::kernel::KernelCtx;
use crate::proc::{self, SchedPolicy};

pub fn sys_fork(ctx: &KernelCtx) -> Result<usize, KernelError> {
    proc::fork(ctx)
}

pub fn sys_exit(ctx: &KernelCtx) -> Result<usize, KernelError> {
    let status = argint(ctx, 0);
    proc::exit(ctx, status)
}

pub fn sys_wait(ctx: &KernelCtx) -> Result<usize, KernelError> {
    let addr = argaddr(ctx, 0);
    proc::wait(ctx, addr)
}

pub fn sys_kill(ctx: &KernelCtx) -> Result<usize, KernelError> {
    let pid = argint(ctx, 0);
    proc::kill(ctx.kernel(), pid)
}

pub fn sys_getpid(ctx: &KernelCtx) -> Result<usize, KernelError> {
    Ok(ctx.pid() as usize)
}

/// Grow or shrink the heap. The second argument selects eager or lazy
/// allocation; shrinking is always immediate. Returns the old break.
pub fn sys_sbrk(ctx: &KernelCtx) -> Result<usize, KernelError> {
    let n = arglong(ctx, 0);
    let mode = argint(ctx, 1) as u32;
    let eager = mode == SBRK_EAGER || n < 0;
    proc::grow(ctx, n, eager)
}

/// Sleep for a number of clock ticks.
pub fn sys_pause(ctx: &KernelCtx) -> Result<usize, KernelError> {
    let n = argint(ctx, 0).max(0) as u64;
    let mut ticks = ctx.kernel().ticks.lock();
    let start = *ticks;
    while *ticks - start < n {
        if ctx.proc().killed() {
            return Err(KernelError::Invalid);
        }
        ticks.sleep(ctx);
    }
    Ok(0)
}

pub fn sys_uptime(ctx: &KernelCtx) -> Result<usize, KernelError> {
    Ok(*ctx.kernel().ticks.lock() as usize)
}

pub fn sys_setpriority(ctx: &KernelCtx) -> Result<usize, KernelError> {
    let pid = argint(ctx, 0);
    let priority = argint(ctx, 1);
    proc::set_priority(ctx, pid, priority)
}

pub fn sys_getpriority(ctx: &KernelCtx) -> Result<usize, KernelError> {
    let pid = argint(ctx, 0);
    proc::get_priority(ctx, pid)
}

/// The stored last-error code. The dispatcher leaves it alone for this
/// call, so repeated reads agree.
pub fn sys_geterrno(ctx: &KernelCtx) -> Result<usize, KernelError> {
    debug_assert_eq!(ctx.trap_frame().a[7], SYS_GETERRNO);
    Ok(ctx.data().errno as usize)
}

/// Switch the scheduling policy: 0 round-robin, 1 priority, 2 MLFQ.
pub fn sys_set_scheduler(ctx: &KernelCtx) -> Result<usize, KernelError> {
    let kind = argint(ctx, 0);
    let policy = match kind {
        0 => SchedPolicy::RoundRobin,
        1 => SchedPolicy::Priority,
        2 => SchedPolicy::Mlfq,
        _ => return Err(KernelError::Invalid),
    };
    ctx.kernel().sched.set_policy(ctx.kernel(), policy);
    Ok(0)
}
