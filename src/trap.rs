//! Trap handling: the system-call entry from user mode, the
//! return-to-user checks, and the clock interrupt.
//!
//! On this machine, "returning to user mode" means returning into the
//! user program's code with the killed flag and the hart's preemption
//! flag consulted first — the same two checks the bare-metal trap
//! handler makes before `sret`.

use core::sync::atomic::Ordering;

use crate::cpu;
use crate::kernel::{Kernel, KernelCtx};
use crate::proc::{self, Procstate};
use crate::syscall;

/// A user instruction issued a supervisor call: dispatch it, then run
/// the return-to-user checks.
pub fn user_trap(ctx: &KernelCtx) {
    syscall::syscall(ctx);
    user_trap_ret(ctx);
}

/// The tail of every trap: a killed process dies here, and a hart that
/// was asked to reschedule gives up the CPU.
pub fn user_trap_ret(ctx: &KernelCtx) {
    if ctx.proc().killed() {
        proc::exit(ctx, -1);
    }
    if cpu::current().need_resched.swap(false, Ordering::Relaxed) {
        proc::yield_cpu(ctx);
    }
    if ctx.proc().killed() {
        proc::exit(ctx, -1);
    }
}

/// A point where a clock interrupt may land in user mode. Every
/// simulated user memory access passes through here.
pub fn poll_preempt(ctx: &KernelCtx) {
    if ctx.kernel().hal.halt.is_halted() {
        // The machine is powering off; hand the hart back so its
        // scheduler loop can notice.
        proc::yield_cpu(ctx);
        return;
    }
    if ctx.proc().killed() {
        proc::exit(ctx, -1);
    }
    if cpu::current().need_resched.swap(false, Ordering::Relaxed) {
        proc::yield_cpu(ctx);
    }
}

/// The clock interrupt: advance the tick counter, wake tick sleepers,
/// charge the running processes' time slices, and raise the preemption
/// flag on every busy hart.
pub fn clock_intr(kernel: &'static Kernel) {
    {
        let mut ticks = kernel.ticks.lock();
        *ticks += 1;
        ticks.wakeup(kernel);
    }

    for hart in 0..kernel.ncpu {
        let cpu = &kernel.cpus[hart];
        if let Some(idx) = cpu.running_proc() {
            let p = kernel.procs.proc(idx);
            let mut guard = p.info.lock();
            if guard.state == Procstate::Running {
                kernel.sched.charge_tick(&mut guard);
            }
            drop(guard);
            cpu.need_resched.store(true, Ordering::Relaxed);
        }
    }
    kernel.kick();
}
