//! The scheduler framework.
//!
//! Each hart runs `scheduler_loop`: consult the active policy for a
//! runnable process, lock it, re-verify, mark it running and hand
//! control over; when the process yields, sleeps or exits, control
//! comes back here with the process lock still held. The handoff is a
//! channel rendezvous carrying the lock guard, the hosted rendering of
//! a context switch: the resumed side continues on the same hart, so
//! the interrupt-disable depth and lock ownership move with control.
//!
//! Policies are a tagged variant selected at runtime. A selector only
//! picks; it takes no lock home with it and mutates no process state.

use core::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use array_macro::array;
use arrayvec::ArrayVec;

use crate::cpu::{self, Cpu};
use crate::kernel::{halt_park, Kernel, KernelCtx};
use crate::lock::{Spinlock, SpinlockGuard};
use crate::param::{NMLFQ, NPROC};
use crate::proc::{ProcInfo, Procstate};

/// Control handed to a process: the hart it now runs on, and its own
/// lock, taken by the dispatching scheduler.
pub struct Handoff {
    pub cpu: &'static Cpu,
    pub guard: SpinlockGuard<'static, ProcInfo>,
}

/// Control handed back to a hart's scheduler, with the lock of the
/// process that just stopped running.
pub struct SchedBack {
    pub guard: SpinlockGuard<'static, ProcInfo>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SchedPolicy {
    /// First runnable process in table order, starting after the last
    /// dispatched slot.
    RoundRobin,
    /// Highest static priority; ties broken by table order.
    Priority,
    /// Five-level feedback queue.
    Mlfq,
}

struct Mlfq {
    levels: [ArrayVec<usize, NPROC>; NMLFQ],
}

impl Mlfq {
    fn new() -> Self {
        Self {
            levels: array![_ => ArrayVec::new(); NMLFQ],
        }
    }

    fn enqueue(&mut self, level: usize, idx: usize) {
        if self.levels.iter().any(|q| q.contains(&idx)) {
            return;
        }
        self.levels[level].push(idx);
    }

    fn dequeue(&mut self, idx: usize) {
        for q in self.levels.iter_mut() {
            if let Some(pos) = q.iter().position(|&i| i == idx) {
                q.remove(pos);
                return;
            }
        }
    }

    fn clear(&mut self) {
        for q in self.levels.iter_mut() {
            q.clear();
        }
    }
}

pub struct Scheduler {
    policy: Spinlock<SchedPolicy>,
    /// Last slot dispatched under round-robin.
    rr_cursor: AtomicUsize,
    mlfq: Spinlock<Mlfq>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            policy: Spinlock::new("schedpolicy", SchedPolicy::RoundRobin),
            rr_cursor: AtomicUsize::new(NPROC - 1),
            mlfq: Spinlock::new("mlfq", Mlfq::new()),
        }
    }

    pub fn policy(&self) -> SchedPolicy {
        *self.policy.lock()
    }

    /// Switch the active policy. Entering MLFQ rebuilds the queues
    /// from the processes that can run right now; sleepers join on
    /// wakeup.
    pub fn set_policy(&self, kernel: &Kernel, policy: SchedPolicy) {
        *self.policy.lock() = policy;
        if policy == SchedPolicy::Mlfq {
            self.mlfq.lock().clear();
            for idx in 0..NPROC {
                let p = kernel.procs.proc(idx);
                let guard = p.info.lock();
                if guard.state == Procstate::Runnable || guard.state == Procstate::Running {
                    self.mlfq.lock().enqueue(guard.mlfq_level, idx);
                }
            }
        }
    }

    /// Pick a process for a hart to run. Returns a candidate slot; the
    /// hart re-verifies under the process lock.
    fn select(&self, kernel: &Kernel) -> Option<usize> {
        match self.policy() {
            SchedPolicy::RoundRobin => self.select_round_robin(kernel),
            SchedPolicy::Priority => self.select_priority(kernel),
            SchedPolicy::Mlfq => self.select_mlfq(kernel),
        }
    }

    fn select_round_robin(&self, kernel: &Kernel) -> Option<usize> {
        let start = self.rr_cursor.load(Ordering::Relaxed);
        for off in 1..=NPROC {
            let idx = (start + off) % NPROC;
            let guard = kernel.procs.proc(idx).info.lock();
            if guard.state == Procstate::Runnable {
                drop(guard);
                self.rr_cursor.store(idx, Ordering::Relaxed);
                return Some(idx);
            }
        }
        None
    }

    fn select_priority(&self, kernel: &Kernel) -> Option<usize> {
        let mut best: Option<(usize, u8)> = None;
        for idx in 0..NPROC {
            let guard = kernel.procs.proc(idx).info.lock();
            if guard.state == Procstate::Runnable {
                let priority = guard.priority;
                if best.map_or(true, |(_, b)| priority > b) {
                    best = Some((idx, priority));
                }
            }
        }
        best.map(|(idx, _)| idx)
    }

    fn select_mlfq(&self, kernel: &Kernel) -> Option<usize> {
        // Snapshot the queues so the process locks below never nest
        // inside the queue lock.
        let snapshot: [ArrayVec<usize, NPROC>; NMLFQ] = {
            let mlfq = self.mlfq.lock();
            array![l => mlfq.levels[l].clone(); NMLFQ]
        };
        for level in snapshot.iter() {
            for &idx in level.iter() {
                let guard = kernel.procs.proc(idx).info.lock();
                if guard.state == Procstate::Runnable {
                    return Some(idx);
                }
            }
        }
        None
    }

    /// State-transition hooks keeping the MLFQ queues in step. All are
    /// called with the process lock held.
    pub(crate) fn on_fork(&self, idx: usize, info: &mut ProcInfo) {
        if self.policy() == SchedPolicy::Mlfq {
            self.mlfq.lock().enqueue(info.mlfq_level, idx);
        }
    }

    pub(crate) fn on_yield(&self, idx: usize, info: &mut ProcInfo) {
        if self.policy() == SchedPolicy::Mlfq {
            let mut mlfq = self.mlfq.lock();
            mlfq.dequeue(idx);
            mlfq.enqueue(info.mlfq_level, idx);
        }
    }

    pub(crate) fn on_sleep(&self, idx: usize, _info: &mut ProcInfo) {
        if self.policy() == SchedPolicy::Mlfq {
            self.mlfq.lock().dequeue(idx);
        }
    }

    /// A sleeper coming back is treated as interactive: one level up,
    /// fresh slice, back in its queue.
    pub(crate) fn on_wake(&self, idx: usize, info: &mut ProcInfo) {
        if self.policy() == SchedPolicy::Mlfq {
            if info.mlfq_level > 0 {
                info.mlfq_level -= 1;
            }
            info.time_quantum = 1 << info.mlfq_level;
            info.time_used = 0;
            self.mlfq.lock().enqueue(info.mlfq_level, idx);
        }
    }

    pub(crate) fn on_exit(&self, idx: usize, _info: &mut ProcInfo) {
        if self.policy() == SchedPolicy::Mlfq {
            self.mlfq.lock().dequeue(idx);
        }
    }

    /// Charge one tick against a running process; a consumed slice
    /// drops it one level. The queue move happens at its next yield.
    pub(crate) fn charge_tick(&self, info: &mut ProcInfo) {
        info.time_used += 1;
        if self.policy() == SchedPolicy::Mlfq && info.time_used >= info.time_quantum {
            if info.mlfq_level + 1 < NMLFQ {
                info.mlfq_level += 1;
            }
            info.time_quantum = 1 << info.mlfq_level;
            info.time_used = 0;
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-hart scheduler loop; never returns until poweroff.
pub fn scheduler_loop(kernel: &'static Kernel, hart: usize) {
    let cpu = &kernel.cpus[hart];
    cpu::bind(cpu);
    let (tx, rx) = std::sync::mpsc::channel();
    cpu.set_sched_sender(tx);

    loop {
        // The most recent process may have left interrupts off; open a
        // window so pending device work cannot deadlock the machine.
        cpu.intr_on();
        cpu.intr_off();

        if kernel.hal.halt.is_halted() {
            break;
        }

        let Some(idx) = kernel.sched.select(kernel) else {
            kernel.hal.intr.wait(Duration::from_millis(1));
            continue;
        };

        let p = kernel.procs.proc(idx);
        let mut guard = p.info.lock();
        if guard.state != Procstate::Runnable {
            // Lost a race with another hart; try again.
            continue;
        }
        guard.state = Procstate::Running;
        cpu.set_running_proc(Some(idx));

        // SAFETY: the context sender may be read by the dispatching
        // hart while it holds the process lock.
        let context = unsafe { (*p.data_raw()).context.clone() };
        let Some(context) = context else {
            panic!("scheduler: runnable process without a kernel thread");
        };
        if context.send(Handoff { cpu, guard }).is_err() {
            panic!("scheduler: kernel thread is gone");
        }

        // Runs when the process switches back.
        let back = rx.recv().expect("scheduler: lost handoff");
        cpu.set_running_proc(None);
        drop(back.guard);
    }
}

/// Switch from the current process to its hart's scheduler. The caller
/// holds exactly its own process lock (passed in as `guard`), with the
/// process already moved out of `Running`. Returns the same lock when
/// the process is next dispatched — possibly on a different hart.
pub fn sched(
    ctx: &KernelCtx,
    guard: SpinlockGuard<'static, ProcInfo>,
) -> SpinlockGuard<'static, ProcInfo> {
    let cpu = cpu::current();
    assert!(guard.state != Procstate::Running, "sched running");
    assert_eq!(cpu.noff(), 1, "sched locks");
    assert!(!cpu.intr_get(), "sched interruptible");

    // The saved interrupt state belongs to this kernel thread, not to
    // the hart, so carry it across the suspension.
    let intena = cpu.intena();
    if cpu.sched_sender().send(SchedBack { guard }).is_err() {
        halt_park();
    }
    let handoff = ctx.recv();
    cpu::bind(handoff.cpu);
    handoff.cpu.set_intena(intena);
    handoff.guard
}

/// Hand control back to the hart's scheduler for the last time; the
/// process is a zombie and will never be dispatched again. Unwinds the
/// kernel thread.
pub(crate) fn final_sched(_ctx: &KernelCtx, guard: SpinlockGuard<'static, ProcInfo>) -> ! {
    let cpu = cpu::current();
    assert_eq!(guard.state, Procstate::Zombie, "final_sched");
    assert_eq!(cpu.noff(), 1, "sched locks");
    let _ = cpu.sched_sender().send(SchedBack { guard });
    std::panic::panic_any(crate::trampoline::ProcExit);
}

/// Give up the CPU for one scheduling round.
pub fn yield_cpu(ctx: &KernelCtx) {
    let mut guard = ctx.proc().info.lock();
    ctx.kernel().sched.on_yield(ctx.proc_idx(), &mut guard);
    guard.state = Procstate::Runnable;
    let guard = sched(ctx, guard);
    drop(guard);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mlfq_queue_fifo_and_dedup() {
        let mut q = Mlfq::new();
        q.enqueue(0, 3);
        q.enqueue(0, 5);
        q.enqueue(0, 3); // duplicate, ignored
        assert_eq!(q.levels[0].as_slice(), &[3, 5]);
        q.dequeue(3);
        q.enqueue(1, 3);
        assert_eq!(q.levels[0].as_slice(), &[5]);
        assert_eq!(q.levels[1].as_slice(), &[3]);
        q.dequeue(5);
        q.dequeue(3);
        assert!(q.levels.iter().all(|l| l.is_empty()));
    }

    #[test]
    fn charge_tick_demotes_on_consumed_slice() {
        let sched = Scheduler::new();
        *sched.policy.lock() = SchedPolicy::Mlfq;
        let mut info = ProcInfo {
            state: Procstate::Running,
            chan: 0,
            xstate: 0,
            pid: 1,
            priority: 5,
            mlfq_level: 0,
            time_used: 0,
            time_quantum: 1,
        };
        sched.charge_tick(&mut info);
        assert_eq!(info.mlfq_level, 1);
        assert_eq!(info.time_quantum, 2);
        sched.charge_tick(&mut info);
        assert_eq!(info.mlfq_level, 1, "slice not yet consumed");
        sched.charge_tick(&mut info);
        assert_eq!(info.mlfq_level, 2);
        // The bottom level never falls further.
        info.mlfq_level = NMLFQ - 1;
        info.time_quantum = 1 << (NMLFQ - 1);
        info.time_used = info.time_quantum - 1;
        sched.charge_tick(&mut info);
        assert_eq!(info.mlfq_level, NMLFQ - 1);
    }

    #[test]
    fn wake_promotes_one_level() {
        let sched = Scheduler::new();
        *sched.policy.lock() = SchedPolicy::Mlfq;
        let mut info = ProcInfo {
            state: Procstate::Sleeping,
            chan: 7,
            xstate: 0,
            pid: 1,
            priority: 5,
            mlfq_level: 3,
            time_used: 2,
            time_quantum: 8,
        };
        sched.on_wake(9, &mut info);
        assert_eq!(info.mlfq_level, 2);
        assert_eq!(info.time_quantum, 4);
        assert_eq!(info.time_used, 0);
        assert!(sched.mlfq.lock().levels[2].contains(&9));
    }
}
