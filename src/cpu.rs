//! Per-hart state.
//!
//! A `Cpu` record models one hart: the interrupt-disable nesting depth
//! used by the spin locks, the saved pre-disable interrupt state, the
//! simulated interrupt-enable bit, the preemption flag raised by the
//! clock, and the process currently dispatched on it.
//!
//! Exactly one kernel context executes on a hart at a time — the hart's
//! scheduler loop, or the process it handed control to — so these
//! fields are only ever touched by the context that currently owns the
//! hart. The fields are atomics with relaxed ordering purely so the
//! record can be shared as `&'static Cpu`; the handoff channel is the
//! synchronization point.
//!
//! Threads that are not harts (the timer, the boot thread, test
//! threads poking at the machine) model interrupt or firmware
//! contexts; each gets a private detached record so the spin-lock
//! accounting is uniform.

use core::cell::Cell;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::mpsc::Sender;
use std::sync::OnceLock;

use crate::param::NPROC;
use crate::proc::SchedBack;

pub struct Cpu {
    pub id: usize,

    /// Depth of push_off() nesting.
    noff: AtomicI32,

    /// Were interrupts enabled before the first push_off()?
    intena: AtomicBool,

    /// Simulated interrupt-enable bit (SSTATUS.SIE).
    sie: AtomicBool,

    /// Set by the clock; consumed at the next return to user mode.
    pub need_resched: AtomicBool,

    /// Slot of the process running on this hart, or NPROC.
    proc_idx: AtomicUsize,

    /// Channel back into this hart's scheduler loop.
    sched_tx: OnceLock<Sender<SchedBack>>,
}

impl Cpu {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            noff: AtomicI32::new(0),
            intena: AtomicBool::new(false),
            sie: AtomicBool::new(false),
            need_resched: AtomicBool::new(false),
            proc_idx: AtomicUsize::new(NPROC),
            sched_tx: OnceLock::new(),
        }
    }

    pub fn set_sched_sender(&self, tx: Sender<SchedBack>) {
        if self.sched_tx.set(tx).is_err() {
            panic!("cpu{}: scheduler sender set twice", self.id);
        }
    }

    /// Clone of the channel into this hart's scheduler. Panics before
    /// the hart thread has started.
    pub fn sched_sender(&self) -> Sender<SchedBack> {
        self.sched_tx.get().expect("cpu: no scheduler").clone()
    }

    pub fn running_proc(&self) -> Option<usize> {
        match self.proc_idx.load(Ordering::Relaxed) {
            NPROC => None,
            idx => Some(idx),
        }
    }

    pub fn set_running_proc(&self, idx: Option<usize>) {
        self.proc_idx.store(idx.unwrap_or(NPROC), Ordering::Relaxed);
    }

    pub fn noff(&self) -> i32 {
        self.noff.load(Ordering::Relaxed)
    }

    pub fn intena(&self) -> bool {
        self.intena.load(Ordering::Relaxed)
    }

    pub fn set_intena(&self, on: bool) {
        self.intena.store(on, Ordering::Relaxed);
    }

    pub fn intr_on(&self) {
        self.sie.store(true, Ordering::Relaxed);
    }

    pub fn intr_off(&self) {
        self.sie.store(false, Ordering::Relaxed);
    }

    pub fn intr_get(&self) -> bool {
        self.sie.load(Ordering::Relaxed)
    }
}

std::thread_local! {
    static CURRENT: Cell<Option<&'static Cpu>> = const { Cell::new(None) };
}

/// Bind the calling thread to a hart. Called by the hart's scheduler
/// loop at startup and by a process's kernel thread each time control
/// is handed to it.
pub fn bind(cpu: &'static Cpu) {
    CURRENT.with(|c| c.set(Some(cpu)));
}

/// The hart the calling context runs on. A thread that is not bound to
/// a hart (timer, boot) gets a private detached record on first use.
pub fn current() -> &'static Cpu {
    CURRENT.with(|c| match c.get() {
        Some(cpu) => cpu,
        None => {
            let cpu: &'static Cpu = Box::leak(Box::new(Cpu::new(usize::MAX)));
            c.set(Some(cpu));
            cpu
        }
    })
}

/// push_off/pop_off are like intr_off()/intr_on() except that they are
/// matched: it takes two pop_off()s to undo two push_off()s. Also, if
/// interrupts are initially off, then push_off, pop_off leaves them off.
pub fn push_off() {
    let cpu = current();
    let old = cpu.intr_get();
    cpu.intr_off();
    if cpu.noff() == 0 {
        cpu.set_intena(old);
    }
    cpu.noff.fetch_add(1, Ordering::Relaxed);
}

/// pop_off() should be paired with push_off().
pub fn pop_off() {
    let cpu = current();
    assert!(!cpu.intr_get(), "pop_off - interruptible");
    assert!(cpu.noff() >= 1, "pop_off");
    cpu.noff.fetch_sub(1, Ordering::Relaxed);
    if cpu.noff() == 0 && cpu.intena() {
        cpu.intr_on();
    }
}
