//! Processes.
//!
//! Each process is one slot of a fixed table. Its control block is
//! split the way the locking rules cut it: `ProcInfo` holds everything
//! other harts may look at and is guarded by the per-process spin
//! lock; `ProcData` is private to the process's own kernel thread;
//! `parent` is guarded by the table-wide `wait_lock`, which is always
//! acquired before any process lock.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::addr::{PAddr, PGSIZE};
use crate::file::RcFile;
use crate::fs::RcInode;
use crate::lock::Spinlock;
use crate::param::{DEFAULT_PRIORITY, MAXPROCNAME, NOFILE, NPROC};
use crate::vm::{UserMemory, TRAMPOLINE};

mod procs;
mod scheduler;
mod wait_channel;

pub use procs::{
    exit, fork, get_priority, grow, kill, proc_chan, procdump, set_priority, user_init, wait,
    wakeup, Procs,
};
pub use scheduler::{
    scheduler_loop, sched, yield_cpu, Handoff, SchedBack, SchedPolicy, Scheduler,
};
pub use wait_channel::{sleep_on, WaitChannel};

pub type Pid = i32;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Procstate {
    Unused,
    Used,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

impl Procstate {
    pub fn as_str(self) -> &'static str {
        match self {
            Procstate::Unused => "unused",
            Procstate::Used => "used",
            Procstate::Sleeping => "sleep",
            Procstate::Runnable => "runble",
            Procstate::Running => "run",
            Procstate::Zombie => "zombie",
        }
    }
}

/// Fields guarded by the process's spin lock.
pub struct ProcInfo {
    pub state: Procstate,

    /// If nonzero, sleeping on this channel.
    pub chan: usize,

    /// Exit status to be returned to parent's wait.
    pub xstate: i32,

    pub pid: Pid,

    /// Static scheduling priority, 0..=9; larger runs first under the
    /// priority policy.
    pub priority: u8,

    /// MLFQ level, 0 (highest) .. NMLFQ-1.
    pub mlfq_level: usize,

    /// Ticks consumed of the current time slice.
    pub time_used: u32,

    /// Length of the current time slice, 2^level ticks.
    pub time_quantum: u32,
}

impl ProcInfo {
    const fn new() -> Self {
        Self {
            state: Procstate::Unused,
            chan: 0,
            xstate: 0,
            pid: 0,
            priority: DEFAULT_PRIORITY,
            mlfq_level: 0,
            time_used: 0,
            time_quantum: 1,
        }
    }
}

/// The user register file, stored in the process's trap-frame page.
/// `epc` names the program image the process resumes in; `a[0..=5]`
/// carry syscall arguments, `a[7]` the syscall number, and `a[0]` the
/// return value on the way back out.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TrapFrame {
    pub epc: u64,
    pub sp: u64,
    pub a: [u64; 8],
}

impl TrapFrame {
    pub const fn zero() -> Self {
        Self {
            epc: 0,
            sp: 0,
            a: [0; 8],
        }
    }
}

/// Fields private to the process; its own kernel thread is the only
/// context that touches them, so no lock is held.
pub struct ProcData {
    /// Virtual address of the kernel stack (fixed per slot, with a
    /// guard page above).
    pub kstack: usize,

    /// Frame holding the trap-frame page, or null.
    pub trap_frame: PAddr,

    pub memory: Option<UserMemory>,

    /// Channel the scheduler resumes this process's kernel thread
    /// through. Read by the dispatching hart under the process lock.
    pub(crate) context: Option<std::sync::mpsc::Sender<Handoff>>,

    pub open_files: [Option<RcFile>; NOFILE],

    pub cwd: Option<RcInode>,

    /// Process name (debugging).
    pub name: [u8; MAXPROCNAME],

    /// Last error of a system call, readable via `geterrno`.
    pub errno: u32,
}

impl ProcData {
    fn new(idx: usize) -> Self {
        const NONE_FILE: Option<RcFile> = None;
        Self {
            kstack: kstack_va(idx),
            trap_frame: PAddr::NULL,
            memory: None,
            context: None,
            open_files: [NONE_FILE; NOFILE],
            cwd: None,
            name: [0; MAXPROCNAME],
            errno: 0,
        }
    }

    pub fn set_name(&mut self, name: &[u8]) {
        self.name = [0; MAXPROCNAME];
        let n = usize::min(name.len(), MAXPROCNAME - 1);
        self.name[..n].copy_from_slice(&name[..n]);
    }

    pub fn name_str(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(0);
        core::str::from_utf8(&self.name[..len]).unwrap_or("?")
    }
}

/// Kernel stack slots grow down from just under the trampoline, one
/// page each with a guard page between.
const fn kstack_va(idx: usize) -> usize {
    TRAMPOLINE - (idx + 1) * 2 * PGSIZE
}

/// Per-process state.
pub struct Proc {
    idx: usize,

    pub info: Spinlock<ProcInfo>,

    data: UnsafeCell<ProcData>,

    /// Slot index of the parent, or NPROC for none. Guarded by the
    /// table's `wait_lock`, not by this process's own lock.
    parent: UnsafeCell<usize>,

    /// If true, the process has been killed and should give up at the
    /// next trap boundary.
    killed: AtomicBool,
}

// SAFETY: `info` is behind its spin lock; `data` is only touched by
// the process's own kernel thread, by `alloc_proc`/`free_proc` while
// the slot has no thread, and by the dispatching hart under the
// process lock (the context sender); `parent` is guarded by wait_lock.
unsafe impl Sync for Proc {}

impl Proc {
    fn new(idx: usize) -> Self {
        Self {
            idx,
            info: Spinlock::new("proc", ProcInfo::new()),
            data: UnsafeCell::new(ProcData::new(idx)),
            parent: UnsafeCell::new(NPROC),
            killed: AtomicBool::new(false),
        }
    }

    pub fn slot(&self) -> usize {
        self.idx
    }

    /// The process's pid. Stable for as long as the slot is not
    /// recycled, which callers ensure by holding a reference to the
    /// running process.
    pub fn pid(&self) -> Pid {
        // SAFETY: pid only changes while the slot is Unused.
        unsafe { (*self.info.get_mut_raw()).pid }
    }

    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::Relaxed)
    }

    pub fn set_killed(&self) {
        self.killed.store(true, Ordering::Relaxed);
    }

    pub(crate) fn clear_killed(&self) {
        self.killed.store(false, Ordering::Relaxed);
    }

    /// Raw access to the private data; see the `Sync` safety comment
    /// for who may use this.
    pub(crate) fn data_raw(&self) -> *mut ProcData {
        self.data.get()
    }

    /// Raw access to the parent slot; callers hold `wait_lock` (or own
    /// a slot no one else can see yet).
    pub(crate) fn parent_raw(&self) -> *mut usize {
        self.parent.get()
    }
}
