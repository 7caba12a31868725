//! The kernel aggregate and the per-context handle.
//!
//! One `Kernel` owns every subsystem of one machine. It is leaked at
//! boot so all internal references are `'static`; nothing in the crate
//! reaches it ambiently — every path threads a `&Kernel` or a
//! `KernelCtx`, the handle a process's kernel thread carries.

use core::sync::atomic::AtomicBool;
use std::sync::mpsc::Receiver;

use crate::addr::PAddr;
use crate::bio::Bcache;
use crate::console::Console;
use crate::cpu::Cpu;
use crate::exec::ProgramRegistry;
use crate::file::FTable;
use crate::fs::FileSystem;
use crate::hal::Hal;
use crate::kalloc::Mm;
use crate::lock::{Sleepablelock, Spinlock};
use crate::param::NCPU;
use crate::proc::{Handoff, Pid, Proc, ProcData, Procs, Scheduler, TrapFrame};
use crate::sync::SyncPools;

use array_macro::array;

pub struct Kernel {
    pub hal: Hal,
    pub mm: Mm,
    /// Clock ticks since boot. Sleepers on the tick channel are woken
    /// by the clock interrupt.
    pub ticks: Sleepablelock<u64>,
    pub procs: Procs,
    pub sched: Scheduler,
    pub cpus: [Cpu; NCPU],
    /// Harts actually running on this machine (a prefix of `cpus`).
    pub ncpu: usize,
    pub bcache: Bcache,
    pub fs: FileSystem,
    pub ftable: FTable,
    pub console: Console,
    /// Serializes kernel console output.
    pub printer: Spinlock<()>,
    pub sync: SyncPools,
    pub programs: ProgramRegistry,
    /// Shared read-only page mapped at the top of every address space.
    pub trampoline: PAddr,
    /// The first scheduled process mounts the file system.
    pub(crate) fs_started: AtomicBool,
}

impl Kernel {
    pub fn new(hal: Hal, ncpu: usize) -> Kernel {
        let mm = Mm::new(hal.ram);
        let trampoline = mm
            .kmem
            .lock()
            .alloc()
            .expect("boot: no frame for trampoline");
        Kernel {
            hal,
            mm,
            ticks: Sleepablelock::new("time", 0),
            procs: Procs::new(),
            sched: Scheduler::new(),
            cpus: array![i => Cpu::new(i); NCPU],
            ncpu,
            bcache: Bcache::new(),
            fs: FileSystem::new(),
            ftable: FTable::new(),
            console: Console::new(),
            printer: Spinlock::new("pr", ()),
            sync: SyncPools::new(),
            programs: ProgramRegistry::new(),
            trampoline,
            fs_started: AtomicBool::new(false),
        }
    }

    /// Halt the machine. The hart loops notice on their next pass.
    pub fn poweroff(&self, code: i32) {
        self.hal.halt.poweroff(code);
        self.hal.intr.kick();
    }

    /// Nudge idle harts; called whenever a process may have become
    /// runnable.
    pub fn kick(&self) {
        self.hal.intr.kick();
    }
}

/// The execution context of one process's kernel thread: the kernel it
/// belongs to, the process it runs as, and the channel the scheduler
/// resumes it through.
pub struct KernelCtx {
    kernel: &'static Kernel,
    proc_idx: usize,
    inbox: Receiver<Handoff>,
}

impl KernelCtx {
    pub(crate) fn new(kernel: &'static Kernel, proc_idx: usize, inbox: Receiver<Handoff>) -> Self {
        Self {
            kernel,
            proc_idx,
            inbox,
        }
    }

    pub fn kernel(&self) -> &'static Kernel {
        self.kernel
    }

    pub fn proc(&self) -> &'static Proc {
        self.kernel.procs.proc(self.proc_idx)
    }

    pub fn proc_idx(&self) -> usize {
        self.proc_idx
    }

    pub fn pid(&self) -> Pid {
        self.proc().pid()
    }

    /// Block until the scheduler hands control back. If the machine is
    /// tearing down instead, the thread parks forever.
    pub(crate) fn recv(&self) -> Handoff {
        match self.inbox.recv() {
            Ok(handoff) => handoff,
            Err(_) => halt_park(),
        }
    }

    /// The process's private data. Only its own kernel thread touches
    /// it, so no lock is involved.
    pub fn data(&self) -> &ProcData {
        // SAFETY: ProcData is private to the process and this context
        // belongs to its one kernel thread.
        unsafe { &*self.proc().data_raw() }
    }

    /// Mutable view of the process's private data. Callers keep the
    /// borrow short and never hold two at once.
    #[allow(clippy::mut_from_ref)]
    pub fn data_mut(&self) -> &mut ProcData {
        // SAFETY: as in `data`.
        unsafe { &mut *self.proc().data_raw() }
    }

    /// The user register file, stored in the process's trap-frame page.
    pub fn trap_frame(&self) -> &TrapFrame {
        let pa = self.data().trap_frame;
        assert!(!pa.is_null(), "trap_frame: none");
        // SAFETY: the trap-frame page belongs to this process; user
        // code cannot touch it (no U mapping) and only this thread
        // reaches it from the kernel side.
        unsafe { &*(self.kernel.mm.ram.ptr(pa) as *const TrapFrame) }
    }

    #[allow(clippy::mut_from_ref)]
    pub fn trap_frame_mut(&self) -> &mut TrapFrame {
        let pa = self.data().trap_frame;
        assert!(!pa.is_null(), "trap_frame: none");
        // SAFETY: as in `trap_frame`.
        unsafe { &mut *(self.kernel.mm.ram.ptr(pa) as *mut TrapFrame) }
    }
}

/// Park a kernel thread that outlived its machine.
pub(crate) fn halt_park() -> ! {
    loop {
        std::thread::park();
    }
}
