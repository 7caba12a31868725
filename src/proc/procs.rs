//! The process table and the lifecycle operations: allocation, the
//! first process, fork, exit, wait, kill, wakeup, and address-space
//! growth.

use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::Receiver;

use array_macro::array;

use crate::addr::{PAddr, UVAddr};
use crate::cpu;
use crate::errno::KernelError;
use crate::kernel::{Kernel, KernelCtx};
use crate::lock::{Spinlock, SpinlockGuard};
use crate::param::{NOFILE, NPROC, ROOTDEV};
use crate::proc::{scheduler, Handoff, Pid, Proc, ProcInfo, Procstate, SchedPolicy, TrapFrame};
use crate::trampoline::{self, ProcExit};
use crate::vm::{UserMemory, TRAPFRAME};
use crate::{fs, kprintln};

/// The fixed process table plus the globals that govern it: the
/// `wait_lock` guarding every parent link (always taken before any
/// process lock), and the pid counter.
pub struct Procs {
    pool: [Proc; NPROC],
    pub(crate) wait_lock: Spinlock<()>,
    nextpid: Spinlock<Pid>,
    init_idx: AtomicUsize,
}

impl Procs {
    pub fn new() -> Self {
        Self {
            pool: array![i => Proc::new(i); NPROC],
            wait_lock: Spinlock::new("wait_lock", ()),
            nextpid: Spinlock::new("nextpid", 1),
            init_idx: AtomicUsize::new(NPROC),
        }
    }

    pub fn proc(&self, idx: usize) -> &Proc {
        &self.pool[idx]
    }

    pub fn init_idx(&self) -> usize {
        self.init_idx.load(Ordering::Relaxed)
    }

    fn alloc_pid(&self) -> Pid {
        let mut next = self.nextpid.lock();
        let pid = *next;
        *next += 1;
        pid
    }
}

impl Default for Procs {
    fn default() -> Self {
        Self::new()
    }
}

/// Sleep-channel token for waiting on a particular process (used by
/// `wait`/`exit`).
pub fn proc_chan(p: &Proc) -> usize {
    p as *const Proc as usize
}

/// Claim a free slot: scan the table, locking each slot to test it.
/// On success the slot is `Used`, has a pid, a zeroed trap-frame page
/// and a parked kernel thread, and its lock is still held.
fn alloc_proc(
    kernel: &'static Kernel,
) -> Result<(usize, SpinlockGuard<'static, ProcInfo>), KernelError> {
    for idx in 0..NPROC {
        let p = kernel.procs.proc(idx);
        let mut guard = p.info.lock();
        if guard.state != Procstate::Unused {
            continue;
        }

        guard.pid = kernel.procs.alloc_pid();
        guard.state = Procstate::Used;
        guard.priority = crate::param::DEFAULT_PRIORITY;
        guard.mlfq_level = 0;
        guard.time_used = 0;
        guard.time_quantum = 1;
        guard.xstate = 0;
        p.clear_killed();

        let Some(tf) = kernel.mm.kmem.lock().alloc() else {
            free_proc(kernel, idx, &mut guard);
            return Err(KernelError::NoMemory);
        };
        let (tx, rx) = std::sync::mpsc::channel();
        {
            // SAFETY: the slot was Unused, so no kernel thread exists
            // for it; we are the only context touching its data.
            let data = unsafe { &mut *p.data_raw() };
            data.trap_frame = tf;
            data.errno = 0;
            data.context = Some(tx);
        }
        // SAFETY: we own the fresh frame; TrapFrame is plain words.
        unsafe { ptr::write(kernel.mm.ram.ptr(tf) as *mut TrapFrame, TrapFrame::zero()) };

        let spawned = std::thread::Builder::new()
            .name(format!("proc{}", idx))
            .spawn(move || kernel_thread(kernel, idx, rx));
        if spawned.is_err() {
            free_proc(kernel, idx, &mut guard);
            return Err(KernelError::NoMemory);
        }

        return Ok((idx, guard));
    }
    Err(KernelError::NoMemory)
}

/// Release everything a dead (or never-started) process holds and
/// return the slot to `Unused`. Caller holds the process lock.
fn free_proc(kernel: &Kernel, idx: usize, guard: &mut SpinlockGuard<'static, ProcInfo>) {
    let p = kernel.procs.proc(idx);
    // SAFETY: the process is a zombie being reaped (its thread has
    // exited) or was never started; either way no other context can
    // touch its data.
    let data = unsafe { &mut *p.data_raw() };
    if !data.trap_frame.is_null() {
        kernel.mm.kmem.lock().free(data.trap_frame);
        data.trap_frame = PAddr::NULL;
    }
    drop(data.memory.take());
    data.context = None;
    data.name = [0; crate::param::MAXPROCNAME];
    data.errno = 0;
    debug_assert!(data.open_files.iter().all(|f| f.is_none()));
    debug_assert!(data.cwd.is_none());
    // SAFETY: either reaped under wait_lock, or never linked.
    unsafe { *p.parent_raw() = NPROC };
    p.clear_killed();
    guard.chan = 0;
    guard.pid = 0;
    guard.xstate = 0;
    guard.state = Procstate::Unused;
}

/// Body of every process's kernel thread. Parks until the scheduler
/// first dispatches it, then plays the role of forkret: release the
/// lock inherited from the scheduler, mount the file system if this is
/// the first process ever to run, and fall into user mode.
fn kernel_thread(kernel: &'static Kernel, idx: usize, inbox: Receiver<Handoff>) {
    let ctx = KernelCtx::new(kernel, idx, inbox);
    let first = ctx.recv();
    cpu::bind(first.cpu);
    // Still holding our own lock, inherited from the dispatching
    // scheduler; release it before doing anything that can sleep.
    drop(first.guard);

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        if !kernel.fs_started.swap(true, Ordering::AcqRel) {
            // The file system needs a process context to mount, which
            // is why it happens here and not at boot.
            fs::fs_init(kernel, ROOTDEV, &ctx);
        }
        trampoline::user_ret(&ctx);
    }));
    match result {
        Ok(()) => unreachable!("user_ret returned"),
        Err(payload) if payload.is::<ProcExit>() => (),
        Err(_) => {
            // A kernel panic on this context. Flag the machine, then
            // hand the hart back so the harness can reap it.
            kernel.hal.halt.panic_halt();
            let p = kernel.procs.proc(idx);
            let mut guard = p.info.lock();
            guard.state = Procstate::Zombie;
            let _ = cpu::current().sched_sender().send(crate::proc::SchedBack { guard });
        }
    }
}

/// The first process. Runs the registered program at `path` with the
/// root directory as its working directory.
pub fn user_init(kernel: &'static Kernel, path: &str) {
    let (idx, mut guard) = alloc_proc(kernel).expect("user_init: out of processes");
    kernel.procs.init_idx.store(idx, Ordering::Relaxed);

    let prog = kernel
        .programs
        .lookup(path.as_bytes())
        .expect("user_init: init program not registered");

    let p = kernel.procs.proc(idx);
    // SAFETY: fresh slot, no thread has been dispatched yet.
    let data = unsafe { &mut *p.data_raw() };
    data.set_name(b"init");
    data.cwd = Some(kernel.fs.itable.get_inode(ROOTDEV, fs::ROOTINO));

    let mut memory = UserMemory::new(&kernel.mm, kernel.trampoline, data.trap_frame)
        .expect("user_init: no memory");
    memory
        .alloc(trampoline::USER_STACK_TOP)
        .expect("user_init: no memory");
    data.memory = Some(memory);

    // SAFETY: we own the trap-frame page until the process first runs.
    let tf = unsafe { &mut *(kernel.mm.ram.ptr(data.trap_frame) as *mut TrapFrame) };
    tf.epc = prog as u64;
    tf.sp = trampoline::USER_STACK_TOP as u64;
    tf.a[0] = 1; // argc; a0 == 0 marks a forked child

    guard.state = Procstate::Runnable;
    kernel.sched.on_fork(idx, &mut guard);
    drop(guard);
}

/// Create a copy of the calling process. The child shares the parent's
/// pages copy-on-write and starts with a zero return value.
pub fn fork(ctx: &KernelCtx) -> Result<usize, KernelError> {
    let kernel = ctx.kernel();
    let (child_idx, mut child_guard) = alloc_proc(kernel)?;
    let child = kernel.procs.proc(child_idx);

    // SAFETY: the child has not been dispatched; only we touch it.
    let child_data = unsafe { &mut *child.data_raw() };

    // Duplicate the user address space via COW.
    {
        let parent_mem = ctx.data_mut().memory.as_mut().expect("fork: no memory");
        match parent_mem.clone_cow(kernel.trampoline, child_data.trap_frame) {
            Ok(mem) => child_data.memory = Some(mem),
            Err(_) => {
                free_proc(kernel, child_idx, &mut child_guard);
                return Err(KernelError::NoMemory);
            }
        }
    }

    // Copy the saved user registers; fork returns 0 in the child.
    {
        let parent_tf = ctx.data().trap_frame;
        // SAFETY: both trap-frame pages are exclusively ours here.
        unsafe {
            ptr::copy_nonoverlapping(
                kernel.mm.ram.ptr(parent_tf) as *const TrapFrame,
                kernel.mm.ram.ptr(child_data.trap_frame) as *mut TrapFrame,
                1,
            );
            (*(kernel.mm.ram.ptr(child_data.trap_frame) as *mut TrapFrame)).a[0] = 0;
        }
    }

    // Share open files and the working directory.
    {
        let data = ctx.data();
        for fd in 0..NOFILE {
            if let Some(f) = &data.open_files[fd] {
                child_data.open_files[fd] = Some(f.dup(kernel));
            }
        }
        child_data.cwd = data.cwd.as_ref().map(|c| c.dup(kernel));
        child_data.name = data.name;
    }

    // The parent's own scheduling fields; racy reads of our own slot
    // are the established idiom here.
    // SAFETY: reading our own info; priority and level are only
    // advisory inputs below.
    let (my_priority, my_level) = {
        let info = unsafe { &*ctx.proc().info.get_mut_raw() };
        (info.priority, info.mlfq_level)
    };
    child_guard.mlfq_level = my_level;
    child_guard.time_quantum = 1 << my_level;
    child_guard.time_used = 0;

    let pid = child_guard.pid;
    drop(child_guard);

    // Parent link, under wait_lock only.
    {
        let wl = kernel.procs.wait_lock.lock();
        // SAFETY: wait_lock is held.
        unsafe { *child.parent_raw() = ctx.proc_idx() };
        drop(wl);
    }

    let mut child_guard = child.info.lock();
    child_guard.state = Procstate::Runnable;
    kernel.sched.on_fork(child_idx, &mut child_guard);
    let child_priority = child_guard.priority;
    drop(child_guard);
    kernel.kick();

    // A higher-priority child should not wait for the clock.
    if kernel.sched.policy() == SchedPolicy::Priority && child_priority > my_priority {
        scheduler::yield_cpu(ctx);
    }

    Ok(pid as usize)
}

/// Pass abandoned children to init. Caller holds wait_lock.
fn reparent(kernel: &Kernel, me: usize) {
    let init_idx = kernel.procs.init_idx();
    for idx in 0..NPROC {
        let p = kernel.procs.proc(idx);
        // SAFETY: wait_lock is held by the caller.
        unsafe {
            if *p.parent_raw() == me {
                *p.parent_raw() = init_idx;
                wakeup(kernel, proc_chan(kernel.procs.proc(init_idx)));
            }
        }
    }
}

/// Terminate the calling process; it becomes a zombie until the parent
/// collects it with `wait`. Never returns.
pub fn exit(ctx: &KernelCtx, status: i32) -> ! {
    let kernel = ctx.kernel();
    if ctx.proc_idx() == kernel.procs.init_idx() {
        panic!("init exiting");
    }

    // Close all open files.
    let files: Vec<_> = {
        let data = ctx.data_mut();
        data.open_files.iter_mut().filter_map(|f| f.take()).collect()
    };
    for f in files {
        f.close(ctx);
    }

    // Release the working directory inside a transaction, in case the
    // inode has to be freed.
    if let Some(cwd) = ctx.data_mut().cwd.take() {
        let tx = kernel.fs.begin_tx(ctx);
        cwd.put(&tx, ctx);
        tx.end(ctx);
    }

    let wait_guard = kernel.procs.wait_lock.lock();
    reparent(kernel, ctx.proc_idx());

    // SAFETY: wait_lock is held.
    let parent_idx = unsafe { *ctx.proc().parent_raw() };
    if parent_idx != NPROC {
        wakeup(kernel, proc_chan(kernel.procs.proc(parent_idx)));
    }

    let mut guard = ctx.proc().info.lock();
    kernel.sched.on_exit(ctx.proc_idx(), &mut guard);
    guard.xstate = status;
    guard.state = Procstate::Zombie;
    drop(wait_guard);

    scheduler::final_sched(ctx, guard)
}

/// Wait for a child to exit; returns its pid after freeing it. With a
/// non-null `addr`, the child's exit status is copied out first.
pub fn wait(ctx: &KernelCtx, addr: UVAddr) -> Result<usize, KernelError> {
    let kernel = ctx.kernel();
    let me = ctx.proc_idx();
    let mut wait_guard = kernel.procs.wait_lock.lock();

    loop {
        let mut have_kids = false;
        for idx in 0..NPROC {
            if idx == me {
                continue;
            }
            let p = kernel.procs.proc(idx);
            // SAFETY: wait_lock is held.
            if unsafe { *p.parent_raw() } != me {
                continue;
            }
            // The child cannot be mid-exit: its final transition
            // happens under its own lock.
            let mut guard = p.info.lock();
            have_kids = true;
            if guard.state == Procstate::Zombie {
                let pid = guard.pid as usize;
                if !addr.is_null() {
                    let xstate = guard.xstate;
                    let copied = ctx
                        .data_mut()
                        .memory
                        .as_mut()
                        .expect("wait: no memory")
                        .copy_out(addr, &xstate.to_ne_bytes());
                    if copied.is_err() {
                        return Err(KernelError::Invalid);
                    }
                }
                free_proc(kernel, idx, &mut guard);
                return Ok(pid);
            }
            drop(guard);
        }

        if !have_kids || ctx.proc().killed() {
            return Err(KernelError::NoChild);
        }

        // Sleep on our own slot; exiting children wake it.
        let chan = proc_chan(ctx.proc());
        super::sleep_on(ctx, chan, &mut wait_guard);
    }
}

/// Wake up all processes sleeping on `chan`.
pub fn wakeup(kernel: &Kernel, chan: usize) {
    for idx in 0..NPROC {
        let p = kernel.procs.proc(idx);
        let mut guard = p.info.lock();
        if guard.state == Procstate::Sleeping && guard.chan == chan {
            guard.state = Procstate::Runnable;
            kernel.sched.on_wake(idx, &mut guard);
        }
        drop(guard);
    }
    kernel.kick();
}

/// Set the killed flag of the process with the given pid; a sleeping
/// target is made runnable so it notices soon. The victim only dies at
/// its next trap boundary.
pub fn kill(kernel: &Kernel, pid: Pid) -> Result<usize, KernelError> {
    for idx in 0..NPROC {
        let p = kernel.procs.proc(idx);
        let mut guard = p.info.lock();
        if guard.state != Procstate::Unused && guard.pid == pid {
            p.set_killed();
            if guard.state == Procstate::Sleeping {
                guard.state = Procstate::Runnable;
                kernel.sched.on_wake(idx, &mut guard);
            }
            drop(guard);
            kernel.kick();
            return Ok(0);
        }
        drop(guard);
    }
    Err(KernelError::NoSuchProcess)
}

/// Set a process's static priority (0..=9). Pid 0 means the caller.
pub fn set_priority(ctx: &KernelCtx, pid: Pid, priority: i32) -> Result<usize, KernelError> {
    if !(0..=9).contains(&priority) {
        return Err(KernelError::Invalid);
    }
    let kernel = ctx.kernel();
    if pid == 0 {
        ctx.proc().info.lock().priority = priority as u8;
        return Ok(0);
    }
    for idx in 0..NPROC {
        let p = kernel.procs.proc(idx);
        let mut guard = p.info.lock();
        if guard.state != Procstate::Unused && guard.pid == pid {
            guard.priority = priority as u8;
            return Ok(0);
        }
        drop(guard);
    }
    Err(KernelError::NoSuchProcess)
}

/// Read a process's static priority. Pid 0 means the caller.
pub fn get_priority(ctx: &KernelCtx, pid: Pid) -> Result<usize, KernelError> {
    let kernel = ctx.kernel();
    if pid == 0 {
        return Ok(ctx.proc().info.lock().priority as usize);
    }
    for idx in 0..NPROC {
        let p = kernel.procs.proc(idx);
        let guard = p.info.lock();
        if guard.state != Procstate::Unused && guard.pid == pid {
            return Ok(guard.priority as usize);
        }
        drop(guard);
    }
    Err(KernelError::NoSuchProcess)
}

/// Grow or shrink the user address space by `n` bytes. `eager` maps
/// immediately; otherwise only the logical size moves and the first
/// touch faults pages in. Returns the old break.
pub fn grow(ctx: &KernelCtx, n: i64, eager: bool) -> Result<usize, KernelError> {
    let memory = ctx.data_mut().memory.as_mut().expect("grow: no memory");
    let old = memory.size();
    if n >= 0 {
        let n = n as usize;
        let new = old.checked_add(n).ok_or(KernelError::NoMemory)?;
        if new > TRAPFRAME {
            return Err(KernelError::NoMemory);
        }
        if eager {
            memory.alloc(new)?;
        } else {
            memory.lazy_grow(n);
        }
    } else {
        let shrink = (-n) as usize;
        let new = old.saturating_sub(shrink);
        memory.dealloc(new);
    }
    Ok(old)
}

/// Print a process listing to the console. No locks, so it can run
/// even from a wedged machine; the snapshot may be inconsistent.
pub fn procdump(kernel: &Kernel) {
    kprintln!(kernel, "");
    for idx in 0..NPROC {
        let p = kernel.procs.proc(idx);
        // SAFETY: debugging aid; reads may tear.
        let (state, pid) = unsafe {
            let info = &*p.info.get_mut_raw();
            (info.state, info.pid)
        };
        if state == Procstate::Unused {
            continue;
        }
        // SAFETY: as above.
        let name = unsafe { (*p.data_raw()).name_str().to_string() };
        kprintln!(kernel, "{} {} {}", pid, state.as_str(), name);
    }
}
