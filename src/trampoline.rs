//! The user/kernel boundary of the simulated machine.
//!
//! `user_ret` is the shared page every address space maps at the top:
//! it bridges from kernel context into "user mode" by invoking the
//! process's program image, and catches the two ways user execution
//! ends — process exit and image replacement by exec.
//!
//! `UserCtx` is the register file and MMU as user code sees them.
//! Memory is reachable only through simulated loads and stores that
//! walk the process's page table (faulting COW and lazy pages in, or
//! killing the process, exactly as the trap path would), and the
//! kernel is reachable only through `syscall`, which traps in through
//! the numbered dispatcher. The convenience wrappers below it play the
//! role of the user-space syscall stubs.

use std::panic::{self, AssertUnwindSafe};

use crate::addr::{UVAddr, PGSIZE};
use crate::fs::Stat;
use crate::kernel::KernelCtx;
use crate::proc;
use crate::syscall::*;
use crate::trap;

/// Unwind payload: the process finished (exit or killed).
pub struct ProcExit;

/// Unwind payload: exec installed a new image; restart user execution.
pub struct ExecSwap;

/// Fresh images get this much address space, all of it stack.
pub const USER_STACK_TOP: usize = 4 * PGSIZE;

/// Enter user mode and never come back: run the program image named by
/// the trap frame, restarting whenever exec swaps it.
pub fn user_ret(ctx: &KernelCtx) -> ! {
    loop {
        let entry_idx = ctx.trap_frame().epc as usize;
        let entry = ctx
            .kernel()
            .programs
            .entry(entry_idx)
            .expect("user_ret: bad program counter");
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut user = UserCtx::new(ctx);
            entry(&mut user);
        }));
        match result {
            // Falling off the end of main is an orderly exit.
            Ok(()) => proc::exit(ctx, 0),
            Err(payload) if payload.is::<ExecSwap>() => continue,
            Err(payload) => panic::resume_unwind(payload),
        }
    }
}

/// What user code holds while running: its registers and its view of
/// memory.
pub struct UserCtx<'a> {
    ctx: &'a KernelCtx,
    /// A page of scratch space the syscall stubs stage buffers in.
    scratch: Option<u64>,
}

impl<'a> UserCtx<'a> {
    fn new(ctx: &'a KernelCtx) -> Self {
        Self { ctx, scratch: None }
    }

    /// Escape hatch for white-box tests: the kernel context behind
    /// this user view.
    pub fn kernel_ctx(&self) -> &'a KernelCtx {
        self.ctx
    }

    /// True in a freshly forked child (fork zeroed a0).
    pub fn forked_child(&self) -> bool {
        self.ctx.trap_frame().a[0] == 0
    }

    pub fn arg(&self, n: usize) -> u64 {
        self.ctx.trap_frame().a[n]
    }

    /// Issue a supervisor call: registers in, trap, a0 back out.
    pub fn syscall(&mut self, num: u64, args: [u64; 6]) -> i64 {
        {
            let tf = self.ctx.trap_frame_mut();
            tf.a[..6].copy_from_slice(&args);
            tf.a[7] = num;
        }
        trap::user_trap(self.ctx);
        let ret = self.ctx.trap_frame().a[0] as i64;
        if num == SYS_EXEC && ret >= 0 {
            // The image under our feet is gone; unwind to user_ret so
            // the new one starts.
            panic::panic_any(ExecSwap);
        }
        ret
    }

    /// One simulated timer boundary; CPU-bound user loops pass through
    /// here.
    pub fn relax(&mut self) {
        trap::poll_preempt(self.ctx);
    }

    /// Burn CPU: `units` slices of arithmetic with a preemption point
    /// after each.
    pub fn work(&mut self, units: usize) {
        for _ in 0..units {
            let mut acc = 0u64;
            for i in 0..5_000u64 {
                acc = acc.wrapping_add(i ^ acc.rotate_left(7));
            }
            std::hint::black_box(acc);
            self.relax();
        }
    }

    // Simulated loads and stores. A fault that the COW or lazy
    // handlers cannot repair kills the process, like any other bad
    // user memory access.

    pub fn store_bytes(&mut self, va: u64, bytes: &[u8]) {
        self.relax();
        let result = self
            .ctx
            .data_mut()
            .memory
            .as_mut()
            .expect("user store: no memory")
            .copy_out(UVAddr::new(va as usize), bytes);
        if result.is_err() {
            self.fault("store", va);
        }
    }

    pub fn load_bytes(&mut self, va: u64, n: usize) -> Vec<u8> {
        self.relax();
        let mut buf = vec![0u8; n];
        let result = self
            .ctx
            .data_mut()
            .memory
            .as_mut()
            .expect("user load: no memory")
            .copy_in(&mut buf, UVAddr::new(va as usize));
        if result.is_err() {
            self.fault("load", va);
        }
        buf
    }

    pub fn store_u64(&mut self, va: u64, value: u64) {
        self.store_bytes(va, &value.to_ne_bytes());
    }

    pub fn load_u64(&mut self, va: u64) -> u64 {
        u64::from_ne_bytes(self.load_bytes(va, 8).try_into().unwrap())
    }

    pub fn store_u32(&mut self, va: u64, value: u32) {
        self.store_bytes(va, &value.to_ne_bytes());
    }

    pub fn load_u32(&mut self, va: u64) -> u32 {
        u32::from_ne_bytes(self.load_bytes(va, 4).try_into().unwrap())
    }

    fn fault(&mut self, kind: &str, va: u64) -> ! {
        crate::kprintln!(
            self.ctx.kernel(),
            "usertrap: pid {} {}: {} page fault at {:#x}",
            self.ctx.pid(),
            self.ctx.data().name_str(),
            kind,
            va
        );
        self.ctx.proc().set_killed();
        proc::exit(self.ctx, -1);
    }

    /// Scratch staging area for the stubs below.
    fn scratch_base(&mut self) -> u64 {
        if let Some(base) = self.scratch {
            return base;
        }
        let base = self.syscall(SYS_SBRK, [PGSIZE as u64, SBRK_EAGER as u64, 0, 0, 0, 0]);
        assert!(base >= 0, "user scratch: sbrk failed");
        self.scratch = Some(base as u64);
        base as u64
    }

    fn stage(&mut self, offset: u64, bytes: &[u8]) -> u64 {
        assert!(offset as usize + bytes.len() < PGSIZE, "stage overflow");
        let base = self.scratch_base();
        self.store_bytes(base + offset, bytes);
        base + offset
    }

    fn stage_str(&mut self, offset: u64, s: &str) -> (u64, u64) {
        let addr = self.stage(offset, s.as_bytes());
        self.store_bytes(addr + s.len() as u64, &[0]);
        (addr, offset + s.len() as u64 + 1)
    }

    // The user-space system call stubs.

    pub fn fork(&mut self) -> i64 {
        self.syscall(SYS_FORK, [0; 6])
    }

    pub fn exit(&mut self, status: i32) -> ! {
        self.syscall(SYS_EXIT, [status as u64, 0, 0, 0, 0, 0]);
        unreachable!("exit returned");
    }

    /// Wait for any child; returns (pid, exit status).
    pub fn wait(&mut self) -> (i64, i32) {
        let addr = self.scratch_base() + PGSIZE as u64 - 8;
        let pid = self.syscall(SYS_WAIT, [addr, 0, 0, 0, 0, 0]);
        let status = self.load_u32(addr) as i32;
        (pid, status)
    }

    /// Wait without collecting the status.
    pub fn wait_any(&mut self) -> i64 {
        self.syscall(SYS_WAIT, [0; 6])
    }

    /// Returns (result, read fd, write fd).
    pub fn pipe(&mut self) -> (i64, i32, i32) {
        let addr = self.scratch_base() + PGSIZE as u64 - 16;
        let ret = self.syscall(SYS_PIPE, [addr, 0, 0, 0, 0, 0]);
        let fd0 = self.load_u32(addr) as i32;
        let fd1 = self.load_u32(addr + 4) as i32;
        (ret, fd0, fd1)
    }

    pub fn open(&mut self, path: &str, mode: u32) -> i64 {
        let (addr, _) = self.stage_str(0, path);
        self.syscall(SYS_OPEN, [addr, mode as u64, 0, 0, 0, 0])
    }

    pub fn close(&mut self, fd: i32) -> i64 {
        self.syscall(SYS_CLOSE, [fd as u64, 0, 0, 0, 0, 0])
    }

    pub fn dup(&mut self, fd: i32) -> i64 {
        self.syscall(SYS_DUP, [fd as u64, 0, 0, 0, 0, 0])
    }

    /// Read up to `n` bytes; returns (result, data).
    pub fn read(&mut self, fd: i32, n: usize) -> (i64, Vec<u8>) {
        assert!(n <= PGSIZE / 2, "read: too large for the stub");
        let base = self.scratch_base();
        let ret = self.syscall(SYS_READ, [fd as u64, base, n as u64, 0, 0, 0]);
        let data = if ret > 0 {
            self.load_bytes(base, ret as usize)
        } else {
            Vec::new()
        };
        (ret, data)
    }

    /// Write all of `data` (staged through user memory in chunks).
    pub fn write(&mut self, fd: i32, data: &[u8]) -> i64 {
        let mut written = 0usize;
        while written < data.len() {
            let chunk = usize::min(data.len() - written, PGSIZE / 2);
            let addr = self.stage(0, &data[written..written + chunk]);
            let ret = self.syscall(SYS_WRITE, [fd as u64, addr, chunk as u64, 0, 0, 0]);
            if ret < 0 {
                return ret;
            }
            written += ret as usize;
            if ret as usize != chunk {
                break;
            }
        }
        written as i64
    }

    pub fn fstat(&mut self, fd: i32) -> (i64, Stat) {
        let addr = self.scratch_base() + PGSIZE as u64 - 64;
        let ret = self.syscall(SYS_FSTAT, [fd as u64, addr, 0, 0, 0, 0]);
        let bytes = self.load_bytes(addr, core::mem::size_of::<Stat>());
        // SAFETY: Stat is plain words and the buffer is the right size.
        let st = unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const Stat) };
        (ret, st)
    }

    pub fn link(&mut self, old: &str, new: &str) -> i64 {
        let (old_addr, off) = self.stage_str(0, old);
        let (new_addr, _) = self.stage_str(off, new);
        self.syscall(SYS_LINK, [old_addr, new_addr, 0, 0, 0, 0])
    }

    pub fn unlink(&mut self, path: &str) -> i64 {
        let (addr, _) = self.stage_str(0, path);
        self.syscall(SYS_UNLINK, [addr, 0, 0, 0, 0, 0])
    }

    pub fn mkdir(&mut self, path: &str) -> i64 {
        let (addr, _) = self.stage_str(0, path);
        self.syscall(SYS_MKDIR, [addr, 0, 0, 0, 0, 0])
    }

    pub fn mknod(&mut self, path: &str, major: u16, minor: u16) -> i64 {
        let (addr, _) = self.stage_str(0, path);
        self.syscall(SYS_MKNOD, [addr, major as u64, minor as u64, 0, 0, 0])
    }

    pub fn chdir(&mut self, path: &str) -> i64 {
        let (addr, _) = self.stage_str(0, path);
        self.syscall(SYS_CHDIR, [addr, 0, 0, 0, 0, 0])
    }

    pub fn symlink(&mut self, target: &str, link: &str) -> i64 {
        let (target_addr, off) = self.stage_str(0, target);
        let (link_addr, _) = self.stage_str(off, link);
        self.syscall(SYS_SYMLINK, [target_addr, link_addr, 0, 0, 0, 0])
    }

    /// Returns (result, target bytes).
    pub fn readlink(&mut self, path: &str, n: usize) -> (i64, Vec<u8>) {
        assert!(n <= PGSIZE / 2, "readlink: too large for the stub");
        let (addr, off) = self.stage_str(0, path);
        let buf = self.scratch_base() + off.next_multiple_of(8);
        let ret = self.syscall(SYS_READLINK, [addr, buf, n as u64, 0, 0, 0]);
        let data = if ret > 0 {
            self.load_bytes(buf, ret as usize)
        } else {
            Vec::new()
        };
        (ret, data)
    }

    pub fn exec(&mut self, path: &str, argv: &[&str]) -> i64 {
        let (path_addr, mut off) = self.stage_str(0, path);
        let mut addrs: Vec<u64> = Vec::new();
        for arg in argv {
            let (addr, next) = self.stage_str(off, arg);
            addrs.push(addr);
            off = next;
        }
        addrs.push(0);
        let array = self.scratch_base() + off.next_multiple_of(8);
        for (i, addr) in addrs.iter().enumerate() {
            self.store_bytes(array + i as u64 * 8, &addr.to_ne_bytes());
        }
        self.syscall(SYS_EXEC, [path_addr, array, 0, 0, 0, 0])
    }

    pub fn sbrk(&mut self, n: i64, mode: u32) -> i64 {
        self.syscall(SYS_SBRK, [n as u64, mode as u64, 0, 0, 0, 0])
    }

    pub fn pause(&mut self, ticks: u32) -> i64 {
        self.syscall(SYS_PAUSE, [ticks as u64, 0, 0, 0, 0, 0])
    }

    pub fn uptime(&mut self) -> i64 {
        self.syscall(SYS_UPTIME, [0; 6])
    }

    pub fn kill(&mut self, pid: i64) -> i64 {
        self.syscall(SYS_KILL, [pid as u64, 0, 0, 0, 0, 0])
    }

    pub fn getpid(&mut self) -> i64 {
        self.syscall(SYS_GETPID, [0; 6])
    }

    pub fn setpriority(&mut self, pid: i64, priority: i32) -> i64 {
        self.syscall(SYS_SETPRIORITY, [pid as u64, priority as u64, 0, 0, 0, 0])
    }

    pub fn getpriority(&mut self, pid: i64) -> i64 {
        self.syscall(SYS_GETPRIORITY, [pid as u64, 0, 0, 0, 0, 0])
    }

    pub fn geterrno(&mut self) -> i64 {
        self.syscall(SYS_GETERRNO, [0; 6])
    }

    pub fn set_scheduler(&mut self, kind: u32) -> i64 {
        self.syscall(SYS_SET_SCHEDULER, [kind as u64, 0, 0, 0, 0, 0])
    }

    /// Power the machine off; the harness's exit door.
    pub fn shutdown(&mut self, code: i32) -> ! {
        self.ctx.kernel().poweroff(code);
        loop {
            proc::yield_cpu(self.ctx);
        }
    }
}
