//! The simulated machine.
//!
//! Everything the kernel core treats as hardware lives here: a RAM
//! arena addressed by physical frame, a memory-backed block device, a
//! UART sink, the inter-hart interrupt line, the poweroff latch, and
//! the `Machine` harness that boots a kernel, spawns one OS thread per
//! hart plus a timer thread, and reaps them at poweroff.
//!
//! The host synchronization primitives used in this module model the
//! hardware side of the machine; the kernel itself synchronizes with
//! its own spin locks and sleep/wakeup.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, Once};
use std::thread;
use std::time::Duration;

use crate::addr::{PAddr, PGSIZE};
use crate::exec::UserProgram;
use crate::kernel::Kernel;
use crate::param::{BSIZE, NCPU};
use crate::trampoline::{ExecSwap, ProcExit};
use crate::{console, proc, trap};

/// The RAM arena. `PAddr` 0 is the base; frame 0 stands in for the
/// kernel image and is never allocated.
#[derive(Clone, Copy)]
pub struct Ram {
    base: *mut u8,
    pages: usize,
}

// SAFETY: the arena is leaked and lives for the whole process; callers
// of `ptr` are responsible for not racing on the same frame, which the
// frame allocator, the page tables and the kernel's locks arrange.
unsafe impl Send for Ram {}
unsafe impl Sync for Ram {}

impl Ram {
    pub fn new(pages: usize) -> Ram {
        assert!(pages >= 8, "machine needs more RAM");
        let arena = vec![0u8; pages * PGSIZE].into_boxed_slice();
        Ram {
            base: Box::leak(arena).as_mut_ptr(),
            pages,
        }
    }

    /// Total size in bytes; valid physical addresses are below this.
    pub fn size(&self) -> usize {
        self.pages * PGSIZE
    }

    /// Raw pointer to a physical address.
    ///
    /// # Safety
    ///
    /// The caller must own the frame (via the allocator and page
    /// tables) or otherwise ensure accesses do not race.
    pub unsafe fn ptr(&self, pa: PAddr) -> *mut u8 {
        assert!(pa.value() < self.size(), "Ram::ptr out of range");
        // SAFETY: in range per the assert; aliasing is the caller's
        // obligation.
        unsafe { self.base.add(pa.value()) }
    }

    /// The frame holding `pa`, as a byte slice.
    ///
    /// # Safety
    ///
    /// Same as `ptr`, for the whole frame.
    pub unsafe fn frame_mut(&self, pa: PAddr) -> &mut [u8; PGSIZE] {
        assert!(pa.value() % PGSIZE == 0, "Ram::frame_mut unaligned");
        // SAFETY: delegated to the caller per the doc contract.
        unsafe { &mut *(self.ptr(pa) as *mut [u8; PGSIZE]) }
    }
}

/// Memory-backed block device.
pub struct Disk {
    image: Mutex<Vec<u8>>,
    /// Device reads issued, for observing cache behavior.
    reads: AtomicU64,
}

impl Disk {
    pub fn new(image: Vec<u8>) -> Disk {
        assert!(image.len() % BSIZE == 0, "disk image not block aligned");
        Disk {
            image: Mutex::new(image),
            reads: AtomicU64::new(0),
        }
    }

    pub fn nblocks(&self) -> usize {
        self.image.lock().unwrap().len() / BSIZE
    }

    pub fn read(&self, blockno: u32, data: &mut [u8; BSIZE]) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let image = self.image.lock().unwrap();
        let off = blockno as usize * BSIZE;
        assert!(off + BSIZE <= image.len(), "disk read past end");
        data.copy_from_slice(&image[off..off + BSIZE]);
    }

    pub fn write(&self, blockno: u32, data: &[u8; BSIZE]) {
        let mut image = self.image.lock().unwrap();
        let off = blockno as usize * BSIZE;
        assert!(off + BSIZE <= image.len(), "disk write past end");
        image[off..off + BSIZE].copy_from_slice(data);
    }

    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Copy of the current image, e.g. to remount it in a new machine.
    pub fn snapshot(&self) -> Vec<u8> {
        self.image.lock().unwrap().clone()
    }
}

/// Transmit-only UART. Output is captured and optionally echoed to the
/// host's stdout.
pub struct Uart {
    out: Mutex<Vec<u8>>,
    echo: bool,
}

impl Uart {
    pub fn new(echo: bool) -> Uart {
        Uart {
            out: Mutex::new(Vec::new()),
            echo,
        }
    }

    pub fn putc(&self, c: u8) {
        let mut out = self.out.lock().unwrap();
        out.push(c);
        if self.echo {
            use std::io::Write;
            let _ = std::io::stdout().write_all(&[c]);
            if c == b'\n' {
                let _ = std::io::stdout().flush();
            }
        }
    }

    pub fn put_str(&self, s: &str) {
        for &b in s.as_bytes() {
            self.putc(b);
        }
    }

    /// Everything transmitted so far.
    pub fn output(&self) -> Vec<u8> {
        self.out.lock().unwrap().clone()
    }
}

/// The line harts wait on in WFI. Kicked whenever a process may have
/// become runnable and on every clock tick.
pub struct IntrLine {
    seq: Mutex<u64>,
    cond: Condvar,
}

impl IntrLine {
    pub fn new() -> IntrLine {
        IntrLine {
            seq: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    pub fn kick(&self) {
        let mut seq = self.seq.lock().unwrap();
        *seq += 1;
        self.cond.notify_all();
    }

    /// Wait for an interrupt, bounded so a halted machine is noticed.
    pub fn wait(&self, timeout: Duration) {
        let seq = self.seq.lock().unwrap();
        let start = *seq;
        let _unused = self
            .cond
            .wait_timeout_while(seq, timeout, |s| *s == start)
            .unwrap();
    }
}

impl Default for IntrLine {
    fn default() -> Self {
        Self::new()
    }
}

struct HaltState {
    halted: bool,
    code: i32,
    panicked: bool,
}

/// Poweroff latch, the analogue of the QEMU test device.
pub struct Halt {
    state: Mutex<HaltState>,
    cond: Condvar,
}

impl Halt {
    pub fn new() -> Halt {
        Halt {
            state: Mutex::new(HaltState {
                halted: false,
                code: 0,
                panicked: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn poweroff(&self, code: i32) {
        let mut st = self.state.lock().unwrap();
        if !st.halted {
            st.halted = true;
            st.code = code;
        }
        self.cond.notify_all();
    }

    /// Record that a kernel context panicked, and halt.
    pub fn panic_halt(&self) {
        let mut st = self.state.lock().unwrap();
        st.halted = true;
        st.panicked = true;
        self.cond.notify_all();
    }

    pub fn is_halted(&self) -> bool {
        self.state.lock().unwrap().halted
    }

    fn wait(&self) -> (i32, bool) {
        let mut st = self.state.lock().unwrap();
        while !st.halted {
            st = self.cond.wait(st).unwrap();
        }
        (st.code, st.panicked)
    }
}

impl Default for Halt {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the kernel sees as hardware.
pub struct Hal {
    pub ram: Ram,
    pub disk: Disk,
    pub uart: Uart,
    pub intr: IntrLine,
    pub halt: Halt,
    pub tick_interval: Duration,
}

/// Shape of the machine to boot.
pub struct BootOptions {
    pub ncpu: usize,
    pub ram_pages: usize,
    pub disk: Vec<u8>,
    pub tick_interval: Duration,
    /// Program images, keyed by the path `exec` resolves.
    pub programs: Vec<(String, UserProgram)>,
    /// Path of the program the init process runs.
    pub init: String,
    /// Echo console output to the host stdout.
    pub echo_console: bool,
}

impl Default for BootOptions {
    fn default() -> Self {
        BootOptions {
            ncpu: 1,
            ram_pages: 1024,
            disk: Vec::new(),
            tick_interval: Duration::from_millis(1),
            programs: Vec::new(),
            init: String::from("/init"),
            echo_console: false,
        }
    }
}

/// A booted machine: the leaked kernel plus its hart and timer threads.
pub struct Machine {
    kernel: &'static Kernel,
    harts: Vec<thread::JoinHandle<()>>,
    timer: Option<thread::JoinHandle<()>>,
}

impl Machine {
    pub fn boot(opts: BootOptions) -> Machine {
        install_panic_filter();
        assert!(opts.ncpu >= 1 && opts.ncpu <= NCPU, "bad hart count");

        let hal = Hal {
            ram: Ram::new(opts.ram_pages),
            disk: Disk::new(opts.disk),
            uart: Uart::new(opts.echo_console),
            intr: IntrLine::new(),
            halt: Halt::new(),
            tick_interval: opts.tick_interval,
        };
        let kernel: &'static Kernel = Box::leak(Box::new(Kernel::new(hal, opts.ncpu)));

        for (path, entry) in opts.programs {
            kernel.programs.register(&path, entry);
        }
        proc::user_init(kernel, &opts.init);

        let timer = {
            let k = kernel;
            thread::Builder::new()
                .name("timer".into())
                .spawn(move || timer_main(k))
                .expect("spawn timer")
        };

        let mut harts = Vec::new();
        for id in 0..opts.ncpu {
            let k = kernel;
            let handle = thread::Builder::new()
                .name(format!("hart{}", id))
                .spawn(move || hart_main(k, id))
                .expect("spawn hart");
            harts.push(handle);
        }

        Machine {
            kernel,
            harts,
            timer: Some(timer),
        }
    }

    pub fn kernel(&self) -> &'static Kernel {
        self.kernel
    }

    /// Deliver console input, as if typed on the attached terminal.
    pub fn feed_console(&self, s: &str) {
        for &b in s.as_bytes() {
            console::intr(self.kernel, b);
        }
    }

    /// Wait for poweroff and reap the machine; returns the poweroff
    /// code. Panics if a kernel context panicked.
    pub fn run(mut self) -> i32 {
        let (code, panicked) = self.kernel.hal.halt.wait();
        for h in self.harts.drain(..) {
            let _ = h.join();
        }
        if let Some(t) = self.timer.take() {
            let _ = t.join();
        }
        if panicked {
            panic!("machine halted by kernel panic");
        }
        code
    }
}

fn hart_main(kernel: &'static Kernel, id: usize) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        proc::scheduler_loop(kernel, id);
    }));
    if result.is_err() {
        kernel.hal.halt.panic_halt();
    }
}

fn timer_main(kernel: &'static Kernel) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| loop {
        thread::sleep(kernel.hal.tick_interval);
        if kernel.hal.halt.is_halted() {
            break;
        }
        trap::clock_intr(kernel);
    }));
    if result.is_err() {
        kernel.hal.halt.panic_halt();
    }
}

/// A process's kernel thread leaves through an unwind carrying one of
/// the trampoline markers; those are control flow, not failures, and
/// must not hit the default panic report.
fn install_panic_filter() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let prev = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let payload = info.payload();
            if payload.is::<ProcExit>() || payload.is::<ExecSwap>() {
                return;
            }
            prev(info);
        }));
    });
}
