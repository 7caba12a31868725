//! Shared harness for the machine-level tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use kernel::exec::UserProgram;
use kernel::hal::{BootOptions, Machine};
use kernel::mkfs;
use kernel::trampoline::UserCtx;

pub const FS_BLOCKS: usize = 512;

/// Boot a machine whose init process runs `init`.
pub fn boot(ncpu: usize, init: impl Fn(&mut UserCtx<'_>) + Send + Sync + 'static) -> Machine {
    boot_with(ncpu, mkfs::make_fs(FS_BLOCKS, &[("init", b"")]), Vec::new(), init)
}

pub fn boot_with(
    ncpu: usize,
    disk: Vec<u8>,
    extra_programs: Vec<(String, UserProgram)>,
    init: impl Fn(&mut UserCtx<'_>) + Send + Sync + 'static,
) -> Machine {
    let mut programs: Vec<(String, UserProgram)> = vec![("/init".to_string(), Arc::new(init))];
    programs.extend(extra_programs);
    Machine::boot(BootOptions {
        ncpu,
        ram_pages: 2048,
        disk,
        tick_interval: Duration::from_millis(1),
        programs,
        init: "/init".to_string(),
        echo_console: false,
    })
}

/// Boot, run `init`, and require a clean poweroff with this code.
pub fn run(ncpu: usize, init: impl Fn(&mut UserCtx<'_>) + Send + Sync + 'static) -> i32 {
    boot(ncpu, init).run()
}

/// The frame-conservation invariant: free frames plus allocated frames
/// account for every usable frame.
pub fn assert_frame_conservation(kernel: &'static kernel::kernel::Kernel) {
    let stats = kernel.mm.kmem.lock().stats();
    assert_eq!(
        stats.free + stats.live,
        stats.total,
        "frame conservation violated: {:?}",
        stats
    );
}
