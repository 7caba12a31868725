//! Boot a small demo machine: init sets up the console, greets, forks
//! a child, and powers off.

use std::sync::Arc;
use std::time::Duration;

use kernel::exec::UserProgram;
use kernel::hal::{BootOptions, Machine};
use kernel::syscall::O_RDWR;
use kernel::{console, mkfs};

fn main() {
    let init: UserProgram = Arc::new(|u| {
        if u.forked_child() {
            // The forked child: prove COW isolation, then report in.
            let base = u.load_u64(16);
            let seen = u.load_u64(base);
            u.store_u64(base, seen * 2);
            u.exit(seen as i32);
        }

        assert_eq!(u.mknod("/console", console::CONSOLE_MAJOR, 0), 0);
        let fd = u.open("/console", O_RDWR) as i32;
        assert!(fd >= 0);
        u.write(fd, b"wisp: boot\n");

        // A page of user memory, shared copy-on-write with the child.
        let base = u.sbrk(4096, 0) as u64;
        u.store_u64(base, 21);
        u.store_u64(16, base);

        let pid = u.fork();
        assert!(pid > 0);
        let (got, status) = u.wait();
        assert_eq!(got, pid);
        assert_eq!(status, 21);
        assert_eq!(u.load_u64(base), 21, "child write must stay private");

        u.write(fd, b"wisp: cow ok\n");
        u.shutdown(0);
    });

    let disk = mkfs::make_fs(512, &[("init", b"")]);
    let machine = Machine::boot(BootOptions {
        ncpu: 2,
        disk,
        tick_interval: Duration::from_millis(1),
        programs: vec![("/init".to_string(), init)],
        init: "/init".to_string(),
        echo_console: true,
        ..Default::default()
    });
    std::process::exit(machine.run());
}
