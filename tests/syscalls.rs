//! System-call surface behavior: the errno convention, sbrk modes,
//! pause and kill, pipes, dup, and the console device.

mod common;

use kernel::console;
use kernel::syscall::{O_CREATE, O_RDONLY, O_RDWR, SBRK_EAGER, SBRK_LAZY};

/// The last-error convention: failures store a code, `geterrno` reads
/// it without consuming it, and the next successful call clears it.
#[test]
fn errno_persists_until_a_successful_call() {
    let code = common::run(1, |u| {
        assert_eq!(u.open("/nonexistent", O_RDONLY), -1);
        assert_eq!(u.geterrno(), 2); // no-entry
        assert_eq!(u.geterrno(), 2, "geterrno must not clear the code");
        assert!(u.getpid() > 0);
        assert_eq!(u.geterrno(), 0, "success resets the code");
        u.shutdown(0);
    });
    assert_eq!(code, 0);
}

#[test]
fn unknown_syscall_reports_not_implemented() {
    let code = common::run(1, |u| {
        assert_eq!(u.syscall(99, [0; 6]), -1);
        assert_eq!(u.geterrno(), 38); // not-implemented
        u.shutdown(0);
    });
    assert_eq!(code, 0);
}

#[test]
fn sbrk_eager_and_lazy_both_back_memory() {
    let code = common::run(1, |u| {
        let eager = u.sbrk(2 * 4096, SBRK_EAGER);
        assert!(eager > 0);
        u.store_u64(eager as u64 + 4096, 11);
        assert_eq!(u.load_u64(eager as u64 + 4096), 11);

        // Lazy growth: the break moves, pages appear on first touch.
        let lazy = u.sbrk(3 * 4096, SBRK_LAZY);
        assert_eq!(lazy, eager + 2 * 4096);
        assert_eq!(u.sbrk(0, SBRK_EAGER), lazy + 3 * 4096);
        let far = lazy as u64 + 2 * 4096 + 16;
        assert_eq!(u.load_u64(far), 0, "untouched lazy page reads zero");
        u.store_u64(far, 23);
        assert_eq!(u.load_u64(far), 23);

        // Negative growth releases immediately.
        let before = u.sbrk(0, SBRK_EAGER);
        assert_eq!(u.sbrk(-4096, SBRK_EAGER), before);
        assert_eq!(u.sbrk(0, SBRK_EAGER), before - 4096);
        u.shutdown(0);
    });
    assert_eq!(code, 0);
}

#[test]
fn pause_tracks_the_clock_and_kill_interrupts() {
    let code = common::run(1, |u| {
        if u.forked_child() {
            // Sleep effectively forever; the parent kills us.
            u.pause(1_000_000);
            u.exit(5);
        }

        let t0 = u.uptime();
        assert_eq!(u.pause(5), 0);
        assert!(u.uptime() - t0 >= 5);

        let pid = u.fork();
        assert!(pid > 0);
        // Give the child a moment to fall asleep, then kill it.
        assert_eq!(u.pause(3), 0);
        assert_eq!(u.kill(pid), 0);
        let (reaped, status) = u.wait();
        assert_eq!(reaped, pid);
        assert_eq!(status, -1, "killed processes exit with -1");

        assert_eq!(u.kill(424242), -1);
        assert_eq!(u.geterrno(), 3); // no-such-process
        u.shutdown(0);
    });
    assert_eq!(code, 0);
}

#[test]
fn pipe_carries_bytes_and_signals_eof() {
    let code = common::run(1, |u| {
        if u.forked_child() {
            let wfd = u.load_u32(64) as i32;
            let rfd = u.load_u32(68) as i32;
            assert_eq!(u.close(rfd), 0);
            assert_eq!(u.write(wfd, b"ping from the child"), 19);
            assert_eq!(u.close(wfd), 0);
            u.exit(0);
        }

        let (ret, rfd, wfd) = u.pipe();
        assert_eq!(ret, 0);
        u.store_u32(64, wfd as u32);
        u.store_u32(68, rfd as u32);

        let pid = u.fork();
        assert!(pid > 0);
        assert_eq!(u.close(wfd), 0);

        let mut got = Vec::new();
        loop {
            let (n, data) = u.read(rfd, 8);
            if n == 0 {
                break; // both write ends closed
            }
            assert!(n > 0);
            got.extend_from_slice(&data);
        }
        assert_eq!(&got, b"ping from the child");
        assert_eq!(u.close(rfd), 0);
        assert!(u.wait_any() > 0);
        u.shutdown(0);
    });
    assert_eq!(code, 0);
}

#[test]
fn dup_shares_the_file_offset() {
    let code = common::run(1, |u| {
        let fd = u.open("/f", O_CREATE | O_RDWR) as i32;
        let fd2 = u.dup(fd) as i32;
        assert!(fd2 >= 0);
        assert_eq!(u.write(fd, b"one"), 3);
        assert_eq!(u.write(fd2, b"two"), 3);
        assert_eq!(u.close(fd), 0);
        assert_eq!(u.close(fd2), 0);

        let fd = u.open("/f", O_RDONLY) as i32;
        let (n, data) = u.read(fd, 16);
        assert_eq!(n, 6);
        assert_eq!(&data, b"onetwo");
        assert_eq!(u.close(fd), 0);
        u.shutdown(0);
    });
    assert_eq!(code, 0);
}

#[test]
fn console_device_round_trips_lines() {
    let machine = common::boot(1, |u| {
        assert_eq!(u.mknod("/console", console::CONSOLE_MAJOR, 0), 0);
        let fd = u.open("/console", O_RDWR) as i32;
        assert!(fd >= 0);
        assert_eq!(u.write(fd, b"kernel says hi\n"), 15);

        // Blocks until the harness types a line.
        let (n, line) = u.read(fd, 64);
        assert_eq!(n, 6);
        assert_eq!(&line, b"typed\n");
        assert_eq!(u.close(fd), 0);
        u.shutdown(0);
    });
    let kernel = machine.kernel();
    std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(50));
        for &b in b"typed\n" {
            console::intr(kernel, b);
        }
    });
    assert_eq!(machine.run(), 0);
    let uart = kernel.hal.uart.output();
    let text = String::from_utf8_lossy(&uart);
    assert!(text.contains("kernel says hi"), "uart: {:?}", text);
}

#[test]
fn too_many_open_files_is_reported() {
    let code = common::run(1, |u| {
        let fd = u.open("/f", O_CREATE | O_RDWR) as i32;
        assert!(fd >= 0);
        let mut opened = vec![fd];
        loop {
            let fd = u.open("/f", O_RDONLY);
            if fd < 0 {
                break;
            }
            opened.push(fd as i32);
        }
        assert_eq!(u.geterrno(), 24); // too-many-open
        for fd in opened {
            assert_eq!(u.close(fd), 0);
        }
        // Slots are reusable afterwards.
        let fd = u.open("/f", O_RDONLY) as i32;
        assert!(fd >= 0);
        assert_eq!(u.close(fd), 0);
        assert_eq!(u.unlink("/f"), 0);
        u.shutdown(0);
    });
    assert_eq!(code, 0);
}
