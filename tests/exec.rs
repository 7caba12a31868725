//! exec: image replacement with argument passing, and the failure
//! path leaving the caller intact.

mod common;

use std::sync::Arc;

use kernel::console;
use kernel::exec::UserProgram;
use kernel::mkfs;
use kernel::syscall::O_RDWR;

/// Read a NUL-terminated string out of the exec'd program's memory.
fn read_cstr(u: &mut kernel::trampoline::UserCtx<'_>, mut addr: u64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let byte = u.load_bytes(addr, 1)[0];
        if byte == 0 {
            return out;
        }
        out.push(byte);
        addr += 1;
    }
}

#[test]
fn exec_replaces_the_image_and_passes_argv() {
    let echo: UserProgram = Arc::new(|u| {
        let argc = u.arg(0);
        let argv = u.arg(1);
        assert_eq!(argc, 3);
        u.mknod("/console", console::CONSOLE_MAJOR, 0);
        let fd = u.open("/console", O_RDWR) as i32;
        for i in 0..argc {
            let ptr = u.load_u64(argv + i * 8);
            let arg = read_cstr(u, ptr);
            u.write(fd, &arg);
            u.write(fd, b" ");
        }
        assert_eq!(u.load_u64(argv + argc * 8), 0, "argv is NUL-terminated");
        u.shutdown(0);
    });

    let disk = mkfs::make_fs(common::FS_BLOCKS, &[("init", b""), ("echo", b"")]);
    let machine = common::boot_with(
        1,
        disk,
        vec![("/echo".to_string(), echo)],
        |u| {
            let ret = u.exec("/echo", &["echo", "hello", "exec"]);
            // Success never returns.
            panic!("exec returned {}", ret);
        },
    );
    let kernel = machine.kernel();
    assert_eq!(machine.run(), 0);
    let uart = kernel.hal.uart.output();
    let text = String::from_utf8_lossy(&uart);
    assert!(text.contains("echo hello exec"), "uart: {:?}", text);
}

#[test]
fn failed_exec_leaves_the_caller_running() {
    let code = common::run(1, |u| {
        let base = u.sbrk(4096, 0) as u64;
        u.store_u64(base, 777);

        // No such file.
        assert_eq!(u.exec("/missing", &["missing"]), -1);
        assert_eq!(u.geterrno(), 2); // no-entry

        // Still alive, memory intact.
        assert!(u.getpid() > 0);
        assert_eq!(u.load_u64(base), 777);
        u.shutdown(0);
    });
    assert_eq!(code, 0);
}
