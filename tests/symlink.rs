//! Symbolic links: chains, cycles, readlink, and the relative-target
//! rule.

mod common;

use kernel::syscall::{O_CREATE, O_RDONLY, O_RDWR};

#[test]
fn chain_resolves_to_the_target_file() {
    let code = common::run(1, |u| {
        let fd = u.open("/t", O_CREATE | O_RDWR) as i32;
        assert!(fd >= 0);
        assert_eq!(u.write(fd, b"through the chain"), 17);
        assert_eq!(u.close(fd), 0);

        assert_eq!(u.symlink("/t", "/l3"), 0);
        assert_eq!(u.symlink("/l3", "/l2"), 0);
        assert_eq!(u.symlink("/l2", "/l1"), 0);

        let fd = u.open("/l1", O_RDONLY) as i32;
        assert!(fd >= 0, "chain open failed: errno {}", u.geterrno());
        let (n, data) = u.read(fd, 64);
        assert_eq!(n, 17);
        assert_eq!(&data, b"through the chain");
        assert_eq!(u.close(fd), 0);
        u.shutdown(0);
    });
    assert_eq!(code, 0);
}

#[test]
fn cycle_fails_with_symlink_loop() {
    let code = common::run(1, |u| {
        assert_eq!(u.symlink("/lb", "/la"), 0);
        assert_eq!(u.symlink("/la", "/lb"), 0);
        assert_eq!(u.open("/la", O_RDONLY), -1);
        assert_eq!(u.geterrno(), 40); // symlink-loop
        u.shutdown(0);
    });
    assert_eq!(code, 0);
}

#[test]
fn readlink_returns_the_stored_target() {
    let code = common::run(1, |u| {
        assert_eq!(u.symlink("/somewhere/else", "/l"), 0);
        let (n, target) = u.readlink("/l", 64);
        assert_eq!(n, 15);
        assert_eq!(&target, b"/somewhere/else");

        // Truncated by a small buffer.
        let (n, target) = u.readlink("/l", 4);
        assert_eq!(n, 4);
        assert_eq!(&target, b"/som");

        // Not a symlink.
        let fd = u.open("/plain", O_CREATE | O_RDWR) as i32;
        assert_eq!(u.close(fd), 0);
        assert_eq!(u.readlink("/plain", 16).0, -1);
        assert_eq!(u.geterrno(), 22); // invalid
        u.shutdown(0);
    });
    assert_eq!(code, 0);
}

#[test]
fn symlinked_directory_components_are_followed() {
    let code = common::run(1, |u| {
        assert_eq!(u.mkdir("/d"), 0);
        let fd = u.open("/d/f", O_CREATE | O_RDWR) as i32;
        assert_eq!(u.write(fd, b"inside"), 6);
        assert_eq!(u.close(fd), 0);

        assert_eq!(u.symlink("/d", "/ld"), 0);
        let fd = u.open("/ld/f", O_RDONLY) as i32;
        assert!(fd >= 0, "intermediate symlink: errno {}", u.geterrno());
        let (n, data) = u.read(fd, 16);
        assert_eq!(n, 6);
        assert_eq!(&data, b"inside");
        assert_eq!(u.close(fd), 0);
        u.shutdown(0);
    });
    assert_eq!(code, 0);
}

#[test]
fn relative_targets_are_rejected() {
    let code = common::run(1, |u| {
        let fd = u.open("/t", O_CREATE | O_RDWR) as i32;
        assert_eq!(u.close(fd), 0);
        assert_eq!(u.symlink("t", "/lr"), 0);
        assert_eq!(u.open("/lr", O_RDONLY), -1);
        assert_eq!(u.geterrno(), 22); // invalid: relative, unresolved
        u.shutdown(0);
    });
    assert_eq!(code, 0);
}
