//! Copy-on-write fork behavior, end to end.

mod common;

use kernel::syscall::SBRK_EAGER;

#[test]
fn fork_isolates_parent_and_child_writes() {
    let machine = common::boot(1, |u| {
        if u.forked_child() {
            // Child: sees the parent's value through the shared page,
            // then writes its own copy.
            let base = u.load_u64(64);
            assert_eq!(u.load_u64(base), 42);
            u.store_u64(base, 100);
            assert_eq!(u.load_u64(base), 100);
            u.exit(7);
        }

        let base = u.sbrk(4096, SBRK_EAGER) as u64;
        assert!(base > 0);
        u.store_u64(base, 42);
        u.store_u64(64, base);

        let pid = u.fork();
        assert!(pid > 0, "fork failed");
        let (reaped, status) = u.wait();
        assert_eq!(reaped, pid);
        assert_eq!(status, 7);

        // The child's write must not be visible here.
        assert_eq!(u.load_u64(base), 42);
        u.shutdown(0);
    });
    let kernel = machine.kernel();
    assert_eq!(machine.run(), 0);
    common::assert_frame_conservation(kernel);
}

#[test]
fn grandchildren_share_pages_transitively() {
    let machine = common::boot(1, |u| {
        if u.forked_child() {
            let depth = u.load_u64(128);
            let base = u.load_u64(64);
            assert_eq!(u.load_u64(base), 42, "inherited page must be intact");
            if depth < 2 {
                u.store_u64(128, depth + 1);
                let pid = u.fork();
                assert!(pid > 0);
                let (_, status) = u.wait();
                assert_eq!(status, 0);
            }
            // A private write in each generation.
            u.store_u64(base, 1000 + depth);
            u.exit(0);
        }

        let base = u.sbrk(4096, SBRK_EAGER) as u64;
        u.store_u64(base, 42);
        u.store_u64(64, base);
        u.store_u64(128, 0);

        let pid = u.fork();
        assert!(pid > 0);
        let (_, status) = u.wait();
        assert_eq!(status, 0);
        assert_eq!(u.load_u64(base), 42);
        u.shutdown(0);
    });
    let kernel = machine.kernel();
    assert_eq!(machine.run(), 0);
    common::assert_frame_conservation(kernel);
}
