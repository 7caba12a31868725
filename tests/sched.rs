//! Scheduler behavior: strict priority ordering, round-robin
//! progress, and MLFQ level movement.

mod common;

use kernel::param::NPROC;
use kernel::proc::Procstate;

/// Three CPU-bound children with priorities 3, 6 and 9 finish in
/// strict priority order. The parent pins itself to the top priority
/// while it sets the others up, so nothing runs early; each child
/// reports its own priority through a shared pipe as it finishes.
#[test]
fn priority_children_complete_highest_first() {
    let code = common::run(1, |u| {
        if u.forked_child() {
            let prio = u.getpriority(0);
            u.work(600);
            let wfd = u.load_u32(64) as i32;
            assert_eq!(u.write(wfd, &[prio as u8]), 1);
            u.exit(0);
        }

        assert_eq!(u.set_scheduler(1), 0); // priority policy
        assert_eq!(u.setpriority(0, 9), 0);
        let (ret, rfd, wfd) = u.pipe();
        assert_eq!(ret, 0);
        u.store_u32(64, wfd as u32);

        for prio in [3i32, 6, 9] {
            let pid = u.fork();
            assert!(pid > 0);
            assert_eq!(u.setpriority(pid, prio), 0);
        }

        // Block; the children now run strictly by priority.
        let mut order = Vec::new();
        while order.len() < 3 {
            let (n, data) = u.read(rfd, 3 - order.len());
            assert!(n > 0);
            order.extend_from_slice(&data);
        }
        assert_eq!(order, vec![9, 6, 3], "completion order");

        for _ in 0..3 {
            assert!(u.wait_any() > 0);
        }
        u.shutdown(0);
    });
    assert_eq!(code, 0);
}

/// Under round-robin, equally matched CPU-bound children all make
/// progress: every one of them finishes.
#[test]
fn round_robin_children_all_make_progress() {
    let code = common::run(1, |u| {
        if u.forked_child() {
            u.work(300);
            let wfd = u.load_u32(64) as i32;
            assert_eq!(u.write(wfd, &[1u8]), 1);
            u.exit(0);
        }

        assert_eq!(u.set_scheduler(0), 0);
        let (ret, rfd, wfd) = u.pipe();
        assert_eq!(ret, 0);
        u.store_u32(64, wfd as u32);

        for _ in 0..3 {
            assert!(u.fork() > 0);
        }
        let mut done = 0;
        while done < 3 {
            let (n, _) = u.read(rfd, 3 - done);
            assert!(n > 0);
            done += n as usize;
        }
        for _ in 0..3 {
            assert!(u.wait_any() > 0);
        }
        u.shutdown(0);
    });
    assert_eq!(code, 0);
}

fn mlfq_level_of(kernel: &'static kernel::kernel::Kernel, pid: i32) -> Option<usize> {
    for idx in 0..NPROC {
        let guard = kernel.procs.proc(idx).info.lock();
        if guard.state != Procstate::Unused && guard.pid == pid {
            return Some(guard.mlfq_level);
        }
    }
    None
}

/// MLFQ sinks a CPU hog and keeps an interactive sleeper near the
/// top.
#[test]
fn mlfq_demotes_hogs_and_promotes_sleepers() {
    let code = common::run(1, |u| {
        if u.forked_child() {
            match u.load_u32(64) {
                1 => {
                    // The hog.
                    u.work(50_000);
                    u.exit(0);
                }
                _ => {
                    // The sleeper: wakes often, never uses its slice.
                    for _ in 0..500 {
                        u.pause(2);
                    }
                    u.exit(0);
                }
            }
        }

        assert_eq!(u.set_scheduler(2), 0); // MLFQ

        u.store_u32(64, 1);
        let hog = u.fork();
        assert!(hog > 0);
        u.store_u32(64, 2);
        let sleeper = u.fork();
        assert!(sleeper > 0);

        u.pause(40);

        let kernel = u.kernel_ctx().kernel();
        let hog_level = mlfq_level_of(kernel, hog as i32).expect("hog is alive");
        let sleeper_level = mlfq_level_of(kernel, sleeper as i32).expect("sleeper is alive");
        assert!(
            hog_level >= 2,
            "hog should have been demoted, at level {}",
            hog_level
        );
        assert!(
            sleeper_level <= 1,
            "sleeper should stay near the top, at level {}",
            sleeper_level
        );

        assert_eq!(u.kill(hog), 0);
        assert_eq!(u.kill(sleeper), 0);
        assert!(u.wait_any() > 0);
        assert!(u.wait_any() > 0);
        u.shutdown(0);
    });
    assert_eq!(code, 0);
}

#[test]
fn set_scheduler_rejects_unknown_kinds() {
    let code = common::run(1, |u| {
        assert_eq!(u.set_scheduler(7), -1);
        assert_eq!(u.geterrno(), 22);
        assert_eq!(u.set_scheduler(0), 0);
        u.shutdown(0);
    });
    assert_eq!(code, 0);
}
