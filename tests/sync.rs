//! The derived synchronization primitives, driven from process
//! context.

mod common;

#[test]
fn semaphore_blocks_until_posted() {
    let code = common::run(1, |u| {
        if u.forked_child() {
            let ctx = u.kernel_ctx();
            let sync = &ctx.kernel().sync;
            // Blocks until the parent posts.
            sync.sem_wait(ctx, 3).unwrap();
            let wfd = u.load_u32(64) as i32;
            assert_eq!(u.write(wfd, &[b'w']), 1);
            u.exit(0);
        }

        let (ret, rfd, wfd) = u.pipe();
        assert_eq!(ret, 0);
        u.store_u32(64, wfd as u32);

        {
            let ctx = u.kernel_ctx();
            ctx.kernel().sync.sem_init(3, 0).unwrap();
        }
        let pid = u.fork();
        assert!(pid > 0);

        // The child must still be parked on the semaphore.
        assert_eq!(u.pause(5), 0);
        {
            let ctx = u.kernel_ctx();
            ctx.kernel().sync.sem_post(ctx, 3).unwrap();
        }
        let (n, data) = u.read(rfd, 1);
        assert_eq!((n, data.as_slice()), (1, &b"w"[..]));
        assert!(u.wait_any() > 0);
        u.shutdown(0);
    });
    assert_eq!(code, 0);
}

#[test]
fn mutex_rejects_non_owner_unlock() {
    let code = common::run(1, |u| {
        if u.forked_child() {
            let ctx = u.kernel_ctx();
            let sync = &ctx.kernel().sync;
            // The parent holds it; unlocking from here must fail.
            assert!(sync.mutex_unlock(ctx, 1).is_err());
            u.exit(0);
        }

        let ctx = u.kernel_ctx();
        let sync = &ctx.kernel().sync;
        sync.mutex_init(1).unwrap();
        sync.mutex_lock(ctx, 1).unwrap();

        let pid = u.fork();
        assert!(pid > 0);
        let (reaped, status) = u.wait();
        assert_eq!((reaped, status), (pid, 0));

        let ctx = u.kernel_ctx();
        let sync = &ctx.kernel().sync;
        sync.mutex_unlock(ctx, 1).unwrap();
        // Bad ids are rejected across the board.
        assert!(sync.sem_post(ctx, 4096).is_err());
        assert!(sync.mutex_lock(ctx, 4096).is_err());
        u.shutdown(0);
    });
    assert_eq!(code, 0);
}

#[test]
fn rwlock_admits_readers_and_excludes_writers() {
    let code = common::run(1, |u| {
        if u.forked_child() {
            let ctx = u.kernel_ctx();
            let sync = &ctx.kernel().sync;
            // Blocks while the parent still reads.
            sync.rwlock_write_lock(ctx, 2).unwrap();
            let wfd = u.load_u32(64) as i32;
            assert_eq!(u.write(wfd, &[b'W']), 1);
            sync.rwlock_write_unlock(ctx, 2).unwrap();
            u.exit(0);
        }

        let (ret, rfd, wfd) = u.pipe();
        assert_eq!(ret, 0);
        u.store_u32(64, wfd as u32);

        {
            let ctx = u.kernel_ctx();
            let sync = &ctx.kernel().sync;
            sync.rwlock_init(2).unwrap();
            sync.rwlock_read_lock(ctx, 2).unwrap();
            sync.rwlock_read_lock(ctx, 2).unwrap(); // readers may share
        }

        let pid = u.fork();
        assert!(pid > 0);
        assert_eq!(u.pause(5), 0);

        {
            let ctx = u.kernel_ctx();
            let sync = &ctx.kernel().sync;
            sync.rwlock_read_unlock(ctx, 2).unwrap();
            // The writer is still shut out by the second reader.
            sync.rwlock_read_unlock(ctx, 2).unwrap();
        }
        let (n, data) = u.read(rfd, 1);
        assert_eq!((n, data.as_slice()), (1, &b"W"[..]));
        assert!(u.wait_any() > 0);
        u.shutdown(0);
    });
    assert_eq!(code, 0);
}

#[test]
fn condition_wait_pairs_with_its_mutex() {
    let code = common::run(1, |u| {
        if u.forked_child() {
            let ctx = u.kernel_ctx();
            let sync = &ctx.kernel().sync;
            sync.mutex_lock(ctx, 5).unwrap();
            // Wait drops the mutex while asleep and retakes it after.
            sync.cond_wait(ctx, 6, 5).unwrap();
            sync.mutex_unlock(ctx, 5).unwrap();
            let wfd = u.load_u32(64) as i32;
            assert_eq!(u.write(wfd, &[b'c']), 1);
            u.exit(0);
        }

        let (ret, rfd, wfd) = u.pipe();
        assert_eq!(ret, 0);
        u.store_u32(64, wfd as u32);
        {
            let ctx = u.kernel_ctx();
            let sync = &ctx.kernel().sync;
            sync.mutex_init(5).unwrap();
            sync.cond_init(6).unwrap();
        }

        let pid = u.fork();
        assert!(pid > 0);
        assert_eq!(u.pause(5), 0);

        {
            let ctx = u.kernel_ctx();
            let sync = &ctx.kernel().sync;
            // The child holds the mutex only while not waiting, so
            // this cannot deadlock.
            sync.mutex_lock(ctx, 5).unwrap();
            sync.cond_signal(ctx, 6).unwrap();
            sync.mutex_unlock(ctx, 5).unwrap();
        }
        let (n, data) = u.read(rfd, 1);
        assert_eq!((n, data.as_slice()), (1, &b"c"[..]));
        assert!(u.wait_any() > 0);
        u.shutdown(0);
    });
    assert_eq!(code, 0);
}
