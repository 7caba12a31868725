//! File-system behavior: multi-level block mapping, link counts,
//! round trips, orphan reclaim, and the buffer cache.

mod common;

use kernel::fs::{InodeType, MAXFILE, NDIRECT, NINDIRECT, NINDIRECT2};
use kernel::mkfs;
use kernel::syscall::{O_CREATE, O_RDONLY, O_RDWR};

const BSIZE: usize = 4096;

fn tagged_block(bn: u32) -> Vec<u8> {
    let mut block = vec![0u8; BSIZE];
    block[..4].copy_from_slice(&bn.to_ne_bytes());
    block[BSIZE - 4..].copy_from_slice(&(!bn).to_ne_bytes());
    block
}

#[test]
fn large_file_spans_direct_single_and_double_indirect() {
    const NBLOCKS: u32 = 1100; // direct 0..10, single to 1034, double past it
    let disk = mkfs::make_fs(4096, &[("init", b"")]);
    let code = common::boot_with(1, disk, Vec::new(), |u| {
        let fd = u.open("/big", O_CREATE | O_RDWR) as i32;
        assert!(fd >= 0);
        for bn in 0..NBLOCKS {
            assert_eq!(u.write(fd, &tagged_block(bn)), BSIZE as i64);
        }
        let (ret, st) = u.fstat(fd);
        assert_eq!(ret, 0);
        assert_eq!(st.size, NBLOCKS as u64 * BSIZE as u64);
        assert_eq!(st.nlink, 1);
        assert_eq!(u.close(fd), 0);

        // Read it all back; the probes cover each mapping region and
        // both boundaries.
        let probes = [0u32, 5, 9, 10, 11, 100, 1033, 1034, 1035, 1099];
        let fd = u.open("/big", O_RDONLY) as i32;
        assert!(fd >= 0);
        for bn in 0..NBLOCKS {
            let mut block = Vec::with_capacity(BSIZE);
            while block.len() < BSIZE {
                let (n, data) = u.read(fd, BSIZE / 2);
                assert_eq!(n, (BSIZE / 2) as i64);
                block.extend_from_slice(&data);
            }
            if probes.contains(&bn) {
                assert_eq!(block, tagged_block(bn), "block {} corrupt", bn);
            }
        }
        let (n, _) = u.read(fd, 16);
        assert_eq!(n, 0, "read past end of file");
        assert_eq!(u.close(fd), 0);

        assert_eq!(u.unlink("/big"), 0);
        assert_eq!(u.open("/big", O_RDONLY), -1);

        // The freed space is reusable.
        let fd = u.open("/again", O_CREATE | O_RDWR) as i32;
        for bn in 0..32 {
            assert_eq!(u.write(fd, &tagged_block(bn)), BSIZE as i64);
        }
        assert_eq!(u.close(fd), 0);
        u.shutdown(0);
    })
    .run();
    assert_eq!(code, 0);
}

#[test]
fn roundtrip_and_link_counts() {
    let code = common::run(1, |u| {
        let fd = u.open("/f", O_CREATE | O_RDWR) as i32;
        assert!(fd >= 0);
        assert_eq!(u.write(fd, b"hello, inode layer"), 18);
        assert_eq!(u.close(fd), 0);

        // A successful link adds exactly one.
        assert_eq!(u.link("/f", "/g"), 0);
        let fd = u.open("/g", O_RDONLY) as i32;
        let (_, st) = u.fstat(fd);
        assert_eq!(st.nlink, 2);
        let (n, data) = u.read(fd, 32);
        assert_eq!(n, 18);
        assert_eq!(&data, b"hello, inode layer");
        assert_eq!(u.close(fd), 0);

        // Linking to an existing name fails and changes nothing.
        assert_eq!(u.link("/f", "/g"), -1);
        assert_eq!(u.geterrno(), 17); // exists
        let fd = u.open("/f", O_RDONLY) as i32;
        let (_, st) = u.fstat(fd);
        assert_eq!(st.nlink, 2);
        assert_eq!(u.close(fd), 0);

        // A successful unlink removes exactly one.
        assert_eq!(u.unlink("/g"), 0);
        let fd = u.open("/f", O_RDONLY) as i32;
        let (_, st) = u.fstat(fd);
        assert_eq!(st.nlink, 1);
        assert_eq!(u.close(fd), 0);

        assert_eq!(u.unlink("/f"), 0);
        assert_eq!(u.open("/f", O_RDONLY), -1);
        assert_eq!(u.geterrno(), 2); // no-entry
        u.shutdown(0);
    });
    assert_eq!(code, 0);
}

#[test]
fn directories_and_relative_paths() {
    let code = common::run(1, |u| {
        assert_eq!(u.mkdir("/dir"), 0);
        assert_eq!(u.mkdir("/dir"), -1);
        assert_eq!(u.geterrno(), 17);

        assert_eq!(u.chdir("/dir"), 0);
        let fd = u.open("f", O_CREATE | O_RDWR) as i32;
        assert!(fd >= 0);
        assert_eq!(u.write(fd, b"rel"), 3);
        assert_eq!(u.close(fd), 0);

        // Visible through the absolute path and through "..".
        assert!(u.open("/dir/f", O_RDONLY) >= 0);
        assert!(u.open("../dir/f", O_RDONLY) >= 0);

        // A non-empty directory cannot be unlinked.
        assert_eq!(u.chdir("/"), 0);
        assert_eq!(u.unlink("/dir"), -1);
        assert_eq!(u.unlink("/dir/f"), 0);
        assert_eq!(u.unlink("/dir"), 0);
        assert_eq!(u.chdir("/dir"), -1);
        assert_eq!(u.geterrno(), 2);
        u.shutdown(0);
    });
    assert_eq!(code, 0);
}

#[test]
fn orphaned_inode_is_reclaimed_at_mount() {
    // First boot: unlink a file that is still open, then power off
    // without closing it. The disk now carries an allocated inode with
    // no links.
    let machine = common::boot(1, |u| {
        let fd = u.open("/orph", O_CREATE | O_RDWR) as i32;
        assert!(fd >= 0);
        assert_eq!(u.write(fd, &[7u8; 4096]), 4096);
        assert_eq!(u.unlink("/orph"), 0);
        // fd intentionally left open.
        u.shutdown(0);
    });
    let kernel = machine.kernel();
    assert_eq!(machine.run(), 0);
    let disk = kernel.hal.disk.snapshot();

    // Second boot on the same disk: mount reclaims the orphan.
    let machine = common::boot_with(1, disk, Vec::new(), |u| {
        assert_eq!(u.open("/orph", O_RDONLY), -1);
        u.shutdown(0);
    });
    let kernel = machine.kernel();
    assert_eq!(machine.run(), 0);
    let uart = String::from_utf8_lossy(&kernel.hal.uart.output()).to_string();
    assert!(
        uart.contains("ireclaim: orphaned inode"),
        "mount did not report the orphan: {:?}",
        uart
    );
}

#[test]
fn buffer_cache_reuses_blocks_and_maps_triple_indirect() {
    let code = common::run(1, |u| {
        let ctx = u.kernel_ctx();
        let kernel = ctx.kernel();

        // Buffer uniqueness: the same (dev, block) key lands in the
        // same slot, and a cached block costs no device read.
        let buf = kernel.bcache.get(1, 60, ctx);
        let slot = buf.cache_index();
        buf.free(ctx);
        let reads_after_first = kernel.hal.disk.read_count();
        let buf = kernel.bcache.get(1, 60, ctx);
        assert_eq!(buf.cache_index(), slot);
        buf.free(ctx);
        assert_eq!(kernel.hal.disk.read_count(), reads_after_first);

        // The triple-indirect region maps and truncates correctly;
        // write offsets cannot reach it, so drive bmap directly.
        let tx = kernel.fs.begin_tx(ctx);
        let ip = kernel
            .fs
            .itable
            .alloc_inode(1, InodeType::File, &tx, ctx)
            .expect("alloc inode");
        let mut guard = ip.lock(ctx);
        let bn = NDIRECT + NINDIRECT + NINDIRECT2 + 5;
        assert!(bn < MAXFILE);
        let addr = guard.bmap_or_alloc(bn, &tx, ctx);
        assert_ne!(addr, 0, "triple-indirect allocation failed");
        assert_eq!(guard.bmap(bn, ctx), addr);
        assert_eq!(guard.bmap(bn + 1, ctx), 0, "unwritten block is a hole");
        assert!(guard.blocks >= 4, "data block plus three indirect levels");
        guard.trunc(&tx, ctx);
        assert_eq!(guard.blocks, 0);
        guard.free(ctx);
        // nlink is zero, so the final put reclaims the inode on disk.
        ip.put(&tx, ctx);
        tx.end(ctx);

        // Push every dirty cached block out; harmless at quiescence.
        kernel.bcache.flush(1, ctx);

        u.shutdown(0);
    });
    assert_eq!(code, 0);
}
