//! Program images and `exec`.
//!
//! Program loading is a machine service on this kernel: images are
//! host closures registered by path at boot, and the file system
//! carries a marker file at the same path so resolution, permissions
//! and link counts behave normally. `kexec` builds the complete
//! replacement address space — stack, argument strings, argv array —
//! before swapping it in, so a failed exec leaves the caller intact.

use std::sync::Arc;

use arrayvec::ArrayVec;

use crate::errno::KernelError;
use crate::fs::{self, InodeType};
use crate::kernel::KernelCtx;
use crate::lock::Spinlock;
use crate::param::{MAXARG, MAXPATH};
use crate::trampoline::{UserCtx, USER_STACK_TOP};
use crate::vm::UserMemory;

/// A user program: the code the process runs when "in user mode".
pub type UserProgram = Arc<dyn Fn(&mut UserCtx<'_>) + Send + Sync>;

struct Image {
    path: Vec<u8>,
    entry: UserProgram,
}

/// Registered program images, indexed by the value stored in a
/// trap frame's `epc`.
pub struct ProgramRegistry {
    images: Spinlock<Vec<Image>>,
}

impl ProgramRegistry {
    pub fn new() -> Self {
        Self {
            images: Spinlock::new("programs", Vec::new()),
        }
    }

    pub fn register(&self, path: &str, entry: UserProgram) -> usize {
        let mut images = self.images.lock();
        images.push(Image {
            path: path.as_bytes().to_vec(),
            entry,
        });
        images.len() - 1
    }

    pub fn lookup(&self, path: &[u8]) -> Option<usize> {
        let images = self.images.lock();
        images.iter().position(|img| img.path == path)
    }

    pub fn entry(&self, idx: usize) -> Option<UserProgram> {
        let images = self.images.lock();
        images.get(idx).map(|img| img.entry.clone())
    }
}

impl Default for ProgramRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Replace the calling process's image with the program at `path`,
/// passing `argv`. Returns argc, which lands in a0.
pub fn kexec(
    ctx: &KernelCtx,
    path: &[u8],
    argv: &[ArrayVec<u8, MAXPATH>],
) -> Result<usize, KernelError> {
    let kernel = ctx.kernel();
    // By convention argv[0] names the program; a zero argc would also
    // make the new image look like a forked child (a0 == 0).
    if argv.is_empty() || argv.len() > MAXARG {
        return Err(KernelError::Invalid);
    }

    // The path must name a real file.
    {
        let tx = kernel.fs.begin_tx(ctx);
        let ip = match fs::namei(ctx, &tx, path) {
            Ok(ip) => ip,
            Err(e) => {
                tx.end(ctx);
                return Err(e);
            }
        };
        let guard = ip.lock(ctx);
        let typ = guard.typ;
        guard.free(ctx);
        ip.put(&tx, ctx);
        tx.end(ctx);
        if typ != InodeType::File {
            return Err(KernelError::Invalid);
        }
    }

    let prog = kernel.programs.lookup(path).ok_or(KernelError::NoEntry)?;

    // Build the whole new image before touching the old one.
    let trap_frame = ctx.data().trap_frame;
    let mut memory = UserMemory::new(&kernel.mm, kernel.trampoline, trap_frame)?;
    memory.alloc(USER_STACK_TOP)?;

    // Copy the argument strings onto the new stack, then the argv
    // pointer array, NUL-terminated.
    let mut sp = USER_STACK_TOP;
    let mut arg_addrs: ArrayVec<u64, { MAXARG + 1 }> = ArrayVec::new();
    for arg in argv {
        sp = sp
            .checked_sub(arg.len() + 1)
            .ok_or(KernelError::NoMemory)?;
        sp &= !7;
        memory
            .copy_out(crate::addr::UVAddr::new(sp), arg)
            .map_err(|_| KernelError::NoMemory)?;
        memory
            .copy_out(crate::addr::UVAddr::new(sp + arg.len()), &[0])
            .map_err(|_| KernelError::NoMemory)?;
        arg_addrs.push(sp as u64);
    }
    arg_addrs.push(0);

    sp = sp
        .checked_sub(arg_addrs.len() * 8)
        .ok_or(KernelError::NoMemory)?;
    sp &= !15;
    let argv_addr = sp;
    for (i, addr) in arg_addrs.iter().enumerate() {
        memory
            .copy_out(crate::addr::UVAddr::new(sp + i * 8), &addr.to_ne_bytes())
            .map_err(|_| KernelError::NoMemory)?;
    }

    // Commit point: swap the image and enter the new program.
    let argc = argv.len();
    let name: Vec<u8> = path
        .rsplit(|&b| b == b'/')
        .next()
        .unwrap_or(path)
        .to_vec();
    let old = ctx.data_mut().memory.replace(memory);
    drop(old);
    ctx.data_mut().set_name(&name);

    let tf = ctx.trap_frame_mut();
    tf.epc = prog as u64;
    tf.sp = sp as u64;
    tf.a[0] = argc as u64;
    tf.a[1] = argv_addr as u64;
    Ok(argc)
}
