//! Sleep and wakeup.
//!
//! A channel is an opaque token naming an event, conventionally the
//! address of the object the sleeper waits on. `sleep_on` must be
//! called with the condition lock held; it trades that lock for the
//! process lock before publishing the sleep, so a wakeup — which must
//! take the same condition lock before it can decide to wake — cannot
//! slip in between the condition check and the state change.

use crate::kernel::KernelCtx;
use crate::lock::Waitable;
use crate::proc::{scheduler, Procstate};

pub struct WaitChannel {
    /// Padding so distinct channels have distinct addresses.
    _padding: u8,
}

impl WaitChannel {
    pub const fn new() -> Self {
        Self { _padding: 0 }
    }

    fn token(&self) -> usize {
        self as *const WaitChannel as usize
    }

    /// Atomically release the lock behind `lk` and sleep on this
    /// channel; the lock is held again on return.
    pub fn sleep(&self, lk: &mut dyn Waitable, ctx: &KernelCtx) {
        sleep_on(ctx, self.token(), lk);
    }

    /// Wake up all processes sleeping on this channel.
    pub fn wakeup(&self, kernel: &crate::kernel::Kernel) {
        super::wakeup(kernel, self.token());
    }
}

/// The generic sleep primitive; `chan` is any event token.
pub fn sleep_on(ctx: &KernelCtx, chan: usize, lk: &mut dyn Waitable) {
    // Must take the process lock before releasing the condition lock:
    // once we hold it, a wakeup on `chan` cannot complete until we have
    // switched away, so the wakeup cannot be lost.
    let mut guard = ctx.proc().info.lock();
    // SAFETY: reacquired below, and the guard is not used in between.
    unsafe { lk.raw_release() };

    ctx.kernel().sched.on_sleep(ctx.proc_idx(), &mut guard);
    guard.chan = chan;
    guard.state = Procstate::Sleeping;

    let mut guard = scheduler::sched(ctx, guard);

    // Tidy up.
    guard.chan = 0;
    drop(guard);

    // SAFETY: pairs with the release above.
    unsafe { lk.raw_acquire() };
}
