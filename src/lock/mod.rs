//! The lock module.
//!
//! Spin locks disable interrupts on the current hart for as long as
//! they are held; sleepable locks pair a spin lock with a wait channel
//! so a holder can block; sleep locks are long-term locks acquired and
//! released across voluntary sleeps.

mod sleepablelock;
mod sleeplock;
mod spinlock;

pub use sleepablelock::{Sleepablelock, SleepablelockGuard};
pub use sleeplock::{SleepLock, SleepLockGuard};
pub use spinlock::{RawSpinlock, Spinlock, SpinlockGuard};

/// Lock guards whose inner spin lock can be temporarily surrendered
/// while the owner sleeps in a `WaitChannel`.
pub trait Waitable {
    /// Releases the inner `RawSpinlock`.
    ///
    /// # Safety
    ///
    /// `raw_release()` and `raw_acquire()` must always be used as a
    /// pair, and the guard must not be accessed in between.
    unsafe fn raw_release(&mut self);

    /// Acquires the inner `RawSpinlock`.
    ///
    /// # Safety
    ///
    /// See `raw_release()`.
    unsafe fn raw_acquire(&mut self);
}
