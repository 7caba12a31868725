//! Sleepable locks: a spin lock with an attached wait channel, so the
//! holder can atomically release the lock and sleep on its condition.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

use super::{RawSpinlock, Waitable};
use crate::kernel::{Kernel, KernelCtx};
use crate::proc::WaitChannel;

pub struct Sleepablelock<T> {
    lock: RawSpinlock,
    /// WaitChannel for the condition the data guards.
    waitchannel: WaitChannel,
    data: UnsafeCell<T>,
}

// SAFETY: the raw lock serializes access to `data`.
unsafe impl<T: Send> Sync for Sleepablelock<T> {}

impl<T> Sleepablelock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            lock: RawSpinlock::new(name),
            waitchannel: WaitChannel::new(),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> SleepablelockGuard<'_, T> {
        self.lock.acquire();
        SleepablelockGuard {
            lock: self,
            _marker: PhantomData,
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Returns a raw pointer to the inner data without locking. The
    /// caller must ensure that accessing it does not race.
    pub fn get_mut_raw(&self) -> *mut T {
        self.data.get()
    }
}

pub struct SleepablelockGuard<'s, T> {
    lock: &'s Sleepablelock<T>,
    _marker: PhantomData<*const ()>,
}

impl<T> SleepablelockGuard<'_, T> {
    /// Atomically releases the lock and sleeps on the lock's channel;
    /// the lock is held again when this returns.
    pub fn sleep(&mut self, ctx: &KernelCtx) {
        let lock = self.lock;
        lock.waitchannel.sleep(self, ctx);
    }

    /// Wakes every process sleeping on the lock's channel.
    pub fn wakeup(&self, kernel: &Kernel) {
        self.lock.waitchannel.wakeup(kernel);
    }

    /// Temporarily releases the lock, runs `f`, and reacquires.
    pub fn reacquire_after<F, U>(&mut self, f: F) -> U
    where
        F: FnOnce() -> U,
    {
        self.lock.lock.release();
        let r = f();
        self.lock.lock.acquire();
        r
    }
}

impl<T> Waitable for SleepablelockGuard<'_, T> {
    unsafe fn raw_release(&mut self) {
        self.lock.lock.release();
    }

    unsafe fn raw_acquire(&mut self) {
        self.lock.lock.acquire();
    }
}

impl<T> Drop for SleepablelockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.lock.release();
    }
}

impl<T> Deref for SleepablelockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: holding the guard means holding the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SleepablelockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: holding the guard means holding the lock, and &mut
        // self is exclusive.
        unsafe { &mut *self.lock.data.get() }
    }
}
