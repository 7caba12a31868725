//! Spin locks.

use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use super::Waitable;
use crate::cpu::{self, Cpu};

/// Mutual exclusion lock that busy waits (spins).
pub struct RawSpinlock {
    /// Name of lock, for debugging.
    name: &'static str,

    /// If held, the hart that holds it; otherwise null. A hart
    /// acquiring a lock it already holds is a fatal error.
    locked: AtomicPtr<Cpu>,
}

impl RawSpinlock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            locked: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Acquires the lock, spinning until it is free. Interrupts are
    /// disabled first so the critical section cannot be re-entered from
    /// an interrupt on the same hart.
    pub fn acquire(&self) {
        cpu::push_off();
        assert!(!self.holding(), "acquire {}", self.name);

        let me = cpu::current() as *const Cpu as *mut Cpu;
        while self
            .locked
            .compare_exchange(ptr::null_mut(), me, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spin_loop();
        }
    }

    pub fn release(&self) {
        assert!(self.holding(), "release {}", self.name);
        self.locked.store(ptr::null_mut(), Ordering::Release);
        cpu::pop_off();
    }

    /// Whether the current hart holds the lock. The owner field names
    /// the hart, not the host thread: when control of a hart is handed
    /// to another kernel context, locks held across the handoff travel
    /// with it.
    pub fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed) == cpu::current() as *const Cpu as *mut Cpu
    }
}

/// A spin lock protecting data of type `T`.
pub struct Spinlock<T> {
    lock: RawSpinlock,
    data: UnsafeCell<T>,
}

// SAFETY: the raw lock serializes access to `data`.
unsafe impl<T: Send> Sync for Spinlock<T> {}

impl<T> Spinlock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            lock: RawSpinlock::new(name),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> SpinlockGuard<'_, T> {
        self.lock.acquire();
        SpinlockGuard {
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

pub struct SpinlockGuard<'s, T> {
    lock: &'s Spinlock<T>,
    _marker: PhantomData<*const ()>,
}

// SAFETY: the lock's owner field names a hart, and control of a hart
// moves between kernel contexts only through the scheduler handoff,
// which transfers the guard along with it. The receiving context
// resumes on the same hart the sender ran on, so `holding()` and the
// push_off/pop_off depth both remain consistent.
unsafe impl<T: Send> Send for SpinlockGuard<'_, T> {}

impl<T> SpinlockGuard<'_, T> {
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

impl<T> Waitable for SpinlockGuard<'_, T> {
    unsafe fn raw_release(&mut self) {
        self.lock.lock.release();
    }

    unsafe fn raw_acquire(&mut self) {
        self.lock.lock.acquire();
    }
}

impl<T> Drop for SpinlockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.lock.release();
    }
}

impl<T> Deref for SpinlockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: holding the guard means holding the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: holding the guard means holding the lock, and &mut
        // self is exclusive.
        unsafe { &mut *self.lock.data.get() }
    }
}
