//! Higher-level synchronization primitives, built on sleep/wakeup:
//! counting semaphores, owner-checked mutexes, condition variables,
//! and readers/writer locks. Each category is a fixed pool keyed by a
//! small integer id; operations return `Ok(0)` or an error for a bad
//! id or an unlock by a non-owner.

use crate::errno::KernelError;
use crate::kernel::KernelCtx;
use crate::lock::Sleepablelock;
use crate::param::{NCOND, NMUTEX, NRWLOCK, NSEM};
use crate::proc::Pid;

use array_macro::array;

struct MutexState {
    locked: bool,
    owner: Pid,
}

struct CondState {
    waiters: u32,
}

struct RwState {
    readers: u32,
    writer: bool,
    owner: Pid,
}

pub struct SyncPools {
    sems: [Sleepablelock<i32>; NSEM],
    mutexes: [Sleepablelock<MutexState>; NMUTEX],
    conds: [Sleepablelock<CondState>; NCOND],
    rwlocks: [Sleepablelock<RwState>; NRWLOCK],
}

impl SyncPools {
    pub fn new() -> Self {
        Self {
            sems: array![_ => Sleepablelock::new("semaphore", 0); NSEM],
            mutexes: array![_ => Sleepablelock::new("mutex", MutexState { locked: false, owner: -1 }); NMUTEX],
            conds: array![_ => Sleepablelock::new("condition", CondState { waiters: 0 }); NCOND],
            rwlocks: array![_ => Sleepablelock::new("rwlock", RwState { readers: 0, writer: false, owner: -1 }); NRWLOCK],
        }
    }

    fn sem(&self, id: usize) -> Result<&Sleepablelock<i32>, KernelError> {
        self.sems.get(id).ok_or(KernelError::Invalid)
    }

    fn mutex(&self, id: usize) -> Result<&Sleepablelock<MutexState>, KernelError> {
        self.mutexes.get(id).ok_or(KernelError::Invalid)
    }

    fn cond(&self, id: usize) -> Result<&Sleepablelock<CondState>, KernelError> {
        self.conds.get(id).ok_or(KernelError::Invalid)
    }

    fn rw(&self, id: usize) -> Result<&Sleepablelock<RwState>, KernelError> {
        self.rwlocks.get(id).ok_or(KernelError::Invalid)
    }

    /// Reset a semaphore's counter.
    pub fn sem_init(&self, id: usize, value: i32) -> Result<usize, KernelError> {
        if value < 0 {
            return Err(KernelError::Invalid);
        }
        *self.sem(id)?.lock() = value;
        Ok(0)
    }

    /// P: sleep while the counter is zero, then take one.
    pub fn sem_wait(&self, ctx: &KernelCtx, id: usize) -> Result<usize, KernelError> {
        let mut guard = self.sem(id)?.lock();
        while *guard <= 0 {
            guard.sleep(ctx);
        }
        *guard -= 1;
        Ok(0)
    }

    /// V: add one and wake waiters.
    pub fn sem_post(&self, ctx: &KernelCtx, id: usize) -> Result<usize, KernelError> {
        let mut guard = self.sem(id)?.lock();
        *guard += 1;
        guard.wakeup(ctx.kernel());
        Ok(0)
    }

    pub fn mutex_init(&self, id: usize) -> Result<usize, KernelError> {
        let mut guard = self.mutex(id)?.lock();
        guard.locked = false;
        guard.owner = -1;
        Ok(0)
    }

    pub fn mutex_lock(&self, ctx: &KernelCtx, id: usize) -> Result<usize, KernelError> {
        let me = ctx.pid();
        let mut guard = self.mutex(id)?.lock();
        while guard.locked && guard.owner != me {
            guard.sleep(ctx);
        }
        guard.locked = true;
        guard.owner = me;
        Ok(0)
    }

    /// Only the owner may unlock.
    pub fn mutex_unlock(&self, ctx: &KernelCtx, id: usize) -> Result<usize, KernelError> {
        let me = ctx.pid();
        let mut guard = self.mutex(id)?.lock();
        if !guard.locked || guard.owner != me {
            return Err(KernelError::Invalid);
        }
        guard.locked = false;
        guard.owner = -1;
        guard.wakeup(ctx.kernel());
        Ok(0)
    }

    pub fn cond_init(&self, id: usize) -> Result<usize, KernelError> {
        self.cond(id)?.lock().waiters = 0;
        Ok(0)
    }

    /// Wait on a condition, atomically dropping the paired mutex; the
    /// mutex is held again on return. The mutex is re-taken after the
    /// condition lock is released, so no spin lock is ever held across
    /// the blocking re-acquire.
    pub fn cond_wait(
        &self,
        ctx: &KernelCtx,
        cond_id: usize,
        mutex_id: usize,
    ) -> Result<usize, KernelError> {
        let cond = self.cond(cond_id)?;
        let _ = self.mutex(mutex_id)?;

        let mut guard = cond.lock();
        // Releasing the mutex while holding the condition lock closes
        // the window: a signal must take the condition lock first.
        self.mutex_unlock(ctx, mutex_id)?;
        guard.waiters += 1;
        guard.sleep(ctx);
        guard.waiters -= 1;
        drop(guard);

        self.mutex_lock(ctx, mutex_id)?;
        Ok(0)
    }

    /// Wake waiters on the condition. Wakes every waiter, so signal
    /// and broadcast are the same operation here.
    pub fn cond_signal(&self, ctx: &KernelCtx, id: usize) -> Result<usize, KernelError> {
        let guard = self.cond(id)?.lock();
        if guard.waiters > 0 {
            guard.wakeup(ctx.kernel());
        }
        Ok(0)
    }

    pub fn cond_broadcast(&self, ctx: &KernelCtx, id: usize) -> Result<usize, KernelError> {
        self.cond_signal(ctx, id)
    }

    pub fn rwlock_init(&self, id: usize) -> Result<usize, KernelError> {
        let mut guard = self.rw(id)?.lock();
        guard.readers = 0;
        guard.writer = false;
        guard.owner = -1;
        Ok(0)
    }

    pub fn rwlock_read_lock(&self, ctx: &KernelCtx, id: usize) -> Result<usize, KernelError> {
        let mut guard = self.rw(id)?.lock();
        while guard.writer {
            guard.sleep(ctx);
        }
        guard.readers += 1;
        Ok(0)
    }

    pub fn rwlock_read_unlock(&self, ctx: &KernelCtx, id: usize) -> Result<usize, KernelError> {
        let mut guard = self.rw(id)?.lock();
        if guard.readers == 0 {
            return Err(KernelError::Invalid);
        }
        guard.readers -= 1;
        if guard.readers == 0 {
            guard.wakeup(ctx.kernel());
        }
        Ok(0)
    }

    /// Writers wait for every reader to leave; nothing stops a stream
    /// of readers from starving them.
    pub fn rwlock_write_lock(&self, ctx: &KernelCtx, id: usize) -> Result<usize, KernelError> {
        let me = ctx.pid();
        let mut guard = self.rw(id)?.lock();
        while guard.writer || guard.readers > 0 {
            guard.sleep(ctx);
        }
        guard.writer = true;
        guard.owner = me;
        Ok(0)
    }

    pub fn rwlock_write_unlock(&self, ctx: &KernelCtx, id: usize) -> Result<usize, KernelError> {
        let me = ctx.pid();
        let mut guard = self.rw(id)?.lock();
        if !guard.writer || guard.owner != me {
            return Err(KernelError::Invalid);
        }
        guard.writer = false;
        guard.owner = -1;
        guard.wakeup(ctx.kernel());
        Ok(0)
    }
}

impl Default for SyncPools {
    fn default() -> Self {
        Self::new()
    }
}
