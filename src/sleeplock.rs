//! Long-term locks for kernel threads.
//!
//! The file system keeps an inode or buffer locked across disk I/O
//! that can take milliseconds; spinning that long would burn the CPU
//! and holding a spinlock across a yield is illegal. A sleep-lock
//! yields the CPU while waiting and leaves interrupts enabled while
//! held, so it cannot be used from interrupt handlers or inside a
//! spinlock critical section.

use core::{
    cell::{Cell, UnsafeCell},
    ops::{Deref, DerefMut},
};

use crate::{cpu::CPU_TABLE, proc::Event, process::PROCESS_TABLE, spinlock::SpinLock};

pub struct SleepLock<T> {
    inner_lock: SpinLock<()>,
    locked: Cell<bool>,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for SleepLock<T> {}

impl<T> SleepLock<T> {
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            inner_lock: SpinLock::new((), name),
            locked: Cell::new(false),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        let mut guard = self.inner_lock.lock();

        while self.locked.get() {
            let p = unsafe { CPU_TABLE.my_proc() };
            guard = p.sleep(self.wait_event(), guard);
        }

        self.locked.set(true);
        drop(guard);

        SleepLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
        }
    }

    #[inline]
    fn wait_event(&self) -> Event {
        Event::SleepLock {
            addr: self.locked.as_ptr() as usize,
        }
    }

    /// called by the guard when dropped.
    fn unlock(&self) {
        let guard = self.inner_lock.lock();
        self.locked.set(false);
        unsafe { PROCESS_TABLE.wakeup(self.wait_event()) };
        drop(guard);
    }
}

pub struct SleepLockGuard<'a, T> {
    lock: &'a SleepLock<T>,
    data: &'a mut T,
}

impl<'a, T> Deref for SleepLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &*self.data
    }
}

impl<'a, T> DerefMut for SleepLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T> Drop for SleepLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
