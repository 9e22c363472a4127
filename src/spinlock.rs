//! Spinlocks protect data shared between kernel threads and interrupt
//! handlers.
//!
//! Acquiring disables interrupts on the current CPU first: if an
//! interrupt handler tried to take a lock its own CPU already holds,
//! it would spin forever. Interrupts may still fire on other CPUs.
//!
//! The lock is a smart pointer: the data lives inside it and is only
//! reachable through the guard, so "forgot to take the lock" is a
//! compile error rather than a rare crash. Dropping the guard
//! releases the lock.

use core::{
    cell::{Cell, UnsafeCell},
    ops::{Deref, DerefMut},
    sync::atomic::{fence, AtomicBool, Ordering},
};

use crate::cpu::{self, CpuTable};

pub struct SpinLock<T: ?Sized> {
    locked: AtomicBool,
    name: &'static str, // for panic messages
    cpu_id: Cell<isize>,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            locked: AtomicBool::new(false),
            name,
            cpu_id: Cell::new(-1),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.acquire();
        SpinLockGuard {
            inner: self,
            data: unsafe { &mut *self.data.get() },
        }
    }

    fn acquire(&self) {
        // disable interrupts to avoid deadlock with handlers.
        cpu::push_off();
        if self.holding() {
            panic!("acquire {}: already held by cpu {}", self.name, self.cpu_id.get());
        }

        while self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {}
        fence(Ordering::SeqCst);

        self.cpu_id.set(CpuTable::cpu_id() as isize);
    }

    fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed) && self.cpu_id.get() == CpuTable::cpu_id() as isize
    }

    fn release(&self) {
        if !self.holding() {
            panic!("release {}: not held", self.name);
        }
        self.cpu_id.set(-1);
        fence(Ordering::SeqCst);
        self.locked.store(false, Ordering::Release);

        cpu::pop_off();
    }

    /// Release without a guard. Needed where lock ownership crosses a
    /// context switch: the scheduler acquires a process lock, and the
    /// process's first instructions release it.
    pub unsafe fn unlock(&self) {
        self.release();
    }
}

pub struct SpinLockGuard<'a, T: ?Sized> {
    inner: &'a SpinLock<T>,
    data: &'a mut T,
}

impl<'a, T: ?Sized> SpinLockGuard<'a, T> {
    /// Give up the lock but remember it, so `sleep` can release a
    /// condition lock and re-acquire it after waking.
    pub fn weak(self) -> SpinLockWeakGuard<'a, T> {
        let weak = SpinLockWeakGuard { inner: self.inner };
        drop(self);
        weak
    }
}

impl<'a, T: ?Sized> Deref for SpinLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        self.inner.release();
    }
}

pub struct SpinLockWeakGuard<'a, T: ?Sized> {
    inner: &'a SpinLock<T>,
}

impl<'a, T: ?Sized> SpinLockWeakGuard<'a, T> {
    pub fn lock(self) -> SpinLockGuard<'a, T> {
        self.inner.lock()
    }
}
