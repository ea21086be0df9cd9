//! Test-and-set spinlock with a PAUSE fast path and an owner-CPU tag.
//!
//! Acquire spins on a relaxed load before attempting the compare-exchange,
//! so contended waiters do not bounce the cache line. Acquisition is an
//! acquire barrier, release a release barrier. The owner-CPU tag is
//! recorded for deadlock diagnostics.
//!
//! Holders must not block on I/O, and the run-queue lock is never held
//! across an address-space switch.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::arch;
use crate::sync::irq::IrqGuard;

/// No CPU owns this lock.
const NO_OWNER: u32 = u32::MAX;

pub struct SpinLock<T> {
    locked: AtomicBool,
    owner_cpu: AtomicU32,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

/// RAII guard for a held [`SpinLock`].
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

/// RAII guard that also restores the interrupt flag saved at acquisition.
/// Field declaration order makes the lock release before the flag is
/// restored, preserving the acquire-irqsave / release-irqrestore pairing.
pub struct SpinLockIrqGuard<'a, T> {
    inner: SpinLockGuard<'a, T>,
    _irq: IrqGuard,
}

impl<T> SpinLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            owner_cpu: AtomicU32::new(NO_OWNER),
            data: UnsafeCell::new(data),
        }
    }

    fn owner_tag(&self) -> u32 {
        crate::smp::percpu::this_cpu_id() as u32
    }

    /// Spin until the lock is acquired. Disables preemption for the hold.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        crate::smp::percpu::preempt_disable();
        let tag = self.owner_tag();
        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
            while self.locked.load(Ordering::Relaxed) {
                arch::pause();
            }
        }
        self.owner_cpu.store(tag, Ordering::Relaxed);
        SpinLockGuard { lock: self }
    }

    /// Acquire without spinning. Returns `None` when the lock is held.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        crate::smp::percpu::preempt_disable();
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.owner_cpu.store(self.owner_tag(), Ordering::Relaxed);
            Some(SpinLockGuard { lock: self })
        } else {
            crate::smp::percpu::preempt_enable();
            None
        }
    }

    /// Acquire with interrupts disabled; the saved flag is restored when
    /// the guard drops.
    pub fn lock_irqsave(&self) -> SpinLockIrqGuard<'_, T> {
        let irq = IrqGuard::new();
        SpinLockIrqGuard {
            inner: self.lock(),
            _irq: irq,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

impl<'a, T> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.owner_cpu.store(NO_OWNER, Ordering::Relaxed);
        self.lock.locked.store(false, Ordering::Release);
        crate::smp::percpu::preempt_enable();
    }
}

impl<'a, T> Deref for SpinLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Deref for SpinLockIrqGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<'a, T> DerefMut for SpinLockIrqGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}
