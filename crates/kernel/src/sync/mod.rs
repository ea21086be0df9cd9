//! Mutual-exclusion and interrupt-flag primitives.

pub mod irq;
pub mod spinlock;

pub use irq::{with_irqs_disabled, IrqGuard};
pub use spinlock::{SpinLock, SpinLockGuard, SpinLockIrqGuard};
