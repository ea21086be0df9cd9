//! Interrupt-flag save/restore.
//!
//! Tokens compose LIFO: a lock acquired with irqsave must be released with
//! irqrestore before any outer token is restored.

use crate::arch;

/// RAII guard: interrupts disabled for the guard's lifetime, previous state
/// restored on drop.
pub struct IrqGuard {
    token: Option<arch::IrqFlags>,
}

impl IrqGuard {
    pub fn new() -> Self {
        Self {
            token: Some(arch::save_and_disable_interrupts()),
        }
    }
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            arch::restore_interrupts(token);
        }
    }
}

/// Run `f` with interrupts disabled, restoring the saved flag afterwards.
pub fn with_irqs_disabled<T>(f: impl FnOnce() -> T) -> T {
    let _guard = IrqGuard::new();
    f()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch;

    #[test]
    fn guard_restores_prior_state() {
        assert!(arch::interrupts_enabled());
        {
            let _g = IrqGuard::new();
            assert!(!arch::interrupts_enabled());
            {
                let _inner = IrqGuard::new();
                assert!(!arch::interrupts_enabled());
            }
            // inner guard restores to "disabled", not "enabled"
            assert!(!arch::interrupts_enabled());
        }
        assert!(arch::interrupts_enabled());
    }

    #[test]
    fn closure_form_restores() {
        let r = with_irqs_disabled(|| {
            assert!(!arch::interrupts_enabled());
            42
        });
        assert_eq!(r, 42);
        assert!(arch::interrupts_enabled());
    }
}
