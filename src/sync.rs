use core::ops::{Deref, DerefMut};

use spin::{Mutex, MutexGuard};

use crate::osal::IrqOp;

/// Driver state shared between application context and the USB interrupt.
///
/// Application code locks with the interrupt line masked so the handler can
/// never observe a half-updated table. The interrupt handler itself locks
/// without masking: it cannot be preempted by application code.
pub(crate) struct IrqLock<T> {
    inner: Mutex<T>,
}

impl<T> IrqLock<T> {
    pub fn new(data: T) -> Self {
        Self {
            inner: Mutex::new(data),
        }
    }

    pub fn lock<'a>(&'a self, irq: &'a dyn IrqOp) -> IrqLockGuard<'a, T> {
        let disable_guard = DisableIrqGuard::new(irq);
        let guard = self.inner.lock();
        IrqLockGuard {
            _guard: guard,
            _disable_guard: Some(disable_guard),
        }
    }

    /// Only for the interrupt handler.
    pub fn lock_in_irq(&self) -> IrqLockGuard<'_, T> {
        IrqLockGuard {
            _guard: self.inner.lock(),
            _disable_guard: None,
        }
    }
}

pub(crate) struct IrqLockGuard<'a, T> {
    _guard: MutexGuard<'a, T>,
    _disable_guard: Option<DisableIrqGuard<'a>>,
}

impl<T> Deref for IrqLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self._guard
    }
}

impl<T> DerefMut for IrqLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self._guard
    }
}

pub(crate) struct DisableIrqGuard<'a> {
    irq: &'a dyn IrqOp,
    enable: bool,
}

impl<'a> DisableIrqGuard<'a> {
    fn new(irq: &'a dyn IrqOp) -> Self {
        let enable = irq.is_enabled();
        if enable {
            irq.disable();
        }
        Self { irq, enable }
    }
}

impl Drop for DisableIrqGuard<'_> {
    fn drop(&mut self) {
        if self.enable {
            self.irq.enable();
        }
    }
}
