use core::marker::PhantomData;
use core::sync::atomic::{AtomicUsize, Ordering};

static INTR_DISABLE_COUNT: AtomicUsize = AtomicUsize::new(0);

// Increments the disable count, disabling interrupts on bare metal.
fn intr_disable() {
    INTR_DISABLE_COUNT.fetch_add(1, Ordering::SeqCst);
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    unsafe {
        core::arch::asm!("cli", options(nomem, nostack));
    }
}

// Decrements the disable count, and enables interrupts only when the count reaches zero.
fn intr_enable() {
    if INTR_DISABLE_COUNT.fetch_sub(1, Ordering::SeqCst) == 1 {
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        unsafe {
            core::arch::asm!("sti", options(nomem, nostack));
        }
    }
}

/// Whether some `InterruptsGuard` is alive.
#[cfg(test)]
fn interrupts_held() -> bool {
    INTR_DISABLE_COUNT.load(Ordering::SeqCst) > 0
}

/// A guard for withholding interrupts.
///
/// Guards nest: interrupts come back when the outermost one is dropped.
pub struct InterruptsGuard {
    // Interrupt state is per CPU, so the guard must not move between threads.
    _not_send: PhantomData<*mut ()>,
}

/// Prevents interrupts from occurring until the `InterruptsGuard` is dropped.
pub fn hold_interrupts() -> InterruptsGuard {
    intr_disable();
    InterruptsGuard {
        _not_send: PhantomData,
    }
}

impl Drop for InterruptsGuard {
    fn drop(&mut self) {
        intr_enable();
    }
}
