pub mod intr;
pub mod mutex;
pub mod watchdog;

pub use intr::{hold_interrupts, InterruptsGuard};
pub use mutex::{Mutex, MutexGuard};
pub use watchdog::Watchdog;
