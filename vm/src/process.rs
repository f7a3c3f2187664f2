//! Hooks into the scheduler and the hardware page tables.

use crate::mem::PhysFrame;
use alloc::sync::Arc;

pub type Pid = u16;

/// A process's hardware page directory.
///
/// All addresses are user virtual addresses. Implementations must tolerate
/// `clear` and the bit accessors being called for addresses with no mapping.
pub trait AddressSpace: Send + Sync {
    /// Maps the page at `vaddr` to `frame`. Returns `false` if the page
    /// directory could not be extended.
    fn install(&self, vaddr: usize, frame: PhysFrame, writable: bool) -> bool;

    /// Marks the page at `vaddr` not present.
    fn clear(&self, vaddr: usize);

    fn is_dirty(&self, vaddr: usize) -> bool;

    fn is_accessed(&self, vaddr: usize) -> bool;

    fn clear_accessed(&self, vaddr: usize);
}

/// Lookup of live processes by pid.
pub trait ProcessTable: Send + Sync {
    /// The page directory of `pid`, or `None` once the process has exited.
    fn address_space(&self, pid: Pid) -> Option<Arc<dyn AddressSpace>>;
}
