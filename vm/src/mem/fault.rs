//! Turning a user page fault into a resident page, or a dead process.

use super::user::ProcessMemory;
use super::{VirtualMemory, VmError};
use kidneyos_shared::mem::pg_round_down;
use log::{info, trace};

/// What the CPU reported about a page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    /// The faulting address (CR2).
    pub addr: usize,
    /// The page was present, so this was a protection violation.
    pub present: bool,
    pub write: bool,
    /// The fault happened in user mode.
    pub user: bool,
    /// The user stack pointer: from the trap frame for user-mode faults, as
    /// saved on system call entry for kernel-mode faults.
    pub esp: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillReason {
    NullAddress,
    ProtectionViolation,
    KernelAddress,
    /// No page is registered at the address and it is not stack growth.
    Unmapped,
    LoadFailed(VmError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The page is mapped; retry the instruction.
    Resolved,
    /// The faulting process must be terminated.
    Kill(KillReason),
}

impl ProcessMemory {
    /// Resolves a not-present fault by loading the registered page or growing
    /// the stack.
    pub fn handle_page_fault(&self, vm: &VirtualMemory, fault: &PageFault) -> FaultOutcome {
        let outcome = self.resolve_fault(vm, fault);
        match outcome {
            FaultOutcome::Resolved => trace!("pid {}: resolved {fault:x?}", self.pid()),
            FaultOutcome::Kill(reason) => {
                info!("pid {}: killed by {fault:x?}: {reason:?}", self.pid());
            }
        }
        outcome
    }

    fn resolve_fault(&self, vm: &VirtualMemory, fault: &PageFault) -> FaultOutcome {
        let config = vm.config();
        if fault.addr == 0 {
            return FaultOutcome::Kill(KillReason::NullAddress);
        }
        if fault.present {
            return FaultOutcome::Kill(KillReason::ProtectionViolation);
        }
        if fault.addr >= config.user_limit || fault.esp >= config.user_limit {
            return FaultOutcome::Kill(KillReason::KernelAddress);
        }

        let page = pg_round_down(fault.addr);
        let entry = self.page_table.find_entry(page);
        let stack_growth = fault.esp.saturating_sub(config.stack_slack) <= fault.addr
            && fault.esp >= config.stack_bottom();

        let loaded = match entry {
            Some(entry) => self.page_table.load(vm, &entry),
            None if stack_growth => self.page_table.create_and_allocate(vm, page).map(|_| ()),
            None => return FaultOutcome::Kill(KillReason::Unmapped),
        };
        match loaded {
            Ok(()) => FaultOutcome::Resolved,
            Err(err) => FaultOutcome::Kill(KillReason::LoadFailed(err)),
        }
    }
}
