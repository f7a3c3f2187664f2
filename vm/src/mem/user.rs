use super::mmap::Mappings;
use super::page_table::PageTable;
use super::VirtualMemory;
use crate::process::Pid;
use crate::sync::Mutex;
use log::{debug, warn};

/// The user half of one process's address space.
pub struct ProcessMemory {
    pub(super) page_table: PageTable,
    pub(super) mappings: Mutex<Mappings>,
}

impl ProcessMemory {
    pub fn new(pid: Pid) -> Self {
        Self {
            page_table: PageTable::new(pid),
            mappings: Mutex::new(Mappings::default()),
        }
    }

    pub fn pid(&self) -> Pid {
        self.page_table.pid()
    }

    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }

    /// Tears down the address space on exit: every mapping is unmapped,
    /// writing back what changed, then every remaining page is released.
    pub fn destroy(&self, vm: &VirtualMemory) {
        let ids = self.mappings.lock().ids();
        debug!("pid {}: unmapping {} regions on exit", self.pid(), ids.len());
        for id in ids {
            if let Err(err) = self.munmap(vm, id) {
                warn!("pid {}: {err}", self.pid());
            }
        }
        self.page_table.destroy(vm);
    }
}
