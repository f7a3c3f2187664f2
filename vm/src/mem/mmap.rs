//! Memory-mapped files.

use super::frame_table::FileBacking;
use super::page_table::PageDesc;
use super::user::ProcessMemory;
use super::{VirtualMemory, VmError, VmResult};
use crate::fs::File;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use kidneyos_shared::mem::{pages_for, pg_ofs, PAGE_FRAME_SIZE};
use log::{debug, info, warn};

/// Identifies an active mapping within its process.
pub type MapId = usize;

/// An active `mmap` region.
pub struct Mapping {
    file: Arc<dyn File>,
    base: usize,
    pages: usize,
}

impl Mapping {
    fn page_addrs(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.pages).map(|i| self.base + i * PAGE_FRAME_SIZE)
    }
}

/// A process's active mappings. Ids count up from 0 and are never reused.
#[derive(Default)]
pub struct Mappings {
    next_id: MapId,
    active: BTreeMap<MapId, Mapping>,
}

impl Mappings {
    fn insert(&mut self, mapping: Mapping) -> MapId {
        let id = self.next_id;
        self.next_id += 1;
        self.active.insert(id, mapping);
        id
    }

    pub fn ids(&self) -> Vec<MapId> {
        self.active.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

impl ProcessMemory {
    /// Maps all of `file` at `vaddr`. Pages are read in on first access.
    pub fn mmap(&self, vm: &VirtualMemory, file: Arc<dyn File>, vaddr: usize) -> VmResult<MapId> {
        if vaddr == 0 || pg_ofs(vaddr) != 0 {
            return Err(VmError::InvalidAddress(vaddr));
        }
        let length = file.length();
        if length == 0 {
            return Err(VmError::EmptyFile);
        }
        let pages = pages_for(length);
        vaddr
            .checked_add(pages * PAGE_FRAME_SIZE)
            .filter(|&end| end <= vm.config().user_limit)
            .ok_or(VmError::InvalidAddress(vaddr))?;

        // Overlap check and page creation both happen under this lock.
        let mut mappings = self.mappings.lock();
        let descs = (0..pages).map(|i| {
            let offset = i * PAGE_FRAME_SIZE;
            PageDesc {
                vaddr: vaddr + offset,
                writable: true,
                shared: false,
                file_mapped: true,
                backing: Some(FileBacking {
                    file: file.clone(),
                    offset,
                    read_bytes: (length - offset).min(PAGE_FRAME_SIZE),
                }),
            }
        });
        self.page_table.create_all(descs)?;

        let id = mappings.insert(Mapping {
            file,
            base: vaddr,
            pages,
        });
        info!(
            "pid {}: mmap {id} at {vaddr:#x}, {length} bytes in {pages} pages",
            self.pid()
        );
        Ok(id)
    }

    /// Removes mapping `id`, writing dirty pages back to the file, and
    /// closes the mapping's file handle. Pages already removed from the page
    /// table are skipped. Every page is released even if a write-back fails;
    /// the first such failure is returned.
    pub fn munmap(&self, vm: &VirtualMemory, id: MapId) -> VmResult<()> {
        let mapping = self
            .mappings
            .lock()
            .active
            .remove(&id)
            .ok_or(VmError::UnknownMapping(id))?;

        let mut written = Ok(());
        for vaddr in mapping.page_addrs() {
            let Some(entry) = self.page_table.find_entry(vaddr) else {
                continue;
            };
            if let Err(err) = self.page_table.remove(vm, &entry) {
                warn!("pid {}: write-back of {vaddr:#x} failed: {err}", self.pid());
                written = written.and(Err(err));
            }
        }
        debug!(
            "pid {}: unmapped {id} ({} pages of inode {})",
            self.pid(),
            mapping.pages,
            mapping.file.inode()
        );
        written
    }

    pub fn mapping_count(&self) -> usize {
        self.mappings.lock().len()
    }
}
