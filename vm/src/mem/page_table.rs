//! The supplemental page table: what each user page of a process should
//! contain, and the demand-paging path that makes it resident.

use super::frame_table::{FileBacking, FrameId, FrameInfo, FrameKind};
use super::shared_frame::{SharedFrame, SharedKey};
use super::{VirtualMemory, VmError, VmResult};
use crate::process::Pid;
use crate::sync::Mutex;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::ops::Range;
use kidneyos_shared::mem::pg_ofs;
use log::{debug, trace, warn};

/// The frame an entry currently owns.
pub enum FrameRef {
    Private(FrameId),
    Shared(Arc<SharedFrame>),
}

/// How a page gets its content.
#[derive(Clone)]
pub struct PageDesc {
    pub vaddr: usize,
    pub writable: bool,
    /// Resolve through the shared frame cache instead of a private frame.
    pub shared: bool,
    /// Part of an `mmap` region: dirty content is written back to the file.
    pub file_mapped: bool,
    /// Without a backing file the page starts out zeroed.
    pub backing: Option<FileBacking>,
}

impl PageDesc {
    /// A zero-filled private page.
    pub fn anonymous(vaddr: usize, writable: bool) -> Self {
        Self {
            vaddr,
            writable,
            shared: false,
            file_mapped: false,
            backing: None,
        }
    }

    /// A page loaded from `backing`.
    pub fn file(vaddr: usize, backing: FileBacking, writable: bool) -> Self {
        Self {
            vaddr,
            writable,
            shared: false,
            file_mapped: false,
            backing: Some(backing),
        }
    }

    /// Deduplicate this page with every other shared page of the same file
    /// and offset.
    pub fn shared(mut self) -> Self {
        self.shared = true;
        self
    }
}

pub struct PageEntry {
    desc: PageDesc,
    frame: Mutex<Option<FrameRef>>,
}

impl PageEntry {
    pub fn vaddr(&self) -> usize {
        self.desc.vaddr
    }

    pub fn writable(&self) -> bool {
        self.desc.writable
    }

    pub fn is_shared(&self) -> bool {
        self.desc.shared
    }

    pub fn is_file_mapped(&self) -> bool {
        self.desc.file_mapped
    }

    pub fn backing(&self) -> Option<&FileBacking> {
        self.desc.backing.as_ref()
    }

    /// Whether the entry has been loaded at least once and not released.
    pub fn has_frame(&self) -> bool {
        self.frame.lock().is_some()
    }

    /// The private frame behind the entry, if it has one.
    pub fn private_frame(&self) -> Option<FrameId> {
        match *self.frame.lock() {
            Some(FrameRef::Private(id)) => Some(id),
            _ => None,
        }
    }

    fn frame_info(&self) -> FrameInfo {
        FrameInfo {
            writable: self.desc.writable,
            mmapped: self.desc.file_mapped,
            backing: self.desc.backing.clone(),
        }
    }

    fn shared_key(&self) -> SharedKey {
        let Some(backing) = self.desc.backing.as_ref() else {
            panic!("shared page {:#x} has no backing file", self.desc.vaddr);
        };
        SharedKey::of(backing)
    }
}

/// One process's pages, keyed by page address.
///
/// The map lock is only held while the map itself changes. Loading and
/// releasing a page happen under that entry's own lock.
pub struct PageTable {
    pid: Pid,
    entries: Mutex<BTreeMap<usize, Arc<PageEntry>>>,
}

impl PageTable {
    pub fn new(pid: Pid) -> Self {
        Self {
            pid,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Registers a page without loading it.
    pub fn create(&self, desc: PageDesc) -> VmResult<Arc<PageEntry>> {
        assert_eq!(pg_ofs(desc.vaddr), 0, "page address {:#x}", desc.vaddr);
        let mut entries = self.entries.lock();
        if entries.contains_key(&desc.vaddr) {
            return Err(VmError::AlreadyMapped(desc.vaddr));
        }
        let entry = Arc::new(PageEntry {
            desc,
            frame: Mutex::new(None),
        });
        entries.insert(entry.vaddr(), entry.clone());
        Ok(entry)
    }

    /// Creates every page in `descs`, or none of them if any page is taken.
    pub(super) fn create_all(
        &self,
        descs: impl Iterator<Item = PageDesc> + Clone,
    ) -> VmResult<()> {
        let mut entries = self.entries.lock();
        if let Some(taken) = descs.clone().find(|desc| entries.contains_key(&desc.vaddr)) {
            return Err(VmError::AlreadyMapped(taken.vaddr));
        }
        for desc in descs {
            let vaddr = desc.vaddr;
            let entry = Arc::new(PageEntry {
                desc,
                frame: Mutex::new(None),
            });
            entries.insert(vaddr, entry);
        }
        Ok(())
    }

    /// Creates a zeroed, private, writable page and loads it right away.
    pub fn create_and_allocate(&self, vm: &VirtualMemory, vaddr: usize) -> VmResult<Arc<PageEntry>> {
        let entry = self.create(PageDesc::anonymous(vaddr, true))?;
        if let Err(err) = self.load(vm, &entry) {
            self.entries.lock().remove(&vaddr);
            return Err(err);
        }
        Ok(entry)
    }

    pub fn find_entry(&self, vaddr: usize) -> Option<Arc<PageEntry>> {
        self.entries.lock().get(&vaddr).cloned()
    }

    /// Whether any page in `range` has an entry.
    pub fn any_in(&self, range: Range<usize>) -> bool {
        self.entries.lock().range(range).next().is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Makes `entry` resident and mapped in this process.
    pub fn load(&self, vm: &VirtualMemory, entry: &PageEntry) -> VmResult<()> {
        let mut frame = entry.frame.lock();
        if let Some(current) = frame.as_ref() {
            let id = match current {
                FrameRef::Private(id) => *id,
                FrameRef::Shared(record) => {
                    let id = vm
                        .shared
                        .with_slot(record.key(), entry.is_file_mapped(), |_, slot| *slot);
                    let Some(id) = id else {
                        panic!("shared page {:#x} lost its frame", entry.vaddr());
                    };
                    id
                }
            };
            return vm.frames.ensure_resident(id);
        }

        let owned = if entry.is_shared() {
            FrameRef::Shared(self.load_shared(vm, entry)?)
        } else {
            FrameRef::Private(self.fill_new_frame(vm, entry)?)
        };
        *frame = Some(owned);
        Ok(())
    }

    /// Fills the cache slot for `entry` on a miss, or joins the frame
    /// already there. A record left empty by a failed fill is dropped.
    fn load_shared(&self, vm: &VirtualMemory, entry: &PageEntry) -> VmResult<Arc<SharedFrame>> {
        let key = entry.shared_key();
        let loaded = vm
            .shared
            .with_slot(key, entry.is_file_mapped(), |record, slot| {
                match *slot {
                    None => *slot = Some(self.fill_new_frame(vm, entry)?),
                    Some(id) => {
                        let shared = vm.frames.share(id, self.pid, entry.vaddr(), entry.writable());
                        if let Err(err) = shared {
                            vm.frames.untrack(id, self.pid, Some(entry.vaddr()));
                            return Err(err);
                        }
                        trace!("page table: {:#x} shares {id:?}", entry.vaddr());
                    }
                }
                Ok(record.clone())
            });
        if loaded.is_err() {
            vm.shared.forget_if_empty(key);
        }
        loaded
    }

    fn fill_new_frame(&self, vm: &VirtualMemory, entry: &PageEntry) -> VmResult<FrameId> {
        let new = vm.frames.allocate(FrameKind::User)?;
        vm.frames
            .populate(new, self.pid, entry.vaddr(), entry.frame_info())?;
        Ok(new.id)
    }

    /// Detaches `entry` from the table and releases its frame. An error
    /// means the frame's content could not be written back to its file; the
    /// frame is released all the same.
    pub fn remove(&self, vm: &VirtualMemory, entry: &PageEntry) -> VmResult<()> {
        self.entries.lock().remove(&entry.vaddr());
        self.release(vm, entry)
    }

    fn release(&self, vm: &VirtualMemory, entry: &PageEntry) -> VmResult<()> {
        let Some(frame) = entry.frame.lock().take() else {
            return Ok(());
        };
        match frame {
            FrameRef::Private(id) => {
                let destroyed = vm.frames.dealloc(id, self.pid, entry.vaddr())?;
                assert!(destroyed, "private frame {id:?} still has users");
                Ok(())
            }
            FrameRef::Shared(record) => vm
                .shared
                .remove(
                    &vm.frames,
                    &record,
                    entry.is_file_mapped(),
                    self.pid,
                    entry.vaddr(),
                )
                .map(|_| ()),
        }
    }

    /// Removes every entry, releasing their frames.
    pub fn destroy(&self, vm: &VirtualMemory) {
        let entries = core::mem::take(&mut *self.entries.lock());
        debug!("page table: pid {} releasing {} pages", self.pid, entries.len());
        for entry in entries.values() {
            if let Err(err) = self.release(vm, entry) {
                warn!("page table: pid {} lost {:#x}: {err}", self.pid, entry.vaddr());
            }
        }
    }
}
