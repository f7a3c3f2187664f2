//! Frames shared between every page that maps the same part of the same file.

use super::frame_table::{FileBacking, FrameId, FrameTable};
use super::VmResult;
use crate::fs::InodeId;
use crate::process::Pid;
use crate::sync::Mutex;
use alloc::sync::Arc;
use hashbrown::HashMap;
use log::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SharedKey {
    pub inode: InodeId,
    pub offset: usize,
}

impl SharedKey {
    pub fn of(backing: &FileBacking) -> Self {
        Self {
            inode: backing.file.inode(),
            offset: backing.offset,
        }
    }
}

/// The two frames a key can have at once. Demand-paged executable content
/// and `mmap` content differ in write-back and lifetime, so they never share.
#[derive(Debug, Default)]
pub struct SharedSlots {
    pub ordinary: Option<FrameId>,
    pub mmapped: Option<FrameId>,
}

impl SharedSlots {
    pub fn slot(&mut self, mmapped: bool) -> &mut Option<FrameId> {
        if mmapped {
            &mut self.mmapped
        } else {
            &mut self.ordinary
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ordinary.is_none() && self.mmapped.is_none()
    }
}

#[derive(Debug)]
pub struct SharedFrame {
    key: SharedKey,
    slots: Mutex<SharedSlots>,
}

impl SharedFrame {
    pub fn key(&self) -> SharedKey {
        self.key
    }
}

/// Lock order: the cache lock, then a record's lock, then the frame table.
#[derive(Default)]
pub struct SharedFrameCache {
    table: Mutex<HashMap<SharedKey, Arc<SharedFrame>>>,
}

impl SharedFrameCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up (or creates) the record for `key` and runs `f` on the slot
    /// chosen by `mmapped` with the record locked. The cache itself is
    /// unlocked before `f` runs.
    pub fn with_slot<R>(
        &self,
        key: SharedKey,
        mmapped: bool,
        f: impl FnOnce(&Arc<SharedFrame>, &mut Option<FrameId>) -> R,
    ) -> R {
        let mut table = self.table.lock();
        let record = table
            .entry(key)
            .or_insert_with(|| {
                trace!("shared frames: new record for {key:?}");
                Arc::new(SharedFrame {
                    key,
                    slots: Mutex::default(),
                })
            })
            .clone();
        let mut slots = record.slots.lock();
        drop(table);

        f(&record, slots.slot(mmapped))
    }

    /// Drops `pid`'s mapping at `vaddr` of the frame in `record`'s slot.
    /// The slot is cleared once its frame is destroyed, and the record is
    /// deleted once both slots are empty. Returns whether the record was
    /// deleted, or the frame's write-back error.
    pub fn remove(
        &self,
        frames: &FrameTable,
        record: &Arc<SharedFrame>,
        mmapped: bool,
        pid: Pid,
        vaddr: usize,
    ) -> VmResult<bool> {
        let mut table = self.table.lock();
        let mut slots = record.slots.lock();

        let slot = slots.slot(mmapped);
        let mut written = Ok(());
        if let Some(id) = *slot {
            // A failed write-back still destroys the frame.
            let destroyed = frames.dealloc(id, pid, vaddr).unwrap_or_else(|err| {
                written = Err(err);
                true
            });
            if destroyed {
                *slot = None;
            }
        }
        if !slots.is_empty() {
            return written.map(|()| false);
        }

        if table
            .get(&record.key)
            .is_some_and(|live| Arc::ptr_eq(live, record))
        {
            table.remove(&record.key);
            trace!("shared frames: dropped record for {:?}", record.key);
        }
        written.map(|()| true)
    }

    /// Deletes the record for `key` if neither of its slots holds a frame.
    /// Used when filling a fresh record fails.
    pub fn forget_if_empty(&self, key: SharedKey) -> bool {
        let mut table = self.table.lock();
        let empty = table
            .get(&key)
            .is_some_and(|record| record.slots.lock().is_empty());
        if empty {
            table.remove(&key);
            trace!("shared frames: dropped unfilled record for {key:?}");
        }
        empty
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }

    #[cfg(test)]
    pub fn contains(&self, key: SharedKey) -> bool {
        self.table.lock().contains_key(&key)
    }
}
