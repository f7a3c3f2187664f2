//! The registry of physical frames and the virtual pages that map them.
//!
//! Lock order: a frame's own lock comes before the table lock
//! (`FrameTable::inner`), and nothing waits for a frame lock while holding the
//! table lock. The sweep only `try_lock`s frames. Device I/O happens under the
//! lock of the frame being moved, never under the table lock.

use super::frame_allocator::{FramePool, PhysFrame, PhysicalMemory};
use super::page_replacement::{Clock, PageReplacementPolicy};
use super::swapping::{SwapSlot, SwapSpace};
use super::{VmError, VmResult};
use crate::config::VmConfig;
use crate::fs::File;
use crate::process::{Pid, ProcessTable};
use crate::sync::{hold_interrupts, Mutex, Watchdog};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use log::{debug, trace, warn};
use slab::Slab;

/// Stable handle of a frame in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    User,
    /// Never evicted. Running out of kernel frames is fatal.
    Kernel,
}

/// Where a frame's content currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Memory(PhysFrame),
    Swap(SwapSlot),
    /// Discarded; rebuilt from the backing file on the next fault.
    File,
}

/// The part of a file a frame was loaded from.
#[derive(Clone)]
pub struct FileBacking {
    pub file: Arc<dyn File>,
    pub offset: usize,
    /// Bytes taken from the file; the rest of the page is zero.
    pub read_bytes: usize,
}

/// One virtual mapping of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct User {
    pub pid: Pid,
    pub vaddr: usize,
}

/// How a freshly allocated frame should be filled and mapped.
#[derive(Clone, Default)]
pub struct FrameInfo {
    pub writable: bool,
    pub mmapped: bool,
    pub backing: Option<FileBacking>,
}

/// A frame handed out by [`FrameTable::allocate`]. It stays pinned until
/// [`FrameTable::populate`] tracks it or [`FrameTable::release`] gives it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewFrame {
    pub id: FrameId,
    pub phys: PhysFrame,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    pub resident: usize,
    pub free_user_frames: usize,
    pub free_kernel_frames: usize,
    pub evictions: usize,
    pub swap_slots_used: usize,
}

struct FrameState {
    location: Location,
    /// Pinned frames are invisible to eviction.
    pinned: bool,
    mmapped: bool,
    writable: bool,
    /// Dirty bits of mappings that have since been cleared or replaced.
    dirty: bool,
    backing: Option<FileBacking>,
    users: Vec<User>,
}

struct Frame {
    kind: FrameKind,
    state: Mutex<FrameState>,
}

impl Frame {
    fn pinned(kind: FrameKind, phys: PhysFrame) -> Self {
        Self {
            kind,
            state: Mutex::new(FrameState {
                location: Location::Memory(phys),
                pinned: true,
                mmapped: false,
                writable: true,
                dirty: false,
                backing: None,
                users: Vec::new(),
            }),
        }
    }
}

struct FrameList {
    arena: Slab<Arc<Frame>>,
    /// Resident user frames in clock order.
    resident: Vec<FrameId>,
    user_pool: FramePool,
    kernel_pool: FramePool,
}

impl FrameList {
    #[track_caller]
    fn get(&self, id: FrameId) -> Arc<Frame> {
        match self.arena.get(id.0) {
            Some(frame) => frame.clone(),
            None => panic!("use of freed frame {id:?}"),
        }
    }

    fn insert(&mut self, frame: Frame) -> FrameId {
        FrameId(self.arena.insert(Arc::new(frame)))
    }

    fn position(&self, id: FrameId) -> Option<usize> {
        self.resident.iter().position(|&resident| resident == id)
    }

    fn free_phys(&mut self, kind: FrameKind, phys: PhysFrame) {
        match kind {
            FrameKind::User => self.user_pool.dealloc(phys),
            FrameKind::Kernel => self.kernel_pool.dealloc(phys),
        }
    }
}

struct FrameTableInner {
    list: FrameList,
    clock: Clock,
}

impl FrameTableInner {
    /// Drops `id` from the resident list, keeping the clock hand on the same
    /// next frame.
    fn unlink(&mut self, id: FrameId) {
        if let Some(idx) = self.list.position(id) {
            self.list.resident.remove(idx);
            self.clock.frame_removed(idx);
        }
    }
}

pub struct FrameTable {
    memory: PhysicalMemory,
    inner: Mutex<FrameTableInner>,
    swap: SwapSpace,
    processes: Arc<dyn ProcessTable>,
    evictions: AtomicUsize,
}

impl FrameTable {
    /// User frames come first in physical memory, kernel frames after them.
    pub fn new(config: &VmConfig, swap: SwapSpace, processes: Arc<dyn ProcessTable>) -> Self {
        debug!(
            "frame table: {} user frames, {} kernel frames, swap {}",
            config.user_frames,
            config.kernel_frames,
            if swap.has_swap() { "present" } else { "absent" }
        );
        Self {
            memory: PhysicalMemory::new(config.user_frames + config.kernel_frames),
            inner: Mutex::new(FrameTableInner {
                list: FrameList {
                    arena: Slab::new(),
                    resident: Vec::new(),
                    user_pool: FramePool::new(0, config.user_frames, false),
                    kernel_pool: FramePool::new(config.user_frames, config.kernel_frames, true),
                },
                clock: Clock::default(),
            }),
            swap,
            processes,
            evictions: AtomicUsize::new(0),
        }
    }

    pub fn memory(&self) -> &PhysicalMemory {
        &self.memory
    }

    #[track_caller]
    fn frame(&self, id: FrameId) -> Arc<Frame> {
        self.inner.lock().list.get(id)
    }

    /// Allocates a pinned frame, evicting a user frame if the user pool is
    /// empty. While every candidate is pinned or locked by another thread,
    /// this waits for one to come free.
    ///
    /// # Panics
    ///
    /// Panics if the kernel pool is exhausted.
    pub fn allocate(&self, kind: FrameKind) -> VmResult<NewFrame> {
        let new = match kind {
            FrameKind::Kernel => {
                let mut inner = self.inner.lock();
                let Some(phys) = inner.list.kernel_pool.alloc() else {
                    panic!("kernel frame pool exhausted");
                };
                let id = inner.list.insert(Frame::pinned(kind, phys));
                NewFrame { id, phys }
            }
            FrameKind::User => {
                let watchdog = Watchdog::start();
                loop {
                    if let Some(new) = self.sweep()? {
                        break new;
                    }
                    watchdog.check();
                    core::hint::spin_loop();
                }
            }
        };
        trace!("frame table: allocated {new:?} ({kind:?})");
        Ok(new)
    }

    /// Returns a pinned frame that was never tracked to its pool.
    pub fn release(&self, id: FrameId) {
        let frame = self.frame(id);
        let state = frame.state.lock();
        assert!(state.pinned, "released {id:?} is not pinned");
        assert!(state.users.is_empty(), "released {id:?} is still tracked");
        let Location::Memory(phys) = state.location else {
            panic!("released {id:?} is not resident");
        };

        let mut inner = self.inner.lock();
        inner.unlink(id);
        inner.list.free_phys(frame.kind, phys);
        inner.list.arena.remove(id.0);
    }

    /// Fills a freshly allocated frame from `info.backing` (zeroes without
    /// one), maps it at `vaddr` for `pid`, tracks it and unpins it. The frame
    /// is released on failure.
    pub fn populate(&self, new: NewFrame, pid: Pid, vaddr: usize, info: FrameInfo) -> VmResult<()> {
        let installed = self.fill(new.phys, info.backing.as_ref()).and_then(|()| {
            let installed = self
                .processes
                .address_space(pid)
                .is_some_and(|space| space.install(vaddr, new.phys, info.writable));
            if installed {
                Ok(())
            } else {
                Err(VmError::InstallFailed(vaddr))
            }
        });
        if let Err(err) = installed {
            self.release(new.id);
            return Err(err);
        }

        let frame = self.frame(new.id);
        let mut state = frame.state.lock();
        state.writable = info.writable;
        state.mmapped = info.mmapped;
        state.backing = info.backing;
        state.users.push(User { pid, vaddr });
        state.pinned = false;
        Ok(())
    }

    /// Writes the valid bytes of `backing` into `phys` and zeroes the rest.
    fn fill(&self, phys: PhysFrame, backing: Option<&FileBacking>) -> VmResult<()> {
        let mut page = self.memory.page(phys);
        let Some(backing) = backing else {
            page.fill(0);
            return Ok(());
        };

        let read = backing.file.read_at(&mut page[..backing.read_bytes], backing.offset);
        page[backing.read_bytes..].fill(0);
        if read != backing.read_bytes {
            warn!(
                "frame table: short read at offset {:#x}: {read} of {} bytes",
                backing.offset, backing.read_bytes
            );
            return Err(VmError::ShortRead {
                expected: backing.read_bytes,
                actual: read,
            });
        }
        Ok(())
    }

    /// Records that `pid` maps `id` at `vaddr`.
    pub fn track(&self, id: FrameId, pid: Pid, vaddr: usize) {
        self.frame(id).state.lock().users.push(User { pid, vaddr });
    }

    /// Forgets `pid`'s mapping of `id` at `vaddr`, or all of its mappings of
    /// `id` when `vaddr` is `None`, and clears them from its page directory.
    pub fn untrack(&self, id: FrameId, pid: Pid, vaddr: Option<usize>) {
        let frame = self.frame(id);
        let mut state = frame.state.lock();
        self.untrack_locked(&mut state, pid, vaddr);
    }

    fn untrack_locked(&self, state: &mut FrameState, pid: Pid, vaddr: Option<usize>) {
        let space = self.processes.address_space(pid);
        let mut lost_dirty = false;
        state.users.retain(|user| {
            let matches = user.pid == pid && vaddr.map_or(true, |vaddr| vaddr == user.vaddr);
            if matches {
                if let Some(space) = space.as_ref() {
                    lost_dirty |= space.is_dirty(user.vaddr);
                    space.clear(user.vaddr);
                }
            }
            !matches
        });
        state.dirty |= lost_dirty;
    }

    /// Adds `pid`'s mapping at `vaddr` to an existing frame, maps it right
    /// away if the frame is resident, then brings the frame back in if not.
    pub fn share(&self, id: FrameId, pid: Pid, vaddr: usize, writable: bool) -> VmResult<()> {
        let frame = self.frame(id);
        {
            let mut state = frame.state.lock();
            state.users.push(User { pid, vaddr });
            if let Location::Memory(phys) = state.location {
                let installed = self
                    .processes
                    .address_space(pid)
                    .is_some_and(|space| space.install(vaddr, phys, writable));
                if !installed {
                    return Err(VmError::InstallFailed(vaddr));
                }
            }
        }
        self.ensure_resident(id)
    }

    /// Whether any user has written to `id` through its mapping.
    ///
    /// # Panics
    ///
    /// Panics if the frame is not resident.
    pub fn is_dirty(&self, id: FrameId) -> bool {
        let frame = self.frame(id);
        let state = frame.state.lock();
        assert!(
            matches!(state.location, Location::Memory(_)),
            "dirty bit of non-resident {id:?}"
        );
        self.dirty_locked(&state)
    }

    fn dirty_locked(&self, state: &FrameState) -> bool {
        let _intr = hold_interrupts();
        state.dirty
            || state.users.iter().any(|user| {
                self.processes
                    .address_space(user.pid)
                    .is_some_and(|space| space.is_dirty(user.vaddr))
            })
    }

    /// Reads and clears the accessed bit of every mapping of the frame.
    fn referenced_locked(&self, state: &FrameState) -> bool {
        let _intr = hold_interrupts();
        let mut accessed = false;
        for user in &state.users {
            if let Some(space) = self.processes.address_space(user.pid) {
                accessed |= space.is_accessed(user.vaddr);
                space.clear_accessed(user.vaddr);
            }
        }
        accessed
    }

    fn map_users_locked(&self, state: &FrameState, phys: PhysFrame) {
        let _intr = hold_interrupts();
        for user in &state.users {
            if let Some(space) = self.processes.address_space(user.pid) {
                if !space.install(user.vaddr, phys, state.writable) {
                    warn!(
                        "frame table: could not remap {:#x} for pid {}",
                        user.vaddr, user.pid
                    );
                }
            }
        }
    }

    fn unmap_users_locked(&self, state: &FrameState) {
        let _intr = hold_interrupts();
        for user in &state.users {
            if let Some(space) = self.processes.address_space(user.pid) {
                space.clear(user.vaddr);
            }
        }
    }

    fn write_back_locked(&self, state: &FrameState, phys: PhysFrame) -> VmResult<()> {
        let Some(backing) = state.backing.as_ref() else {
            panic!("mmapped frame without a backing file");
        };
        let page = self.memory.page(phys);
        let written = backing
            .file
            .write_at(&page[..backing.read_bytes], backing.offset);
        if written != backing.read_bytes {
            return Err(VmError::ShortWrite {
                expected: backing.read_bytes,
                actual: written,
            });
        }
        trace!("frame table: wrote back offset {:#x}", backing.offset);
        Ok(())
    }

    /// Drops `pid`'s mapping of `id` at `vaddr`. Once nobody maps the frame
    /// it is destroyed: dirty mmap content goes back to its file and the
    /// physical frame or swap slot is freed. Returns whether the frame was
    /// destroyed, after which `id` must not be used again.
    ///
    /// The frame is destroyed even when its write-back fails. The error is
    /// returned in that case, and whatever was written since the page was
    /// loaded is lost.
    pub fn dealloc(&self, id: FrameId, pid: Pid, vaddr: usize) -> VmResult<bool> {
        let frame = self.frame(id);
        let mut state = frame.state.lock();

        self.untrack_locked(&mut state, pid, Some(vaddr));
        if !state.users.is_empty() {
            return Ok(false);
        }

        let mut written = Ok(());
        if let Location::Memory(phys) = state.location {
            if state.mmapped && self.dirty_locked(&state) {
                written = self.write_back_locked(&state, phys);
                if let Err(err) = written {
                    warn!("frame table: write-back of {id:?} failed: {err}");
                }
            }
        }

        let mut inner = self.inner.lock();
        match state.location {
            Location::Memory(phys) => {
                inner.unlink(id);
                inner.list.free_phys(frame.kind, phys);
            }
            Location::Swap(slot) => self.swap.swap_free(slot),
            Location::File => {}
        }
        inner.list.arena.remove(id.0);
        trace!("frame table: destroyed {id:?}");
        written.map(|()| true)
    }

    /// Brings `id` back into memory if it was evicted and maps it again for
    /// every user.
    pub fn ensure_resident(&self, id: FrameId) -> VmResult<()> {
        let frame = self.frame(id);
        let mut state = frame.state.lock();
        assert!(!state.users.is_empty(), "{id:?} has no users");

        let location = state.location;
        if let Location::Memory(_) = location {
            return Ok(());
        }

        // The frame is not on the clock list, so no sweep looks at it.
        let to = self.allocate(FrameKind::User)?;
        let filled = match location {
            Location::Swap(slot) => self.swap.swap_in(slot, &mut self.memory.page(to.phys)),
            Location::File => self.fill(to.phys, state.backing.as_ref()),
            Location::Memory(_) => Ok(()),
        };
        if let Err(err) = filled {
            self.release(to.id);
            return Err(err);
        }

        {
            // `id` takes over the new frame's place in the clock.
            let mut inner = self.inner.lock();
            let Some(idx) = inner.list.position(to.id) else {
                panic!("fresh {:?} is not resident", to.id);
            };
            inner.list.resident[idx] = id;
            inner.list.arena.remove(to.id.0);
        }

        if location == Location::File {
            state.dirty = false;
        }
        state.location = Location::Memory(to.phys);
        self.map_users_locked(&state, to.phys);
        trace!("frame table: {id:?} resident again in {:?}", to.phys);
        Ok(())
    }

    /// One bounded pass of the clock. Takes a free user frame if there is
    /// one, else relocates a victim and returns a pinned frame reusing its
    /// physical page. `Ok(None)` means some candidates were pinned or locked
    /// by other threads, so a later pass may succeed.
    fn sweep(&self) -> VmResult<Option<NewFrame>> {
        let mut inner = self.inner.lock();
        if let Some(phys) = inner.list.user_pool.alloc() {
            let id = inner.list.insert(Frame::pinned(FrameKind::User, phys));
            inner.list.resident.push(id);
            return Ok(Some(NewFrame { id, phys }));
        }

        let resident = inner.list.resident.len();
        let mut steps = 2 * resident;
        let mut mmap_retries = resident;
        let mut busy = false;

        while steps > 0 {
            steps -= 1;
            let len = inner.list.resident.len();
            let Some(idx) = inner.clock.next_candidate(len) else {
                break;
            };
            let id = inner.list.resident[idx];
            let frame = inner.list.get(id);
            let Some(mut state) = frame.state.try_lock() else {
                busy = true;
                continue;
            };
            if state.pinned {
                busy = true;
                continue;
            }
            let Location::Memory(phys) = state.location else {
                panic!("{id:?} is on the resident list but not in memory");
            };

            if state.users.is_empty() {
                // Nobody maps it: hand it out as is.
                state.pinned = true;
                state.mmapped = false;
                state.writable = true;
                state.dirty = false;
                state.backing = None;
                return Ok(Some(NewFrame { id, phys }));
            }

            if self.referenced_locked(&state) {
                continue;
            }

            let dirty = self.dirty_locked(&state);
            self.unmap_users_locked(&state);
            let new = inner.list.insert(Frame::pinned(FrameKind::User, phys));
            inner.list.resident[idx] = new;

            // The victim stays locked while its content moves out.
            drop(inner);
            let relocated = self.relocate(&state, phys, dirty);
            inner = self.inner.lock();

            match relocated {
                Ok(location) => {
                    debug!("frame table: evicted {id:?} from {phys:?} to {location:?}");
                    // Swapped content is still newer than the file.
                    state.dirty = dirty && matches!(location, Location::Swap(_));
                    state.location = location;
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    return Ok(Some(NewFrame { id: new, phys }));
                }
                Err(err) => {
                    let Some(idx) = inner.list.position(new) else {
                        panic!("{new:?} left the list while pinned");
                    };
                    inner.list.resident[idx] = id;
                    inner.list.arena.remove(new.0);
                    state.dirty = dirty;
                    self.map_users_locked(&state, phys);
                    warn!("frame table: evicting {id:?} failed: {err}");
                    if !state.mmapped || mmap_retries == 0 {
                        return Err(err);
                    }
                    // A failed write-back does not use up the sweep.
                    mmap_retries -= 1;
                    steps += 1;
                }
            }
        }

        if busy {
            return Ok(None);
        }
        warn!("frame table: no evictable frame among {resident} resident frames");
        Err(VmError::NoEvictableFrame)
    }

    /// Moves a victim's content out of `phys`: dirty mmap pages go back to
    /// their file, clean file content is dropped, and the rest goes to swap.
    fn relocate(&self, state: &FrameState, phys: PhysFrame, dirty: bool) -> VmResult<Location> {
        if state.mmapped && dirty {
            self.write_back_locked(state, phys).map(|()| Location::File)
        } else if state.mmapped || (!state.writable && state.backing.is_some()) {
            Ok(Location::File)
        } else {
            self.swap
                .swap_out(&self.memory.page(phys))
                .map(Location::Swap)
        }
    }

    /// Where `id`'s content currently lives.
    pub fn location(&self, id: FrameId) -> Location {
        let frame = self.frame(id);
        let location = frame.state.lock().location;
        location
    }

    pub fn users(&self, id: FrameId) -> Vec<User> {
        let frame = self.frame(id);
        let users = frame.state.lock().users.clone();
        users
    }

    pub fn stats(&self) -> FrameStats {
        let inner = self.inner.lock();
        FrameStats {
            resident: inner.list.resident.len(),
            free_user_frames: inner.list.user_pool.free_frames(),
            free_kernel_frames: inner.list.kernel_pool.free_frames(),
            evictions: self.evictions.load(Ordering::Relaxed),
            swap_slots_used: self.swap.used_slots(),
        }
    }

    /// Checks the bookkeeping of a table no other thread is using: resident
    /// user frames are exactly the clock list, evicted frames still have
    /// users, nothing is left pinned, and every used swap slot belongs to a
    /// frame.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        let (frames, resident) = {
            let inner = self.inner.lock();
            let frames: Vec<_> = inner
                .list
                .arena
                .iter()
                .map(|(idx, frame)| (FrameId(idx), frame.clone()))
                .collect();
            (frames, inner.list.resident.clone())
        };

        let mut swapped = 0;
        for (id, frame) in frames {
            let state = frame.state.lock();
            let listed = resident.contains(&id);
            assert!(!state.pinned, "{id:?} is still pinned");
            match state.location {
                Location::Memory(_) => {
                    assert_eq!(listed, frame.kind == FrameKind::User, "{id:?} on the clock list");
                }
                Location::Swap(_) | Location::File => {
                    swapped += usize::from(matches!(state.location, Location::Swap(_)));
                    assert!(!listed, "evicted {id:?} is on the clock list");
                    assert!(!state.users.is_empty(), "evicted {id:?} has no users");
                }
            }
        }
        assert_eq!(swapped, self.swap.used_slots());
    }
}
