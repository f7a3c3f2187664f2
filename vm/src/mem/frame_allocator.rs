mod placement_algorithms;

pub use placement_algorithms::{NextFit, PlacementAlgorithm};

use crate::sync::{Mutex, MutexGuard};
use alloc::boxed::Box;
use bitbybit::bitfield;
use kidneyos_shared::mem::PAGE_FRAME_SIZE;

/// The contents of one physical frame.
pub type Page = [u8; PAGE_FRAME_SIZE];

/// Number of a physical page frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysFrame(usize);

impl PhysFrame {
    pub const fn new(number: usize) -> Self {
        Self(number)
    }

    pub const fn number(self) -> usize {
        self.0
    }
}

/// Physical RAM, one lock per page.
pub struct PhysicalMemory {
    pages: Box<[Mutex<Page>]>,
}

impl PhysicalMemory {
    pub fn new(frames: usize) -> Self {
        Self {
            pages: (0..frames).map(|_| Mutex::new([0; PAGE_FRAME_SIZE])).collect(),
        }
    }

    #[track_caller]
    pub fn page(&self, frame: PhysFrame) -> MutexGuard<Page> {
        self.pages[frame.number()].lock()
    }
}

#[bitfield(u8, default = 0)]
pub struct CoreMapEntry {
    #[bit(0, rw)]
    allocated: bool,
    #[bit(1, rw)]
    is_kernel: bool,
}

/// A contiguous range of physical frames handed out one at a time.
pub struct FramePool<P: PlacementAlgorithm = NextFit> {
    base: usize,
    core_map: Box<[CoreMapEntry]>,
    placement: P,
    frames_allocated: usize,
}

impl<P: PlacementAlgorithm> FramePool<P> {
    /// A pool of `frames` frames starting at frame number `base`.
    pub fn new(base: usize, frames: usize, kernel: bool) -> Self {
        let entry = CoreMapEntry::DEFAULT.with_is_kernel(kernel);
        Self {
            base,
            core_map: (0..frames).map(|_| entry).collect(),
            placement: P::default(),
            frames_allocated: 0,
        }
    }

    pub fn alloc(&mut self) -> Option<PhysFrame> {
        if self.frames_allocated == self.core_map.len() {
            return None;
        }

        let range = self.placement.place(&self.core_map, 1)?;
        for i in range.clone() {
            assert!(!self.core_map[i].allocated());
            self.core_map[i] = self.core_map[i].with_allocated(true);
        }
        self.frames_allocated += range.len();

        Some(PhysFrame::new(self.base + range.start))
    }

    pub fn dealloc(&mut self, frame: PhysFrame) {
        assert!(self.contains(frame), "{frame:?} does not belong to this pool");
        let idx = frame.number() - self.base;
        assert!(self.core_map[idx].allocated(), "double free of {frame:?}");

        self.core_map[idx] = self.core_map[idx].with_allocated(false);
        self.frames_allocated -= 1;
    }

    pub fn contains(&self, frame: PhysFrame) -> bool {
        (self.base..self.base + self.core_map.len()).contains(&frame.number())
    }

    pub fn free_frames(&self) -> usize {
        self.core_map.len() - self.frames_allocated
    }
}
