//! Demand-paged virtual memory: physical frames, eviction to swap or back to
//! files, frames shared through a cache, and per-process page tables.

mod error;
pub mod fault;
pub mod frame_allocator;
pub mod frame_table;
pub mod mmap;
pub mod page_replacement;
pub mod page_table;
pub mod shared_frame;
pub mod swapping;
pub mod user;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{VmError, VmResult};
pub use frame_allocator::{Page, PhysFrame};

use crate::block::BlockDevice;
use crate::config::VmConfig;
use crate::process::ProcessTable;
use alloc::boxed::Box;
use alloc::sync::Arc;
use frame_table::FrameTable;
use log::info;
use shared_frame::SharedFrameCache;
use swapping::SwapSpace;

/// Everything the pager shares between processes. Built once at boot and
/// passed by reference to every operation.
pub struct VirtualMemory {
    pub(crate) frames: FrameTable,
    pub(crate) shared: SharedFrameCache,
    config: VmConfig,
}

impl VirtualMemory {
    pub fn new(
        config: VmConfig,
        swap_device: Option<Box<dyn BlockDevice>>,
        processes: Arc<dyn ProcessTable>,
    ) -> Self {
        let swap = SwapSpace::new(swap_device);
        info!(
            "vm: {} user frames, {} swap slots",
            config.user_frames,
            swap.capacity()
        );
        Self {
            frames: FrameTable::new(&config, swap, processes),
            shared: SharedFrameCache::new(),
            config,
        }
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    pub fn shared_frames(&self) -> &SharedFrameCache {
        &self.shared
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }
}
