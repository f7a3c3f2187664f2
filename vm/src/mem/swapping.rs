use super::frame_allocator::Page;
use super::{VmError, VmResult};
use crate::block::{BlockDevice, BlockError, BlockSector, BLOCK_SECTOR_SIZE};
use crate::sync::Mutex;
use alloc::boxed::Box;
use kidneyos_shared::bit_array::Bitmap;
use kidneyos_shared::mem::PAGE_FRAME_SIZE;
use log::{debug, trace, warn};

const SECTORS_PER_PAGE: usize = PAGE_FRAME_SIZE / BLOCK_SECTOR_SIZE;

/// Index of a page-sized slot on the swap device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlot(usize);

impl SwapSlot {
    pub const fn index(self) -> usize {
        self.0
    }

    fn sector(self, i: usize) -> Result<BlockSector, BlockError> {
        BlockSector::try_from(self.0 * SECTORS_PER_PAGE + i)
            .map_err(|_| BlockError::SectorOutOfBounds)
    }
}

/// Page-granular storage on the swap device. Slot occupancy lives only in
/// memory; nothing on the device survives a reboot.
pub struct SwapSpace {
    device: Option<Box<dyn BlockDevice>>,
    slots: Mutex<Bitmap>,
}

impl SwapSpace {
    pub fn new(device: Option<Box<dyn BlockDevice>>) -> Self {
        let slots = device
            .as_ref()
            .map_or(0, |device| device.size_in_sectors() as usize / SECTORS_PER_PAGE);
        debug!("swap: {slots} slots");
        Self {
            device,
            slots: Mutex::new(Bitmap::new(slots)),
        }
    }

    pub fn has_swap(&self) -> bool {
        self.device.is_some()
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn used_slots(&self) -> usize {
        self.slots.lock().count_ones()
    }

    /// Writes `page` to a free slot. On failure no slot stays allocated.
    pub fn swap_out(&self, page: &Page) -> VmResult<SwapSlot> {
        let device = self.device.as_ref().ok_or(VmError::NoSwap)?;
        let slot = SwapSlot(self.slots.lock().scan_and_flip().ok_or(VmError::SwapFull)?);

        let written = page
            .chunks_exact(BLOCK_SECTOR_SIZE)
            .enumerate()
            .try_for_each(|(i, sector)| device.write(slot.sector(i)?, sector));
        if let Err(err) = written {
            warn!("swap: writing {slot:?} failed: {err}");
            self.swap_free(slot);
            return Err(err.into());
        }

        trace!("swap: out to {slot:?}");
        Ok(slot)
    }

    /// Reads `slot` into `page` and frees the slot. If the read fails the
    /// slot keeps its content.
    pub fn swap_in(&self, slot: SwapSlot, page: &mut Page) -> VmResult<()> {
        let device = self.device.as_ref().ok_or(VmError::NoSwap)?;
        assert!(self.slots.lock().test(slot.0), "{slot:?} is not in use");

        page.chunks_exact_mut(BLOCK_SECTOR_SIZE)
            .enumerate()
            .try_for_each(|(i, sector)| device.read(slot.sector(i)?, sector))?;

        self.swap_free(slot);
        trace!("swap: in from {slot:?}");
        Ok(())
    }

    pub fn swap_free(&self, slot: SwapSlot) {
        let mut slots = self.slots.lock();
        assert!(slots.test(slot.0), "{slot:?} freed twice");
        slots.set(slot.0, false);
    }
}
