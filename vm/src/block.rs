//! Sector-addressed storage used as the swap device.

use crate::sync::Mutex;
use alloc::vec;
use alloc::vec::Vec;
use thiserror::Error;

pub use kidneyos_shared::sizes::SECTOR_SIZE as BLOCK_SECTOR_SIZE;

/// Index of a block device sector.
pub type BlockSector = u32;

/// Error type for block operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BlockError {
    /// The sector is out of bounds (greater than the block size)
    #[error("sector out of bounds (greater than the block size)")]
    SectorOutOfBounds,
    /// The buffer has an invalid size (not `BLOCK_SECTOR_SIZE`)
    #[error("invalid buffer size (not `BLOCK_SECTOR_SIZE`)")]
    BufferInvalid,
    /// Error reading from the disk
    #[error("error reading from the block device")]
    ReadError,
    /// Error writing to the disk
    #[error("error writing to the block device")]
    WriteError,
}

/// Lower-level interface to block devices.
pub trait BlockDevice: Send + Sync {
    /// Reads one sector into `buf`, which must be `BLOCK_SECTOR_SIZE` bytes.
    fn read(&self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError>;
    /// Writes one sector from `buf`, which must be `BLOCK_SECTOR_SIZE` bytes.
    fn write(&self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError>;
    fn size_in_sectors(&self) -> BlockSector;
}

/// A block device backed by kernel memory.
pub struct RamDisk {
    sectors: BlockSector,
    data: Mutex<Vec<u8>>,
}

impl RamDisk {
    pub fn new(sectors: BlockSector) -> Self {
        Self {
            sectors,
            data: Mutex::new(vec![0; sectors as usize * BLOCK_SECTOR_SIZE]),
        }
    }

    fn range(&self, sector: BlockSector, len: usize) -> Result<core::ops::Range<usize>, BlockError> {
        if sector >= self.sectors {
            return Err(BlockError::SectorOutOfBounds);
        }
        if len != BLOCK_SECTOR_SIZE {
            return Err(BlockError::BufferInvalid);
        }
        let start = sector as usize * BLOCK_SECTOR_SIZE;
        Ok(start..start + BLOCK_SECTOR_SIZE)
    }
}

impl BlockDevice for RamDisk {
    fn read(&self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        let range = self.range(sector, buf.len())?;
        buf.copy_from_slice(&self.data.lock()[range]);
        Ok(())
    }

    fn write(&self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        let range = self.range(sector, buf.len())?;
        self.data.lock()[range].copy_from_slice(buf);
        Ok(())
    }

    fn size_in_sectors(&self) -> BlockSector {
        self.sectors
    }
}
