//! Block devices.
//!
//! The core sees a block device as a byte-addressable store of 512-byte
//! sectors with synchronous reads and writes. The real driver lives
//! outside the core; `MemDisk` is the RAM-backed stand-in used by the
//! tests and by anything that wants a disk without hardware.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use crate::param::SECTOR_SIZE;

/// Index of a sector on a block device.
pub type Sector = u32;

pub trait BlockDevice: Send + Sync {
    /// Reads sector `sector` into `buf`.
    fn read(&self, sector: Sector, buf: &mut [u8; SECTOR_SIZE]);

    /// Writes `buf` to sector `sector`.
    fn write(&self, sector: Sector, buf: &[u8; SECTOR_SIZE]);

    /// Returns the device capacity in sectors.
    fn size(&self) -> Sector;
}

/// A RAM-backed block device.
pub struct MemDisk {
    sectors: Mutex<Vec<u8>>,
    size: Sector,
}

impl MemDisk {
    /// Creates a zero-filled disk of `size` sectors.
    pub fn new(size: Sector) -> Arc<Self> {
        Arc::new(Self {
            sectors: Mutex::new(vec![0; size as usize * SECTOR_SIZE]),
            size,
        })
    }

    fn range(&self, sector: Sector) -> core::ops::Range<usize> {
        assert!(sector < self.size, "memdisk: sector {} out of range", sector);
        let start = sector as usize * SECTOR_SIZE;
        start..start + SECTOR_SIZE
    }
}

impl BlockDevice for MemDisk {
    fn read(&self, sector: Sector, buf: &mut [u8; SECTOR_SIZE]) {
        let sectors = self.sectors.lock();
        buf.copy_from_slice(&sectors[self.range(sector)]);
    }

    fn write(&self, sector: Sector, buf: &[u8; SECTOR_SIZE]) {
        let mut sectors = self.sectors.lock();
        let range = self.range(sector);
        sectors[range].copy_from_slice(buf);
    }

    fn size(&self) -> Sector {
        self.size
    }
}
