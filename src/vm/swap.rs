//! Swap area.
//!
//! A slotted bitmap over a dedicated block device. One slot is eight
//! consecutive sectors, together holding one evicted page. The bitmap
//! reflects ground truth at all times: freeing a free slot is a bug and
//! panics, and running out of slots panics too; there is no overcommit.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::convert::TryInto;

use spin::Mutex;

use crate::device::{BlockDevice, Sector};
use crate::param::{SECTORS_PER_PAGE, SECTOR_SIZE};
use crate::vm::addr::Page;

pub struct SwapArea {
    dev: Arc<dyn BlockDevice>,
    inner: Mutex<Slots>,
}

struct Slots {
    bits: Vec<u8>,
    nslots: usize,
}

impl Slots {
    fn test(&self, i: usize) -> bool {
        self.bits[i / 8] & (1 << (i % 8)) != 0
    }

    fn set(&mut self, i: usize) {
        self.bits[i / 8] |= 1 << (i % 8);
    }

    fn clear(&mut self, i: usize) {
        self.bits[i / 8] &= !(1 << (i % 8));
    }
}

impl SwapArea {
    /// Binds the swap device; one slot per eight sectors of capacity.
    pub fn new(dev: Arc<dyn BlockDevice>) -> Self {
        let nslots = dev.size() as usize / SECTORS_PER_PAGE;
        log::info!("swap: {} slots", nslots);
        Self {
            dev,
            inner: Mutex::new(Slots {
                bits: vec![0; (nslots + 7) / 8],
                nslots,
            }),
        }
    }

    /// Writes `page` into the first free slot and returns its index.
    pub(crate) fn swap_out(&self, page: &Page) -> usize {
        let mut slots = self.inner.lock();
        let idx = (0..slots.nslots)
            .find(|&i| !slots.test(i))
            .unwrap_or_else(|| panic!("swap: out of slots"));
        slots.set(idx);

        let base = (idx * SECTORS_PER_PAGE) as Sector;
        for i in 0..SECTORS_PER_PAGE {
            let chunk: &[u8; SECTOR_SIZE] = page.0[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]
                .try_into()
                .unwrap();
            self.dev.write(base + i as Sector, chunk);
        }
        log::trace!("swap: out to slot {}", idx);
        idx
    }

    /// Reads slot `idx` into `page` and frees the slot.
    pub(crate) fn swap_in(&self, page: &mut Page, idx: usize) {
        let mut slots = self.inner.lock();
        assert!(slots.test(idx), "swap: reading freed slot {}", idx);

        let base = (idx * SECTORS_PER_PAGE) as Sector;
        for i in 0..SECTORS_PER_PAGE {
            let chunk: &mut [u8; SECTOR_SIZE] = (&mut page.0
                [i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE])
                .try_into()
                .unwrap();
            self.dev.read(base + i as Sector, chunk);
        }
        slots.clear(idx);
        log::trace!("swap: in from slot {}", idx);
    }

    /// Frees slot `idx` without reading it.
    pub(crate) fn free_slot(&self, idx: usize) {
        let mut slots = self.inner.lock();
        assert!(slots.test(idx), "swap: double free of slot {}", idx);
        slots.clear(idx);
    }

    /// Number of occupied slots.
    pub fn used(&self) -> usize {
        let slots = self.inner.lock();
        (0..slots.nslots).filter(|&i| slots.test(i)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDisk;

    #[test]
    fn out_then_in_round_trips_and_frees() {
        let swap = SwapArea::new(MemDisk::new(64));
        let mut page = Page::zeroed();
        for (i, b) in page.0.iter_mut().enumerate() {
            *b = i as u8;
        }

        let idx = swap.swap_out(&page);
        assert_eq!(swap.used(), 1);

        let mut back = Page::zeroed();
        swap.swap_in(&mut back, idx);
        assert_eq!(swap.used(), 0);
        assert!(page.0.iter().eq(back.0.iter()));
    }

    #[test]
    fn slots_are_reused_after_free() {
        let swap = SwapArea::new(MemDisk::new(64));
        let page = Page::zeroed();
        let a = swap.swap_out(&page);
        let b = swap.swap_out(&page);
        assert_ne!(a, b);
        swap.free_slot(a);
        assert_eq!(swap.swap_out(&page), a);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let swap = SwapArea::new(MemDisk::new(64));
        let idx = swap.swap_out(&Page::zeroed());
        swap.free_slot(idx);
        swap.free_slot(idx);
    }

    #[test]
    #[should_panic(expected = "out of slots")]
    fn overcommit_panics() {
        let swap = SwapArea::new(MemDisk::new(16));
        let page = Page::zeroed();
        swap.swap_out(&page);
        swap.swap_out(&page);
        swap.swap_out(&page);
    }
}
