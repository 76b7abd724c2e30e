//! Demand-paged virtual memory.
//!
//! Three cooperating pieces: the frame table over a fixed user-page pool,
//! the per-address-space supplemental page table, and the swap area.
//! Page faults consult the supplemental table, allocate a frame (evicting
//! one to swap or back to its file if the pool is dry), read the bytes in
//! through the buffer cache or the swap device, and install the mapping.
//!
//! Lock order across the whole core: file system, then frame, then SPT,
//! then cache, then swap. Pinning protects a frame from eviction without
//! holding the frame lock across a long I/O.

use alloc::sync::Arc;

use crate::device::BlockDevice;

pub mod addr;
pub mod frame;
pub mod mmap;
pub mod page;
pub mod pagedir;
pub mod swap;

pub use addr::{Page, UserPage};
pub use frame::{AllocFlags, FrameId, FrameTable};
pub use mmap::MapId;
pub use page::AddressSpace;
pub use swap::SwapArea;

/// The machine-wide virtual-memory state: one frame pool and one swap
/// area, shared by every address space.
pub struct Vm {
    pub(crate) frames: FrameTable,
    pub(crate) swap: SwapArea,
}

impl Vm {
    /// Brings the VM layer up over a swap device and a user pool of
    /// `pool_pages` frames.
    pub fn init(swap_dev: Arc<dyn BlockDevice>, pool_pages: usize) -> Arc<Vm> {
        Arc::new(Vm {
            frames: FrameTable::new(pool_pages),
            swap: SwapArea::new(swap_dev),
        })
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    pub fn swap(&self) -> &SwapArea {
        &self.swap
    }

    /// Releases frames pinned by `AddressSpace::pin_range`.
    pub fn unpin(&self, frames: &[FrameId]) {
        self.frames.unpin(frames);
    }
}
