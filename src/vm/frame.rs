//! Frame table.
//!
//! Physical frames for user pages come from a fixed pool sized at boot.
//! Each handed-out frame records a pin flag and a back-pointer to the
//! supplemental-page-table entry that owns it; the SPT entry points back
//! with the frame's id. Both sides of that cycle are non-owning and only
//! ever touched with the frame lock held.
//!
//! A fresh allocation starts pinned so the frame cannot be evicted while
//! it is still being populated; the caller unpins once the mapping is
//! installed and every read into the frame has completed.
//!
//! Victim selection is second chance over the global frame list: pinned
//! frames are skipped, a frame whose accessed bit is set loses the bit
//! and survives the pass, and the first frame found with the bit clear is
//! evicted. A full pass that only cleared bits is fine; the next pass
//! will find a victim.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use bitflags::bitflags;
use spin::Mutex;

use crate::vm::addr::{Page, UserPage};
use crate::vm::page::{AddressSpace, Loc, Spt};
use crate::vm::Vm;

bitflags! {
    /// Allocation flags for the user-page pool.
    pub struct AllocFlags: u32 {
        /// Draw from the user pool. Required; the pool serves nothing else.
        const USER = 1 << 0;
        /// Zero the frame before handing it out.
        const ZERO = 1 << 1;
    }
}

/// Handle on one frame of the user pool.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FrameId(pub(crate) usize);

/// Back-pointer from a frame to the SPT entry that owns it.
pub(crate) struct Owner {
    pub space: Weak<AddressSpace>,
    pub upage: UserPage,
}

struct FrameSlot {
    used: bool,
    pin: bool,
    page: Box<Page>,
    owner: Option<Owner>,
}

pub(crate) struct Frames {
    slots: Vec<FrameSlot>,
    /// Global frame list in allocation order; the victim sweep order.
    order: VecDeque<usize>,
    free: Vec<usize>,
}

pub struct FrameTable {
    pub(crate) inner: Mutex<Frames>,
}

impl FrameTable {
    /// Builds the table over a pool of `pool_pages` frames.
    pub fn new(pool_pages: usize) -> Self {
        let mut slots = Vec::with_capacity(pool_pages);
        let mut free = Vec::with_capacity(pool_pages);
        for i in 0..pool_pages {
            slots.push(FrameSlot {
                used: false,
                pin: false,
                page: Page::zeroed(),
                owner: None,
            });
            free.push(i);
        }
        // Pop order matches slot order; cosmetic only.
        free.reverse();
        log::info!("frame: pool of {} pages", pool_pages);
        Self {
            inner: Mutex::new(Frames {
                slots,
                order: VecDeque::new(),
                free,
            }),
        }
    }

    /// Frames not currently handed out.
    pub fn free_frames(&self) -> usize {
        self.inner.lock().free.len()
    }

    /// Frames currently pinned.
    pub fn pinned_frames(&self) -> usize {
        let inner = self.inner.lock();
        inner.slots.iter().filter(|s| s.used && s.pin).count()
    }

    /// Clears the pin on each of `frames`.
    pub fn unpin(&self, frames: &[FrameId]) {
        let mut inner = self.inner.lock();
        for &f in frames {
            inner.set_pin(f, false);
        }
    }
}

impl Frames {
    pub(crate) fn page(&self, id: FrameId) -> &Page {
        let slot = &self.slots[id.0];
        debug_assert!(slot.used, "frame: access to free frame");
        &slot.page
    }

    pub(crate) fn page_mut(&mut self, id: FrameId) -> &mut Page {
        let slot = &mut self.slots[id.0];
        debug_assert!(slot.used, "frame: access to free frame");
        &mut slot.page
    }

    pub(crate) fn set_pin(&mut self, id: FrameId, pin: bool) {
        let slot = &mut self.slots[id.0];
        debug_assert!(slot.used);
        slot.pin = pin;
    }

    /// Allocates a frame, evicting until the pool yields one. The frame
    /// comes back pinned with `owner` recorded.
    ///
    /// `cur_space`/`cur_spt` are the caller's address space and its held
    /// SPT guard; eviction reuses the guard when the victim lives in the
    /// same space and locks the victim's own SPT otherwise.
    pub(crate) fn alloc(
        &mut self,
        vm: &Vm,
        flags: AllocFlags,
        owner: Owner,
        cur_space: &Arc<AddressSpace>,
        cur_spt: &mut Spt,
    ) -> FrameId {
        assert!(flags.contains(AllocFlags::USER), "frame: non-user allocation");

        let idx = loop {
            if let Some(i) = self.free.pop() {
                break i;
            }
            self.evict_one(vm, cur_space, cur_spt);
        };

        let slot = &mut self.slots[idx];
        slot.used = true;
        slot.pin = true;
        slot.owner = Some(owner);
        if flags.contains(AllocFlags::ZERO) {
            slot.page.fill_zero();
        }
        self.order.push_back(idx);
        FrameId(idx)
    }

    /// Returns a frame to the pool.
    pub(crate) fn free(&mut self, id: FrameId) {
        let slot = &mut self.slots[id.0];
        assert!(slot.used, "frame: double free");
        slot.used = false;
        slot.pin = false;
        slot.owner = None;
        self.order.retain(|&i| i != id.0);
        self.free.push(id.0);
    }

    /// Second-chance sweep of the global frame list.
    fn select_victim(&self) -> usize {
        loop {
            let mut cleared = false;
            for &idx in self.order.iter() {
                let slot = &self.slots[idx];
                if slot.pin {
                    continue;
                }
                let owner = slot
                    .owner
                    .as_ref()
                    .expect("frame: unpinned frame without owner");
                let space = match owner.space.upgrade() {
                    Some(space) => space,
                    // The owning space is mid-teardown; its frames are
                    // about to be freed. Reclaim this one directly.
                    None => return idx,
                };
                if space.pagedir.test_and_clear_accessed(owner.upage) {
                    cleared = true;
                    continue;
                }
                return idx;
            }
            if !cleared {
                log::warn!("frame: all {} frames pinned", self.order.len());
            }
        }
    }

    /// Evicts one frame back to swap or to its file, per the rules in the
    /// page-fault path's dual: a file-backed page that is read-only or an
    /// mmap page needs no swap slot; everything else is copied out.
    fn evict_one(&mut self, vm: &Vm, cur_space: &Arc<AddressSpace>, cur_spt: &mut Spt) {
        let idx = self.select_victim();
        let (space, upage) = {
            let owner = self.slots[idx].owner.as_ref().unwrap();
            match owner.space.upgrade() {
                Some(space) => (space, owner.upage),
                None => {
                    log::warn!("frame: reclaiming orphaned frame {}", idx);
                    self.free(FrameId(idx));
                    return;
                }
            }
        };

        if Arc::ptr_eq(&space, cur_space) {
            self.evict_into(vm, idx, &space, cur_spt);
        } else {
            let mut spt = space.spt.lock();
            self.evict_into(vm, idx, &space, &mut spt);
        }
    }

    fn evict_into(&mut self, vm: &Vm, idx: usize, space: &Arc<AddressSpace>, spt: &mut Spt) {
        let upage = self.slots[idx].owner.as_ref().unwrap().upage;
        let entry = spt.get_mut(&upage).expect("frame: victim without SPT entry");
        match entry.loc {
            Loc::Mem(id) if id.0 == idx => {}
            _ => panic!("frame: victim SPT entry does not point back"),
        }

        // Dirty mmap pages go home to their file first.
        if let Some(fb) = &entry.file {
            if entry.mmap && entry.writable && space.pagedir.is_dirty(upage) {
                let page = &self.slots[idx].page;
                fb.file
                    .write_back_raw(&page.0[..fb.read_bytes as usize], fb.ofs);
            }
        }

        let to_file = entry.file.is_some() && (!entry.writable || entry.mmap);
        if to_file {
            entry.loc = Loc::File;
            log::debug!("frame: evicted {:?} to file", upage);
        } else {
            let slot = vm.swap.swap_out(&self.slots[idx].page);
            entry.loc = Loc::Swap(slot);
            log::debug!("frame: evicted {:?} to swap slot {}", upage, slot);
        }

        space.pagedir.clear(upage);
        self.free(FrameId(idx));
    }
}
