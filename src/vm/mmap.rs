//! Memory-mapped files.
//!
//! A mapping covers a whole file, one SPT entry per page, each entry
//! file-backed, writable, and flagged as mmap so eviction writes dirty
//! contents back to the file instead of swapping. The region registry
//! hands out small ids unique within the address space; unmapping (or
//! address-space teardown) writes back, releases every page, and closes
//! the region's file handle.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::{Error, Result};
use crate::fs::File;
use crate::param::PGSIZE;
use crate::vm::addr::UserPage;
use crate::vm::page::{install, FileBacking, Loc, SptEntry};
use crate::vm::AddressSpace;
use crate::vm::Vm;

/// Identifier of one mmap region, unique within its address space.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MapId(u32);

pub(crate) struct MmapRegion {
    base: UserPage,
    pages: usize,
    pub(crate) file: Arc<File>,
}

pub(crate) struct MmapTable {
    next: u32,
    regions: BTreeMap<u32, MmapRegion>,
}

impl MmapTable {
    pub(crate) fn new() -> Self {
        Self {
            next: 0,
            regions: BTreeMap::new(),
        }
    }

    pub(crate) fn drain(&mut self) -> Vec<MmapRegion> {
        let regions = core::mem::take(&mut self.regions);
        regions.into_iter().map(|(_, r)| r).collect()
    }
}

impl AddressSpace {
    /// Maps `file` at `addr`, which must be page-aligned and non-zero.
    /// Fails for empty files and for ranges that overlap any existing
    /// page of this space. The file is reopened, so the caller keeps its
    /// own handle.
    pub fn mmap(self: &Arc<Self>, file: &File, addr: usize) -> Result<MapId> {
        if addr == 0 {
            return Err(Error::InvalidArg);
        }
        let base = UserPage::new(addr).ok_or(Error::InvalidArg)?;

        let file = Arc::new(file.reopen());
        let len = file.length() as usize;
        if len == 0 {
            self.close_region_file(file);
            return Err(Error::InvalidArg);
        }
        let pages = (len + PGSIZE - 1) / PGSIZE;

        let mut spt = self.spt.lock();
        let mut upage = base;
        for _ in 0..pages {
            if spt.contains_key(&upage) {
                drop(spt);
                self.close_region_file(file);
                return Err(Error::Exists);
            }
            upage = upage.next();
        }

        let mut upage = base;
        for i in 0..pages {
            let ofs = i * PGSIZE;
            let entry = SptEntry {
                writable: true,
                mmap: true,
                file: Some(FileBacking {
                    file: file.clone(),
                    ofs: ofs as u32,
                    read_bytes: (len - ofs).min(PGSIZE) as u32,
                }),
                loc: Loc::File,
            };
            install(&mut spt, upage, entry).expect("mmap: overlap after check");
            upage = upage.next();
        }
        drop(spt);

        let mut mmaps = self.mmaps.lock();
        let id = mmaps.next;
        mmaps.next += 1;
        mmaps.regions.insert(id, MmapRegion { base, pages, file });
        log::debug!("mmap: mapped {} pages at {:?}", pages, base);
        Ok(MapId(id))
    }

    /// Unmaps region `id`: resident dirty pages go back to the file,
    /// swapped copies are discarded, every SPT entry is deleted, and the
    /// region's file handle is closed.
    pub fn munmap(self: &Arc<Self>, vm: &Vm, id: MapId) -> Result<()> {
        let region = self
            .mmaps
            .lock()
            .regions
            .remove(&id.0)
            .ok_or(Error::InvalidArg)?;

        {
            let mut frames = vm.frames.inner.lock();
            let mut spt = self.spt.lock();
            let mut upage = region.base;
            for _ in 0..region.pages {
                let entry = spt
                    .remove(&upage)
                    .expect("munmap: region page without SPT entry");
                match entry.loc {
                    Loc::Mem(fid) => {
                        if entry.writable && self.pagedir.is_dirty(upage) {
                            let fb = entry.file.as_ref().unwrap();
                            let page = frames.page(fid);
                            fb.file
                                .write_back_raw(&page.0[..fb.read_bytes as usize], fb.ofs);
                        }
                        self.pagedir.clear(upage);
                        frames.free(fid);
                    }
                    Loc::Swap(slot) => vm.swap.free_slot(slot),
                    Loc::File | Loc::Uninit => {}
                }
                upage = upage.next();
            }
        }

        self.close_region_file(region.file);
        log::debug!("mmap: unmapped region {:?}", id);
        Ok(())
    }

    /// Closes the file behind a region once no SPT entry references it.
    fn close_region_file(&self, file: Arc<File>) {
        match Arc::try_unwrap(file) {
            Ok(file) => file.close(),
            Err(_) => log::warn!("mmap: file handle still referenced at close"),
        }
    }
}
