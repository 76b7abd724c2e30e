//! Supplemental page table and the page-fault path.
//!
//! Each address space keeps a map from user page to the page's backing
//! location: not yet initialised, resident in a frame, out in a swap
//! slot, or in a file. A fault consults the map, brings the bytes in
//! through the buffer cache or the swap area, installs the hardware
//! mapping, and flips the location to resident.
//!
//! Lock order here is frame lock, then this space's SPT lock; the load
//! helpers are entered with both held and leave the fresh frame pinned,
//! so the caller decides when eviction may see it again.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::error::{Error, Result};
use crate::fs::File;
use crate::param::{PGSIZE, STACK_MAX, STACK_SLACK, USER_STACK_TOP};
use crate::vm::addr::UserPage;
use crate::vm::frame::{AllocFlags, FrameId, Frames, Owner};
use crate::vm::mmap::MmapTable;
use crate::vm::pagedir::PageDir;
use crate::vm::Vm;

/// Where a page's bytes currently live.
pub(crate) enum Loc {
    /// Declared but never populated. Faulting on it is fatal.
    Uninit,
    /// Resident in the given frame.
    Mem(FrameId),
    /// Out in a swap slot.
    Swap(usize),
    /// In the backing file; `file` below says where.
    File,
}

pub(crate) struct FileBacking {
    pub file: Arc<File>,
    pub ofs: u32,
    /// Bytes of the page that come from the file; the rest is zero.
    pub read_bytes: u32,
}

pub(crate) struct SptEntry {
    pub writable: bool,
    /// Part of an mmap region: eviction writes dirty contents back to the
    /// file instead of swapping.
    pub mmap: bool,
    pub file: Option<FileBacking>,
    pub loc: Loc,
}

pub(crate) type Spt = BTreeMap<UserPage, SptEntry>;

/// Installs `entry` for `upage`; at most one entry may exist per page.
pub(crate) fn install(spt: &mut Spt, upage: UserPage, entry: SptEntry) -> Result<()> {
    if spt.contains_key(&upage) {
        return Err(Error::Exists);
    }
    spt.insert(upage, entry);
    Ok(())
}

/// One user address space: its supplemental page table, its (software)
/// page directory, and its mmap regions. The process layer owns one per
/// process and must call `destroy` at teardown.
pub struct AddressSpace {
    pub(crate) spt: Mutex<Spt>,
    pub(crate) pagedir: PageDir,
    pub(crate) mmaps: Mutex<MmapTable>,
}

impl AddressSpace {
    pub fn new() -> Arc<AddressSpace> {
        Arc::new(AddressSpace {
            spt: Mutex::new(BTreeMap::new()),
            pagedir: PageDir::new(),
            mmaps: Mutex::new(MmapTable::new()),
        })
    }

    /// Handles a fault at `addr`. `not_present` distinguishes a missing
    /// mapping from a protection violation; `user_sp` is the saved user
    /// stack pointer, consulted for stack growth. `Err(Fault)` means the
    /// caller must kill the process.
    pub fn page_fault(
        self: &Arc<Self>,
        vm: &Vm,
        addr: usize,
        write: bool,
        not_present: bool,
        user_sp: usize,
    ) -> Result<()> {
        if !not_present {
            // Write to a read-only page.
            return Err(Error::Fault);
        }

        let upage = UserPage::containing(addr);
        let mut frames = vm.frames.inner.lock();
        let mut spt = self.spt.lock();

        let fid = match page_state(&spt, upage, write)? {
            PageState::Absent => {
                if !stack_access(addr, user_sp) {
                    return Err(Error::Fault);
                }
                self.grow_stack(vm, &mut frames, &mut spt, upage)?
            }
            PageState::Uninit => return Err(Error::Fault),
            PageState::Mem(_) => panic!("page_fault: fault on resident page {:?}", upage),
            PageState::Swap => self.load_swap(vm, &mut frames, &mut spt, upage)?,
            PageState::File => self.load_file(vm, &mut frames, &mut spt, upage)?,
        };

        frames.set_pin(fid, false);
        Ok(())
    }

    /// Installs a fresh zero page for a stack access.
    fn grow_stack(
        self: &Arc<Self>,
        vm: &Vm,
        frames: &mut Frames,
        spt: &mut Spt,
        upage: UserPage,
    ) -> Result<FrameId> {
        let fid = frames.alloc(
            vm,
            AllocFlags::USER | AllocFlags::ZERO,
            Owner {
                space: Arc::downgrade(self),
                upage,
            },
            self,
            spt,
        );
        if !self.pagedir.map(upage, fid, true) {
            frames.free(fid);
            return Err(Error::Fault);
        }
        let entry = SptEntry {
            writable: true,
            mmap: false,
            file: None,
            loc: Loc::Mem(fid),
        };
        if install(spt, upage, entry).is_err() {
            self.pagedir.clear(upage);
            frames.free(fid);
            return Err(Error::Fault);
        }
        log::debug!("page: stack grew to {:?}", upage);
        Ok(fid)
    }

    /// Brings a swapped-out page back in. Entered with the frame lock and
    /// this space's SPT lock held; the frame stays pinned.
    fn load_swap(
        self: &Arc<Self>,
        vm: &Vm,
        frames: &mut Frames,
        spt: &mut Spt,
        upage: UserPage,
    ) -> Result<FrameId> {
        let (slot, writable) = {
            let entry = spt.get(&upage).unwrap();
            match entry.loc {
                Loc::Swap(slot) => (slot, entry.writable),
                _ => unreachable!(),
            }
        };

        let fid = frames.alloc(
            vm,
            AllocFlags::USER,
            Owner {
                space: Arc::downgrade(self),
                upage,
            },
            self,
            spt,
        );
        vm.swap.swap_in(frames.page_mut(fid), slot);

        if !self.pagedir.map(upage, fid, writable) {
            frames.free(fid);
            return Err(Error::Fault);
        }
        spt.get_mut(&upage).unwrap().loc = Loc::Mem(fid);
        Ok(fid)
    }

    /// Reads a file-backed page into a fresh frame, zero-filling the
    /// tail. Same locking contract as `load_swap`.
    fn load_file(
        self: &Arc<Self>,
        vm: &Vm,
        frames: &mut Frames,
        spt: &mut Spt,
        upage: UserPage,
    ) -> Result<FrameId> {
        let (file, ofs, read_bytes, writable) = {
            let entry = spt.get(&upage).unwrap();
            let fb = entry.file.as_ref().expect("page: FILE entry without file");
            (fb.file.clone(), fb.ofs, fb.read_bytes, entry.writable)
        };
        assert!(read_bytes as usize <= PGSIZE);

        let fid = frames.alloc(
            vm,
            AllocFlags::USER,
            Owner {
                space: Arc::downgrade(self),
                upage,
            },
            self,
            spt,
        );

        let page = frames.page_mut(fid);
        let n = file.read_at_raw(&mut page.0[..read_bytes as usize], ofs);
        if n != read_bytes as usize {
            frames.free(fid);
            return Err(Error::Fault);
        }
        page.0[read_bytes as usize..].iter_mut().for_each(|b| *b = 0);

        if !self.pagedir.map(upage, fid, writable) {
            frames.free(fid);
            return Err(Error::Fault);
        }
        spt.get_mut(&upage).unwrap().loc = Loc::Mem(fid);
        Ok(fid)
    }

    /// Declares a file-backed page without loading it, for the loader's
    /// use when mapping a segment. `read_bytes` of the file at `ofs` back
    /// the page; the remainder reads as zero.
    pub fn install_file_page(
        self: &Arc<Self>,
        file: &File,
        addr: usize,
        ofs: u32,
        read_bytes: u32,
        writable: bool,
    ) -> Result<()> {
        let upage = UserPage::new(addr).ok_or(Error::InvalidArg)?;
        if read_bytes as usize > PGSIZE {
            return Err(Error::InvalidArg);
        }
        let mut spt = self.spt.lock();
        install(
            &mut spt,
            upage,
            SptEntry {
                writable,
                mmap: false,
                file: Some(FileBacking {
                    file: Arc::new(file.reopen()),
                    ofs,
                    read_bytes,
                }),
                loc: Loc::File,
            },
        )
    }

    /// Copies `buf` out of user memory at `addr`, faulting pages in as
    /// the MMU would.
    pub fn read_bytes(
        self: &Arc<Self>,
        vm: &Vm,
        mut addr: usize,
        buf: &mut [u8],
        user_sp: usize,
    ) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let upage = UserPage::containing(addr);
            let ofs = addr - upage.addr();
            let chunk = (PGSIZE - ofs).min(buf.len() - done);

            let copied = {
                let frames = vm.frames.inner.lock();
                match self.pagedir.get(upage) {
                    Some((fid, _)) => {
                        let page = frames.page(fid);
                        buf[done..done + chunk].copy_from_slice(&page.0[ofs..ofs + chunk]);
                        // As the hardware would: the bit goes up with the
                        // access, before eviction can look at this page.
                        self.pagedir.mark_access(upage, false);
                        true
                    }
                    None => false,
                }
            };
            if copied {
                done += chunk;
                addr += chunk;
            } else {
                self.page_fault(vm, addr, false, true, user_sp)?;
            }
        }
        Ok(())
    }

    /// Copies `buf` into user memory at `addr`, faulting pages in and
    /// enforcing the writable bit.
    pub fn write_bytes(
        self: &Arc<Self>,
        vm: &Vm,
        mut addr: usize,
        buf: &[u8],
        user_sp: usize,
    ) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let upage = UserPage::containing(addr);
            let ofs = addr - upage.addr();
            let chunk = (PGSIZE - ofs).min(buf.len() - done);

            let copied = {
                let mut frames = vm.frames.inner.lock();
                match self.pagedir.get(upage) {
                    Some((_, false)) => return Err(Error::Fault),
                    Some((fid, true)) => {
                        let page = frames.page_mut(fid);
                        page.0[ofs..ofs + chunk].copy_from_slice(&buf[done..done + chunk]);
                        // Dirty goes up with the write, while the frame
                        // lock still keeps eviction out.
                        self.pagedir.mark_access(upage, true);
                        true
                    }
                    None => false,
                }
            };
            if copied {
                done += chunk;
                addr += chunk;
            } else {
                self.page_fault(vm, addr, true, true, user_sp)?;
            }
        }
        Ok(())
    }

    /// Brings every page of `addr..addr + len` in and pins its frame, so
    /// a following file-system-locked critical section cannot fault.
    /// Release with `Vm::unpin`. On failure nothing stays pinned.
    pub fn pin_range(
        self: &Arc<Self>,
        vm: &Vm,
        addr: usize,
        len: usize,
        user_sp: usize,
    ) -> Result<Vec<FrameId>> {
        let mut pinned = Vec::new();
        if len == 0 {
            return Ok(pinned);
        }

        let mut upage = UserPage::containing(addr);
        let end = addr + len;
        while upage.addr() < end {
            let mut frames = vm.frames.inner.lock();
            let mut spt = self.spt.lock();

            let res = match page_state(&spt, upage, false) {
                Ok(PageState::Mem(fid)) => {
                    frames.set_pin(fid, true);
                    Ok(fid)
                }
                Ok(PageState::Swap) => self.load_swap(vm, &mut frames, &mut spt, upage),
                Ok(PageState::File) => self.load_file(vm, &mut frames, &mut spt, upage),
                Ok(PageState::Uninit) => Err(Error::Fault),
                Ok(PageState::Absent) => {
                    if stack_access(upage.addr(), user_sp) {
                        self.grow_stack(vm, &mut frames, &mut spt, upage)
                    } else {
                        Err(Error::Fault)
                    }
                }
                Err(e) => Err(e),
            };

            match res {
                Ok(fid) => pinned.push(fid),
                Err(e) => {
                    for &f in &pinned {
                        frames.set_pin(f, false);
                    }
                    return Err(e);
                }
            }

            drop(spt);
            drop(frames);
            upage = upage.next();
        }
        Ok(pinned)
    }

    /// Tears the address space down, releasing every backing resource.
    /// Holds the frame lock and the SPT lock throughout so concurrent
    /// eviction cannot observe a half-torn entry.
    pub fn destroy(self: &Arc<Self>, vm: &Vm) {
        let regions = self.mmaps.lock().drain();

        {
            let mut frames = vm.frames.inner.lock();
            let mut spt = self.spt.lock();
            for (upage, entry) in core::mem::take(&mut *spt) {
                match entry.loc {
                    Loc::Mem(fid) => {
                        frames.free(fid);
                        self.pagedir.clear(upage);
                    }
                    Loc::Swap(slot) => vm.swap.free_slot(slot),
                    Loc::Uninit | Loc::File => {}
                }
            }
        }

        // SPT entries are gone, so each region holds the last reference
        // to its file handle.
        for region in regions {
            match Arc::try_unwrap(region.file) {
                Ok(file) => file.close(),
                Err(_) => log::warn!("page: mmap file handle leaked at teardown"),
            }
        }
        log::debug!("page: address space destroyed");
    }
}

/// Snapshot of an SPT entry's location, copied out so the table can be
/// re-borrowed mutably by the load paths.
enum PageState {
    Absent,
    Uninit,
    Mem(FrameId),
    Swap,
    File,
}

/// Reads the state of `upage`. A write access to a page declared
/// read-only is refused here, before any load work.
fn page_state(spt: &Spt, upage: UserPage, write: bool) -> Result<PageState> {
    match spt.get(&upage) {
        None => Ok(PageState::Absent),
        Some(e) => {
            if write && !e.writable {
                return Err(Error::Fault);
            }
            Ok(match e.loc {
                Loc::Uninit => PageState::Uninit,
                Loc::Mem(fid) => PageState::Mem(fid),
                Loc::Swap(_) => PageState::Swap,
                Loc::File => PageState::File,
            })
        }
    }
}

/// Whether a fault at `addr` with stack pointer `user_sp` should grow the
/// stack: at most `STACK_SLACK` bytes below the stack pointer, inside the
/// stack's maximum span.
fn stack_access(addr: usize, user_sp: usize) -> bool {
    addr >= user_sp.saturating_sub(STACK_SLACK)
        && addr < USER_STACK_TOP
        && addr >= USER_STACK_TOP - STACK_MAX
}
