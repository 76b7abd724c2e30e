//! Inodes.
//!
//! An inode describes a single file or directory. The on-disk inode
//! occupies exactly one sector and carries the extent tree: 123 direct
//! sector pointers, one single-indirect pointer, and one double-indirect
//! pointer. Indirect sectors hold 128 pointers each. An absent pointer is
//! the reserved marker -1.
//!
//! The kernel keeps a table of open inodes in memory so that two opens of
//! the same sector return the same in-memory object with its open count
//! incremented. The in-memory inode holds only bookkeeping (open count,
//! removed flag, deny-write count); the length and extent tree always
//! come from the on-disk image through the buffer cache, so growth by any
//! opener is visible to all.
//!
//! Sectors are allocated densely: extension fills every index from the
//! first unallocated one up to the last one the new length requires.
//! Extension re-reads each indirect sector before modifying it, which
//! preserves sectors already materialised and makes it idempotent.

use alloc::sync::Arc;

use arrayvec::ArrayVec;
use spin::Mutex;
use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use crate::bio::Bcache;
use crate::device::Sector;
use crate::error::{Error, Result};
use crate::fs::freemap::FreeMap;
use crate::param::{MAXFILE, NDIRECT, NINDIRECT, NINODE, SECTOR_SIZE};

/// Identifies an inode.
pub const INODE_MAGIC: u32 = 0x494e_4f44;

/// The on-disk null sector pointer, stored as -1.
pub const NO_SECTOR: u32 = u32::MAX;

const ZERO_SECTOR: [u8; SECTOR_SIZE] = [0; SECTOR_SIZE];

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InodeType {
    File,
    Dir,
}

impl InodeType {
    fn from_raw(raw: u32) -> Self {
        match raw {
            0 => InodeType::File,
            1 => InodeType::Dir,
            _ => panic!("inode: bad type tag {}", raw),
        }
    }

    fn to_raw(self) -> u32 {
        match self {
            InodeType::File => 0,
            InodeType::Dir => 1,
        }
    }
}

/// On-disk inode. Must be exactly one sector.
#[repr(C)]
#[derive(AsBytes, FromBytes)]
struct DiskInode {
    typ: u32,
    /// File size in bytes. Lives at byte offset 4 of the sector.
    length: u32,
    direct: [u32; NDIRECT],
    sind: u32,
    dind: u32,
    magic: u32,
}

const_assert!(core::mem::size_of::<DiskInode>() == SECTOR_SIZE);

/// Payload of an indirect sector: 128 sector pointers.
#[repr(C)]
#[derive(AsBytes, FromBytes)]
struct IndirectBlock {
    entries: [u32; NINDIRECT],
}

const_assert!(core::mem::size_of::<IndirectBlock>() == SECTOR_SIZE);

impl DiskInode {
    fn empty(typ: InodeType, length: u32) -> Self {
        Self {
            typ: typ.to_raw(),
            length,
            direct: [NO_SECTOR; NDIRECT],
            sind: NO_SECTOR,
            dind: NO_SECTOR,
            magic: INODE_MAGIC,
        }
    }

    fn load(cache: &Bcache, sector: Sector) -> Self {
        let mut di = Self::empty(InodeType::File, 0);
        cache.read(sector, di.as_bytes_mut());
        assert_eq!(di.magic, INODE_MAGIC, "inode: bad magic at sector {}", sector);
        di
    }

    fn store(&self, cache: &Bcache, sector: Sector) {
        cache.write(sector, self.as_bytes());
    }

    /// Sectors currently materialised. Dense allocation makes this a pure
    /// function of the length.
    fn sectors(&self) -> usize {
        bytes_to_sectors(self.length)
    }
}

fn bytes_to_sectors(len: u32) -> usize {
    (len as usize + SECTOR_SIZE - 1) / SECTOR_SIZE
}

/// Which level of the extent tree a sector index falls in.
#[derive(Debug, PartialEq, Eq)]
enum Extent {
    Direct(usize),
    Single(usize),
    Double(usize, usize),
}

fn extent_of(idx: usize) -> Extent {
    assert!(idx < MAXFILE, "inode: sector index {} out of range", idx);
    if idx < NDIRECT {
        Extent::Direct(idx)
    } else if idx < NDIRECT + NINDIRECT {
        Extent::Single(idx - NDIRECT)
    } else {
        let rest = idx - NDIRECT - NINDIRECT;
        Extent::Double(rest / NINDIRECT, rest % NINDIRECT)
    }
}

fn read_entry(cache: &Bcache, sector: Sector, slot: usize) -> u32 {
    let mut raw = [0u8; 4];
    cache.read_at(sector, &mut raw, slot * 4);
    u32::from_ne_bytes(raw)
}

fn write_entry(cache: &Bcache, sector: Sector, slot: usize, value: u32) {
    cache.write_at(sector, &value.to_ne_bytes(), slot * 4);
}

/// Allocates a fresh indirect sector whose payload is all null markers.
fn alloc_indirect(cache: &Bcache, freemap: &FreeMap) -> Sector {
    let s = freemap
        .allocate(cache, 1)
        .unwrap_or_else(|_| panic!("inode: out of sectors during extension"));
    cache.write(s, &[0xff; SECTOR_SIZE]);
    s
}

/// Allocates and zero-fills one data sector.
fn alloc_data(cache: &Bcache, freemap: &FreeMap) -> Sector {
    let s = freemap
        .allocate(cache, 1)
        .unwrap_or_else(|_| panic!("inode: out of sectors during extension"));
    cache.write(s, &ZERO_SECTOR);
    s
}

/// In-memory inode.
pub struct Inode {
    /// Sector of the on-disk image.
    pub sector: Sector,
    inner: Mutex<InodeInner>,
}

struct InodeInner {
    open_cnt: u32,
    removed: bool,
    deny_write_cnt: u32,
}

/// Whether `length` fits in the extent tree.
pub(crate) fn valid_length(length: u32) -> bool {
    bytes_to_sectors(length) <= MAXFILE
}

impl Inode {
    /// Writes a fresh on-disk inode of `length` bytes at `sector` and
    /// materialises its data sectors.
    pub fn create(cache: &Bcache, freemap: &FreeMap, sector: Sector, length: u32, typ: InodeType) {
        assert!(valid_length(length), "inode: create past max file size");
        let di = DiskInode::empty(typ, 0);
        di.store(cache, sector);
        if length > 0 {
            Self::extend(cache, freemap, sector, length);
        }
    }

    /// Reads up to `buf.len()` bytes starting at `offset`. Returns the
    /// number of bytes read, which is short at end of file.
    pub fn read_at(&self, cache: &Bcache, buf: &mut [u8], offset: u32) -> usize {
        let di = DiskInode::load(cache, self.sector);
        let length = di.length;
        let mut offset = offset as usize;
        let mut done = 0;

        while done < buf.len() {
            if offset >= length as usize {
                break;
            }
            let sector_ofs = offset % SECTOR_SIZE;
            let chunk = (buf.len() - done)
                .min(SECTOR_SIZE - sector_ofs)
                .min(length as usize - offset);
            let sector = Self::index_to_sector(cache, &di, offset / SECTOR_SIZE);
            cache.read_at(sector, &mut buf[done..done + chunk], sector_ofs);
            done += chunk;
            offset += chunk;
        }
        done
    }

    /// Writes `buf` at `offset`, extending the file first if it ends past
    /// the current length. Returns the number of bytes written: zero
    /// while writes are denied, `buf.len()` otherwise.
    pub fn write_at(
        &self,
        cache: &Bcache,
        freemap: &FreeMap,
        buf: &[u8],
        offset: u32,
    ) -> Result<usize> {
        if self.inner.lock().deny_write_cnt > 0 {
            return Ok(0);
        }
        let end = offset as usize + buf.len();
        if bytes_to_sectors(end as u32) > MAXFILE {
            return Err(Error::InvalidArg);
        }
        if end > DiskInode::load(cache, self.sector).length as usize {
            Self::extend(cache, freemap, self.sector, end as u32);
        }
        self.write_in_place(cache, buf, offset);
        Ok(buf.len())
    }

    /// Writes within the current extent of the file. The range must not
    /// reach past the length.
    pub(crate) fn write_in_place(&self, cache: &Bcache, buf: &[u8], offset: u32) {
        let di = DiskInode::load(cache, self.sector);
        assert!(
            offset as usize + buf.len() <= di.length as usize,
            "inode: in-place write past length"
        );

        let mut offset = offset as usize;
        let mut done = 0;
        while done < buf.len() {
            let sector_ofs = offset % SECTOR_SIZE;
            let chunk = (buf.len() - done).min(SECTOR_SIZE - sector_ofs);
            let sector = Self::index_to_sector(cache, &di, offset / SECTOR_SIZE);
            cache.write_at(sector, &buf[done..done + chunk], sector_ofs);
            done += chunk;
            offset += chunk;
        }
    }

    /// Grows the file at `sector` to `new_len` bytes, allocating every
    /// missing sector index densely. Panics if the free-map runs out
    /// partway; this design has no partial rollback.
    fn extend(cache: &Bcache, freemap: &FreeMap, sector: Sector, new_len: u32) {
        let mut di = DiskInode::load(cache, sector);
        debug_assert!(new_len > di.length, "inode: extend shrinks");

        for idx in di.sectors()..bytes_to_sectors(new_len) {
            match extent_of(idx) {
                Extent::Direct(i) => {
                    debug_assert_eq!(di.direct[i], NO_SECTOR);
                    di.direct[i] = alloc_data(cache, freemap);
                }
                Extent::Single(i) => {
                    if di.sind == NO_SECTOR {
                        di.sind = alloc_indirect(cache, freemap);
                    }
                    if read_entry(cache, di.sind, i) == NO_SECTOR {
                        write_entry(cache, di.sind, i, alloc_data(cache, freemap));
                    }
                }
                Extent::Double(outer, inner) => {
                    if di.dind == NO_SECTOR {
                        di.dind = alloc_indirect(cache, freemap);
                    }
                    let mut sind = read_entry(cache, di.dind, outer);
                    if sind == NO_SECTOR {
                        sind = alloc_indirect(cache, freemap);
                        write_entry(cache, di.dind, outer, sind);
                    }
                    if read_entry(cache, sind, inner) == NO_SECTOR {
                        write_entry(cache, sind, inner, alloc_data(cache, freemap));
                    }
                }
            }
        }

        di.length = new_len;
        di.store(cache, sector);
    }

    /// Maps a sector index within the file to its device sector.
    fn index_to_sector(cache: &Bcache, di: &DiskInode, idx: usize) -> Sector {
        let sector = match extent_of(idx) {
            Extent::Direct(i) => di.direct[i],
            Extent::Single(i) => {
                assert_ne!(di.sind, NO_SECTOR, "inode: missing single-indirect sector");
                read_entry(cache, di.sind, i)
            }
            Extent::Double(outer, inner) => {
                assert_ne!(di.dind, NO_SECTOR, "inode: missing double-indirect sector");
                let sind = read_entry(cache, di.dind, outer);
                assert_ne!(sind, NO_SECTOR, "inode: hole in double-indirect sector");
                read_entry(cache, sind, inner)
            }
        };
        assert_ne!(sector, NO_SECTOR, "inode: hole in extent tree");
        sector
    }

    /// Returns every data and indirect sector to the free-map. Called for
    /// a removed inode once its last opener is gone.
    pub(crate) fn release(cache: &Bcache, freemap: &FreeMap, sector: Sector) {
        let di = DiskInode::load(cache, sector);

        for &s in di.direct.iter() {
            if s != NO_SECTOR {
                freemap.release(cache, s, 1);
            }
        }

        if di.sind != NO_SECTOR {
            Self::release_indirect(cache, freemap, di.sind);
        }

        if di.dind != NO_SECTOR {
            let mut outer = IndirectBlock {
                entries: [NO_SECTOR; NINDIRECT],
            };
            cache.read(di.dind, outer.as_bytes_mut());
            for &sind in outer.entries.iter() {
                if sind != NO_SECTOR {
                    Self::release_indirect(cache, freemap, sind);
                }
            }
            freemap.release(cache, di.dind, 1);
        }
    }

    fn release_indirect(cache: &Bcache, freemap: &FreeMap, sector: Sector) {
        let mut blk = IndirectBlock {
            entries: [NO_SECTOR; NINDIRECT],
        };
        cache.read(sector, blk.as_bytes_mut());
        for &s in blk.entries.iter() {
            if s != NO_SECTOR {
                freemap.release(cache, s, 1);
            }
        }
        freemap.release(cache, sector, 1);
    }

    /// Length in bytes, read from byte offset 4 of the on-disk image so
    /// growth by any opener is visible to all.
    pub fn length(&self, cache: &Bcache) -> u32 {
        let mut raw = [0u8; 4];
        cache.read_at(self.sector, &mut raw, 4);
        u32::from_ne_bytes(raw)
    }

    /// Type tag of the on-disk inode.
    pub fn typ(&self, cache: &Bcache) -> InodeType {
        let mut raw = [0u8; 4];
        cache.read_at(self.sector, &mut raw, 0);
        InodeType::from_raw(u32::from_ne_bytes(raw))
    }

    pub fn is_dir(&self, cache: &Bcache) -> bool {
        self.typ(cache) == InodeType::Dir
    }

    /// Marks the inode for deletion when the last opener closes it.
    pub fn mark_removed(&self) {
        self.inner.lock().removed = true;
    }

    pub fn is_removed(&self) -> bool {
        self.inner.lock().removed
    }

    /// Disables writes. May be called at most once per opener.
    pub fn deny_write(&self) {
        let mut inner = self.inner.lock();
        inner.deny_write_cnt += 1;
        assert!(
            inner.deny_write_cnt <= inner.open_cnt,
            "inode: deny_write without open"
        );
    }

    /// Re-enables writes. Must pair with an earlier `deny_write` by the
    /// same opener.
    pub fn allow_write(&self) {
        let mut inner = self.inner.lock();
        assert!(inner.deny_write_cnt > 0, "inode: allow_write underflow");
        assert!(inner.deny_write_cnt <= inner.open_cnt);
        inner.deny_write_cnt -= 1;
    }
}

/// Table of open inodes. Two opens of the same sector share one entry.
pub struct Itable {
    list: Mutex<ArrayVec<Arc<Inode>, NINODE>>,
}

impl Itable {
    pub fn new() -> Self {
        Self {
            list: Mutex::new(ArrayVec::new()),
        }
    }

    /// Opens the inode stored at `sector`, sharing the in-memory object
    /// with any existing opener.
    pub fn open(&self, cache: &Bcache, sector: Sector) -> Result<Arc<Inode>> {
        let mut list = self.list.lock();
        if let Some(inode) = list.iter().find(|i| i.sector == sector) {
            inode.inner.lock().open_cnt += 1;
            return Ok(inode.clone());
        }

        // Validates the magic before the inode joins the table.
        let _ = DiskInode::load(cache, sector);

        if list.is_full() {
            log::warn!("itable: no free slot for sector {}", sector);
            return Err(Error::NoMem);
        }
        let inode = Arc::new(Inode {
            sector,
            inner: Mutex::new(InodeInner {
                open_cnt: 1,
                removed: false,
                deny_write_cnt: 0,
            }),
        });
        list.push(inode.clone());
        Ok(inode)
    }

    /// Re-opens `inode`, bumping its open count.
    pub fn reopen(&self, inode: &Arc<Inode>) -> Arc<Inode> {
        inode.inner.lock().open_cnt += 1;
        inode.clone()
    }

    /// Closes one reference to `inode`. The last close drops it from the
    /// table; if it was marked removed, its data sectors, indirect
    /// sectors, and its own sector go back to the free-map.
    pub fn close(&self, cache: &Bcache, freemap: &FreeMap, inode: Arc<Inode>) {
        let mut list = self.list.lock();
        let release = {
            let mut inner = inode.inner.lock();
            assert!(inner.open_cnt > 0, "itable: close without open");
            inner.open_cnt -= 1;
            if inner.open_cnt > 0 {
                return;
            }
            inner.removed
        };

        list.retain(|i| i.sector != inode.sector);
        drop(list);

        if release {
            log::debug!("itable: releasing removed inode at sector {}", inode.sector);
            Inode::release(cache, freemap, inode.sector);
            freemap.release(cache, inode.sector, 1);
        }
    }

}
