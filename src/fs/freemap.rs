//! Free-map.
//!
//! A bitmap with one bit per file-system sector, set exactly for the
//! sectors in use. The map lives in memory and is persisted through the
//! inode at sector 0: every update is written through that file (and so
//! through the buffer cache) immediately.
//!
//! Concurrency piggy-backs on the file-system façade lock; the inner
//! mutex only keeps the bitmap itself coherent.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use crate::bio::Bcache;
use crate::device::Sector;
use crate::error::{Error, Result};
use crate::fs::inode::{Inode, Itable};
use crate::param::{FREE_MAP_SECTOR, ROOT_DIR_SECTOR, SECTOR_SIZE};

pub struct FreeMap {
    inner: Mutex<Inner>,
}

struct Inner {
    bits: Vec<u8>,
    sectors: u32,
    /// Open handle on the free-map file; `None` until `open`, during
    /// which updates stay in memory only (the format bootstrap).
    file: Option<Arc<Inode>>,
}

impl Inner {
    fn test(&self, i: u32) -> bool {
        self.bits[i as usize / 8] & (1 << (i % 8)) != 0
    }

    fn set(&mut self, i: u32) {
        self.bits[i as usize / 8] |= 1 << (i % 8);
    }

    fn clear(&mut self, i: u32) {
        self.bits[i as usize / 8] &= !(1 << (i % 8));
    }

    /// Writes the bytes covering bits `first..first + cnt` through the
    /// free-map file, if it is open.
    fn write_through(&self, cache: &Bcache, first: u32, cnt: u32) {
        let file = match &self.file {
            Some(f) => f,
            None => return,
        };
        let lo = first as usize / 8;
        let hi = (first + cnt - 1) as usize / 8;
        file.write_in_place(cache, &self.bits[lo..=hi], lo as u32);
    }
}

impl FreeMap {
    /// Creates an in-memory map for a device of `sectors` sectors, with
    /// only the two well-known metadata sectors marked used.
    pub fn new(sectors: Sector) -> Self {
        let mut inner = Inner {
            bits: vec![0; (sectors as usize + 7) / 8],
            sectors,
            file: None,
        };
        inner.set(FREE_MAP_SECTOR);
        inner.set(ROOT_DIR_SECTOR);
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Size in bytes of the persisted bitmap file.
    pub fn file_len(sectors: Sector) -> u32 {
        (sectors + 7) / 8
    }

    /// Opens the free-map file at sector 0. When `load` is set the bitmap
    /// is read back from disk, replacing the in-memory state; a freshly
    /// formatted map skips the load and persists itself instead.
    pub fn open(&self, cache: &Bcache, itable: &Itable, load: bool) -> Result<()> {
        let inode = itable.open(cache, FREE_MAP_SECTOR)?;
        let mut inner = self.inner.lock();
        if load {
            let n = inode.read_at(cache, &mut inner.bits, 0);
            if n != inner.bits.len() {
                return Err(Error::Io);
            }
        }
        inner.file = Some(inode);
        if !load {
            self.persist_all(cache, &inner);
        }
        Ok(())
    }

    /// Persists the free-map and closes its file handle.
    pub fn close(&self, cache: &Bcache, itable: &Itable) {
        let file = {
            let mut inner = self.inner.lock();
            self.persist_all(cache, &inner);
            inner.file.take()
        };
        if let Some(inode) = file {
            itable.close(cache, self, inode);
        }
    }

    fn persist_all(&self, cache: &Bcache, inner: &Inner) {
        let file = match &inner.file {
            Some(f) => f,
            None => return,
        };
        for off in num_iter::range_step(0, inner.bits.len(), SECTOR_SIZE) {
            let end = (off + SECTOR_SIZE).min(inner.bits.len());
            file.write_in_place(cache, &inner.bits[off..end], off as u32);
        }
    }

    /// Finds `cnt` consecutive free sectors, marks them used, and returns
    /// the first. The update is written through immediately.
    pub fn allocate(&self, cache: &Bcache, cnt: u32) -> Result<Sector> {
        assert!(cnt > 0);
        let mut inner = self.inner.lock();

        let mut run = 0;
        let mut first = 0;
        for i in 0..inner.sectors {
            if inner.test(i) {
                run = 0;
                continue;
            }
            if run == 0 {
                first = i;
            }
            run += 1;
            if run == cnt {
                for b in first..first + cnt {
                    inner.set(b);
                }
                inner.write_through(cache, first, cnt);
                return Ok(first);
            }
        }
        log::warn!("freemap: no run of {} free sectors", cnt);
        Err(Error::NoSpace)
    }

    /// Marks sectors `first..first + cnt` free again.
    pub fn release(&self, cache: &Bcache, first: Sector, cnt: u32) {
        let mut inner = self.inner.lock();
        for i in first..first + cnt {
            assert!(inner.test(i), "freemap: releasing free sector {}", i);
            inner.clear(i);
        }
        inner.write_through(cache, first, cnt);
    }

    /// Number of sectors currently marked used.
    pub fn used(&self) -> usize {
        let inner = self.inner.lock();
        (0..inner.sectors).filter(|&i| inner.test(i)).count()
    }
}
