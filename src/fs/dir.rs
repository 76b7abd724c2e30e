//! Directories.
//!
//! A directory is an inode of type `Dir` whose payload is a packed array
//! of fixed-size entries `{inode sector, name, in-use flag}`. Names are
//! NUL-terminated, at most `NAME_MAX` bytes, and never contain `/`.
//!
//! Every directory holds `.` pointing to itself and `..` pointing to its
//! parent; the root points both at itself. `add` fills the first free
//! slot or appends; `remove` marks a slot free; `lookup` scans linearly.

use alloc::sync::Arc;

use arrayvec::ArrayString;
use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use crate::device::Sector;
use crate::error::{Error, Result};
use crate::fs::inode::Inode;
use crate::fs::FileSys;
use crate::param::{NAME_MAX, ROOT_DIR_SECTOR};

/// On-disk directory entry.
#[repr(C)]
#[derive(AsBytes, FromBytes)]
struct RawEntry {
    sector: u32,
    /// NUL-padded, NUL-terminated name.
    name: [u8; NAME_MAX + 1],
    in_use: u8,
}

const ENTRY_SIZE: usize = core::mem::size_of::<RawEntry>();
const_assert!(ENTRY_SIZE == 20);

impl RawEntry {
    fn empty() -> Self {
        Self {
            sector: 0,
            name: [0; NAME_MAX + 1],
            in_use: 0,
        }
    }

    fn name(&self) -> &str {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(NAME_MAX);
        core::str::from_utf8(&self.name[..len]).unwrap_or("")
    }

    fn set_name(&mut self, name: &str) {
        self.name = [0; NAME_MAX + 1];
        self.name[..name.len()].copy_from_slice(name.as_bytes());
    }
}

/// Checks a name for validity as a single directory entry.
fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > NAME_MAX || name.contains('/') || name.contains('\0') {
        return Err(Error::InvalidArg);
    }
    Ok(())
}

/// An open directory handle.
pub struct Dir {
    inode: Arc<Inode>,
    /// Cursor for `read_next`.
    pos: u32,
}

impl core::fmt::Debug for Dir {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Dir").field("inode", &self.inode.sector).finish()
    }
}

impl Dir {
    /// Wraps an already-open inode, taking ownership of the reference.
    pub fn open(inode: Arc<Inode>) -> Dir {
        Dir { inode, pos: 0 }
    }

    /// Opens the root directory.
    pub fn open_root(fs: &FileSys) -> Result<Dir> {
        Ok(Dir::open(fs.itable.open(&fs.cache, ROOT_DIR_SECTOR)?))
    }

    /// Opens a second handle on the same directory.
    pub fn reopen(&self, fs: &FileSys) -> Dir {
        Dir::open(fs.itable.reopen(&self.inode))
    }

    /// Closes the handle, dropping its inode reference.
    pub fn close(self, fs: &FileSys) {
        let Dir { inode, .. } = self;
        fs.itable.close(&fs.cache, &fs.freemap, inode);
    }

    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    /// Reads the entry at byte offset `ofs`, or `None` at end.
    fn entry_at(&self, fs: &FileSys, ofs: u32) -> Option<RawEntry> {
        let mut e = RawEntry::empty();
        if self.inode.read_at(&fs.cache, e.as_bytes_mut(), ofs) == ENTRY_SIZE {
            Some(e)
        } else {
            None
        }
    }

    /// Scans for an in-use entry named `name`. Returns the entry and its
    /// byte offset.
    fn scan(&self, fs: &FileSys, name: &str) -> Option<(RawEntry, u32)> {
        let mut ofs = 0;
        while let Some(e) = self.entry_at(fs, ofs) {
            if e.in_use != 0 && e.name() == name {
                return Some((e, ofs));
            }
            ofs += ENTRY_SIZE as u32;
        }
        None
    }

    /// Looks `name` up and opens its inode. The name `/` resolves to the
    /// root regardless of the directory searched.
    pub fn lookup(&self, fs: &FileSys, name: &str) -> Result<Arc<Inode>> {
        if name == "/" {
            return fs.itable.open(&fs.cache, ROOT_DIR_SECTOR);
        }
        let (e, _) = self.scan(fs, name).ok_or(Error::NotFound)?;
        fs.itable.open(&fs.cache, e.sector)
    }

    /// Adds an entry mapping `name` to the inode at `sector`, using the
    /// first free slot or appending one.
    pub fn add(&self, fs: &FileSys, name: &str, sector: Sector) -> Result<()> {
        check_name(name)?;
        if self.scan(fs, name).is_some() {
            return Err(Error::Exists);
        }

        let mut ofs = 0;
        while let Some(e) = self.entry_at(fs, ofs) {
            if e.in_use == 0 {
                break;
            }
            ofs += ENTRY_SIZE as u32;
        }

        let mut e = RawEntry::empty();
        e.sector = sector;
        e.set_name(name);
        e.in_use = 1;
        let n = self
            .inode
            .write_at(&fs.cache, &fs.freemap, e.as_bytes(), ofs)?;
        debug_assert_eq!(n, ENTRY_SIZE, "dir: short entry write");
        Ok(())
    }

    /// Removes the entry for `name` and marks its inode for deletion.
    /// A directory may only be removed while empty.
    pub fn remove(&self, fs: &FileSys, name: &str) -> Result<()> {
        if name == "." || name == ".." {
            return Err(Error::InvalidArg);
        }
        let (mut e, ofs) = self.scan(fs, name).ok_or(Error::NotFound)?;
        let inode = fs.itable.open(&fs.cache, e.sector)?;

        if inode.is_dir(&fs.cache) && !Dir::open(fs.itable.reopen(&inode)).into_empty(fs) {
            fs.itable.close(&fs.cache, &fs.freemap, inode);
            return Err(Error::Exists);
        }

        e.in_use = 0;
        let n = self
            .inode
            .write_at(&fs.cache, &fs.freemap, e.as_bytes(), ofs)?;
        debug_assert_eq!(n, ENTRY_SIZE);

        inode.mark_removed();
        fs.itable.close(&fs.cache, &fs.freemap, inode);
        Ok(())
    }

    /// Consumes a handle and reports whether the directory holds nothing
    /// but `.` and `..`.
    fn into_empty(self, fs: &FileSys) -> bool {
        let mut ofs = 0;
        let mut empty = true;
        while let Some(e) = self.entry_at(fs, ofs) {
            if e.in_use != 0 && e.name() != "." && e.name() != ".." {
                empty = false;
                break;
            }
            ofs += ENTRY_SIZE as u32;
        }
        self.close(fs);
        empty
    }

    /// Returns the next in-use entry name, advancing the cursor. `.` and
    /// `..` are reported like any other entry.
    pub fn read_next(&mut self, fs: &FileSys) -> Option<ArrayString<NAME_MAX>> {
        while let Some(e) = self.entry_at(fs, self.pos) {
            self.pos += ENTRY_SIZE as u32;
            if e.in_use != 0 {
                return ArrayString::from(e.name()).ok();
            }
        }
        None
    }
}
