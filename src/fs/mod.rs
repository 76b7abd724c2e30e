//! File system.
//!
//! Five layers, leaves first:
//!   + Free-map: bitmap allocator for raw sectors, persisted at sector 0.
//!   + Inodes: extent trees, reading, writing, growth, release.
//!   + Directories: inodes with special contents (lists of other inodes).
//!   + Paths: names like /usr/notes/a resolved against a directory.
//!   + Façade: create/open/remove/chdir/mkdir entry points.
//!
//! All façade entry points serialise on a single lock, so directory
//! traversal and inode metadata updates observe a consistent view. All
//! device access goes through the buffer cache; nothing below this module
//! touches the block device directly.

use alloc::sync::Arc;

use scopeguard::ScopeGuard;
use spin::Mutex;

use crate::bio::Bcache;
use crate::device::BlockDevice;
use crate::error::{Error, Result};
use crate::param::{FREE_MAP_SECTOR, ROOT_DIR_SECTOR};

pub mod dir;
pub mod file;
pub mod freemap;
pub mod inode;
pub mod path;

pub use dir::Dir;
pub use file::File;
pub use freemap::FreeMap;
pub use inode::{Inode, InodeType, Itable};

pub struct FileSys {
    #[allow(dead_code)]
    dev: Arc<dyn BlockDevice>,
    pub(crate) cache: Bcache,
    pub(crate) itable: Itable,
    pub(crate) freemap: FreeMap,
    /// The façade lock. Everything path- or metadata-shaped runs under it.
    pub(crate) lock: Mutex<()>,
}

impl FileSys {
    /// Brings the file system up on `dev`. With `format` set the device
    /// is wiped: a fresh free-map, then a root directory holding `.` and
    /// `..` entries that both point at itself.
    pub fn init(dev: Arc<dyn BlockDevice>, format: bool) -> Result<Arc<FileSys>> {
        let size = dev.size();
        let fs = Arc::new(FileSys {
            cache: Bcache::new(dev.clone()),
            itable: Itable::new(),
            freemap: FreeMap::new(size),
            lock: Mutex::new(()),
            dev,
        });

        if format {
            log::info!("fs: formatting {} sectors", size);
            Inode::create(
                &fs.cache,
                &fs.freemap,
                FREE_MAP_SECTOR,
                FreeMap::file_len(size),
                InodeType::File,
            );
            Inode::create(&fs.cache, &fs.freemap, ROOT_DIR_SECTOR, 0, InodeType::Dir);
            let root = Dir::open_root(&fs)?;
            root.add(&fs, ".", ROOT_DIR_SECTOR)?;
            root.add(&fs, "..", ROOT_DIR_SECTOR)?;
            root.close(&fs);
        }

        fs.freemap.open(&fs.cache, &fs.itable, !format)?;
        log::info!("fs: ready, {} sectors in use", fs.freemap.used());
        Ok(fs)
    }

    /// Shuts the file system down, writing any unwritten data to the
    /// device. Flushing here again makes the periodic flusher's shutdown
    /// ordering irrelevant.
    pub fn done(&self) {
        self.cache.flush_all();
        self.freemap.close(&self.cache, &self.itable);
        self.cache.flush_all();
        log::info!("fs: done");
    }

    pub fn cache(&self) -> &Bcache {
        &self.cache
    }

    /// Opens a fresh handle on the root directory.
    pub fn root(self: &Arc<Self>) -> Result<Dir> {
        let _guard = self.lock.lock();
        Dir::open_root(self)
    }

    /// Creates a file or directory at `path`, sized `size` bytes. Paths
    /// resolve against `cwd`, or the root when `cwd` is `None`. A new
    /// directory is populated with its `.` and `..` entries.
    pub fn create(
        self: &Arc<Self>,
        cwd: Option<&Dir>,
        path: &str,
        size: u32,
        typ: InodeType,
    ) -> Result<()> {
        let _guard = self.lock.lock();

        if !inode::valid_length(size) {
            return Err(Error::InvalidArg);
        }

        let (dir, leaf) = path::parse(self, cwd, path)?;
        let dir = scopeguard::guard(dir, |d| d.close(self));
        if dir.inode().is_removed() {
            return Err(Error::NotFound);
        }

        let sector = self.freemap.allocate(&self.cache, 1)?;
        // Give the sector (and anything materialised under it) back if
        // the new inode never gets linked into the directory.
        let rollback = scopeguard::guard((), |_| {
            Inode::release(&self.cache, &self.freemap, sector);
            self.freemap.release(&self.cache, sector, 1);
        });

        Inode::create(&self.cache, &self.freemap, sector, size, typ);

        if typ == InodeType::Dir {
            let child = Dir::open(
                self.itable
                    .open(&self.cache, sector)
                    .expect("fs: open fresh directory"),
            );
            child
                .add(self, ".", sector)
                .and_then(|_| child.add(self, "..", dir.inode().sector))
                .expect("fs: creating . and .. entries");
            child.close(self);
        }

        dir.add(self, leaf, sector)?;
        ScopeGuard::into_inner(rollback);
        Ok(())
    }

    /// Opens the file or directory at `path`.
    pub fn open(self: &Arc<Self>, cwd: Option<&Dir>, path: &str) -> Result<File> {
        let _guard = self.lock.lock();

        let (dir, leaf) = path::parse(self, cwd, path)?;
        let dir = scopeguard::guard(dir, |d| d.close(self));
        if dir.inode().is_removed() {
            return Err(Error::NotFound);
        }

        let inode = dir.lookup(self, leaf)?;
        Ok(File::new(self.clone(), inode))
    }

    /// Removes the entry at `path`, deleting its inode once the last
    /// opener is gone. Refuses directories that are not empty.
    pub fn remove(self: &Arc<Self>, cwd: Option<&Dir>, path: &str) -> Result<()> {
        let _guard = self.lock.lock();

        let (dir, leaf) = path::parse(self, cwd, path)?;
        let dir = scopeguard::guard(dir, |d| d.close(self));
        dir.remove(self, leaf)
    }

    /// `create` with directory type; the conventional spelling.
    pub fn mkdir(self: &Arc<Self>, cwd: Option<&Dir>, path: &str) -> Result<()> {
        self.create(cwd, path, 0, InodeType::Dir)
    }

    /// Resolves `path` to a directory and returns an open handle on it,
    /// intended to become the caller's new current directory.
    pub fn chdir(self: &Arc<Self>, cwd: Option<&Dir>, path: &str) -> Result<Dir> {
        let _guard = self.lock.lock();

        let (dir, leaf) = path::parse(self, cwd, path)?;
        let dir = scopeguard::guard(dir, |d| d.close(self));

        let inode = dir.lookup(self, leaf)?;
        if !inode.is_dir(&self.cache) {
            self.itable.close(&self.cache, &self.freemap, inode);
            return Err(Error::NotDir);
        }
        Ok(Dir::open(inode))
    }

    /// Closes a directory handle obtained from this file system.
    pub fn close_dir(&self, dir: Dir) {
        let _guard = self.lock.lock();
        dir.close(self);
    }

    /// Sectors currently marked used in the free-map.
    pub fn used_sectors(&self) -> usize {
        self.freemap.used()
    }
}
