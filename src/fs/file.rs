//! Open file handles.
//!
//! A `File` pairs an open inode with a read/write position and a
//! per-handle deny-write flag. Handles are cheap; several may share one
//! inode. All public operations serialise on the file-system façade lock;
//! the `_raw` variants skip it and exist for the virtual-memory layer,
//! whose lock order puts the frame lock before everything file-related.

use alloc::sync::Arc;
use core::fmt;

use crate::error::Result;
use crate::fs::inode::Inode;
use crate::fs::FileSys;

pub struct File {
    fs: Arc<FileSys>,
    inode: Arc<Inode>,
    pos: u32,
    denied: bool,
}

impl fmt::Debug for File {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("File")
            .field("inode", &self.inode.sector)
            .field("pos", &self.pos)
            .finish()
    }
}

impl File {
    pub(crate) fn new(fs: Arc<FileSys>, inode: Arc<Inode>) -> File {
        File {
            fs,
            inode,
            pos: 0,
            denied: false,
        }
    }

    /// Opens a second, independent handle on the same inode with its own
    /// position.
    pub fn reopen(&self) -> File {
        File::new(self.fs.clone(), self.fs.itable.reopen(&self.inode))
    }

    /// Closes the handle. A handle that denied writes re-allows them.
    pub fn close(mut self) {
        if self.denied {
            self.inode.allow_write();
            self.denied = false;
        }
        let File { fs, inode, .. } = self;
        fs.itable.close(&fs.cache, &fs.freemap, inode);
    }

    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    /// Reads at the current position, advancing it by the bytes read.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = self.read_at(buf, self.pos);
        self.pos += n as u32;
        n
    }

    /// Writes at the current position, advancing it by the bytes written.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let n = self.write_at(buf, self.pos)?;
        self.pos += n as u32;
        Ok(n)
    }

    /// Reads `buf.len()` bytes at `ofs` without moving the position.
    pub fn read_at(&self, buf: &mut [u8], ofs: u32) -> usize {
        let _guard = self.fs.lock.lock();
        self.inode.read_at(&self.fs.cache, buf, ofs)
    }

    /// Writes `buf` at `ofs` without moving the position, extending the
    /// file as needed. Returns zero while writes are denied.
    pub fn write_at(&self, buf: &[u8], ofs: u32) -> Result<usize> {
        let _guard = self.fs.lock.lock();
        self.inode.write_at(&self.fs.cache, &self.fs.freemap, buf, ofs)
    }

    /// Like `read_at`, but without the façade lock. For callers that hold
    /// the frame lock.
    pub(crate) fn read_at_raw(&self, buf: &mut [u8], ofs: u32) -> usize {
        self.inode.read_at(&self.fs.cache, buf, ofs)
    }

    /// Like `write_at`, but without the façade lock, and never extending.
    pub(crate) fn write_back_raw(&self, buf: &[u8], ofs: u32) {
        self.inode.write_in_place(&self.fs.cache, buf, ofs);
    }

    pub fn seek(&mut self, pos: u32) {
        self.pos = pos;
    }

    pub fn tell(&self) -> u32 {
        self.pos
    }

    /// Length in bytes, read from the on-disk inode.
    pub fn length(&self) -> u32 {
        let _guard = self.fs.lock.lock();
        self.inode.length(&self.fs.cache)
    }

    /// Blocks writes to the underlying inode through any handle until
    /// this handle re-allows them or closes.
    pub fn deny_write(&mut self) {
        if !self.denied {
            self.denied = true;
            self.inode.deny_write();
        }
    }

    pub fn allow_write(&mut self) {
        if self.denied {
            self.denied = false;
            self.inode.allow_write();
        }
    }
}
