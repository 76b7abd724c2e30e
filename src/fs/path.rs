//! Path resolution.
//!
//! `parse` splits a path into an open handle on its containing directory
//! plus the leaf name, descending component by component. A path with
//! leading slashes starts from the root; otherwise it starts from the
//! caller's current directory, which is reopened so the caller keeps its
//! own handle. A path of nothing but slashes resolves to the root with
//! the leaf `.`; a trailing slash with no leaf name is rejected.

use crate::error::{Error, Result};
use crate::fs::dir::Dir;
use crate::fs::FileSys;

/// Resolves `path` to `(containing directory, leaf name)`. The caller
/// owns and must close the returned directory handle.
pub(crate) fn parse<'p>(
    fs: &FileSys,
    cwd: Option<&Dir>,
    path: &'p str,
) -> Result<(Dir, &'p str)> {
    if path.is_empty() {
        return Err(Error::InvalidArg);
    }

    let trimmed = path.trim_start_matches('/');
    let absolute = trimmed.len() != path.len();
    if trimmed.is_empty() {
        // "/", "////": the root itself.
        return Ok((Dir::open_root(fs)?, "."));
    }

    let mut dir = if absolute {
        Dir::open_root(fs)?
    } else {
        match cwd {
            Some(d) => d.reopen(fs),
            None => Dir::open_root(fs)?,
        }
    };

    let mut rest = trimmed;
    loop {
        let (comp, tail) = match rest.find('/') {
            None => (rest, ""),
            Some(i) => (&rest[..i], rest[i..].trim_start_matches('/')),
        };

        if tail.is_empty() {
            if rest.len() > comp.len() {
                // "name/" with nothing after the slash.
                dir.close(fs);
                return Err(Error::InvalidArg);
            }
            return Ok((dir, comp));
        }

        let inode = match dir.lookup(fs, comp) {
            Ok(inode) => inode,
            Err(e) => {
                dir.close(fs);
                return Err(e);
            }
        };
        dir.close(fs);
        if !inode.is_dir(&fs.cache) {
            fs.itable.close(&fs.cache, &fs.freemap, inode);
            return Err(Error::NotDir);
        }
        dir = Dir::open(inode);
        rest = tail;
    }
}
