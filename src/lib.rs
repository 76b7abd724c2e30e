//! minos: the storage and memory core of a small teaching operating
//! system.
//!
//! Three tightly coupled subsystems over two block devices:
//!
//! * a 64-slot write-behind buffer cache with second-chance eviction and
//!   a periodic flush (`bio`);
//! * an indexed file system: free-map, inodes with direct and indirect
//!   extents, directories, path resolution, and a locked façade (`fs`);
//! * demand-paged virtual memory: frame table with pinning and
//!   second-chance victim selection, per-address-space supplemental page
//!   tables, a swap area, mmap with write-back, and the page-fault path
//!   (`vm`).
//!
//! The scheduler, syscall dispatch, ELF loading, and real device drivers
//! live outside; the core consumes them through narrow seams: the
//! `BlockDevice` trait, a sleep callback for the flusher, and explicit
//! current-directory and stack-pointer arguments.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod bio;
pub mod device;
pub mod error;
pub mod fs;
pub mod kernel;
pub mod param;
pub mod vm;

pub use bio::{flush_daemon, Bcache};
pub use device::{BlockDevice, MemDisk, Sector};
pub use error::{Error, Result};
pub use fs::{Dir, File, FileSys, InodeType};
pub use kernel::{Core, Env};
pub use vm::{AddressSpace, MapId, Vm};
