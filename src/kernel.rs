//! Lifecycle glue.
//!
//! One `Core` per machine: the boot path builds it from the environment
//! (the two block devices and the user-pool size), and the shutdown path
//! calls `done` exactly once. Everything else reaches the subsystems
//! through the two shared handles.

use alloc::sync::Arc;

use crate::device::BlockDevice;
use crate::error::Result;
use crate::fs::FileSys;
use crate::vm::Vm;

/// Boot-time environment for the core.
pub struct Env {
    /// Device holding the file system.
    pub fs_dev: Arc<dyn BlockDevice>,
    /// Device backing the swap area.
    pub swap_dev: Arc<dyn BlockDevice>,
    /// Size of the user-page pool, in frames.
    pub pool_pages: usize,
    /// Wipe and reformat the file-system device.
    pub format: bool,
}

pub struct Core {
    pub fs: Arc<FileSys>,
    pub vm: Arc<Vm>,
}

impl Core {
    /// Initialises every subsystem in dependency order: buffer cache and
    /// file system first (the free-map lives in a file), then the frame
    /// pool and swap area.
    pub fn init(env: Env) -> Result<Core> {
        let fs = FileSys::init(env.fs_dev, env.format)?;
        let vm = Vm::init(env.swap_dev, env.pool_pages);
        log::info!("core: up");
        Ok(Core { fs, vm })
    }

    /// Orderly shutdown: flush the cache and close the free-map. The
    /// periodic flusher need not be joined first; flushing twice is
    /// harmless.
    pub fn done(&self) {
        self.fs.done();
        log::info!("core: down");
    }
}
