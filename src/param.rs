/// Size of a device sector in bytes. The unit of all block I/O.
pub const SECTOR_SIZE: usize = 512;

/// Size of the buffer cache, in slots.
pub const NBUF: usize = 64;

/// Interval between periodic cache flushes, in timer ticks.
pub const FLUSH_INTERVAL: u64 = 50;

/// Maximum number of simultaneously open i-nodes.
pub const NINODE: usize = 50;

/// Sector holding the free-map inode.
pub const FREE_MAP_SECTOR: u32 = 0;

/// Sector holding the root-directory inode.
pub const ROOT_DIR_SECTOR: u32 = 1;

/// Maximum length of a file name component, not counting the NUL.
pub const NAME_MAX: usize = 14;

/// Direct sector pointers per on-disk inode.
pub const NDIRECT: usize = 123;

/// Sector pointers per indirect sector.
pub const NINDIRECT: usize = SECTOR_SIZE / core::mem::size_of::<u32>();

/// Maximum file size, in sectors.
pub const MAXFILE: usize = NDIRECT + NINDIRECT + NINDIRECT * NINDIRECT;

/// Size of a user page in bytes.
pub const PGSIZE: usize = 4096;

/// Sectors per user page; a swap slot is this many consecutive sectors.
pub const SECTORS_PER_PAGE: usize = PGSIZE / SECTOR_SIZE;

/// First address above the user stack.
pub const USER_STACK_TOP: usize = 0xc000_0000;

/// Maximum user stack size in bytes. Faults below this line never grow
/// the stack.
pub const STACK_MAX: usize = 8 * 1024 * 1024;

/// A faulting address may be at most this far below the saved user stack
/// pointer and still count as stack growth.
pub const STACK_SLACK: usize = 32;
