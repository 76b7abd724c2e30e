//! Buffer cache.
//!
//! The buffer cache is a fixed array of 64 slots holding cached copies of
//! disk sector contents. Caching sectors in memory reduces the number of
//! disk reads and also provides a synchronization point for sectors used
//! by multiple processes.
//!
//! The cache is write-behind: `write_at` updates the cached copy and marks
//! the slot dirty; the device is updated later, either by the periodic
//! flusher, by eviction, or by the final `flush_all` at shutdown.
//!
//! Interface:
//! * To read part of a sector, call `read_at`; `read` reads a whole one.
//! * To write part of a sector, call `write_at`; `write` writes a whole one.
//! * `flush_all` writes every dirty slot back to the device.
//!
//! A single cache-wide lock protects lookup, load, and the payload copies.
//! The periodic flusher does not take that lock while traversing; it claims
//! a slot's dirty flag with an atomic swap, copies the payload out under
//! the lock, and performs the device write with no lock held.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use array_macro::array;
use itertools::Itertools;
use spin::Mutex;

use crate::device::{BlockDevice, Sector};
use crate::param::{FLUSH_INTERVAL, NBUF, SECTOR_SIZE};

struct Slot {
    /// Has data been read from the device?
    valid: bool,
    /// Second-chance flag. Set by the eviction sweep, cleared by every
    /// access; a slot found with it set is reclaimed.
    second: bool,
    /// Sector this slot caches. Meaningful only while `valid`.
    sector: Sector,
    data: [u8; SECTOR_SIZE],
}

impl Slot {
    const fn new() -> Self {
        Self {
            valid: false,
            second: false,
            sector: 0,
            data: [0; SECTOR_SIZE],
        }
    }
}

pub struct Bcache {
    dev: Arc<dyn BlockDevice>,
    slots: Mutex<Box<[Slot; NBUF]>>,
    /// Dirty flags, one per slot. Kept outside the lock so the flusher
    /// can claim them with an atomic swap.
    dirty: [AtomicBool; NBUF],
}

impl Bcache {
    pub fn new(dev: Arc<dyn BlockDevice>) -> Self {
        Self {
            dev,
            slots: Mutex::new(Box::new(array![_ => Slot::new(); NBUF])),
            dirty: array![_ => AtomicBool::new(false); NBUF],
        }
    }

    /// Reads all of sector `sector` into `buf`, which must be exactly one
    /// sector long.
    pub fn read(&self, sector: Sector, buf: &mut [u8]) {
        assert_eq!(buf.len(), SECTOR_SIZE, "bcache: short read buffer");
        self.read_at(sector, buf, 0);
    }

    /// Writes all of `buf`, exactly one sector, to sector `sector`.
    pub fn write(&self, sector: Sector, buf: &[u8]) {
        assert_eq!(buf.len(), SECTOR_SIZE, "bcache: short write buffer");
        self.write_at(sector, buf, 0);
    }

    /// Copies `buf.len()` bytes out of sector `sector`, starting `ofs`
    /// bytes in. The range must lie within the sector.
    pub fn read_at(&self, sector: Sector, buf: &mut [u8], ofs: usize) {
        assert!(ofs + buf.len() <= SECTOR_SIZE, "bcache: bad read range");

        let mut slots = self.slots.lock();
        let i = self.find(&mut slots, sector);
        let slot = &mut slots[i];
        slot.second = false;
        buf.copy_from_slice(&slot.data[ofs..ofs + buf.len()]);
    }

    /// Copies `buf` into sector `sector`, starting `ofs` bytes in, and
    /// marks the slot dirty. The range must lie within the sector.
    pub fn write_at(&self, sector: Sector, buf: &[u8], ofs: usize) {
        assert!(ofs + buf.len() <= SECTOR_SIZE, "bcache: bad write range");

        let mut slots = self.slots.lock();
        let i = self.find(&mut slots, sector);
        let slot = &mut slots[i];
        slot.second = false;
        slot.data[ofs..ofs + buf.len()].copy_from_slice(buf);
        // Dirty goes up only after the payload copy, so a concurrent
        // flush cannot clear it while the slot still holds stale bytes.
        self.dirty[i].store(true, Ordering::Release);
    }

    /// Writes every dirty slot back to the device.
    ///
    /// Safe to call at any time without further locking; also called once
    /// more by the file-system teardown, which makes the shutdown path
    /// idempotent.
    pub fn flush_all(&self) {
        let mut flushed = 0usize;
        for i in 0..NBUF {
            let claimed = {
                let slots = self.slots.lock();
                let slot = &slots[i];
                if slot.valid && self.dirty[i].swap(false, Ordering::AcqRel) {
                    Some((slot.sector, slot.data))
                } else {
                    None
                }
            };
            if let Some((sector, data)) = claimed {
                self.dev.write(sector, &data);
                flushed += 1;
            }
        }
        if flushed > 0 {
            log::trace!("bcache: flushed {} slots", flushed);
        }
    }

    /// Returns the index of the slot caching `sector`, loading it on a
    /// miss. Called with the slot lock held.
    fn find(&self, slots: &mut [Slot; NBUF], sector: Sector) -> usize {
        if let Some((i, _)) = slots.iter().find_position(|s| s.valid && s.sector == sector) {
            return i;
        }
        self.load(slots, sector)
    }

    /// Obtains a free slot and fills it with `sector` from the device.
    fn load(&self, slots: &mut [Slot; NBUF], sector: Sector) -> usize {
        let i = match slots.iter().position(|s| !s.valid) {
            Some(i) => i,
            None => self.evict(slots),
        };

        let slot = &mut slots[i];
        debug_assert!(!slot.valid, "bcache: load into valid slot");
        self.dev.read(sector, &mut slot.data);
        self.dirty[i].store(false, Ordering::Release);
        slot.second = false;
        slot.sector = sector;
        slot.valid = true;
        i
    }

    /// Frees one slot by second chance and returns its index.
    ///
    /// Sweeps the slots repeatedly: a slot whose second-chance flag is set
    /// is written back (if dirty) and invalidated; otherwise the flag is
    /// set and the sweep moves on. Every pass either returns a slot or
    /// strictly shrinks the set of slots with the flag clear, so a second
    /// full pass always terminates.
    ///
    /// Must only be called with the cache full.
    fn evict(&self, slots: &mut [Slot; NBUF]) -> usize {
        loop {
            for i in 0..NBUF {
                let slot = &mut slots[i];
                if !slot.valid {
                    panic!("bcache: evict while cache is not full");
                }
                if slot.second {
                    if self.dirty[i].swap(false, Ordering::AcqRel) {
                        self.dev.write(slot.sector, &slot.data);
                    }
                    slot.valid = false;
                    log::debug!("bcache: evicted sector {}", slot.sector);
                    return i;
                }
                slot.second = true;
            }
        }
    }
}

/// Body of the periodic flush task.
///
/// The external scheduler runs this on a dedicated thread; `sleep` blocks
/// for the given number of ticks. Returns once `shutdown` is raised. It
/// need not be joined before teardown: `flush_all` runs again in
/// `FileSys::done`.
pub fn flush_daemon<S: FnMut(u64)>(cache: &Bcache, mut sleep: S, shutdown: &AtomicBool) {
    while !shutdown.load(Ordering::Acquire) {
        sleep(FLUSH_INTERVAL);
        cache.flush_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDisk;

    fn sector_of(byte: u8) -> [u8; SECTOR_SIZE] {
        [byte; SECTOR_SIZE]
    }

    /// Number of valid slots caching `sector`. Per the residency
    /// invariant this is always 0 or 1.
    fn resident(cache: &Bcache, sector: Sector) -> usize {
        let slots = cache.slots.lock();
        slots.iter().filter(|s| s.valid && s.sector == sector).count()
    }

    fn dirty(cache: &Bcache, sector: Sector) -> bool {
        let slots = cache.slots.lock();
        slots
            .iter()
            .position(|s| s.valid && s.sector == sector)
            .map(|i| cache.dirty[i].load(Ordering::Acquire))
            .unwrap_or(false)
    }

    #[test]
    fn residency_is_unique() {
        let disk = MemDisk::new(128);
        let cache = Bcache::new(disk);

        let mut buf = sector_of(0);
        cache.write(3, &sector_of(0xaa));
        cache.read(3, &mut buf);
        cache.write_at(3, &[1, 2, 3], 10);
        assert_eq!(resident(&cache, 3), 1);
        assert_eq!(resident(&cache, 4), 0);
    }

    #[test]
    fn write_behind_hits_device_only_on_flush() {
        let disk = MemDisk::new(128);
        let cache = Bcache::new(disk.clone());

        cache.write(7, &sector_of(0x5c));
        assert!(dirty(&cache, 7));

        let mut raw = sector_of(0);
        disk.read(7, &mut raw);
        assert_eq!(raw, sector_of(0), "device written before flush");

        cache.flush_all();
        assert!(!dirty(&cache, 7));
        disk.read(7, &mut raw);
        assert_eq!(raw, sector_of(0x5c));
    }

    #[test]
    fn flush_all_is_idempotent() {
        let disk = MemDisk::new(128);
        let cache = Bcache::new(disk);
        cache.write(1, &sector_of(9));
        cache.flush_all();
        cache.flush_all();
        assert!(!dirty(&cache, 1));
    }

    #[test]
    fn partial_reads_and_writes() {
        let disk = MemDisk::new(128);
        let cache = Bcache::new(disk);

        cache.write(0, &sector_of(0));
        cache.write_at(0, b"hello", 500);
        let mut five = [0u8; 5];
        cache.read_at(0, &mut five, 500);
        assert_eq!(&five, b"hello");
    }

    #[test]
    fn eviction_writes_back_and_reuses_slots() {
        let disk = MemDisk::new(1024);
        let cache = Bcache::new(disk.clone());

        // Dirty every slot, then touch one more sector to force eviction.
        for s in 0..NBUF as Sector {
            cache.write(s, &sector_of(s as u8));
        }
        let mut buf = sector_of(0);
        cache.read(NBUF as Sector, &mut buf);

        let cached: usize = (0..=NBUF as Sector).map(|s| resident(&cache, s)).sum();
        assert_eq!(cached, NBUF);

        // Whichever sector was evicted reached the device beforehand.
        let victim = (0..NBUF as Sector)
            .find(|&s| resident(&cache, s) == 0)
            .expect("one of the original sectors must have been evicted");
        let mut raw = sector_of(0);
        disk.read(victim, &mut raw);
        assert_eq!(raw, sector_of(victim as u8));
    }

    #[test]
    fn periodic_flusher_writes_behind() {
        use std::sync::atomic::AtomicBool;
        use std::sync::Arc as StdArc;
        use std::time::{Duration, Instant};

        let disk = MemDisk::new(128);
        let cache = StdArc::new(Bcache::new(disk.clone()));
        let shutdown = StdArc::new(AtomicBool::new(false));

        let daemon = {
            let cache = cache.clone();
            let shutdown = shutdown.clone();
            std::thread::spawn(move || {
                flush_daemon(
                    &cache,
                    |ticks| std::thread::sleep(Duration::from_millis(ticks)),
                    &shutdown,
                )
            })
        };

        cache.write(9, &sector_of(0x99));

        // The daemon flushes within one interval; poll the raw device.
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut raw = sector_of(0);
        loop {
            disk.read(9, &mut raw);
            if raw == sector_of(0x99) {
                break;
            }
            assert!(Instant::now() < deadline, "flusher never wrote back");
            std::thread::sleep(Duration::from_millis(10));
        }

        shutdown.store(true, Ordering::Release);
        daemon.join().unwrap();
    }

    #[test]
    fn read_after_eviction_reloads_from_device() {
        let disk = MemDisk::new(1024);
        let cache = Bcache::new(disk);

        cache.write(42, &sector_of(0x42));
        // Push sector 42 out.
        for s in 100..100 + NBUF as Sector {
            cache.write(s, &sector_of(1));
        }
        let mut buf = sector_of(0);
        cache.read(42, &mut buf);
        assert_eq!(buf, sector_of(0x42));
    }
}
