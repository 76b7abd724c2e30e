//! Virtual-memory integration scenarios: stack growth, eviction under
//! pressure, mmap write-back, pinning, and address-space teardown.

use minos::param::{PGSIZE, USER_STACK_TOP};
use minos::{AddressSpace, Core, Env, Error, InodeType, MemDisk};

fn boot(pool_pages: usize) -> Core {
    Core::init(Env {
        fs_dev: MemDisk::new(2048),
        swap_dev: MemDisk::new(2048),
        pool_pages,
        format: true,
    })
    .unwrap()
}

#[test]
fn stack_grows_near_the_stack_pointer() {
    let core = boot(8);
    let space = AddressSpace::new();
    let sp = USER_STACK_TOP;

    // A write just below the stack pointer installs a zero page.
    space
        .write_bytes(&core.vm, sp - 4, &[1, 2, 3, 4], sp)
        .unwrap();
    let mut buf = [0u8; 8];
    space.read_bytes(&core.vm, sp - 8, &mut buf, sp).unwrap();
    assert_eq!(buf, [0, 0, 0, 0, 1, 2, 3, 4]);

    // Far below the stack pointer the process is killed instead.
    assert_eq!(
        space
            .write_bytes(&core.vm, sp - (1 << 20), &[9], sp)
            .unwrap_err(),
        Error::Fault
    );

    space.destroy(&core.vm);
    core.done();
}

#[test]
fn eviction_under_pressure_round_trips_through_swap() {
    let core = boot(16);
    let space = AddressSpace::new();

    const PAGES: usize = 50;
    let base = USER_STACK_TOP - PAGES * PGSIZE;
    let sp = base;

    for i in 0..PAGES {
        let pattern = vec![i as u8; PGSIZE];
        space
            .write_bytes(&core.vm, base + i * PGSIZE, &pattern, sp)
            .unwrap();
    }

    // More pages live than frames: some had to go to swap.
    assert!(core.vm.swap().used() > 0);
    assert_eq!(core.vm.frames().free_frames(), 0);

    for i in 0..PAGES {
        let mut buf = vec![0u8; PGSIZE];
        space
            .read_bytes(&core.vm, base + i * PGSIZE, &mut buf, sp)
            .unwrap();
        assert!(buf.iter().all(|&b| b == i as u8), "page {} corrupted", i);
    }

    space.destroy(&core.vm);
    core.done();
}

#[test]
fn mmap_write_back_on_unmap() {
    let core = boot(8);
    let space = AddressSpace::new();
    let sp = USER_STACK_TOP;

    core.fs
        .create(None, "/m", 2 * PGSIZE as u32, InodeType::File)
        .unwrap();
    let f = core.fs.open(None, "/m").unwrap();

    let addr = 0x1000_0000;
    let id = space.mmap(&f, addr).unwrap();

    let mut pattern = vec![0u8; 2 * PGSIZE];
    for (i, b) in pattern.iter_mut().enumerate() {
        *b = (i % 251) as u8;
    }
    space.write_bytes(&core.vm, addr, &pattern, sp).unwrap();
    space.munmap(&core.vm, id).unwrap();

    // The bytes reached the file.
    let mut back = vec![0u8; 2 * PGSIZE];
    assert_eq!(f.read_at(&mut back, 0), 2 * PGSIZE);
    assert_eq!(back, pattern);
    f.close();

    space.destroy(&core.vm);
    core.done();
}

#[test]
fn mmap_pages_evict_to_their_file() {
    // Pool small enough that the mapped pages get evicted while mapped.
    let core = boot(4);
    let space = AddressSpace::new();
    let sp = USER_STACK_TOP;

    core.fs
        .create(None, "/data", 2 * PGSIZE as u32, InodeType::File)
        .unwrap();
    let f = core.fs.open(None, "/data").unwrap();

    let addr = 0x2000_0000;
    let id = space.mmap(&f, addr).unwrap();
    space
        .write_bytes(&core.vm, addr, &vec![0xcd; 2 * PGSIZE], sp)
        .unwrap();

    // Push the mapped pages out with anonymous stack pages.
    for i in 0..6 {
        space
            .write_bytes(
                &core.vm,
                USER_STACK_TOP - (i + 1) * PGSIZE,
                &vec![i as u8; PGSIZE],
                USER_STACK_TOP - 6 * PGSIZE,
            )
            .unwrap();
    }

    // Dirty mmap pages were written back on eviction, not swapped.
    let mut back = vec![0u8; 2 * PGSIZE];
    assert_eq!(f.read_at(&mut back, 0), 2 * PGSIZE);
    assert!(back.iter().all(|&b| b == 0xcd));

    // Reading the region again faults it back in from the file.
    let mut again = vec![0u8; 2 * PGSIZE];
    space.read_bytes(&core.vm, addr, &mut again, sp).unwrap();
    assert!(again.iter().all(|&b| b == 0xcd));

    space.munmap(&core.vm, id).unwrap();
    f.close();
    space.destroy(&core.vm);
    core.done();
}

#[test]
fn mmap_argument_checks() {
    let core = boot(4);
    let space = AddressSpace::new();

    core.fs
        .create(None, "/full", PGSIZE as u32, InodeType::File)
        .unwrap();
    core.fs.create(None, "/empty", 0, InodeType::File).unwrap();
    let full = core.fs.open(None, "/full").unwrap();
    let empty = core.fs.open(None, "/empty").unwrap();

    assert_eq!(space.mmap(&full, 0).unwrap_err(), Error::InvalidArg);
    assert_eq!(space.mmap(&full, 0x1000_0123).unwrap_err(), Error::InvalidArg);
    assert_eq!(space.mmap(&empty, 0x1000_0000).unwrap_err(), Error::InvalidArg);

    let id = space.mmap(&full, 0x1000_0000).unwrap();
    // Overlapping a live mapping is refused.
    assert_eq!(space.mmap(&full, 0x1000_0000).unwrap_err(), Error::Exists);
    // Unmapping twice is refused.
    space.munmap(&core.vm, id).unwrap();
    assert_eq!(space.munmap(&core.vm, id).unwrap_err(), Error::InvalidArg);

    full.close();
    empty.close();
    space.destroy(&core.vm);
    core.done();
}

#[test]
fn read_only_file_pages_refuse_writes() {
    let core = boot(4);
    let space = AddressSpace::new();
    let sp = USER_STACK_TOP;

    core.fs
        .create(None, "/ro", 0, InodeType::File)
        .unwrap();
    let f = core.fs.open(None, "/ro").unwrap();
    f.write_at(b"const data", 0).unwrap();

    let addr = 0x3000_0000;
    space
        .install_file_page(&f, addr, 0, 10, false)
        .unwrap();

    let mut buf = [0u8; 10];
    space.read_bytes(&core.vm, addr, &mut buf, sp).unwrap();
    assert_eq!(&buf, b"const data");
    // The tail past the file bytes is zero-filled.
    let mut tail = [0xffu8; 16];
    space
        .read_bytes(&core.vm, addr + 10, &mut tail, sp)
        .unwrap();
    assert!(tail.iter().all(|&b| b == 0));

    assert_eq!(
        space.write_bytes(&core.vm, addr, &[1], sp).unwrap_err(),
        Error::Fault
    );

    f.close();
    space.destroy(&core.vm);
    core.done();
}

#[test]
fn pinned_frames_are_never_victims() {
    let core = boot(4);
    let holder = AddressSpace::new();
    let sp = USER_STACK_TOP;

    // Populate and pin three pages in one space.
    let base = USER_STACK_TOP - 3 * PGSIZE;
    holder
        .write_bytes(&core.vm, base, &vec![0xee; 3 * PGSIZE], base)
        .unwrap();
    let pinned = holder.pin_range(&core.vm, base, 3 * PGSIZE, base).unwrap();
    assert_eq!(pinned.len(), 3);
    assert_eq!(core.vm.frames().pinned_frames(), 3);

    // A second space churns through far more pages than the pool holds;
    // every eviction must pick its own unpinned frames.
    let churn = AddressSpace::new();
    for i in 0..8 {
        churn
            .write_bytes(
                &core.vm,
                USER_STACK_TOP - (i + 1) * PGSIZE,
                &vec![i as u8; PGSIZE],
                USER_STACK_TOP - 8 * PGSIZE,
            )
            .unwrap();
    }

    assert_eq!(core.vm.frames().pinned_frames(), 3);
    core.vm.unpin(&pinned);

    // The pinned pages never left memory, so their bytes are intact.
    let mut buf = vec![0u8; 3 * PGSIZE];
    holder.read_bytes(&core.vm, base, &mut buf, sp).unwrap();
    assert!(buf.iter().all(|&b| b == 0xee));

    churn.destroy(&core.vm);
    holder.destroy(&core.vm);
    core.done();
}

#[test]
fn destroy_releases_frames_and_swap_slots() {
    let pool = 8;
    let core = boot(pool);
    let space = AddressSpace::new();

    let pages = 20;
    let base = USER_STACK_TOP - pages * PGSIZE;
    for i in 0..pages {
        space
            .write_bytes(&core.vm, base + i * PGSIZE, &[1u8; 32], base)
            .unwrap();
    }
    assert!(core.vm.swap().used() > 0);
    assert_eq!(core.vm.frames().free_frames(), 0);

    space.destroy(&core.vm);
    assert_eq!(core.vm.swap().used(), 0);
    assert_eq!(core.vm.frames().free_frames(), pool);
    core.done();
}

#[test]
fn uninitialised_address_kills() {
    let core = boot(4);
    let space = AddressSpace::new();

    // Nowhere near the stack, no mapping: the access is fatal.
    assert_eq!(
        space
            .read_bytes(&core.vm, 0x4000_0000, &mut [0u8; 4], USER_STACK_TOP)
            .unwrap_err(),
        Error::Fault
    );

    space.destroy(&core.vm);
    core.done();
}
