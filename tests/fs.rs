//! File-system integration scenarios, driven over a RAM-backed disk.

use std::sync::Arc;

use minos::fs::FileSys;
use minos::param::{NINDIRECT, SECTOR_SIZE};
use minos::{Error, InodeType, MemDisk};

fn boot(sectors: u32) -> (Arc<MemDisk>, Arc<FileSys>) {
    let disk = MemDisk::new(sectors);
    let fs = FileSys::init(disk.clone(), true).unwrap();
    (disk, fs)
}

#[test]
fn small_file_round_trip() {
    let (_disk, fs) = boot(256);

    fs.create(None, "/a", 0, InodeType::File).unwrap();
    let mut f = fs.open(None, "/a").unwrap();
    assert_eq!(f.write(b"hello").unwrap(), 5);
    f.close();

    let mut f = fs.open(None, "/a").unwrap();
    assert_eq!(f.length(), 5);
    let mut buf = [0u8; 5];
    assert_eq!(f.read(&mut buf), 5);
    assert_eq!(&buf, b"hello");
    f.close();
}

#[test]
fn reads_past_eof_are_short() {
    let (_disk, fs) = boot(256);

    fs.create(None, "/short", 10, InodeType::File).unwrap();
    let f = fs.open(None, "/short").unwrap();
    let mut buf = [0xffu8; 64];
    assert_eq!(f.read_at(&mut buf, 0), 10);
    assert_eq!(f.read_at(&mut buf, 10), 0);
    assert_eq!(f.read_at(&mut buf, 1000), 0);
    // A fresh file reads as zeros.
    assert!(buf[..10].iter().all(|&b| b == 0));
    f.close();
}

#[test]
fn large_file_reaches_double_indirect() {
    let (_disk, fs) = boot(2048);

    // One byte at the very end of the fourth double-indirect stripe.
    let offset = ((123 + NINDIRECT + 3 * NINDIRECT) * SECTOR_SIZE - 1) as u32;

    fs.create(None, "/big", 0, InodeType::File).unwrap();
    let f = fs.open(None, "/big").unwrap();
    assert_eq!(f.write_at(&[0xab], offset).unwrap(), 1);
    assert_eq!(f.length(), offset + 1);

    let mut one = [0u8; 1];
    assert_eq!(f.read_at(&mut one, offset), 1);
    assert_eq!(one[0], 0xab);

    // Unwritten regions in the middle read back as zero.
    let mut mid = [0x55u8; 64];
    assert_eq!(f.read_at(&mut mid, offset / 2), 64);
    assert!(mid.iter().all(|&b| b == 0));
    f.close();
}

#[test]
fn directory_tree_and_relative_paths() {
    let (_disk, fs) = boot(512);

    fs.mkdir(None, "/d").unwrap();
    fs.mkdir(None, "/d/e").unwrap();
    let cwd = fs.chdir(None, "/d/e").unwrap();

    fs.create(Some(&cwd), "../f", 3, InodeType::File).unwrap();
    let f = fs.open(None, "/d/f").unwrap();
    f.close();
    assert_eq!(fs.open(None, "/d/e/f").unwrap_err(), Error::NotFound);

    // `.` and `..` resolve from the new cwd too.
    let f = fs.open(Some(&cwd), "../../d/./f").unwrap();
    f.close();

    fs.close_dir(cwd);
}

#[test]
fn equivalent_paths_resolve_to_one_inode() {
    let (_disk, fs) = boot(512);

    fs.mkdir(None, "/d").unwrap();
    fs.create(None, "/d/f", 0, InodeType::File).unwrap();

    let a = fs.open(None, "/d/f").unwrap();
    let b = fs.open(None, "//d//f").unwrap();
    let c = fs.open(None, "d/f").unwrap();
    let cwd = fs.chdir(None, "/d").unwrap();
    let d = fs.open(Some(&cwd), "f").unwrap();
    let e = fs.open(Some(&cwd), "./f").unwrap();

    let sector = a.inode().sector;
    for f in [&b, &c, &d, &e] {
        assert_eq!(f.inode().sector, sector);
    }
    for f in [a, b, c, d, e] {
        f.close();
    }
    fs.close_dir(cwd);
}

#[test]
fn malformed_paths_are_rejected() {
    let (_disk, fs) = boot(256);

    fs.mkdir(None, "/d").unwrap();
    assert_eq!(fs.open(None, "").unwrap_err(), Error::InvalidArg);
    assert_eq!(
        fs.create(None, "/d/", 0, InodeType::File).unwrap_err(),
        Error::InvalidArg
    );
    assert_eq!(
        fs.create(None, "/this-name-is-too-long", 0, InodeType::File)
            .unwrap_err(),
        Error::InvalidArg
    );
    assert_eq!(
        fs.open(None, "/missing/f").unwrap_err(),
        Error::NotFound
    );

    // A path through a regular file is not a directory.
    fs.create(None, "/plain", 0, InodeType::File).unwrap();
    assert_eq!(
        fs.open(None, "/plain/x").unwrap_err(),
        Error::NotDir
    );

    // The root itself is reachable with any run of slashes.
    let root = fs.open(None, "////").unwrap();
    root.close();
}

#[test]
fn create_collision_leaves_free_map_unchanged() {
    let (_disk, fs) = boot(256);

    fs.create(None, "/a", 300, InodeType::File).unwrap();
    let used = fs.used_sectors();
    assert_eq!(
        fs.create(None, "/a", 700, InodeType::File).unwrap_err(),
        Error::Exists
    );
    assert_eq!(fs.used_sectors(), used);
}

#[test]
fn free_map_is_conserved_across_create_and_remove() {
    let (_disk, fs) = boot(2048);

    let used = fs.used_sectors();
    for round in 0..3 {
        let name = format!("/t{}", round);
        fs.create(None, &name, 0, InodeType::File).unwrap();
        let f = fs.open(None, &name).unwrap();
        // Big enough to pull in the single-indirect level.
        f.write_at(&vec![7u8; 70 * SECTOR_SIZE], 0).unwrap();
        f.close();
        fs.remove(None, &name).unwrap();
    }
    assert_eq!(fs.used_sectors(), used);
}

#[test]
fn remove_of_open_file_is_deferred() {
    let (_disk, fs) = boot(512);

    fs.create(None, "/keep", 0, InodeType::File).unwrap();
    let mut f = fs.open(None, "/keep").unwrap();
    f.write(b"still here").unwrap();

    let used = fs.used_sectors();
    fs.remove(None, "/keep").unwrap();
    // The opener still reads its data; sectors are not yet released.
    let mut buf = [0u8; 10];
    assert_eq!(f.read_at(&mut buf, 0), 10);
    assert_eq!(&buf, b"still here");
    assert_eq!(fs.open(None, "/keep").unwrap_err(), Error::NotFound);

    f.close();
    assert!(fs.used_sectors() < used);
}

#[test]
fn non_empty_directory_cannot_be_removed() {
    let (_disk, fs) = boot(512);

    fs.mkdir(None, "/d2").unwrap();
    fs.create(None, "/d2/x", 0, InodeType::File).unwrap();

    assert_eq!(fs.remove(None, "/d2").unwrap_err(), Error::Exists);
    fs.remove(None, "/d2/x").unwrap();
    fs.remove(None, "/d2").unwrap();
    assert_eq!(fs.open(None, "/d2").unwrap_err(), Error::NotFound);
}

#[test]
fn removed_directory_rejects_new_entries() {
    let (_disk, fs) = boot(512);

    fs.mkdir(None, "/g").unwrap();
    let cwd = fs.chdir(None, "/g").unwrap();
    fs.remove(None, "/g").unwrap();

    assert_eq!(
        fs.create(Some(&cwd), "x", 0, InodeType::File).unwrap_err(),
        Error::NotFound
    );
    assert_eq!(fs.open(Some(&cwd), "x").unwrap_err(), Error::NotFound);
    fs.close_dir(cwd);
}

#[test]
fn readdir_lists_entries_once() {
    let (_disk, fs) = boot(512);

    fs.mkdir(None, "/list") .unwrap();
    for name in ["one", "two", "three"] {
        fs.create(None, &format!("/list/{}", name), 0, InodeType::File)
            .unwrap();
    }

    let mut dir = fs.chdir(None, "/list").unwrap();
    let mut names: Vec<String> = Vec::new();
    while let Some(name) = dir.read_next(&fs) {
        names.push(name.as_str().to_string());
    }
    names.sort();
    assert_eq!(names, vec![".", "..", "one", "three", "two"]);
    fs.close_dir(dir);
}

#[test]
fn deny_write_blocks_all_handles() {
    let (_disk, fs) = boot(256);

    fs.create(None, "/exe", 0, InodeType::File).unwrap();
    let mut f1 = fs.open(None, "/exe").unwrap();
    let mut f2 = fs.open(None, "/exe").unwrap();

    f1.deny_write();
    assert_eq!(f2.write(b"nope").unwrap(), 0);
    assert_eq!(f2.length(), 0);

    f1.allow_write();
    assert_eq!(f2.write(b"yes").unwrap(), 3);

    f1.close();
    f2.close();
}

#[test]
fn seek_and_tell() {
    let (_disk, fs) = boot(256);

    fs.create(None, "/s", 0, InodeType::File).unwrap();
    let mut f = fs.open(None, "/s").unwrap();
    f.write(b"abcdef").unwrap();
    f.seek(2);
    assert_eq!(f.tell(), 2);
    let mut buf = [0u8; 2];
    assert_eq!(f.read(&mut buf), 2);
    assert_eq!(&buf, b"cd");
    assert_eq!(f.tell(), 4);
    f.close();
}

#[test]
fn many_files_survive_cache_pressure() {
    let (_disk, fs) = boot(2048);

    // 50 files x 8 sectors each runs far past the 64-slot cache.
    for i in 0..50u32 {
        let name = format!("/f{}", i);
        fs.create(None, &name, 0, InodeType::File).unwrap();
        let f = fs.open(None, &name).unwrap();
        f.write_at(&vec![i as u8; 4096], 0).unwrap();
        f.close();
    }
    for i in 0..50u32 {
        let f = fs.open(None, &format!("/f{}", i)).unwrap();
        let mut buf = vec![0u8; 4096];
        assert_eq!(f.read_at(&mut buf, 0), 4096);
        assert!(buf.iter().all(|&b| b == i as u8), "file {} corrupted", i);
        f.close();
    }
}

#[test]
fn contents_persist_across_remount() {
    let disk = MemDisk::new(1024);
    let fs = FileSys::init(disk.clone(), true).unwrap();

    fs.mkdir(None, "/home").unwrap();
    fs.create(None, "/home/note", 0, InodeType::File).unwrap();
    let mut f = fs.open(None, "/home/note").unwrap();
    f.write(b"remember me").unwrap();
    f.close();
    let used = fs.used_sectors();
    fs.done();

    // Mount again without formatting.
    let fs = FileSys::init(disk, false).unwrap();
    assert_eq!(fs.used_sectors(), used);
    let mut f = fs.open(None, "/home/note").unwrap();
    let mut buf = [0u8; 11];
    assert_eq!(f.read(&mut buf), 11);
    assert_eq!(&buf, b"remember me");
    f.close();
    fs.done();
}
