//! End-to-end tests of the VFS and the RAM filesystem.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(rox_os::test_runner)]
#![reexport_test_harness_main = "test_main"]
#![allow(missing_docs)]
#![allow(clippy::missing_panics_doc)]

extern crate alloc;

use core::panic::PanicInfo;

use bootloader::{entry_point, BootInfo};
use rox_os::fs::{self, file, FsError, OpenFlags, Stat, Whence};
use rox_os::memory;

entry_point!(main);

fn main(boot_info: &'static BootInfo) -> ! {
    rox_os::init();
    // SAFETY: called once with the bootloader's boot information.
    unsafe {
        memory::init(boot_info);
    }
    fs::init();

    test_main();

    rox_os::hlt_loop();
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    rox_os::test_panic_handler(info)
}

#[test_case]
fn test_mkdir_create_write_read_roundtrip() {
    fs::mkdir("/a", "/").expect("mkdir /a");

    let fd = fs::open("/a/b", OpenFlags::WRITE_ONLY | OpenFlags::CREATE, "/")
        .expect("create /a/b");
    assert_eq!(file::write(fd, b"abcdef"), Ok(6));
    assert_eq!(file::lseek(fd, 0, Whence::Set), Ok(0));
    file::unref(fd);

    let fd = fs::open("/a/b", OpenFlags::empty(), "/").expect("open /a/b");
    let mut buf = [0_u8; 6];
    assert_eq!(file::read(fd, &mut buf), Ok(6));
    assert_eq!(&buf, b"abcdef");
    file::unref(fd);

    let stat = fs::stat("/a/b", "/").expect("stat /a/b");
    assert_eq!(stat.size, 6);
    assert_eq!(stat.kind, Stat::KIND_FILE);
}

#[test_case]
fn test_read_at_end_of_file_returns_zero() {
    let fd = fs::open("/eof", OpenFlags::READ_WRITE | OpenFlags::CREATE, "/")
        .expect("create /eof");
    assert_eq!(file::write(fd, b"xyz"), Ok(3));

    assert_eq!(file::lseek(fd, 0, Whence::End), Ok(3));
    let mut buf = [0_u8; 8];
    assert_eq!(
        file::read(fd, &mut buf),
        Ok(0),
        "Reading at offset == size yields zero bytes."
    );
    file::unref(fd);
    fs::unlink("/eof", "/").expect("unlink /eof");
}

#[test_case]
fn test_write_past_cap_is_clamped_not_failed() {
    let fd = fs::open("/big", OpenFlags::WRITE_ONLY | OpenFlags::CREATE, "/")
        .expect("create /big");

    let chunk = [7_u8; 4096];
    let mut written = 0_usize;
    loop {
        match file::write(fd, &chunk) {
            Ok(0) => break,
            Ok(n) => written += n,
            Err(error) => panic!("write failed with {:?}", error),
        }
        if written > rox_os::fs::ramfs::MAX_FILE_SIZE {
            panic!("write exceeded the file size cap");
        }
    }
    assert_eq!(
        written,
        rox_os::fs::ramfs::MAX_FILE_SIZE,
        "Exactly the direct-block capacity fits."
    );

    file::unref(fd);
    fs::unlink("/big", "/").expect("unlink /big");
}

#[test_case]
fn test_sparse_file_reads_zeros_in_hole() {
    let fd = fs::open("/sparse", OpenFlags::READ_WRITE | OpenFlags::CREATE, "/")
        .expect("create /sparse");

    // Write one byte far past the start; the blocks before stay holes.
    assert_eq!(file::lseek(fd, 9000, Whence::Set), Ok(9000));
    assert_eq!(file::write(fd, b"!"), Ok(1));

    assert_eq!(file::lseek(fd, 0, Whence::Set), Ok(0));
    let mut buf = [0xFF_u8; 64];
    assert_eq!(file::read(fd, &mut buf), Ok(64));
    assert!(
        buf.iter().all(|&b| b == 0),
        "Holes inside the in-range portion read as zeros."
    );

    file::unref(fd);
    fs::unlink("/sparse", "/").expect("unlink /sparse");
}

#[test_case]
fn test_truncate_on_open_discards_content() {
    let fd = fs::open("/trunc", OpenFlags::WRITE_ONLY | OpenFlags::CREATE, "/")
        .expect("create /trunc");
    assert_eq!(file::write(fd, b"old content"), Ok(11));
    file::unref(fd);

    let fd = fs::open("/trunc", OpenFlags::WRITE_ONLY | OpenFlags::TRUNCATE, "/")
        .expect("reopen /trunc");
    file::unref(fd);

    assert_eq!(fs::stat("/trunc", "/").expect("stat").size, 0);
    fs::unlink("/trunc", "/").expect("unlink /trunc");
}

#[test_case]
fn test_append_seeds_offset_at_size() {
    let fd = fs::open("/log", OpenFlags::WRITE_ONLY | OpenFlags::CREATE, "/")
        .expect("create /log");
    assert_eq!(file::write(fd, b"one"), Ok(3));
    file::unref(fd);

    let fd = fs::open("/log", OpenFlags::WRITE_ONLY | OpenFlags::APPEND, "/")
        .expect("append /log");
    assert_eq!(file::write(fd, b"two"), Ok(3));
    file::unref(fd);

    assert_eq!(fs::stat("/log", "/").expect("stat").size, 6);
    fs::unlink("/log", "/").expect("unlink /log");
}

#[test_case]
fn test_unlink_nonempty_directory_fails() {
    fs::mkdir("/full", "/").expect("mkdir /full");
    fs::create("/full/child", fs::VnodeKind::File, "/").expect("create child");

    assert_eq!(
        fs::unlink("/full", "/"),
        Err(FsError::NotEmpty),
        "A populated directory must not be removable."
    );

    fs::unlink("/full/child", "/").expect("unlink child");
    fs::unlink("/full", "/").expect("unlink now-empty directory");
    assert_eq!(fs::stat("/full", "/"), Err(FsError::NotFound));
}

#[test_case]
fn test_unlink_releases_inode_and_blocks() {
    let inodes_before = fs::ramfs::free_inodes();
    let blocks_before = fs::ramfs::free_blocks();

    let fd = fs::open("/victim", OpenFlags::WRITE_ONLY | OpenFlags::CREATE, "/")
        .expect("create /victim");
    assert_eq!(file::write(fd, &[1_u8; 5000]), Ok(5000));
    file::unref(fd);
    fs::unlink("/victim", "/").expect("unlink /victim");

    assert_eq!(fs::ramfs::free_inodes(), inodes_before);
    assert_eq!(fs::ramfs::free_blocks(), blocks_before);
}

#[test_case]
fn test_duplicate_create_fails() {
    fs::create("/dup", fs::VnodeKind::File, "/").expect("create /dup");
    assert_eq!(
        fs::create("/dup", fs::VnodeKind::File, "/"),
        Err(FsError::Exists)
    );
    fs::unlink("/dup", "/").expect("unlink /dup");
}

#[test_case]
fn test_readdir_enumerates_live_entries() {
    fs::mkdir("/dir", "/").expect("mkdir /dir");
    fs::create("/dir/x", fs::VnodeKind::File, "/").expect("create x");
    fs::create("/dir/y", fs::VnodeKind::File, "/").expect("create y");

    let fd = fs::open("/dir", OpenFlags::empty(), "/").expect("open /dir");
    let first = file::readdir(fd, 0).expect("readdir 0").expect("entry 0");
    let second = file::readdir(fd, 1).expect("readdir 1").expect("entry 1");
    assert!(file::readdir(fd, 2).expect("readdir 2").is_none());

    let name_of = |entry: &rox_os::fs::DirEntryInfo| {
        let len = entry.name_len as usize;
        alloc::string::String::from_utf8_lossy(&entry.name[..len]).into_owned()
    };
    let mut names = [name_of(&first), name_of(&second)];
    names.sort();
    assert_eq!(names[0], "x");
    assert_eq!(names[1], "y");

    file::unref(fd);
    fs::unlink("/dir/x", "/").expect("unlink x");
    fs::unlink("/dir/y", "/").expect("unlink y");
    fs::unlink("/dir", "/").expect("unlink dir");
}

#[test_case]
fn test_directory_opens_read_only() {
    fs::mkdir("/ro", "/").expect("mkdir /ro");
    assert_eq!(
        fs::open("/ro", OpenFlags::WRITE_ONLY, "/"),
        Err(FsError::IsADirectory),
        "Directories may only be opened read-only."
    );
    fs::unlink("/ro", "/").expect("unlink /ro");
}

#[test_case]
fn test_relative_paths_resolve_against_cwd() {
    fs::mkdir("/home", "/").expect("mkdir /home");
    fs::create("nested", fs::VnodeKind::File, "/home").expect("relative create");

    assert!(fs::stat("/home/nested", "/").is_ok());
    assert!(fs::stat("../home/nested", "/home").is_ok());

    fs::unlink("/home/nested", "/").expect("unlink nested");
    fs::unlink("/home", "/").expect("unlink /home");
}
