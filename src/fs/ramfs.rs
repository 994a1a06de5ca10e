//! RAM filesystem.
//!
//! The disk is one contiguous heap allocation carved into 4 KiB blocks:
//! block 0 holds the superblock (including both allocation bitmaps),
//! blocks 1..=8 the inode table (32 inodes of 128 bytes per block, 256
//! total), and everything from block 9 on is data. Files address twelve
//! direct blocks, capping them at 48 KiB; directories store fixed 64 byte
//! entries, 64 per block.
//!
//! `.` never exists on disk (path normalization resolves it) and `..`
//! resolves through the inode's parent hint.

use alloc::boxed::Box;
use alloc::vec;

use spin::Mutex;

use super::{DirEntryInfo, FsError, Stat, VnodeKind, VnodeOps};
use crate::{serial_println, time};

/// Bytes per block.
pub const BLOCK_SIZE: usize = 4096;
/// Blocks in the RAM disk.
pub const RAMDISK_BLOCKS: usize = 1024;
/// Largest disk the superblock bitmaps can describe.
const MAX_DISK_BLOCKS: usize = 8192;

/// Bytes per on-disk inode.
const INODE_SIZE: usize = 128;
/// Inodes per table block.
const INODES_PER_BLOCK: usize = BLOCK_SIZE / INODE_SIZE;
/// Blocks of the inode table.
const INODE_TABLE_BLOCKS: usize = 8;
/// Total inodes.
pub const INODE_COUNT: usize = INODES_PER_BLOCK * INODE_TABLE_BLOCKS;

/// First data block.
const DATA_START_BLOCK: usize = 1 + INODE_TABLE_BLOCKS;

/// Direct block pointers per inode.
const DIRECT_BLOCKS: usize = 12;
/// Largest file the direct pointers can address.
pub const MAX_FILE_SIZE: usize = DIRECT_BLOCKS * BLOCK_SIZE;

/// Bytes per directory entry.
const DIRENT_SIZE: usize = 64;
/// Directory entries per block.
const DIRENTS_PER_BLOCK: usize = BLOCK_SIZE / DIRENT_SIZE;
/// Longest stored file name.
pub const MAX_NAME_LEN: usize = 60;

/// Inode number of the root directory.
pub const ROOT_INO: u32 = 0;

/// `"RAMF"` little endian.
const SUPERBLOCK_MAGIC: u32 = u32::from_le_bytes(*b"RAMF");
const SUPERBLOCK_VERSION: u32 = 1;

const MODE_DIR_DEFAULT: u16 = 0o755;
const MODE_FILE_DEFAULT: u16 = 0o644;

const KIND_FREE: u16 = 0;
const KIND_FILE: u16 = 1;
const KIND_DIR: u16 = 2;

/// Block 0. The allocation bitmaps live inline; a bit set means the
/// corresponding block or inode is allocated.
#[repr(C)]
struct Superblock {
    magic: u32,
    version: u32,
    block_size: u32,
    total_blocks: u32,
    free_blocks: u32,
    total_inodes: u32,
    free_inodes: u32,
    root_inode: u32,
    created: u64,
    mounted: u64,
    block_bitmap: [u64; MAX_DISK_BLOCKS / 64],
    inode_bitmap: [u64; INODE_COUNT / 64],
}

/// On-disk inode, exactly 128 bytes.
#[repr(C)]
struct Inode {
    kind: u16,
    mode: u16,
    uid: u16,
    gid: u16,
    size: u32,
    links: u16,
    blocks: u16,
    created: u64,
    modified: u64,
    accessed: u64,
    direct: [u32; DIRECT_BLOCKS],
    parent: u32,
    _reserved: [u8; 36],
}

/// On-disk directory entry, exactly 64 bytes. A zero inode marks a free
/// slot; the root inode never appears in any directory, so zero is
/// unambiguous.
#[repr(C)]
struct Dirent {
    ino: u8,
    rec_len: u8,
    name_len: u8,
    kind: u8,
    name: [u8; MAX_NAME_LEN],
}

const _: () = assert!(core::mem::size_of::<Superblock>() <= BLOCK_SIZE);
const _: () = assert!(core::mem::size_of::<Inode>() == INODE_SIZE);
const _: () = assert!(core::mem::size_of::<Dirent>() == DIRENT_SIZE);
const _: () = assert!(INODE_COUNT <= u8::MAX as usize + 1);

/// The RAM disk. Backed by `u64`s so every on-disk struct is properly
/// aligned when viewed through raw pointers.
struct RamFs {
    disk: Box<[u64]>,
}

static RAMFS: Mutex<Option<RamFs>> = Mutex::new(None);

/// Dispatch target for vnodes backed by this filesystem.
pub static RAMFS_OPS: RamfsOps = RamfsOps;

fn now() -> u64 {
    time::ticks()
}

impl RamFs {
    fn format(blocks: usize) -> Self {
        assert!(
            (DATA_START_BLOCK + 1..=MAX_DISK_BLOCKS).contains(&blocks),
            "unsupported RAM disk geometry"
        );

        let mut fs = Self {
            disk: vec![0_u64; blocks * BLOCK_SIZE / 8].into_boxed_slice(),
        };

        let timestamp = now();
        let sb = fs.superblock_mut();
        sb.magic = SUPERBLOCK_MAGIC;
        sb.version = SUPERBLOCK_VERSION;
        sb.block_size = BLOCK_SIZE as u32;
        sb.total_blocks = blocks as u32;
        sb.free_blocks = (blocks - DATA_START_BLOCK) as u32;
        sb.total_inodes = INODE_COUNT as u32;
        sb.free_inodes = INODE_COUNT as u32 - 1;
        sb.root_inode = ROOT_INO;
        sb.created = timestamp;
        sb.mounted = timestamp;

        // Superblock and inode table are used from the start.
        for block in 0..DATA_START_BLOCK {
            sb.block_bitmap[block / 64] |= 1 << (block % 64);
        }
        sb.inode_bitmap[0] |= 1;

        let root = fs.inode_mut(ROOT_INO);
        root.kind = KIND_DIR;
        root.mode = MODE_DIR_DEFAULT;
        root.links = 2;
        root.parent = ROOT_INO;
        root.created = timestamp;
        root.modified = timestamp;
        root.accessed = timestamp;

        fs
    }

    fn superblock_mut(&mut self) -> &mut Superblock {
        // SAFETY:
        // Block 0 is in bounds and 8-byte aligned; the struct fits a block.
        unsafe { &mut *self.disk.as_mut_ptr().cast::<Superblock>() }
    }

    fn superblock(&self) -> &Superblock {
        // SAFETY: as above, shared.
        unsafe { &*self.disk.as_ptr().cast::<Superblock>() }
    }

    fn inode_mut(&mut self, ino: u32) -> &mut Inode {
        assert!((ino as usize) < INODE_COUNT, "inode out of range");
        let offset = BLOCK_SIZE + ino as usize * INODE_SIZE;
        // SAFETY:
        // The inode table is in bounds and every inode is 8-byte aligned.
        unsafe {
            &mut *self
                .disk
                .as_mut_ptr()
                .cast::<u8>()
                .add(offset)
                .cast::<Inode>()
        }
    }

    fn inode(&self, ino: u32) -> &Inode {
        assert!((ino as usize) < INODE_COUNT, "inode out of range");
        let offset = BLOCK_SIZE + ino as usize * INODE_SIZE;
        // SAFETY: as above, shared.
        unsafe { &*self.disk.as_ptr().cast::<u8>().add(offset).cast::<Inode>() }
    }

    fn block_mut(&mut self, block: u32) -> &mut [u8] {
        let start = block as usize * BLOCK_SIZE;
        // SAFETY: block index validated by the allocation bitmap users.
        unsafe {
            core::slice::from_raw_parts_mut(
                self.disk.as_mut_ptr().cast::<u8>().add(start),
                BLOCK_SIZE,
            )
        }
    }

    fn block(&self, block: u32) -> &[u8] {
        let start = block as usize * BLOCK_SIZE;
        // SAFETY: as above, shared.
        unsafe { core::slice::from_raw_parts(self.disk.as_ptr().cast::<u8>().add(start), BLOCK_SIZE) }
    }

    fn dirent_mut(&mut self, block: u32, slot: usize) -> &mut Dirent {
        let start = block as usize * BLOCK_SIZE + slot * DIRENT_SIZE;
        // SAFETY: slot < DIRENTS_PER_BLOCK keeps this inside the block.
        unsafe {
            &mut *self
                .disk
                .as_mut_ptr()
                .cast::<u8>()
                .add(start)
                .cast::<Dirent>()
        }
    }

    fn dirent(&self, block: u32, slot: usize) -> &Dirent {
        let start = block as usize * BLOCK_SIZE + slot * DIRENT_SIZE;
        // SAFETY: as above, shared.
        unsafe { &*self.disk.as_ptr().cast::<u8>().add(start).cast::<Dirent>() }
    }

    /// Lowest clear bit in the inode bitmap, claimed and initialized.
    fn alloc_inode(&mut self, kind: u16, parent: u32) -> Result<u32, FsError> {
        let timestamp = now();
        let sb = self.superblock_mut();

        let mut found = None;
        for ino in 0..INODE_COUNT {
            if sb.inode_bitmap[ino / 64] & (1 << (ino % 64)) == 0 {
                sb.inode_bitmap[ino / 64] |= 1 << (ino % 64);
                sb.free_inodes -= 1;
                found = Some(ino as u32);
                break;
            }
        }
        let ino = found.ok_or(FsError::NoSpace)?;

        let inode = self.inode_mut(ino);
        *inode = Inode {
            kind,
            mode: if kind == KIND_DIR {
                MODE_DIR_DEFAULT
            } else {
                MODE_FILE_DEFAULT
            },
            uid: 0,
            gid: 0,
            size: 0,
            links: 1,
            blocks: 0,
            created: timestamp,
            modified: timestamp,
            accessed: timestamp,
            direct: [0; DIRECT_BLOCKS],
            parent,
            _reserved: [0; 36],
        };
        Ok(ino)
    }

    fn free_inode(&mut self, ino: u32) {
        self.inode_mut(ino).kind = KIND_FREE;
        let sb = self.superblock_mut();
        sb.inode_bitmap[ino as usize / 64] &= !(1 << (ino as usize % 64));
        sb.free_inodes += 1;
    }

    /// Claim and zero one data block.
    fn alloc_block(&mut self) -> Result<u32, FsError> {
        let total = self.superblock().total_blocks as usize;
        let sb = self.superblock_mut();

        let mut found = None;
        for block in DATA_START_BLOCK..total {
            if sb.block_bitmap[block / 64] & (1 << (block % 64)) == 0 {
                sb.block_bitmap[block / 64] |= 1 << (block % 64);
                sb.free_blocks -= 1;
                found = Some(block as u32);
                break;
            }
        }
        let block = found.ok_or(FsError::NoSpace)?;
        self.block_mut(block).fill(0);
        Ok(block)
    }

    fn free_block(&mut self, block: u32) {
        let sb = self.superblock_mut();
        sb.block_bitmap[block as usize / 64] &= !(1 << (block as usize % 64));
        sb.free_blocks += 1;
    }

    fn read_file(&mut self, ino: u32, offset: usize, buf: &mut [u8]) -> Result<usize, FsError> {
        let inode = self.inode(ino);
        if inode.kind == KIND_DIR {
            return Err(FsError::IsADirectory);
        }
        if inode.kind != KIND_FILE {
            return Err(FsError::NotFound);
        }

        let size = inode.size as usize;
        if offset >= size {
            return Ok(0);
        }
        let count = buf.len().min(size - offset);

        let mut copied = 0;
        while copied < count {
            let position = offset + copied;
            let index = position / BLOCK_SIZE;
            let inside = position % BLOCK_SIZE;
            let chunk = (BLOCK_SIZE - inside).min(count - copied);

            let block = self.inode(ino).direct[index];
            if block == 0 {
                // Sparse hole: reads as zeros.
                buf[copied..copied + chunk].fill(0);
            } else {
                let data = self.block(block);
                buf[copied..copied + chunk].copy_from_slice(&data[inside..inside + chunk]);
            }
            copied += chunk;
        }

        self.inode_mut(ino).accessed = now();
        Ok(count)
    }

    fn write_file(&mut self, ino: u32, offset: usize, data: &[u8]) -> Result<usize, FsError> {
        let inode = self.inode(ino);
        if inode.kind == KIND_DIR {
            return Err(FsError::IsADirectory);
        }
        if inode.kind != KIND_FILE {
            return Err(FsError::NotFound);
        }

        // The write is clamped at the direct-block cap, not failed.
        if offset >= MAX_FILE_SIZE {
            return Ok(0);
        }
        let count = data.len().min(MAX_FILE_SIZE - offset);

        let mut written = 0;
        while written < count {
            let position = offset + written;
            let index = position / BLOCK_SIZE;
            let inside = position % BLOCK_SIZE;
            let chunk = (BLOCK_SIZE - inside).min(count - written);

            let mut block = self.inode(ino).direct[index];
            if block == 0 {
                block = match self.alloc_block() {
                    Ok(block) => block,
                    Err(error) => {
                        // Out of blocks mid-write: report what landed.
                        if written > 0 {
                            break;
                        }
                        return Err(error);
                    }
                };
                let inode = self.inode_mut(ino);
                inode.direct[index] = block;
                inode.blocks += 1;
            }

            let dest = self.block_mut(block);
            dest[inside..inside + chunk].copy_from_slice(&data[written..written + chunk]);
            written += chunk;
        }

        let timestamp = now();
        let inode = self.inode_mut(ino);
        inode.size = inode.size.max((offset + written) as u32);
        inode.modified = timestamp;
        inode.accessed = timestamp;
        Ok(written)
    }

    fn truncate(&mut self, ino: u32, size: usize) -> Result<(), FsError> {
        let inode = self.inode(ino);
        if inode.kind != KIND_FILE {
            return Err(FsError::IsADirectory);
        }
        if size >= inode.size as usize {
            return Ok(());
        }

        let first_beyond = size.div_ceil(BLOCK_SIZE);
        for index in first_beyond..DIRECT_BLOCKS {
            let block = self.inode(ino).direct[index];
            if block != 0 {
                self.free_block(block);
                let inode = self.inode_mut(ino);
                inode.direct[index] = 0;
                inode.blocks -= 1;
            }
        }

        let inode = self.inode_mut(ino);
        inode.size = size as u32;
        inode.modified = now();
        Ok(())
    }

    /// Visit every directory entry slot of `dir`. The callback returns
    /// `Some` to stop the scan.
    fn scan_dir<R>(
        &self,
        dir: u32,
        mut f: impl FnMut(u32, usize, &Dirent) -> Option<R>,
    ) -> Result<Option<R>, FsError> {
        let inode = self.inode(dir);
        if inode.kind != KIND_DIR {
            return Err(FsError::NotADirectory);
        }

        for index in 0..DIRECT_BLOCKS {
            let block = self.inode(dir).direct[index];
            if block == 0 {
                continue;
            }
            for slot in 0..DIRENTS_PER_BLOCK {
                let entry = self.dirent(block, slot);
                if let Some(result) = f(block, slot, entry) {
                    return Ok(Some(result));
                }
            }
        }
        Ok(None)
    }

    fn dir_lookup(&self, dir: u32, name: &str) -> Result<(u32, VnodeKind), FsError> {
        if name == ".." {
            let parent = self.inode(dir).parent;
            return Ok((parent, VnodeKind::Directory));
        }

        let found = self.scan_dir(dir, |_, _, entry| {
            if entry.ino != 0
                && entry.name_len as usize == name.len()
                && &entry.name[..name.len()] == name.as_bytes()
            {
                let kind = if entry.kind == KIND_DIR as u8 {
                    VnodeKind::Directory
                } else {
                    VnodeKind::File
                };
                Some((u32::from(entry.ino), kind))
            } else {
                None
            }
        })?;
        found.ok_or(FsError::NotFound)
    }

    /// Write a directory entry into the first free slot, allocating a
    /// fresh directory block when every existing one is full.
    fn dir_add(&mut self, dir: u32, name: &str, child: u32, kind: u16) -> Result<(), FsError> {
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(FsError::NameTooLong);
        }
        if self.dir_lookup(dir, name).is_ok() {
            return Err(FsError::Exists);
        }

        let free = self.scan_dir(dir, |block, slot, entry| {
            (entry.ino == 0).then_some((block, slot))
        })?;

        let (block, slot) = match free {
            Some(found) => found,
            None => {
                let index = (0..DIRECT_BLOCKS)
                    .find(|&i| self.inode(dir).direct[i] == 0)
                    .ok_or(FsError::NoSpace)?;
                let block = self.alloc_block()?;
                let inode = self.inode_mut(dir);
                inode.direct[index] = block;
                inode.blocks += 1;
                (block, 0)
            }
        };

        let entry = self.dirent_mut(block, slot);
        entry.ino = child as u8;
        entry.rec_len = DIRENT_SIZE as u8;
        entry.name_len = name.len() as u8;
        entry.kind = kind as u8;
        entry.name = [0; MAX_NAME_LEN];
        entry.name[..name.len()].copy_from_slice(name.as_bytes());

        let timestamp = now();
        let inode = self.inode_mut(dir);
        inode.size += DIRENT_SIZE as u32;
        inode.modified = timestamp;
        Ok(())
    }

    fn dir_remove(&mut self, dir: u32, name: &str) -> Result<(), FsError> {
        let found = self.scan_dir(dir, |block, slot, entry| {
            (entry.ino != 0
                && entry.name_len as usize == name.len()
                && &entry.name[..name.len()] == name.as_bytes())
            .then_some((block, slot))
        })?;
        let (block, slot) = found.ok_or(FsError::NotFound)?;

        *self.dirent_mut(block, slot) = Dirent {
            ino: 0,
            rec_len: 0,
            name_len: 0,
            kind: 0,
            name: [0; MAX_NAME_LEN],
        };

        let timestamp = now();
        let inode = self.inode_mut(dir);
        inode.size -= DIRENT_SIZE as u32;
        inode.modified = timestamp;
        Ok(())
    }

    fn dir_is_empty(&self, dir: u32) -> Result<bool, FsError> {
        Ok(self
            .scan_dir(dir, |_, _, entry| (entry.ino != 0).then_some(()))?
            .is_none())
    }

    fn create(&mut self, dir: u32, name: &str, kind: u16) -> Result<u32, FsError> {
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(FsError::NameTooLong);
        }
        if self.dir_lookup(dir, name).is_ok() {
            return Err(FsError::Exists);
        }

        let ino = self.alloc_inode(kind, dir)?;
        if let Err(error) = self.dir_add(dir, name, ino, kind) {
            self.free_inode(ino);
            return Err(error);
        }

        // A new directory's `..` back-reference counts against the parent,
        // and its virtual self-reference against itself. This is the only
        // place link counts are touched on creation.
        if kind == KIND_DIR {
            self.inode_mut(ino).links = 2;
            self.inode_mut(dir).links += 1;
        }
        Ok(ino)
    }

    fn unlink(&mut self, dir: u32, name: &str) -> Result<(), FsError> {
        let (ino, kind) = self.dir_lookup(dir, name)?;
        if ino == ROOT_INO {
            return Err(FsError::InvalidArgument);
        }

        if kind == VnodeKind::Directory && !self.dir_is_empty(ino)? {
            return Err(FsError::NotEmpty);
        }

        self.dir_remove(dir, name)?;

        // A directory loses both its name link and its self-reference; a
        // file just the name.
        let decrement = if kind == VnodeKind::Directory { 2 } else { 1 };
        let links = {
            let inode = self.inode_mut(ino);
            inode.links = inode.links.saturating_sub(decrement);
            inode.links
        };

        if links == 0 {
            for index in 0..DIRECT_BLOCKS {
                let block = self.inode(ino).direct[index];
                if block != 0 {
                    self.free_block(block);
                }
            }
            self.free_inode(ino);
        }

        if kind == VnodeKind::Directory {
            let parent = self.inode_mut(dir);
            parent.links = parent.links.saturating_sub(1);
        }
        Ok(())
    }

    fn stat(&self, ino: u32) -> Result<Stat, FsError> {
        let inode = self.inode(ino);
        if inode.kind == KIND_FREE {
            return Err(FsError::NotFound);
        }
        Ok(Stat {
            ino,
            kind: if inode.kind == KIND_DIR {
                Stat::KIND_DIRECTORY
            } else {
                Stat::KIND_FILE
            },
            size: u64::from(inode.size),
            links: u32::from(inode.links),
            blocks: u32::from(inode.blocks),
            created: inode.created,
            modified: inode.modified,
            accessed: inode.accessed,
        })
    }

    fn readdir(&self, dir: u32, index: usize) -> Result<Option<DirEntryInfo>, FsError> {
        let mut seen = 0;
        self.scan_dir(dir, |_, _, entry| {
            if entry.ino == 0 {
                return None;
            }
            if seen == index {
                let kind = if entry.kind == KIND_DIR as u8 {
                    Stat::KIND_DIRECTORY
                } else {
                    Stat::KIND_FILE
                };
                Some(DirEntryInfo {
                    ino: u32::from(entry.ino),
                    kind,
                    name_len: u32::from(entry.name_len),
                    name: entry.name,
                })
            } else {
                seen += 1;
                None
            }
        })
    }
}

fn with_ramfs<R>(f: impl FnOnce(&mut RamFs) -> R) -> R {
    let mut guard = RAMFS.lock();
    let fs = guard.as_mut().expect("ramfs not initialized");
    f(fs)
}

/// Format the RAM disk and mount it.
pub fn init() {
    let fs = RamFs::format(RAMDISK_BLOCKS);
    let free = fs.superblock().free_blocks;
    *RAMFS.lock() = Some(fs);
    serial_println!(
        "[ramfs] formatted {} blocks ({} free), {} inodes",
        RAMDISK_BLOCKS,
        free,
        INODE_COUNT
    );
}

/// Free data block count, for diagnostics and tests.
#[must_use]
pub fn free_blocks() -> u32 {
    with_ramfs(|fs| fs.superblock().free_blocks)
}

/// Free inode count, for diagnostics and tests.
#[must_use]
pub fn free_inodes() -> u32 {
    with_ramfs(|fs| fs.superblock().free_inodes)
}

/// The [`VnodeOps`] implementation backed by the global RAM disk.
pub struct RamfsOps;

impl VnodeOps for RamfsOps {
    fn read(&self, ino: u32, offset: usize, buf: &mut [u8]) -> Result<usize, FsError> {
        with_ramfs(|fs| fs.read_file(ino, offset, buf))
    }

    fn write(&self, ino: u32, offset: usize, data: &[u8]) -> Result<usize, FsError> {
        with_ramfs(|fs| fs.write_file(ino, offset, data))
    }

    fn truncate(&self, ino: u32, size: usize) -> Result<(), FsError> {
        with_ramfs(|fs| fs.truncate(ino, size))
    }

    fn lookup(&self, dir: u32, name: &str) -> Result<(u32, VnodeKind), FsError> {
        with_ramfs(|fs| fs.dir_lookup(dir, name))
    }

    fn create(&self, dir: u32, name: &str, kind: VnodeKind) -> Result<u32, FsError> {
        let kind = match kind {
            VnodeKind::Directory => KIND_DIR,
            _ => KIND_FILE,
        };
        with_ramfs(|fs| fs.create(dir, name, kind))
    }

    fn unlink(&self, dir: u32, name: &str) -> Result<(), FsError> {
        with_ramfs(|fs| fs.unlink(dir, name))
    }

    fn readdir(&self, dir: u32, index: usize) -> Result<Option<DirEntryInfo>, FsError> {
        with_ramfs(|fs| fs.readdir(dir, index))
    }

    fn stat(&self, ino: u32) -> Result<Stat, FsError> {
        with_ramfs(|fs| fs.stat(ino))
    }
}
