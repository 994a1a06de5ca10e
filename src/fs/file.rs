//! The system-wide open file table and per-process FD tables.
//!
//! Slots 0..3 of the open file table are the three permanent console
//! entries behind every process's stdin/stdout/stderr. They are
//! refcounted like any other entry but never reclaimed: unref clamps
//! their count at one, and console reads and writes bypass the vnode
//! layer entirely (keyboard ring buffer in, text console out).

use spin::Mutex;

use super::{FsError, OpenFlags, Stat, VnodeId, VnodeKind, Whence};
use crate::{console, keyboard};

/// Index into the open file table.
pub type FileId = usize;

/// Capacity of the system-wide open file table.
pub const MAX_OPEN_FILES: usize = 64;

/// File descriptors per process.
pub const MAX_FDS: usize = 16;

/// Number of permanent console entries at the front of the table.
const CONSOLE_FILES: usize = 3;

#[derive(Clone, Copy, PartialEq, Eq)]
enum FileKind {
    Unused,
    Console,
    Regular,
    Directory,
}

/// One system-wide open file. A slot is free iff its refcount is zero.
struct OpenFile {
    refcount: u32,
    kind: FileKind,
    flags: OpenFlags,
    offset: usize,
    vnode: Option<VnodeId>,
}

impl OpenFile {
    const fn unused() -> Self {
        Self {
            refcount: 0,
            kind: FileKind::Unused,
            flags: OpenFlags::empty(),
            offset: 0,
            vnode: None,
        }
    }

    const fn console() -> Self {
        Self {
            refcount: 1,
            kind: FileKind::Console,
            flags: OpenFlags::READ_WRITE,
            offset: 0,
            vnode: None,
        }
    }
}

static OPEN_FILES: Mutex<[OpenFile; MAX_OPEN_FILES]> = {
    const UNUSED: OpenFile = OpenFile::unused();
    let mut files = [UNUSED; MAX_OPEN_FILES];
    files[0] = OpenFile::console();
    files[1] = OpenFile::console();
    files[2] = OpenFile::console();
    Mutex::new(files)
};

/// Allocate an open file entry with refcount 1.
pub(super) fn alloc(
    vnode: VnodeId,
    kind: VnodeKind,
    flags: OpenFlags,
    offset: usize,
) -> Result<FileId, FsError> {
    let kind = match kind {
        VnodeKind::File => FileKind::Regular,
        VnodeKind::Directory => FileKind::Directory,
        VnodeKind::Console => FileKind::Console,
    };

    let mut files = OPEN_FILES.lock();
    for (id, slot) in files.iter_mut().enumerate().skip(CONSOLE_FILES) {
        if slot.refcount == 0 {
            *slot = OpenFile {
                refcount: 1,
                kind,
                flags,
                offset,
                vnode: Some(vnode),
            };
            return Ok(id);
        }
    }
    Err(FsError::TableFull)
}

/// Take one more reference on an open file.
pub fn ref_file(file: FileId) {
    let mut files = OPEN_FILES.lock();
    files[file].refcount += 1;
}

/// Drop one reference. On zero the backing vnode is released and the slot
/// cleared; the console entries are exempt and never drop below one.
pub fn unref(file: FileId) {
    let vnode = {
        let mut files = OPEN_FILES.lock();
        let slot = &mut files[file];

        if file < CONSOLE_FILES {
            if slot.refcount > 1 {
                slot.refcount -= 1;
            }
            return;
        }
        if slot.refcount == 0 {
            return;
        }

        slot.refcount -= 1;
        if slot.refcount > 0 {
            return;
        }
        let vnode = slot.vnode.take();
        *slot = OpenFile::unused();
        vnode
    };

    if let Some(vnode) = vnode {
        super::vnode_unref(vnode);
    }
}

/// Snapshot a file entry for an I/O operation.
fn snapshot(file: FileId) -> Result<(FileKind, OpenFlags, usize, Option<VnodeId>), FsError> {
    let files = OPEN_FILES.lock();
    let slot = &files[file];
    if slot.refcount == 0 {
        return Err(FsError::InvalidArgument);
    }
    Ok((slot.kind, slot.flags, slot.offset, slot.vnode))
}

fn advance_offset(file: FileId, by: usize) {
    let mut files = OPEN_FILES.lock();
    files[file].offset += by;
}

/// Read from an open file into `buf`, advancing the offset by the bytes
/// transferred. Console reads block until at least one character arrives.
pub fn read(file: FileId, buf: &mut [u8]) -> Result<usize, FsError> {
    if buf.is_empty() {
        return Ok(0);
    }
    let (kind, flags, offset, vnode) = snapshot(file)?;

    match kind {
        FileKind::Console => {
            // Block for the first byte, then drain whatever else is
            // already buffered. No lock is held while blocking.
            buf[0] = keyboard::read_char_blocking();
            let mut filled = 1;
            while filled < buf.len() {
                match keyboard::try_read_char() {
                    Some(byte) => {
                        buf[filled] = byte;
                        filled += 1;
                    }
                    None => break,
                }
            }
            Ok(filled)
        }
        FileKind::Regular => {
            if !flags.readable() {
                return Err(FsError::InvalidArgument);
            }
            let (ino, ops) = vnode_target(vnode)?;
            let read = ops.read(ino, offset, buf)?;
            advance_offset(file, read);
            Ok(read)
        }
        FileKind::Directory => Err(FsError::IsADirectory),
        FileKind::Unused => Err(FsError::InvalidArgument),
    }
}

/// Write `data` to an open file, advancing the offset by the bytes
/// transferred. Console writes go to the text console and serial mirror.
pub fn write(file: FileId, data: &[u8]) -> Result<usize, FsError> {
    let (kind, flags, offset, vnode) = snapshot(file)?;

    match kind {
        FileKind::Console => {
            console::write_bytes(data);
            Ok(data.len())
        }
        FileKind::Regular => {
            if !flags.writable() {
                return Err(FsError::InvalidArgument);
            }
            let (ino, ops) = vnode_target(vnode)?;
            let written = ops.write(ino, offset, data)?;
            advance_offset(file, written);
            Ok(written)
        }
        FileKind::Directory => Err(FsError::IsADirectory),
        FileKind::Unused => Err(FsError::InvalidArgument),
    }
}

/// Reposition the file offset. Consoles are not seekable; `SEEK_END`
/// resolves against the inode's current size.
pub fn lseek(file: FileId, offset: i64, whence: Whence) -> Result<i64, FsError> {
    let (kind, _, current, vnode) = snapshot(file)?;

    if kind == FileKind::Console {
        return Err(FsError::NotSeekable);
    }

    let base = match whence {
        Whence::Set => 0,
        Whence::Current => current as i64,
        Whence::End => {
            let (ino, ops) = vnode_target(vnode)?;
            ops.stat(ino)?.size as i64
        }
    };
    let position = base.checked_add(offset).ok_or(FsError::BadOffset)?;
    if position < 0 {
        return Err(FsError::BadOffset);
    }

    let mut files = OPEN_FILES.lock();
    files[file].offset = position as usize;
    Ok(position)
}

/// Stat an open file. Console descriptors report a synthetic entry.
pub fn fstat(file: FileId) -> Result<Stat, FsError> {
    let (kind, _, _, vnode) = snapshot(file)?;

    if kind == FileKind::Console {
        return Ok(Stat {
            ino: 0,
            kind: Stat::KIND_CONSOLE,
            size: 0,
            links: 1,
            blocks: 0,
            created: 0,
            modified: 0,
            accessed: 0,
        });
    }
    let (ino, ops) = vnode_target(vnode)?;
    ops.stat(ino)
}

/// The `index`-th live entry of an open directory.
pub fn readdir(file: FileId, index: usize) -> Result<Option<super::DirEntryInfo>, FsError> {
    let (kind, _, _, vnode) = snapshot(file)?;
    if kind != FileKind::Directory {
        return Err(FsError::NotADirectory);
    }
    let (ino, ops) = vnode_target(vnode)?;
    ops.readdir(ino, index)
}

fn vnode_target(
    vnode: Option<VnodeId>,
) -> Result<(u32, &'static dyn super::VnodeOps), FsError> {
    let id = vnode.ok_or(FsError::InvalidArgument)?;
    super::vnode_snapshot(id)
        .map(|(ino, _, ops)| (ino, ops))
        .ok_or(FsError::InvalidArgument)
}

/// Per-process file descriptor table: fixed slots pointing into the open
/// file table, lowest-free allocation.
pub struct FdTable {
    slots: [Option<FileId>; MAX_FDS],
    count: usize,
}

impl FdTable {
    /// A table with no descriptors.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            slots: [None; MAX_FDS],
            count: 0,
        }
    }

    /// A table with the standard descriptors 0/1/2 wired to the console.
    #[must_use]
    pub fn with_console() -> Self {
        let mut table = Self::empty();
        for fd in 0..CONSOLE_FILES {
            ref_file(fd);
            table.slots[fd] = Some(fd);
            table.count += 1;
        }
        table
    }

    /// Duplicate for a spawned process: every inherited descriptor adds
    /// one reference to its open file entry.
    #[must_use]
    pub fn clone_for_spawn(&self) -> Self {
        let mut table = Self::empty();
        for (fd, slot) in self.slots.iter().enumerate() {
            if let Some(file) = slot {
                ref_file(*file);
                table.slots[fd] = Some(*file);
                table.count += 1;
            }
        }
        table
    }

    /// File behind a descriptor.
    #[must_use]
    pub fn get(&self, fd: usize) -> Option<FileId> {
        self.slots.get(fd).copied().flatten()
    }

    /// Install a file in the lowest free slot.
    pub fn install(&mut self, file: FileId) -> Option<usize> {
        let fd = self.slots.iter().position(Option::is_none)?;
        self.slots[fd] = Some(file);
        self.count += 1;
        Some(fd)
    }

    /// Remove and return the file behind a descriptor.
    pub fn take(&mut self, fd: usize) -> Option<FileId> {
        let file = self.slots.get_mut(fd)?.take()?;
        self.count -= 1;
        Some(file)
    }

    /// Live descriptor count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.count
    }

    /// Whether no descriptor is open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Release every descriptor, dropping the file references.
    pub fn release(&mut self) {
        for slot in &mut self.slots {
            if let Some(file) = slot.take() {
                unref(file);
            }
        }
        self.count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn test_fd_table_allocates_lowest_slot() {
        let mut table = FdTable::empty();
        assert_eq!(table.install(10), Some(0));
        assert_eq!(table.install(11), Some(1));
        assert_eq!(table.take(0), Some(10));
        assert_eq!(table.install(12), Some(0), "Freed slot 0 is reused first.");
    }

    #[test_case]
    fn test_fd_clone_adds_one_reference_per_slot() {
        let mut table = FdTable::with_console();
        let clone = table.clone_for_spawn();
        assert_eq!(clone.len(), 3, "All console descriptors are inherited.");
        assert_eq!(clone.get(1), Some(1));

        // Unwind the refcounts taken by this test.
        let mut clone = clone;
        clone.release();
        table.release();
    }
}
