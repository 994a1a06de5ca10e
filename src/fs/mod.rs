//! Virtual filesystem layer.
//!
//! Paths are normalized lexically (`.`/`..` resolution, separator
//! collapsing, cwd-relative to absolute) before resolution ever touches a
//! filesystem; resolution then walks component by component from the root
//! vnode through the vnode operations. Vnodes are cached by inode number
//! in a fixed arena and refcounted; the root vnode is pinned for the
//! lifetime of the kernel.
//!
//! The RAM filesystem is the only mounted backend; console I/O bypasses
//! the vnode layer entirely (see [`file`]).

use alloc::string::String;
use alloc::vec::Vec;

use bitflags::bitflags;
use conquer_once::spin::OnceCell;
use spin::Mutex;

use crate::serial_println;

pub mod file;
pub mod ramfs;

/// Errors of the filesystem stack. The syscall layer owns the mapping to
/// user-visible negative codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// Path or entry does not exist.
    NotFound,
    /// Entry already exists.
    Exists,
    /// Directory operation on a non-directory.
    NotADirectory,
    /// File operation on a directory.
    IsADirectory,
    /// Directory still has entries.
    NotEmpty,
    /// Out of inodes or data blocks.
    NoSpace,
    /// Name exceeds the on-disk limit.
    NameTooLong,
    /// Seek before the start of the file.
    BadOffset,
    /// Seeking on a console.
    NotSeekable,
    /// A fixed table (vnodes, open files) is full.
    TableFull,
    /// Anything else the caller got wrong.
    InvalidArgument,
}

bitflags! {
    /// Open flags, POSIX-shaped.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Open for writing only.
        const WRITE_ONLY = 0o1;
        /// Open for reading and writing.
        const READ_WRITE = 0o2;
        /// Create the file if the final lookup fails.
        const CREATE = 0o100;
        /// Truncate an existing regular file to zero bytes.
        const TRUNCATE = 0o1000;
        /// Start with the offset at end of file.
        const APPEND = 0o2000;
    }
}

impl OpenFlags {
    /// Whether reads are permitted.
    #[must_use]
    pub fn readable(self) -> bool {
        !self.contains(Self::WRITE_ONLY) || self.contains(Self::READ_WRITE)
    }

    /// Whether writes are permitted.
    #[must_use]
    pub fn writable(self) -> bool {
        self.intersects(Self::WRITE_ONLY | Self::READ_WRITE)
    }
}

/// What a vnode stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VnodeKind {
    /// Regular file.
    File,
    /// Directory.
    Directory,
    /// Console device (never reachable by path).
    Console,
}

/// Metadata snapshot, layout-stable because it crosses the syscall
/// boundary by pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Stat {
    /// Inode number.
    pub ino: u32,
    /// One of the `KIND_` constants.
    pub kind: u32,
    /// Size in bytes.
    pub size: u64,
    /// Hard link count.
    pub links: u32,
    /// Data blocks in use.
    pub blocks: u32,
    /// Creation tick.
    pub created: u64,
    /// Last modification tick.
    pub modified: u64,
    /// Last access tick.
    pub accessed: u64,
}

impl Stat {
    /// Regular file.
    pub const KIND_FILE: u32 = 1;
    /// Directory.
    pub const KIND_DIRECTORY: u32 = 2;
    /// Console device.
    pub const KIND_CONSOLE: u32 = 3;
}

/// One directory entry as surfaced to user space.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct DirEntryInfo {
    /// Inode number.
    pub ino: u32,
    /// One of the [`Stat`] `KIND_` constants.
    pub kind: u32,
    /// Length of the name in bytes.
    pub name_len: u32,
    /// Name bytes, not NUL terminated.
    pub name: [u8; ramfs::MAX_NAME_LEN],
}

/// Seek origins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    /// From the start of the file.
    Set,
    /// From the current offset.
    Current,
    /// From the end of the file.
    End,
}

/// Capability set a vnode dispatches through. The RAM filesystem is the
/// only implementation in the kernel.
pub trait VnodeOps: Sync {
    /// Read from a regular file at a byte offset.
    fn read(&self, ino: u32, offset: usize, buf: &mut [u8]) -> Result<usize, FsError>;
    /// Write to a regular file at a byte offset.
    fn write(&self, ino: u32, offset: usize, data: &[u8]) -> Result<usize, FsError>;
    /// Shrink a regular file.
    fn truncate(&self, ino: u32, size: usize) -> Result<(), FsError>;
    /// Resolve one name inside a directory.
    fn lookup(&self, dir: u32, name: &str) -> Result<(u32, VnodeKind), FsError>;
    /// Create a file or directory entry inside a directory.
    fn create(&self, dir: u32, name: &str, kind: VnodeKind) -> Result<u32, FsError>;
    /// Remove an entry from a directory.
    fn unlink(&self, dir: u32, name: &str) -> Result<(), FsError>;
    /// The `index`-th live entry of a directory, if any.
    fn readdir(&self, dir: u32, index: usize) -> Result<Option<DirEntryInfo>, FsError>;
    /// Metadata of an inode.
    fn stat(&self, ino: u32) -> Result<Stat, FsError>;
}

/// Index into the vnode arena.
pub type VnodeId = usize;

/// Capacity of the vnode arena.
pub const MAX_VNODES: usize = 64;

struct Vnode {
    ino: u32,
    kind: VnodeKind,
    refcount: u32,
    ops: &'static dyn VnodeOps,
}

static VNODES: Mutex<[Option<Vnode>; MAX_VNODES]> = {
    const EMPTY: Option<Vnode> = None;
    Mutex::new([EMPTY; MAX_VNODES])
};

static ROOT_VNODE: OnceCell<VnodeId> = OnceCell::uninit();

/// Get or create the vnode for an inode: a live vnode with the same inode
/// number is reused with a bumped refcount.
fn vnode_get(ino: u32, kind: VnodeKind, ops: &'static dyn VnodeOps) -> Result<VnodeId, FsError> {
    let mut vnodes = VNODES.lock();

    for (id, slot) in vnodes.iter_mut().enumerate() {
        if let Some(vnode) = slot {
            if vnode.ino == ino {
                vnode.refcount += 1;
                return Ok(id);
            }
        }
    }

    for (id, slot) in vnodes.iter_mut().enumerate() {
        if slot.is_none() {
            *slot = Some(Vnode {
                ino,
                kind,
                refcount: 1,
                ops,
            });
            return Ok(id);
        }
    }

    serial_println!("[vfs] vnode table full");
    Err(FsError::TableFull)
}

/// Drop one reference; the slot is reclaimed at zero. The root vnode
/// holds a permanent reference and therefore never reaches zero.
pub(crate) fn vnode_unref(id: VnodeId) {
    let mut vnodes = VNODES.lock();
    if let Some(vnode) = vnodes[id].as_mut() {
        vnode.refcount -= 1;
        if vnode.refcount == 0 {
            vnodes[id] = None;
        }
    }
}

fn vnode_snapshot(id: VnodeId) -> Option<(u32, VnodeKind, &'static dyn VnodeOps)> {
    let vnodes = VNODES.lock();
    vnodes[id].as_ref().map(|v| (v.ino, v.kind, v.ops))
}

/// Initialize the RAM filesystem and pin the root vnode.
pub fn init() {
    ramfs::init();
    let root = vnode_get(ramfs::ROOT_INO, VnodeKind::Directory, &ramfs::RAMFS_OPS)
        .expect("vnode table empty at init");
    ROOT_VNODE
        .try_init_once(|| root)
        .expect("fs::init called twice");
    serial_println!("[vfs] root mounted, inode {}", ramfs::ROOT_INO);
}

/// Normalize a path: make it absolute against `cwd`, collapse duplicate
/// separators, and resolve `.` and `..` lexically. The result always
/// starts with `/` and never ends with one (except for the root itself).
#[must_use]
pub fn normalize_path(path: &str, cwd: &str) -> String {
    fn push_components<'a>(components: &mut Vec<&'a str>, input: &'a str) {
        for component in input.split('/') {
            match component {
                "" | "." => {}
                ".." => {
                    components.pop();
                }
                name => components.push(name),
            }
        }
    }

    let mut components: Vec<&str> = Vec::new();
    if !path.starts_with('/') {
        push_components(&mut components, cwd);
    }
    push_components(&mut components, path);

    if components.is_empty() {
        return String::from("/");
    }

    let mut out = String::new();
    for component in components {
        out.push('/');
        out.push_str(component);
    }
    out
}

/// Resolve a path to a referenced vnode. The caller owns one reference on
/// success and must release it with [`vnode_unref`].
pub fn lookup(path: &str, cwd: &str) -> Result<VnodeId, FsError> {
    let normalized = normalize_path(path, cwd);
    let root = *ROOT_VNODE.try_get().expect("vfs not initialized");

    let (root_ino, root_kind, root_ops) =
        vnode_snapshot(root).ok_or(FsError::InvalidArgument)?;
    let mut current = vnode_get(root_ino, root_kind, root_ops)?;

    for component in normalized.split('/').filter(|c| !c.is_empty()) {
        let Some((ino, kind, ops)) = vnode_snapshot(current) else {
            return Err(FsError::InvalidArgument);
        };
        if kind != VnodeKind::Directory {
            vnode_unref(current);
            return Err(FsError::NotADirectory);
        }
        let next = match ops.lookup(ino, component) {
            Ok((child_ino, child_kind)) => vnode_get(child_ino, child_kind, ops),
            Err(error) => {
                vnode_unref(current);
                return Err(error);
            }
        };
        vnode_unref(current);
        current = next?;
    }

    Ok(current)
}

/// Resolve the parent directory of a path. Returns a referenced vnode for
/// the parent plus the final component name.
pub fn lookup_parent(path: &str, cwd: &str) -> Result<(VnodeId, String), FsError> {
    let normalized = normalize_path(path, cwd);
    if normalized == "/" {
        return Err(FsError::InvalidArgument);
    }

    let split = normalized.rfind('/').expect("normalized paths contain /");
    let (dir_part, name) = normalized.split_at(split);
    let name = &name[1..];
    if name.len() > ramfs::MAX_NAME_LEN {
        return Err(FsError::NameTooLong);
    }

    let parent = lookup(if dir_part.is_empty() { "/" } else { dir_part }, "/")?;
    Ok((parent, String::from(name)))
}

/// Open a path into the system-wide open file table.
pub fn open(path: &str, flags: OpenFlags, cwd: &str) -> Result<file::FileId, FsError> {
    let mut just_created = false;

    let vnode = match lookup(path, cwd) {
        Ok(vnode) => vnode,
        Err(FsError::NotFound) if flags.contains(OpenFlags::CREATE) => {
            let (parent, name) = lookup_parent(path, cwd)?;
            let (parent_ino, _, ops) =
                vnode_snapshot(parent).ok_or(FsError::InvalidArgument)?;
            let created = ops.create(parent_ino, &name, VnodeKind::File);
            vnode_unref(parent);
            let ino = created?;
            just_created = true;
            vnode_get(ino, VnodeKind::File, &ramfs::RAMFS_OPS)?
        }
        Err(error) => return Err(error),
    };

    let Some((ino, kind, ops)) = vnode_snapshot(vnode) else {
        return Err(FsError::InvalidArgument);
    };

    if kind == VnodeKind::Directory && flags.writable() {
        vnode_unref(vnode);
        return Err(FsError::IsADirectory);
    }

    if kind == VnodeKind::File && flags.contains(OpenFlags::TRUNCATE) && flags.writable() {
        // A file that open itself just created is already empty.
        if !just_created {
            if let Err(error) = ops.truncate(ino, 0) {
                vnode_unref(vnode);
                return Err(error);
            }
        }
    }

    let offset = if flags.contains(OpenFlags::APPEND) {
        match ops.stat(ino) {
            Ok(stat) => stat.size as usize,
            Err(error) => {
                vnode_unref(vnode);
                return Err(error);
            }
        }
    } else {
        0
    };

    match file::alloc(vnode, kind, flags, offset) {
        Ok(file) => Ok(file),
        Err(error) => {
            vnode_unref(vnode);
            Err(error)
        }
    }
}

/// Stat a path.
pub fn stat(path: &str, cwd: &str) -> Result<Stat, FsError> {
    let vnode = lookup(path, cwd)?;
    let result = vnode_snapshot(vnode)
        .ok_or(FsError::InvalidArgument)
        .and_then(|(ino, _, ops)| ops.stat(ino));
    vnode_unref(vnode);
    result
}

/// Create a directory.
pub fn mkdir(path: &str, cwd: &str) -> Result<(), FsError> {
    create(path, VnodeKind::Directory, cwd).map(|_| ())
}

/// Create a file or directory. Returns the new inode number.
pub fn create(path: &str, kind: VnodeKind, cwd: &str) -> Result<u32, FsError> {
    let (parent, name) = lookup_parent(path, cwd)?;
    let result = vnode_snapshot(parent)
        .ok_or(FsError::InvalidArgument)
        .and_then(|(parent_ino, parent_kind, ops)| {
            if parent_kind != VnodeKind::Directory {
                return Err(FsError::NotADirectory);
            }
            ops.create(parent_ino, &name, kind)
        });
    vnode_unref(parent);
    result
}

/// Remove a file or an empty directory.
pub fn unlink(path: &str, cwd: &str) -> Result<(), FsError> {
    let (parent, name) = lookup_parent(path, cwd)?;
    let result = vnode_snapshot(parent)
        .ok_or(FsError::InvalidArgument)
        .and_then(|(parent_ino, _, ops)| ops.unlink(parent_ino, &name));
    vnode_unref(parent);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn test_normalize_makes_relative_paths_absolute() {
        assert_eq!(normalize_path("a/./b/../c//d/", "/x"), "/x/a/c/d");
    }

    #[test_case]
    fn test_normalize_keeps_root() {
        assert_eq!(normalize_path("/", "/anything"), "/");
    }

    #[test_case]
    fn test_normalize_clamps_dotdot_at_root() {
        assert_eq!(normalize_path("/a/../..", "/"), "/");
    }

    #[test_case]
    fn test_normalize_is_idempotent() {
        let once = normalize_path("a/./b/../c//d/", "/x");
        assert_eq!(
            normalize_path(&once, "/"),
            once,
            "Normalizing a normalized path must be the identity."
        );
    }

    #[test_case]
    fn test_normalize_strips_trailing_separator() {
        assert_eq!(normalize_path("/a/b/", "/"), "/a/b");
    }

    #[test_case]
    fn test_open_flags_access_modes() {
        let rdonly = OpenFlags::empty();
        assert!(rdonly.readable() && !rdonly.writable());

        let wronly = OpenFlags::WRITE_ONLY;
        assert!(!wronly.readable() && wronly.writable());

        let rdwr = OpenFlags::READ_WRITE;
        assert!(rdwr.readable() && rdwr.writable());
    }
}
