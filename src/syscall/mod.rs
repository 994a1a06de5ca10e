//! System-call boundary.
//!
//! User programs enter through the `syscall` instruction; [`init`]
//! programs the fast-call MSRs so it lands in [`entry::syscall_entry`]
//! with a known ring 0 segment pair and interrupts masked. The dispatcher
//! validates every user pointer before touching it and translates
//! internal errors into negative codes, the sole error channel visible
//! from ring 3.
//!
//! ABI: number in `rax`, arguments in `rdi`, `rsi`, `rdx`, `r10`, `r8`
//! (`r10` replaces the `rcx` slot the instruction clobbers), result in
//! `rax`. Negative results are error codes.

use x86_64::registers::model_specific::{Efer, EferFlags, LStar, SFMask, Star};
use x86_64::registers::rflags::RFlags;
use x86_64::VirtAddr;

use crate::fs::{self, file::FileId, FsError, OpenFlags};
use crate::{gdt, process, serial_println, time};

mod entry;
pub mod uaccess;

pub use entry::set_kernel_stack;

/// Terminate the calling process.
pub const SYS_EXIT: u64 = 0;
/// Write a buffer to a file descriptor.
pub const SYS_WRITE: u64 = 1;
/// Read into a buffer from a file descriptor.
pub const SYS_READ: u64 = 2;
/// Give up the remainder of the time slice.
pub const SYS_YIELD: u64 = 3;
/// Process id of the caller.
pub const SYS_GETPID: u64 = 4;
/// Sleep for at least the given number of milliseconds.
pub const SYS_SLEEP: u64 = 5;
/// Open a path.
pub const SYS_OPEN: u64 = 6;
/// Close a file descriptor.
pub const SYS_CLOSE: u64 = 7;
/// Move a file offset.
pub const SYS_LSEEK: u64 = 8;
/// Stat a path.
pub const SYS_STAT: u64 = 9;
/// Stat an open file descriptor.
pub const SYS_FSTAT: u64 = 10;
/// Read one directory entry by index.
pub const SYS_READDIR: u64 = 11;
/// Copy the current working directory into a buffer.
pub const SYS_GETCWD: u64 = 12;
/// Change the current working directory.
pub const SYS_CHDIR: u64 = 13;

/// No such file or directory.
pub const ENOENT: i64 = -2;
/// Bad file descriptor.
pub const EBADF: i64 = -9;
/// Out of memory.
pub const ENOMEM: i64 = -12;
/// Bad address.
pub const EFAULT: i64 = -14;
/// File exists.
pub const EEXIST: i64 = -17;
/// Not a directory.
pub const ENOTDIR: i64 = -20;
/// Is a directory.
pub const EISDIR: i64 = -21;
/// Invalid argument.
pub const EINVAL: i64 = -22;
/// System-wide open file table full.
pub const ENFILE: i64 = -23;
/// Per-process file descriptor table full.
pub const EMFILE: i64 = -24;
/// No space left on the RAM disk.
pub const ENOSPC: i64 = -28;
/// Illegal seek.
pub const ESPIPE: i64 = -29;
/// Result does not fit the supplied buffer.
pub const ERANGE: i64 = -34;
/// Path component too long or unterminated.
pub const ENAMETOOLONG: i64 = -36;
/// Unknown system call number.
pub const ENOSYS: i64 = -38;
/// Directory not empty.
pub const ENOTEMPTY: i64 = -39;

const SEEK_SET: u64 = 0;
const SEEK_CUR: u64 = 1;
const SEEK_END: u64 = 2;

/// Program the fast-syscall MSRs.
///
/// STAR gets the kernel and user selector bases (the GDT layout makes the
/// `sysret` derivation line up, see [`gdt`]), LSTAR the trampoline
/// address, and SFMASK the RFLAGS bits cleared on entry, interrupts
/// among them.
pub fn init() {
    // SAFETY:
    // Selectors match the GDT layout; the entry symbol is a naked
    // function obeying the syscall ABI contract.
    unsafe {
        Efer::update(|flags| flags.insert(EferFlags::SYSTEM_CALL_EXTENSIONS));
        Star::write(
            gdt::user_code_selector(),
            gdt::user_data_selector(),
            gdt::kernel_code_selector(),
            gdt::kernel_data_selector(),
        )
        .expect("GDT layout violates the STAR selector contract");
        LStar::write(VirtAddr::new(entry::syscall_entry as *const () as u64));
        SFMask::write(RFlags::INTERRUPT_FLAG | RFlags::DIRECTION_FLAG | RFlags::TRAP_FLAG);
    }
}

impl FsError {
    /// The negative code a filesystem error surfaces as at this boundary.
    #[must_use]
    pub const fn errno(self) -> i64 {
        match self {
            Self::NotFound => ENOENT,
            Self::Exists => EEXIST,
            Self::NotADirectory => ENOTDIR,
            Self::IsADirectory => EISDIR,
            Self::NotEmpty => ENOTEMPTY,
            Self::NoSpace => ENOSPC,
            Self::NameTooLong => ENAMETOOLONG,
            Self::BadOffset => EINVAL,
            Self::NotSeekable => ESPIPE,
            Self::TableFull => ENFILE,
            Self::InvalidArgument => EINVAL,
        }
    }
}

fn fs_result(result: Result<usize, FsError>) -> i64 {
    match result {
        Ok(value) => value as i64,
        Err(error) => error.errno(),
    }
}

/// C-level syscall dispatcher, called from the trampoline with interrupts
/// still masked. Unknown numbers return [`ENOSYS`].
pub(crate) extern "C" fn dispatch(num: u64, a1: u64, a2: u64, a3: u64, a4: u64, _a5: u64) -> i64 {
    // Snapshot the user stack pointer into the PCB while the scratch slot
    // is still ours, then open up for preemption.
    let user_rsp = entry::scratch_user_rsp();
    process::with_current(|pcb| pcb.user_rsp = user_rsp);
    x86_64::instructions::interrupts::enable();

    match num {
        SYS_EXIT => process::exit(a1 as i64),
        SYS_WRITE => sys_write(a1, a2, a3),
        SYS_READ => sys_read(a1, a2, a3),
        SYS_YIELD => {
            process::yield_now();
            0
        }
        SYS_GETPID => process::current_pid() as i64,
        SYS_SLEEP => {
            process::sleep_ticks(time::ms_to_ticks(a1).max(1));
            0
        }
        SYS_OPEN => sys_open(a1, a2),
        SYS_CLOSE => sys_close(a1),
        SYS_LSEEK => sys_lseek(a1, a2 as i64, a3),
        SYS_STAT => sys_stat(a1, a2),
        SYS_FSTAT => sys_fstat(a1, a2),
        SYS_READDIR => sys_readdir(a1, a2, a3),
        SYS_GETCWD => sys_getcwd(a1, a2),
        SYS_CHDIR => sys_chdir(a1),
        _ => {
            serial_println!("[syscall] unknown syscall number {}", num);
            ENOSYS
        }
    }
}

/// Resolve a file descriptor of the calling process.
fn fd_lookup(fd: u64) -> Result<FileId, i64> {
    if fd >= crate::fs::file::MAX_FDS as u64 {
        return Err(EBADF);
    }
    process::with_current(|pcb| pcb.fds.get(fd as usize)).ok_or(EBADF)
}

fn sys_write(fd: u64, buf: u64, len: u64) -> i64 {
    let file = match fd_lookup(fd) {
        Ok(file) => file,
        Err(errno) => return errno,
    };
    // SAFETY: dispatched in the context of the calling process.
    let bytes = match unsafe { uaccess::user_slice(buf, len) } {
        Ok(bytes) => bytes,
        Err(errno) => return errno,
    };
    if bytes.is_empty() {
        return 0;
    }
    fs_result(fs::file::write(file, bytes))
}

fn sys_read(fd: u64, buf: u64, len: u64) -> i64 {
    let file = match fd_lookup(fd) {
        Ok(file) => file,
        Err(errno) => return errno,
    };
    // SAFETY: dispatched in the context of the calling process.
    let bytes = match unsafe { uaccess::user_slice_mut(buf, len) } {
        Ok(bytes) => bytes,
        Err(errno) => return errno,
    };
    if bytes.is_empty() {
        return 0;
    }
    fs_result(fs::file::read(file, bytes))
}

fn sys_open(path: u64, flags: u64) -> i64 {
    // SAFETY: dispatched in the context of the calling process.
    let path = match unsafe { uaccess::user_str(path, uaccess::MAX_PATH) } {
        Ok(path) => path,
        Err(errno) => return errno,
    };
    let flags = OpenFlags::from_bits_truncate(flags as u32);
    let cwd: alloc::string::String = process::with_current(|pcb| pcb.cwd().into());

    let file = match fs::open(path, flags, &cwd) {
        Ok(file) => file,
        Err(error) => return error.errno(),
    };

    match process::with_current(|pcb| pcb.fds.install(file)) {
        Some(fd) => fd as i64,
        None => {
            fs::file::unref(file);
            EMFILE
        }
    }
}

fn sys_close(fd: u64) -> i64 {
    if fd >= crate::fs::file::MAX_FDS as u64 {
        return EBADF;
    }
    match process::with_current(|pcb| pcb.fds.take(fd as usize)) {
        Some(file) => {
            fs::file::unref(file);
            0
        }
        None => EBADF,
    }
}

fn sys_lseek(fd: u64, offset: i64, whence: u64) -> i64 {
    let file = match fd_lookup(fd) {
        Ok(file) => file,
        Err(errno) => return errno,
    };
    let whence = match whence {
        SEEK_SET => fs::Whence::Set,
        SEEK_CUR => fs::Whence::Current,
        SEEK_END => fs::Whence::End,
        _ => return EINVAL,
    };
    match fs::file::lseek(file, offset, whence) {
        Ok(position) => position,
        Err(error) => error.errno(),
    }
}

/// Copy a kernel struct into a validated user buffer.
fn copy_to_user<T: Copy>(addr: u64, value: &T) -> Result<(), i64> {
    let size = core::mem::size_of::<T>() as u64;
    // SAFETY: dispatched in the context of the calling process.
    let out = unsafe { uaccess::user_slice_mut(addr, size)? };
    // SAFETY: `T` is plain old data and `out` is exactly `size` bytes.
    let bytes =
        unsafe { core::slice::from_raw_parts(core::ptr::from_ref(value).cast::<u8>(), size as usize) };
    out.copy_from_slice(bytes);
    Ok(())
}

fn sys_stat(path: u64, buf: u64) -> i64 {
    // SAFETY: dispatched in the context of the calling process.
    let path = match unsafe { uaccess::user_str(path, uaccess::MAX_PATH) } {
        Ok(path) => path,
        Err(errno) => return errno,
    };
    let cwd: alloc::string::String = process::with_current(|pcb| pcb.cwd().into());
    match fs::stat(path, &cwd) {
        Ok(stat) => match copy_to_user(buf, &stat) {
            Ok(()) => 0,
            Err(errno) => errno,
        },
        Err(error) => error.errno(),
    }
}

fn sys_fstat(fd: u64, buf: u64) -> i64 {
    let file = match fd_lookup(fd) {
        Ok(file) => file,
        Err(errno) => return errno,
    };
    match fs::file::fstat(file) {
        Ok(stat) => match copy_to_user(buf, &stat) {
            Ok(()) => 0,
            Err(errno) => errno,
        },
        Err(error) => error.errno(),
    }
}

fn sys_readdir(fd: u64, entry_buf: u64, index: u64) -> i64 {
    let file = match fd_lookup(fd) {
        Ok(file) => file,
        Err(errno) => return errno,
    };
    match fs::file::readdir(file, index as usize) {
        Ok(Some(entry)) => match copy_to_user(entry_buf, &entry) {
            Ok(()) => 1,
            Err(errno) => errno,
        },
        Ok(None) => 0,
        Err(error) => error.errno(),
    }
}

fn sys_getcwd(buf: u64, size: u64) -> i64 {
    let cwd: alloc::string::String = process::with_current(|pcb| pcb.cwd().into());
    let needed = cwd.len() as u64 + 1;
    if size < needed {
        return ERANGE;
    }
    // SAFETY: dispatched in the context of the calling process.
    let out = match unsafe { uaccess::user_slice_mut(buf, needed) } {
        Ok(out) => out,
        Err(errno) => return errno,
    };
    out[..cwd.len()].copy_from_slice(cwd.as_bytes());
    out[cwd.len()] = 0;
    needed as i64
}

fn sys_chdir(path: u64) -> i64 {
    // SAFETY: dispatched in the context of the calling process.
    let path = match unsafe { uaccess::user_str(path, uaccess::MAX_PATH) } {
        Ok(path) => path,
        Err(errno) => return errno,
    };
    let cwd: alloc::string::String = process::with_current(|pcb| pcb.cwd().into());

    let normalized = fs::normalize_path(path, &cwd);
    match fs::stat(&normalized, "/") {
        Ok(stat) if stat.kind == fs::Stat::KIND_DIRECTORY => {
            let stored = process::with_current(|pcb| pcb.set_cwd(&normalized));
            if stored {
                0
            } else {
                ENAMETOOLONG
            }
        }
        Ok(_) => ENOTDIR,
        Err(error) => error.errno(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn test_fs_errors_map_to_distinct_errnos() {
        assert_eq!(FsError::NotFound.errno(), ENOENT);
        assert_eq!(FsError::Exists.errno(), EEXIST);
        assert_eq!(FsError::NotEmpty.errno(), ENOTEMPTY);
        assert_eq!(FsError::NotSeekable.errno(), ESPIPE);
    }
}
