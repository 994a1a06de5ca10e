//! User pointer validation.
//!
//! No kernel code may touch a user-supplied pointer without going through
//! these checks: non-null, no wrap-around, and entirely inside the user
//! window. The window check is deliberately stronger than "below the
//! kernel half": with the bootloader's lower-half layout, kernel heap and
//! the physical-memory window would otherwise be in reach.

use crate::memory::paging;

use super::{EFAULT, ENAMETOOLONG};

/// Upper bound for user-supplied path strings, terminator included.
pub const MAX_PATH: usize = 256;

/// Validate a user buffer range. Zero-length buffers are fine as long as
/// the base address itself is plausible.
pub fn check_user_range(addr: u64, len: u64) -> Result<(), i64> {
    if addr == 0 || !paging::is_user_address(addr) {
        return Err(EFAULT);
    }
    if len == 0 {
        return Ok(());
    }
    let Some(end) = addr.checked_add(len) else {
        return Err(EFAULT);
    };
    if end > paging::USER_SPACE_END {
        return Err(EFAULT);
    }
    Ok(())
}

/// Borrow a user buffer for reading.
///
/// # Safety
///
/// The caller must run in the context of the process that supplied the
/// pointer, with that process's address space active.
pub unsafe fn user_slice<'a>(addr: u64, len: u64) -> Result<&'a [u8], i64> {
    check_user_range(addr, len)?;
    // SAFETY:
    // Range-checked above; the process context requirement is the caller's.
    Ok(unsafe { core::slice::from_raw_parts(addr as *const u8, len as usize) })
}

/// Borrow a user buffer for writing.
///
/// # Safety
///
/// Same contract as [`user_slice`]; additionally the range must be mapped
/// writable for the process (it traps to the page-fault handler if not).
pub unsafe fn user_slice_mut<'a>(addr: u64, len: u64) -> Result<&'a mut [u8], i64> {
    check_user_range(addr, len)?;
    // SAFETY:
    // Range-checked above; the process context requirement is the caller's.
    Ok(unsafe { core::slice::from_raw_parts_mut(addr as *mut u8, len as usize) })
}

/// Borrow a NUL-terminated user string of at most `max_len` bytes
/// (terminator included). Unterminated or non-UTF-8 strings are rejected.
///
/// # Safety
///
/// Same context contract as [`user_slice`].
pub unsafe fn user_str<'a>(addr: u64, max_len: usize) -> Result<&'a str, i64> {
    check_user_range(addr, 1)?;

    // Never walk past the user window, whatever `max_len` says.
    let window_left = (paging::USER_SPACE_END - addr) as usize;
    let limit = max_len.min(window_left);

    let mut len = 0;
    while len < limit {
        // SAFETY: addr + len stays inside the checked window.
        let byte = unsafe { *((addr + len as u64) as *const u8) };
        if byte == 0 {
            // SAFETY: the bytes up to `len` were just walked.
            let bytes = unsafe { core::slice::from_raw_parts(addr as *const u8, len) };
            return core::str::from_utf8(bytes).map_err(|_| EFAULT);
        }
        len += 1;
    }
    Err(ENAMETOOLONG)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::paging::{USER_SPACE_BASE, USER_SPACE_END};

    #[test_case]
    fn test_null_pointer_is_rejected() {
        assert_eq!(check_user_range(0, 1), Err(EFAULT));
    }

    #[test_case]
    fn test_kernel_half_pointer_is_rejected() {
        assert_eq!(check_user_range(0xFFFF_FFFF_0000_0000, 1), Err(EFAULT));
    }

    #[test_case]
    fn test_kernel_heap_pointer_is_rejected() {
        let heap_ptr = crate::memory::heap::HEAP_START as u64;
        assert_eq!(
            check_user_range(heap_ptr, 16),
            Err(EFAULT),
            "Lower-half kernel addresses must not pass as user pointers."
        );
    }

    #[test_case]
    fn test_wrapping_length_is_rejected() {
        assert_eq!(check_user_range(USER_SPACE_BASE, u64::MAX), Err(EFAULT));
    }

    #[test_case]
    fn test_range_crossing_window_end_is_rejected() {
        assert_eq!(check_user_range(USER_SPACE_END - 8, 16), Err(EFAULT));
    }

    #[test_case]
    fn test_zero_length_with_valid_base_is_accepted() {
        assert_eq!(check_user_range(USER_SPACE_BASE, 0), Ok(()));
    }

    #[test_case]
    fn test_in_window_range_is_accepted() {
        assert_eq!(check_user_range(USER_SPACE_BASE + 4096, 4096), Ok(()));
    }
}
