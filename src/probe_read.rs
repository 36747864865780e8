//! Fault-tolerant reads from arbitrary addresses.
//!
//! Programs hand us addresses they computed from registers or from other
//! memory; nothing guarantees those are mapped. Every read here goes through
//! [`PlatformOps::read_nofault`](crate::platform::PlatformOps::read_nofault)
//! and reports a fault instead of taking one.

use crate::error::{BpfError, Result};
use crate::platform::{self, PAGE_SIZE};

/// Largest single `probe_read` a program may request: the size of its stack.
pub const MAX_BPF_STACK: usize = 512;

/// Copy `dst.len()` bytes starting at `src`.
///
/// On failure `dst` is zeroed so no stale bytes leak into the program.
pub fn read(dst: &mut [u8], src: usize) -> Result<()> {
    if dst.is_empty() {
        return Ok(());
    }
    match platform::ops().read_nofault(dst, src) {
        Ok(()) => Ok(()),
        Err(_) => {
            dst.fill(0);
            Err(BpfError::Fault)
        }
    }
}

/// `probe_read` as seen by programs: [`read`] bounded by [`MAX_BPF_STACK`].
pub fn probe_read(dst: &mut [u8], src: usize) -> Result<()> {
    if dst.len() > MAX_BPF_STACK {
        return Err(BpfError::InvalidArgument);
    }
    read(dst, src)
}

/// Copy a NUL-terminated string starting at `src`.
///
/// At most `dst.len() - 1` bytes are copied and `dst` is always terminated.
/// Reading stops at the first NUL, so bytes past it are never touched even
/// if they are unmapped.
///
/// # Returns
/// Length of the copied string, excluding the terminator.
///
/// # Errors
/// * `InvalidArgument` - `dst` is empty.
/// * `Fault` - the string could not be read; `dst[0]` is NUL.
pub fn read_str(dst: &mut [u8], src: usize) -> Result<usize> {
    let Some(max) = dst.len().checked_sub(1) else {
        return Err(BpfError::InvalidArgument);
    };

    let ops = platform::ops();
    let mut len = 0;
    while len < max {
        let addr = src.checked_add(len).ok_or(BpfError::Fault)?;
        // Never read across a page boundary we might not need.
        let chunk = (PAGE_SIZE - addr % PAGE_SIZE).min(max - len);
        let window = &mut dst[len..len + chunk];
        if ops.read_nofault(window, addr).is_err() {
            dst[0] = 0;
            return Err(BpfError::Fault);
        }
        if let Some(nul) = window.iter().position(|b| *b == 0) {
            return Ok(len + nul);
        }
        len += chunk;
    }
    dst[max] = 0;
    Ok(max)
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    #[test]
    fn test_read_zeroes_on_fault() {
        let mut dst = [0xaau8; 16];
        assert_eq!(read(&mut dst, 8), Err(BpfError::Fault));
        assert_eq!(dst, [0u8; 16]);
    }

    #[test]
    fn test_read_str_truncates() {
        let src = b"hello world\0";
        let mut dst = [0xffu8; 6];
        assert_eq!(read_str(&mut dst, src.as_ptr() as usize), Ok(5));
        assert_eq!(&dst, b"hello\0");
    }

    #[test]
    fn test_probe_read_size_limit() {
        let src = [1u8; MAX_BPF_STACK + 1];
        let mut dst = [0u8; MAX_BPF_STACK + 1];
        assert_eq!(
            probe_read(&mut dst, src.as_ptr() as usize),
            Err(BpfError::InvalidArgument)
        );
        assert!(probe_read(&mut dst[..MAX_BPF_STACK], src.as_ptr() as usize).is_ok());
    }
}
