//! CPU-side persistence primitives.
//!
//! `flush` writes dirty cache lines of a range back towards the persistence
//! domain and `drain` orders those write-backs before any later store. The two
//! together form the persistence barrier for CPU-written PMEM ranges.

use crate::utils::{align_down, page_size};
use std::io;
use std::sync::atomic::{Ordering, fence};

#[cfg(target_arch = "x86_64")]
mod x86_flush {
    use crate::utils::x86;
    use std::arch::asm;

    #[derive(Clone, Copy, PartialEq, Eq)]
    pub enum FlushKind {
        Clwb,
        ClflushOpt,
        Clflush,
    }

    pub fn kind() -> FlushKind {
        if x86::supports_clwb() {
            FlushKind::Clwb
        } else if x86::supports_clflushopt() {
            FlushKind::ClflushOpt
        } else {
            FlushKind::Clflush
        }
    }

    #[allow(clippy::inline_always)]
    #[inline(always)]
    pub unsafe fn flush_line(kind: FlushKind, line: *const u8) {
        unsafe {
            match kind {
                FlushKind::Clwb => asm!("clwb [{0}]", in(reg) line, options(nostack, preserves_flags)),
                FlushKind::ClflushOpt => {
                    asm!("clflushopt [{0}]", in(reg) line, options(nostack, preserves_flags));
                }
                FlushKind::Clflush => std::arch::x86_64::_mm_clflush(line),
            }
        }
    }

    #[allow(clippy::inline_always)]
    #[inline(always)]
    pub fn sfence() {
        unsafe { std::arch::x86_64::_mm_sfence() }
    }
}

/// Writes back every cache line overlapping `[addr, addr + len)`.
///
/// # Safety
/// The range must be mapped for the duration of the call.
pub unsafe fn flush(addr: *const u8, len: usize) {
    if len == 0 {
        return;
    }

    #[cfg(target_arch = "x86_64")]
    {
        use crate::utils::{CACHE_LINE, align_up};

        let kind = x86_flush::kind();
        let end = align_up(addr as usize + len, CACHE_LINE);
        let mut line = align_down(addr as usize, CACHE_LINE);
        while line < end {
            unsafe { x86_flush::flush_line(kind, line as *const u8) };
            line += CACHE_LINE;
        }
    }

    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = addr;
        fence(Ordering::SeqCst);
    }
}

/// Waits for previously issued flushes to complete.
pub fn drain() {
    #[cfg(target_arch = "x86_64")]
    x86_flush::sfence();

    fence(Ordering::SeqCst);
}

/// Flush followed by drain.
///
/// # Safety
/// Same as [`flush`].
pub unsafe fn persist(addr: *const u8, len: usize) {
    unsafe { flush(addr, len) };
    drain();
}

/// Copies `src` to `dst` with the CPU and flushes the destination lines.
///
/// # Safety
/// `dst` must be valid for `src.len()` bytes and must not overlap `src`.
pub unsafe fn copy_and_flush(dst: *mut u8, src: &[u8], flush_after: bool) {
    unsafe {
        std::ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len());
        if flush_after {
            flush(dst, src.len());
        }
    }
}

/// `msync` for mappings that are not true persistent memory.
///
/// The range is widened to page boundaries as the kernel requires.
///
/// # Safety
/// `base` must be the start of a live mapping that covers the range.
pub unsafe fn msync(base: *mut u8, offset: usize, len: usize) -> io::Result<()> {
    if len == 0 {
        return Ok(());
    }
    let page = page_size();
    let start = align_down(offset, page);
    let end = offset + len;
    let ret = unsafe {
        libc::msync(
            base.add(start).cast::<libc::c_void>(),
            end - start,
            libc::MS_SYNC,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
