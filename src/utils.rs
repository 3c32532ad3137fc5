#![allow(clippy::cast_possible_truncation)]

pub const KB: usize = 1024;
pub const MB: usize = 1024 * KB;

pub const CACHE_LINE: usize = 64;
pub const PAGE_SIZE_4K: usize = 4 * KB;
pub const PAGE_SIZE_2M: usize = 2 * MB;

#[must_use]
pub const fn align_up(val: usize, align: usize) -> usize {
    (val + align - 1) & !(align - 1)
}

#[must_use]
pub const fn align_down(val: usize, align: usize) -> usize {
    val & !(align - 1)
}

/// Rounds `val` up to a multiple of `step`, which need not be a power of two.
#[must_use]
pub const fn round_up_to(val: usize, step: usize) -> usize {
    val.div_ceil(step) * step
}

/// Bytes needed to move `offset` forward to the next `align` boundary (0 if already there).
#[must_use]
pub const fn align_gap(offset: usize, align: usize) -> usize {
    (align - offset % align) % align
}

/// System page size, cached after the first query.
#[must_use]
pub fn page_size() -> usize {
    use std::sync::atomic::{AtomicUsize, Ordering};
    static PAGE: AtomicUsize = AtomicUsize::new(0);

    match PAGE.load(Ordering::Relaxed) {
        0 => {
            let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            let size = if raw > 0 { raw as usize } else { PAGE_SIZE_4K };
            PAGE.store(size, Ordering::Relaxed);
            size
        }
        size => size,
    }
}

#[cfg(target_arch = "x86_64")]
pub mod x86 {
    use std::arch::asm;
    use std::sync::atomic::{AtomicU8, Ordering};

    // 0 = Uninitialized, 1 = Supported, 2 = Not Supported
    fn cached(slot: &AtomicU8, probe: impl FnOnce() -> bool) -> bool {
        match slot.load(Ordering::Relaxed) {
            1 => true,
            2 => false,
            _ => {
                let supported = probe();
                slot.store(if supported { 1 } else { 2 }, Ordering::Relaxed);
                supported
            }
        }
    }

    fn leaf7() -> std::arch::x86_64::CpuidResult {
        unsafe { std::arch::x86_64::__cpuid_count(7, 0) }
    }

    /// CPUID.(EAX=7,ECX=0):EBX[23]
    pub fn supports_clflushopt() -> bool {
        static SLOT: AtomicU8 = AtomicU8::new(0);
        cached(&SLOT, || (leaf7().ebx & (1 << 23)) != 0)
    }

    /// CPUID.(EAX=7,ECX=0):EBX[24]
    pub fn supports_clwb() -> bool {
        static SLOT: AtomicU8 = AtomicU8::new(0);
        cached(&SLOT, || (leaf7().ebx & (1 << 24)) != 0)
    }

    /// CPUID.(EAX=7,ECX=0):ECX[5] (UMONITOR/UMWAIT/TPAUSE)
    pub fn supports_waitpkg() -> bool {
        static SLOT: AtomicU8 = AtomicU8::new(0);
        cached(&SLOT, || (leaf7().ecx & (1 << 5)) != 0)
    }

    /// CPUID.(EAX=7,ECX=0):ECX[28]
    pub fn supports_movdir64b() -> bool {
        static SLOT: AtomicU8 = AtomicU8::new(0);
        cached(&SLOT, || (leaf7().ecx & (1 << 28)) != 0)
    }

    /// CPUID.(EAX=7,ECX=0):ECX[29]
    pub fn supports_enqcmd() -> bool {
        static SLOT: AtomicU8 = AtomicU8::new(0);
        cached(&SLOT, || (leaf7().ecx & (1 << 29)) != 0)
    }

    #[allow(clippy::inline_always)]
    #[inline(always)]
    pub fn rdtsc() -> u64 {
        unsafe { std::arch::x86_64::_rdtsc() }
    }

    /// Arms address monitoring on the cache line holding `addr`.
    #[allow(clippy::inline_always)]
    #[inline(always)]
    pub unsafe fn umonitor(addr: *const u8) {
        unsafe {
            asm!("umonitor {0}", in(reg) addr, options(nostack, preserves_flags));
        }
    }

    /// Waits in C0.1 until the monitored line is written or the TSC reaches `deadline`.
    #[allow(clippy::inline_always)]
    #[inline(always)]
    pub unsafe fn umwait(deadline: u64) {
        let lo = deadline as u32;
        let hi = (deadline >> 32) as u32;
        unsafe {
            // Control bit 0 set selects the lighter C0.1 state. CF is clobbered.
            asm!(
                "umwait {ctl:e}",
                ctl = in(reg) 1u32,
                in("eax") lo,
                in("edx") hi,
                options(nostack)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_down(127, 64), 64);
        assert_eq!(align_gap(0, 64), 0);
        assert_eq!(align_gap(1000, 64), 24);
        assert_eq!(align_gap(64, 64), 0);
    }

    #[test]
    fn round_up_handles_non_power_of_two_steps() {
        assert_eq!(round_up_to(0, 3 * MB), 0);
        assert_eq!(round_up_to(1, 3 * MB), 3 * MB);
        assert_eq!(round_up_to(3 * MB, 3 * MB), 3 * MB);
        assert_eq!(round_up_to(3 * MB + 1, 3 * MB), 6 * MB);
    }

    #[test]
    fn page_size_is_power_of_two() {
        assert!(page_size().is_power_of_two());
    }
}
