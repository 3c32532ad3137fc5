//! Completion polling.
//!
//! A short busy spin covers the common case of a record that lands within a few
//! microseconds. After that the waiter parks on the record's cache line with
//! `UMONITOR/UMWAIT` when the CPU has WAITPKG, and yields the thread otherwise.

use crate::dsa::descriptor::{CompletionRecord, CompletionStatus};
use crate::error::{RioError, RioResult};
use std::time::Instant;

const SPIN_ITERATIONS: u32 = 2048;
#[cfg(target_arch = "x86_64")]
const UMWAIT_CYCLES: u64 = 100_000;

/// Blocks until `record` holds a terminal status or `deadline` passes.
///
/// # Safety
/// `record` must stay mapped for the duration of the call.
pub unsafe fn wait_record(
    record: *const CompletionRecord,
    deadline: Option<Instant>,
) -> RioResult<CompletionStatus> {
    let record = unsafe { &*record };

    for _ in 0..SPIN_ITERATIONS {
        let status = record.status();
        if status.is_terminal() {
            return Ok(status);
        }
        std::hint::spin_loop();
    }

    #[cfg(target_arch = "x86_64")]
    let parked = crate::utils::x86::supports_waitpkg();

    loop {
        let status = record.status();
        if status.is_terminal() {
            return Ok(status);
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(RioError::WaitTimeout);
        }

        #[cfg(target_arch = "x86_64")]
        {
            if parked {
                use crate::utils::x86;
                unsafe {
                    x86::umonitor(std::ptr::from_ref(&record.status).cast());
                    // Re-check after arming: the write may have landed in between.
                    if !record.status().is_terminal() {
                        x86::umwait(x86::rdtsc().wrapping_add(UMWAIT_CYCLES));
                    }
                }
                continue;
            }
        }

        std::thread::yield_now();
    }
}
