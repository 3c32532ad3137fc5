//! Histogram of CPU copy sizes.

use crate::utils::KB;
use std::fmt::Write as _;
use std::sync::{Mutex, PoisonError};
use tracing::info;

/// Inclusive upper bounds of the buckets; anything larger lands in the last bucket.
pub const BUCKET_LIMITS: [usize; 10] = [16, 32, 64, 128, 256, 512, KB, 4 * KB, 16 * KB, 64 * KB];
pub const BUCKET_COUNT: usize = BUCKET_LIMITS.len() + 1;

const BUCKET_LABELS: [&str; BUCKET_COUNT] = [
    "<=16", "<=32", "<=64", "<=128", "<=256", "<=512", "<=1K", "<=4K", "<=16K", "<=64K", ">64K",
];

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CopySizeSnapshot {
    pub buckets: [u64; BUCKET_COUNT],
    pub calls: u64,
    pub bytes: u64,
}

/// Thread-safe copy-size counters, shared through an `Arc`.
#[derive(Debug, Default)]
pub struct CopySizeStats {
    inner: Mutex<CopySizeSnapshot>,
}

impl CopySizeStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn bucket_of(size: usize) -> usize {
        BUCKET_LIMITS
            .iter()
            .position(|limit| size <= *limit)
            .unwrap_or(BUCKET_LIMITS.len())
    }

    pub fn record(&self, size: usize) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.buckets[Self::bucket_of(size)] += 1;
        inner.calls += 1;
        inner.bytes += size as u64;
    }

    #[must_use]
    pub fn snapshot(&self) -> CopySizeSnapshot {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn reset(&self) {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = CopySizeSnapshot::default();
    }

    /// Text table of call counts and their share of all calls.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn report(&self) -> String {
        let snap = self.snapshot();
        let mut out = String::new();
        let _ = writeln!(out, "copy size histogram: {} calls, {} bytes", snap.calls, snap.bytes);
        for (label, count) in BUCKET_LABELS.iter().zip(snap.buckets) {
            let share = if snap.calls == 0 {
                0.0
            } else {
                count as f64 * 100.0 / snap.calls as f64
            };
            let _ = writeln!(out, "{label:>6} {count:>12} {share:>6.2}%");
        }
        out
    }

    pub fn dump(&self) {
        info!("{}", self.report());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn bucket_boundaries_are_inclusive() {
        assert_eq!(CopySizeStats::bucket_of(0), 0);
        assert_eq!(CopySizeStats::bucket_of(16), 0);
        assert_eq!(CopySizeStats::bucket_of(17), 1);
        assert_eq!(CopySizeStats::bucket_of(4 * KB), 7);
        assert_eq!(CopySizeStats::bucket_of(64 * KB), 9);
        assert_eq!(CopySizeStats::bucket_of(64 * KB + 1), 10);
    }

    #[test]
    fn concurrent_records_are_counted() {
        let stats = Arc::new(CopySizeStats::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let stats = stats.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.record(100);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snap = stats.snapshot();
        assert_eq!(snap.calls, 4000);
        assert_eq!(snap.bytes, 400_000);
        assert_eq!(snap.buckets[3], 4000);
    }

    #[test]
    fn report_lists_every_bucket() {
        let stats = CopySizeStats::new();
        stats.record(8);
        stats.record(1 << 20);
        let report = stats.report();
        assert!(report.contains("2 calls"));
        assert!(report.contains(">64K"));
        assert!(report.contains("50.00%"));
        assert_eq!(report.lines().count(), 1 + BUCKET_COUNT);

        stats.reset();
        assert_eq!(stats.snapshot(), CopySizeSnapshot::default());
    }
}
