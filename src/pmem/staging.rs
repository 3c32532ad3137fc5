use crate::error::{RioError, RioResult};
use crate::utils::CACHE_LINE;

#[repr(C, align(64))]
#[derive(Clone, Copy)]
struct Line([u8; CACHE_LINE]);

/// Cache-line aligned buffer that coalesces small writes.
///
/// The fill offset always stays below the capacity: the owner drains the buffer
/// once [`StagingBuffer::needs_flush`] reports that less than one line is left.
pub struct StagingBuffer {
    lines: Box<[Line]>,
    fill: usize,
}

impl std::fmt::Debug for StagingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagingBuffer")
            .field("capacity", &self.capacity())
            .field("fill", &self.fill)
            .finish()
    }
}

impl StagingBuffer {
    /// # Errors
    /// Returns `InvalidConfig` unless `capacity` is a multiple of the cache line and
    /// holds at least two lines.
    pub fn new(capacity: usize) -> RioResult<Self> {
        if capacity % CACHE_LINE != 0 || capacity < 2 * CACHE_LINE {
            return Err(RioError::InvalidConfig(format!(
                "staging capacity {capacity} must be a multiple of {CACHE_LINE} and at least {}",
                2 * CACHE_LINE
            )));
        }
        Ok(Self {
            lines: vec![Line([0; CACHE_LINE]); capacity / CACHE_LINE].into_boxed_slice(),
            fill: 0,
        })
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.lines.len() * CACHE_LINE
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.fill
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.fill == 0
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.capacity() - self.fill
    }

    #[must_use]
    pub fn needs_flush(&self) -> bool {
        self.fill >= self.capacity() - CACHE_LINE
    }

    /// Appends as much of `data` as fits and returns the number of bytes taken.
    pub fn push(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.remaining());
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.lines.as_mut_ptr().cast::<u8>().add(self.fill),
                n,
            );
        }
        self.fill += n;
        n
    }

    /// The staged bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.lines.as_ptr().cast::<u8>(), self.fill) }
    }

    pub fn clear(&mut self) {
        self.fill = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_is_line_aligned() {
        let staging = StagingBuffer::new(16 * 1024).unwrap();
        assert_eq!(staging.as_slice().as_ptr() as usize % CACHE_LINE, 0);
        assert_eq!(staging.capacity(), 16 * 1024);
    }

    #[test]
    fn push_stops_at_capacity() {
        let mut staging = StagingBuffer::new(128).unwrap();
        assert_eq!(staging.push(&[7u8; 100]), 100);
        assert!(staging.needs_flush());
        assert_eq!(staging.push(&[8u8; 100]), 28);
        assert_eq!(staging.len(), 128);
        assert_eq!(staging.as_slice()[99], 7);
        assert_eq!(staging.as_slice()[100], 8);

        staging.clear();
        assert!(staging.is_empty());
        assert!(!staging.needs_flush());
    }

    #[test]
    fn odd_capacity_is_rejected() {
        assert!(StagingBuffer::new(100).is_err());
        assert!(StagingBuffer::new(64).is_err());
    }
}
