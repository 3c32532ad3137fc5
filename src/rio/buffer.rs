use crate::error::{RioError, RioResult};
use std::io;

/// In-memory target: writes append, reads consume from a cursor.
#[derive(Debug, Default)]
pub struct BufferBackend {
    data: Vec<u8>,
    pos: usize,
}

impl BufferBackend {
    #[must_use]
    pub const fn new(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }

    pub fn write(&mut self, buf: &[u8]) {
        self.data.extend_from_slice(buf);
        self.pos += buf.len();
    }

    /// Reads exactly `buf.len()` bytes.
    ///
    /// # Errors
    /// Fails with `UnexpectedEof` when fewer bytes remain.
    pub fn read(&mut self, buf: &mut [u8]) -> RioResult<()> {
        let end = self.pos + buf.len();
        let src = self
            .data
            .get(self.pos..end)
            .ok_or_else(|| RioError::Io(io::ErrorKind::UnexpectedEof.into()))?;
        buf.copy_from_slice(src);
        self.pos = end;
        Ok(())
    }

    #[must_use]
    pub const fn tell(&self) -> u64 {
        self.pos as u64
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_past_end_fails_without_consuming() {
        let mut backend = BufferBackend::new(b"abcdef".to_vec());
        let mut out = [0u8; 4];
        backend.read(&mut out).unwrap();
        assert_eq!(&out, b"abcd");

        let mut too_long = [0u8; 3];
        assert!(backend.read(&mut too_long).is_err());
        assert_eq!(backend.tell(), 4);
    }
}
