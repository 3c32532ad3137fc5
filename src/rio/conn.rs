//! Read-only buffered target over a connection.

use crate::error::{RioError, RioResult};
use crate::utils::KB;
use std::io::{self, Read};

/// Minimum refill size when more bytes are needed.
pub const PROTO_IOBUF_LEN: usize = 16 * KB;

pub struct ConnBackend {
    reader: Box<dyn Read + Send>,
    buf: Vec<u8>,
    pos: usize,
    /// 0 means unlimited.
    read_limit: usize,
    read_so_far: usize,
}

impl std::fmt::Debug for ConnBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnBackend")
            .field("buffered", &(self.buf.len() - self.pos))
            .field("read_limit", &self.read_limit)
            .field("read_so_far", &self.read_so_far)
            .finish_non_exhaustive()
    }
}

impl ConnBackend {
    #[must_use]
    pub fn new(reader: Box<dyn Read + Send>, read_limit: usize) -> Self {
        Self {
            reader,
            buf: Vec::with_capacity(PROTO_IOBUF_LEN),
            pos: 0,
            read_limit,
            read_so_far: 0,
        }
    }

    /// Reads exactly `out.len()` bytes, buffering ahead up to the read limit.
    ///
    /// # Errors
    /// `ReadLimitExceeded` when the request crosses the limit, `UnexpectedEof` when the
    /// peer closes, and `TimedOut` when a receive timeout expires.
    pub fn read(&mut self, out: &mut [u8]) -> RioResult<()> {
        let len = out.len();
        if self.read_limit != 0 && self.read_so_far + len > self.read_limit {
            return Err(RioError::ReadLimitExceeded);
        }

        if self.pos > 0 && self.buf.len() - self.pos < len {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }

        while self.buf.len() - self.pos < len {
            let buffered = self.buf.len() - self.pos;
            let mut want = (len - buffered).max(PROTO_IOBUF_LEN);
            if self.read_limit != 0 {
                want = want.min(self.read_limit - self.read_so_far - buffered);
            }

            let start = self.buf.len();
            self.buf.resize(start + want, 0);
            let result = self.reader.read(&mut self.buf[start..]);
            let got = *result.as_ref().unwrap_or(&0);
            self.buf.truncate(start + got);

            match result {
                Ok(0) => return Err(RioError::Io(io::ErrorKind::UnexpectedEof.into())),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Err(RioError::Io(io::Error::new(io::ErrorKind::TimedOut, e)));
                }
                Err(e) => return Err(e.into()),
            }
        }

        out.copy_from_slice(&self.buf[self.pos..self.pos + len]);
        self.pos += len;
        self.read_so_far += len;
        Ok(())
    }

    #[must_use]
    pub const fn tell(&self) -> u64 {
        self.read_so_far as u64
    }

    /// Bytes read from the connection but not yet consumed.
    #[must_use]
    pub fn into_remaining(mut self) -> Vec<u8> {
        self.buf.drain(..self.pos);
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Hands out at most `step` bytes per call, interrupting every other call.
    struct Trickle {
        data: Cursor<Vec<u8>>,
        step: usize,
        calls: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.calls += 1;
            if self.calls % 2 == 0 {
                return Err(io::ErrorKind::Interrupted.into());
            }
            let n = buf.len().min(self.step);
            self.data.read(&mut buf[..n])
        }
    }

    #[test]
    fn short_reads_and_interrupts_are_retried() {
        let reader = Trickle {
            data: Cursor::new((0..100u8).collect()),
            step: 7,
            calls: 0,
        };
        let mut conn = ConnBackend::new(Box::new(reader), 0);
        let mut out = [0u8; 50];
        conn.read(&mut out).unwrap();
        assert_eq!(out[49], 49);
        assert_eq!(conn.tell(), 50);
    }

    #[test]
    fn read_limit_is_enforced() {
        let mut conn = ConnBackend::new(Box::new(Cursor::new(vec![1u8; 100])), 10);
        let mut out = [0u8; 8];
        conn.read(&mut out).unwrap();
        let err = conn.read(&mut out).unwrap_err();
        assert!(matches!(err, RioError::ReadLimitExceeded));

        // Buffering never went past the limit.
        assert_eq!(conn.into_remaining(), vec![1u8; 2]);
    }

    #[test]
    fn closed_peer_is_eof() {
        let mut conn = ConnBackend::new(Box::new(Cursor::new(vec![1u8; 3])), 0);
        let mut out = [0u8; 4];
        let err = conn.read(&mut out).unwrap_err();
        assert!(matches!(err, RioError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof));
    }

    #[test]
    fn would_block_becomes_timeout() {
        struct Blocked;
        impl Read for Blocked {
            fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
                Err(io::ErrorKind::WouldBlock.into())
            }
        }
        let mut conn = ConnBackend::new(Box::new(Blocked), 0);
        let err = conn.read(&mut [0u8; 1]).unwrap_err();
        assert!(matches!(err, RioError::Io(e) if e.kind() == io::ErrorKind::TimedOut));
    }
}
