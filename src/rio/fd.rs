//! Write-only target over a file descriptor, typically a pipe or socket.

use super::conn::PROTO_IOBUF_LEN;
use crate::error::{RioError, RioResult};
use std::fs::File;
use std::io::{self, Write};
use std::os::fd::OwnedFd;

#[derive(Debug)]
pub struct FdBackend {
    file: File,
    buf: Vec<u8>,
    /// Bytes handed to the descriptor so far.
    pos: u64,
}

impl FdBackend {
    #[must_use]
    pub fn new(fd: OwnedFd) -> Self {
        Self {
            file: File::from(fd),
            buf: Vec::new(),
            pos: 0,
        }
    }

    /// Small writes are buffered; a large write flushes the buffer and goes straight through.
    ///
    /// # Errors
    /// Returns the underlying I/O error, with `WouldBlock` reported as `TimedOut`.
    pub fn write(&mut self, data: &[u8]) -> RioResult<()> {
        if data.len() > PROTO_IOBUF_LEN {
            self.flush()?;
            write_all(&mut self.file, data)?;
            self.pos += data.len() as u64;
            return Ok(());
        }
        self.buf.extend_from_slice(data);
        if self.buf.len() > PROTO_IOBUF_LEN {
            self.flush()?;
        }
        Ok(())
    }

    /// # Errors
    /// As [`FdBackend::write`].
    pub fn flush(&mut self) -> RioResult<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        write_all(&mut self.file, &self.buf)?;
        self.pos += self.buf.len() as u64;
        self.buf.clear();
        Ok(())
    }

    #[must_use]
    pub const fn tell(&self) -> u64 {
        self.pos
    }

    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

fn write_all(file: &mut File, data: &[u8]) -> RioResult<()> {
    let mut written = 0;
    while written < data.len() {
        match file.write(&data[written..]) {
            Ok(0) => return Err(RioError::Io(io::ErrorKind::WriteZero.into())),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Err(RioError::Io(io::Error::new(io::ErrorKind::TimedOut, e)));
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom};

    #[test]
    fn small_writes_wait_for_flush() {
        let file = tempfile::tempfile().unwrap();
        let mut reader = file.try_clone().unwrap();
        let mut fd = FdBackend::new(OwnedFd::from(file));

        fd.write(b"abc").unwrap();
        assert_eq!(fd.tell(), 0);
        assert_eq!(fd.buffered(), 3);

        let big = vec![7u8; PROTO_IOBUF_LEN + 1];
        fd.write(&big).unwrap();
        assert_eq!(fd.tell(), 3 + big.len() as u64);
        assert_eq!(fd.buffered(), 0);

        reader.seek(SeekFrom::Start(0)).unwrap();
        let mut back = Vec::new();
        reader.read_to_end(&mut back).unwrap();
        assert_eq!(&back[..3], b"abc");
        assert_eq!(back.len(), 3 + big.len());
    }
}
