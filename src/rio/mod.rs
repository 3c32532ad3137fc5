//! Byte streams over interchangeable targets.
//!
//! A [`Stream`] adds what every target shares: an optional running checksum,
//! splitting of large transfers into bounded pieces, a processed-bytes counter, and
//! sticky error flags. A direction that failed once refuses further operations.

pub mod buffer;
pub mod checksum;
pub mod conn;
pub mod fd;
pub mod file;
pub mod proto;

pub use buffer::BufferBackend;
pub use conn::ConnBackend;
pub use fd::FdBackend;
pub use file::FileBackend;

use crate::dsa::WorkQueue;
use crate::error::{RioError, RioResult};
use crate::pmem::{PmemConfig, PmemFile};
use std::fs::File;
use std::io::Read;
use std::os::fd::OwnedFd;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Checksum update hook: previous value and the bytes just transferred.
pub type ChecksumFn = fn(u64, &[u8]) -> u64;

#[derive(Debug)]
pub enum Backend<'a> {
    Buffer(BufferBackend),
    File(FileBackend),
    Conn(ConnBackend),
    Fd(FdBackend),
    Pmem(PmemFile<'a>),
}

impl<'a> Backend<'a> {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Buffer(_) => "buffer",
            Self::File(_) => "file",
            Self::Conn(_) => "connection",
            Self::Fd(_) => "fd",
            Self::Pmem(_) => "pmem",
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> RioResult<()> {
        match self {
            Self::Buffer(b) => b.read(buf),
            Self::File(f) => f.read(buf),
            Self::Conn(c) => c.read(buf),
            Self::Fd(_) | Self::Pmem(_) => Err(RioError::ReadUnsupported(self.kind())),
        }
    }

    fn write(&mut self, buf: &'a [u8]) -> RioResult<()> {
        match self {
            Self::Pmem(p) => p.write(buf),
            _ => self.write_copied(buf),
        }
    }

    fn write_copied(&mut self, buf: &[u8]) -> RioResult<()> {
        match self {
            Self::Buffer(b) => {
                b.write(buf);
                Ok(())
            }
            Self::File(f) => f.write(buf),
            Self::Conn(_) => Err(RioError::WriteUnsupported(self.kind())),
            Self::Fd(f) => f.write(buf),
            Self::Pmem(p) => p.write_copied(buf),
        }
    }

    fn tell(&self) -> u64 {
        match self {
            Self::Buffer(b) => b.tell(),
            Self::File(f) => f.tell(),
            Self::Conn(c) => c.tell(),
            Self::Fd(f) => f.tell(),
            Self::Pmem(p) => p.tell(),
        }
    }

    fn flush(&mut self) -> RioResult<()> {
        match self {
            Self::Buffer(_) => Ok(()),
            Self::File(f) => f.flush(),
            Self::Conn(_) => Err(RioError::WriteUnsupported(self.kind())),
            Self::Fd(f) => f.flush(),
            Self::Pmem(p) => p.flush(),
        }
    }
}

/// A stream over one [`Backend`].
///
/// `'a` is the lifetime of buffers handed to [`Stream::write`]. The PMEM target may
/// still be copying from them after `write` returns, until the next `flush`.
#[derive(Debug)]
pub struct Stream<'a> {
    backend: Backend<'a>,
    update_checksum: Option<ChecksumFn>,
    checksum: u64,
    processed_bytes: u64,
    /// 0 means transfers are not split.
    max_processing_chunk: usize,
    read_error: bool,
    write_error: bool,
}

impl<'a> Stream<'a> {
    #[must_use]
    pub const fn new(backend: Backend<'a>) -> Self {
        Self {
            backend,
            update_checksum: None,
            checksum: 0,
            processed_bytes: 0,
            max_processing_chunk: 0,
            read_error: false,
            write_error: false,
        }
    }

    #[must_use]
    pub const fn with_buffer(data: Vec<u8>) -> Self {
        Self::new(Backend::Buffer(BufferBackend::new(data)))
    }

    /// # Errors
    /// Returns an error if the file offset cannot be queried.
    pub fn with_file(file: File) -> RioResult<Self> {
        Ok(Self::new(Backend::File(FileBackend::new(file)?)))
    }

    /// Read-only stream over `reader`; `read_limit` of 0 means unlimited.
    #[must_use]
    pub fn with_conn<R: Read + Send + 'static>(reader: R, read_limit: usize) -> Self {
        Self::new(Backend::Conn(ConnBackend::new(Box::new(reader), read_limit)))
    }

    #[must_use]
    pub fn with_fd(fd: OwnedFd) -> Self {
        Self::new(Backend::Fd(FdBackend::new(fd)))
    }

    /// Write-only stream into a new persistent-memory file.
    ///
    /// # Errors
    /// As [`PmemFile::open`].
    pub fn with_pmem<P: AsRef<Path>>(
        path: P,
        config: PmemConfig,
        queue: Option<Arc<dyn WorkQueue>>,
    ) -> RioResult<Self> {
        Ok(Self::new(Backend::Pmem(PmemFile::open(path, config, queue)?)))
    }

    #[must_use]
    pub const fn backend(&self) -> &Backend<'a> {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut Backend<'a> {
        &mut self.backend
    }

    // ===========================================================================================
    // Generic knobs
    // ===========================================================================================

    /// Installs (or removes) the checksum hook and restarts the running value.
    pub fn set_checksum(&mut self, update: Option<ChecksumFn>) {
        self.update_checksum = update;
        self.checksum = 0;
    }

    /// Shorthand for the CRC-64 hook used by RDB payloads.
    pub fn enable_crc64(&mut self) {
        self.set_checksum(Some(checksum::crc64));
    }

    #[must_use]
    pub const fn checksum(&self) -> u64 {
        self.checksum
    }

    pub fn set_max_processing_chunk(&mut self, bytes: usize) {
        self.max_processing_chunk = bytes;
    }

    #[must_use]
    pub const fn processed_bytes(&self) -> u64 {
        self.processed_bytes
    }

    #[must_use]
    pub const fn has_read_error(&self) -> bool {
        self.read_error
    }

    #[must_use]
    pub const fn has_write_error(&self) -> bool {
        self.write_error
    }

    pub fn clear_errors(&mut self) {
        self.read_error = false;
        self.write_error = false;
    }

    /// Starts incremental write-out every `bytes` bytes. Only file streams support it.
    pub fn set_autosync(&mut self, bytes: u64) {
        match &mut self.backend {
            Backend::File(f) => f.set_autosync(bytes),
            other => debug!(kind = other.kind(), "autosync ignored"),
        }
    }

    /// Drops written pages from the page cache after each autosync window.
    pub fn set_reclaim_cache(&mut self, enabled: bool) {
        match &mut self.backend {
            Backend::File(f) => f.set_reclaim_cache(enabled),
            other => debug!(kind = other.kind(), "page cache reclaim ignored"),
        }
    }

    const fn piece(&self, remaining: usize) -> usize {
        if self.max_processing_chunk == 0 || remaining < self.max_processing_chunk {
            remaining
        } else {
            self.max_processing_chunk
        }
    }

    // ===========================================================================================
    // Operations
    // ===========================================================================================

    /// Fills `buf` completely.
    ///
    /// # Errors
    /// Any failure latches the read side; later reads return `StreamBroken`.
    pub fn read(&mut self, buf: &mut [u8]) -> RioResult<usize> {
        if self.read_error {
            return Err(RioError::StreamBroken);
        }

        let mut done = 0;
        while done < buf.len() {
            let n = self.piece(buf.len() - done);
            let piece = &mut buf[done..done + n];
            if let Err(e) = self.backend.read(piece) {
                self.read_error = true;
                warn!(kind = self.backend.kind(), error = %e, "stream read failed");
                return Err(e);
            }
            if let Some(update) = self.update_checksum {
                self.checksum = update(self.checksum, piece);
            }
            self.processed_bytes += n as u64;
            done += n;
        }
        Ok(buf.len())
    }

    /// Writes all of `buf`.
    ///
    /// # Errors
    /// Any failure latches the write side; later writes return `StreamBroken`.
    pub fn write(&mut self, buf: &'a [u8]) -> RioResult<usize> {
        self.write_pieces(buf, |backend, piece| backend.write(piece))
    }

    /// Writes a buffer that does not outlive the call. Accelerated targets copy it
    /// with the CPU instead.
    ///
    /// # Errors
    /// As [`Stream::write`].
    pub fn write_copied(&mut self, buf: &[u8]) -> RioResult<usize> {
        self.write_pieces(buf, Backend::write_copied)
    }

    fn write_pieces<'b>(
        &mut self,
        buf: &'b [u8],
        mut op: impl FnMut(&mut Backend<'a>, &'b [u8]) -> RioResult<()>,
    ) -> RioResult<usize> {
        if self.write_error {
            return Err(RioError::StreamBroken);
        }

        let mut done = 0;
        while done < buf.len() {
            let n = self.piece(buf.len() - done);
            let piece = &buf[done..done + n];
            if let Err(e) = op(&mut self.backend, piece) {
                self.write_error = true;
                warn!(kind = self.backend.kind(), error = %e, "stream write failed");
                return Err(e);
            }
            if let Some(update) = self.update_checksum {
                self.checksum = update(self.checksum, piece);
            }
            self.processed_bytes += n as u64;
            done += n;
        }
        Ok(buf.len())
    }

    #[must_use]
    pub fn tell(&self) -> u64 {
        self.backend.tell()
    }

    /// # Errors
    /// Returns the target's flush error; connection streams always fail.
    pub fn flush(&mut self) -> RioResult<()> {
        self.backend.flush().inspect_err(|e| {
            warn!(kind = self.backend.kind(), error = %e, "stream flush failed");
        })
    }

    /// Flushes pending output and releases the target.
    ///
    /// # Errors
    /// Returns the first failure of the final flush or of the PMEM close.
    pub fn close(self) -> RioResult<()> {
        match self.backend {
            Backend::Buffer(_) | Backend::Conn(_) => Ok(()),
            Backend::File(f) => f.into_inner().map(drop),
            Backend::Fd(mut f) => f.flush(),
            Backend::Pmem(p) => p.close(),
        }
    }

    /// The written bytes of a buffer stream.
    #[must_use]
    pub fn into_buffer(self) -> Option<Vec<u8>> {
        match self.backend {
            Backend::Buffer(b) => Some(b.into_inner()),
            _ => None,
        }
    }

    /// Bytes a connection stream read ahead but never handed out.
    #[must_use]
    pub fn into_remaining(self) -> Option<Vec<u8>> {
        match self.backend {
            Backend::Conn(c) => Some(c.into_remaining()),
            _ => None,
        }
    }
}
