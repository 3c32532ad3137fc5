//! Buffered file target with optional incremental write-out.

use crate::error::RioResult;
use std::fs::File;
use std::io::{self, BufWriter, Read, Seek, Write};
use std::os::unix::io::AsRawFd;
use tracing::debug;

pub struct FileBackend {
    writer: BufWriter<File>,
    pos: u64,
    /// Start write-out every `autosync` bytes; 0 disables it.
    autosync: u64,
    buffered: u64,
    reclaim_cache: bool,
}

impl std::fmt::Debug for FileBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileBackend")
            .field("pos", &self.pos)
            .field("autosync", &self.autosync)
            .field("reclaim_cache", &self.reclaim_cache)
            .finish_non_exhaustive()
    }
}

impl FileBackend {
    /// # Errors
    /// Returns an error if the current file offset cannot be queried.
    pub fn new(mut file: File) -> RioResult<Self> {
        let pos = file.stream_position()?;
        Ok(Self {
            writer: BufWriter::new(file),
            pos,
            autosync: 0,
            buffered: 0,
            reclaim_cache: false,
        })
    }

    pub fn set_autosync(&mut self, bytes: u64) {
        self.autosync = bytes;
        self.buffered = 0;
    }

    pub fn set_reclaim_cache(&mut self, enabled: bool) {
        self.reclaim_cache = enabled;
    }

    /// # Errors
    /// Returns the underlying I/O error.
    pub fn write(&mut self, buf: &[u8]) -> RioResult<()> {
        if self.autosync == 0 {
            self.writer.write_all(buf)?;
            self.pos += buf.len() as u64;
            return Ok(());
        }

        // Never let more than `autosync` dirty bytes pile up between write-outs.
        let mut done = 0;
        while done < buf.len() {
            let room = usize::try_from(self.autosync - self.buffered).unwrap_or(usize::MAX);
            let n = room.min(buf.len() - done);
            self.writer.write_all(&buf[done..done + n])?;
            done += n;
            self.buffered += n as u64;
            self.pos += n as u64;

            if self.buffered >= self.autosync {
                self.sync_window()?;
                self.buffered = 0;
            }
        }
        Ok(())
    }

    fn sync_window(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        let fd = self.writer.get_ref().as_raw_fd();
        let window = self.autosync as libc::off64_t;
        let end = self.pos as libc::off64_t;

        // Start write-out of the window just filled.
        check(unsafe {
            libc::sync_file_range(fd, end - window, window, libc::SYNC_FILE_RANGE_WRITE)
        })?;

        // Wait for the window before it, so at most two windows are ever unsynced.
        if end >= 2 * window {
            check(unsafe {
                libc::sync_file_range(
                    fd,
                    end - 2 * window,
                    window,
                    libc::SYNC_FILE_RANGE_WAIT_BEFORE
                        | libc::SYNC_FILE_RANGE_WRITE
                        | libc::SYNC_FILE_RANGE_WAIT_AFTER,
                )
            })?;
        }

        if self.reclaim_cache {
            // Dirty pages are skipped; they get another chance after the next window.
            let ret = unsafe { libc::posix_fadvise(fd, 0, 0, libc::POSIX_FADV_DONTNEED) };
            if ret != 0 {
                debug!(error = %io::Error::from_raw_os_error(ret), "page cache reclaim failed");
            }
        }
        Ok(())
    }

    /// Reads exactly `buf.len()` bytes at the current offset.
    ///
    /// # Errors
    /// Returns the underlying I/O error, `UnexpectedEof` included.
    pub fn read(&mut self, buf: &mut [u8]) -> RioResult<()> {
        self.writer.flush()?;
        self.writer.get_mut().read_exact(buf)?;
        self.pos += buf.len() as u64;
        Ok(())
    }

    #[must_use]
    pub const fn tell(&self) -> u64 {
        self.pos
    }

    /// # Errors
    /// Returns the underlying I/O error.
    pub fn flush(&mut self) -> RioResult<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// # Errors
    /// Returns the error of the final flush.
    pub fn into_inner(self) -> RioResult<File> {
        self.writer.into_inner().map_err(|e| e.into_error().into())
    }
}

fn check(ret: libc::c_int) -> io::Result<()> {
    if ret == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::SeekFrom;

    #[test]
    fn autosync_writes_in_windows() {
        let file = tempfile::tempfile().unwrap();
        let mut backend = FileBackend::new(file).unwrap();
        backend.set_autosync(4096);
        backend.set_reclaim_cache(true);

        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 253) as u8).collect();
        backend.write(&data).unwrap();
        assert_eq!(backend.tell(), 10_000);
        assert_eq!(backend.buffered, 10_000 - 2 * 4096);

        let mut file = backend.into_inner().unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        let mut back = Vec::new();
        file.read_to_end(&mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn reads_advance_offset() {
        let file = tempfile::tempfile().unwrap();
        let mut backend = FileBackend::new(file).unwrap();
        backend.write(b"hello world").unwrap();
        backend.flush().unwrap();
        backend.writer.get_mut().seek(SeekFrom::Start(0)).unwrap();
        backend.pos = 0;

        let mut out = [0u8; 5];
        backend.read(&mut out).unwrap();
        assert_eq!(&out, b"hello");
        assert_eq!(backend.tell(), 5);
    }
}
