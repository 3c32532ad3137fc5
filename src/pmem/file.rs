//! Append-only writer over a memory-mapped persistent-memory file.
//!
//! Small writes are coalesced in a cache-line aligned staging buffer and copied by
//! the CPU. Large writes are split so that the accelerated part starts on a 64-byte
//! file offset, then handed to the [`Batch`] engine. The mapping grows in fixed
//! increments; growing drains the accelerator first so that no in-flight descriptor
//! targets the old mapping.

use super::persist;
use super::staging::StagingBuffer;
use crate::batch::{Batch, BatchConfig, BatchStats};
use crate::dsa::WorkQueue;
use crate::error::{RioError, RioResult};
use crate::stats::CopySizeStats;
use crate::utils::{CACHE_LINE, KB, MB, align_gap, round_up_to};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const DEFAULT_GROWTH: usize = 256 * MB;
pub const DEFAULT_STAGING_SIZE: usize = 16 * KB;
pub const DEFAULT_DIRECT_THRESHOLD: usize = CACHE_LINE;

#[derive(Debug, Clone)]
pub struct PmemConfig {
    /// The mapping grows in multiples of this many bytes.
    pub growth: usize,
    pub staging_size: usize,
    /// Writes up to this size are staged rather than appended directly.
    pub direct_threshold: usize,
    pub batch: BatchConfig,
    pub copy_stats: Option<Arc<CopySizeStats>>,
}

impl Default for PmemConfig {
    fn default() -> Self {
        Self {
            growth: DEFAULT_GROWTH,
            staging_size: DEFAULT_STAGING_SIZE,
            direct_threshold: DEFAULT_DIRECT_THRESHOLD,
            batch: BatchConfig::default(),
            copy_stats: None,
        }
    }
}

impl PmemConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_growth(mut self, growth: usize) -> Self {
        self.growth = growth;
        self
    }

    #[must_use]
    pub const fn with_staging_size(mut self, size: usize) -> Self {
        self.staging_size = size;
        self
    }

    #[must_use]
    pub const fn with_direct_threshold(mut self, threshold: usize) -> Self {
        self.direct_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }

    #[must_use]
    pub fn with_copy_stats(mut self, stats: Arc<CopySizeStats>) -> Self {
        self.copy_stats = Some(stats);
        self
    }
}

/// A growable persistent-memory file written through the CPU and, optionally, an accelerator.
///
/// `'a` bounds the buffers passed to [`PmemFile::write`]: accelerated copies read
/// them after `write` returns.
pub struct PmemFile<'a> {
    path: PathBuf,
    file: File,
    /// `None` once the handle is closed or a remap failed.
    base: Option<NonNull<u8>>,
    file_size: usize,
    used_size: usize,
    /// Bytes already covered by `msync` on non-PMEM mappings.
    synced: usize,
    is_pmem: bool,
    staging: StagingBuffer,
    batch: Option<Batch<'a>>,
    config: PmemConfig,
    closed: bool,
}

unsafe impl Send for PmemFile<'_> {}

impl std::fmt::Debug for PmemFile<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PmemFile")
            .field("path", &self.path)
            .field("file_size", &self.file_size)
            .field("used_size", &self.used_size)
            .field("staged", &self.staging.len())
            .field("is_pmem", &self.is_pmem)
            .field("accelerated", &self.batch.is_some())
            .finish_non_exhaustive()
    }
}

impl<'a> PmemFile<'a> {
    /// Creates (or truncates) the file at `path` and maps its first growth increment.
    ///
    /// With a `queue`, large writes are offloaded to it through a [`Batch`].
    ///
    /// # Errors
    /// Returns an error if the file cannot be created or mapped, or if the batch
    /// cannot be set up.
    pub fn open<P: AsRef<Path>>(
        path: P,
        config: PmemConfig,
        queue: Option<Arc<dyn WorkQueue>>,
    ) -> RioResult<Self> {
        let path = path.as_ref();
        if config.growth == 0 {
            return Err(RioError::InvalidConfig("growth increment must be non-zero".into()));
        }

        let staging = StagingBuffer::new(config.staging_size)?;
        let batch = match queue {
            Some(queue) => {
                info!(path = %path.display(), queue = queue.name(), "accelerator enabled for pmem file");
                Some(Batch::new(queue, config.batch.clone())?)
            }
            None => None,
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .inspect_err(|e| warn!(path = %path.display(), error = %e, "pmem file open failed"))?;

        let file_size = config.growth;
        file.set_len(file_size as u64).map_err(|source| RioError::Extend {
            path: path.to_path_buf(),
            size: file_size,
            source,
        })?;
        let (base, is_pmem) = map(&file, path, file_size)?;

        debug!(path = %path.display(), file_size, is_pmem, "pmem file mapped");

        Ok(Self {
            path: path.to_path_buf(),
            file,
            base: Some(base),
            file_size,
            used_size: 0,
            synced: 0,
            is_pmem,
            staging,
            batch,
            config,
            closed: false,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn file_size(&self) -> usize {
        self.file_size
    }

    /// Bytes appended to the mapping, excluding what is still staged.
    #[must_use]
    pub const fn used_size(&self) -> usize {
        self.used_size
    }

    #[must_use]
    pub const fn staged(&self) -> usize {
        self.staging.len()
    }

    #[must_use]
    pub const fn is_pmem(&self) -> bool {
        self.is_pmem
    }

    #[must_use]
    pub const fn is_broken(&self) -> bool {
        self.base.is_none()
    }

    #[must_use]
    pub fn batch_stats(&self) -> Option<BatchStats> {
        self.batch.as_ref().map(Batch::stats)
    }

    /// Logical stream offset: appended plus staged bytes.
    #[must_use]
    pub fn tell(&self) -> u64 {
        (self.used_size + self.staging.len()) as u64
    }

    fn mapping(&self) -> RioResult<NonNull<u8>> {
        self.base.ok_or(RioError::StreamBroken)
    }

    // ===========================================================================================
    // Growth
    // ===========================================================================================

    /// Grows the mapping so that `min_extra` more bytes fit after `used_size`.
    ///
    /// # Errors
    /// Accelerator faults drained before the remap are returned with the handle intact.
    /// A failure to resize or remap leaves the handle broken; later operations return
    /// `StreamBroken`.
    pub fn extend(&mut self, min_extra: usize) -> RioResult<()> {
        let base = self.mapping()?;
        let new_size = round_up_to(self.used_size + min_extra, self.config.growth);
        if new_size <= self.file_size {
            return Ok(());
        }

        let result = self.remap(base, new_size);
        if let Err(e) = &result {
            warn!(path = %self.path.display(), new_size, error = %e, "pmem file extend failed");
        }
        result
    }

    fn remap(&mut self, base: NonNull<u8>, new_size: usize) -> RioResult<()> {
        // A failed drain keeps the old mapping; it stays valid and owned.
        match self.batch.as_mut() {
            Some(batch) => {
                batch.wait()?;
                if !batch.is_idle() {
                    return Err(RioError::Queue("accelerator work still in flight".into()));
                }
            }
            None => persist::drain(),
        }

        unsafe { libc::munmap(base.as_ptr().cast(), self.file_size) };
        self.base = None;

        self.file
            .set_len(new_size as u64)
            .map_err(|source| RioError::Extend {
                path: self.path.clone(),
                size: new_size,
                source,
            })?;
        let (base, is_pmem) = map(&self.file, &self.path, new_size)?;

        debug!(
            path = %self.path.display(),
            old_size = self.file_size,
            new_size,
            "pmem file extended"
        );
        self.base = Some(base);
        self.file_size = new_size;
        self.is_pmem = is_pmem;
        Ok(())
    }

    /// Destination pointer for `len` bytes at `used_size`, growing the file first if needed.
    fn reserve(&mut self, len: usize) -> RioResult<*mut u8> {
        if self.used_size + len > self.file_size {
            self.extend(len)?;
        }
        let base = self.mapping()?;
        Ok(unsafe { base.as_ptr().add(self.used_size) })
    }

    // ===========================================================================================
    // Writing
    // ===========================================================================================

    /// Appends `data` at `used_size`, through the accelerator unless `prefer_cpu` is set.
    ///
    /// # Errors
    /// Returns an error if the file cannot grow or the operation cannot be submitted.
    pub fn append(&mut self, data: &'a [u8], prefer_cpu: bool) -> RioResult<()> {
        if prefer_cpu || self.batch.is_none() {
            return self.append_cpu(data);
        }

        let dst = self.reserve(data.len())?;
        if let Some(batch) = self.batch.as_mut() {
            unsafe { batch.submit_move(dst, data)? };
        }
        self.used_size += data.len();
        Ok(())
    }

    fn append_cpu(&mut self, data: &[u8]) -> RioResult<()> {
        let dst = self.reserve(data.len())?;
        unsafe { persist::copy_and_flush(dst, data, true) };
        self.note_cpu_copy(data.len());
        self.used_size += data.len();
        Ok(())
    }

    fn flush_staging(&mut self) -> RioResult<()> {
        let len = self.staging.len();
        if len == 0 {
            return Ok(());
        }
        let dst = self.reserve(len)?;
        unsafe { persist::copy_and_flush(dst, self.staging.as_slice(), true) };
        self.note_cpu_copy(len);
        self.used_size += len;
        self.staging.clear();
        Ok(())
    }

    fn note_cpu_copy(&self, len: usize) {
        if let Some(stats) = &self.config.copy_stats {
            stats.record(len);
        }
    }

    /// Writes `buf` at the current stream offset.
    ///
    /// # Errors
    /// Failures are wrapped in `Write` with the file path.
    pub fn write(&mut self, buf: &'a [u8]) -> RioResult<()> {
        self.write_inner(buf).map_err(|e| self.write_error(e))
    }

    fn write_inner(&mut self, buf: &'a [u8]) -> RioResult<()> {
        self.mapping()?;

        if buf.len() <= self.config.direct_threshold {
            return self.stage(buf);
        }

        // Stage just enough to put the direct part on a cache-line file offset.
        let head = align_gap(self.tell() as usize, CACHE_LINE).min(buf.len());
        let (head, tail) = buf.split_at(head);
        let staged = self.staging.push(head);
        debug_assert_eq!(staged, head.len());
        self.flush_staging()?;
        self.append(tail, false)
    }

    /// Writes a buffer that is not kept alive past the call; it is always copied by the CPU.
    ///
    /// # Errors
    /// Failures are wrapped in `Write` with the file path.
    pub fn write_copied(&mut self, buf: &[u8]) -> RioResult<()> {
        self.write_copied_inner(buf)
            .map_err(|e| self.write_error(e))
    }

    fn write_copied_inner(&mut self, buf: &[u8]) -> RioResult<()> {
        self.mapping()?;
        if buf.len() <= self.config.direct_threshold {
            return self.stage(buf);
        }
        self.flush_staging()?;
        self.append_cpu(buf)
    }

    fn stage(&mut self, buf: &[u8]) -> RioResult<()> {
        let mut rest = buf;
        while !rest.is_empty() {
            let n = self.staging.push(rest);
            rest = &rest[n..];
            if self.staging.needs_flush() {
                self.flush_staging()?;
            }
        }
        Ok(())
    }

    fn write_error(&self, source: RioError) -> RioError {
        warn!(path = %self.path.display(), error = %source, "pmem write failed");
        RioError::Write {
            path: self.path.clone(),
            source: Box::new(source),
        }
    }

    /// Makes every byte written so far durable.
    ///
    /// # Errors
    /// Accelerator faults and `msync` failures are wrapped in `Write`.
    pub fn flush(&mut self) -> RioResult<()> {
        self.flush_inner().map_err(|e| self.write_error(e))
    }

    fn flush_inner(&mut self) -> RioResult<()> {
        self.flush_staging()?;
        persist::drain();
        if let Some(batch) = self.batch.as_mut() {
            batch.wait()?;
        }

        if !self.is_pmem && self.used_size > self.synced {
            let base = self.mapping()?;
            unsafe { persist::msync(base.as_ptr(), self.synced, self.used_size - self.synced)? };
            self.synced = self.used_size;
        }
        Ok(())
    }

    /// Flushes, unmaps, and truncates the file to the bytes written.
    ///
    /// # Errors
    /// Returns the first failure; the file is truncated and synced regardless.
    pub fn close(mut self) -> RioResult<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> RioResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let flushed = if self.base.is_some() {
            self.flush()
        } else {
            Ok(())
        };

        if let Some(batch) = self.batch.take() {
            batch.print_stats();
        }
        if let Some(base) = self.base.take() {
            unsafe { libc::munmap(base.as_ptr().cast(), self.file_size) };
        }

        let truncated = self
            .file
            .set_len(self.used_size as u64)
            .and_then(|()| self.file.sync_all());
        if let Err(e) = &truncated {
            warn!(path = %self.path.display(), error = %e, "pmem file shrink failed");
        }

        debug!(path = %self.path.display(), used_size = self.used_size, "pmem file closed");
        flushed?;
        truncated.map_err(RioError::from)
    }
}

impl Drop for PmemFile<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(path = %self.path.display(), error = %e, "pmem file close on drop failed");
        }
    }
}

/// Maps `len` bytes of `file`, preferring a synchronous DAX mapping.
fn map(file: &File, path: &Path, len: usize) -> RioResult<(NonNull<u8>, bool)> {
    let fd = file.as_raw_fd();
    let prot = libc::PROT_READ | libc::PROT_WRITE;

    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            prot,
            libc::MAP_SHARED_VALIDATE | libc::MAP_SYNC,
            fd,
            0,
        )
    };
    if ptr != libc::MAP_FAILED {
        return NonNull::new(ptr.cast::<u8>())
            .map(|p| (p, true))
            .ok_or_else(|| RioError::Queue("mmap returned null".into()));
    }

    let ptr = unsafe { libc::mmap(std::ptr::null_mut(), len, prot, libc::MAP_SHARED, fd, 0) };
    if ptr == libc::MAP_FAILED {
        let source = io::Error::last_os_error();
        warn!(path = %path.display(), error = %source, "pmem file map failed");
        return Err(RioError::Map {
            path: path.to_path_buf(),
            source,
        });
    }
    NonNull::new(ptr.cast::<u8>())
        .map(|p| (p, false))
        .ok_or_else(|| RioError::Queue("mmap returned null".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsa::{SoftwareQueue, SoftwareQueueConfig};

    fn cpu_only() -> PmemConfig {
        PmemConfig::new().with_growth(64 * KB)
    }

    #[test]
    fn small_writes_are_staged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("staged.pm");
        let data = [5u8; 40];

        let mut file = PmemFile::open(&path, cpu_only(), None).unwrap();
        file.write(&data).unwrap();
        assert_eq!(file.staged(), 40);
        assert_eq!(file.used_size(), 0);
        assert_eq!(file.tell(), 40);

        file.flush().unwrap();
        assert_eq!(file.staged(), 0);
        assert_eq!(file.used_size(), 40);
        file.close().unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), data);
    }

    #[test]
    fn large_write_starts_direct_part_aligned() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aligned.pm");
        let small = [1u8; 10];
        let large = vec![2u8; 1000];

        let mut file = PmemFile::open(&path, cpu_only(), None).unwrap();
        file.write(&small).unwrap();
        file.write(&large).unwrap();

        // 54 bytes of the large write were staged to reach offset 64.
        assert_eq!(file.staged(), 0);
        assert_eq!(file.used_size(), 1010);
        file.close().unwrap();

        let content = std::fs::read(&path).unwrap();
        assert_eq!(&content[..10], &small);
        assert_eq!(&content[10..], &large[..]);
    }

    #[test]
    fn staging_drains_before_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drain.pm");
        let chunk = [9u8; 64];
        let config = cpu_only().with_staging_size(256);

        let mut file = PmemFile::open(&path, config, None).unwrap();
        for _ in 0..3 {
            file.write(&chunk).unwrap();
        }
        assert_eq!(file.used_size(), 192);
        assert_eq!(file.staged(), 0);
        file.write(&chunk).unwrap();
        assert_eq!(file.staged(), 64);
    }

    #[test]
    fn growth_rounds_to_increment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grow.pm");
        let data = vec![3u8; 150 * KB];

        let mut file = PmemFile::open(&path, cpu_only(), None).unwrap();
        assert_eq!(file.file_size(), 64 * KB);
        file.write(&data).unwrap();
        assert_eq!(file.file_size(), 192 * KB);
        assert_eq!(file.file_size() % (64 * KB), 0);
        assert!(file.used_size() <= file.file_size());
    }

    #[test]
    fn copy_stats_count_cpu_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.pm");
        let stats = Arc::new(CopySizeStats::new());
        let data = vec![4u8; 2000];

        let mut file =
            PmemFile::open(&path, cpu_only().with_copy_stats(stats.clone()), None).unwrap();
        file.write(&data).unwrap();
        file.write(b"tail").unwrap();
        file.flush().unwrap();

        let snap = stats.snapshot();
        assert_eq!(snap.calls, 2);
        assert_eq!(snap.bytes, 2004);
    }

    #[test]
    fn drop_truncates_to_used_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drop.pm");
        let data = vec![6u8; 300];
        {
            let mut file = PmemFile::open(&path, cpu_only(), None).unwrap();
            file.write(&data).unwrap();
        }
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 300);
    }

    #[test]
    fn accelerated_append_counts_in_batch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accel.pm");
        let data = vec![7u8; 256 * KB];
        let queue: Arc<dyn WorkQueue> =
            Arc::new(SoftwareQueue::new("pmem", SoftwareQueueConfig::new()).unwrap());
        let config = PmemConfig::new()
            .with_growth(MB)
            .with_batch(BatchConfig::new().huge_pages(false));

        let mut file = PmemFile::open(&path, config, Some(queue)).unwrap();
        file.append(&data, false).unwrap();
        assert_eq!(file.batch_stats().unwrap().submitted, 1);
        file.close().unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), data);
    }
}
