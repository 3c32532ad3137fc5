#![allow(clippy::cast_possible_truncation)]

//! Descriptor-batching engine.
//!
//! A [`Batch`] owns a ring of descriptor groups. Operations are written into the
//! group currently filling; a full group is sealed and handed to the work queue as
//! one batch descriptor (or directly, when it holds a single descriptor). When every
//! group is in flight, the next submission reclaims a completed group: the oldest one
//! in FIFO mode, or any completed group inside an adaptive window in out-of-order mode.

pub mod config;
pub mod memory;
pub mod recycle;
mod wait;

pub use config::BatchConfig;
pub use recycle::RecycleWindow;

use crate::dsa::WorkQueue;
use crate::dsa::descriptor::{CompletionRecord, CompletionStatus, Descriptor, OpFlags};
use crate::error::{RioError, RioResult};
use crate::pmem::persist;
use crate::utils::{CACHE_LINE, align_gap, page_size};
use memory::DescriptorMemory;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::ptr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupState {
    Free,
    Filling,
    Submitted,
}

#[derive(Debug, Clone, Copy)]
struct Group {
    state: GroupState,
    count: usize,
}

impl Group {
    const FREE: Self = Self {
        state: GroupState::Free,
        count: 0,
    };
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchStats {
    /// Operations handed to the accelerator.
    pub submitted: u64,
    pub groups_submitted: u64,
    /// Operations executed by the CPU instead.
    pub cpu_fallback: u64,
    pub page_faults: u64,
    pub errors: u64,
    pub pretouched_bytes: u64,
    /// Waits that found submitted work to drain.
    pub drains: u64,
    pub accel_bytes: u64,
    pub cpu_bytes: u64,
}

/// A ring of descriptor groups bound to one work queue.
///
/// `'a` is the lifetime of the source buffers handed to [`Batch::submit_move`]; the
/// accelerator reads them after the call returns, so they must outlive the batch.
#[derive(Debug)]
pub struct Batch<'a> {
    queue: Arc<dyn WorkQueue>,
    config: BatchConfig,
    flags: OpFlags,
    memory: DescriptorMemory,
    groups: Vec<Group>,
    free: VecDeque<usize>,
    in_flight: VecDeque<usize>,
    filling: Option<usize>,
    window: RecycleWindow,
    stats: BatchStats,
    deferred: Option<RioError>,
    _sources: PhantomData<&'a [u8]>,
}

impl<'a> Batch<'a> {
    /// Allocates descriptor storage for `config.capacity` groups on `queue`.
    ///
    /// # Errors
    /// Returns `InvalidConfig` for unusable knobs and `OutOfMemory` if the descriptor
    /// memory cannot be mapped.
    pub fn new(queue: Arc<dyn WorkQueue>, config: BatchConfig) -> RioResult<Self> {
        config.validate()?;
        let config = config.normalized();

        if config.group_size > queue.max_batch_size() {
            return Err(RioError::InvalidConfig(format!(
                "group size {} exceeds the batch limit {} of {}",
                config.group_size,
                queue.max_batch_size(),
                queue.name()
            )));
        }

        let memory = DescriptorMemory::allocate(
            config.capacity,
            config.group_size,
            config.contiguous,
            config.huge_pages,
        )?;

        let window = if config.out_of_order_recycle {
            RecycleWindow::new(config.recycle_t_init, config.capacity)
        } else {
            RecycleWindow::fifo()
        };

        debug!(
            queue = queue.name(),
            capacity = config.capacity,
            group_size = config.group_size,
            out_of_order = config.out_of_order_recycle,
            "batch created"
        );

        Ok(Self {
            flags: OpFlags::new(
                config.block_on_fault,
                config.cache_control,
                config.dest_readback,
            ),
            groups: vec![Group::FREE; config.capacity],
            free: (0..config.capacity).collect(),
            in_flight: VecDeque::with_capacity(config.capacity),
            filling: None,
            window,
            stats: BatchStats::default(),
            deferred: None,
            memory,
            queue,
            config,
            _sources: PhantomData,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &BatchConfig {
        &self.config
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<dyn WorkQueue> {
        &self.queue
    }

    #[must_use]
    pub const fn stats(&self) -> BatchStats {
        self.stats
    }

    #[must_use]
    pub const fn recycle_window(&self) -> usize {
        self.window.size()
    }

    /// Groups that are submitted, or filling with at least one descriptor.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        let filling = self
            .filling
            .is_some_and(|g| self.groups[g].count > 0);
        self.in_flight.len() + usize::from(filling)
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.outstanding() == 0
    }

    // ===========================================================================================
    // Submission
    // ===========================================================================================

    /// Copies `src` to `dst`, through the accelerator unless the transfer is short.
    ///
    /// Returns once the operation is enqueued; completion is only guaranteed after
    /// [`Batch::wait`].
    ///
    /// # Errors
    /// Returns an error if a group cannot be submitted, or if reclaiming a group
    /// for reuse fails.
    ///
    /// # Safety
    /// `dst` must be valid for `src.len()` bytes of writes, must not overlap `src`, and
    /// must not be accessed by anyone else until the next successful `wait`.
    pub unsafe fn submit_move(&mut self, dst: *mut u8, src: &'a [u8]) -> RioResult<()> {
        let (dst, src) = unsafe { self.align_head(dst, src) };
        if src.is_empty() {
            return Ok(());
        }

        if self.config.short_to_cpu && src.len() < self.config.short_len {
            unsafe { self.cpu_copy(dst, src) };
            self.stats.cpu_fallback += 1;
            return Ok(());
        }

        if self.config.pretouch && src.len() > self.config.pf_len_limit {
            unsafe { self.pretouch(dst, src.len()) };
        }

        let flags = self.flags.memmove;
        let base = src.as_ptr() as u64;
        self.enqueue_split(dst, src.len(), |d, offset, len| {
            Descriptor::memmove(flags, d, base + offset as u64, len)
        })
    }

    /// Fills `len` bytes at `dst` with the little-endian bytes of `pattern`.
    ///
    /// # Errors
    /// As [`Batch::submit_move`].
    ///
    /// # Safety
    /// `dst` must be valid for `len` bytes of writes until the next successful `wait`.
    pub unsafe fn submit_fill(&mut self, dst: *mut u8, pattern: u64, len: usize) -> RioResult<()> {
        if len == 0 {
            return Ok(());
        }

        if self.config.short_to_cpu && len < self.config.short_len {
            unsafe {
                cpu_fill(dst, pattern, len);
                if self.config.persist_cpu_writes {
                    persist::flush(dst, len);
                }
            }
            self.stats.cpu_fallback += 1;
            self.stats.cpu_bytes += len as u64;
            return Ok(());
        }

        if self.config.pretouch && len > self.config.pf_len_limit {
            unsafe { self.pretouch(dst, len) };
        }

        let flags = self.flags.memfill;
        self.enqueue_split(dst, len, |d, offset, n| {
            // Keep the pattern phase across split descriptors.
            let pattern = pattern.rotate_right(8 * (offset % 8) as u32);
            Descriptor::memfill(flags, d, pattern, n)
        })
    }

    /// Writes back the cache lines covering `[dst, dst + len)`.
    ///
    /// # Errors
    /// As [`Batch::submit_move`].
    ///
    /// # Safety
    /// The range must stay mapped until the next successful `wait`.
    pub unsafe fn submit_cache_flush(&mut self, dst: *mut u8, len: usize) -> RioResult<()> {
        if len == 0 {
            return Ok(());
        }

        if self.config.short_to_cpu && len < self.config.short_len {
            unsafe { persist::flush(dst, len) };
            self.stats.cpu_fallback += 1;
            return Ok(());
        }

        let flags = self.flags.cache_flush;
        self.enqueue_split(dst, len, |d, _, n| Descriptor::cache_flush(flags, d, n))
    }

    unsafe fn align_head(&mut self, dst: *mut u8, src: &'a [u8]) -> (*mut u8, &'a [u8]) {
        if !self.config.align_addresses {
            return (dst, src);
        }
        let head = align_gap(dst as usize, CACHE_LINE).min(src.len());
        if head == 0 {
            return (dst, src);
        }
        let (first, rest) = src.split_at(head);
        unsafe {
            self.cpu_copy(dst, first);
            (dst.add(head), rest)
        }
    }

    unsafe fn cpu_copy(&mut self, dst: *mut u8, src: &[u8]) {
        unsafe { persist::copy_and_flush(dst, src, self.config.persist_cpu_writes) };
        self.stats.cpu_bytes += src.len() as u64;
    }

    /// Faults in the leading destination pages so the accelerator does not stall on them.
    unsafe fn pretouch(&mut self, dst: *mut u8, len: usize) {
        let touch = self.config.pf_touch_len.min(len);
        let page = page_size();
        let mut offset = 0;
        while offset < touch {
            unsafe {
                let p = dst.add(offset);
                ptr::write_volatile(p, ptr::read_volatile(p));
            }
            offset += page - (dst as usize + offset) % page;
        }
        self.stats.pretouched_bytes += touch as u64;
    }

    fn enqueue_split(
        &mut self,
        dst: *mut u8,
        len: usize,
        build: impl Fn(u64, usize, u32) -> Descriptor,
    ) -> RioResult<()> {
        let max = self.queue.max_transfer_size().clamp(1, u32::MAX as usize);
        let mut offset = 0;
        while offset < len {
            let n = (len - offset).min(max);
            self.enqueue(build(dst as u64 + offset as u64, offset, n as u32))?;
            self.stats.accel_bytes += n as u64;
            offset += n;
        }
        Ok(())
    }

    fn enqueue(&mut self, desc: Descriptor) -> RioResult<()> {
        let g = match self.filling {
            Some(g) => g,
            None => {
                let g = self.acquire()?;
                self.filling = Some(g);
                g
            }
        };

        let slot = self.groups[g].count;
        let mem = self.memory.group(g);
        unsafe {
            let record = mem.records.add(slot);
            CompletionRecord::reset(record);
            mem.descs.add(slot).write(desc.with_completion(record));
        }
        self.groups[g].count += 1;
        self.stats.submitted += 1;

        if self.groups[g].count == self.config.group_size {
            self.seal()?;
        }
        Ok(())
    }

    /// Submits the filling group, if any.
    fn seal(&mut self) -> RioResult<()> {
        let Some(g) = self.filling.take() else {
            return Ok(());
        };
        let count = self.groups[g].count;
        if count == 0 {
            self.groups[g] = Group::FREE;
            self.free.push_front(g);
            return Ok(());
        }

        let mem = self.memory.group(g);
        if self.config.mixing && count > 2 {
            interleave(unsafe { std::slice::from_raw_parts_mut(mem.descs, count) });
        }

        let submitted = unsafe {
            if count == 1 {
                self.queue.submit(&*mem.descs)
            } else {
                CompletionRecord::reset(mem.batch_record);
                let batch = Descriptor::batch(mem.descs as u64, count as u32);
                mem.batch_desc.write(batch.with_completion(mem.batch_record));
                self.queue.submit(&*mem.batch_desc)
            }
        };

        if let Err(e) = submitted {
            warn!(queue = self.queue.name(), group = g, error = %e, "group submission failed");
            self.groups[g] = Group::FREE;
            self.free.push_front(g);
            return Err(e);
        }

        self.groups[g].state = GroupState::Submitted;
        self.in_flight.push_back(g);
        self.stats.groups_submitted += 1;
        Ok(())
    }

    // ===========================================================================================
    // Recycling
    // ===========================================================================================

    fn acquire(&mut self) -> RioResult<usize> {
        if self.free.is_empty() {
            self.reclaim_one()?;
        }
        let g = self
            .free
            .pop_front()
            .ok_or_else(|| RioError::Queue("no descriptor group available".into()))?;
        self.groups[g] = Group {
            state: GroupState::Filling,
            count: 0,
        };
        Ok(g)
    }

    fn reclaim_one(&mut self) -> RioResult<()> {
        let scan = self.window.size().min(self.in_flight.len());
        for position in 0..scan {
            let g = self.in_flight[position];
            if self.is_complete(g) {
                self.in_flight.remove(position);
                self.window.hit(position);
                self.retire(g);
                return Ok(());
            }
        }

        let g = *self
            .in_flight
            .front()
            .ok_or_else(|| RioError::Queue("no descriptor group in flight".into()))?;
        unsafe { wait::wait_record(self.completion_of(g), None)? };
        self.in_flight.pop_front();
        self.window.miss();
        self.retire(g);
        Ok(())
    }

    /// The record whose terminal status marks group `g` as finished.
    fn completion_of(&self, g: usize) -> *const CompletionRecord {
        let mem = self.memory.group(g);
        if self.groups[g].count == 1 {
            mem.records.cast_const()
        } else {
            mem.batch_record.cast_const()
        }
    }

    fn is_complete(&self, g: usize) -> bool {
        unsafe { (*self.completion_of(g)).status().is_terminal() }
    }

    /// Inspects a finished group's records and returns it to the free list.
    fn retire(&mut self, g: usize) {
        debug_assert_eq!(self.groups[g].state, GroupState::Submitted);
        let mem = self.memory.group(g);
        let count = self.groups[g].count;

        if count > 1 {
            let record = unsafe { &*mem.batch_record };
            if let CompletionStatus::Error(_) = record.status() {
                // The descriptor list was rejected as a whole and never executed.
                self.stats.errors += 1;
                self.note_fault(RioError::AcceleratorFault {
                    status: record.status_raw(),
                    fault_addr: record.fault_addr,
                    bytes_completed: record.bytes_completed,
                    dst: unsafe { (*mem.descs).dst },
                    len: count as u32,
                });
            }
        }

        for slot in 0..count {
            let desc = unsafe { &*mem.descs.add(slot) };
            let record = unsafe { &*(desc.completion_addr as *const CompletionRecord) };
            let status = record.status();
            match status {
                CompletionStatus::Success | CompletionStatus::Pending => continue,
                CompletionStatus::PageFault { .. } => self.stats.page_faults += 1,
                CompletionStatus::BatchFailed | CompletionStatus::Error(_) => self.stats.errors += 1,
            }
            self.note_fault(RioError::AcceleratorFault {
                status: record.status_raw(),
                fault_addr: record.fault_addr,
                bytes_completed: record.bytes_completed,
                dst: desc.dst,
                len: desc.xfer_size,
            });
        }

        self.groups[g] = Group::FREE;
        self.free.push_back(g);
    }

    fn note_fault(&mut self, fault: RioError) {
        warn!(queue = self.queue.name(), error = %fault, "accelerator operation failed");
        if self.deferred.is_none() {
            self.deferred = Some(fault);
        }
    }

    // ===========================================================================================
    // Completion
    // ===========================================================================================

    /// Submits the filling group and blocks until every submitted group has finished.
    ///
    /// # Errors
    /// Returns the first fault or error reported by any record since the previous
    /// `wait`, after all groups have been drained.
    pub fn wait(&mut self) -> RioResult<()> {
        self.drain_until(None)
    }

    /// As [`Batch::wait`], but gives up after `timeout`.
    ///
    /// # Errors
    /// Returns `WaitTimeout` when groups are still in flight at the deadline; they
    /// stay owned by the queue.
    pub fn wait_timeout(&mut self, timeout: Duration) -> RioResult<()> {
        self.drain_until(Some(Instant::now() + timeout))
    }

    fn drain_until(&mut self, deadline: Option<Instant>) -> RioResult<()> {
        let sealed = self.seal();
        let had_work = !self.in_flight.is_empty();

        while let Some(&g) = self.in_flight.front() {
            unsafe { wait::wait_record(self.completion_of(g), deadline)? };
            self.in_flight.pop_front();
            self.retire(g);
        }

        // CPU-copied fallbacks were flushed but not yet ordered.
        persist::drain();
        if had_work {
            self.stats.drains += 1;
        }

        if let Some(fault) = self.deferred.take() {
            return Err(fault);
        }
        sealed
    }

    pub fn print_stats(&self) {
        let s = &self.stats;
        info!(
            queue = self.queue.name(),
            submitted = s.submitted,
            groups = s.groups_submitted,
            cpu_fallback = s.cpu_fallback,
            page_faults = s.page_faults,
            errors = s.errors,
            pretouched_bytes = s.pretouched_bytes,
            accel_bytes = s.accel_bytes,
            cpu_bytes = s.cpu_bytes,
            drains = s.drains,
            window = self.window.size(),
            "batch statistics"
        );
    }
}

impl Drop for Batch<'_> {
    fn drop(&mut self) {
        if self.is_idle() {
            return;
        }
        if let Err(e) = self.wait() {
            warn!(queue = self.queue.name(), error = %e, "batch dropped with failed operations");
        }
    }
}

/// Orders descriptors longest, shortest, second longest, second shortest, and so on.
fn interleave(list: &mut [Descriptor]) {
    let mut sorted = list.to_vec();
    sorted.sort_by_key(|d| std::cmp::Reverse(d.xfer_size));

    let (mut long, mut short) = (0, sorted.len());
    for (i, slot) in list.iter_mut().enumerate() {
        *slot = if i % 2 == 0 {
            long += 1;
            sorted[long - 1]
        } else {
            short -= 1;
            sorted[short]
        };
    }
}

unsafe fn cpu_fill(dst: *mut u8, pattern: u64, len: usize) {
    let bytes = pattern.to_le_bytes();
    for i in 0..len {
        unsafe { dst.add(i).write(bytes[i % bytes.len()]) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsa::{FaultPolicy, SoftwareQueue, SoftwareQueueConfig};
    use crate::utils::{KB, MB};

    fn queue(config: SoftwareQueueConfig) -> Arc<dyn WorkQueue> {
        Arc::new(SoftwareQueue::new("batch-test", config).unwrap())
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    fn small_config() -> BatchConfig {
        BatchConfig::new()
            .with_capacity(4)
            .with_group_size(4)
            .huge_pages(false)
    }

    #[test]
    fn moves_complete_after_wait() {
        let src = pattern(10 * 8 * KB, 7);
        let mut dst = vec![0u8; src.len()];
        let mut batch = Batch::new(queue(SoftwareQueueConfig::new()), small_config()).unwrap();

        for (i, chunk) in src.chunks(8 * KB).enumerate() {
            unsafe { batch.submit_move(dst.as_mut_ptr().add(i * 8 * KB), chunk).unwrap() };
        }
        batch.wait().unwrap();

        assert_eq!(src, dst);
        let stats = batch.stats();
        assert_eq!(stats.submitted, 10);
        assert_eq!(stats.groups_submitted, 3);
        assert_eq!(stats.cpu_fallback, 0);
        assert!(batch.is_idle());
    }

    #[test]
    fn short_transfers_are_copied_by_the_cpu() {
        let src = pattern(100, 3);
        let mut dst = vec![0u8; 100];
        let mut batch = Batch::new(queue(SoftwareQueueConfig::new()), small_config()).unwrap();

        unsafe { batch.submit_move(dst.as_mut_ptr(), &src).unwrap() };

        assert_eq!(src, dst);
        assert_eq!(batch.stats().cpu_fallback, 1);
        assert_eq!(batch.stats().submitted, 0);
        assert!(batch.is_idle());
    }

    #[test]
    fn back_pressure_recycles_groups() {
        let src = pattern(40 * 4 * KB, 11);
        let mut dst = vec![0u8; src.len()];
        let config = BatchConfig::new()
            .with_capacity(2)
            .with_group_size(2)
            .huge_pages(false);
        let sw = SoftwareQueueConfig::new().with_latency(Duration::from_micros(200));
        let mut batch = Batch::new(queue(sw), config).unwrap();

        for (i, chunk) in src.chunks(4 * KB).enumerate() {
            unsafe { batch.submit_move(dst.as_mut_ptr().add(i * 4 * KB), chunk).unwrap() };
            assert!(batch.outstanding() <= 2);
        }
        batch.wait().unwrap();

        assert_eq!(src, dst);
        assert_eq!(batch.stats().groups_submitted, 20);
    }

    #[test]
    fn out_of_order_recycling_across_engines() {
        let src = pattern(64 * 8 * KB, 5);
        let mut dst = vec![0u8; src.len()];
        let config = BatchConfig::new()
            .with_capacity(6)
            .with_group_size(1)
            .out_of_order_recycle(true, 3)
            .contiguous(false)
            .huge_pages(false);
        let sw = SoftwareQueueConfig::new()
            .with_engines(4)
            .with_latency(Duration::from_micros(100));
        let mut batch = Batch::new(queue(sw), config).unwrap();

        for (i, chunk) in src.chunks(8 * KB).enumerate() {
            unsafe { batch.submit_move(dst.as_mut_ptr().add(i * 8 * KB), chunk).unwrap() };
        }
        batch.wait().unwrap();

        assert_eq!(src, dst);
        assert!((1..=6).contains(&batch.recycle_window()));
    }

    #[test]
    fn fault_is_reported_by_wait() {
        let len = MB;
        let src = pattern(len, 1);
        let config = small_config().pretouch(false);
        let sw = SoftwareQueueConfig::new().with_fault_policy(FaultPolicy::ReportNonResident);
        let region = FreshRegion::new(len);
        let mut batch = Batch::new(queue(sw), config).unwrap();

        unsafe { batch.submit_move(region.ptr, &src).unwrap() };
        let err = batch.wait().unwrap_err();

        assert!(err.is_accelerator_fault());
        assert_eq!(batch.stats().page_faults, 1);
        // The fault is reported once.
        batch.wait().unwrap();
    }

    #[test]
    fn pretouch_prevents_fault() {
        let len = MB;
        let src = pattern(len, 2);
        let config = small_config().with_pretouch_window(128 * KB, len);
        let sw = SoftwareQueueConfig::new().with_fault_policy(FaultPolicy::ReportNonResident);
        let region = FreshRegion::new(len);
        let mut batch = Batch::new(queue(sw), config).unwrap();

        unsafe { batch.submit_move(region.ptr, &src).unwrap() };
        batch.wait().unwrap();

        assert_eq!(batch.stats().pretouched_bytes, len as u64);
        assert_eq!(unsafe { std::slice::from_raw_parts(region.ptr, len) }, &src[..]);
    }

    #[test]
    fn block_on_fault_resolves_fault() {
        let len = 256 * KB;
        let src = pattern(len, 9);
        let config = small_config().pretouch(false).block_on_fault(true);
        let sw = SoftwareQueueConfig::new().with_fault_policy(FaultPolicy::ReportNonResident);
        let region = FreshRegion::new(len);
        let mut batch = Batch::new(queue(sw), config).unwrap();

        unsafe { batch.submit_move(region.ptr, &src).unwrap() };
        batch.wait().unwrap();
        assert_eq!(batch.stats().page_faults, 0);
    }

    #[test]
    fn wait_timeout_leaves_work_in_flight() {
        let src = pattern(64 * KB, 4);
        let mut dst = vec![0u8; src.len()];
        let sw = SoftwareQueueConfig::new().with_latency(Duration::from_millis(200));
        let mut batch = Batch::new(queue(sw), small_config()).unwrap();

        unsafe { batch.submit_move(dst.as_mut_ptr(), &src).unwrap() };
        let err = batch.wait_timeout(Duration::from_millis(1)).unwrap_err();
        assert!(matches!(err, RioError::WaitTimeout));
        assert_eq!(batch.outstanding(), 1);

        batch.wait().unwrap();
        assert_eq!(src, dst);
    }

    #[test]
    fn fill_and_flush_go_through_queue() {
        let mut dst = vec![0u8; 64 * KB];
        let mut batch = Batch::new(queue(SoftwareQueueConfig::new()), small_config()).unwrap();

        unsafe {
            batch
                .submit_fill(dst.as_mut_ptr(), 0x0807_0605_0403_0201, dst.len())
                .unwrap();
            batch.submit_cache_flush(dst.as_mut_ptr(), dst.len()).unwrap();
        }
        batch.wait().unwrap();

        assert!(dst.chunks(8).all(|c| c == [1, 2, 3, 4, 5, 6, 7, 8]));
        assert_eq!(batch.stats().submitted, 2);
    }

    #[test]
    fn split_fill_keeps_pattern_phase() {
        let mut dst = vec![0u8; 20 * KB + 4];
        let sw = SoftwareQueueConfig {
            max_transfer_size: 4 * KB + 3,
            ..SoftwareQueueConfig::new()
        };
        let config = small_config().short_to_cpu(false, 0);
        let mut batch = Batch::new(queue(sw), config).unwrap();

        unsafe {
            batch
                .submit_fill(dst.as_mut_ptr(), 0x0807_0605_0403_0201, dst.len())
                .unwrap();
        }
        batch.wait().unwrap();

        assert!(dst.iter().enumerate().all(|(i, b)| *b as usize == i % 8 + 1));
    }

    #[test]
    fn aligned_head_is_cpu_copied() {
        let src = pattern(16 * KB, 6);
        let mut dst = vec![0u8; 16 * KB + 128];
        let base = dst.as_mut_ptr();
        let offset = 64 - (base as usize % 64) + 5;
        let config = small_config().align_addresses(true);
        let mut batch = Batch::new(queue(SoftwareQueueConfig::new()), config).unwrap();

        unsafe { batch.submit_move(base.add(offset), &src).unwrap() };
        batch.wait().unwrap();

        assert_eq!(&dst[offset..offset + src.len()], &src[..]);
        assert_eq!(batch.stats().cpu_bytes, 59);
    }

    #[test]
    fn oversized_group_is_rejected() {
        let sw = SoftwareQueueConfig::new().with_max_batch_size(8);
        let err = Batch::new(queue(sw), small_config().with_group_size(16)).unwrap_err();
        assert!(matches!(err, RioError::InvalidConfig(_)));
    }

    #[test]
    fn interleave_alternates_long_and_short() {
        let mut list: Vec<Descriptor> = [10u32, 40, 20, 30, 50]
            .iter()
            .map(|len| Descriptor::memmove(0, 0, 0, *len))
            .collect();
        interleave(&mut list);
        let order: Vec<u32> = list.iter().map(|d| d.xfer_size).collect();
        assert_eq!(order, [50, 10, 40, 20, 30]);
    }

    /// An anonymous mapping none of whose pages have been touched yet.
    struct FreshRegion {
        ptr: *mut u8,
        len: usize,
    }

    impl FreshRegion {
        fn new(len: usize) -> Self {
            let ptr = unsafe {
                libc::mmap(
                    ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
            assert_ne!(ptr, libc::MAP_FAILED);
            Self {
                ptr: ptr.cast(),
                len,
            }
        }
    }

    impl Drop for FreshRegion {
        fn drop(&mut self) {
            unsafe { libc::munmap(self.ptr.cast(), self.len) };
        }
    }
}
