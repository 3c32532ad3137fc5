#![allow(clippy::cast_possible_truncation)]

//! A work queue whose engines are host threads.
//!
//! `SoftwareQueue` honours the same contract as a hardware queue: descriptors are
//! copied at submission, executed asynchronously, and completion is published only
//! through completion records. With more than one engine, descriptors finish out of
//! submission order, exactly like groups spread over several hardware engines.

use super::WorkQueue;
use super::descriptor::{
    CompletionRecord, Descriptor, FLAG_BLOCK_ON_FAULT, FLAG_COMPLETION_ADDR_VALID,
    FLAG_DEST_READBACK, Opcode, STATUS_BAD_OPCODE, STATUS_BATCH_FAIL, STATUS_DESC_CNT_ERANGE,
    STATUS_PAGE_FAULT_NOBOF, STATUS_SUCCESS, STATUS_WRITE_FAULT, STATUS_XFER_ERANGE,
};
use crate::error::{RioError, RioResult};
use crate::pmem::persist;
use crate::utils::{align_down, page_size};
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// How an engine reacts to a destination page that is not resident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FaultPolicy {
    /// Faults are resolved transparently, as with page-request service enabled.
    #[default]
    Resolve,
    /// Without block-on-fault, a non-resident destination page ends the operation with a
    /// partial completion and a page-fault status.
    ReportNonResident,
}

#[derive(Debug, Clone)]
pub struct SoftwareQueueConfig {
    pub engines: usize,
    pub fault_policy: FaultPolicy,
    /// Artificial per-descriptor execution delay.
    pub latency: Duration,
    pub max_transfer_size: usize,
    pub max_batch_size: usize,
}

impl Default for SoftwareQueueConfig {
    fn default() -> Self {
        Self {
            engines: 1,
            fault_policy: FaultPolicy::Resolve,
            latency: Duration::ZERO,
            max_transfer_size: 1 << 31,
            max_batch_size: 1024,
        }
    }
}

impl SoftwareQueueConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_engines(mut self, engines: usize) -> Self {
        self.engines = engines;
        self
    }

    #[must_use]
    pub const fn with_fault_policy(mut self, policy: FaultPolicy) -> Self {
        self.fault_policy = policy;
        self
    }

    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    #[must_use]
    pub const fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }
}

#[derive(Debug, Default)]
struct EngineCounters {
    executed: AtomicU64,
    faults: AtomicU64,
}

pub struct SoftwareQueue {
    name: String,
    config: SoftwareQueueConfig,
    sender: Mutex<Option<Sender<Descriptor>>>,
    workers: Vec<JoinHandle<()>>,
    counters: Arc<EngineCounters>,
}

impl fmt::Debug for SoftwareQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftwareQueue")
            .field("name", &self.name)
            .field("engines", &self.workers.len())
            .field("fault_policy", &self.config.fault_policy)
            .finish_non_exhaustive()
    }
}

impl SoftwareQueue {
    /// Starts `config.engines` engine threads.
    ///
    /// # Errors
    /// Returns an error if the configuration is empty or a thread cannot be spawned.
    pub fn new(name: &str, config: SoftwareQueueConfig) -> RioResult<Self> {
        if config.engines == 0 {
            return Err(RioError::InvalidConfig("at least one engine is required".into()));
        }

        let (sender, receiver) = mpsc::channel::<Descriptor>();
        let receiver = Arc::new(Mutex::new(receiver));
        let counters = Arc::new(EngineCounters::default());

        let mut workers = Vec::with_capacity(config.engines);
        for engine_id in 0..config.engines {
            let receiver = receiver.clone();
            let counters = counters.clone();
            let engine_config = config.clone();
            let handle = thread::Builder::new()
                .name(format!("{name}-engine{engine_id}"))
                .spawn(move || run_engine(&receiver, &engine_config, &counters))?;
            workers.push(handle);
        }

        debug!(queue = name, engines = config.engines, "software work queue started");

        Ok(Self {
            name: name.to_string(),
            config,
            sender: Mutex::new(Some(sender)),
            workers,
            counters,
        })
    }

    /// A single-engine queue with default settings.
    ///
    /// # Errors
    /// Returns an error if the engine thread cannot be spawned.
    pub fn with_defaults(name: &str) -> RioResult<Self> {
        Self::new(name, SoftwareQueueConfig::default())
    }

    /// Descriptors executed so far, batch descriptors included.
    #[must_use]
    pub fn executed(&self) -> u64 {
        self.counters.executed.load(Ordering::Relaxed)
    }

    /// Page faults reported through completion records.
    #[must_use]
    pub fn faults_reported(&self) -> u64 {
        self.counters.faults.load(Ordering::Relaxed)
    }
}

impl WorkQueue for SoftwareQueue {
    unsafe fn submit(&self, desc: &Descriptor) -> RioResult<()> {
        let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = guard
            .as_ref()
            .ok_or_else(|| RioError::Queue(format!("{} is shut down", self.name)))?;
        sender
            .send(*desc)
            .map_err(|_| RioError::Queue(format!("{} has no running engine", self.name)))
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn max_transfer_size(&self) -> usize {
        self.config.max_transfer_size
    }

    fn max_batch_size(&self) -> usize {
        self.config.max_batch_size
    }
}

impl Drop for SoftwareQueue {
    fn drop(&mut self) {
        // Closing the channel lets every engine finish its backlog and exit.
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!(queue = %self.name, "software engine panicked");
            }
        }
    }
}

// ===============================================================================================
// Engine
// ===============================================================================================

struct Outcome {
    status: u8,
    bytes: u32,
    fault: u64,
    result: u8,
}

impl Outcome {
    const fn success(bytes: u32) -> Self {
        Self {
            status: STATUS_SUCCESS,
            bytes,
            fault: 0,
            result: 0,
        }
    }

    const fn status(status: u8) -> Self {
        Self {
            status,
            bytes: 0,
            fault: 0,
            result: 0,
        }
    }
}

fn run_engine(
    receiver: &Mutex<Receiver<Descriptor>>,
    config: &SoftwareQueueConfig,
    counters: &EngineCounters,
) {
    loop {
        let next = receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recv();
        let Ok(desc) = next else {
            break;
        };

        if !config.latency.is_zero() {
            thread::sleep(config.latency);
        }

        let outcome = if desc.opcode() == Some(Opcode::Batch) {
            unsafe { execute_batch(&desc, config, counters) }
        } else {
            unsafe { execute(&desc, config, counters) }
        };

        unsafe { publish(&desc, &outcome) };
        counters.executed.fetch_add(1, Ordering::Relaxed);
    }
}

unsafe fn publish(desc: &Descriptor, outcome: &Outcome) {
    if !desc.has_flag(FLAG_COMPLETION_ADDR_VALID) || desc.completion_addr == 0 {
        return;
    }
    let record = desc.completion_addr as *mut CompletionRecord;
    unsafe {
        (*record).result = outcome.result;
        CompletionRecord::complete(record, outcome.status, outcome.bytes, outcome.fault);
    }
}

unsafe fn execute_batch(
    batch: &Descriptor,
    config: &SoftwareQueueConfig,
    counters: &EngineCounters,
) -> Outcome {
    let count = batch.xfer_size as usize;
    if count < 2 || count > config.max_batch_size {
        return Outcome::status(STATUS_DESC_CNT_ERANGE);
    }

    let list = batch.src as *const Descriptor;
    let mut failed = false;
    for i in 0..count {
        let desc = unsafe { ptr::read(list.add(i)) };
        let outcome = unsafe { execute(&desc, config, counters) };
        failed |= outcome.status != STATUS_SUCCESS;
        unsafe { publish(&desc, &outcome) };
    }

    if failed {
        Outcome {
            status: STATUS_BATCH_FAIL,
            bytes: count as u32,
            fault: 0,
            result: 0,
        }
    } else {
        Outcome::success(count as u32)
    }
}

unsafe fn execute(
    desc: &Descriptor,
    config: &SoftwareQueueConfig,
    counters: &EngineCounters,
) -> Outcome {
    let len = desc.xfer_size as usize;
    let dst = desc.dst as *mut u8;

    let Some(opcode) = desc.opcode() else {
        return Outcome::status(STATUS_BAD_OPCODE);
    };
    if len > config.max_transfer_size {
        return Outcome::status(STATUS_XFER_ERANGE);
    }

    match opcode {
        Opcode::Noop | Opcode::Drain | Opcode::TranslationFetch => Outcome::success(0),
        Opcode::Batch => Outcome::status(STATUS_BAD_OPCODE),
        Opcode::MemMove | Opcode::MemFill => {
            let allowed = match config.fault_policy {
                FaultPolicy::ReportNonResident if !desc.has_flag(FLAG_BLOCK_ON_FAULT) => {
                    first_nonresident(dst, len).unwrap_or(len)
                }
                _ => len,
            };

            unsafe {
                if opcode == Opcode::MemMove {
                    ptr::copy(desc.src as *const u8, dst, allowed);
                } else {
                    fill_pattern(dst, desc.src, allowed);
                }
                if desc.has_flag(FLAG_DEST_READBACK) {
                    persist::persist(dst, allowed);
                }
            }

            if allowed < len {
                counters.faults.fetch_add(1, Ordering::Relaxed);
                Outcome {
                    status: STATUS_PAGE_FAULT_NOBOF | STATUS_WRITE_FAULT,
                    bytes: allowed as u32,
                    fault: dst as u64 + allowed as u64,
                    result: 0,
                }
            } else {
                Outcome::success(len as u32)
            }
        }
        Opcode::Compare => {
            let equal = unsafe {
                std::slice::from_raw_parts(desc.src as *const u8, len)
                    == std::slice::from_raw_parts(dst.cast_const(), len)
            };
            Outcome {
                result: u8::from(!equal),
                ..Outcome::success(len as u32)
            }
        }
        Opcode::CompareValue => {
            let pattern = desc.src.to_le_bytes();
            let region = unsafe { std::slice::from_raw_parts(dst.cast_const(), len) };
            let equal = region
                .iter()
                .enumerate()
                .all(|(i, byte)| *byte == pattern[i % pattern.len()]);
            Outcome {
                result: u8::from(!equal),
                ..Outcome::success(len as u32)
            }
        }
        Opcode::CacheFlush => {
            unsafe { persist::persist(dst, len) };
            Outcome::success(len as u32)
        }
    }
}

unsafe fn fill_pattern(dst: *mut u8, pattern: u64, len: usize) {
    let bytes = pattern.to_le_bytes();
    for i in 0..len {
        unsafe { dst.add(i).write(bytes[i % bytes.len()]) };
    }
}

/// Offset of the first page in `[addr, addr + len)` that is not resident, if any.
fn first_nonresident(addr: *mut u8, len: usize) -> Option<usize> {
    if len == 0 {
        return None;
    }
    let page = page_size();
    let start = align_down(addr as usize, page);
    let end = addr as usize + len;
    let pages = (end - start).div_ceil(page);
    let mut residency = vec![0u8; pages];

    let ret = unsafe {
        libc::mincore(
            start as *mut libc::c_void,
            end - start,
            residency.as_mut_ptr().cast(),
        )
    };
    if ret != 0 {
        // Unmapped destination: the whole range faults.
        return Some(0);
    }

    residency
        .iter()
        .position(|r| r & 1 == 0)
        .map(|idx| (start + idx * page).saturating_sub(addr as usize))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsa::descriptor::{CompletionStatus, FLAG_COMPLETION, OpFlags};
    use std::time::Instant;

    fn wait_for(record: &CompletionRecord) -> CompletionStatus {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let status = record.status();
            if status.is_terminal() || Instant::now() > deadline {
                return status;
            }
            thread::yield_now();
        }
    }

    #[test]
    fn memmove_completes_through_record() {
        let queue = SoftwareQueue::with_defaults("test").unwrap();
        let src: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let mut dst = vec![0u8; 4096];
        let record = Box::new(CompletionRecord::default());

        let desc = Descriptor::memmove(
            OpFlags::new(false, false, true).memmove,
            dst.as_mut_ptr() as u64,
            src.as_ptr() as u64,
            4096,
        )
        .with_completion(&raw const *record);

        unsafe { queue.submit(&desc).unwrap() };
        assert_eq!(wait_for(&record), CompletionStatus::Success);
        assert_eq!(record.bytes_completed, 4096);
        assert_eq!(src, dst);
    }

    #[test]
    fn batch_descriptor_runs_its_list() {
        let queue = SoftwareQueue::with_defaults("batch").unwrap();
        let mut dst = vec![0u8; 256];
        let records: Vec<CompletionRecord> = (0..2).map(|_| CompletionRecord::default()).collect();
        let batch_record = Box::new(CompletionRecord::default());

        let list = vec![
            Descriptor::memfill(FLAG_COMPLETION, dst.as_mut_ptr() as u64, 0xabab_abab_abab_abab, 128)
                .with_completion(&raw const records[0]),
            Descriptor::memfill(
                FLAG_COMPLETION,
                dst.as_mut_ptr() as u64 + 128,
                0xcdcd_cdcd_cdcd_cdcd,
                128,
            )
            .with_completion(&raw const records[1]),
        ];
        let batch = Descriptor::batch(list.as_ptr() as u64, 2).with_completion(&raw const *batch_record);

        unsafe { queue.submit(&batch).unwrap() };
        assert_eq!(wait_for(&batch_record), CompletionStatus::Success);
        assert!(records.iter().all(|r| r.status() == CompletionStatus::Success));
        assert!(dst[..128].iter().all(|b| *b == 0xab));
        assert!(dst[128..].iter().all(|b| *b == 0xcd));
        assert_eq!(queue.executed(), 1);
    }

    #[test]
    fn single_entry_batch_is_rejected() {
        let queue = SoftwareQueue::with_defaults("bad").unwrap();
        let record = Box::new(CompletionRecord::default());
        let batch = Descriptor::batch(0, 1).with_completion(&raw const *record);

        unsafe { queue.submit(&batch).unwrap() };
        assert_eq!(wait_for(&record), CompletionStatus::Error(STATUS_DESC_CNT_ERANGE));
    }

    #[test]
    fn compare_reports_difference() {
        let queue = SoftwareQueue::with_defaults("cmp").unwrap();
        let a = vec![1u8; 64];
        let mut b = vec![1u8; 64];
        b[63] = 2;
        let record = Box::new(CompletionRecord::default());
        let desc = Descriptor {
            src: a.as_ptr() as u64,
            dst: b.as_ptr() as u64,
            xfer_size: 64,
            ..Descriptor::new(Opcode::Compare, FLAG_COMPLETION)
        }
        .with_completion(&raw const *record);

        unsafe { queue.submit(&desc).unwrap() };
        assert_eq!(wait_for(&record), CompletionStatus::Success);
        assert_eq!(record.result, 1);
    }

    #[test]
    fn zero_engines_is_invalid() {
        let err = SoftwareQueue::new("none", SoftwareQueueConfig::new().with_engines(0)).unwrap_err();
        assert!(matches!(err, RioError::InvalidConfig(_)));
    }
}
