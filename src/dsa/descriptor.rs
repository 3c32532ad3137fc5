#![allow(clippy::cast_possible_truncation)]

//! Hardware record layouts shared by software and the accelerator.

use std::mem;
use std::sync::atomic::{AtomicU8, Ordering};

// ===============================================================================================
// Opcodes & Flags
// ===============================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Noop = 0x00,
    Batch = 0x01,
    Drain = 0x02,
    MemMove = 0x03,
    MemFill = 0x04,
    Compare = 0x05,
    CompareValue = 0x06,
    TranslationFetch = 0x0a,
    CacheFlush = 0x20,
}

impl Opcode {
    #[must_use]
    pub const fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0x00 => Self::Noop,
            0x01 => Self::Batch,
            0x02 => Self::Drain,
            0x03 => Self::MemMove,
            0x04 => Self::MemFill,
            0x05 => Self::Compare,
            0x06 => Self::CompareValue,
            0x0a => Self::TranslationFetch,
            0x20 => Self::CacheFlush,
            _ => return None,
        })
    }
}

pub const FLAG_FENCE: u32 = 0x0001;
pub const FLAG_BLOCK_ON_FAULT: u32 = 0x0002;
pub const FLAG_COMPLETION_ADDR_VALID: u32 = 0x0004;
pub const FLAG_REQUEST_COMPLETION: u32 = 0x0008;
pub const FLAG_CACHE_CONTROL: u32 = 0x0100;
pub const FLAG_DEST_READBACK: u32 = 0x4000;

/// Every descriptor the engine builds asks for a completion record.
pub const FLAG_COMPLETION: u32 = FLAG_COMPLETION_ADDR_VALID | FLAG_REQUEST_COMPLETION;

/// The per-opcode flag sets, derived from the optional hardware flags a batch enables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpFlags {
    pub noop: u32,
    pub memmove: u32,
    pub memfill: u32,
    pub compare: u32,
    pub compare_value: u32,
    pub cache_flush: u32,
    pub translation_fetch: u32,
}

impl OpFlags {
    #[must_use]
    pub const fn new(block_on_fault: bool, cache_control: bool, dest_readback: bool) -> Self {
        let bof = if block_on_fault { FLAG_BLOCK_ON_FAULT } else { 0 };
        let cc = if cache_control { FLAG_CACHE_CONTROL } else { 0 };
        let drdbk = if dest_readback { FLAG_DEST_READBACK } else { 0 };

        Self {
            noop: FLAG_COMPLETION,
            memmove: FLAG_COMPLETION | bof | cc | drdbk,
            memfill: FLAG_COMPLETION | bof | cc | drdbk,
            compare: FLAG_COMPLETION | bof,
            compare_value: FLAG_COMPLETION | bof,
            cache_flush: FLAG_COMPLETION | bof,
            translation_fetch: FLAG_COMPLETION | bof | cc,
        }
    }
}

// ===============================================================================================
// Completion Status
// ===============================================================================================

pub const STATUS_NONE: u8 = 0x00;
pub const STATUS_SUCCESS: u8 = 0x01;
pub const STATUS_SUCCESS_PRED: u8 = 0x02;
pub const STATUS_PAGE_FAULT_NOBOF: u8 = 0x03;
pub const STATUS_PAGE_FAULT_IR: u8 = 0x04;
pub const STATUS_BATCH_FAIL: u8 = 0x05;
pub const STATUS_BATCH_PAGE_FAULT: u8 = 0x06;
pub const STATUS_BAD_OPCODE: u8 = 0x10;
pub const STATUS_INVALID_FLAGS: u8 = 0x11;
pub const STATUS_NOZERO_RESERVE: u8 = 0x12;
pub const STATUS_XFER_ERANGE: u8 = 0x13;
pub const STATUS_DESC_CNT_ERANGE: u8 = 0x14;

/// Bit 7 of the status byte flags a write fault rather than a read fault.
pub const STATUS_WRITE_FAULT: u8 = 0x80;
pub const STATUS_MASK: u8 = 0x7f;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Pending,
    Success,
    PageFault { write: bool },
    BatchFailed,
    Error(u8),
}

impl CompletionStatus {
    #[must_use]
    pub const fn from_raw(raw: u8) -> Self {
        match raw & STATUS_MASK {
            STATUS_NONE => Self::Pending,
            STATUS_SUCCESS | STATUS_SUCCESS_PRED => Self::Success,
            STATUS_PAGE_FAULT_NOBOF | STATUS_PAGE_FAULT_IR | STATUS_BATCH_PAGE_FAULT => {
                Self::PageFault {
                    write: raw & STATUS_WRITE_FAULT != 0,
                }
            }
            STATUS_BATCH_FAIL => Self::BatchFailed,
            other => Self::Error(other),
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

// ===============================================================================================
// Hardware Records
// ===============================================================================================

/// One 64-byte work descriptor.
///
/// `src` doubles as the fill pattern or the descriptor-list address, and `xfer_size` as the
/// descriptor count for batch descriptors.
#[repr(C, align(64))]
#[derive(Debug, Clone, Copy, Default)]
pub struct Descriptor {
    /// PASID [19:0], reserved, privilege bit 31.
    pub pasid: u32,
    /// Flags [23:0], opcode [31:24].
    pub flags_opcode: u32,
    pub completion_addr: u64,
    pub src: u64,
    pub dst: u64,
    pub xfer_size: u32,
    pub int_handle: u16,
    pub reserved: u16,
    pub op_specific: [u8; 24],
}

const _: () = assert!(mem::size_of::<Descriptor>() == 64);
const _: () = assert!(mem::align_of::<Descriptor>() == 64);
const _: () = assert!(mem::offset_of!(Descriptor, completion_addr) == 8);
const _: () = assert!(mem::offset_of!(Descriptor, xfer_size) == 32);

impl Descriptor {
    #[must_use]
    pub const fn new(opcode: Opcode, flags: u32) -> Self {
        Self {
            pasid: 0,
            flags_opcode: (flags & 0x00ff_ffff) | ((opcode as u32) << 24),
            completion_addr: 0,
            src: 0,
            dst: 0,
            xfer_size: 0,
            int_handle: 0,
            reserved: 0,
            op_specific: [0; 24],
        }
    }

    #[must_use]
    pub fn memmove(flags: u32, dst: u64, src: u64, len: u32) -> Self {
        Self {
            src,
            dst,
            xfer_size: len,
            ..Self::new(Opcode::MemMove, flags)
        }
    }

    #[must_use]
    pub fn memfill(flags: u32, dst: u64, pattern: u64, len: u32) -> Self {
        Self {
            src: pattern,
            dst,
            xfer_size: len,
            ..Self::new(Opcode::MemFill, flags)
        }
    }

    #[must_use]
    pub fn cache_flush(flags: u32, dst: u64, len: u32) -> Self {
        Self {
            dst,
            xfer_size: len,
            ..Self::new(Opcode::CacheFlush, flags)
        }
    }

    /// A batch descriptor pointing at `count` contiguous descriptors.
    #[must_use]
    pub fn batch(list_addr: u64, count: u32) -> Self {
        Self {
            src: list_addr,
            xfer_size: count,
            ..Self::new(Opcode::Batch, FLAG_COMPLETION)
        }
    }

    #[must_use]
    pub const fn opcode_raw(&self) -> u8 {
        (self.flags_opcode >> 24) as u8
    }

    #[must_use]
    pub const fn opcode(&self) -> Option<Opcode> {
        Opcode::from_raw(self.opcode_raw())
    }

    #[must_use]
    pub const fn flags(&self) -> u32 {
        self.flags_opcode & 0x00ff_ffff
    }

    #[must_use]
    pub const fn has_flag(&self, flag: u32) -> bool {
        self.flags() & flag != 0
    }

    #[must_use]
    pub fn with_completion(mut self, record: *const CompletionRecord) -> Self {
        self.completion_addr = record as u64;
        self
    }
}

/// The 32-byte record the accelerator writes when a descriptor finishes.
///
/// `status` is stored last with release ordering, so a non-zero status published
/// through [`CompletionRecord::status`] makes the other fields visible.
#[repr(C, align(32))]
#[derive(Debug, Default)]
pub struct CompletionRecord {
    pub status: AtomicU8,
    pub result: u8,
    pub reserved: u16,
    pub bytes_completed: u32,
    pub fault_addr: u64,
    pub op_specific: [u8; 16],
}

const _: () = assert!(mem::size_of::<CompletionRecord>() == 32);
const _: () = assert!(mem::align_of::<CompletionRecord>() == 32);
const _: () = assert!(mem::offset_of!(CompletionRecord, fault_addr) == 8);

impl CompletionRecord {
    #[inline]
    pub fn status_raw(&self) -> u8 {
        self.status.load(Ordering::Acquire)
    }

    #[inline]
    pub fn status(&self) -> CompletionStatus {
        CompletionStatus::from_raw(self.status_raw())
    }

    /// Clears the record before the slot is handed to the queue again.
    ///
    /// # Safety
    /// The queue must not own the record (no descriptor pointing at it is in flight).
    pub unsafe fn reset(record: *mut CompletionRecord) {
        unsafe {
            (*record).result = 0;
            (*record).bytes_completed = 0;
            (*record).fault_addr = 0;
            (*record).status.store(STATUS_NONE, Ordering::Release);
        }
    }

    /// Writes the outcome fields and publishes `status` last.
    ///
    /// # Safety
    /// `record` must point at a live completion record owned by a submitted descriptor.
    pub unsafe fn complete(record: *mut CompletionRecord, status: u8, bytes: u32, fault: u64) {
        unsafe {
            (*record).bytes_completed = bytes;
            (*record).fault_addr = fault;
            (*record).status.store(status, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memmove_encodes_opcode_and_flags() {
        let flags = OpFlags::new(false, false, true);
        let desc = Descriptor::memmove(flags.memmove, 0x2000, 0x1000, 4096);

        assert_eq!(desc.opcode(), Some(Opcode::MemMove));
        assert!(desc.has_flag(FLAG_DEST_READBACK));
        assert!(desc.has_flag(FLAG_REQUEST_COMPLETION));
        assert!(desc.has_flag(FLAG_COMPLETION_ADDR_VALID));
        assert!(!desc.has_flag(FLAG_BLOCK_ON_FAULT));
        assert_eq!(desc.xfer_size, 4096);
    }

    #[test]
    fn completion_address_points_at_record() {
        let record = CompletionRecord::default();
        let ptr: *const CompletionRecord = &raw const record;
        let desc = Descriptor::memfill(FLAG_COMPLETION, 0x4000, 0, 64).with_completion(ptr);
        assert_eq!(desc.completion_addr, ptr as u64);
        assert_eq!(desc.opcode(), Some(Opcode::MemFill));
    }

    #[test]
    fn optional_flags_only_reach_their_opcodes() {
        let flags = OpFlags::new(true, true, true);
        assert_eq!(flags.noop, FLAG_COMPLETION);
        assert_eq!(flags.compare & FLAG_CACHE_CONTROL, 0);
        assert_ne!(flags.compare & FLAG_BLOCK_ON_FAULT, 0);
        assert_ne!(flags.translation_fetch & FLAG_CACHE_CONTROL, 0);
        assert_eq!(flags.translation_fetch & FLAG_DEST_READBACK, 0);
    }

    #[test]
    fn status_decoding() {
        assert_eq!(CompletionStatus::from_raw(0), CompletionStatus::Pending);
        assert_eq!(CompletionStatus::from_raw(1), CompletionStatus::Success);
        assert_eq!(
            CompletionStatus::from_raw(STATUS_PAGE_FAULT_NOBOF | STATUS_WRITE_FAULT),
            CompletionStatus::PageFault { write: true }
        );
        assert_eq!(
            CompletionStatus::from_raw(STATUS_BAD_OPCODE),
            CompletionStatus::Error(STATUS_BAD_OPCODE)
        );
        assert!(!CompletionStatus::Pending.is_terminal());
    }

    #[test]
    fn record_reset_and_complete() {
        let mut record = CompletionRecord::default();
        let ptr: *mut CompletionRecord = &raw mut record;
        unsafe {
            CompletionRecord::complete(ptr, STATUS_SUCCESS, 128, 0);
            assert_eq!((*ptr).status(), CompletionStatus::Success);
            CompletionRecord::reset(ptr);
            assert_eq!((*ptr).status(), CompletionStatus::Pending);
            assert_eq!((*ptr).bytes_completed, 0);
        }
    }
}
