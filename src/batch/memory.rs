#![allow(clippy::cast_ptr_alignment)]

//! Pinned storage for descriptors and completion records.
//!
//! Each group occupies one stride: `group_size` descriptors, the group's batch
//! descriptor, then `group_size` completion records and the batch record.
//! Descriptors stay 64-byte aligned and records 32-byte aligned because every
//! stride starts on a 64-byte boundary.

use crate::dsa::descriptor::{CompletionRecord, Descriptor};
use crate::error::{RioError, RioResult};
use crate::utils::{CACHE_LINE, PAGE_SIZE_2M, align_up, page_size};
use std::io;
use std::mem::size_of;
use std::ptr::NonNull;
use tracing::debug;

// MAP_HUGE_2MB = 21 << MAP_HUGE_SHIFT
const MAP_HUGE_2MB: libc::c_int = 21 << 26;

/// An anonymous mapping, huge-page backed when possible.
#[derive(Debug)]
struct Region {
    ptr: NonNull<u8>,
    len: usize,
    huge: bool,
}

impl Region {
    fn allocate(size: usize, huge_pages: bool) -> RioResult<Self> {
        if huge_pages {
            let len = align_up(size, PAGE_SIZE_2M);
            match Self::map(len, libc::MAP_HUGETLB | MAP_HUGE_2MB) {
                Ok(ptr) => return Ok(Self::pinned(ptr, len, true)),
                Err(e) => debug!(error = %e, "huge page allocation failed, using regular pages"),
            }
        }

        let len = align_up(size, page_size());
        let ptr = Self::map(len, 0).map_err(|e| {
            debug!(error = %e, size = len, "descriptor memory allocation failed");
            RioError::OutOfMemory
        })?;
        Ok(Self::pinned(ptr, len, false))
    }

    fn map(len: usize, extra_flags: libc::c_int) -> io::Result<NonNull<u8>> {
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_POPULATE | extra_flags;
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        NonNull::new(ptr.cast::<u8>()).ok_or_else(|| io::Error::other("mmap returned null"))
    }

    fn pinned(ptr: NonNull<u8>, len: usize, huge: bool) -> Self {
        // Pinning is best effort; RLIMIT_MEMLOCK is often small for unprivileged users.
        if unsafe { libc::mlock(ptr.as_ptr().cast(), len) } != 0 {
            debug!(error = %io::Error::last_os_error(), len, "mlock of descriptor memory failed");
        }
        Self { ptr, len, huge }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

/// Addresses of one group's records.
#[derive(Debug, Clone, Copy)]
pub struct GroupMemory {
    pub descs: *mut Descriptor,
    pub batch_desc: *mut Descriptor,
    pub records: *mut CompletionRecord,
    pub batch_record: *mut CompletionRecord,
}

#[derive(Debug)]
pub struct DescriptorMemory {
    regions: Vec<Region>,
    groups: Vec<GroupMemory>,
    group_size: usize,
}

unsafe impl Send for DescriptorMemory {}

impl DescriptorMemory {
    /// Bytes one group occupies.
    #[must_use]
    pub const fn stride(group_size: usize) -> usize {
        let descs = (group_size + 1) * size_of::<Descriptor>();
        let records = (group_size + 1) * size_of::<CompletionRecord>();
        align_up(descs + records, CACHE_LINE)
    }

    /// Allocates `capacity` zeroed groups, either from one region or one region each.
    ///
    /// # Errors
    /// Returns `OutOfMemory` if the mapping cannot be created.
    pub fn allocate(
        capacity: usize,
        group_size: usize,
        contiguous: bool,
        huge_pages: bool,
    ) -> RioResult<Self> {
        let stride = Self::stride(group_size);
        let mut regions = Vec::new();
        let mut groups = Vec::with_capacity(capacity);

        if contiguous {
            let region = Region::allocate(stride * capacity, huge_pages)?;
            for g in 0..capacity {
                let base = unsafe { region.ptr.as_ptr().add(g * stride) };
                groups.push(Self::carve(base, group_size));
            }
            regions.push(region);
        } else {
            for _ in 0..capacity {
                let region = Region::allocate(stride, huge_pages)?;
                groups.push(Self::carve(region.ptr.as_ptr(), group_size));
                regions.push(region);
            }
        }

        let memory = Self {
            regions,
            groups,
            group_size,
        };
        debug!(
            capacity,
            group_size,
            regions = memory.region_count(),
            huge = memory.uses_huge_pages(),
            "descriptor memory ready"
        );
        Ok(memory)
    }

    fn carve(base: *mut u8, group_size: usize) -> GroupMemory {
        unsafe {
            let descs = base.cast::<Descriptor>();
            let batch_desc = descs.add(group_size);
            let records = batch_desc.add(1).cast::<CompletionRecord>();
            let batch_record = records.add(group_size);
            GroupMemory {
                descs,
                batch_desc,
                records,
                batch_record,
            }
        }
    }

    #[must_use]
    pub fn group(&self, g: usize) -> GroupMemory {
        self.groups[g]
    }

    #[must_use]
    pub const fn group_size(&self) -> usize {
        self.group_size
    }

    #[must_use]
    pub fn uses_huge_pages(&self) -> bool {
        self.regions.iter().all(|r| r.huge)
    }

    #[must_use]
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }
}
