//! Accelerated persistent-memory streams.
//!
//! [`batch::Batch`] drives a DSA-style copy accelerator through a ring of descriptor
//! groups, [`pmem::PmemFile`] appends to a memory-mapped file through it, and
//! [`rio::Stream`] puts a uniform read/write surface over PMEM, files, buffers,
//! connections and raw descriptors.

pub mod batch;
pub mod dsa;
pub mod error;
pub mod pmem;
pub mod rio;
pub mod stats;
pub mod utils;

pub use batch::{Batch, BatchConfig, BatchStats};
pub use dsa::{FaultPolicy, Portal, PortalMode, SoftwareQueue, SoftwareQueueConfig, WorkQueue};
pub use error::{RioError, RioResult};
pub use pmem::{PmemConfig, PmemFile};
pub use rio::{Backend, Stream};
pub use stats::CopySizeStats;
