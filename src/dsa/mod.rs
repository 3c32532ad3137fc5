pub mod descriptor;
pub mod portal;
pub mod software;

use crate::error::RioResult;
use descriptor::Descriptor;
use std::fmt::Debug;

/// The submission surface of an accelerator work queue.
///
/// Implementations copy the 64-byte descriptor at submission time, then execute it
/// asynchronously and publish the outcome through the completion record named in
/// `desc.completion_addr`. For batch descriptors the descriptor list is read
/// asynchronously as well.
pub trait WorkQueue: Debug + Send + Sync {
    /// Hands one descriptor to the queue.
    ///
    /// # Safety
    /// Every address in `desc` (source, destination, completion record and, for batch
    /// descriptors, the descriptor list) must stay valid until its completion record
    /// reports a terminal status.
    unsafe fn submit(&self, desc: &Descriptor) -> RioResult<()>;

    /// Short human-readable identity, used in logs.
    fn name(&self) -> &str;

    /// Largest transfer size one descriptor may carry.
    fn max_transfer_size(&self) -> usize {
        u32::MAX as usize
    }

    /// Largest descriptor count of one batch descriptor.
    fn max_batch_size(&self) -> usize {
        1024
    }
}

// Re-export the implementations for easy access
pub use portal::{Portal, PortalMode};
pub use software::{FaultPolicy, SoftwareQueue, SoftwareQueueConfig};
