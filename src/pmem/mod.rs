pub mod file;
pub mod persist;
pub mod staging;

pub use file::{PmemConfig, PmemFile};
pub use staging::StagingBuffer;
