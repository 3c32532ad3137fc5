use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RioError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to map {}: {source}", path.display())]
    Map {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to extend {} to {size} bytes: {source}", path.display())]
    Extend {
        path: PathBuf,
        size: usize,
        source: std::io::Error,
    },

    #[error("Write to {} failed: {source}", path.display())]
    Write {
        path: PathBuf,
        source: Box<RioError>,
    },

    #[error(
        "Accelerator fault: status 0x{status:02x} at 0x{fault_addr:x} \
         ({bytes_completed} of {len} bytes to 0x{dst:x} completed)"
    )]
    AcceleratorFault {
        status: u8,
        fault_addr: u64,
        bytes_completed: u32,
        dst: u64,
        len: u32,
    },

    #[error("{0} stream does not support reading")]
    ReadUnsupported(&'static str),

    #[error("{0} stream does not support writing")]
    WriteUnsupported(&'static str),

    #[error("Read limit exceeded")]
    ReadLimitExceeded,

    #[error("Stream is broken by an earlier failure")]
    StreamBroken,

    #[error("Operation timed out")]
    WaitTimeout,

    #[error("Out of descriptor memory")]
    OutOfMemory,

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Work queue error: {0}")]
    Queue(String),
}

impl RioError {
    /// True when the error came from a completion record rather than software.
    #[must_use]
    pub fn is_accelerator_fault(&self) -> bool {
        match self {
            Self::AcceleratorFault { .. } => true,
            Self::Write { source, .. } => source.is_accelerator_fault(),
            _ => false,
        }
    }
}

// A convenient alias
pub type RioResult<T> = Result<T, RioError>;
