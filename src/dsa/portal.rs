//! Submission portal of a kernel-configured DSA work queue.
//!
//! The idxd driver exposes each enabled user work queue as a character device
//! (`/dev/dsa/wq0.0`). Mapping its first page yields the portal: a dedicated queue
//! takes descriptors through `MOVDIR64B`, a shared queue through `ENQCMD`, which may
//! ask the submitter to retry when the queue is full.

use super::WorkQueue;
use super::descriptor::Descriptor;
use crate::error::{RioError, RioResult};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use tracing::{debug, warn};

const PORTAL_SIZE: usize = 4096;
const ENQCMD_MAX_RETRIES: u32 = 1 << 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortalMode {
    Dedicated,
    Shared,
}

/// A handle to one mapped work-queue portal.
#[derive(Debug)]
pub struct Portal {
    path: PathBuf,
    name: String,
    mode: PortalMode,
    portal: NonNull<u8>,
    // Keeps the device open for as long as the portal is mapped.
    _file: File,
}

unsafe impl Send for Portal {}
unsafe impl Sync for Portal {}

impl Portal {
    /// Opens and maps the portal of the work queue at `path`.
    ///
    /// # Errors
    /// Returns an error if the CPU lacks the submission instruction for `mode`, or if the
    /// device cannot be opened or mapped (driver not loaded, queue disabled, permissions).
    pub fn open<P: AsRef<Path>>(path: P, mode: PortalMode) -> RioResult<Self> {
        let path = path.as_ref();
        check_cpu_support(mode)?;

        let file = OpenOptions::new().read(true).write(true).open(path)?;

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                PORTAL_SIZE,
                libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_POPULATE,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            warn!(path = %path.display(), error = %err, "failed to map work queue portal");
            return Err(RioError::Map {
                path: path.to_path_buf(),
                source: err,
            });
        }
        let portal = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| RioError::Queue("mmap returned null".into()))?;

        let name = path
            .file_name()
            .map_or_else(|| "wq".to_string(), |n| n.to_string_lossy().into_owned());

        debug!(portal = %name, ?mode, "work queue portal mapped");

        Ok(Self {
            path: path.to_path_buf(),
            name,
            mode,
            portal,
            _file: file,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn mode(&self) -> PortalMode {
        self.mode
    }
}

impl WorkQueue for Portal {
    unsafe fn submit(&self, desc: &Descriptor) -> RioResult<()> {
        #[cfg(target_arch = "x86_64")]
        {
            // Descriptor and record writes must be globally visible before the device reads them.
            unsafe { std::arch::x86_64::_mm_sfence() };

            match self.mode {
                PortalMode::Dedicated => {
                    unsafe { x86_submit::movdir64b(self.portal.as_ptr(), desc) };
                    Ok(())
                }
                PortalMode::Shared => {
                    for _ in 0..ENQCMD_MAX_RETRIES {
                        if unsafe { x86_submit::enqcmd(self.portal.as_ptr(), desc) } {
                            return Ok(());
                        }
                        std::hint::spin_loop();
                    }
                    Err(RioError::Queue(format!("{} stayed full", self.name)))
                }
            }
        }

        #[cfg(not(target_arch = "x86_64"))]
        {
            let _ = desc;
            Err(RioError::Unsupported("work queue submission needs x86_64".into()))
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for Portal {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.portal.as_ptr().cast(), PORTAL_SIZE);
        }
    }
}

fn check_cpu_support(mode: PortalMode) -> RioResult<()> {
    #[cfg(target_arch = "x86_64")]
    {
        use crate::utils::x86;
        let supported = match mode {
            PortalMode::Dedicated => x86::supports_movdir64b(),
            PortalMode::Shared => x86::supports_enqcmd(),
        };
        if supported {
            return Ok(());
        }
        Err(RioError::Unsupported(format!(
            "CPU lacks the submission instruction for {mode:?} work queues"
        )))
    }

    #[cfg(not(target_arch = "x86_64"))]
    {
        Err(RioError::Unsupported(format!(
            "{mode:?} work queues need x86_64"
        )))
    }
}

#[cfg(target_arch = "x86_64")]
mod x86_submit {
    use super::Descriptor;
    use std::arch::asm;

    /// 64-byte direct store of the descriptor into the portal.
    #[allow(clippy::inline_always)]
    #[inline(always)]
    pub unsafe fn movdir64b(portal: *mut u8, desc: &Descriptor) {
        unsafe {
            asm!(
                "movdir64b {0}, [{1}]",
                in(reg) portal,
                in(reg) std::ptr::from_ref(desc),
                options(nostack, preserves_flags)
            );
        }
    }

    /// Enqueue command; returns false when the shared queue rejected the descriptor.
    #[allow(clippy::inline_always)]
    #[inline(always)]
    pub unsafe fn enqcmd(portal: *mut u8, desc: &Descriptor) -> bool {
        let retry: u8;
        unsafe {
            asm!(
                "enqcmd {0}, [{1}]",
                "setz {2}",
                in(reg) portal,
                in(reg) std::ptr::from_ref(desc),
                out(reg_byte) retry,
                options(nostack)
            );
        }
        retry == 0
    }
}
