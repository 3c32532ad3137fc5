use crate::error::{RioError, RioResult};
use crate::utils::KB;
use tracing::debug;

pub const DEFAULT_BATCH_CAPACITY: usize = 80;
pub const DEFAULT_BATCH_SIZE: usize = 32;
pub const OUT_OF_ORDER_RECYCLE_T_INIT: usize = 25;
pub const DSA_PF_LEN_LIMIT: usize = 128 * KB;
pub const DSA_PAGE_FAULT_TOUCH_LEN: usize = 128 * KB;
pub const DEFAULT_SHORT_LEN: usize = 4 * KB;

/// Tuning knobs of a [`Batch`](super::Batch).
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    /// Number of descriptor groups in the ring.
    pub capacity: usize,
    /// Descriptors per group; a full group is submitted as one batch descriptor.
    pub group_size: usize,

    pub block_on_fault: bool,
    pub cache_control: bool,
    pub dest_readback: bool,

    /// Interleave long and short transfers inside a sealed group.
    pub mixing: bool,
    /// Reclaim any completed group inside an adaptive window instead of strict FIFO.
    pub out_of_order_recycle: bool,
    pub recycle_t_init: usize,

    /// Touch the leading destination pages of long transfers before submission.
    pub pretouch: bool,
    pub pf_len_limit: usize,
    pub pf_touch_len: usize,

    /// Copy transfers shorter than `short_len` with the CPU.
    pub short_to_cpu: bool,
    pub short_len: usize,
    /// Flush cache lines after every CPU copy.
    pub persist_cpu_writes: bool,

    /// CPU-copy the head of a transfer so the hardware destination starts 64-byte aligned.
    pub align_addresses: bool,

    /// One region for all groups rather than one region per group.
    pub contiguous: bool,
    pub huge_pages: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_BATCH_CAPACITY,
            group_size: DEFAULT_BATCH_SIZE,
            block_on_fault: false,
            cache_control: false,
            dest_readback: true,
            mixing: true,
            out_of_order_recycle: false,
            recycle_t_init: OUT_OF_ORDER_RECYCLE_T_INIT,
            pretouch: true,
            pf_len_limit: DSA_PF_LEN_LIMIT,
            pf_touch_len: DSA_PAGE_FAULT_TOUCH_LEN,
            short_to_cpu: true,
            short_len: DEFAULT_SHORT_LEN,
            persist_cpu_writes: true,
            align_addresses: false,
            contiguous: true,
            huge_pages: true,
        }
    }
}

impl BatchConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    #[must_use]
    pub const fn with_group_size(mut self, group_size: usize) -> Self {
        self.group_size = group_size;
        self
    }

    #[must_use]
    pub const fn block_on_fault(mut self, enabled: bool) -> Self {
        self.block_on_fault = enabled;
        self
    }

    #[must_use]
    pub const fn cache_control(mut self, enabled: bool) -> Self {
        self.cache_control = enabled;
        self
    }

    #[must_use]
    pub const fn dest_readback(mut self, enabled: bool) -> Self {
        self.dest_readback = enabled;
        self
    }

    #[must_use]
    pub const fn mixing(mut self, enabled: bool) -> Self {
        self.mixing = enabled;
        self
    }

    #[must_use]
    pub const fn out_of_order_recycle(mut self, enabled: bool, t_init: usize) -> Self {
        self.out_of_order_recycle = enabled;
        self.recycle_t_init = t_init;
        self
    }

    #[must_use]
    pub const fn pretouch(mut self, enabled: bool) -> Self {
        self.pretouch = enabled;
        self
    }

    #[must_use]
    pub const fn with_pretouch_window(mut self, len_limit: usize, touch_len: usize) -> Self {
        self.pf_len_limit = len_limit;
        self.pf_touch_len = touch_len;
        self
    }

    #[must_use]
    pub const fn short_to_cpu(mut self, enabled: bool, short_len: usize) -> Self {
        self.short_to_cpu = enabled;
        self.short_len = short_len;
        self
    }

    #[must_use]
    pub const fn persist_cpu_writes(mut self, enabled: bool) -> Self {
        self.persist_cpu_writes = enabled;
        self
    }

    #[must_use]
    pub const fn align_addresses(mut self, enabled: bool) -> Self {
        self.align_addresses = enabled;
        self
    }

    #[must_use]
    pub const fn contiguous(mut self, enabled: bool) -> Self {
        self.contiguous = enabled;
        self
    }

    #[must_use]
    pub const fn huge_pages(mut self, enabled: bool) -> Self {
        self.huge_pages = enabled;
        self
    }

    /// Rejects configurations the engine cannot run with.
    ///
    /// # Errors
    /// Returns `InvalidConfig` for an empty ring or empty groups.
    pub fn validate(&self) -> RioResult<()> {
        if self.capacity == 0 {
            return Err(RioError::InvalidConfig("batch capacity must be non-zero".into()));
        }
        if self.group_size == 0 {
            return Err(RioError::InvalidConfig("batch group size must be non-zero".into()));
        }
        if self.pretouch && self.pf_touch_len == 0 {
            return Err(RioError::InvalidConfig("pre-touch window must be non-zero".into()));
        }
        Ok(())
    }

    /// Resolves knobs that cannot be combined.
    ///
    /// Cache-control writes land in the cache, so head alignment buys nothing. Mixing
    /// relies on destination readback to make every descriptor independently durable.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        if self.align_addresses && self.cache_control {
            debug!("address alignment disabled: cache control is set");
            self.align_addresses = false;
        }
        if self.mixing && !self.dest_readback {
            debug!("in-batch mixing disabled: destination readback is not set");
            self.mixing = false;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_tuned_profile() {
        let config = BatchConfig::default();
        assert_eq!(config.capacity, 80);
        assert_eq!(config.group_size, 32);
        assert!(config.dest_readback);
        assert!(config.mixing);
        assert!(!config.out_of_order_recycle);
        assert_eq!(config.recycle_t_init, 25);
        assert_eq!(config.pf_len_limit, 128 * KB);
    }

    #[test]
    fn normalization_drops_incompatible_knobs() {
        let config = BatchConfig::new()
            .cache_control(true)
            .align_addresses(true)
            .dest_readback(false)
            .normalized();
        assert!(!config.align_addresses);
        assert!(!config.mixing);
    }

    #[test]
    fn empty_ring_is_rejected() {
        assert!(BatchConfig::new().with_capacity(0).validate().is_err());
        assert!(BatchConfig::new().with_group_size(0).validate().is_err());
        assert!(BatchConfig::new().validate().is_ok());
    }
}
