// dedupe-coordinator: configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Lower bound used when clamping the timeout tunables, expressed as a
/// number of 1ms host ticks. The real granularity of the host timer is out
/// of scope here; we treat one tick as one millisecond.
const MIN_TICKS_MS: u64 = 2;

/// Configuration for a [`crate::Coordinator`].
///
/// Mirrors the section-per-concern shape this codebase uses for service
/// configuration (compare `knhk-sidecar::config::SidecarConfig`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Name of the block device this index is attached to.
    pub parent_device_name: String,
    /// Size of the on-disk index region, in blocks.
    pub index_region_blocks: u64,
    /// Block size in bytes.
    pub block_size: u64,
    /// Nonce recorded in the on-disk index; used to detect an index that
    /// belongs to a different device.
    pub nonce: u64,
    /// Requested timeout for outstanding requests, in milliseconds. Clamped
    /// to `[2 ticks, 120_000]`.
    pub timeout_interval_ms: u64,
    /// Requested floor on how soon the pending timer may re-fire, in
    /// milliseconds. Clamped to `[2 ticks, 1_000]`.
    pub min_timer_interval_ms: u64,
    /// How often the timeout reporter may emit a coalesced log line.
    pub reporting_interval_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            parent_device_name: "dedupe0".to_string(),
            index_region_blocks: 1,
            block_size: 4096,
            nonce: 0,
            timeout_interval_ms: 5000,
            min_timer_interval_ms: 100,
            reporting_interval_ms: 1000,
        }
    }
}

impl CoordinatorConfig {
    /// The textual index descriptor passed to the engine, e.g.
    /// `dev=sdb offset=4096 size=4096`.
    pub fn index_name(&self) -> String {
        let bytes = self.index_region_blocks * self.block_size;
        format!("dev={} offset=4096 size={bytes}", self.parent_device_name)
    }

    pub(crate) fn clamped_timeout_interval(&self) -> Duration {
        clamp_ms(self.timeout_interval_ms, 120_000)
    }

    pub(crate) fn clamped_min_timer_interval(&self) -> Duration {
        clamp_ms(self.min_timer_interval_ms, 1_000)
    }

    pub(crate) fn reporting_interval(&self) -> Duration {
        Duration::from_millis(self.reporting_interval_ms.max(1))
    }
}

fn clamp_ms(requested: u64, cap: u64) -> Duration {
    Duration::from_millis(requested.max(MIN_TICKS_MS).min(cap))
}
