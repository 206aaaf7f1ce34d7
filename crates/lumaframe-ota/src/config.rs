//! Tunable parameters for the update pipelines.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Configuration shared by the updaters and the scheduler.
///
/// Defaults match the shipping appliance. Tests shrink the delays to zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OtaConfig {
    /// Interval between scheduled update checks.
    pub check_interval: Duration,
    /// Delay before the first scheduled check after boot, leaving the boot
    /// path quiet.
    pub initial_check_delay: Duration,
    /// Accept prerelease firmware during scheduled checks.
    pub dev_mode: bool,
    /// How long a check waits for the shared storage bus.
    pub bus_acquire_timeout: Duration,
    /// Pause after winning the bus so in-flight loader I/O drains.
    pub bus_settle_delay: Duration,
    /// Pause after entering update UI so the panel settles before the
    /// download starts.
    pub ui_settle_delay: Duration,
    /// Pause between announcing the reboot and restarting.
    pub reboot_grace: Duration,
    /// How long a finished asset install lingers in `Complete` before
    /// returning to idle.
    pub complete_linger: Duration,
    /// Chunk size for partition writes.
    pub write_chunk_size: usize,
    /// Upper bound for buffering a web-asset image in memory.
    pub max_asset_image_size: u64,
    /// Consecutive asset install failures after which scheduled installs
    /// stop. Manual repair ignores this.
    pub asset_failure_threshold: u8,
    /// Retry schedule for release host queries.
    pub provider_retry: RetryPolicy,
    /// Retry schedule for checksum downloads.
    pub checksum_retry: RetryPolicy,
    /// Probe schedule while the media loader is busy.
    pub loader_retry: RetryPolicy,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(6 * 60 * 60),
            initial_check_delay: Duration::from_secs(5 * 60),
            dev_mode: false,
            bus_acquire_timeout: Duration::from_secs(10),
            bus_settle_delay: Duration::from_millis(500),
            ui_settle_delay: Duration::from_secs(1),
            reboot_grace: Duration::from_secs(3),
            complete_linger: Duration::from_secs(3),
            write_chunk_size: 4096,
            max_asset_image_size: 4 * 1024 * 1024,
            asset_failure_threshold: 4,
            provider_retry: RetryPolicy::provider_query(),
            checksum_retry: RetryPolicy::checksum_download(),
            loader_retry: RetryPolicy::loader_deferral(),
        }
    }
}

impl OtaConfig {
    /// A configuration with every delay zeroed, for tests and bench runs.
    pub fn immediate() -> Self {
        Self {
            check_interval: Duration::ZERO,
            initial_check_delay: Duration::ZERO,
            bus_acquire_timeout: Duration::ZERO,
            bus_settle_delay: Duration::ZERO,
            ui_settle_delay: Duration::ZERO,
            reboot_grace: Duration::ZERO,
            complete_linger: Duration::ZERO,
            provider_retry: RetryPolicy::new(3, Duration::ZERO),
            checksum_retry: RetryPolicy::new(3, Duration::ZERO),
            loader_retry: RetryPolicy::new(2, Duration::ZERO),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_appliance_tuning() {
        let config = OtaConfig::default();
        assert_eq!(config.check_interval, Duration::from_secs(21_600));
        assert_eq!(config.initial_check_delay, Duration::from_secs(300));
        assert_eq!(config.write_chunk_size, 4096);
        assert_eq!(config.max_asset_image_size, 4 * 1024 * 1024);
        assert_eq!(config.asset_failure_threshold, 4);
        assert!(!config.dev_mode);
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let config: OtaConfig = serde_json::from_str(r#"{"dev_mode":true}"#).unwrap();
        assert!(config.dev_mode);
        assert_eq!(config.check_interval, OtaConfig::default().check_interval);
    }
}
