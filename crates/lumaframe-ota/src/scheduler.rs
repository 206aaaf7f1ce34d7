//! Scheduled update checks with shared-bus arbitration.
//!
//! Checks defer to everything interactive. A check only proceeds when no
//! UI session, stream, or storage export is active, the media loader has
//! gone quiet, and the shared storage bus could be acquired. While the bus
//! is held, playback is paused so loader DMA and download traffic never
//! interleave.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use lumaframe_bus::SharedBus;
use tracing::{debug, info, warn};

use crate::assets::AssetUpdater;
use crate::config::OtaConfig;
use crate::error::OtaError;
use crate::firmware::FirmwareUpdater;
use crate::policy::{ConnectivityProbe, PlaybackCoordinator};
use crate::release::ReleaseProvider;

const BUS_OWNER: &str = "ota-check";

/// Background driver for periodic update checks.
pub struct UpdateScheduler {
    config: OtaConfig,
    firmware: Arc<FirmwareUpdater>,
    assets: Arc<AssetUpdater>,
    provider: Arc<dyn ReleaseProvider>,
    coordinator: Arc<dyn PlaybackCoordinator>,
    connectivity: Arc<dyn ConnectivityProbe>,
    bus: Arc<SharedBus>,
    check_in_flight: AtomicBool,
}

impl UpdateScheduler {
    /// Wires the scheduler to both pipelines and the shared bus.
    pub fn new(
        config: OtaConfig,
        firmware: Arc<FirmwareUpdater>,
        assets: Arc<AssetUpdater>,
        provider: Arc<dyn ReleaseProvider>,
        coordinator: Arc<dyn PlaybackCoordinator>,
        connectivity: Arc<dyn ConnectivityProbe>,
        bus: Arc<SharedBus>,
    ) -> Self {
        Self {
            config,
            firmware,
            assets,
            provider,
            coordinator,
            connectivity,
            bus,
            check_in_flight: AtomicBool::new(false),
        }
    }

    /// Spawns the periodic check loop. The first check waits out the boot
    /// path; later ones run at the configured interval.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            info!(
                initial_delay = ?scheduler.config.initial_check_delay,
                interval = ?scheduler.config.check_interval,
                "update check schedule started"
            );
            tokio::time::sleep(scheduler.config.initial_check_delay).await;
            loop {
                if let Err(err) = scheduler.check_now() {
                    debug!(error = %err, "scheduled check skipped");
                }
                tokio::time::sleep(scheduler.config.check_interval).await;
            }
        })
    }

    /// Kicks off a check in the background. Non-blocking; callers observe
    /// the outcome through [`FirmwareUpdater::status`].
    ///
    /// # Errors
    ///
    /// [`OtaError::AlreadyInProgress`] when a check is already in flight.
    pub fn check_now(self: &Arc<Self>) -> Result<(), OtaError> {
        if self
            .check_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(OtaError::AlreadyInProgress);
        }
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            scheduler.run_check().await;
            scheduler.check_in_flight.store(false, Ordering::Release);
        });
        Ok(())
    }

    /// Whether a check is currently in flight.
    pub fn is_checking(&self) -> bool {
        self.check_in_flight.load(Ordering::Acquire)
    }

    async fn run_check(&self) {
        // Interactive activities win outright; there is no point waiting.
        if self.coordinator.is_ui_session_active() {
            info!("skipping update check: UI session active");
            return;
        }
        if self.coordinator.is_streaming_active() {
            info!("skipping update check: streaming active");
            return;
        }
        if self.coordinator.is_storage_exported() {
            info!("skipping update check: storage exported");
            return;
        }

        // The loader finishes on its own; probe until it does or give up.
        let loader = self.config.loader_retry;
        let mut probes = 0;
        while self.coordinator.is_loader_busy() {
            probes += 1;
            if probes >= loader.max_attempts.max(1) {
                warn!("skipping update check: media loader still busy");
                return;
            }
            debug!(probe = probes, "media loader busy, waiting");
            tokio::time::sleep(loader.backoff).await;
        }

        let guard = match self
            .bus
            .acquire(self.config.bus_acquire_timeout, BUS_OWNER)
            .await
        {
            Ok(guard) => guard,
            Err(err) => {
                warn!(error = %err, "skipping update check: storage bus unavailable");
                return;
            }
        };

        // Playback stays off the bus while we hold it.
        self.coordinator.pause_storage_access();
        tokio::time::sleep(self.config.bus_settle_delay).await;
        self.firmware.begin_checking();

        let outcome = if self.connectivity.is_online() {
            self.config
                .provider_retry
                .run("release query", |_| self.provider.latest_release())
                .await
        } else {
            Err(OtaError::Network("no network connectivity".to_string()))
        };

        self.coordinator.resume_storage_access();
        drop(guard);

        match outcome {
            Ok(release) => {
                self.firmware.finish_check(Some(release), None);
                self.evaluate_assets().await;
            }
            Err(OtaError::NotFound(reason)) => {
                info!(reason = %reason, "no published firmware release");
                self.firmware.finish_check(None, None);
            }
            Err(err) => {
                warn!(error = %err, "update check failed");
                self.firmware.finish_check(None, Some(err.to_string()));
            }
        }
    }

    async fn evaluate_assets(&self) {
        match self.provider.release_manifest().await {
            Ok(manifest) => self.assets.evaluate_manifest(&manifest).await,
            Err(err) => warn!(error = %err, "could not fetch release manifest for assets"),
        }
    }
}
