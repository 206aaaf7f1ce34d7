//! Firmware update pipeline over the A/B boot slots.
//!
//! Downloads always land in the inactive slot, so a mid-update power cut
//! leaves the running image untouched. The slot is verified against the
//! published checksum before the boot selector moves, and the boot loader
//! arms rollback until the new image confirms itself on first boot.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::checksum::{Checksum, ChecksumVerifier, SlotDigest};
use crate::config::OtaConfig;
use crate::device::{BootDevice, BootImageState};
use crate::error::OtaError;
use crate::policy::{BlockReason, ConnectivityProbe, PlaybackCoordinator, ProgressSink, UiController};
use crate::release::{ReleaseInfo, ReleaseProvider};
use crate::version::ReleaseVersion;

/// Lifecycle of the firmware pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirmwareState {
    /// Nothing to do.
    Idle,
    /// A scheduled or manual check is querying the release host.
    Checking,
    /// A newer release is staged and waiting for an install request.
    UpdateAvailable,
    /// The image is streaming into the inactive slot.
    Downloading,
    /// The flashed slot is being hashed against the published checksum.
    Verifying,
    /// The image is being finalized and the boot selector updated.
    Flashing,
    /// Install finished; the appliance is about to restart.
    PendingReboot,
    /// The last operation failed. Cleared by the next check.
    Error,
}

impl FirmwareState {
    /// Whether flash is being mutated right now.
    pub fn is_in_progress(&self) -> bool {
        matches!(self, Self::Downloading | Self::Verifying | Self::Flashing)
    }
}

impl fmt::Display for FirmwareState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Checking => "checking",
            Self::UpdateAvailable => "update_available",
            Self::Downloading => "downloading",
            Self::Verifying => "verifying",
            Self::Flashing => "flashing",
            Self::PendingReboot => "pending_reboot",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Copy-out snapshot of the firmware pipeline, shaped for the status API.
#[derive(Debug, Clone, Serialize)]
pub struct FirmwareStatus {
    /// Current pipeline state.
    pub state: FirmwareState,
    /// Version of the running firmware.
    pub current_version: ReleaseVersion,
    /// Version staged for install, when one is available.
    pub available_version: Option<ReleaseVersion>,
    /// Announced size of the staged image in bytes.
    pub available_size: Option<u64>,
    /// Notes published with the staged release.
    pub release_notes: Option<String>,
    /// Whether the staged release is marked prerelease.
    pub is_prerelease: bool,
    /// When the release host was last queried.
    pub last_check_time: Option<DateTime<Utc>>,
    /// Download or verify progress, 0 to 100.
    pub download_progress: u8,
    /// Human-readable description of the last failure.
    pub error_message: Option<String>,
    /// Whether the inactive slot holds a bootable image to fall back to.
    pub can_rollback: bool,
    /// Version of the fallback image, when one exists.
    pub rollback_version: Option<ReleaseVersion>,
    /// Whether developer mode (prerelease acceptance) is on.
    pub dev_mode: bool,
}

/// Single-flight gate keeping installs mutually exclusive.
///
/// Both pipelines hold one of these. The guard releases the gate on drop, so
/// every exit path of an install, including panics in tests, frees it.
#[derive(Debug, Default)]
pub struct InstallGate {
    engaged: AtomicBool,
}

impl InstallGate {
    /// Creates a released gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts to engage the gate. Returns `None` when an install already
    /// holds it.
    pub fn try_engage(&self) -> Option<GateGuard<'_>> {
        if self
            .engaged
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Some(GateGuard { gate: self })
        } else {
            None
        }
    }

    /// Whether an install currently holds the gate.
    pub fn is_engaged(&self) -> bool {
        self.engaged.load(Ordering::Acquire)
    }
}

/// RAII handle for an engaged [`InstallGate`].
#[derive(Debug)]
pub struct GateGuard<'a> {
    gate: &'a InstallGate,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.gate.engaged.store(false, Ordering::Release);
    }
}

struct PipelineState {
    state: FirmwareState,
    release: Option<ReleaseInfo>,
    last_check_time: Option<DateTime<Utc>>,
    download_progress: u8,
    error_message: Option<String>,
}

/// Firmware update pipeline.
pub struct FirmwareUpdater {
    config: OtaConfig,
    device: Arc<dyn BootDevice>,
    provider: Arc<dyn ReleaseProvider>,
    coordinator: Arc<dyn PlaybackCoordinator>,
    connectivity: Arc<dyn ConnectivityProbe>,
    verifier: ChecksumVerifier,
    gate: InstallGate,
    inner: Mutex<PipelineState>,
}

impl FirmwareUpdater {
    /// Wires the pipeline to its collaborators.
    pub fn new(
        config: OtaConfig,
        device: Arc<dyn BootDevice>,
        provider: Arc<dyn ReleaseProvider>,
        coordinator: Arc<dyn PlaybackCoordinator>,
        connectivity: Arc<dyn ConnectivityProbe>,
    ) -> Self {
        let verifier = ChecksumVerifier::new(config.write_chunk_size, 256 * 1024);
        Self {
            config,
            device,
            provider,
            coordinator,
            connectivity,
            verifier,
            gate: InstallGate::new(),
            inner: Mutex::new(PipelineState {
                state: FirmwareState::Idle,
                release: None,
                last_check_time: None,
                download_progress: 0,
                error_message: None,
            }),
        }
    }

    /// Current pipeline state.
    pub fn state(&self) -> FirmwareState {
        self.inner.lock().state
    }

    /// Whether a check against the release host is running.
    pub fn is_checking(&self) -> bool {
        self.state() == FirmwareState::Checking
    }

    /// Why an update cannot start right now, if anything forbids it.
    ///
    /// Streaming outranks a storage export, which outranks a running
    /// install, matching what a viewer would notice first.
    pub fn is_blocked(&self) -> Option<BlockReason> {
        if self.coordinator.is_streaming_active() {
            return Some(BlockReason::StreamingActive);
        }
        if self.coordinator.is_storage_exported() {
            return Some(BlockReason::StorageExported);
        }
        if self.state().is_in_progress() {
            return Some(BlockReason::InstallInProgress);
        }
        None
    }

    /// Snapshot of the pipeline plus rollback availability.
    pub async fn status(&self) -> FirmwareStatus {
        let fallback_slot = self.device.running_slot().other();
        let fallback = self
            .device
            .slot_descriptor(fallback_slot)
            .await
            .ok()
            .flatten();
        let inner = self.inner.lock();
        FirmwareStatus {
            state: inner.state,
            current_version: self.device.running_version(),
            available_version: inner.release.as_ref().map(|r| r.version.clone()),
            available_size: inner.release.as_ref().map(|r| r.size),
            release_notes: inner.release.as_ref().and_then(|r| r.release_notes.clone()),
            is_prerelease: inner.release.as_ref().is_some_and(|r| r.is_prerelease),
            last_check_time: inner.last_check_time,
            download_progress: inner.download_progress,
            error_message: inner.error_message.clone(),
            can_rollback: fallback.is_some(),
            rollback_version: fallback.map(|d| d.version),
            dev_mode: self.config.dev_mode,
        }
    }

    /// Installs the staged release into the inactive slot and restarts.
    ///
    /// Returns only on failure or after the restart request was issued. The
    /// panel is switched into update mode for the duration; every failure
    /// path restores it.
    ///
    /// # Errors
    ///
    /// [`OtaError::AlreadyInProgress`] when another install holds the gate,
    /// [`OtaError::InvalidState`] when no release is staged, and
    /// [`OtaError::Blocked`] when a runtime activity takes precedence. Later
    /// failures follow the stage that broke: network, checksum, or
    /// partition I/O.
    pub async fn install_update(
        &self,
        progress: &dyn ProgressSink,
        ui: &dyn UiController,
    ) -> Result<(), OtaError> {
        let _gate = self.gate.try_engage().ok_or(OtaError::AlreadyInProgress)?;

        if let Some(reason) = self.is_blocked() {
            return Err(OtaError::Blocked(reason));
        }
        let release = {
            let mut inner = self.inner.lock();
            if inner.state != FirmwareState::UpdateAvailable {
                return Err(OtaError::InvalidState(format!(
                    "no update staged (state: {})",
                    inner.state
                )));
            }
            inner.error_message = None;
            inner.download_progress = 0;
            match inner.release.clone() {
                Some(release) => release,
                None => {
                    return Err(OtaError::InvalidState(
                        "update available but no release recorded".to_string(),
                    ));
                }
            }
        };
        if !self.connectivity.is_online() {
            return Err(OtaError::Network("no network connectivity".to_string()));
        }

        let current = self.device.running_version();
        info!(from = %current, to = %release.version, "starting firmware install");
        ui.enter_update_mode(&current.to_string(), &release.version.to_string())
            .await;

        let result = self.run_install(&release, progress).await;
        if let Err(err) = &result {
            self.fail(err);
            ui.exit_update_mode().await;
        }
        result
    }

    async fn run_install(
        &self,
        release: &ReleaseInfo,
        progress: &dyn ProgressSink,
    ) -> Result<(), OtaError> {
        // Let the panel settle before saturating the link.
        tokio::time::sleep(self.config.ui_settle_delay).await;
        if !self.connectivity.is_online() {
            return Err(OtaError::Network(
                "network connectivity lost before download".to_string(),
            ));
        }

        // Fail closed: a release that advertises a checksum must yield one.
        let expected: Option<Checksum> = match &release.checksum_url {
            Some(url) => {
                self.push_progress(progress, 0, "Downloading checksum...");
                let sum = self
                    .config
                    .checksum_retry
                    .run("firmware checksum", |_| self.provider.fetch_checksum(url))
                    .await
                    .map_err(|err| match err {
                        OtaError::ChecksumUnavailable(_) => err,
                        other => OtaError::ChecksumUnavailable(other.to_string()),
                    })?;
                Some(sum)
            }
            None => {
                warn!("release publishes no checksum, installing unverified");
                None
            }
        };

        self.set_state(FirmwareState::Downloading);
        self.push_progress(progress, 0, "Connecting to release server...");
        let mut stream = self.provider.open_image(&release.download_url).await?;
        let announced = if stream.total_size() > 0 {
            stream.total_size()
        } else {
            release.size
        };

        let target = self.device.running_slot().other();
        self.device.prepare_slot(target).await.map_err(|e| {
            OtaError::PartitionIo(format!("failed to prepare slot {target}: {e:#}"))
        })?;

        let mut written: u64 = 0;
        let mut last_percent: u8 = 0;
        while let Some(chunk) = stream.next_chunk().await? {
            self.device
                .write_chunk(target, written, &chunk)
                .await
                .map_err(|e| {
                    OtaError::PartitionIo(format!(
                        "write failed at offset {written} in slot {target}: {e:#}"
                    ))
                })?;
            written += chunk.len() as u64;
            if announced > 0 {
                let percent = (written.saturating_mul(100) / announced).min(99) as u8;
                if percent != last_percent {
                    last_percent = percent;
                    self.push_progress(progress, percent, "Downloading firmware...");
                }
            }
        }
        if written == 0 {
            return Err(OtaError::Network("empty firmware image".to_string()));
        }
        if announced > 0 && written != announced {
            return Err(OtaError::Network(format!(
                "incomplete download: {written} of {announced} bytes"
            )));
        }
        debug!(bytes = written, slot = %target, "firmware image written");

        self.set_state(FirmwareState::Flashing);
        self.push_progress(progress, 100, "Finalizing image...");
        self.device
            .finalize_slot(target, written)
            .await
            .map_err(|e| {
                OtaError::PartitionIo(format!("failed to finalize slot {target}: {e:#}"))
            })?;

        if let Some(expected) = &expected {
            self.set_state(FirmwareState::Verifying);
            self.push_progress(progress, 0, "Verifying checksum...");
            let digest = SlotDigest::new(self.device.as_ref(), target, written);
            self.verifier
                .verify(&digest, expected, |p| {
                    self.push_progress(progress, p, "Verifying checksum...")
                })
                .await?;
        }

        self.device.set_boot_slot(target).await.map_err(|e| {
            OtaError::PartitionIo(format!("failed to select boot slot {target}: {e:#}"))
        })?;

        self.set_state(FirmwareState::PendingReboot);
        self.push_progress(progress, 100, "Update installed, rebooting...");
        info!(version = %release.version, slot = %target, "firmware installed, restarting");
        tokio::time::sleep(self.config.reboot_grace).await;
        self.device
            .restart()
            .await
            .map_err(|e| OtaError::PartitionIo(format!("restart request failed: {e:#}")))?;
        Ok(())
    }

    /// Boots the image in the inactive slot by moving the boot selector.
    ///
    /// # Errors
    ///
    /// [`OtaError::NotFound`] when the inactive slot holds no readable
    /// image, [`OtaError::AlreadyInProgress`] while an install runs.
    pub async fn rollback(&self) -> Result<(), OtaError> {
        let _gate = self.gate.try_engage().ok_or(OtaError::AlreadyInProgress)?;
        let target = self.device.running_slot().other();
        let descriptor = self
            .device
            .slot_descriptor(target)
            .await
            .map_err(|e| OtaError::PartitionIo(format!("failed to read slot {target}: {e:#}")))?
            .ok_or_else(|| OtaError::NotFound(format!("no valid image in slot {target}")))?;
        info!(
            from = %self.device.running_version(),
            to = %descriptor.version,
            slot = %target,
            "rolling back firmware"
        );
        self.device.set_boot_slot(target).await.map_err(|e| {
            OtaError::PartitionIo(format!("failed to select boot slot {target}: {e:#}"))
        })?;
        tokio::time::sleep(self.config.reboot_grace).await;
        self.device
            .restart()
            .await
            .map_err(|e| OtaError::PartitionIo(format!("restart request failed: {e:#}")))?;
        Ok(())
    }

    /// Confirms the running image after a successful boot.
    ///
    /// Called once early in startup. Until this runs after a first boot,
    /// the boot loader will fall back to the previous slot on restart.
    ///
    /// # Errors
    ///
    /// [`OtaError::PartitionIo`] when the confirmation cannot be recorded.
    pub async fn validate_boot(&self) -> Result<(), OtaError> {
        let state = self
            .device
            .boot_image_state()
            .await
            .map_err(|e| OtaError::PartitionIo(format!("failed to read boot state: {e:#}")))?;
        match state {
            BootImageState::PendingVerify => {
                self.device.mark_boot_valid().await.map_err(|e| {
                    OtaError::PartitionIo(format!("failed to confirm boot image: {e:#}"))
                })?;
                info!(version = %self.device.running_version(), "first boot after update confirmed");
            }
            BootImageState::Valid => debug!("boot image already confirmed"),
            BootImageState::Invalid => {
                warn!("running image is marked invalid, loader will roll back");
            }
        }
        Ok(())
    }

    pub(crate) fn set_state(&self, state: FirmwareState) {
        let mut inner = self.inner.lock();
        if inner.state != state {
            debug!(from = %inner.state, to = %state, "firmware state changed");
            inner.state = state;
        }
    }

    pub(crate) fn begin_checking(&self) {
        let mut inner = self.inner.lock();
        inner.state = FirmwareState::Checking;
        inner.error_message = None;
    }

    /// Records the outcome of a check. `outcome` carries the newest release
    /// when the host answered, `error` a description when the query failed.
    pub(crate) fn finish_check(&self, outcome: Option<ReleaseInfo>, error: Option<String>) {
        let current = self.device.running_version();
        let mut inner = self.inner.lock();
        inner.last_check_time = Some(Utc::now());
        inner.error_message = error;
        match outcome {
            Some(release) if release.is_prerelease && !self.config.dev_mode => {
                info!(available = %release.version, "ignoring prerelease");
                inner.release = None;
                inner.state = FirmwareState::Idle;
            }
            Some(release) if release.version > current => {
                info!(current = %current, available = %release.version, "firmware update available");
                inner.release = Some(release);
                inner.state = FirmwareState::UpdateAvailable;
            }
            Some(release) => {
                info!(current = %current, newest = %release.version, "firmware is up to date");
                inner.release = None;
                inner.state = FirmwareState::Idle;
            }
            None => {
                inner.release = None;
                inner.state = FirmwareState::Idle;
            }
        }
    }

    fn fail(&self, err: &OtaError) {
        warn!(error = %err, "firmware install failed");
        let mut inner = self.inner.lock();
        inner.state = FirmwareState::Error;
        inner.error_message = Some(err.to_string());
    }

    fn push_progress(&self, sink: &dyn ProgressSink, percent: u8, message: &str) {
        self.inner.lock().download_progress = percent;
        sink.progress(percent, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_progress_covers_only_mutating_states() {
        assert!(FirmwareState::Downloading.is_in_progress());
        assert!(FirmwareState::Verifying.is_in_progress());
        assert!(FirmwareState::Flashing.is_in_progress());
        assert!(!FirmwareState::Idle.is_in_progress());
        assert!(!FirmwareState::Checking.is_in_progress());
        assert!(!FirmwareState::UpdateAvailable.is_in_progress());
        assert!(!FirmwareState::PendingReboot.is_in_progress());
        assert!(!FirmwareState::Error.is_in_progress());
    }

    #[test]
    fn state_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&FirmwareState::UpdateAvailable).unwrap(),
            "\"update_available\""
        );
        assert_eq!(FirmwareState::PendingReboot.to_string(), "pending_reboot");
    }

    #[test]
    fn gate_is_single_flight() {
        let gate = InstallGate::new();
        let first = gate.try_engage();
        assert!(first.is_some());
        assert!(gate.is_engaged());
        assert!(gate.try_engage().is_none());
        drop(first);
        assert!(!gate.is_engaged());
        assert!(gate.try_engage().is_some());
    }
}
