//! Web-asset update pipeline over the dedicated asset partition.
//!
//! Unlike firmware, the asset partition has no second slot. The pipeline
//! buffers and verifies the whole image in memory before the first
//! destructive write, and persists recovery flags around the destructive
//! window so a power cut leaves the partition marked untrustworthy rather
//! than silently corrupt.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::checksum::{AssetDigest, Checksum, ChecksumVerifier};
use crate::config::OtaConfig;
use crate::device::{AssetFilesystem, AssetPartition};
use crate::error::OtaError;
use crate::firmware::InstallGate;
use crate::flags::{RecoveryFlags, RecoveryFlagStore};
use crate::policy::{NullProgress, ProgressSink};
use crate::release::{AssetRelease, ReleaseManifest, ReleaseProvider};
use crate::version::ReleaseVersion;

/// Lifecycle of the asset pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetState {
    /// Nothing to do.
    Idle,
    /// The image is being buffered and pre-verified in memory.
    Downloading,
    /// The asset filesystem is being taken offline.
    Unmounting,
    /// The partition is being erased.
    Erasing,
    /// The image is streaming onto flash.
    Writing,
    /// Flash contents are being hashed against the published checksum.
    Verifying,
    /// The filesystem is being brought back online.
    Remounting,
    /// A verified install just finished.
    Complete,
    /// The last install failed. Cleared by the next attempt.
    Error,
}

impl fmt::Display for AssetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Downloading => "downloading",
            Self::Unmounting => "unmounting",
            Self::Erasing => "erasing",
            Self::Writing => "writing",
            Self::Verifying => "verifying",
            Self::Remounting => "remounting",
            Self::Complete => "complete",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Copy-out snapshot of the asset pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct AssetStatus {
    /// Current pipeline state.
    pub state: AssetState,
    /// Version marker read from the mounted filesystem, when readable.
    pub current_version: Option<String>,
    /// Newest published bundle version, once a manifest was seen.
    pub available_version: Option<ReleaseVersion>,
    /// Whether the published bundle is newer than what is installed.
    pub update_available: bool,
    /// Whether the partition is currently considered trustworthy.
    pub partition_valid: bool,
    /// Whether a reinstall was requested regardless of versions.
    pub needs_recovery: bool,
    /// Consecutive failed installs.
    pub failure_count: u8,
    /// Whether the failure count has tripped the circuit breaker.
    pub auto_update_disabled: bool,
    /// Install progress, 0 to 100.
    pub progress: u8,
    /// Short human-readable description of the current stage.
    pub status_message: String,
    /// Human-readable description of the last failure.
    pub error_message: Option<String>,
}

struct AssetInner {
    state: AssetState,
    progress: u8,
    status_message: String,
    error_message: Option<String>,
    current_version: Option<String>,
    available_version: Option<ReleaseVersion>,
    update_available: bool,
    flags: RecoveryFlags,
}

/// Web-asset update pipeline.
pub struct AssetUpdater {
    config: OtaConfig,
    partition: Arc<dyn AssetPartition>,
    filesystem: Arc<dyn AssetFilesystem>,
    flag_store: Arc<dyn RecoveryFlagStore>,
    provider: Arc<dyn ReleaseProvider>,
    verifier: ChecksumVerifier,
    gate: InstallGate,
    inner: Mutex<AssetInner>,
}

impl AssetUpdater {
    /// Wires the pipeline to its collaborators.
    pub fn new(
        config: OtaConfig,
        partition: Arc<dyn AssetPartition>,
        filesystem: Arc<dyn AssetFilesystem>,
        flag_store: Arc<dyn RecoveryFlagStore>,
        provider: Arc<dyn ReleaseProvider>,
    ) -> Self {
        let verifier = ChecksumVerifier::new(config.write_chunk_size, 256 * 1024);
        Self {
            config,
            partition,
            filesystem,
            flag_store,
            provider,
            verifier,
            gate: InstallGate::new(),
            inner: Mutex::new(AssetInner {
                state: AssetState::Idle,
                progress: 0,
                status_message: String::new(),
                error_message: None,
                current_version: None,
                available_version: None,
                update_available: false,
                flags: RecoveryFlags::default(),
            }),
        }
    }

    /// Current pipeline state.
    pub fn state(&self) -> AssetState {
        self.inner.lock().state
    }

    /// Snapshot of the pipeline, refreshing the on-disk flags and the
    /// mounted version marker.
    pub async fn status(&self) -> AssetStatus {
        let flags = self.load_flags().await;
        let marker = match self.filesystem.read_version_marker().await {
            Ok(marker) => marker,
            Err(_) => None,
        };
        let mut inner = self.inner.lock();
        inner.flags = flags;
        if marker.is_some() {
            inner.current_version = marker;
        }
        AssetStatus {
            state: inner.state,
            current_version: inner.current_version.clone(),
            available_version: inner.available_version.clone(),
            update_available: inner.update_available,
            partition_valid: !flags.partition_invalid,
            needs_recovery: flags.needs_recovery,
            failure_count: flags.failure_count,
            auto_update_disabled: flags.failure_count > self.config.asset_failure_threshold,
            progress: inner.progress,
            status_message: inner.status_message.clone(),
            error_message: inner.error_message.clone(),
        }
    }

    /// Whether the asset partition can be trusted to serve the web UI.
    ///
    /// False when the persisted flags condemn it or when the version marker
    /// cannot be read from the mounted filesystem.
    pub async fn is_partition_healthy(&self) -> bool {
        let flags = self.load_flags().await;
        self.inner.lock().flags = flags;
        if flags.partition_invalid {
            warn!("asset partition is flagged invalid");
            return false;
        }
        if flags.needs_recovery {
            warn!("asset partition has a pending recovery request");
            return false;
        }
        match self.filesystem.read_version_marker().await {
            Ok(Some(version)) => {
                debug!(version = %version, "asset partition healthy");
                self.inner.lock().current_version = Some(version);
                true
            }
            Ok(None) => {
                warn!("asset version marker missing");
                false
            }
            Err(err) => {
                warn!(error = %err, "asset version marker unreadable");
                false
            }
        }
    }

    /// Requests a reinstall of the assets at the next opportunity, surviving
    /// restarts.
    ///
    /// # Errors
    ///
    /// Propagates flag-store failures as [`OtaError::Filesystem`].
    pub async fn set_needs_recovery(&self) -> Result<(), OtaError> {
        let mut flags = self.load_flags().await;
        flags.needs_recovery = true;
        self.persist_flags(flags).await?;
        info!("asset recovery requested");
        Ok(())
    }

    /// Downloads, verifies, and flashes the asset bundle at `url`.
    ///
    /// The image is fully buffered and checked against `expected` before
    /// anything destructive happens. With no published checksum the install
    /// proceeds unverified, which the logs call out.
    ///
    /// # Errors
    ///
    /// [`OtaError::AlreadyInProgress`] when an install holds the gate;
    /// otherwise the error of whichever stage failed. After any failure the
    /// persisted flags keep the partition condemned and count the attempt.
    pub async fn install_update(
        &self,
        url: &str,
        expected: Option<&Checksum>,
        progress: &dyn ProgressSink,
    ) -> Result<(), OtaError> {
        let _gate = self.gate.try_engage().ok_or(OtaError::AlreadyInProgress)?;

        {
            let mut inner = self.inner.lock();
            inner.error_message = None;
            inner.progress = 0;
        }

        // Count the attempt up front so a power cut mid-install still
        // registers as a failure after reboot.
        let mut flags = self.load_flags().await;
        flags.failure_count = flags.failure_count.saturating_add(1);
        if let Err(err) = self.persist_flags(flags).await {
            self.fail(&err);
            return Err(err);
        }

        info!(url, "starting web-asset install");
        let result = match self.run_install(url, expected, progress).await {
            // A verified install clears the whole slate. A failure to clear
            // still counts as a failed install: the partition stays condemned.
            Ok(()) => self.persist_flags(RecoveryFlags::default()).await,
            Err(err) => Err(err),
        };
        match &result {
            Ok(()) => self.finish_complete(progress).await,
            Err(err) => self.fail(err),
        }
        result
    }

    async fn run_install(
        &self,
        url: &str,
        expected: Option<&Checksum>,
        progress: &dyn ProgressSink,
    ) -> Result<(), OtaError> {
        self.set_stage(AssetState::Downloading, progress, 0, "Downloading assets...");

        let cap = self
            .config
            .max_asset_image_size
            .min(self.partition.capacity());
        let mut stream = self.provider.open_image(url).await?;
        let announced = stream.total_size();
        if announced > cap {
            return Err(OtaError::ImageTooLarge {
                size: announced,
                limit: cap,
            });
        }

        let mut image: Vec<u8> = Vec::new();
        if announced > 0 {
            let want = usize::try_from(announced)
                .map_err(|_| OtaError::OutOfMemory("image size exceeds address space".into()))?;
            image
                .try_reserve_exact(want)
                .map_err(|_| OtaError::OutOfMemory("cannot buffer asset image".into()))?;
        }
        let mut last_percent: u8 = 0;
        while let Some(chunk) = stream.next_chunk().await? {
            if image.len() as u64 + chunk.len() as u64 > cap {
                return Err(OtaError::ImageTooLarge {
                    size: image.len() as u64 + chunk.len() as u64,
                    limit: cap,
                });
            }
            image
                .try_reserve(chunk.len())
                .map_err(|_| OtaError::OutOfMemory("cannot buffer asset image".into()))?;
            image.extend_from_slice(&chunk);
            if announced > 0 {
                let percent = ((image.len() as u64).saturating_mul(100) / announced).min(99) as u8;
                if percent != last_percent {
                    last_percent = percent;
                    self.set_stage(AssetState::Downloading, progress, percent, "Downloading assets...");
                }
            }
        }
        if image.is_empty() {
            return Err(OtaError::Network("empty asset image".to_string()));
        }
        debug!(bytes = image.len(), "asset image buffered");

        // Pre-verify in memory. Nothing destructive has happened yet, so a
        // bad download leaves the partition untouched.
        match expected {
            Some(expected) => {
                let computed = Checksum::of(&image);
                if computed != *expected {
                    return Err(OtaError::ChecksumMismatch {
                        expected: expected.to_hex(),
                        computed: computed.to_hex(),
                    });
                }
            }
            None => warn!("no published checksum for asset bundle, installing unverified"),
        }

        // The destructive window opens here. Condemn the partition first so
        // an interruption is visible after reboot.
        let mut flags = self.inner.lock().flags;
        flags.partition_invalid = true;
        self.persist_flags(flags).await?;

        self.set_stage(AssetState::Unmounting, progress, 0, "Unmounting filesystem...");
        if let Err(err) = self.filesystem.unmount().await {
            // Not fatal: the partition may simply not be mounted yet.
            warn!(error = %err, "asset filesystem unmount failed, continuing");
        }

        self.set_stage(AssetState::Erasing, progress, 0, "Erasing partition...");
        self.partition
            .erase()
            .await
            .map_err(|e| OtaError::PartitionIo(format!("erase failed: {e:#}")))?;

        self.set_stage(AssetState::Writing, progress, 0, "Writing assets...");
        let mut offset: u64 = 0;
        let mut last_percent: u8 = 0;
        for chunk in image.chunks(self.config.write_chunk_size.max(1)) {
            self.partition.write(offset, chunk).await.map_err(|e| {
                OtaError::PartitionIo(format!("write failed at offset {offset}: {e:#}"))
            })?;
            offset += chunk.len() as u64;
            let percent = (offset.saturating_mul(100) / image.len() as u64).min(99) as u8;
            if percent != last_percent {
                last_percent = percent;
                self.set_stage(AssetState::Writing, progress, percent, "Writing assets...");
            }
        }

        // Fail closed: what matters is the bytes on flash, not the buffer.
        if let Some(expected) = expected {
            self.set_stage(AssetState::Verifying, progress, 0, "Verifying partition...");
            let digest = AssetDigest::new(self.partition.as_ref(), image.len() as u64);
            self.verifier
                .verify(&digest, expected, |p| {
                    self.set_stage(AssetState::Verifying, progress, p, "Verifying partition...")
                })
                .await?;
        }

        self.set_stage(AssetState::Remounting, progress, 99, "Remounting filesystem...");
        self.filesystem
            .mount()
            .await
            .map_err(|e| OtaError::Filesystem(format!("remount failed: {e:#}")))?;
        let marker = self
            .filesystem
            .read_version_marker()
            .await
            .map_err(|e| OtaError::Filesystem(format!("version marker unreadable: {e:#}")))?
            .ok_or_else(|| {
                OtaError::Filesystem("version marker missing after install".to_string())
            })?;
        info!(version = %marker, "web-asset install verified");
        {
            let mut inner = self.inner.lock();
            inner.current_version = Some(marker);
            inner.update_available = false;
        }
        Ok(())
    }

    /// Reinstalls the latest published bundle regardless of versions or the
    /// failure circuit breaker. This is the manual escape hatch behind the
    /// repair action in the settings UI.
    ///
    /// # Errors
    ///
    /// [`OtaError::NotFound`] when the manifest carries no asset bundle,
    /// plus everything [`AssetUpdater::install_update`] can return.
    pub async fn trigger_repair(&self) -> Result<(), OtaError> {
        if self.gate.is_engaged() {
            return Err(OtaError::AlreadyInProgress);
        }
        let manifest = self.provider.release_manifest().await?;
        let asset = manifest
            .web_assets
            .ok_or_else(|| OtaError::NotFound("no web-asset bundle published".to_string()))?;
        info!(version = %asset.version, "manual asset repair requested");
        self.install_update(&asset.download_url, asset.checksum.as_ref(), &NullProgress)
            .await
    }

    /// Scheduled evaluation against a freshly fetched manifest. Installs
    /// when the partition is unhealthy or a newer bundle is published,
    /// unless the circuit breaker is tripped.
    pub(crate) async fn evaluate_manifest(&self, manifest: &ReleaseManifest) {
        let Some(asset) = &manifest.web_assets else {
            debug!("manifest carries no web-asset bundle");
            return;
        };
        {
            let mut inner = self.inner.lock();
            inner.available_version = Some(asset.version.clone());
        }

        let healthy = self.is_partition_healthy().await;
        let flags = self.inner.lock().flags;
        if flags.failure_count > self.config.asset_failure_threshold {
            warn!(
                failures = flags.failure_count,
                "asset auto-update disabled after repeated failures, manual repair required"
            );
            return;
        }

        if !healthy {
            info!(version = %asset.version, "asset partition unhealthy, reinstalling");
            self.auto_install(asset).await;
            return;
        }

        let current = self.inner.lock().current_version.clone();
        let newer = current
            .as_deref()
            .and_then(|current| ReleaseVersion::try_compare(&asset.version.to_string(), current))
            .is_some_and(std::cmp::Ordering::is_gt);
        if newer {
            info!(available = %asset.version, "newer asset bundle published");
            {
                let mut inner = self.inner.lock();
                inner.update_available = true;
            }
            self.auto_install(asset).await;
        } else {
            debug!(version = %asset.version, "asset bundle is up to date");
        }
    }

    async fn auto_install(&self, asset: &AssetRelease) {
        match self
            .install_update(&asset.download_url, asset.checksum.as_ref(), &NullProgress)
            .await
        {
            Ok(()) => info!(version = %asset.version, "scheduled asset install complete"),
            Err(err) => warn!(error = %err, "scheduled asset install failed"),
        }
    }

    async fn load_flags(&self) -> RecoveryFlags {
        match self.flag_store.load().await {
            Ok(flags) => flags,
            Err(err) => {
                warn!(error = %err, "failed to load recovery flags, assuming defaults");
                RecoveryFlags::default()
            }
        }
    }

    async fn persist_flags(&self, flags: RecoveryFlags) -> Result<(), OtaError> {
        self.flag_store
            .store(flags)
            .await
            .map_err(|e| OtaError::Filesystem(format!("cannot persist recovery flags: {e:#}")))?;
        self.inner.lock().flags = flags;
        Ok(())
    }

    async fn finish_complete(&self, progress: &dyn ProgressSink) {
        self.set_stage(AssetState::Complete, progress, 100, "Update complete");
        tokio::time::sleep(self.config.complete_linger).await;
        let mut inner = self.inner.lock();
        inner.state = AssetState::Idle;
        inner.status_message.clear();
        inner.progress = 0;
    }

    fn fail(&self, err: &OtaError) {
        warn!(error = %err, "web-asset install failed");
        let mut inner = self.inner.lock();
        inner.state = AssetState::Error;
        inner.error_message = Some(err.to_string());
        inner.status_message = err.to_string();
    }

    fn set_stage(&self, state: AssetState, sink: &dyn ProgressSink, percent: u8, message: &str) {
        {
            let mut inner = self.inner.lock();
            if inner.state != state {
                debug!(from = %inner.state, to = %state, "asset state changed");
                inner.state = state;
            }
            inner.progress = percent;
            inner.status_message = message.to_string();
        }
        sink.progress(percent, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&AssetState::Remounting).unwrap(),
            "\"remounting\""
        );
        assert_eq!(AssetState::Unmounting.to_string(), "unmounting");
    }
}
