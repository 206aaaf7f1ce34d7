//! Release discovery and image transfer contracts.
//!
//! The pipelines are transport-agnostic. A [`ReleaseProvider`] fronts
//! whatever release host the appliance is pointed at and owns all HTTP
//! details; the pipelines only see typed release data and chunked byte
//! streams.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::checksum::Checksum;
use crate::error::OtaError;
use crate::version::ReleaseVersion;

/// A published firmware release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseInfo {
    /// Version tag of the release.
    pub version: ReleaseVersion,
    /// Where to stream the firmware image from.
    pub download_url: String,
    /// Where to fetch the published SHA-256 digest, when the host offers one.
    pub checksum_url: Option<String>,
    /// Announced image size in bytes, zero when unknown.
    pub size: u64,
    /// Human-readable notes attached to the release.
    pub release_notes: Option<String>,
    /// Whether the host marks this release as a prerelease.
    pub is_prerelease: bool,
}

/// A published web-asset bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRelease {
    /// Version tag of the asset bundle.
    pub version: ReleaseVersion,
    /// Where to download the raw filesystem image from.
    pub download_url: String,
    /// Published digest of the image, when the host offers one.
    pub checksum: Option<Checksum>,
}

/// Everything the release host publishes for one release cycle.
#[derive(Debug, Clone, Default)]
pub struct ReleaseManifest {
    /// Latest firmware release, if any exists.
    pub firmware: Option<ReleaseInfo>,
    /// Matching web-asset bundle, if the release ships one.
    pub web_assets: Option<AssetRelease>,
}

/// A chunked download in flight.
#[async_trait]
pub trait ImageStream: Send {
    /// Announced total size in bytes, zero when the host did not say.
    fn total_size(&self) -> u64;

    /// Next chunk of the image, or `None` at end of stream.
    ///
    /// # Errors
    ///
    /// Returns [`OtaError::Network`] when the transfer breaks mid-stream.
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, OtaError>;
}

/// Client for the release host.
#[async_trait]
pub trait ReleaseProvider: Send + Sync {
    /// Queries the newest published firmware release.
    ///
    /// # Errors
    ///
    /// [`OtaError::NotFound`] when the host has no releases, or
    /// [`OtaError::Network`] on transport failure.
    async fn latest_release(&self) -> Result<ReleaseInfo, OtaError>;

    /// Queries the full manifest for the newest release cycle.
    ///
    /// # Errors
    ///
    /// Same taxonomy as [`ReleaseProvider::latest_release`].
    async fn release_manifest(&self) -> Result<ReleaseManifest, OtaError>;

    /// Downloads and parses the published digest at `url`.
    ///
    /// # Errors
    ///
    /// [`OtaError::Network`] on transport failure or
    /// [`OtaError::ChecksumUnavailable`] when the payload is not a digest.
    async fn fetch_checksum(&self, url: &str) -> Result<Checksum, OtaError>;

    /// Opens a chunked download of the image at `url`.
    ///
    /// # Errors
    ///
    /// [`OtaError::Network`] when the transfer cannot be started.
    async fn open_image(&self, url: &str) -> Result<Box<dyn ImageStream>, OtaError>;
}
