//! Error types for over-the-air updates.

use thiserror::Error;

use crate::policy::BlockReason;

/// Errors surfaced by the update pipelines.
#[derive(Error, Debug)]
pub enum OtaError {
    /// An install or check is already running.
    #[error("Update already in progress")]
    AlreadyInProgress,

    /// The requested operation is not valid in the current state.
    #[error("Invalid state for operation: {0}")]
    InvalidState(String),

    /// A runtime activity takes precedence over the update.
    #[error("Update blocked: {0}")]
    Blocked(BlockReason),

    /// A requested release, manifest entry, or slot image does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Network-level failure talking to the release host.
    #[error("Network error: {0}")]
    Network(String),

    /// The published checksum could not be retrieved or parsed.
    #[error("Checksum unavailable: {0}")]
    ChecksumUnavailable(String),

    /// The computed digest does not match the published one.
    #[error("Checksum mismatch: expected {expected}, computed {computed}")]
    ChecksumMismatch {
        /// Digest published alongside the release.
        expected: String,
        /// Digest computed over the local bytes.
        computed: String,
    },

    /// Read, write, erase, or finalize failure on flash.
    #[error("Partition I/O error: {0}")]
    PartitionIo(String),

    /// Mount, unmount, or marker-file failure on the asset filesystem.
    #[error("Filesystem error: {0}")]
    Filesystem(String),

    /// The downloaded image does not fit the target partition or buffer cap.
    #[error("Image too large: {size} bytes exceeds limit of {limit} bytes")]
    ImageTooLarge {
        /// Announced or received image size.
        size: u64,
        /// Partition capacity or configured buffer cap.
        limit: u64,
    },

    /// The download buffer could not be allocated.
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// The shared storage bus could not be acquired.
    #[error("Storage bus unavailable: {0}")]
    Bus(#[from] lumaframe_bus::BusError),

    /// Persisted state could not be serialized or parsed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error outside the flash partitions.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl OtaError {
    /// Whether a retry with backoff could plausibly succeed.
    ///
    /// Fetch loops retry transient errors and give up immediately on the
    /// rest. A missing release stays missing no matter how often it is
    /// requested.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Bus(_))
    }
}
