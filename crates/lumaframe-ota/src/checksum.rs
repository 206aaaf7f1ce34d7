//! Streaming SHA-256 verification of flashed images.
//!
//! Verification always happens against the bytes that actually landed on
//! flash, never against the download buffer alone. Reads go through
//! [`DigestSource`] so the same verifier covers boot slots, the asset
//! partition, and in-memory buffers.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::device::{AssetPartition, BootDevice, BootSlot};
use crate::error::OtaError;

/// A SHA-256 digest, parsed from the release host or computed locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checksum([u8; 32]);

impl Checksum {
    /// Parses a 64-character hex digest, tolerating surrounding whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`OtaError::ChecksumUnavailable`] when the text is not a
    /// well-formed SHA-256 digest. A malformed published checksum is treated
    /// the same as a missing one: the update is refused.
    pub fn from_hex(text: &str) -> Result<Self, OtaError> {
        let trimmed = text.trim();
        let raw = hex::decode(trimmed).map_err(|_| {
            OtaError::ChecksumUnavailable(format!("not a hex digest: {trimmed:?}"))
        })?;
        let bytes: [u8; 32] = raw.try_into().map_err(|_| {
            OtaError::ChecksumUnavailable(format!(
                "digest has wrong length: {} hex chars",
                trimmed.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    /// Computes the digest of an in-memory buffer.
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// The raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex rendering.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl serde::Serialize for Checksum {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Checksum {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = <String as serde::Deserialize>::deserialize(deserializer)?;
        Self::from_hex(&raw).map_err(serde::de::Error::custom)
    }
}

/// A byte range that can be digested in chunks.
#[async_trait]
pub trait DigestSource: Sync {
    /// Total number of bytes to digest.
    fn size(&self) -> u64;

    /// Fills `buf` starting at `offset`. Callers never read past
    /// [`DigestSource::size`].
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> anyhow::Result<()>;
}

/// Digest source over the written span of a boot slot.
pub struct SlotDigest<'a> {
    device: &'a dyn BootDevice,
    slot: BootSlot,
    size: u64,
}

impl<'a> SlotDigest<'a> {
    /// Digests the first `size` bytes of `slot`.
    pub fn new(device: &'a dyn BootDevice, slot: BootSlot, size: u64) -> Self {
        Self { device, slot, size }
    }
}

#[async_trait]
impl DigestSource for SlotDigest<'_> {
    fn size(&self) -> u64 {
        self.size
    }

    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> anyhow::Result<()> {
        self.device.read_chunk(self.slot, offset, buf).await
    }
}

/// Digest source over the written span of the asset partition.
pub struct AssetDigest<'a> {
    partition: &'a dyn AssetPartition,
    size: u64,
}

impl<'a> AssetDigest<'a> {
    /// Digests the first `size` bytes of `partition`.
    pub fn new(partition: &'a dyn AssetPartition, size: u64) -> Self {
        Self { partition, size }
    }
}

#[async_trait]
impl DigestSource for AssetDigest<'_> {
    fn size(&self) -> u64 {
        self.size
    }

    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> anyhow::Result<()> {
        self.partition.read_at(offset, buf).await
    }
}

/// Streaming verifier that reads fixed-size chunks and reports progress at
/// coarse byte intervals.
#[derive(Debug, Clone, Copy)]
pub struct ChecksumVerifier {
    chunk_size: usize,
    progress_interval: u64,
}

impl Default for ChecksumVerifier {
    fn default() -> Self {
        Self {
            chunk_size: 4096,
            progress_interval: 256 * 1024,
        }
    }
}

impl ChecksumVerifier {
    /// Builds a verifier with explicit chunking parameters.
    pub fn new(chunk_size: usize, progress_interval: u64) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            progress_interval: progress_interval.max(1),
        }
    }

    /// Computes the digest of `source`, invoking `progress` with a percentage
    /// roughly every progress interval and once at the end.
    ///
    /// # Errors
    ///
    /// Returns [`OtaError::PartitionIo`] when a chunk read fails.
    pub async fn digest<F>(
        &self,
        source: &dyn DigestSource,
        mut progress: F,
    ) -> Result<Checksum, OtaError>
    where
        F: FnMut(u8),
    {
        let total = source.size();
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; self.chunk_size];
        let mut offset: u64 = 0;
        let mut next_report: u64 = 0;

        while offset < total {
            let want = usize::try_from((total - offset).min(self.chunk_size as u64))
                .unwrap_or(self.chunk_size);
            let (chunk, _) = buf.split_at_mut(want);
            source.read_at(offset, chunk).await.map_err(|e| {
                OtaError::PartitionIo(format!("read failed at offset {offset}: {e:#}"))
            })?;
            hasher.update(&*chunk);
            offset += want as u64;

            if offset >= next_report || offset == total {
                let percent = (offset.saturating_mul(100) / total.max(1)).min(100) as u8;
                progress(percent);
                next_report = offset + self.progress_interval;
            }
        }

        Ok(Checksum(hasher.finalize().into()))
    }

    /// Verifies that `source` hashes to `expected`.
    ///
    /// # Errors
    ///
    /// Returns [`OtaError::ChecksumMismatch`] on digest disagreement and
    /// propagates read failures from [`ChecksumVerifier::digest`].
    pub async fn verify<F>(
        &self,
        source: &dyn DigestSource,
        expected: &Checksum,
        progress: F,
    ) -> Result<(), OtaError>
    where
        F: FnMut(u8),
    {
        let computed = self.digest(source, progress).await?;
        if computed != *expected {
            return Err(OtaError::ChecksumMismatch {
                expected: expected.to_hex(),
                computed: computed.to_hex(),
            });
        }
        debug!(digest = %computed, "checksum verified");
        Ok(())
    }
}
