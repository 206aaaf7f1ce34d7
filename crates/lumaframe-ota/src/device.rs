//! Hardware-facing traits for the boot slots and the web-asset partition.
//!
//! The update pipelines never touch flash directly. They talk to these
//! traits, which the appliance binary implements over the real partition
//! table and which tests implement in memory.

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::version::ReleaseVersion;

/// One of the two firmware boot slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BootSlot {
    /// Slot A.
    A,
    /// Slot B.
    B,
}

impl BootSlot {
    /// The opposite slot. Downloads always target `running.other()`.
    pub fn other(&self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

impl fmt::Display for BootSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::A => write!(f, "A"),
            Self::B => write!(f, "B"),
        }
    }
}

/// Metadata embedded in a flashed firmware image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotDescriptor {
    /// Version the image reports about itself.
    pub version: ReleaseVersion,
    /// Project name baked into the image.
    pub project: String,
}

/// Self-test verdict recorded against the currently running image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootImageState {
    /// The image has been confirmed good.
    Valid,
    /// First boot after flashing; the image must confirm itself or the
    /// loader rolls back on the next restart.
    PendingVerify,
    /// The image has been condemned.
    Invalid,
}

/// Access to the A/B firmware slots and the boot selector.
///
/// Write paths address the inactive slot only. The running slot is never
/// mutated.
#[async_trait]
pub trait BootDevice: Send + Sync {
    /// Slot the current firmware booted from.
    fn running_slot(&self) -> BootSlot;

    /// Version of the running firmware.
    fn running_version(&self) -> ReleaseVersion;

    /// Reads the descriptor of an image in `slot`, or `None` when the slot
    /// holds no readable image.
    async fn slot_descriptor(&self, slot: BootSlot) -> Result<Option<SlotDescriptor>>;

    /// Erases `slot` and prepares it to receive a new image.
    async fn prepare_slot(&self, slot: BootSlot) -> Result<()>;

    /// Writes `data` into `slot` at `offset`.
    async fn write_chunk(&self, slot: BootSlot, offset: u64, data: &[u8]) -> Result<()>;

    /// Fills `buf` from `slot` starting at `offset`.
    async fn read_chunk(&self, slot: BootSlot, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Completes a write of `size` bytes and validates the image format.
    async fn finalize_slot(&self, slot: BootSlot, size: u64) -> Result<()>;

    /// Points the boot selector at `slot` for the next restart.
    async fn set_boot_slot(&self, slot: BootSlot) -> Result<()>;

    /// Self-test state of the running image.
    async fn boot_image_state(&self) -> Result<BootImageState>;

    /// Confirms the running image so the loader stops arming rollback.
    async fn mark_boot_valid(&self) -> Result<()>;

    /// Restarts the appliance.
    async fn restart(&self) -> Result<()>;
}

/// Raw access to the dedicated web-asset partition.
#[async_trait]
pub trait AssetPartition: Send + Sync {
    /// Usable partition size in bytes.
    fn capacity(&self) -> u64;

    /// Erases the whole partition.
    async fn erase(&self) -> Result<()>;

    /// Writes `data` at `offset`.
    async fn write(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Fills `buf` from `offset`.
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
}

/// Filesystem view of the web-asset partition.
#[async_trait]
pub trait AssetFilesystem: Send + Sync {
    /// Unmounts the filesystem ahead of raw partition writes.
    async fn unmount(&self) -> Result<()>;

    /// Mounts the filesystem after raw writes complete.
    async fn mount(&self) -> Result<()>;

    /// Reads the version marker file shipped inside the asset bundle, or
    /// `None` when the marker is absent.
    async fn read_version_marker(&self) -> Result<Option<String>>;
}
