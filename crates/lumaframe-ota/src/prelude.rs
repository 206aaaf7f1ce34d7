//! Convenience re-exports for common update types

pub use crate::assets::{AssetState, AssetStatus, AssetUpdater};
pub use crate::checksum::{Checksum, ChecksumVerifier, DigestSource};
pub use crate::config::OtaConfig;
pub use crate::device::{
    AssetFilesystem, AssetPartition, BootDevice, BootImageState, BootSlot, SlotDescriptor,
};
pub use crate::error::OtaError;
pub use crate::firmware::{FirmwareState, FirmwareStatus, FirmwareUpdater, InstallGate};
pub use crate::flags::{JsonFlagStore, RecoveryFlagStore, RecoveryFlags};
pub use crate::policy::{
    BlockReason, ConnectivityProbe, NullProgress, PlaybackCoordinator, ProgressSink, UiController,
};
pub use crate::release::{
    AssetRelease, ImageStream, ReleaseInfo, ReleaseManifest, ReleaseProvider,
};
pub use crate::retry::RetryPolicy;
pub use crate::scheduler::UpdateScheduler;
pub use crate::version::{ReleaseVersion, VersionError};
pub use lumaframe_bus::{BusError, BusGuard, SharedBus};
