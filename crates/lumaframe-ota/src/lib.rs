//! Over-the-air update management for the Lumaframe picture frame
//!
//! This crate keeps a headless wall-mounted appliance up to date without
//! ever leaving it unbootable:
//! - A/B boot slots with checksum verification before the selector moves
//! - Boot confirmation and automatic rollback on a failed first boot
//! - A separate web-asset partition with persisted recovery flags and a
//!   failure circuit breaker
//! - Scheduled checks that yield to playback, streaming, USB export, and
//!   the shared storage bus
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`firmware`]: Firmware update pipeline over the boot slots
//! - [`assets`]: Web-asset update pipeline with recovery flags
//! - [`scheduler`]: Periodic checks and shared-bus arbitration
//! - [`release`]: Release host contracts and typed release data
//! - [`checksum`]: Streaming SHA-256 verification
//! - [`device`]: Hardware-facing traits for slots and partitions
//! - [`policy`]: Runtime blocking policy and progress reporting
//! - [`flags`]: Persisted recovery flags
//! - [`version`]: Release version parsing and ordering
//! - [`retry`]: Bounded retry schedules
//! - [`config`]: Tunable parameters
//! - [`error`]: Error types
//!
//! # Safety model
//!
//! Firmware downloads only ever touch the inactive slot, and the asset
//! pipeline condemns its partition in durable flags before the first
//! destructive write. A power cut at any point leaves the frame either on
//! the old firmware or visibly in need of asset recovery, never silently
//! broken.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use lumaframe_ota::prelude::*;
//!
//! # async fn example(
//! #     device: Arc<dyn BootDevice>,
//! #     provider: Arc<dyn ReleaseProvider>,
//! #     coordinator: Arc<dyn PlaybackCoordinator>,
//! #     connectivity: Arc<dyn ConnectivityProbe>,
//! # ) -> Result<(), OtaError> {
//! let config = OtaConfig::default();
//! let firmware = Arc::new(FirmwareUpdater::new(
//!     config.clone(),
//!     device,
//!     provider.clone(),
//!     coordinator.clone(),
//!     connectivity.clone(),
//! ));
//!
//! // Confirm this boot so the loader stops arming rollback.
//! firmware.validate_boot().await?;
//!
//! let status = firmware.status().await;
//! println!("running {}, state {}", status.current_version, status.state);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_op_in_unsafe_fn, clippy::unwrap_used)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod assets;
pub mod checksum;
pub mod config;
pub mod device;
pub mod error;
pub mod firmware;
pub mod flags;
pub mod policy;
pub mod prelude;
pub mod release;
pub mod retry;
pub mod scheduler;
pub mod version;

pub use assets::{AssetState, AssetStatus, AssetUpdater};
pub use checksum::{AssetDigest, Checksum, ChecksumVerifier, DigestSource, SlotDigest};
pub use config::OtaConfig;
pub use device::{
    AssetFilesystem, AssetPartition, BootDevice, BootImageState, BootSlot, SlotDescriptor,
};
pub use error::OtaError;
pub use firmware::{FirmwareState, FirmwareStatus, FirmwareUpdater, GateGuard, InstallGate};
pub use flags::{JsonFlagStore, RecoveryFlagStore, RecoveryFlags};
pub use policy::{
    BlockReason, ConnectivityProbe, NullProgress, PlaybackCoordinator, ProgressSink, UiController,
};
pub use release::{AssetRelease, ImageStream, ReleaseInfo, ReleaseManifest, ReleaseProvider};
pub use retry::RetryPolicy;
pub use scheduler::UpdateScheduler;
pub use version::{ReleaseVersion, VersionError};
