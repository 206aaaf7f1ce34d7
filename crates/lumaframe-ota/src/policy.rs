//! Runtime activities that take precedence over updates.
//!
//! The update pipelines never reach into the playback engine or the USB
//! stack. They consult these traits, which the appliance binary wires to the
//! real subsystems. Updates yield to anything interactive: live streaming,
//! a mounted USB export, or an already running install.

use std::fmt;

use async_trait::async_trait;

/// Why an update was refused right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    /// A real-time stream is being rendered for a viewer.
    StreamingActive,
    /// Internal storage is exported to a host over USB.
    StorageExported,
    /// An install is already mutating flash.
    InstallInProgress,
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StreamingActive => write!(f, "real-time streaming active"),
            Self::StorageExported => write!(f, "storage exported over USB"),
            Self::InstallInProgress => write!(f, "install already in progress"),
        }
    }
}

/// View of the playback engine consulted before and during update work.
pub trait PlaybackCoordinator: Send + Sync {
    /// Whether a viewer-facing real-time stream is running.
    fn is_streaming_active(&self) -> bool;

    /// Whether internal storage is currently exported over USB.
    fn is_storage_exported(&self) -> bool;

    /// Whether the frame is in an interactive UI session.
    fn is_ui_session_active(&self) -> bool;

    /// Whether the media loader is mid-decode on the shared bus.
    fn is_loader_busy(&self) -> bool;

    /// Asks playback to stop touching the shared bus.
    fn pause_storage_access(&self);

    /// Releases playback back onto the shared bus.
    fn resume_storage_access(&self);
}

/// Reachability of the release host.
pub trait ConnectivityProbe: Send + Sync {
    /// Whether the network link is up and usable.
    fn is_online(&self) -> bool;
}

/// Receiver for human-readable progress during installs.
pub trait ProgressSink: Send + Sync {
    /// Reports `percent` complete with a short status line.
    fn progress(&self, percent: u8, message: &str);
}

/// Progress sink that discards everything. Used by scheduled installs that
/// run with no one watching.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn progress(&self, _percent: u8, _message: &str) {}
}

/// Hook for switching the display into and out of update mode.
#[async_trait]
pub trait UiController: Send + Sync {
    /// Puts a full-screen update notice on the panel.
    async fn enter_update_mode(&self, from_version: &str, to_version: &str);

    /// Restores normal playback on the panel.
    async fn exit_update_mode(&self);
}
