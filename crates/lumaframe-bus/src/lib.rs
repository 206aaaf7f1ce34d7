//! Arbitration for the storage bus shared between the media loader and
//! background maintenance work.
//!
//! The display pipeline streams animation frames from an SDIO-attached flash
//! part. Network transfers that land on the same bus must not interleave with
//! frame reads, so every bus user goes through [`SharedBus::acquire`] and
//! holds the returned [`BusGuard`] for the duration of its transfer. Each
//! acquisition carries an owner tag so a stuck holder can be named in logs.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// Errors surfaced by bus arbitration.
#[derive(Debug, Error)]
pub enum BusError {
    /// The bus could not be acquired before the deadline.
    #[error("storage bus busy after {timeout:?} (requested by {requester}, held by {holder})")]
    Timeout {
        /// How long the requester was willing to wait.
        timeout: Duration,
        /// Tag of the task that asked for the bus.
        requester: &'static str,
        /// Tag of the current holder, if one is known.
        holder: &'static str,
    },
}

/// Mutual-exclusion handle for the shared storage bus.
///
/// Fairness follows the underlying tokio mutex (FIFO). The holder tag is
/// advisory and only used for diagnostics.
#[derive(Debug, Default)]
pub struct SharedBus {
    lock: Mutex<()>,
    holder: parking_lot::Mutex<Option<&'static str>>,
}

/// RAII guard returned by [`SharedBus::acquire`]. Releases the bus on drop.
#[derive(Debug)]
pub struct BusGuard<'a> {
    bus: &'a SharedBus,
    owner: &'static str,
    _permit: MutexGuard<'a, ()>,
}

impl SharedBus {
    /// Creates an unheld bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires exclusive use of the bus, waiting up to `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Timeout`] when another holder keeps the bus past
    /// the deadline. The error names both parties.
    pub async fn acquire(
        &self,
        timeout: Duration,
        owner: &'static str,
    ) -> Result<BusGuard<'_>, BusError> {
        let permit = match tokio::time::timeout(timeout, self.lock.lock()).await {
            Ok(permit) => permit,
            Err(_) => {
                let holder = self.holder().unwrap_or("<unknown>");
                warn!(requester = owner, holder, ?timeout, "storage bus acquisition timed out");
                return Err(BusError::Timeout {
                    timeout,
                    requester: owner,
                    holder,
                });
            }
        };
        *self.holder.lock() = Some(owner);
        debug!(owner, "storage bus acquired");
        Ok(BusGuard {
            bus: self,
            owner,
            _permit: permit,
        })
    }

    /// Whether some task currently holds the bus.
    ///
    /// Point-in-time answer, only suitable for diagnostics.
    pub fn is_locked(&self) -> bool {
        self.lock.try_lock().is_err()
    }

    /// Tag of the current holder, if the bus is held.
    pub fn holder(&self) -> Option<&'static str> {
        *self.holder.lock()
    }
}

impl Drop for BusGuard<'_> {
    fn drop(&mut self) {
        *self.bus.holder.lock() = None;
        debug!(owner = self.owner, "storage bus released");
    }
}
