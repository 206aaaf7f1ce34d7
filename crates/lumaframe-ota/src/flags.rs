//! Persisted recovery flags for the web-asset partition.
//!
//! The asset pipeline marks the partition invalid before it erases anything
//! and clears the flags only after a fully verified install. The flags must
//! survive power loss, so they live outside the partition they describe.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Durable state describing the health of the web-asset partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryFlags {
    /// The partition contents are not trustworthy. Set before any
    /// destructive write, cleared only after a verified install.
    pub partition_invalid: bool,
    /// Something asked for the assets to be reinstalled at the next
    /// opportunity regardless of versions.
    pub needs_recovery: bool,
    /// Consecutive failed asset installs. Cleared on success.
    pub failure_count: u8,
}

/// Durable storage for [`RecoveryFlags`].
#[async_trait]
pub trait RecoveryFlagStore: Send + Sync {
    /// Loads the persisted flags, defaulting when none were ever written.
    async fn load(&self) -> Result<RecoveryFlags>;

    /// Persists `flags`, replacing whatever was stored before.
    async fn store(&self, flags: RecoveryFlags) -> Result<()>;
}

/// Flag store backed by a JSON file, written atomically via rename.
#[derive(Debug, Clone)]
pub struct JsonFlagStore {
    path: PathBuf,
}

impl JsonFlagStore {
    /// Creates a store at `path`. The file is created on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RecoveryFlagStore for JsonFlagStore {
    async fn load(&self) -> Result<RecoveryFlags> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "no recovery flags on disk, using defaults");
            return Ok(RecoveryFlags::default());
        }
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        let flags = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse {}", self.path.display()))?;
        Ok(flags)
    }

    async fn store(&self, flags: RecoveryFlags) -> Result<()> {
        let raw = serde_json::to_string_pretty(&flags).context("failed to serialize flags")?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, raw)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        debug!(path = %self.path.display(), ?flags, "recovery flags persisted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_file_loads_defaults() {
        let dir = TempDir::new().unwrap();
        let store = JsonFlagStore::new(dir.path().join("flags.json"));
        assert_eq!(store.load().await.unwrap(), RecoveryFlags::default());
    }

    #[tokio::test]
    async fn store_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = JsonFlagStore::new(dir.path().join("flags.json"));
        let flags = RecoveryFlags {
            partition_invalid: true,
            needs_recovery: false,
            failure_count: 3,
        };
        store.store(flags).await.unwrap();
        assert_eq!(store.load().await.unwrap(), flags);
    }

    #[tokio::test]
    async fn overwrite_replaces_previous_flags() {
        let dir = TempDir::new().unwrap();
        let store = JsonFlagStore::new(dir.path().join("flags.json"));
        store
            .store(RecoveryFlags {
                partition_invalid: true,
                needs_recovery: true,
                failure_count: 2,
            })
            .await
            .unwrap();
        store.store(RecoveryFlags::default()).await.unwrap();
        assert_eq!(store.load().await.unwrap(), RecoveryFlags::default());
    }

    #[tokio::test]
    async fn unknown_fields_do_not_break_loading() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("flags.json");
        tokio::fs::write(&path, r#"{"partition_invalid":true,"legacy_field":1}"#)
            .await
            .unwrap();
        let store = JsonFlagStore::new(path);
        let flags = store.load().await.unwrap();
        assert!(flags.partition_invalid);
        assert_eq!(flags.failure_count, 0);
    }
}
