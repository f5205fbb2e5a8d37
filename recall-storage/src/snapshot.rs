//! Timestamped local snapshots with retention.
//!
//! A snapshot is a directory `backups/<prefix>_<YYYYMMDD_HHMMSS>` holding
//! `metadata.json`, `config.json`, and the legacy vector file when present.
//! After a successful snapshot the oldest directories beyond the retention
//! window are pruned, ignoring errors.

use chrono::Utc;
use recall_core::{RecallError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, warn};

static UNSAFE_PREFIX_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9_-]").unwrap());

/// Reject backup names that could escape the backups directory.
pub fn validate_backup_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains("..") || name.contains('/') || name.contains('\\') {
        return Err(RecallError::invalid_argument(format!(
            "Invalid backup name: {name}"
        )));
    }
    Ok(())
}

/// A local snapshot directory.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BackupInfo {
    pub name: String,
    /// Creation time as unix seconds, best effort.
    pub created: f64,
}

pub struct SnapshotManager {
    backup_dir: PathBuf,
    metadata_path: PathBuf,
    config_path: PathBuf,
    legacy_index_path: PathBuf,
    max_backups: usize,
}

impl SnapshotManager {
    pub fn new(
        backup_dir: PathBuf,
        metadata_path: PathBuf,
        config_path: PathBuf,
        legacy_index_path: PathBuf,
        max_backups: usize,
    ) -> Self {
        Self {
            backup_dir,
            metadata_path,
            config_path,
            legacy_index_path,
            max_backups,
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Resolve a validated backup name to its directory, requiring that it
    /// stays inside the backups directory.
    pub fn backup_path(&self, name: &str) -> Result<PathBuf> {
        validate_backup_name(name)?;
        let path = self.backup_dir.join(name);
        if !path.starts_with(&self.backup_dir) {
            return Err(RecallError::invalid_argument(format!(
                "Invalid backup path: {name}"
            )));
        }
        Ok(path)
    }

    /// Create a timestamped snapshot of the state files and enforce
    /// retention. Returns the snapshot directory.
    pub async fn create(&self, prefix: &str) -> Result<PathBuf> {
        let prefix = UNSAFE_PREFIX_CHARS.replace_all(prefix, "_");
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let name = format!("{prefix}_{timestamp}");
        let path = self.backup_dir.join(&name);
        tokio::fs::create_dir_all(&path).await?;

        for (source, target) in [
            (&self.metadata_path, "metadata.json"),
            (&self.config_path, "config.json"),
            (&self.legacy_index_path, "index.faiss"),
        ] {
            if tokio::fs::try_exists(source).await.unwrap_or(false) {
                tokio::fs::copy(source, path.join(target)).await?;
            }
        }

        self.cleanup_old().await;
        debug!(backup = %name, "snapshot created");
        Ok(path)
    }

    /// Keep only the N most recent snapshots, newest first by name (names
    /// embed the UTC timestamp). Removal errors are ignored.
    async fn cleanup_old(&self) {
        let mut backups = match self.list().await {
            Ok(backups) => backups,
            Err(e) => {
                warn!("backup retention scan failed: {e}");
                return;
            }
        };
        backups.sort_by(|a, b| b.name.cmp(&a.name));
        for old in backups.iter().skip(self.max_backups) {
            let path = self.backup_dir.join(&old.name);
            if let Err(e) = tokio::fs::remove_dir_all(&path).await {
                warn!("failed to prune backup {}: {e}", old.name);
            }
        }
    }

    /// List snapshot directories, newest first by name.
    pub async fn list(&self) -> Result<Vec<BackupInfo>> {
        let mut backups = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.backup_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(backups),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !file_type.is_dir() || !name.contains('_') {
                continue;
            }
            let created = entry
                .metadata()
                .await
                .ok()
                .and_then(|meta| meta.modified().ok())
                .and_then(|time| time.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|duration| duration.as_secs_f64())
                .unwrap_or(0.0);
            backups.push(BackupInfo { name, created });
        }
        backups.sort_by(|a, b| b.name.cmp(&a.name));
        Ok(backups)
    }
}
