//! Periodic database backups
//!
//! Consistent snapshots via SQLite's online backup API (never a raw file
//! copy of a live database, which would tear across the WAL). Snapshots are
//! written to `<backup_dir>/memory_backup_YYYYMMDD_HHMMSS.db` and a retention
//! sweep keeps the newest N. The scheduler is an explicit service handle
//! constructed at startup, not a global.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::BackupConfig;
use crate::storage::{Result, StorageError};

/// A snapshot on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupInfo {
    /// Snapshot file path
    pub path: PathBuf,
    /// Snapshot size in bytes
    pub size_bytes: u64,
    /// File name (carries the timestamp)
    pub file_name: String,
}

/// Online-backup service over the primary database file
pub struct BackupService {
    db_path: PathBuf,
    config: BackupConfig,
    running: AtomicBool,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

fn run_online_backup(src_path: &Path, dest_path: &Path) -> Result<()> {
    let src = Connection::open(src_path)?;
    let mut dest = Connection::open(dest_path)?;
    let backup = rusqlite::backup::Backup::new(&src, &mut dest)?;
    backup.run_to_completion(64, std::time::Duration::from_millis(25), None)?;
    Ok(())
}

impl BackupService {
    /// Create a service for a database file
    pub fn new(db_path: impl Into<PathBuf>, config: BackupConfig) -> Arc<Self> {
        Arc::new(Self {
            db_path: db_path.into(),
            config,
            running: AtomicBool::new(false),
            handle: Mutex::new(None),
        })
    }

    /// Take one consistent snapshot
    pub async fn create_backup(&self) -> Result<BackupInfo> {
        std::fs::create_dir_all(&self.config.backup_dir)?;
        let file_name = format!(
            "memory_backup_{}.db",
            Utc::now().format("%Y%m%d_%H%M%S")
        );
        let dest_path = self.config.backup_dir.join(&file_name);

        let src = self.db_path.clone();
        let dest = dest_path.clone();
        tokio::task::spawn_blocking(move || run_online_backup(&src, &dest))
            .await
            .map_err(|e| StorageError::Init(format!("backup task failed: {e}")))??;

        let size_bytes = std::fs::metadata(&dest_path).map(|m| m.len()).unwrap_or(0);
        tracing::info!(path = %dest_path.display(), size_bytes, "backup created");
        Ok(BackupInfo {
            path: dest_path,
            size_bytes,
            file_name,
        })
    }

    /// Snapshots on disk, newest first
    pub fn list_backups(&self) -> Result<Vec<BackupInfo>> {
        let mut backups = Vec::new();
        if !self.config.backup_dir.exists() {
            return Ok(backups);
        }
        for entry in std::fs::read_dir(&self.config.backup_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with("memory_backup_") && name.ends_with(".db") {
                backups.push(BackupInfo {
                    size_bytes: entry.metadata().map(|m| m.len()).unwrap_or(0),
                    path: entry.path(),
                    file_name: name,
                });
            }
        }
        // Timestamped names sort chronologically
        backups.sort_by(|a, b| b.file_name.cmp(&a.file_name));
        Ok(backups)
    }

    /// Delete snapshots beyond the retention count; returns how many
    pub fn prune_old_backups(&self) -> Result<usize> {
        let backups = self.list_backups()?;
        let mut pruned = 0usize;
        for stale in backups.iter().skip(self.config.retention) {
            std::fs::remove_file(&stale.path)?;
            tracing::info!(path = %stale.path.display(), "pruned old backup");
            pruned += 1;
        }
        Ok(pruned)
    }

    /// Restore a snapshot over the live database (online backup in reverse).
    /// Callers must quiesce writers first.
    pub async fn restore_backup(&self, backup_path: &Path) -> Result<()> {
        if !backup_path.exists() {
            return Err(StorageError::Init(format!(
                "backup file not found: {}",
                backup_path.display()
            )));
        }
        let src = backup_path.to_path_buf();
        let dest = self.db_path.clone();
        tokio::task::spawn_blocking(move || run_online_backup(&src, &dest))
            .await
            .map_err(|e| StorageError::Init(format!("restore task failed: {e}")))??;
        tracing::info!(from = %backup_path.display(), "database restored from backup");
        Ok(())
    }

    /// Start the periodic snapshot loop
    pub async fn start(self: &Arc<Self>) {
        if !self.config.enabled {
            tracing::info!("backup scheduler disabled");
            return;
        }
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("backup scheduler already running");
            return;
        }
        let service = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while service.running.load(Ordering::SeqCst) {
                tokio::time::sleep(service.config.interval).await;
                match service.create_backup().await {
                    Ok(_) => {
                        if let Err(e) = service.prune_old_backups() {
                            tracing::warn!(error = %e, "backup retention sweep failed");
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "scheduled backup failed"),
                }
            }
        });
        *self.handle.lock().await = Some(handle);
        tracing::info!(
            interval_secs = self.config.interval.as_secs(),
            retention = self.config.retention,
            "backup scheduler started"
        );
    }

    /// Stop the periodic loop
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.handle.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
        tracing::info!("backup scheduler stopped");
    }
}

// ============================================================================
// TESTS
// ============================================================================
