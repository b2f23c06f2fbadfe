//! Database integrity monitoring
//!
//! Runs `PRAGMA integrity_check` periodically and at startup to catch
//! corruption early. Minor WAL corruption is repaired automatically with a
//! checkpoint; when repair fails, surviving live rows are exported to a
//! timestamped JSON file next to the database and the service keeps serving
//! reads in a degraded state.
//!
//! Checks use a separate short-lived connection on a blocking worker thread,
//! so the serving connections and the async scheduler are never touched.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::IntegrityConfig;
use crate::memory::now_timestamp;
use crate::storage::{Result, StorageError};

/// Result of one integrity check pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityCheckResult {
    /// Whether the database is healthy (possibly after repair)
    pub healthy: bool,
    /// `PRAGMA integrity_check` output (or error detail)
    pub detail: String,
    /// Check duration in milliseconds
    pub check_ms: f64,
    /// Whether a WAL checkpoint repaired the corruption
    pub repaired: bool,
    /// Whether an emergency export was written
    pub exported: bool,
    /// Emergency export path, when written
    #[serde(skip_serializing_if = "Option::is_none")]
    pub export_path: Option<PathBuf>,
    /// Memories in the export
    pub export_count: usize,
}

/// Monitor status for health reporting
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityStatus {
    /// Whether periodic checking is enabled
    pub enabled: bool,
    /// Whether the loop is running
    pub running: bool,
    /// Check interval in seconds
    pub interval_seconds: u64,
    /// Last check time (UTC seconds), 0 when never run
    pub last_check_time: f64,
    /// Outcome of the last check
    pub last_check_healthy: Option<bool>,
    /// Total checks run
    pub total_checks: u64,
    /// Successful auto-repairs
    pub total_auto_repairs: u64,
    /// Unrecoverable corruption events
    pub total_unrecoverable: u64,
}

/// Periodic SQLite integrity monitor
pub struct IntegrityMonitor {
    db_path: PathBuf,
    config: IntegrityConfig,
    running: AtomicBool,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    last_check_time: std::sync::Mutex<f64>,
    last_check_healthy: std::sync::Mutex<Option<bool>>,
    total_checks: AtomicU64,
    total_repairs: AtomicU64,
    total_failures: AtomicU64,
}

impl IntegrityMonitor {
    /// Create a monitor for a database file
    pub fn new(db_path: impl Into<PathBuf>, config: IntegrityConfig) -> Arc<Self> {
        let monitor = Arc::new(Self {
            db_path: db_path.into(),
            config,
            running: AtomicBool::new(false),
            handle: Mutex::new(None),
            last_check_time: std::sync::Mutex::new(0.0),
            last_check_healthy: std::sync::Mutex::new(None),
            total_checks: AtomicU64::new(0),
            total_repairs: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
        });
        tracing::info!(
            enabled = monitor.config.enabled,
            interval_secs = monitor.config.interval.as_secs(),
            "integrity monitor initialized"
        );
        monitor
    }

    /// Run `PRAGMA integrity_check` on a separate short-lived connection
    pub async fn check_integrity(&self) -> Result<(bool, String)> {
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            conn.busy_timeout(std::time::Duration::from_secs(5))?;
            let detail: String =
                conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
            Ok::<_, StorageError>((detail == "ok", detail))
        })
        .await
        .map_err(|e| StorageError::Init(format!("integrity check task failed: {e}")))?
    }

    /// Attempt repair via `PRAGMA wal_checkpoint(TRUNCATE)`, then re-check
    pub async fn attempt_wal_repair(&self) -> Result<(bool, String)> {
        let path = self.db_path.clone();
        let checkpointed = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            conn.busy_timeout(std::time::Duration::from_secs(10))?;
            conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
            Ok::<_, StorageError>(())
        })
        .await
        .map_err(|e| StorageError::Init(format!("wal checkpoint task failed: {e}")))?;

        if let Err(e) = checkpointed {
            return Ok((false, format!("WAL checkpoint failed: {e}")));
        }

        let (healthy, detail) = self.check_integrity().await?;
        if healthy {
            Ok((true, "WAL checkpoint repair successful".to_string()))
        } else {
            Ok((false, format!("WAL checkpoint did not fix corruption: {detail}")))
        }
    }

    /// Export surviving live memories to JSON for manual recovery
    pub async fn export_memories(&self, export_path: &Path) -> Result<usize> {
        let db_path = self.db_path.clone();
        let export_path = export_path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path)?;
            conn.busy_timeout(std::time::Duration::from_secs(10))?;
            let mut stmt = conn.prepare(
                "SELECT content_hash, content, memory_type, tags, metadata,
                        created_at, created_at_iso
                 FROM memories WHERE deleted_at IS NULL",
            )?;
            let rows: Vec<serde_json::Value> = stmt
                .query_map([], |row| {
                    Ok(serde_json::json!({
                        "hash": row.get::<_, String>(0)?,
                        "content": row.get::<_, String>(1)?,
                        "type": row.get::<_, Option<String>>(2)?,
                        "tags": row.get::<_, String>(3)?,
                        "metadata": row.get::<_, String>(4)?,
                        "created_at": row.get::<_, f64>(5)?,
                        "created_at_iso": row.get::<_, String>(6)?,
                    }))
                })?
                .filter_map(|r| r.ok())
                .collect();

            let count = rows.len();
            std::fs::write(&export_path, serde_json::to_string_pretty(&rows)?)?;
            tracing::info!(count, path = %export_path.display(), "exported memories");
            Ok::<_, StorageError>(count)
        })
        .await
        .map_err(|e| StorageError::Init(format!("export task failed: {e}")))?
    }

    /// One check pass with repair and export escalation
    pub async fn run_check(&self) -> Result<IntegrityCheckResult> {
        let start = std::time::Instant::now();
        let (healthy, detail) = self.check_integrity().await?;
        let check_ms = start.elapsed().as_secs_f64() * 1000.0;

        *self.last_check_time.lock().unwrap_or_else(|e| e.into_inner()) = now_timestamp();
        self.total_checks.fetch_add(1, Ordering::SeqCst);

        let mut result = IntegrityCheckResult {
            healthy,
            detail: detail.clone(),
            check_ms,
            ..Default::default()
        };

        if healthy {
            *self
                .last_check_healthy
                .lock()
                .unwrap_or_else(|e| e.into_inner()) = Some(true);
            tracing::debug!(check_ms, "integrity check passed");
            return Ok(result);
        }

        tracing::warn!(detail = %detail, "database corruption detected");
        let (repaired, repair_detail) = self.attempt_wal_repair().await?;
        result.detail = repair_detail;

        if repaired {
            self.total_repairs.fetch_add(1, Ordering::SeqCst);
            result.repaired = true;
            result.healthy = true;
            *self
                .last_check_healthy
                .lock()
                .unwrap_or_else(|e| e.into_inner()) = Some(true);
            tracing::info!("auto-repair successful");
            return Ok(result);
        }

        // Repair failed: emergency export, then keep serving degraded
        self.total_failures.fetch_add(1, Ordering::SeqCst);
        *self
            .last_check_healthy
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(false);

        let export_path = self
            .db_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(format!("emergency_export_{}.json", now_timestamp() as i64));
        match self.export_memories(&export_path).await {
            Ok(count) => {
                result.exported = true;
                result.export_count = count;
                result.export_path = Some(export_path.clone());
                tracing::error!(
                    path = %export_path.display(),
                    count,
                    "corruption could not be auto-repaired; memories exported for manual recovery"
                );
            }
            Err(e) => {
                tracing::error!(error = %e, "emergency export failed");
            }
        }
        Ok(result)
    }

    /// Startup check before the service accepts requests
    pub async fn startup_check(&self) -> Result<IntegrityCheckResult> {
        tracing::info!("running startup integrity check");
        let result = self.run_check().await?;
        if result.healthy {
            if result.repaired {
                tracing::info!("startup check: corruption found and auto-repaired");
            } else {
                tracing::info!(check_ms = result.check_ms, "startup check: database healthy");
            }
        } else {
            tracing::error!(
                "startup check: database corrupt and not auto-repairable; serving degraded"
            );
        }
        Ok(result)
    }

    /// Start the periodic monitoring loop
    pub async fn start(self: &Arc<Self>) {
        if !self.config.enabled {
            tracing::info!("integrity monitoring disabled");
            return;
        }
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("integrity monitor already running");
            return;
        }
        let monitor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while monitor.running.load(Ordering::SeqCst) {
                tokio::time::sleep(monitor.config.interval).await;
                if let Err(e) = monitor.run_check().await {
                    tracing::error!(error = %e, "integrity monitor loop error");
                    tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                }
            }
        });
        *self.handle.lock().await = Some(handle);
        tracing::info!(
            interval_secs = self.config.interval.as_secs(),
            "integrity monitor started"
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
        tracing::info!("integrity monitor stopped");
    }

    /// Status snapshot for health reporting
    pub fn status(&self) -> IntegrityStatus {
        IntegrityStatus {
            enabled: self.config.enabled,
            running: self.running.load(Ordering::SeqCst),
            interval_seconds: self.config.interval.as_secs(),
            last_check_time: *self
                .last_check_time
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
            last_check_healthy: *self
                .last_check_healthy
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
            total_checks: self.total_checks.load(Ordering::SeqCst),
            total_auto_repairs: self.total_repairs.load(Ordering::SeqCst),
            total_unrecoverable: self.total_failures.load(Ordering::SeqCst),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
