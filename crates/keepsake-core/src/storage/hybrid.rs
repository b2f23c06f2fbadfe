//! Hybrid engine: embedded primary + cloud secondary
//!
//! Reads are served from the primary, which is authoritative. Writes land on
//! the primary first and are mirrored to the secondary by a background sync
//! service with at-least-once, eventually-consistent semantics: a bounded
//! FIFO operation queue, exponential backoff for transient failures, a
//! capacity guard against provider limits, an initial catch-up sync at
//! startup, and optional metadata drift detection.
//!
//! The host keeps serving as long as the primary is healthy; the sync loop
//! never propagates an error out of its own task.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::HybridConfig;
use crate::memory::{now_timestamp, Memory, MemoryQueryResult};

use super::cloud::{classify_error, ErrorClass};
use super::{
    MemoryStorage, MemoryUpdates, Result, StorageError, StorageStats, TagCount, TagMatch,
};

/// Ring-buffer depth for operations awaiting retry
const FAILED_OPS_CAPACITY: usize = 100;

/// Ceiling for the top-level loop backoff after consecutive failures
const MAX_LOOP_BACKOFF: Duration = Duration::from_secs(30 * 60);

/// Consecutive loop failures that trigger the long backoff
const MAX_CONSECUTIVE_FAILURES: u32 = 5;

// ============================================================================
// SYNC OPERATIONS
// ============================================================================

/// A queued mutation to mirror onto the secondary
#[derive(Debug, Clone)]
pub enum SyncOp {
    /// Mirror a stored memory
    Store(Box<Memory>),
    /// Mirror a deletion
    Delete(String),
    /// Mirror a metadata update
    Update {
        /// Target memory hash
        content_hash: String,
        /// The update payload
        updates: MemoryUpdates,
    },
}

impl SyncOp {
    fn kind(&self) -> &'static str {
        match self {
            SyncOp::Store(_) => "store",
            SyncOp::Delete(_) => "delete",
            SyncOp::Update { .. } => "update",
        }
    }
}

/// Queue element wrapping an operation with its retry state
#[derive(Debug, Clone)]
pub struct SyncOperation {
    /// The mutation to apply
    pub op: SyncOp,
    /// When the operation was enqueued (UTC seconds)
    pub timestamp: f64,
    /// Retries consumed so far
    pub retries: u32,
    /// Retry budget
    pub max_retries: u32,
    /// Earliest instant the next attempt may run (backoff gate)
    not_before: Option<Instant>,
}

impl SyncOperation {
    fn new(op: SyncOp, max_retries: u32) -> Self {
        Self {
            op,
            timestamp: now_timestamp(),
            retries: 0,
            max_retries,
            not_before: None,
        }
    }

    fn due(&self, now: Instant) -> bool {
        self.not_before.is_none_or(|t| t <= now)
    }
}

// ============================================================================
// STATUS TYPES
// ============================================================================

/// Provider capacity limits the guard enforces
#[derive(Debug, Clone)]
pub struct CapacityLimits {
    /// Hard vector-count limit
    pub max_vectors: u64,
    /// Metadata size limit per memory, kilobytes
    pub max_metadata_kb: usize,
    /// Usage percent at which warnings start
    pub warning_percent: f64,
    /// Usage percent at which new stores are refused
    pub critical_percent: f64,
}

impl Default for CapacityLimits {
    fn default() -> Self {
        Self {
            max_vectors: 5_000_000,
            max_metadata_kb: 10,
            warning_percent: 80.0,
            critical_percent: 95.0,
        }
    }
}

impl CapacityLimits {
    /// Derive limits from a cloud configuration
    pub fn from_cloud(config: &crate::config::CloudConfig) -> Self {
        Self {
            max_vectors: config.max_vectors,
            max_metadata_kb: config.max_metadata_kb,
            warning_percent: config.warning_threshold_percent,
            critical_percent: config.critical_threshold_percent,
        }
    }
}

/// Capacity tracking snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacityStatus {
    /// Last observed vector count on the secondary
    pub vector_count: u64,
    /// Provider limit
    pub vector_limit: u64,
    /// Usage percentage
    pub usage_percent: f64,
    /// Whether new store syncs are being refused
    pub approaching_limits: bool,
    /// Active warnings
    pub warnings: Vec<String>,
}

/// Background sync service status
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    /// Whether the drain loop is running
    pub is_running: bool,
    /// Whether consolidation paused draining
    pub is_paused: bool,
    /// Operations waiting in the queue
    pub queue_size: usize,
    /// Operations in the retry ring
    pub failed_operations: usize,
    /// Successfully applied operations
    pub operations_processed: u64,
    /// Permanently failed operations
    pub operations_failed: u64,
    /// Last periodic sync (UTC seconds)
    pub last_sync_time: f64,
    /// Consecutive top-level loop failures
    pub consecutive_failures: u32,
    /// Whether the secondary answered its last health check
    pub secondary_available: bool,
    /// Capacity guard snapshot
    pub capacity: CapacityStatus,
}

/// Initial catch-up sync progress
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitialSyncStatus {
    /// Whether the catch-up pass is still running
    pub in_progress: bool,
    /// Memories the secondary holds beyond the primary
    pub total: usize,
    /// Memories downloaded so far
    pub completed: usize,
    /// Whether the pass has ended
    pub finished: bool,
    /// Completion percentage
    pub progress_percentage: f64,
}

/// Drift detection report
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriftReport {
    /// Memories compared
    pub checked: usize,
    /// Memories whose metadata diverged
    pub drifted: usize,
    /// Divergences repaired (primary's view applied to the secondary)
    pub applied: usize,
    /// Repair failures
    pub failed: usize,
    /// Whether this was a preview
    pub dry_run: bool,
}

/// Force-sync report
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForceSyncReport {
    /// "completed", "partial", or "disabled"
    pub status: String,
    /// Whether the secondary was reachable
    pub secondary_available: bool,
    /// Memories on the primary
    pub primary_memories: usize,
    /// Memories pushed to the secondary
    pub synced_to_secondary: usize,
    /// Memories already present remotely
    pub skipped: usize,
    /// Push failures
    pub failed: usize,
    /// Wall-clock duration in seconds
    pub duration_seconds: f64,
}

// ============================================================================
// BACKGROUND SYNC SERVICE
// ============================================================================

#[derive(Default)]
struct QueueState {
    queue: VecDeque<SyncOperation>,
    failed: VecDeque<SyncOperation>,
}

struct SyncCounters {
    operations_processed: AtomicU64,
    operations_failed: AtomicU64,
    consecutive_failures: AtomicU64,
    last_sync_time: Mutex<f64>,
    secondary_available: AtomicBool,
    capacity: Mutex<CapacityStatus>,
}

/// Reconciles the primary and secondary in the background.
pub struct BackgroundSyncService {
    primary: Arc<dyn MemoryStorage>,
    secondary: Arc<dyn MemoryStorage>,
    config: HybridConfig,
    limits: CapacityLimits,
    state: Mutex<QueueState>,
    counters: SyncCounters,
    running: AtomicBool,
    paused: AtomicBool,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl BackgroundSyncService {
    /// Create a stopped service; call [`Self::start`] to spawn the loop
    pub fn new(
        primary: Arc<dyn MemoryStorage>,
        secondary: Arc<dyn MemoryStorage>,
        config: HybridConfig,
        limits: CapacityLimits,
    ) -> Arc<Self> {
        Arc::new(Self {
            primary,
            secondary,
            config,
            limits,
            state: Mutex::new(QueueState::default()),
            counters: SyncCounters {
                operations_processed: AtomicU64::new(0),
                operations_failed: AtomicU64::new(0),
                consecutive_failures: AtomicU64::new(0),
                last_sync_time: Mutex::new(0.0),
                secondary_available: AtomicBool::new(true),
                capacity: Mutex::new(CapacityStatus::default()),
            },
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            handle: Mutex::new(None),
        })
    }

    /// Spawn the drain loop
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("background sync service already running");
            return;
        }
        let service = Arc::clone(self);
        let handle = tokio::spawn(async move {
            service.run_loop().await;
        });
        *self.handle.lock().await = Some(handle);
        tracing::info!(
            interval_secs = self.config.sync_interval.as_secs(),
            "background sync service started"
        );
    }

    /// Stop the loop, then drain remaining operations best-effort
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.handle.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }

        let remaining: Vec<SyncOperation> = {
            let mut state = self.state.lock().await;
            let mut ops: Vec<SyncOperation> = state.queue.drain(..).collect();
            ops.extend(state.failed.drain(..));
            ops
        };
        if !remaining.is_empty() {
            tracing::info!(
                count = remaining.len(),
                "processing remaining operations before shutdown"
            );
            for op in remaining {
                self.process_operation(op).await;
            }
        }
        tracing::info!("background sync service stopped");
    }

    /// Pause queue draining (writes still enqueue)
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        tracing::info!("sync draining paused");
    }

    /// Resume queue draining
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        tracing::info!("sync draining resumed");
    }

    /// Whether draining is currently paused
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Enqueue an operation; a full queue falls back to inline processing so
    /// the caller is never blocked behind sync backpressure.
    pub async fn enqueue(&self, op: SyncOp) {
        let operation = SyncOperation::new(op, self.config.max_retries);
        let overflowed = {
            let mut state = self.state.lock().await;
            if state.queue.len() >= self.config.max_queue_size {
                true
            } else {
                state.queue.push_back(operation.clone());
                false
            }
        };
        if overflowed {
            tracing::warn!("sync queue full, processing operation inline");
            self.process_operation(operation).await;
        }
    }

    async fn run_loop(self: Arc<Self>) {
        tracing::info!("background sync loop started");
        let mut loop_backoff = Duration::from_secs(60);

        while self.running.load(Ordering::SeqCst) {
            let cycle = async {
                if !self.is_paused() {
                    self.drain_once().await;
                }
                let now = now_timestamp();
                let due = {
                    let last = *self.counters.last_sync_time.lock().await;
                    now - last >= self.config.sync_interval.as_secs_f64()
                };
                if due {
                    self.periodic_sync().await;
                    *self.counters.last_sync_time.lock().await = now;
                }
            };
            cycle.await;

            // The loop itself must never die; repeated trouble backs off
            let failures = self.counters.consecutive_failures.load(Ordering::SeqCst);
            if failures >= u64::from(MAX_CONSECUTIVE_FAILURES) {
                tracing::warn!(
                    failures,
                    backoff_secs = loop_backoff.as_secs(),
                    "too many consecutive sync failures, backing off"
                );
                tokio::time::sleep(loop_backoff).await;
                loop_backoff = (loop_backoff * 2).min(MAX_LOOP_BACKOFF);
            } else {
                loop_backoff = Duration::from_secs(60);
                tokio::time::sleep(self.config.drain_interval).await;
            }
        }
    }

    /// Drain up to `batch_size` due operations from the queue.
    /// Public so operators (and tests) can trigger an immediate pass.
    pub async fn drain_once(&self) {
        let now = Instant::now();
        let batch: Vec<SyncOperation> = {
            let mut state = self.state.lock().await;
            let mut batch = Vec::new();
            let mut deferred = VecDeque::new();
            while batch.len() < self.config.batch_size {
                let Some(op) = state.queue.pop_front() else {
                    break;
                };
                if op.due(now) {
                    batch.push(op);
                } else {
                    deferred.push_back(op);
                }
            }
            // Not-yet-due operations keep their queue position
            while let Some(op) = deferred.pop_back() {
                state.queue.push_front(op);
            }
            batch
        };

        for op in batch {
            self.process_operation(op).await;
        }
    }

    /// Apply a single operation to the secondary, classifying failures
    async fn process_operation(&self, mut operation: SyncOperation) {
        // Anti-resurrection: a store for a locally tombstoned hash is dropped
        if let SyncOp::Store(memory) = &operation.op {
            match self.primary.is_deleted(&memory.content_hash).await {
                Ok(true) => {
                    tracing::debug!(
                        hash = %memory.content_hash,
                        "dropping store sync for tombstoned memory"
                    );
                    return;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "tombstone check failed, proceeding with sync");
                }
            }

            // Capacity guard: refuse new stores at the critical threshold
            let capacity = self.counters.capacity.lock().await;
            if capacity.approaching_limits {
                drop(capacity);
                tracing::error!(
                    hash = %memory.content_hash,
                    "secondary at capacity, rejecting store sync without retry"
                );
                self.counters.operations_failed.fetch_add(1, Ordering::SeqCst);
                return;
            }
            drop(capacity);

            // Per-operation prerequisite: provider metadata size limit
            if let Ok(metadata_json) = serde_json::to_string(&memory.metadata) {
                let kb = metadata_json.len() as f64 / 1024.0;
                if kb > self.limits.max_metadata_kb as f64 {
                    tracing::error!(
                        hash = %memory.content_hash,
                        size_kb = kb,
                        limit_kb = self.limits.max_metadata_kb,
                        "metadata exceeds provider limit, dropping store sync"
                    );
                    self.counters.operations_failed.fetch_add(1, Ordering::SeqCst);
                    return;
                }
            }
        }

        let result = match &operation.op {
            SyncOp::Store(memory) => match self.secondary.store(memory).await {
                Ok((true, _)) => Ok(()),
                // Already mirrored (or tombstoned remotely): settled
                Ok((false, msg))
                    if msg.contains("Duplicate") || msg.contains("tombstone") =>
                {
                    Ok(())
                }
                Ok((false, msg)) => Err(StorageError::Http(msg)),
                Err(e) => Err(e),
            },
            SyncOp::Delete(hash) => match self.secondary.delete(hash).await {
                // Not-found deletes are idempotent successes
                Ok(_) => Ok(()),
                Err(e) => Err(e),
            },
            SyncOp::Update {
                content_hash,
                updates,
            } => match self.secondary.update_memory_metadata(content_hash, updates, true).await {
                Ok((true, _)) => Ok(()),
                Ok((false, msg)) => Err(StorageError::Http(msg)),
                Err(e) => Err(e),
            },
        };

        match result {
            Ok(()) => {
                self.counters.operations_processed.fetch_add(1, Ordering::SeqCst);
                self.counters.consecutive_failures.store(0, Ordering::SeqCst);
                self.counters.secondary_available.store(true, Ordering::SeqCst);
            }
            Err(e) => {
                self.counters.secondary_available.store(false, Ordering::SeqCst);
                self.handle_sync_error(&mut operation, &e).await;
            }
        }
    }

    async fn handle_sync_error(&self, operation: &mut SyncOperation, error: &StorageError) {
        let message = error.to_string();
        let class = classify_error(None, &message);

        match class {
            ErrorClass::Limit => {
                tracing::error!(
                    op = operation.op.kind(),
                    error = %message,
                    "provider limit error, dropping without retry"
                );
                self.counters.operations_failed.fetch_add(1, Ordering::SeqCst);
                let mut capacity = self.counters.capacity.lock().await;
                capacity.approaching_limits = true;
                capacity.warnings.push(format!("Limit error: {message}"));
            }
            ErrorClass::Transient => {
                operation.retries += 1;
                if operation.retries < operation.max_retries {
                    // Exponential in-queue delay: min(2^retries, 60) seconds
                    let delay =
                        Duration::from_secs((1u64 << operation.retries.min(16)).min(60));
                    operation.not_before = Some(Instant::now() + delay);
                    tracing::warn!(
                        op = operation.op.kind(),
                        retry = operation.retries,
                        max = operation.max_retries,
                        delay_secs = delay.as_secs(),
                        error = %message,
                        "transient sync error, scheduling retry"
                    );
                    let mut state = self.state.lock().await;
                    if state.failed.len() >= FAILED_OPS_CAPACITY {
                        state.failed.pop_front();
                        self.counters.operations_failed.fetch_add(1, Ordering::SeqCst);
                    }
                    state.failed.push_back(operation.clone());
                } else {
                    tracing::error!(
                        op = operation.op.kind(),
                        error = %message,
                        "max retries reached, dropping operation"
                    );
                    self.counters.operations_failed.fetch_add(1, Ordering::SeqCst);
                }
                self.counters.consecutive_failures.fetch_add(1, Ordering::SeqCst);
            }
            ErrorClass::Permanent => {
                tracing::error!(
                    op = operation.op.kind(),
                    error = %message,
                    "permanent sync error, dropping operation"
                );
                self.counters.operations_failed.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    /// Periodic work: retry the failed ring, health-check the secondary,
    /// and refresh the capacity snapshot.
    pub async fn periodic_sync(&self) {
        let retry_ops: Vec<SyncOperation> = {
            let mut state = self.state.lock().await;
            state.failed.drain(..).collect()
        };
        if !retry_ops.is_empty() {
            tracing::info!(count = retry_ops.len(), "retrying failed operations");
            let now = Instant::now();
            for op in retry_ops {
                if op.due(now) {
                    self.process_operation(op).await;
                } else {
                    self.state.lock().await.failed.push_back(op);
                }
            }
        }

        match self.secondary.get_stats().await {
            Ok(stats) => {
                self.counters.secondary_available.store(true, Ordering::SeqCst);
                self.update_capacity(stats.total_memories as u64).await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "secondary health check failed");
                self.counters.secondary_available.store(false, Ordering::SeqCst);
            }
        }
    }

    async fn update_capacity(&self, vector_count: u64) {
        let usage_percent = if self.limits.max_vectors > 0 {
            vector_count as f64 / self.limits.max_vectors as f64 * 100.0
        } else {
            0.0
        };

        let mut capacity = self.counters.capacity.lock().await;
        capacity.vector_count = vector_count;
        capacity.vector_limit = self.limits.max_vectors;
        capacity.usage_percent = usage_percent;
        capacity.warnings.clear();

        if usage_percent >= self.limits.critical_percent {
            let warning = format!(
                "CRITICAL: vector usage at {usage_percent:.1}% ({vector_count}/{})",
                self.limits.max_vectors
            );
            tracing::error!("{warning}");
            capacity.warnings.push(warning);
            capacity.approaching_limits = true;
        } else if usage_percent >= self.limits.warning_percent {
            let warning = format!(
                "WARNING: vector usage at {usage_percent:.1}% ({vector_count}/{})",
                self.limits.max_vectors
            );
            tracing::warn!("{warning}");
            capacity.warnings.push(warning);
            capacity.approaching_limits = true;
        } else {
            capacity.approaching_limits = false;
        }
    }

    /// Refresh the capacity snapshot immediately
    pub async fn check_capacity(&self) -> CapacityStatus {
        if let Ok(stats) = self.secondary.get_stats().await {
            self.update_capacity(stats.total_memories as u64).await;
        }
        self.counters.capacity.lock().await.clone()
    }

    /// One-shot full primary-to-secondary reconciliation
    pub async fn force_sync(&self) -> Result<ForceSyncReport> {
        let start = Instant::now();
        let primary_memories = self.primary.get_all_memories(None, 0, None, None).await?;
        let total = primary_memories.len();

        if self.secondary.get_stats().await.is_err() {
            self.counters.secondary_available.store(false, Ordering::SeqCst);
            return Ok(ForceSyncReport {
                status: "partial".to_string(),
                secondary_available: false,
                primary_memories: total,
                duration_seconds: start.elapsed().as_secs_f64(),
                ..Default::default()
            });
        }

        let mut synced = 0usize;
        let mut skipped = 0usize;
        let mut failed = 0usize;
        for memory in &primary_memories {
            match self.secondary.store(memory).await {
                Ok((true, _)) => synced += 1,
                Ok((false, msg)) if msg.contains("Duplicate") => skipped += 1,
                Ok((false, msg)) => {
                    tracing::debug!(hash = %memory.content_hash, msg, "force sync store refused");
                    failed += 1;
                }
                Err(e) => {
                    tracing::debug!(hash = %memory.content_hash, error = %e, "force sync store failed");
                    failed += 1;
                }
            }
        }

        let duration = start.elapsed().as_secs_f64();
        tracing::info!(synced, skipped, failed, duration, "force sync completed");
        Ok(ForceSyncReport {
            status: "completed".to_string(),
            secondary_available: true,
            primary_memories: total,
            synced_to_secondary: synced,
            skipped,
            failed,
            duration_seconds: duration,
        })
    }

    /// Current service status snapshot
    pub async fn status(&self) -> SyncStatus {
        let state = self.state.lock().await;
        SyncStatus {
            is_running: self.running.load(Ordering::SeqCst),
            is_paused: self.is_paused(),
            queue_size: state.queue.len(),
            failed_operations: state.failed.len(),
            operations_processed: self.counters.operations_processed.load(Ordering::SeqCst),
            operations_failed: self.counters.operations_failed.load(Ordering::SeqCst),
            last_sync_time: *self.counters.last_sync_time.lock().await,
            consecutive_failures: self.counters.consecutive_failures.load(Ordering::SeqCst)
                as u32,
            secondary_available: self.counters.secondary_available.load(Ordering::SeqCst),
            capacity: self.counters.capacity.lock().await.clone(),
        }
    }
}

// ============================================================================
// INITIAL CATCH-UP SYNC
// ============================================================================

#[derive(Default)]
struct InitialSyncState {
    in_progress: AtomicBool,
    total: AtomicUsize,
    completed: AtomicUsize,
    finished: AtomicBool,
}

/// Download memories present on the secondary but missing locally.
///
/// Cursor pagination keeps the remote store off its deep-OFFSET limits; two
/// explicit thresholds bound the scan: `max_empty_batches` consecutive
/// batches with zero new syncs (once at least one memory synced), and
/// `min_check_count` candidates checked with zero syncs (the pure no-op
/// case).
async fn run_initial_sync(
    primary: Arc<dyn MemoryStorage>,
    secondary: Arc<dyn MemoryStorage>,
    config: HybridConfig,
    state: Arc<InitialSyncState>,
) {
    state.in_progress.store(true, Ordering::SeqCst);
    state.finished.store(false, Ordering::SeqCst);
    state.completed.store(0, Ordering::SeqCst);

    let result: Result<()> = async {
        let primary_count = primary.count_all_memories(None, None).await?;
        let secondary_count = match secondary.get_stats().await {
            Ok(stats) => stats.total_memories,
            Err(e) => {
                tracing::warn!(error = %e, "secondary unreachable, skipping initial sync");
                return Ok(());
            }
        };

        tracing::info!(primary_count, secondary_count, "initial sync count comparison");
        if secondary_count <= primary_count {
            tracing::info!("primary has same or more memories, skipping initial sync");
            return Ok(());
        }

        let missing = secondary_count - primary_count;
        state.total.store(missing, Ordering::SeqCst);

        let mut cursor: Option<f64> = None;
        let mut synced = 0usize;
        let mut processed = 0usize;
        let mut consecutive_empty = 0usize;

        loop {
            let batch = match secondary
                .get_all_memories_cursor(config.initial_sync_page_size, cursor)
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::error!(error = %e, processed, "initial sync batch failed, stopping");
                    break;
                }
            };
            if batch.is_empty() {
                break;
            }

            let mut batch_synced = 0usize;
            for remote in &batch {
                processed += 1;
                match primary.get_by_hash(&remote.content_hash).await {
                    Ok(Some(_)) => continue,
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(hash = %remote.content_hash, error = %e, "hash check failed");
                        continue;
                    }
                }
                // Anti-resurrection: locally deleted memories stay deleted
                if primary.is_deleted(&remote.content_hash).await.unwrap_or(false) {
                    continue;
                }
                match primary.store(remote).await {
                    Ok((true, _)) => {
                        batch_synced += 1;
                        synced += 1;
                        state.completed.store(synced, Ordering::SeqCst);
                        if synced % 10 == 0 {
                            tracing::info!(synced, missing, "initial sync progress");
                        }
                    }
                    Ok((false, msg)) => {
                        tracing::warn!(hash = %remote.content_hash, msg, "initial sync store refused");
                    }
                    Err(e) => {
                        tracing::warn!(hash = %remote.content_hash, error = %e, "initial sync store failed");
                    }
                }
            }

            if batch_synced == 0 {
                consecutive_empty += 1;
            } else {
                consecutive_empty = 0;
            }

            cursor = batch
                .iter()
                .map(|m| m.created_at)
                .fold(f64::INFINITY, f64::min)
                .into();

            if consecutive_empty >= config.max_empty_batches && synced > 0 {
                tracing::info!(
                    consecutive_empty,
                    synced,
                    processed,
                    "initial sync early stop: empty batch threshold"
                );
                break;
            }
            if processed >= config.min_check_count && synced == 0 {
                tracing::info!(
                    processed,
                    "initial sync early stop: no missing memories found"
                );
                break;
            }

            tokio::task::yield_now().await;
        }

        tracing::info!(synced, "initial sync completed");
        if synced == 0 {
            // Pure no-op pass counts as fully complete
            state
                .completed
                .store(state.total.load(Ordering::SeqCst), Ordering::SeqCst);
        }
        Ok(())
    }
    .await;

    if let Err(e) = result {
        tracing::error!(error = %e, "initial sync failed; continuing without it");
    }
    state.in_progress.store(false, Ordering::SeqCst);
    state.finished.store(true, Ordering::SeqCst);
}

// ============================================================================
// HYBRID STORAGE
// ============================================================================

/// Two-tier storage: embedded primary, cloud secondary, background sync
pub struct HybridStorage {
    primary: Arc<dyn MemoryStorage>,
    secondary: Option<Arc<dyn MemoryStorage>>,
    sync_service: Option<Arc<BackgroundSyncService>>,
    secondary_enabled: AtomicBool,
    config: HybridConfig,
    initial_sync: Arc<InitialSyncState>,
}

impl HybridStorage {
    /// Compose a primary with an optional secondary.
    /// With no secondary the engine runs local-only and sync is disabled.
    pub fn new(
        primary: Arc<dyn MemoryStorage>,
        secondary: Option<Arc<dyn MemoryStorage>>,
        config: HybridConfig,
        limits: CapacityLimits,
    ) -> Self {
        let sync_service = secondary.as_ref().map(|secondary| {
            BackgroundSyncService::new(
                Arc::clone(&primary),
                Arc::clone(secondary),
                config.clone(),
                limits,
            )
        });
        Self {
            primary,
            secondary,
            sync_service,
            secondary_enabled: AtomicBool::new(false),
            config,
            initial_sync: Arc::new(InitialSyncState::default()),
        }
    }

    fn sync(&self) -> Option<&Arc<BackgroundSyncService>> {
        if self.secondary_enabled.load(Ordering::SeqCst) {
            self.sync_service.as_ref()
        } else {
            None
        }
    }

    async fn enqueue(&self, op: SyncOp) {
        if let Some(service) = self.sync() {
            service.enqueue(op).await;
        }
    }

    /// Background sync service handle, when sync is active
    pub fn sync_service(&self) -> Option<Arc<BackgroundSyncService>> {
        self.sync().cloned()
    }

    /// Pause background draining (consolidation calls this on entry)
    pub fn pause_sync(&self) {
        if let Some(service) = self.sync() {
            service.pause();
        }
    }

    /// Resume background draining (consolidation calls this on exit)
    pub fn resume_sync(&self) {
        if let Some(service) = self.sync() {
            service.resume();
        }
    }

    /// Trigger a full one-shot primary-to-secondary reconciliation
    pub async fn force_sync(&self) -> Result<ForceSyncReport> {
        match self.sync() {
            Some(service) => service.force_sync().await,
            None => Ok(ForceSyncReport {
                status: "disabled".to_string(),
                ..Default::default()
            }),
        }
    }

    /// Current sync service status
    pub async fn get_sync_status(&self) -> SyncStatus {
        match self.sync() {
            Some(service) => service.status().await,
            None => SyncStatus::default(),
        }
    }

    /// Initial catch-up sync progress
    pub fn get_initial_sync_status(&self) -> InitialSyncStatus {
        let total = self.initial_sync.total.load(Ordering::SeqCst);
        let completed = self.initial_sync.completed.load(Ordering::SeqCst);
        InitialSyncStatus {
            in_progress: self.initial_sync.in_progress.load(Ordering::SeqCst),
            total,
            completed,
            finished: self.initial_sync.finished.load(Ordering::SeqCst),
            progress_percentage: if total > 0 {
                (completed as f64 / total as f64 * 100.0 * 10.0).round() / 10.0
            } else {
                0.0
            },
        }
    }

    /// Clean shutdown: stop sync (draining the queue) before dropping
    pub async fn close(&self) {
        if let Some(service) = self.sync() {
            service.stop().await;
        }
    }

    /// Compare metadata between backends for a sample of shared memories and
    /// apply the primary's view where they diverge.
    ///
    /// `period_days`, when set, restricts the sample to memories created in
    /// the last N days (it filters; it is never silently ignored).
    pub async fn detect_drift(
        &self,
        dry_run: bool,
        limit: Option<usize>,
        period_days: Option<u32>,
    ) -> Result<DriftReport> {
        let Some(secondary) = self.secondary.as_ref().filter(|_| self.sync().is_some()) else {
            return Err(StorageError::Unsupported("drift detection requires a secondary"));
        };

        let batch = limit.unwrap_or(self.config.drift_batch_size);
        let sample = match period_days {
            Some(days) => {
                let start = now_timestamp() - f64::from(days) * 86_400.0;
                let mut memories = self
                    .primary
                    .get_memories_by_time_range(start, now_timestamp())
                    .await?;
                memories.truncate(batch);
                memories
            }
            None => self.primary.get_all_memories(Some(batch), 0, None, None).await?,
        };

        let mut report = DriftReport {
            dry_run,
            ..Default::default()
        };

        for local in &sample {
            let Some(remote) = secondary.get_by_hash(&local.content_hash).await? else {
                continue;
            };
            report.checked += 1;

            let drifted = local.tags != remote.tags
                || local.memory_type != remote.memory_type
                || local.metadata != remote.metadata;
            if !drifted {
                continue;
            }
            report.drifted += 1;

            if dry_run {
                continue;
            }
            let updates = MemoryUpdates {
                tags: Some(local.tags.clone()),
                memory_type: local.memory_type.clone(),
                metadata: Some(local.metadata.clone()),
            };
            match secondary
                .update_memory_metadata(&local.content_hash, &updates, true)
                .await
            {
                Ok((true, _)) => report.applied += 1,
                Ok((false, msg)) => {
                    tracing::warn!(hash = %local.content_hash, msg, "drift repair refused");
                    report.failed += 1;
                }
                Err(e) => {
                    tracing::warn!(hash = %local.content_hash, error = %e, "drift repair failed");
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            checked = report.checked,
            drifted = report.drifted,
            applied = report.applied,
            dry_run,
            "drift detection pass complete"
        );
        Ok(report)
    }
}

#[async_trait]
impl MemoryStorage for HybridStorage {
    fn max_content_length(&self) -> Option<usize> {
        self.primary.max_content_length()
    }

    fn supports_chunking(&self) -> bool {
        self.primary.supports_chunking()
    }

    async fn initialize(&self) -> Result<()> {
        self.primary.initialize().await?;
        tracing::info!("hybrid primary initialized");

        let (Some(secondary), Some(service)) = (&self.secondary, &self.sync_service) else {
            tracing::warn!("no secondary configured, running in local-only mode");
            return Ok(());
        };

        match secondary.initialize().await {
            Ok(()) => {
                self.secondary_enabled.store(true, Ordering::SeqCst);
                service.start().await;
                tracing::info!("hybrid secondary initialized, sync service started");

                if self.config.sync_on_startup {
                    let primary = Arc::clone(&self.primary);
                    let secondary = Arc::clone(secondary);
                    let config = self.config.clone();
                    let state = Arc::clone(&self.initial_sync);
                    tokio::spawn(async move {
                        // Give the hosting service time to start serving
                        tokio::time::sleep(config.startup_delay).await;
                        run_initial_sync(primary, secondary, config, state).await;
                    });
                }
            }
            Err(e) => {
                // Degraded mode: the primary keeps serving alone
                tracing::warn!(error = %e, "secondary initialization failed, continuing local-only");
            }
        }
        Ok(())
    }

    async fn store(&self, memory: &Memory) -> Result<(bool, String)> {
        let (ok, message) = self.primary.store(memory).await?;
        if ok {
            self.enqueue(SyncOp::Store(Box::new(memory.clone()))).await;
        }
        Ok((ok, message))
    }

    async fn store_batch(&self, memories: &[Memory]) -> Result<Vec<(bool, String)>> {
        let outcomes = self.primary.store_batch(memories).await?;
        for (memory, (ok, _)) in memories.iter().zip(&outcomes) {
            if *ok {
                self.enqueue(SyncOp::Store(Box::new(memory.clone()))).await;
            }
        }
        Ok(outcomes)
    }

    async fn retrieve(&self, query: &str, n_results: usize) -> Result<Vec<MemoryQueryResult>> {
        self.primary.retrieve(query, n_results).await
    }

    async fn retrieve_hybrid(&self, query: &str, n_results: usize) -> Result<Vec<MemoryQueryResult>> {
        self.primary.retrieve_hybrid(query, n_results).await
    }

    async fn search_by_tag(&self, tags: &[String], time_start: Option<f64>) -> Result<Vec<Memory>> {
        self.primary.search_by_tag(tags, time_start).await
    }

    async fn search_by_tags(
        &self,
        tags: &[String],
        operation: TagMatch,
        time_start: Option<f64>,
        time_end: Option<f64>,
    ) -> Result<Vec<Memory>> {
        self.primary
            .search_by_tags(tags, operation, time_start, time_end)
            .await
    }

    async fn search_by_tag_chronological(
        &self,
        tags: &[String],
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<Memory>> {
        self.primary
            .search_by_tag_chronological(tags, limit, offset)
            .await
    }

    async fn delete(&self, content_hash: &str) -> Result<(bool, String)> {
        let (ok, message) = self.primary.delete(content_hash).await?;
        if ok {
            self.enqueue(SyncOp::Delete(content_hash.to_string())).await;
        }
        Ok((ok, message))
    }

    async fn is_deleted(&self, content_hash: &str) -> Result<bool> {
        self.primary.is_deleted(content_hash).await
    }

    async fn purge_deleted(&self, older_than_days: u32) -> Result<usize> {
        self.primary.purge_deleted(older_than_days).await
    }

    async fn delete_by_tag(&self, tag: &str) -> Result<(usize, String)> {
        let (count, message, _) = self
            .delete_by_tags(std::slice::from_ref(&tag.to_string()))
            .await?;
        Ok((count, message))
    }

    async fn delete_by_tags(&self, tags: &[String]) -> Result<(usize, String, Vec<String>)> {
        let (count, message, hashes) = self.primary.delete_by_tags(tags).await?;
        for hash in &hashes {
            self.enqueue(SyncOp::Delete(hash.clone())).await;
        }
        Ok((count, message, hashes))
    }

    async fn delete_by_timeframe(
        &self,
        start: f64,
        end: f64,
        tag: Option<&str>,
    ) -> Result<(usize, String)> {
        self.primary.delete_by_timeframe(start, end, tag).await
    }

    async fn delete_before_date(&self, before: f64, tag: Option<&str>) -> Result<(usize, String)> {
        self.primary.delete_before_date(before, tag).await
    }

    async fn cleanup_duplicates(&self) -> Result<(usize, String)> {
        // Primary only; the secondary converges through normal sync
        self.primary.cleanup_duplicates().await
    }

    async fn update_memory_metadata(
        &self,
        content_hash: &str,
        updates: &MemoryUpdates,
        preserve_timestamps: bool,
    ) -> Result<(bool, String)> {
        let (ok, message) = self
            .primary
            .update_memory_metadata(content_hash, updates, preserve_timestamps)
            .await?;
        if ok {
            self.enqueue(SyncOp::Update {
                content_hash: content_hash.to_string(),
                updates: updates.clone(),
            })
            .await;
        }
        Ok((ok, message))
    }

    async fn update_memories_batch(&self, memories: &[Memory]) -> Result<Vec<bool>> {
        let results = self.primary.update_memories_batch(memories).await?;
        for (memory, ok) in memories.iter().zip(&results) {
            if *ok {
                self.enqueue(SyncOp::Update {
                    content_hash: memory.content_hash.clone(),
                    updates: MemoryUpdates {
                        tags: Some(memory.tags.clone()),
                        memory_type: memory.memory_type.clone(),
                        metadata: Some(memory.metadata.clone()),
                    },
                })
                .await;
            }
        }
        Ok(results)
    }

    async fn get_by_hash(&self, content_hash: &str) -> Result<Option<Memory>> {
        self.primary.get_by_hash(content_hash).await
    }

    async fn get_by_exact_content(&self, content: &str) -> Result<Vec<Memory>> {
        self.primary.get_by_exact_content(content).await
    }

    async fn get_all_memories(
        &self,
        limit: Option<usize>,
        offset: usize,
        memory_type: Option<&str>,
        tags: Option<&[String]>,
    ) -> Result<Vec<Memory>> {
        self.primary
            .get_all_memories(limit, offset, memory_type, tags)
            .await
    }

    async fn count_all_memories(
        &self,
        memory_type: Option<&str>,
        tags: Option<&[String]>,
    ) -> Result<usize> {
        self.primary.count_all_memories(memory_type, tags).await
    }

    async fn get_all_memories_cursor(
        &self,
        limit: usize,
        cursor: Option<f64>,
    ) -> Result<Vec<Memory>> {
        self.primary.get_all_memories_cursor(limit, cursor).await
    }

    async fn get_memories_by_time_range(&self, start: f64, end: f64) -> Result<Vec<Memory>> {
        self.primary.get_memories_by_time_range(start, end).await
    }

    async fn get_memory_timestamps(&self, days: Option<u32>) -> Result<Vec<f64>> {
        self.primary.get_memory_timestamps(days).await
    }

    async fn get_stats(&self) -> Result<StorageStats> {
        let mut stats = self.primary.get_stats().await?;
        stats.backend = match &self.secondary {
            Some(_) => "hybrid (sqlite + cloud)".to_string(),
            None => "hybrid (local-only)".to_string(),
        };

        if let Some(service) = self.sync() {
            let sync_status = service.status().await;
            let secondary_reachable = sync_status.secondary_available;
            stats.sync_status = Some(sync_status);
            if secondary_reachable {
                if let Some(secondary) = &self.secondary {
                    match secondary.get_stats().await {
                        Ok(remote) => stats.secondary_stats = Some(Box::new(remote)),
                        Err(e) => {
                            tracing::debug!(error = %e, "secondary stats unavailable")
                        }
                    }
                }
            }
        }
        Ok(stats)
    }

    async fn get_all_tags(&self) -> Result<Vec<String>> {
        self.primary.get_all_tags().await
    }

    async fn get_all_tags_with_counts(&self) -> Result<Vec<TagCount>> {
        self.primary.get_all_tags_with_counts().await
    }

    async fn get_recent_memories(&self, n: usize) -> Result<Vec<Memory>> {
        self.primary.get_recent_memories(n).await
    }

    async fn get_memory_connections(&self) -> Result<std::collections::HashMap<String, usize>> {
        self.primary.get_memory_connections().await
    }

    async fn get_access_patterns(&self) -> Result<std::collections::HashMap<String, f64>> {
        self.primary.get_access_patterns().await
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::inmem::InMemoryStorage;

    fn mem(content: &str, tags: &[&str]) -> Memory {
        Memory::new(content, tags.iter().map(|t| t.to_string()).collect(), None)
    }

    fn quick_config() -> HybridConfig {
        HybridConfig {
            sync_on_startup: false,
            startup_delay: Duration::from_millis(0),
            ..Default::default()
        }
    }

    async fn hybrid_pair() -> (HybridStorage, Arc<InMemoryStorage>) {
        let primary = Arc::new(InMemoryStorage::new());
        let secondary = Arc::new(InMemoryStorage::new());
        let hybrid = HybridStorage::new(
            primary,
            Some(secondary.clone() as Arc<dyn MemoryStorage>),
            quick_config(),
            CapacityLimits::default(),
        );
        hybrid.initialize().await.unwrap();
        (hybrid, secondary)
    }

    #[tokio::test]
    async fn test_store_reaches_secondary_after_drain() {
        let (hybrid, secondary) = hybrid_pair().await;
        let m = mem("sync me over", &["sync"]);
        let (ok, _) = hybrid.store(&m).await.unwrap();
        assert!(ok);

        // Not yet mirrored
        assert!(secondary.get_by_hash(&m.content_hash).await.unwrap().is_none());

        let service = hybrid.sync_service().unwrap();
        service.drain_once().await;
        assert!(secondary.get_by_hash(&m.content_hash).await.unwrap().is_some());

        let status = service.status().await;
        assert_eq!(status.operations_processed, 1);
        assert_eq!(status.operations_failed, 0);
        hybrid.close().await;
    }

    #[tokio::test]
    async fn test_store_succeeds_when_secondary_down() {
        let (hybrid, secondary) = hybrid_pair().await;
        secondary.fail_next_operations(10).await;

        let m = mem("resilient store", &[]);
        let (ok, _) = hybrid.store(&m).await.unwrap();
        assert!(ok);
        assert!(hybrid.get_by_hash(&m.content_hash).await.unwrap().is_some());

        let service = hybrid.sync_service().unwrap();
        let depth_before = service.status().await.queue_size;
        assert_eq!(depth_before, 1);

        // Drain hits the simulated outage: retry scheduled, nothing failed yet
        service.drain_once().await;
        let status = service.status().await;
        assert_eq!(status.operations_processed, 0);
        assert_eq!(status.failed_operations, 1);
        assert_eq!(status.operations_failed, 0);
        hybrid.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_backoff_then_recovery() {
        let (hybrid, secondary) = hybrid_pair().await;
        secondary.fail_next_operations(1).await;

        let m = mem("retry candidate", &[]);
        hybrid.store(&m).await.unwrap();
        let service = hybrid.sync_service().unwrap();

        service.drain_once().await;
        let status = service.status().await;
        assert_eq!(status.failed_operations, 1);

        // Before the 2^1 = 2s backoff expires the retry ring keeps it
        service.periodic_sync().await;
        assert!(secondary.get_by_hash(&m.content_hash).await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(3)).await;
        service.periodic_sync().await;
        assert!(secondary.get_by_hash(&m.content_hash).await.unwrap().is_some());
        let status = service.status().await;
        assert_eq!(status.operations_processed, 1);
        assert_eq!(status.operations_failed, 0);
    }

    #[tokio::test]
    async fn test_delete_propagates_and_blocks_resurrection() {
        let (hybrid, secondary) = hybrid_pair().await;
        let m = mem("short lived entry", &[]);
        hybrid.store(&m).await.unwrap();
        let service = hybrid.sync_service().unwrap();
        service.drain_once().await;
        assert!(secondary.get_by_hash(&m.content_hash).await.unwrap().is_some());

        let (ok, _) = hybrid.delete(&m.content_hash).await.unwrap();
        assert!(ok);
        assert!(hybrid.is_deleted(&m.content_hash).await.unwrap());
        service.drain_once().await;
        assert!(secondary.get_by_hash(&m.content_hash).await.unwrap().is_none());

        // A stray store sync for the tombstoned hash is dropped
        service.enqueue(SyncOp::Store(Box::new(m.clone()))).await;
        service.drain_once().await;
        assert!(secondary.get_by_hash(&m.content_hash).await.unwrap().is_none());
        hybrid.close().await;
    }

    #[tokio::test]
    async fn test_update_metadata_syncs() {
        let (hybrid, secondary) = hybrid_pair().await;
        let m = mem("metadata bearer", &["old"]);
        hybrid.store(&m).await.unwrap();
        let service = hybrid.sync_service().unwrap();
        service.drain_once().await;

        let updates = MemoryUpdates {
            tags: Some(vec!["new".to_string()]),
            ..Default::default()
        };
        hybrid
            .update_memory_metadata(&m.content_hash, &updates, true)
            .await
            .unwrap();
        service.drain_once().await;

        let remote = secondary.get_by_hash(&m.content_hash).await.unwrap().unwrap();
        assert_eq!(remote.tags, vec!["new"]);
        hybrid.close().await;
    }

    #[tokio::test]
    async fn test_capacity_guard_rejects_stores() {
        let primary = Arc::new(InMemoryStorage::new());
        let secondary = Arc::new(InMemoryStorage::new());
        let limits = CapacityLimits {
            max_vectors: 10,
            warning_percent: 30.0,
            critical_percent: 50.0,
            ..Default::default()
        };
        let hybrid = HybridStorage::new(
            primary,
            Some(secondary.clone() as Arc<dyn MemoryStorage>),
            quick_config(),
            limits,
        );
        hybrid.initialize().await.unwrap();
        let service = hybrid.sync_service().unwrap();

        // Fill the secondary to 60% of the limit, beyond critical
        for i in 0..6 {
            secondary.store(&mem(&format!("filler {i}"), &[])).await.unwrap();
        }
        let capacity = service.check_capacity().await;
        assert!(capacity.approaching_limits);
        assert!(!capacity.warnings.is_empty());

        let m = mem("rejected by guard", &[]);
        hybrid.store(&m).await.unwrap();
        service.drain_once().await;

        let status = service.status().await;
        assert_eq!(status.operations_failed, 1);
        assert_eq!(status.failed_operations, 0, "no retry for capacity rejection");
        assert!(secondary.get_by_hash(&m.content_hash).await.unwrap().is_none());
        hybrid.close().await;
    }

    #[tokio::test]
    async fn test_metadata_size_prerequisite() {
        let primary = Arc::new(InMemoryStorage::new());
        let secondary = Arc::new(InMemoryStorage::new());
        let limits = CapacityLimits {
            max_metadata_kb: 1,
            ..Default::default()
        };
        let hybrid = HybridStorage::new(
            primary,
            Some(secondary.clone() as Arc<dyn MemoryStorage>),
            quick_config(),
            limits,
        );
        hybrid.initialize().await.unwrap();
        let service = hybrid.sync_service().unwrap();

        let mut m = mem("oversized metadata", &[]);
        m.metadata.insert("blob".into(), "x".repeat(2048).into());
        hybrid.store(&m).await.unwrap();
        service.drain_once().await;

        let status = service.status().await;
        assert_eq!(status.operations_failed, 1);
        assert!(secondary.get_by_hash(&m.content_hash).await.unwrap().is_none());
        hybrid.close().await;
    }

    #[tokio::test]
    async fn test_queue_overflow_processes_inline() {
        let primary = Arc::new(InMemoryStorage::new());
        let secondary = Arc::new(InMemoryStorage::new());
        let config = HybridConfig {
            max_queue_size: 1,
            ..quick_config()
        };
        let hybrid = HybridStorage::new(
            primary,
            Some(secondary.clone() as Arc<dyn MemoryStorage>),
            config,
            CapacityLimits::default(),
        );
        hybrid.initialize().await.unwrap();

        let a = mem("first fills the queue", &[]);
        let b = mem("second goes inline", &[]);
        hybrid.store(&a).await.unwrap();
        hybrid.store(&b).await.unwrap();

        // The overflowing op was applied immediately
        assert!(secondary.get_by_hash(&b.content_hash).await.unwrap().is_some());
        hybrid.close().await;
    }

    #[tokio::test]
    async fn test_pause_holds_queue_resume_drains() {
        let (hybrid, secondary) = hybrid_pair().await;
        let service = hybrid.sync_service().unwrap();
        hybrid.pause_sync();

        let m = mem("paused write", &[]);
        hybrid.store(&m).await.unwrap();
        assert!(service.is_paused());
        assert_eq!(service.status().await.queue_size, 1);

        hybrid.resume_sync();
        service.drain_once().await;
        assert!(secondary.get_by_hash(&m.content_hash).await.unwrap().is_some());
        hybrid.close().await;
    }

    #[tokio::test]
    async fn test_force_sync_pushes_everything() {
        let (hybrid, secondary) = hybrid_pair().await;
        for i in 0..5 {
            hybrid.store(&mem(&format!("bulk {i}"), &[])).await.unwrap();
        }
        // Skip queue draining entirely; force_sync walks the primary
        let report = hybrid.force_sync().await.unwrap();
        assert_eq!(report.status, "completed");
        assert_eq!(report.primary_memories, 5);
        assert_eq!(report.synced_to_secondary, 5);
        assert_eq!(secondary.count_all_memories(None, None).await.unwrap(), 5);

        // Second pass skips duplicates
        let report = hybrid.force_sync().await.unwrap();
        assert_eq!(report.synced_to_secondary, 0);
        assert_eq!(report.skipped, 5);
        hybrid.close().await;
    }

    #[tokio::test]
    async fn test_initial_sync_downloads_missing() {
        let primary = Arc::new(InMemoryStorage::new());
        let secondary = Arc::new(InMemoryStorage::new());
        for i in 0..7 {
            secondary.store(&mem(&format!("cloud only {i}"), &[])).await.unwrap();
        }

        let state = Arc::new(InitialSyncState::default());
        run_initial_sync(
            primary.clone() as Arc<dyn MemoryStorage>,
            secondary.clone() as Arc<dyn MemoryStorage>,
            HybridConfig {
                initial_sync_page_size: 3,
                ..quick_config()
            },
            state.clone(),
        )
        .await;

        assert_eq!(primary.count_all_memories(None, None).await.unwrap(), 7);
        assert!(state.finished.load(Ordering::SeqCst));
        assert_eq!(state.completed.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn test_initial_sync_skips_when_primary_ahead() {
        let primary = Arc::new(InMemoryStorage::new());
        let secondary = Arc::new(InMemoryStorage::new());
        primary.store(&mem("local a", &[])).await.unwrap();
        primary.store(&mem("local b", &[])).await.unwrap();
        secondary.store(&mem("remote a", &[])).await.unwrap();

        let state = Arc::new(InitialSyncState::default());
        run_initial_sync(
            primary.clone() as Arc<dyn MemoryStorage>,
            secondary as Arc<dyn MemoryStorage>,
            quick_config(),
            state.clone(),
        )
        .await;

        assert_eq!(primary.count_all_memories(None, None).await.unwrap(), 2);
        assert!(state.finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_initial_sync_no_op_early_stop() {
        // Secondary has more rows but every candidate already exists locally
        // (count inflated by remote-only tombstones is the realistic shape;
        // here we delete locally after mirroring to create the overlap)
        let primary = Arc::new(InMemoryStorage::new());
        let secondary = Arc::new(InMemoryStorage::new());
        for i in 0..6 {
            let m = mem(&format!("shared {i}"), &[]);
            primary.store(&m).await.unwrap();
            secondary.store(&m).await.unwrap();
        }
        secondary.store(&mem("remote extra", &[])).await.unwrap();
        // Tombstone the extra locally so it cannot resurrect
        primary.store(&mem("remote extra", &[])).await.unwrap();
        primary.delete(&crate::memory::generate_content_hash("remote extra")).await.unwrap();

        let state = Arc::new(InitialSyncState::default());
        run_initial_sync(
            primary.clone() as Arc<dyn MemoryStorage>,
            secondary as Arc<dyn MemoryStorage>,
            HybridConfig {
                initial_sync_page_size: 2,
                min_check_count: 4,
                ..quick_config()
            },
            state.clone(),
        )
        .await;

        assert!(state.finished.load(Ordering::SeqCst));
        // The tombstoned memory stayed deleted
        assert!(primary
            .get_by_hash(&crate::memory::generate_content_hash("remote extra"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_stats_merge_sync_status() {
        let (hybrid, _secondary) = hybrid_pair().await;
        hybrid.store(&mem("stat subject", &["t"])).await.unwrap();
        let stats = hybrid.get_stats().await.unwrap();
        assert!(stats.backend.starts_with("hybrid"));
        assert_eq!(stats.total_memories, 1);
        assert!(stats.sync_status.is_some());
        hybrid.close().await;
    }

    #[tokio::test]
    async fn test_drift_detection_dry_run_and_apply() {
        let (hybrid, secondary) = hybrid_pair().await;
        let m = mem("drifting memory", &["a"]);
        hybrid.store(&m).await.unwrap();
        hybrid.sync_service().unwrap().drain_once().await;

        // Diverge the secondary
        secondary
            .update_memory_metadata(
                &m.content_hash,
                &MemoryUpdates {
                    tags: Some(vec!["b".to_string()]),
                    ..Default::default()
                },
                true,
            )
            .await
            .unwrap();

        let report = hybrid.detect_drift(true, None, None).await.unwrap();
        assert_eq!(report.drifted, 1);
        assert_eq!(report.applied, 0);
        // Dry run left the divergence in place
        let remote = secondary.get_by_hash(&m.content_hash).await.unwrap().unwrap();
        assert_eq!(remote.tags, vec!["b"]);

        let report = hybrid.detect_drift(false, None, None).await.unwrap();
        assert_eq!(report.applied, 1);
        let remote = secondary.get_by_hash(&m.content_hash).await.unwrap().unwrap();
        assert_eq!(remote.tags, vec!["a"]);
        hybrid.close().await;
    }

    #[tokio::test]
    async fn test_local_only_mode() {
        let primary = Arc::new(InMemoryStorage::new());
        let hybrid = HybridStorage::new(
            primary,
            None,
            quick_config(),
            CapacityLimits::default(),
        );
        hybrid.initialize().await.unwrap();

        let m = mem("local only", &[]);
        assert!(hybrid.store(&m).await.unwrap().0);
        let report = hybrid.force_sync().await.unwrap();
        assert_eq!(report.status, "disabled");
        let status = hybrid.get_sync_status().await;
        assert!(!status.is_running);
    }
}
