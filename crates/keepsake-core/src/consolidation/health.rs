//! Consolidation health monitoring
//!
//! Every phase records its duration, memories processed, and outcome into a
//! rolling history that powers health reporting. Repeated failures raise
//! alerts operators can resolve by id.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::memory::now_timestamp;

/// Rolling history depth
const HISTORY_CAPACITY: usize = 200;

/// Errors within this window of a phase raise an alert
const ALERT_ERROR_THRESHOLD: usize = 3;

/// Record of one phase execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseRecord {
    /// Phase name
    pub phase: String,
    /// Horizon that ran it
    pub horizon: String,
    /// When the phase finished (UTC seconds)
    pub recorded_at: f64,
    /// Wall-clock duration in seconds
    pub duration_seconds: f64,
    /// Memories the phase touched
    pub memories_processed: usize,
    /// Whether it completed without errors
    pub success: bool,
    /// Error messages, if any
    pub errors: Vec<String>,
}

/// A raised health alert
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidationAlert {
    /// Alert id, used to resolve it
    pub id: String,
    /// Affected phase
    pub phase: String,
    /// Human-readable description
    pub message: String,
    /// When the alert was raised (UTC seconds)
    pub raised_at: f64,
    /// Whether an operator resolved it
    pub resolved: bool,
}

/// Health summary for `/health` style reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSummary {
    /// Total recorded phase runs
    pub total_runs: usize,
    /// Runs that succeeded
    pub successful_runs: usize,
    /// Unresolved alert count
    pub active_alerts: usize,
    /// Most recent record per phase
    pub last_runs: Vec<PhaseRecord>,
}

/// Rolling consolidation health monitor
#[derive(Default)]
pub struct ConsolidationHealth {
    history: VecDeque<PhaseRecord>,
    alerts: Vec<ConsolidationAlert>,
}

impl ConsolidationHealth {
    /// Create an empty monitor
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finished phase, raising an alert on repeated failures
    pub fn record_phase(
        &mut self,
        phase: &str,
        horizon: &str,
        duration_seconds: f64,
        memories_processed: usize,
        errors: Vec<String>,
    ) {
        let success = errors.is_empty();
        if self.history.len() >= HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(PhaseRecord {
            phase: phase.to_string(),
            horizon: horizon.to_string(),
            recorded_at: now_timestamp(),
            duration_seconds,
            memories_processed,
            success,
            errors,
        });

        if !success {
            let recent_failures = self
                .history
                .iter()
                .rev()
                .filter(|r| r.phase == phase)
                .take(ALERT_ERROR_THRESHOLD)
                .filter(|r| !r.success)
                .count();
            if recent_failures >= ALERT_ERROR_THRESHOLD
                && !self
                    .alerts
                    .iter()
                    .any(|a| a.phase == phase && !a.resolved)
            {
                let alert = ConsolidationAlert {
                    id: Uuid::new_v4().to_string(),
                    phase: phase.to_string(),
                    message: format!(
                        "{phase} failed {recent_failures} consecutive times"
                    ),
                    raised_at: now_timestamp(),
                    resolved: false,
                };
                tracing::error!(phase, alert_id = %alert.id, "consolidation alert raised");
                self.alerts.push(alert);
            }
        }
    }

    /// Resolve an alert by id; false if unknown
    pub fn resolve_alert(&mut self, id: &str) -> bool {
        for alert in &mut self.alerts {
            if alert.id == id && !alert.resolved {
                alert.resolved = true;
                tracing::info!(alert_id = id, "consolidation alert resolved");
                return true;
            }
        }
        false
    }

    /// Unresolved alerts
    pub fn active_alerts(&self) -> Vec<&ConsolidationAlert> {
        self.alerts.iter().filter(|a| !a.resolved).collect()
    }

    /// Recent phase records, newest last
    pub fn history(&self, limit: usize) -> Vec<&PhaseRecord> {
        let skip = self.history.len().saturating_sub(limit);
        self.history.iter().skip(skip).collect()
    }

    /// Aggregate summary
    pub fn summary(&self) -> HealthSummary {
        let mut last_runs: Vec<PhaseRecord> = Vec::new();
        for record in self.history.iter().rev() {
            if !last_runs.iter().any(|r| r.phase == record.phase) {
                last_runs.push(record.clone());
            }
        }
        HealthSummary {
            total_runs: self.history.len(),
            successful_runs: self.history.iter().filter(|r| r.success).count(),
            active_alerts: self.active_alerts().len(),
            last_runs,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
