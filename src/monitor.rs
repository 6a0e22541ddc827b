//! Query metrics, periodic health snapshots, and threshold alerts.
//!
//! The orchestrator hands every finished request to
//! [`HealthMonitor::record_query`]; judged answers arrive through
//! [`HealthMonitor::record_quality`]. A background task started by
//! [`HealthMonitor::spawn`] takes a [`HealthSnapshot`] every
//! `interval_secs`, checks the error rate, and writes `health.json`.
//!
//! | Alert | Severity | Raised when |
//! |-------|----------|-------------|
//! | `slow_queries` | medium | one request exceeds `max_processing_ms` |
//! | `low_quality` | high | a judged answer scores below `min_quality_score` |
//! | `low_confidence` | medium | judge confidence below `min_confidence_score` |
//! | `high_error_rate` | critical | failed share of the recent window above `max_error_rate` |
//!
//! At most one unresolved alert per type is kept.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::persist::{self, HEALTH_FILE};
use crate::tuner::{Clock, FeedbackSummary, FeedbackTuner};

/// Error rate is only judged once the window holds this many requests.
const MIN_QUERIES_FOR_ERROR_RATE: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryMetrics {
    pub query_id: String,
    pub query_type: String,
    pub timestamp: DateTime<Utc>,
    pub processing_ms: f64,
    pub candidates_retrieved: usize,
    pub final_count: usize,
    pub retrieval_method: String,
    /// Stages skipped or degraded while serving the request.
    #[serde(default)]
    pub degraded: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub timestamp: DateTime<Utc>,
    pub avg_processing_ms: f64,
    pub successful_queries: usize,
    pub failed_queries: usize,
    pub degraded_queries: usize,
    pub avg_quality_score: f64,
    pub avg_confidence_score: f64,
    pub feedback_count: usize,
    pub positive_ratio: f64,
    pub query_type_counts: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    SlowQueries,
    LowQuality,
    LowConfidence,
    HighErrorRate,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::SlowQueries => "slow_queries",
            AlertType::LowQuality => "low_quality",
            AlertType::LowConfidence => "low_confidence",
            AlertType::HighErrorRate => "high_error_rate",
        }
    }

    fn severity(&self) -> Severity {
        match self {
            AlertType::SlowQueries | AlertType::LowConfidence => Severity::Medium,
            AlertType::LowQuality => Severity::High,
            AlertType::HighErrorRate => Severity::Critical,
        }
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceAlert {
    pub alert_id: String,
    pub alert_type: AlertType,
    pub severity: Severity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub metric_value: f64,
    pub threshold: f64,
    #[serde(default)]
    pub resolved: bool,
}

/// Latest snapshot plus unresolved alerts.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub snapshot: Option<HealthSnapshot>,
    pub alerts: Vec<PerformanceAlert>,
}

#[derive(Default)]
struct MonitorState {
    queries: VecDeque<QueryMetrics>,
    /// `(overall, confidence)` per judged answer.
    quality: VecDeque<(f64, f64)>,
    snapshots: VecDeque<HealthSnapshot>,
    alerts: Vec<PerformanceAlert>,
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

pub struct HealthMonitor {
    config: MonitorConfig,
    data_dir: PathBuf,
    clock: Arc<dyn Clock>,
    state: Mutex<MonitorState>,
}

impl HealthMonitor {
    /// Create a monitor, restoring snapshot history from `health.json`.
    pub fn new(config: MonitorConfig, data_dir: &Path, clock: Arc<dyn Clock>) -> Self {
        let mut snapshots: Vec<HealthSnapshot> = persist::read_array(&data_dir.join(HEALTH_FILE));
        let skip = snapshots.len().saturating_sub(config.history);
        snapshots.drain(..skip);

        Self {
            config,
            data_dir: data_dir.to_path_buf(),
            clock,
            state: Mutex::new(MonitorState {
                snapshots: snapshots.into(),
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn raise(
        &self,
        state: &mut MonitorState,
        alert_type: AlertType,
        message: String,
        metric_value: f64,
        threshold: f64,
    ) {
        if state
            .alerts
            .iter()
            .any(|a| a.alert_type == alert_type && !a.resolved)
        {
            return;
        }
        let now = self.clock.now();
        warn!(alert = %alert_type, metric_value, threshold, "Performance alert: {}", message);
        state.alerts.push(PerformanceAlert {
            alert_id: format!(
                "{}_{}_{}",
                alert_type,
                now.timestamp(),
                uuid::Uuid::new_v4().simple()
            ),
            alert_type,
            severity: alert_type.severity(),
            message,
            timestamp: now,
            metric_value,
            threshold,
            resolved: false,
        });
        self.prune_alerts(state);
    }

    /// Drop the oldest resolved alerts beyond `alert_history`. Open alerts
    /// are never dropped.
    fn prune_alerts(&self, state: &mut MonitorState) {
        let mut excess = state.alerts.len().saturating_sub(self.config.alert_history);
        if excess == 0 {
            return;
        }
        state.alerts.retain(|a| {
            if excess > 0 && a.resolved {
                excess -= 1;
                false
            } else {
                true
            }
        });
    }

    /// Record a finished request.
    pub fn record_query(&self, metrics: QueryMetrics) {
        debug!(
            query_id = %metrics.query_id,
            processing_ms = metrics.processing_ms,
            final_count = metrics.final_count,
            "Recorded query metrics"
        );
        let mut state = self.lock();
        if metrics.processing_ms > self.config.max_processing_ms {
            let message = format!(
                "Query took {:.0}ms (threshold: {:.0}ms)",
                metrics.processing_ms, self.config.max_processing_ms
            );
            self.raise(
                &mut state,
                AlertType::SlowQueries,
                message,
                metrics.processing_ms,
                self.config.max_processing_ms,
            );
        }
        state.queries.push_back(metrics);
        while state.queries.len() > self.config.metrics_window {
            state.queries.pop_front();
        }
    }

    /// Record the judge's verdict for an answer.
    pub fn record_quality(&self, overall: f64, confidence: f64) {
        let mut state = self.lock();
        if overall < self.config.min_quality_score {
            let message = format!(
                "Answer quality score {:.2} below threshold {}",
                overall, self.config.min_quality_score
            );
            self.raise(
                &mut state,
                AlertType::LowQuality,
                message,
                overall,
                self.config.min_quality_score,
            );
        }
        if confidence < self.config.min_confidence_score {
            let message = format!(
                "Answer confidence {:.2} below threshold {}",
                confidence, self.config.min_confidence_score
            );
            self.raise(
                &mut state,
                AlertType::LowConfidence,
                message,
                confidence,
                self.config.min_confidence_score,
            );
        }
        state.quality.push_back((overall, confidence));
        while state.quality.len() > self.config.metrics_window {
            state.quality.pop_front();
        }
    }

    /// Aggregate the recent window into a new snapshot and store it.
    pub fn take_snapshot(&self, feedback: Option<&FeedbackSummary>) -> HealthSnapshot {
        let mut state = self.lock();

        let failed = state.queries.iter().filter(|q| q.error.is_some()).count();
        let total = state.queries.len();
        let mut query_type_counts = BTreeMap::new();
        for q in &state.queries {
            *query_type_counts.entry(q.query_type.clone()).or_insert(0) += 1;
        }

        let snapshot = HealthSnapshot {
            timestamp: self.clock.now(),
            avg_processing_ms: mean(state.queries.iter().map(|q| q.processing_ms)),
            successful_queries: total - failed,
            failed_queries: failed,
            degraded_queries: state
                .queries
                .iter()
                .filter(|q| !q.degraded.is_empty())
                .count(),
            avg_quality_score: mean(state.quality.iter().map(|(q, _)| *q)),
            avg_confidence_score: mean(state.quality.iter().map(|(_, c)| *c)),
            feedback_count: feedback.map(|f| f.total_feedback).unwrap_or(0),
            positive_ratio: feedback.map(|f| f.positive_ratio).unwrap_or(0.0),
            query_type_counts,
        };

        if total >= MIN_QUERIES_FOR_ERROR_RATE {
            let error_rate = failed as f64 / total as f64;
            if error_rate > self.config.max_error_rate {
                let message = format!(
                    "Error rate {:.1}% exceeds threshold {:.1}%",
                    error_rate * 100.0,
                    self.config.max_error_rate * 100.0
                );
                self.raise(
                    &mut state,
                    AlertType::HighErrorRate,
                    message,
                    error_rate,
                    self.config.max_error_rate,
                );
            }
        }

        state.snapshots.push_back(snapshot.clone());
        while state.snapshots.len() > self.config.history {
            state.snapshots.pop_front();
        }
        snapshot
    }

    pub fn latest(&self) -> Option<HealthSnapshot> {
        self.lock().snapshots.back().cloned()
    }

    pub fn active_alerts(&self) -> Vec<PerformanceAlert> {
        self.lock()
            .alerts
            .iter()
            .filter(|a| !a.resolved)
            .cloned()
            .collect()
    }

    pub fn report(&self) -> HealthReport {
        HealthReport {
            snapshot: self.latest(),
            alerts: self.active_alerts(),
        }
    }

    /// Mark an alert resolved. Returns `false` for unknown ids.
    pub fn resolve_alert(&self, alert_id: &str) -> bool {
        let mut state = self.lock();
        let Some(alert) = state.alerts.iter_mut().find(|a| a.alert_id == alert_id) else {
            return false;
        };
        alert.resolved = true;
        info!(alert_id, "Alert resolved");
        self.prune_alerts(&mut state);
        true
    }

    /// Write the snapshot history to `health.json`.
    pub async fn persist(&self) -> Result<()> {
        let snapshots: Vec<HealthSnapshot> = self.lock().snapshots.iter().cloned().collect();
        let path = self.data_dir.join(HEALTH_FILE);
        tokio::task::spawn_blocking(move || persist::write_array(&path, &snapshots)).await?
    }

    /// Start the periodic snapshot loop.
    pub fn spawn(self: Arc<Self>, tuner: Arc<FeedbackTuner>) -> MonitorHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let interval_secs = self.config.interval_secs.max(1);
        let window_hours = tuner.config().window_hours;

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let feedback = match tuner.summary(window_hours).await {
                            Ok(feedback) => Some(feedback),
                            Err(e) => {
                                warn!(error = %e, "Skipping feedback in health snapshot");
                                None
                            }
                        };
                        let snapshot = self.take_snapshot(feedback.as_ref());
                        debug!(
                            avg_processing_ms = snapshot.avg_processing_ms,
                            failed = snapshot.failed_queries,
                            "Health snapshot taken"
                        );
                        if let Err(e) = self.persist().await {
                            warn!(error = %e, "Failed to write health history");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        info!("Health monitor shutting down");
                        break;
                    }
                }
            }
        });

        MonitorHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// Running monitor loop.
pub struct MonitorHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Health monitor task failed");
        }
    }
}
