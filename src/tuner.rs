//! Feedback-driven parameter tuning.
//!
//! Every [`FeedbackTuner::submit`] appends a [`FeedbackEntry`] and then
//! decides whether the live [`TuningParameters`] should move:
//!
//! | Check | Outcome |
//! |-------|---------|
//! | fewer than `min_feedback_for_adjustment` entries in the window | [`TuningDecision::InsufficientData`] |
//! | last adjustment younger than `adjustment_cooldown_hours` | [`TuningDecision::Cooldown`] |
//! | no group scores outside the thresholds | [`TuningDecision::NoChange`] |
//! | otherwise | [`TuningDecision::Adjusted`] |
//!
//! Entries in the window are grouped by the parameters they were served
//! with (`k`, threshold to two decimals, method). For each group of at least
//! `min_group_size`:
//!
//! ```text
//! combined = positive_ratio × user_rating_weight + (avg_quality / 5) × quality_weight
//! ```
//!
//! - `combined < negative_feedback_threshold`: relax. `k < 8` grows by 2,
//!   otherwise shrinks by 1; a threshold above 0.5 drops by 0.1.
//! - `combined > positive_feedback_boost`: reinforce. The group's `k` and
//!   threshold become the live values.
//!
//! The cooldown is global: one adjustment blocks every group. State is
//! mirrored to `feedback.json`, `adjustments.json` and `tuning.json` after
//! each submission; write failures are logged and the in-memory state stays
//! authoritative.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{bail, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::TunerConfig;
use crate::persist::{self, ADJUSTMENTS_FILE, FEEDBACK_FILE, TUNING_FILE};
use crate::tuning::{ParameterBounds, TuningParameters, TuningStore};

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: StdMutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: StdMutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rating {
    Positive,
    Negative,
}

impl FromStr for Rating {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "positive" | "up" | "+" => Ok(Rating::Positive),
            "negative" | "down" | "-" => Ok(Rating::Negative),
            other => bail!("Unknown rating '{}'. Must be positive or negative.", other),
        }
    }
}

/// One rated answer, with the parameters it was produced under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackEntry {
    pub feedback_id: String,
    pub session_id: String,
    pub query: String,
    pub answer: String,
    pub rating: Rating,
    pub timestamp: DateTime<Utc>,
    pub retrieval_method: String,
    pub retrieval_k: usize,
    pub rerank_threshold: f64,
    #[serde(default)]
    pub quality_score: Option<f64>,
    #[serde(default)]
    pub confidence_score: Option<f64>,
    /// Seconds.
    #[serde(default)]
    pub response_time: Option<f64>,
    #[serde(default)]
    pub context_chunks: Option<Vec<String>>,
    #[serde(default)]
    pub user_comment: Option<String>,
}

/// Caller-supplied part of a [`FeedbackEntry`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewFeedback {
    pub session_id: String,
    pub query: String,
    pub answer: String,
    pub rating: Rating,
    pub retrieval_method: String,
    pub retrieval_k: usize,
    pub rerank_threshold: f64,
    pub quality_score: Option<f64>,
    pub confidence_score: Option<f64>,
    pub response_time: Option<f64>,
    pub context_chunks: Option<Vec<String>>,
    pub user_comment: Option<String>,
}

impl NewFeedback {
    pub fn new(
        session_id: impl Into<String>,
        query: impl Into<String>,
        answer: impl Into<String>,
        rating: Rating,
        retrieval_method: impl Into<String>,
        retrieval_k: usize,
        rerank_threshold: f64,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            query: query.into(),
            answer: answer.into(),
            rating,
            retrieval_method: retrieval_method.into(),
            retrieval_k,
            rerank_threshold,
            quality_score: None,
            confidence_score: None,
            response_time: None,
            context_chunks: None,
            user_comment: None,
        }
    }

    pub fn with_quality(mut self, quality: f64) -> Self {
        self.quality_score = Some(quality);
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence_score = Some(confidence);
        self
    }

    fn into_entry(self, feedback_id: String, timestamp: DateTime<Utc>) -> FeedbackEntry {
        FeedbackEntry {
            feedback_id,
            session_id: self.session_id,
            query: self.query,
            answer: self.answer,
            rating: self.rating,
            timestamp,
            retrieval_method: self.retrieval_method,
            retrieval_k: self.retrieval_k,
            rerank_threshold: self.rerank_threshold,
            quality_score: self.quality_score.map(|q| q.clamp(0.0, 5.0)),
            confidence_score: self.confidence_score.map(|c| c.clamp(0.0, 1.0)),
            response_time: self.response_time,
            context_chunks: self.context_chunks,
            user_comment: self.user_comment,
        }
    }
}

/// Audit record of one parameter change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterAdjustment {
    pub parameter_name: String,
    pub old_value: f64,
    pub new_value: f64,
    pub reason: String,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

pub const PARAM_RETRIEVAL_K: &str = "retrieval_k";
pub const PARAM_RERANK_THRESHOLD: &str = "rerank_threshold";
pub const PARAM_OPTIMAL_UPDATE: &str = "optimal_params_update";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum TuningDecision {
    InsufficientData { recent: usize, required: usize },
    Cooldown { remaining_secs: i64 },
    NoChange,
    Adjusted { adjustments: Vec<ParameterAdjustment> },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmitOutcome {
    pub feedback_id: String,
    pub decision: TuningDecision,
}

/// Aggregate view of recent feedback.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedbackSummary {
    pub window_hours: f64,
    pub total_feedback: usize,
    pub positive_count: usize,
    pub negative_count: usize,
    pub positive_ratio: f64,
    pub negative_ratio: f64,
    pub avg_quality_score: f64,
    pub avg_confidence_score: f64,
    pub recent_adjustments: Vec<ParameterAdjustment>,
    pub parameters: TuningParameters,
}

struct TunerState {
    entries: VecDeque<FeedbackEntry>,
    adjustments: VecDeque<ParameterAdjustment>,
}

/// `None` when `h` is not finite or too large for a [`Duration`].
fn hours(h: f64) -> Option<Duration> {
    if !h.is_finite() {
        return None;
    }
    Duration::try_milliseconds((h * 3_600_000.0) as i64)
}

/// Start of a window of `h` hours ending at `now`. A window reaching past
/// the representable range covers everything.
fn window_start(now: DateTime<Utc>, h: f64) -> DateTime<Utc> {
    hours(h)
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn push_capped<T>(queue: &mut VecDeque<T>, item: T, cap: usize) {
    queue.push_back(item);
    while queue.len() > cap {
        queue.pop_front();
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

/// Parameters a group of feedback entries was served with.
#[derive(Debug, Clone, PartialEq)]
struct GroupKey {
    retrieval_k: usize,
    rerank_threshold: f64,
    retrieval_method: String,
}

impl GroupKey {
    fn of(entry: &FeedbackEntry) -> Self {
        Self {
            retrieval_k: entry.retrieval_k,
            rerank_threshold: (entry.rerank_threshold * 100.0).round() / 100.0,
            retrieval_method: entry.retrieval_method.clone(),
        }
    }

    fn label(&self) -> String {
        format!(
            "k{}_thresh{:.2}_method{}",
            self.retrieval_k, self.rerank_threshold, self.retrieval_method
        )
    }
}

/// Feedback log plus the controller that moves [`TuningParameters`].
pub struct FeedbackTuner {
    config: TunerConfig,
    data_dir: PathBuf,
    store: Arc<TuningStore>,
    clock: Arc<dyn Clock>,
    state: Mutex<TunerState>,
}

impl FeedbackTuner {
    /// Load persisted state from `data_dir`; missing or corrupt files fall
    /// back to `defaults` and empty logs.
    pub fn open(
        config: TunerConfig,
        data_dir: &Path,
        defaults: TuningParameters,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut entries: Vec<FeedbackEntry> = persist::read_array(&data_dir.join(FEEDBACK_FILE));
        let mut adjustments: Vec<ParameterAdjustment> =
            persist::read_array(&data_dir.join(ADJUSTMENTS_FILE));
        let saved: Vec<TuningParameters> = persist::read_array(&data_dir.join(TUNING_FILE));

        let skip = entries.len().saturating_sub(config.max_entries);
        entries.drain(..skip);
        let skip = adjustments.len().saturating_sub(config.max_adjustments);
        adjustments.drain(..skip);

        let params = saved.into_iter().next().unwrap_or(defaults);
        let store = Arc::new(TuningStore::new(params, ParameterBounds::from(&config)));
        info!(
            entries = entries.len(),
            adjustments = adjustments.len(),
            retrieval_k = store.snapshot().retrieval_k,
            "Feedback state loaded"
        );

        Self {
            config,
            data_dir: data_dir.to_path_buf(),
            store,
            clock,
            state: Mutex::new(TunerState {
                entries: entries.into(),
                adjustments: adjustments.into(),
            }),
        }
    }

    pub fn store(&self) -> &Arc<TuningStore> {
        &self.store
    }

    pub fn config(&self) -> &TunerConfig {
        &self.config
    }

    /// Record feedback and adjust parameters if the evidence warrants it.
    pub async fn submit(&self, feedback: NewFeedback) -> SubmitOutcome {
        let now = self.clock.now();
        let feedback_id = uuid::Uuid::new_v4().to_string();
        let entry = feedback.into_entry(feedback_id.clone(), now);
        debug!(feedback_id = %feedback_id, rating = ?entry.rating, "Feedback received");

        let mut state = self.state.lock().await;
        push_capped(&mut state.entries, entry, self.config.max_entries);

        let decision = self.evaluate(&state, now);
        if let TuningDecision::Adjusted { adjustments } = &decision {
            for adjustment in adjustments {
                push_capped(
                    &mut state.adjustments,
                    adjustment.clone(),
                    self.config.max_adjustments,
                );
            }
        }

        self.persist(&state).await;
        SubmitOutcome {
            feedback_id,
            decision,
        }
    }

    fn evaluate(&self, state: &TunerState, now: DateTime<Utc>) -> TuningDecision {
        let cutoff = window_start(now, self.config.window_hours);
        let recent: Vec<&FeedbackEntry> = state
            .entries
            .iter()
            .filter(|e| e.timestamp > cutoff)
            .collect();

        if recent.len() < self.config.min_feedback_for_adjustment {
            debug!(
                recent = recent.len(),
                required = self.config.min_feedback_for_adjustment,
                "Not enough recent feedback for adjustment"
            );
            return TuningDecision::InsufficientData {
                recent: recent.len(),
                required: self.config.min_feedback_for_adjustment,
            };
        }

        if let Some(remaining) = self.cooldown_left(state, now) {
            debug!(remaining_secs = remaining.num_seconds(), "In cooldown, skipping adjustment");
            return TuningDecision::Cooldown {
                remaining_secs: remaining.num_seconds(),
            };
        }

        let mut groups: Vec<(GroupKey, Vec<&FeedbackEntry>)> = Vec::new();
        for entry in recent {
            let key = GroupKey::of(entry);
            match groups.iter_mut().find(|(k, _)| *k == key) {
                Some((_, members)) => members.push(entry),
                None => groups.push((key, vec![entry])),
            }
        }

        let mut adjustments = Vec::new();
        for (key, members) in &groups {
            if members.len() < self.config.min_group_size {
                continue;
            }
            let combined = self.combined_score(members);
            debug!(group = %key.label(), size = members.len(), combined, "Evaluated feedback group");

            if combined < self.config.negative_feedback_threshold {
                adjustments.extend(self.relax(key, combined, now));
            } else if combined > self.config.positive_feedback_boost {
                adjustments.push(self.reinforce(key, combined, now));
            }
        }

        if adjustments.is_empty() {
            TuningDecision::NoChange
        } else {
            TuningDecision::Adjusted { adjustments }
        }
    }

    fn combined_score(&self, members: &[&FeedbackEntry]) -> f64 {
        let positive = members.iter().filter(|e| e.rating == Rating::Positive).count();
        let positive_ratio = positive as f64 / members.len() as f64;
        let avg_quality = mean(members.iter().filter_map(|e| e.quality_score)).unwrap_or(0.0);
        positive_ratio * self.config.user_rating_weight
            + (avg_quality / 5.0) * self.config.quality_weight
    }

    /// Relax retrieval for a poorly rated group.
    ///
    /// Proposals are written through the store, so the recorded values are
    /// the clamped ones actually applied. A proposal the bounds cancel out
    /// is not recorded.
    fn relax(&self, key: &GroupKey, combined: f64, now: DateTime<Utc>) -> Vec<ParameterAdjustment> {
        let [k_min, k_max] = self.config.k_range;
        let [t_min, _] = self.config.threshold_range;
        let mut adjustments = Vec::new();

        let k = key.retrieval_k;
        let (proposed_k, confidence) = if k < 8 {
            (k.saturating_add(2).min(k_max), 0.8)
        } else {
            (k.saturating_sub(1).max(k_min), 0.7)
        };
        if proposed_k != k {
            let mut before = 0;
            let applied = self.store.update(|p| {
                before = p.retrieval_k;
                p.retrieval_k = proposed_k;
            });
            let after = applied.retrieval_k;
            if after != before {
                let verb = if after > before { "Increasing" } else { "Decreasing" };
                adjustments.push(ParameterAdjustment {
                    parameter_name: PARAM_RETRIEVAL_K.to_string(),
                    old_value: before as f64,
                    new_value: after as f64,
                    reason: format!(
                        "{} K from {} to {} due to poor performance (score: {:.3})",
                        verb, before, after, combined
                    ),
                    confidence,
                    timestamp: now,
                });
            }
        }

        let threshold = key.rerank_threshold;
        if threshold > 0.5 {
            let proposed = (((threshold - 0.1) * 100.0).round() / 100.0).max(t_min);
            let mut before = 0.0;
            let applied = self.store.update(|p| {
                before = p.rerank_threshold;
                p.rerank_threshold = proposed;
            });
            let after = applied.rerank_threshold;
            if (after - before).abs() > f64::EPSILON {
                adjustments.push(ParameterAdjustment {
                    parameter_name: PARAM_RERANK_THRESHOLD.to_string(),
                    old_value: before,
                    new_value: after,
                    reason: format!(
                        "Lowering rerank threshold from {:.2} to {:.2} due to poor performance",
                        before, after
                    ),
                    confidence: 0.7,
                    timestamp: now,
                });
            }
        }

        for adjustment in &adjustments {
            info!(
                group = %key.label(),
                parameter = %adjustment.parameter_name,
                old = adjustment.old_value,
                new = adjustment.new_value,
                "Applied adjustment: {}",
                adjustment.reason
            );
        }
        adjustments
    }

    fn reinforce(&self, key: &GroupKey, combined: f64, now: DateTime<Utc>) -> ParameterAdjustment {
        let applied = self.store.update(|p| {
            p.retrieval_k = key.retrieval_k;
            p.rerank_threshold = key.rerank_threshold;
        });
        let adjustment = ParameterAdjustment {
            parameter_name: PARAM_OPTIMAL_UPDATE.to_string(),
            old_value: 0.0,
            new_value: 1.0,
            reason: format!(
                "Updating optimal parameters to k={} threshold={:.2} based on excellent performance (score: {:.3})",
                applied.retrieval_k, applied.rerank_threshold, combined
            ),
            confidence: 0.9,
            timestamp: now,
        };
        info!(group = %key.label(), "Applied adjustment: {}", adjustment.reason);
        adjustment
    }

    fn cooldown_left(&self, state: &TunerState, now: DateTime<Utc>) -> Option<Duration> {
        let last = state.adjustments.back()?;
        let end = hours(self.config.adjustment_cooldown_hours)
            .and_then(|d| last.timestamp.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        (now < end).then(|| end - now)
    }

    /// Time until adjustments are allowed again, if a cooldown is running.
    pub async fn cooldown_remaining(&self) -> Option<Duration> {
        let state = self.state.lock().await;
        self.cooldown_left(&state, self.clock.now())
    }

    async fn persist(&self, state: &TunerState) {
        let entries: Vec<FeedbackEntry> = state.entries.iter().cloned().collect();
        let adjustments: Vec<ParameterAdjustment> = state.adjustments.iter().cloned().collect();
        let params = [self.store.snapshot()];
        let dir = self.data_dir.clone();

        let result = tokio::task::spawn_blocking(move || -> Result<()> {
            persist::write_array(&dir.join(FEEDBACK_FILE), &entries)?;
            persist::write_array(&dir.join(ADJUSTMENTS_FILE), &adjustments)?;
            persist::write_array(&dir.join(TUNING_FILE), &params)?;
            Ok(())
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Failed to persist feedback state, will retry on next submission"),
            Err(e) => warn!(error = %e, "Persistence task failed"),
        }
    }

    /// Flush the current state to disk.
    pub async fn flush(&self) {
        let state = self.state.lock().await;
        self.persist(&state).await;
    }

    /// Statistics over the last `window_hours`.
    ///
    /// Fails on a negative or NaN window. A window longer than the
    /// representable date range covers all stored feedback.
    pub async fn summary(&self, window_hours: f64) -> Result<FeedbackSummary> {
        if window_hours.is_nan() || window_hours < 0.0 {
            bail!("Invalid summary window: {window_hours} hours");
        }
        let cutoff = window_start(self.clock.now(), window_hours);
        let state = self.state.lock().await;
        let recent: Vec<&FeedbackEntry> = state
            .entries
            .iter()
            .filter(|e| e.timestamp > cutoff)
            .collect();

        let total = recent.len();
        let positive_count = recent.iter().filter(|e| e.rating == Rating::Positive).count();
        let negative_count = total - positive_count;
        let ratio = |count: usize| if total == 0 { 0.0 } else { count as f64 / total as f64 };

        Ok(FeedbackSummary {
            window_hours,
            total_feedback: total,
            positive_count,
            negative_count,
            positive_ratio: ratio(positive_count),
            negative_ratio: ratio(negative_count),
            avg_quality_score: mean(recent.iter().filter_map(|e| e.quality_score)).unwrap_or(0.0),
            avg_confidence_score: mean(recent.iter().filter_map(|e| e.confidence_score))
                .unwrap_or(0.0),
            recent_adjustments: state
                .adjustments
                .iter()
                .filter(|a| a.timestamp > cutoff)
                .cloned()
                .collect(),
            parameters: self.store.snapshot(),
        })
    }

    /// Newest first.
    pub async fn recent_entries(&self, limit: usize) -> Vec<FeedbackEntry> {
        let state = self.state.lock().await;
        state.entries.iter().rev().take(limit).cloned().collect()
    }

    /// Newest first.
    pub async fn recent_adjustments(&self, limit: usize) -> Vec<ParameterAdjustment> {
        let state = self.state.lock().await;
        state.adjustments.iter().rev().take(limit).cloned().collect()
    }
}
