//! Relevance refinement applied to fused candidates.
//!
//! # Stages
//!
//! | # | Stage | Runs when | Keeps |
//! |---|-------|-----------|-------|
//! | 1 | Cross-encoder rescoring | scorer configured | best `2k`, threshold-trimmed |
//! | 2 | Keyword overlap | query has keywords | overlap ≥ `min_overlap` |
//! | 3 | Semantic clustering | more than `2k` left | largest DBSCAN cluster, ≤ `2k` |
//! | 4 | Coherence | more than `k` left | `k` most coherent |
//!
//! Without a scorer (or when it fails) stage 1 caps the list at `k`. When
//! stage 1 is switched off in configuration the list passes through
//! untouched, which leaves room for clustering. A failing embedder skips
//! stage 3 and turns stage 4 into a plain truncation. Every stage only
//! reorders or drops, so the output is always a subset of the input of at
//! most `k` candidates.
//!
//! Stages 3 and 4 share one embedding call.

pub mod cluster;
pub mod coherence;
pub mod cross_encoder;
pub mod overlap;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cancel::Cancellable;
use crate::dense::Embedder;
use crate::error::Result;
use crate::models::ScoredCandidate;

pub use cross_encoder::CrossEncoder;
pub use overlap::{AliasTable, BIOGRAPHICAL_KEYWORDS};

use overlap::OverlapOutcome;

#[derive(Debug, Clone, Deserialize)]
pub struct RerankConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub cross_encoder: bool,
    #[serde(default = "default_true")]
    pub keyword_filter: bool,
    #[serde(default = "default_true")]
    pub clustering: bool,
    #[serde(default = "default_true")]
    pub coherence: bool,
    #[serde(default = "default_min_overlap")]
    pub min_overlap: f64,
    /// Minimum overlap for biographical and education queries.
    #[serde(default = "default_relaxed_min_overlap")]
    pub relaxed_min_overlap: f64,
    #[serde(default = "default_cluster_eps")]
    pub cluster_eps: f64,
    #[serde(default = "default_min_cluster_size")]
    pub min_cluster_size: usize,
    /// Alias groups added to the built-in table.
    #[serde(default)]
    pub extra_aliases: Vec<Vec<String>>,
    #[serde(default = "default_biographical_keywords")]
    pub biographical_keywords: Vec<String>,
}

fn default_true() -> bool {
    true
}
fn default_min_overlap() -> f64 {
    0.03
}
fn default_relaxed_min_overlap() -> f64 {
    0.01
}
fn default_cluster_eps() -> f64 {
    0.3
}
fn default_min_cluster_size() -> usize {
    2
}
fn default_biographical_keywords() -> Vec<String> {
    BIOGRAPHICAL_KEYWORDS.iter().map(|s| s.to_string()).collect()
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cross_encoder: true,
            keyword_filter: true,
            clustering: true,
            coherence: true,
            min_overlap: default_min_overlap(),
            relaxed_min_overlap: default_relaxed_min_overlap(),
            cluster_eps: default_cluster_eps(),
            min_cluster_size: default_min_cluster_size(),
            extra_aliases: Vec::new(),
            biographical_keywords: default_biographical_keywords(),
        }
    }
}

/// What happened in one stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum StageOutcome {
    Applied,
    Skipped(String),
    /// A provider failed; the stage fell back.
    Degraded(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageReport {
    pub stage: &'static str,
    pub outcome: StageOutcome,
    pub input: usize,
    pub output: usize,
}

/// Per-request trace of the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RerankReport {
    pub stages: Vec<StageReport>,
}

impl RerankReport {
    fn record(&mut self, stage: &'static str, outcome: StageOutcome, input: usize, output: usize) {
        debug!(stage, ?outcome, input, output, "Rerank stage finished");
        self.stages.push(StageReport {
            stage,
            outcome,
            input,
            output,
        });
    }

    /// Names of stages that fell back because a provider failed.
    pub fn degraded(&self) -> Vec<&'static str> {
        self.stages
            .iter()
            .filter(|s| matches!(s.outcome, StageOutcome::Degraded(_)))
            .map(|s| s.stage)
            .collect()
    }

    pub fn outcome(&self, stage: &str) -> Option<&StageOutcome> {
        self.stages.iter().find(|s| s.stage == stage).map(|s| &s.outcome)
    }
}

pub const STAGE_CROSS_ENCODER: &str = "cross_encoder";
pub const STAGE_KEYWORD_FILTER: &str = "keyword_filter";
pub const STAGE_CLUSTERING: &str = "clustering";
pub const STAGE_COHERENCE: &str = "coherence";

/// The four-stage refinement pipeline.
pub struct RerankStage {
    config: RerankConfig,
    aliases: AliasTable,
    cross_encoder: Option<Arc<dyn CrossEncoder>>,
    embedder: Option<Arc<dyn Embedder>>,
}

impl RerankStage {
    pub fn new(config: RerankConfig) -> Self {
        let aliases = AliasTable::with_extra(&config.extra_aliases);
        Self {
            config,
            aliases,
            cross_encoder: None,
            embedder: None,
        }
    }

    pub fn with_cross_encoder(mut self, encoder: Arc<dyn CrossEncoder>) -> Self {
        self.cross_encoder = Some(encoder);
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn config(&self) -> &RerankConfig {
        &self.config
    }

    pub fn aliases(&self) -> &AliasTable {
        &self.aliases
    }

    /// Narrow `candidates` to at most `k`.
    ///
    /// Fails only with [`RetrievalError::Cancelled`](crate::error::RetrievalError::Cancelled).
    pub async fn run(
        &self,
        query: &str,
        candidates: Vec<ScoredCandidate>,
        k: usize,
        threshold: f64,
        cancel: &dyn Cancellable,
    ) -> Result<(Vec<ScoredCandidate>, RerankReport)> {
        let mut report = RerankReport::default();
        let mut current = candidates;

        if !self.config.enabled {
            let input = current.len();
            current.truncate(k);
            report.record(
                STAGE_CROSS_ENCODER,
                StageOutcome::Skipped("reranking disabled".into()),
                input,
                current.len(),
            );
            return Ok((current, report));
        }

        cancel.checkpoint()?;
        current = self.rescore(query, current, k, threshold, &mut report).await;

        cancel.checkpoint()?;
        current = self.keyword_filter(query, current, &mut report);

        let mut embeddings = None;
        let wants_vectors = (self.config.clustering && current.len() > k.saturating_mul(2))
            || (self.config.coherence && current.len() > k);
        if wants_vectors {
            cancel.checkpoint()?;
            embeddings = self.embed(&current).await;
        }

        cancel.checkpoint()?;
        (current, embeddings) = self.cluster(current, embeddings, k, &mut report);

        cancel.checkpoint()?;
        current = self.coherence(current, embeddings, k, &mut report);

        Ok((current, report))
    }

    async fn rescore(
        &self,
        query: &str,
        candidates: Vec<ScoredCandidate>,
        k: usize,
        threshold: f64,
        report: &mut RerankReport,
    ) -> Vec<ScoredCandidate> {
        let input = candidates.len();
        if !self.config.cross_encoder {
            report.record(
                STAGE_CROSS_ENCODER,
                StageOutcome::Skipped("disabled".into()),
                input,
                input,
            );
            return candidates;
        }
        let encoder = match &self.cross_encoder {
            Some(encoder) => encoder,
            None => {
                let mut capped = candidates;
                capped.truncate(k);
                report.record(
                    STAGE_CROSS_ENCODER,
                    StageOutcome::Skipped("no cross-encoder".into()),
                    input,
                    capped.len(),
                );
                return capped;
            }
        };

        if candidates.is_empty() {
            report.record(
                STAGE_CROSS_ENCODER,
                StageOutcome::Skipped("no candidates".into()),
                0,
                0,
            );
            return candidates;
        }

        let fallback = candidates.iter().take(k).cloned().collect::<Vec<_>>();
        match cross_encoder::rescore(encoder.as_ref(), query, candidates, k, threshold).await {
            Ok(rescored) => {
                report.record(STAGE_CROSS_ENCODER, StageOutcome::Applied, input, rescored.len());
                rescored
            }
            Err(e) => {
                warn!(error = %e, "Cross-encoder unavailable, keeping fusion order");
                report.record(
                    STAGE_CROSS_ENCODER,
                    StageOutcome::Degraded(e.to_string()),
                    input,
                    fallback.len(),
                );
                fallback
            }
        }
    }

    fn keyword_filter(
        &self,
        query: &str,
        candidates: Vec<ScoredCandidate>,
        report: &mut RerankReport,
    ) -> Vec<ScoredCandidate> {
        let input = candidates.len();
        if !self.config.keyword_filter {
            report.record(
                STAGE_KEYWORD_FILTER,
                StageOutcome::Skipped("disabled".into()),
                input,
                input,
            );
            return candidates;
        }

        let min_overlap = if overlap::is_biographical(query, &self.config.biographical_keywords) {
            self.config.relaxed_min_overlap
        } else {
            self.config.min_overlap
        };

        match overlap::filter_by_overlap(query, candidates, min_overlap, &self.aliases) {
            OverlapOutcome::Filtered(kept) => {
                report.record(STAGE_KEYWORD_FILTER, StageOutcome::Applied, input, kept.len());
                kept
            }
            OverlapOutcome::Skipped(all, reason) => {
                report.record(
                    STAGE_KEYWORD_FILTER,
                    StageOutcome::Skipped(reason.into()),
                    input,
                    all.len(),
                );
                all
            }
        }
    }

    async fn embed(&self, candidates: &[ScoredCandidate]) -> Option<Result<Vec<Vec<f32>>>> {
        let embedder = self.embedder.as_ref()?;
        let texts: Vec<String> = candidates.iter().map(|c| c.content.clone()).collect();
        let result = embedder.embed(&texts).await.and_then(|vectors| {
            if vectors.len() == texts.len() {
                Ok(vectors)
            } else {
                Err(crate::error::RetrievalError::provider(
                    embedder.model_name(),
                    format!("expected {} embeddings, got {}", texts.len(), vectors.len()),
                ))
            }
        });
        if let Err(e) = &result {
            warn!(error = %e, "Embedding candidates failed");
        }
        Some(result)
    }

    #[allow(clippy::type_complexity)]
    fn cluster(
        &self,
        candidates: Vec<ScoredCandidate>,
        embeddings: Option<Result<Vec<Vec<f32>>>>,
        k: usize,
        report: &mut RerankReport,
    ) -> (Vec<ScoredCandidate>, Option<Result<Vec<Vec<f32>>>>) {
        let input = candidates.len();
        let skip = |reason: &str, report: &mut RerankReport| {
            report.record(STAGE_CLUSTERING, StageOutcome::Skipped(reason.into()), input, input);
        };

        if !self.config.clustering {
            skip("disabled", report);
            return (candidates, embeddings);
        }
        if input <= k.saturating_mul(2) {
            skip("few candidates", report);
            return (candidates, embeddings);
        }
        let vectors = match embeddings {
            None => {
                skip("no embedder", report);
                return (candidates, None);
            }
            Some(Err(e)) => {
                report.record(STAGE_CLUSTERING, StageOutcome::Degraded(e.to_string()), input, input);
                return (candidates, Some(Err(e)));
            }
            Some(Ok(vectors)) => vectors,
        };

        let distances = cluster::cosine_distance_matrix(&vectors);
        let labels = cluster::dbscan(&distances, self.config.cluster_eps, self.config.min_cluster_size);
        let Some(mut members) = cluster::largest_cluster(&labels) else {
            skip("all noise", report);
            return (candidates, Some(Ok(vectors)));
        };
        members.truncate(k.saturating_mul(2));

        let mut slots: Vec<Option<(ScoredCandidate, Vec<f32>)>> =
            candidates.into_iter().zip(vectors).map(Some).collect();
        let (kept, kept_vectors): (Vec<_>, Vec<_>) =
            members.iter().filter_map(|&i| slots[i].take()).unzip();

        report.record(STAGE_CLUSTERING, StageOutcome::Applied, input, kept.len());
        (kept, Some(Ok(kept_vectors)))
    }

    fn coherence(
        &self,
        candidates: Vec<ScoredCandidate>,
        embeddings: Option<Result<Vec<Vec<f32>>>>,
        k: usize,
        report: &mut RerankReport,
    ) -> Vec<ScoredCandidate> {
        let input = candidates.len();
        if input <= k {
            report.record(
                STAGE_COHERENCE,
                StageOutcome::Skipped("few candidates".into()),
                input,
                input,
            );
            return candidates;
        }

        let mut truncated = candidates;
        let (outcome, vectors) = match embeddings {
            _ if !self.config.coherence => (StageOutcome::Skipped("disabled".into()), None),
            None => (StageOutcome::Skipped("no embedder".into()), None),
            Some(Err(e)) => (StageOutcome::Degraded(e.to_string()), None),
            Some(Ok(vectors)) => (StageOutcome::Applied, Some(vectors)),
        };

        if let Some(vectors) = vectors {
            let order = coherence::rank_by_coherence(&vectors);
            let mut slots: Vec<Option<ScoredCandidate>> = truncated.into_iter().map(Some).collect();
            truncated = order.into_iter().filter_map(|i| slots[i].take()).collect();
        }
        truncated.truncate(k);
        report.record(STAGE_COHERENCE, outcome, input, truncated.len());
        truncated
    }
}
