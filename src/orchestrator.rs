//! Request path: parameters → analysis → fusion → filter → rerank.
//!
//! ```text
//! snapshot TuningParameters
//!   └─ QueryAnalyzer            k = override | optimal_k | retrieval_k
//!        └─ fusion search       candidates_k = max(k × multiplier, retrieval_k)
//!             └─ metadata filter (re-query at 3 × candidates_k when short)
//!                  └─ RerankStage   ≤ k results
//! ```
//!
//! The parameter snapshot is taken once per request, so a concurrent tuner
//! update never mixes two parameter sets within one response. Provider
//! failures only degrade stages; the only error a caller sees is
//! `Cancelled`.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};

use adaptive_rag_core::analyzer::{QueryAnalysis, QueryAnalyzer};
use adaptive_rag_core::cancel::Cancellable;
use adaptive_rag_core::filter::{derive_filter, MetadataFilter};
use adaptive_rag_core::fusion::HybridFusionEngine;
use adaptive_rag_core::models::ScoredCandidate;
use adaptive_rag_core::rerank::{RerankReport, RerankStage};
use adaptive_rag_core::{Result, RetrievalError};

use crate::config::RetrievalConfig;
use crate::monitor::{HealthMonitor, QueryMetrics};
use crate::tuning::{TuningParameters, TuningStore};

/// Re-query breadth multiplier when a filter leaves too few candidates.
const REQUERY_FACTOR: usize = 3;

#[derive(Debug, Clone, Default)]
pub struct RetrieveRequest {
    pub query: String,
    /// Overrides both the analyzer's and the tuned `k`.
    pub k: Option<usize>,
    pub filter: Option<MetadataFilter>,
}

impl RetrieveRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn with_k(mut self, k: usize) -> Self {
        self.k = Some(k);
        self
    }

    pub fn with_filter(mut self, filter: MetadataFilter) -> Self {
        self.filter = Some(filter);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterSource {
    Explicit,
    /// Derived from intent rules.
    Intent,
}

/// The metadata filter a request ran with.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppliedFilter {
    pub filter: MetadataFilter,
    pub source: FilterSource,
    /// Fewer than `k` matched the first fetch and a wider one was made.
    pub requeried: bool,
    /// Nothing matched an intent filter, so it was ignored.
    pub dropped: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrievalResponse {
    pub candidates: Vec<ScoredCandidate>,
    pub parameters: TuningParameters,
    pub analysis: QueryAnalysis,
    pub k: usize,
    pub candidates_retrieved: usize,
    pub filter_applied: Option<AppliedFilter>,
    pub report: RerankReport,
}

pub struct RetrievalOrchestrator {
    engine: Arc<HybridFusionEngine>,
    analyzer: QueryAnalyzer,
    rerank: RerankStage,
    store: Arc<TuningStore>,
    config: RetrievalConfig,
    monitor: Option<Arc<HealthMonitor>>,
}

impl RetrievalOrchestrator {
    pub fn new(
        engine: Arc<HybridFusionEngine>,
        analyzer: QueryAnalyzer,
        rerank: RerankStage,
        store: Arc<TuningStore>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            engine,
            analyzer,
            rerank,
            store,
            config,
            monitor: None,
        }
    }

    pub fn with_monitor(mut self, monitor: Arc<HealthMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn engine(&self) -> &Arc<HybridFusionEngine> {
        &self.engine
    }

    pub fn analyzer(&self) -> &QueryAnalyzer {
        &self.analyzer
    }

    pub async fn retrieve(
        &self,
        request: RetrieveRequest,
        cancel: &dyn Cancellable,
    ) -> Result<RetrievalResponse> {
        let started = Instant::now();
        let params = self.store.snapshot();
        let analysis = self.analyzer.analyze(&request.query);

        let result = self.run(&request, params, analysis.clone(), cancel).await;

        if matches!(result, Err(RetrievalError::Cancelled)) {
            return result;
        }
        if let Some(monitor) = &self.monitor {
            let (candidates_retrieved, final_count, method, degraded, error) = match &result {
                Ok(response) => (
                    response.candidates_retrieved,
                    response.candidates.len(),
                    response
                        .candidates
                        .first()
                        .map(|c| c.method.as_str().to_string())
                        .unwrap_or_else(|| "none".to_string()),
                    response.report.degraded().iter().map(|s| s.to_string()).collect(),
                    None,
                ),
                Err(e) => (0, 0, "none".to_string(), Vec::new(), Some(e.to_string())),
            };
            monitor.record_query(QueryMetrics {
                query_id: uuid::Uuid::new_v4().to_string(),
                query_type: analysis.query_type.as_str().to_string(),
                timestamp: Utc::now(),
                processing_ms: started.elapsed().as_secs_f64() * 1000.0,
                candidates_retrieved,
                final_count,
                retrieval_method: method,
                degraded,
                error,
            });
        }
        result
    }

    async fn search(&self, query: &str, top_k: usize, weight: f64) -> Result<Vec<ScoredCandidate>> {
        if self.config.adaptive_strategy {
            self.engine.search_adaptive(query, top_k, weight).await
        } else {
            self.engine.search_with_fallback(query, top_k, weight).await
        }
    }

    async fn run(
        &self,
        request: &RetrieveRequest,
        params: TuningParameters,
        analysis: QueryAnalysis,
        cancel: &dyn Cancellable,
    ) -> Result<RetrievalResponse> {
        let query = request.query.as_str();
        let k = match request.k {
            // An override can never usefully exceed the corpus.
            Some(k) => match self.engine.snapshot() {
                Ok(corpus) => k.min(corpus.len()),
                Err(_) => k,
            },
            None if self.config.use_query_analysis => analysis.optimal_k,
            None => params.retrieval_k,
        };

        let (filter, source) = match &request.filter {
            Some(filter) if !filter.is_empty() => (Some(filter.clone()), FilterSource::Explicit),
            _ if self.config.auto_filter => (
                derive_filter(query, &self.config.intent_rules),
                FilterSource::Intent,
            ),
            _ => (None, FilterSource::Intent),
        };

        let mut response = RetrievalResponse {
            candidates: Vec::new(),
            parameters: params,
            analysis,
            k,
            candidates_retrieved: 0,
            filter_applied: None,
            report: RerankReport::default(),
        };
        if query.trim().is_empty() || k == 0 {
            return Ok(response);
        }

        cancel.checkpoint()?;
        let candidates_k = k
            .saturating_mul(self.config.candidate_multiplier.max(1))
            .max(params.retrieval_k);
        let mut candidates = match self.search(query, candidates_k, params.hybrid_weight).await {
            Ok(candidates) => candidates,
            Err(RetrievalError::NotFitted) => {
                warn!("Retrieval requested before a corpus was indexed");
                return Ok(response);
            }
            Err(e) => return Err(e),
        };
        debug!(k, candidates_k, fetched = candidates.len(), "Fusion search complete");

        if let Some(filter) = filter {
            cancel.checkpoint()?;
            let mut applied = AppliedFilter {
                filter,
                source,
                requeried: false,
                dropped: false,
            };
            let mut kept = applied.filter.apply(candidates.clone());

            if kept.len() < k && candidates.len() >= candidates_k {
                let wider = candidates_k.saturating_mul(REQUERY_FACTOR);
                debug!(matched = kept.len(), wider, "Filter left too few candidates, re-querying");
                candidates = self.search(query, wider, params.hybrid_weight).await?;
                kept = applied.filter.apply(candidates.clone());
                applied.requeried = true;
            }

            if kept.is_empty() && source == FilterSource::Intent {
                debug!("Intent filter matched nothing, ignoring it");
                applied.dropped = true;
            } else {
                candidates = kept;
            }
            response.filter_applied = Some(applied);
        }
        response.candidates_retrieved = candidates.len();

        cancel.checkpoint()?;
        let (final_set, report) = self
            .rerank
            .run(query, candidates, k, params.rerank_threshold, cancel)
            .await?;
        debug!(returned = final_set.len(), degraded = ?report.degraded(), "Retrieval complete");

        response.candidates = final_set;
        response.report = report;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adaptive_rag_core::cancel::CancellationToken;
    use adaptive_rag_core::fusion::FusionConfig;
    use adaptive_rag_core::models::Chunk;
    use adaptive_rag_core::rerank::RerankConfig;
    use adaptive_rag_core::sparse::Bm25Params;

    use crate::config::{MonitorConfig, TunerConfig};
    use crate::tuner::SystemClock;
    use crate::tuning::ParameterBounds;

    fn chunks() -> Vec<Chunk> {
        vec![
            Chunk::new("bio", "Maria Lopez worked at PwC as a senior tax consultant.")
                .with_meta("doc_type", "person"),
            Chunk::new("report", "The annual report covers solar energy investments.")
                .with_meta("doc_type", "report"),
            Chunk::new("memo", "A memo about solar panel maintenance schedules.")
                .with_meta("doc_type", "memo"),
            Chunk::new("guide", "Guide to wind turbine installation.")
                .with_meta("doc_type", "guide"),
        ]
    }

    /// Ten strong solar reports ahead of two weaker memos, padded with
    /// unrelated guides so the query terms keep a positive IDF.
    fn crowded_chunks() -> Vec<Chunk> {
        let mut chunks: Vec<Chunk> = (0..10)
            .map(|i| {
                Chunk::new(format!("report-{i}"), "Solar energy output. Solar energy forecast.")
                    .with_meta("doc_type", "report")
            })
            .collect();
        for i in 0..2 {
            chunks.push(
                Chunk::new(
                    format!("memo-{i}"),
                    "Memo on solar energy budgets for the maintenance crew and the finance office.",
                )
                .with_meta("doc_type", "memo"),
            );
        }
        for i in 0..14 {
            chunks.push(
                Chunk::new(format!("guide-{i}"), "Wind turbine blade inspection checklist.")
                    .with_meta("doc_type", "guide"),
            );
        }
        chunks
    }

    fn orchestrator(config: RetrievalConfig) -> RetrievalOrchestrator {
        orchestrator_over(chunks(), config)
    }

    fn orchestrator_over(corpus: Vec<Chunk>, config: RetrievalConfig) -> RetrievalOrchestrator {
        let engine = Arc::new(HybridFusionEngine::new(FusionConfig::default(), Bm25Params::default()));
        engine.fit(corpus, None);
        let store = Arc::new(TuningStore::new(
            TuningParameters::default(),
            ParameterBounds::from(&TunerConfig::default()),
        ));
        RetrievalOrchestrator::new(
            engine,
            QueryAnalyzer::new(),
            RerankStage::new(RerankConfig::default()),
            store,
            config,
        )
    }

    #[tokio::test]
    async fn test_empty_query_returns_nothing() {
        let orch = orchestrator(RetrievalConfig::default());
        let response = orch
            .retrieve(RetrieveRequest::new("   "), &CancellationToken::new())
            .await
            .unwrap();
        assert!(response.candidates.is_empty());
    }

    #[tokio::test]
    async fn test_unfitted_engine_returns_nothing() {
        let engine = Arc::new(HybridFusionEngine::new(FusionConfig::default(), Bm25Params::default()));
        let store = Arc::new(TuningStore::new(TuningParameters::default(), ParameterBounds::default()));
        let orch = RetrievalOrchestrator::new(
            engine,
            QueryAnalyzer::new(),
            RerankStage::new(RerankConfig::default()),
            store,
            RetrievalConfig::default(),
        );
        let response = orch
            .retrieve(RetrieveRequest::new("solar"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(response.candidates.is_empty());
    }

    #[tokio::test]
    async fn test_override_k_bounds_results() {
        let orch = orchestrator(RetrievalConfig::default());
        let response = orch
            .retrieve(RetrieveRequest::new("solar energy").with_k(1), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.k, 1);
        assert_eq!(response.candidates.len(), 1);
        assert_eq!(response.candidates[0].chunk_id, "report");
    }

    #[tokio::test]
    async fn test_huge_k_override_is_clamped_to_corpus() {
        let orch = orchestrator(RetrievalConfig::default());
        let response = orch
            .retrieve(
                RetrieveRequest::new("solar panels").with_k(usize::MAX / 2),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(response.k, chunks().len());
        assert!(!response.candidates.is_empty());
        assert!(response.candidates.len() <= chunks().len());

        let response = orch
            .retrieve(RetrieveRequest::new("solar panels").with_k(usize::MAX), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.k, chunks().len());
    }

    #[tokio::test]
    async fn test_short_filter_match_triggers_wider_fetch() {
        let orch = orchestrator_over(crowded_chunks(), RetrievalConfig::default());
        // k = 2, so the first fetch is 6 reports and no memo.
        let request = RetrieveRequest::new("solar energy")
            .with_k(2)
            .with_filter(MetadataFilter::new().with("doc_type", "memo"));
        let response = orch.retrieve(request, &CancellationToken::new()).await.unwrap();

        let applied = response.filter_applied.clone().unwrap();
        assert!(applied.requeried);
        assert!(!applied.dropped);
        assert_eq!(response.candidates_retrieved, 2);
        let mut ids: Vec<_> = response.candidates.iter().map(|c| c.chunk_id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["memo-0", "memo-1"]);
    }

    #[tokio::test]
    async fn test_full_first_fetch_satisfying_filter_is_not_requeried() {
        let orch = orchestrator_over(crowded_chunks(), RetrievalConfig::default());
        let request = RetrieveRequest::new("solar energy")
            .with_k(2)
            .with_filter(MetadataFilter::new().with("doc_type", "report"));
        let response = orch.retrieve(request, &CancellationToken::new()).await.unwrap();

        let applied = response.filter_applied.unwrap();
        assert!(!applied.requeried);
        assert_eq!(response.candidates_retrieved, 6);
        assert_eq!(response.candidates.len(), 2);
        assert!(response.candidates.iter().all(|c| c.chunk_id.starts_with("report-")));
    }

    #[tokio::test]
    async fn test_intent_filter_matching_nothing_is_dropped() {
        // No person documents, so the biographical rule matches nothing.
        let orch = orchestrator_over(crowded_chunks(), RetrievalConfig::default());
        let request = RetrieveRequest::new("Where did the crew work on solar energy?").with_k(2);
        let response = orch.retrieve(request, &CancellationToken::new()).await.unwrap();

        let applied = response.filter_applied.clone().unwrap();
        assert_eq!(applied.source, FilterSource::Intent);
        assert!(applied.requeried);
        assert!(applied.dropped);
        // Unfiltered candidates from the 3x wider fetch come back.
        assert_eq!(response.candidates_retrieved, 18);
        assert!(!response.candidates.is_empty());
        assert!(response.candidates.len() <= 2);
    }

    #[tokio::test]
    async fn test_explicit_filter_is_honoured_even_when_empty() {
        let orch = orchestrator(RetrievalConfig::default());
        let request = RetrieveRequest::new("solar energy")
            .with_filter(MetadataFilter::new().with("doc_type", "invoice"));
        let response = orch.retrieve(request, &CancellationToken::new()).await.unwrap();
        assert!(response.candidates.is_empty());
        let applied = response.filter_applied.unwrap();
        assert_eq!(applied.source, FilterSource::Explicit);
        assert!(!applied.dropped);
    }

    #[tokio::test]
    async fn test_intent_filter_scopes_biographical_query() {
        let orch = orchestrator(RetrievalConfig::default());
        let response = orch
            .retrieve(
                RetrieveRequest::new("Where did Maria work?"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let applied = response.filter_applied.clone().unwrap();
        assert_eq!(applied.source, FilterSource::Intent);
        assert!(!applied.dropped);
        assert!(!response.candidates.is_empty());
        assert!(response.candidates.iter().all(|c| c.chunk_id == "bio"));
    }

    #[tokio::test]
    async fn test_cancelled_request_records_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = Arc::new(HealthMonitor::new(
            MonitorConfig::default(),
            dir.path(),
            Arc::new(SystemClock),
        ));
        let orch = orchestrator(RetrievalConfig::default()).with_monitor(monitor.clone());
        let token = CancellationToken::new();
        token.cancel();
        let err = orch
            .retrieve(RetrieveRequest::new("solar energy"), &token)
            .await
            .unwrap_err();
        assert_eq!(err, RetrievalError::Cancelled);
        assert_eq!(monitor.take_snapshot(None).successful_queries, 0);

        orch.retrieve(RetrieveRequest::new("solar energy"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(monitor.take_snapshot(None).successful_queries, 1);
    }
}
