//! The exposed retrieval service.
//!
//! [`RagService`] owns one of each component and is what the CLI (or any
//! embedding host) talks to:
//!
//! | Operation | Goes through |
//! |-----------|--------------|
//! | [`retrieve`](RagService::retrieve) | [`RetrievalOrchestrator`] |
//! | [`submit_feedback`](RagService::submit_feedback) | [`FeedbackTuner`] |
//! | [`tuning_parameters`](RagService::tuning_parameters) | [`TuningStore`](crate::tuning::TuningStore) snapshot |
//! | [`feedback_summary`](RagService::feedback_summary) | [`FeedbackTuner`] |
//! | [`generate_answer`](RagService::generate_answer) | source-aware prompt, LLM, citation check |
//! | [`judge_answer`](RagService::judge_answer) | LLM judge, then heuristic judge |
//! | [`health`](RagService::health) | [`HealthMonitor`] |
//! | [`shutdown`](RagService::shutdown) | stops the monitor, flushes state |

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tracing::{info, warn};

use adaptive_rag_core::analyzer::{EntityRecognizer, QueryAnalyzer};
use adaptive_rag_core::attribution::{self, CitationReport};
use adaptive_rag_core::cancel::{Cancellable, CancellationToken};
use adaptive_rag_core::dense::Embedder;
use adaptive_rag_core::filter::MetadataFilter;
use adaptive_rag_core::fusion::{HybridFusionEngine, IndexedCorpus};
use adaptive_rag_core::judge::{AnswerJudge, FallbackJudge, LanguageModel, QualityScores};
use adaptive_rag_core::models::{Chunk, ScoredCandidate};
use adaptive_rag_core::rerank::{CrossEncoder, RerankStage};
use adaptive_rag_core::RetrievalError;

use crate::config::Config;
use crate::corpus;
use crate::guard::{TimeoutCrossEncoder, TimeoutEmbedder, TimeoutLanguageModel};
use crate::monitor::{HealthMonitor, HealthReport, MonitorHandle};
use crate::orchestrator::{RetrievalOrchestrator, RetrievalResponse, RetrieveRequest};
use crate::tuner::{Clock, FeedbackSummary, FeedbackTuner, NewFeedback, SubmitOutcome, SystemClock};
use crate::tuning::TuningParameters;

/// External collaborators. Every field is optional; missing ones disable
/// the stage that needs them.
#[derive(Default, Clone)]
pub struct Providers {
    pub embedder: Option<Arc<dyn Embedder>>,
    pub cross_encoder: Option<Arc<dyn CrossEncoder>>,
    pub llm: Option<Arc<dyn LanguageModel>>,
    pub entity_recognizer: Option<Arc<dyn EntityRecognizer>>,
}

impl Providers {
    /// Build the configured providers, each behind its deadline guard.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let embedder = crate::embedding::create_embedder(&config.embedding)
            .await
            .context("Failed to create embedding provider")?
            .map(|inner| {
                // Covers the HTTP retry loop of one call.
                let attempts = u64::from(config.embedding.max_retries) + 1;
                let limit = Duration::from_secs(config.embedding.timeout_secs * attempts);
                Arc::new(TimeoutEmbedder::new(inner, limit)) as Arc<dyn Embedder>
            });
        let cross_encoder = crate::cross_encoder::create_cross_encoder(&config.reranker)
            .await
            .context("Failed to create reranker")?
            .map(|inner| {
                let limit = Duration::from_secs(config.reranker.timeout_secs);
                Arc::new(TimeoutCrossEncoder::new(inner, limit)) as Arc<dyn CrossEncoder>
            });
        let llm = crate::llm::create_language_model(&config.llm)
            .context("Failed to create LLM provider")?
            .map(|inner| {
                let limit = Duration::from_secs(config.llm.timeout_secs);
                Arc::new(TimeoutLanguageModel::new(inner, limit)) as Arc<dyn LanguageModel>
            });

        Ok(Self {
            embedder,
            cross_encoder,
            llm,
            entity_recognizer: None,
        })
    }
}

/// LLM answer plus the check of the sources it cites.
#[derive(Debug, Clone)]
pub struct GeneratedAnswer {
    pub text: String,
    pub citations: CitationReport,
}

pub struct RagService {
    config: Config,
    orchestrator: RetrievalOrchestrator,
    tuner: Arc<FeedbackTuner>,
    monitor: Arc<HealthMonitor>,
    judge: FallbackJudge,
    embedder: Option<Arc<dyn Embedder>>,
    llm: Option<Arc<dyn LanguageModel>>,
    monitor_task: Mutex<Option<MonitorHandle>>,
}

impl RagService {
    /// Assemble the service. Persisted tuner and monitor state is loaded
    /// from `storage.data_dir`; no corpus is indexed yet.
    pub fn new(config: Config, providers: Providers, clock: Arc<dyn Clock>) -> Self {
        let data_dir = config.storage.data_dir.clone();
        let tuner = Arc::new(FeedbackTuner::open(
            config.tuner.clone(),
            &data_dir,
            config.defaults,
            clock.clone(),
        ));
        let monitor = Arc::new(HealthMonitor::new(config.monitor.clone(), &data_dir, clock));

        let engine = Arc::new(HybridFusionEngine::new(config.fusion.clone(), config.sparse));
        let analyzer = match providers.entity_recognizer {
            Some(recognizer) => QueryAnalyzer::with_recognizer(recognizer),
            None => QueryAnalyzer::new(),
        };
        let mut rerank = RerankStage::new(config.rerank.clone());
        if let Some(encoder) = providers.cross_encoder {
            rerank = rerank.with_cross_encoder(encoder);
        }
        if let Some(embedder) = &providers.embedder {
            rerank = rerank.with_embedder(embedder.clone());
        }

        let orchestrator = RetrievalOrchestrator::new(
            engine,
            analyzer,
            rerank,
            tuner.store().clone(),
            config.retrieval.clone(),
        )
        .with_monitor(monitor.clone());

        Self {
            judge: FallbackJudge::with_llm(providers.llm.clone()),
            embedder: providers.embedder,
            llm: providers.llm,
            config,
            orchestrator,
            tuner,
            monitor,
            monitor_task: Mutex::new(None),
        }
    }

    /// Build providers, index the configured corpus, and start the monitor.
    pub async fn from_config(config: Config) -> Result<Self> {
        let providers = Providers::from_config(&config).await?;
        let service = Self::new(config, providers, Arc::new(SystemClock));

        if let Some(path) = service.config.corpus.path.clone() {
            let chunks = corpus::load_chunks(&path)?;
            service.index(chunks).await;
        } else {
            warn!("No corpus.path configured; retrieval will return nothing");
        }

        if service.config.monitor.enabled {
            service.start_monitor().await;
        }
        Ok(service)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn orchestrator(&self) -> &RetrievalOrchestrator {
        &self.orchestrator
    }

    pub fn engine(&self) -> &Arc<HybridFusionEngine> {
        self.orchestrator.engine()
    }

    pub fn tuner(&self) -> &Arc<FeedbackTuner> {
        &self.tuner
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    /// Replace the corpus. Requests in flight finish on the old snapshot.
    pub async fn index(&self, chunks: Vec<Chunk>) -> Arc<IndexedCorpus> {
        corpus::index_corpus(
            self.orchestrator.engine(),
            chunks,
            self.embedder.clone(),
            self.config.embedding.batch_size,
        )
        .await
    }

    pub async fn start_monitor(&self) {
        let mut task = self.monitor_task.lock().await;
        if task.is_none() {
            *task = Some(self.monitor.clone().spawn(self.tuner.clone()));
            info!(interval_secs = self.config.monitor.interval_secs, "Health monitor started");
        }
    }

    pub async fn retrieve(
        &self,
        query: &str,
        k: Option<usize>,
        filter: Option<MetadataFilter>,
    ) -> Result<RetrievalResponse, RetrievalError> {
        let request = RetrieveRequest {
            query: query.to_string(),
            k,
            filter,
        };
        self.orchestrator
            .retrieve(request, &CancellationToken::new())
            .await
    }

    /// [`retrieve`](Self::retrieve) with caller-controlled cancellation.
    pub async fn retrieve_with(
        &self,
        request: RetrieveRequest,
        cancel: &dyn Cancellable,
    ) -> Result<RetrievalResponse, RetrievalError> {
        self.orchestrator.retrieve(request, cancel).await
    }

    pub async fn submit_feedback(&self, feedback: NewFeedback) -> SubmitOutcome {
        self.tuner.submit(feedback).await
    }

    pub fn tuning_parameters(&self) -> TuningParameters {
        self.tuner.store().snapshot()
    }

    pub async fn feedback_summary(&self, window_hours: f64) -> Result<FeedbackSummary> {
        self.tuner.summary(window_hours).await
    }

    /// Grade an answer; the verdict is also fed to the health monitor.
    pub async fn judge_answer(
        &self,
        query: &str,
        answer: &str,
        context: &[String],
    ) -> Result<QualityScores, RetrievalError> {
        let scores = self.judge.judge(query, answer, context).await?;
        self.monitor.record_quality(scores.overall, scores.confidence);
        Ok(scores)
    }

    /// Generate an answer from source-anchored `context` with the
    /// configured LLM, then check the citations it makes.
    pub async fn generate_answer(
        &self,
        query: &str,
        context: &[ScoredCandidate],
    ) -> Result<GeneratedAnswer> {
        let llm = self
            .llm
            .as_ref()
            .context("No LLM configured; set [llm] provider in the config file")?;
        let prompt = attribution::source_aware_prompt(query, context);
        let text = llm.generate(&prompt).await?;
        let citations = attribution::validate_citations(&text, context);
        info!(
            accuracy = citations.accuracy,
            valid = citations.valid.len(),
            invalid = citations.invalid.len(),
            missing = citations.missing.len(),
            "Citation check complete"
        );
        Ok(GeneratedAnswer { text, citations })
    }

    pub fn health(&self) -> HealthReport {
        self.monitor.report()
    }

    /// Stop the monitor loop and flush tuner and monitor state to disk.
    pub async fn shutdown(&self) {
        if let Some(task) = self.monitor_task.lock().await.take() {
            task.stop().await;
        }
        self.tuner.flush().await;
        if let Err(e) = self.monitor.persist().await {
            warn!(error = %e, "Failed to write health history on shutdown");
        }
        info!("Service shut down");
    }
}
