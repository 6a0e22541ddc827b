//! Configuration parsing and validation.
//!
//! The service reads a single TOML file (default `./config/arag.toml`).
//! Every section is optional; omitted keys take the defaults below.
//!
//! ```toml
//! [storage]
//! data_dir = "./data"
//!
//! [corpus]
//! path = "./data/chunks.json"
//!
//! [retrieval]
//! use_query_analysis = true
//! candidate_multiplier = 3
//!
//! [defaults]
//! retrieval_k = 5
//! rerank_threshold = 0.7
//! hybrid_weight = 0.5
//!
//! [tuner]
//! adjustment_cooldown_hours = 2.0
//! k_range = [3, 15]
//!
//! [embedding]
//! provider = "ollama"
//! model = "nomic-embed-text"
//! ```
//!
//! [`load_config`] rejects out-of-range values before anything starts.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use adaptive_rag_core::filter::{default_intent_rules, IntentRule};
use adaptive_rag_core::fusion::FusionConfig;
use adaptive_rag_core::rerank::RerankConfig;
use adaptive_rag_core::sparse::Bm25Params;

use crate::tuning::TuningParameters;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub corpus: CorpusConfig,
    #[serde(default)]
    pub sparse: Bm25Params,
    #[serde(default)]
    pub fusion: FusionConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default)]
    pub tuner: TunerConfig,
    #[serde(default)]
    pub defaults: TuningParameters,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub reranker: RerankerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Directory holding `feedback.json`, `adjustments.json`, `tuning.json`
    /// and `health.json`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CorpusConfig {
    /// JSON array of chunks (`id`, `content`, `metadata`).
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Let the query analyzer pick `k` when the caller does not.
    #[serde(default = "default_true")]
    pub use_query_analysis: bool,
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,
    /// Derive a metadata filter from query intent when none is given.
    #[serde(default = "default_true")]
    pub auto_filter: bool,
    /// Pick dense, sparse, or hybrid search per query.
    #[serde(default)]
    pub adaptive_strategy: bool,
    #[serde(default = "default_intent_rules")]
    pub intent_rules: Vec<IntentRule>,
}

fn default_true() -> bool {
    true
}
fn default_candidate_multiplier() -> usize {
    3
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            use_query_analysis: true,
            candidate_multiplier: default_candidate_multiplier(),
            auto_filter: true,
            adaptive_strategy: false,
            intent_rules: default_intent_rules(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TunerConfig {
    #[serde(default = "default_min_feedback")]
    pub min_feedback_for_adjustment: usize,
    #[serde(default = "default_min_group_size")]
    pub min_group_size: usize,
    #[serde(default = "default_negative_threshold")]
    pub negative_feedback_threshold: f64,
    #[serde(default = "default_positive_boost")]
    pub positive_feedback_boost: f64,
    #[serde(default = "default_quality_weight")]
    pub quality_weight: f64,
    #[serde(default = "default_rating_weight")]
    pub user_rating_weight: f64,
    #[serde(default = "default_cooldown_hours")]
    pub adjustment_cooldown_hours: f64,
    /// Only feedback this recent is considered for adjustments.
    #[serde(default = "default_window_hours")]
    pub window_hours: f64,
    #[serde(default = "default_k_range")]
    pub k_range: [usize; 2],
    #[serde(default = "default_threshold_range")]
    pub threshold_range: [f64; 2],
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_max_adjustments")]
    pub max_adjustments: usize,
}

fn default_min_feedback() -> usize {
    5
}
fn default_min_group_size() -> usize {
    3
}
fn default_negative_threshold() -> f64 {
    0.4
}
fn default_positive_boost() -> f64 {
    0.8
}
fn default_quality_weight() -> f64 {
    0.6
}
fn default_rating_weight() -> f64 {
    0.4
}
fn default_cooldown_hours() -> f64 {
    2.0
}
fn default_window_hours() -> f64 {
    24.0
}
fn default_k_range() -> [usize; 2] {
    [3, 15]
}
fn default_threshold_range() -> [f64; 2] {
    [0.1, 0.9]
}
fn default_max_entries() -> usize {
    1000
}
fn default_max_adjustments() -> usize {
    100
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            min_feedback_for_adjustment: default_min_feedback(),
            min_group_size: default_min_group_size(),
            negative_feedback_threshold: default_negative_threshold(),
            positive_feedback_boost: default_positive_boost(),
            quality_weight: default_quality_weight(),
            user_rating_weight: default_rating_weight(),
            adjustment_cooldown_hours: default_cooldown_hours(),
            window_hours: default_window_hours(),
            k_range: default_k_range(),
            threshold_range: default_threshold_range(),
            max_entries: default_max_entries(),
            max_adjustments: default_max_adjustments(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `disabled`, `openai`, `ollama`, or `local` (`local-models` feature).
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for Ollama (default `http://localhost:11434`).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct RerankerConfig {
    /// `disabled`, `http` (OpenAI-compatible `/v1/rerank`), or `local`.
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_reranker_timeout")]
    pub timeout_secs: u64,
}

fn default_reranker_timeout() -> u64 {
    10
}

impl Default for RerankerConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            base_url: None,
            model: None,
            timeout_secs: default_reranker_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    /// `disabled` or `ollama`.
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

fn default_llm_timeout() -> u64 {
    60
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            url: None,
            model: None,
            timeout_secs: default_llm_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MonitorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Number of most recent queries a snapshot aggregates.
    #[serde(default = "default_metrics_window")]
    pub metrics_window: usize,
    /// Snapshots kept in memory and in `health.json`.
    #[serde(default = "default_history")]
    pub history: usize,
    /// Alerts kept, resolved ones dropped oldest first.
    #[serde(default = "default_history")]
    pub alert_history: usize,
    #[serde(default = "default_max_processing_ms")]
    pub max_processing_ms: f64,
    #[serde(default = "default_min_quality")]
    pub min_quality_score: f64,
    #[serde(default = "default_min_confidence")]
    pub min_confidence_score: f64,
    #[serde(default = "default_max_error_rate")]
    pub max_error_rate: f64,
}

fn default_interval_secs() -> u64 {
    30
}
fn default_metrics_window() -> usize {
    50
}
fn default_history() -> usize {
    100
}
fn default_max_processing_ms() -> f64 {
    30_000.0
}
fn default_min_quality() -> f64 {
    2.5
}
fn default_min_confidence() -> f64 {
    0.3
}
fn default_max_error_rate() -> f64 {
    0.1
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_interval_secs(),
            metrics_window: default_metrics_window(),
            history: default_history(),
            alert_history: default_history(),
            max_processing_ms: default_max_processing_ms(),
            min_quality_score: default_min_quality(),
            min_confidence_score: default_min_confidence(),
            max_error_rate: default_max_error_rate(),
        }
    }
}

fn check_unit(name: &str, value: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        bail!("{} must be in [0.0, 1.0], got {}", name, value);
    }
    Ok(())
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Reject configurations the service cannot run with.
pub fn validate(config: &Config) -> Result<()> {
    if config.sparse.k1 < 0.0 {
        bail!("sparse.k1 must be >= 0");
    }
    check_unit("sparse.b", config.sparse.b)?;

    if config.fusion.dense_top_k == 0 || config.fusion.sparse_top_k == 0 {
        bail!("fusion.dense_top_k and fusion.sparse_top_k must be >= 1");
    }
    if config.retrieval.candidate_multiplier == 0 {
        bail!("retrieval.candidate_multiplier must be >= 1");
    }

    check_unit("rerank.min_overlap", config.rerank.min_overlap)?;
    check_unit("rerank.relaxed_min_overlap", config.rerank.relaxed_min_overlap)?;
    if !(config.rerank.cluster_eps > 0.0 && config.rerank.cluster_eps <= 2.0) {
        bail!("rerank.cluster_eps must be in (0.0, 2.0]");
    }
    if config.rerank.min_cluster_size == 0 {
        bail!("rerank.min_cluster_size must be >= 1");
    }

    let tuner = &config.tuner;
    let [k_min, k_max] = tuner.k_range;
    if k_min == 0 || k_min > k_max {
        bail!("tuner.k_range must satisfy 1 <= min <= max, got [{}, {}]", k_min, k_max);
    }
    let [t_min, t_max] = tuner.threshold_range;
    check_unit("tuner.threshold_range[0]", t_min)?;
    check_unit("tuner.threshold_range[1]", t_max)?;
    if t_min > t_max {
        bail!("tuner.threshold_range min must not exceed max");
    }
    if tuner.min_feedback_for_adjustment == 0 || tuner.min_group_size == 0 {
        bail!("tuner.min_feedback_for_adjustment and tuner.min_group_size must be >= 1");
    }
    if tuner.max_entries == 0 || tuner.max_adjustments == 0 {
        bail!("tuner.max_entries and tuner.max_adjustments must be >= 1");
    }
    if tuner.adjustment_cooldown_hours < 0.0 || tuner.window_hours <= 0.0 {
        bail!("tuner.adjustment_cooldown_hours must be >= 0 and tuner.window_hours > 0");
    }
    if tuner.quality_weight < 0.0 || tuner.user_rating_weight < 0.0 {
        bail!("tuner weights must be >= 0");
    }

    let defaults = &config.defaults;
    if !(k_min..=k_max).contains(&defaults.retrieval_k) {
        bail!(
            "defaults.retrieval_k = {} outside tuner.k_range [{}, {}]",
            defaults.retrieval_k,
            k_min,
            k_max
        );
    }
    check_unit("defaults.rerank_threshold", defaults.rerank_threshold)?;
    check_unit("defaults.hybrid_weight", defaults.hybrid_weight)?;
    if let Some(q) = defaults.quality_threshold {
        if !(0.0..=5.0).contains(&q) {
            bail!("defaults.quality_threshold must be in [0.0, 5.0]");
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "local" => {}
        "openai" | "ollama" => {
            if config.embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }
    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be >= 1");
    }

    match config.reranker.provider.as_str() {
        "disabled" | "local" => {}
        "http" => {
            if config.reranker.base_url.is_none() {
                bail!("reranker.base_url must be specified when provider is 'http'");
            }
        }
        other => bail!(
            "Unknown reranker provider: '{}'. Must be disabled, http, or local.",
            other
        ),
    }

    match config.llm.provider.as_str() {
        "disabled" => {}
        "ollama" => {
            if config.llm.model.is_none() {
                bail!("llm.model must be specified when provider is 'ollama'");
            }
        }
        other => bail!("Unknown llm provider: '{}'. Must be disabled or ollama.", other),
    }

    if config.monitor.interval_secs == 0 || config.monitor.metrics_window == 0 {
        bail!("monitor.interval_secs and monitor.metrics_window must be >= 1");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_text: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_text)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config.defaults.retrieval_k, 5);
        assert_eq!(config.defaults.rerank_threshold, 0.7);
        assert_eq!(config.tuner.k_range, [3, 15]);
        assert_eq!(config.fusion.dense_top_k, 20);
        assert_eq!(config.sparse.k1, 1.5);
        assert_eq!(config.rerank.min_overlap, 0.03);
        assert_eq!(config.retrieval.candidate_multiplier, 3);
        assert!(!config.embedding.is_enabled());
    }

    #[test]
    fn test_sections_override_defaults() {
        let config = parse(
            r#"
            [defaults]
            retrieval_k = 8
            hybrid_weight = 0.3

            [tuner]
            adjustment_cooldown_hours = 0.5
            threshold_range = [0.2, 0.8]

            [rerank]
            extra_aliases = [["gs", "goldman sachs"]]
            "#,
        )
        .unwrap();
        assert_eq!(config.defaults.retrieval_k, 8);
        assert_eq!(config.defaults.rerank_threshold, 0.7);
        assert_eq!(config.tuner.adjustment_cooldown_hours, 0.5);
        assert_eq!(config.rerank.extra_aliases.len(), 1);
    }

    #[test]
    fn test_rejects_default_k_outside_range() {
        let err = parse("[defaults]\nretrieval_k = 40").unwrap_err();
        assert!(err.to_string().contains("defaults.retrieval_k"));
    }

    #[test]
    fn test_rejects_bad_weight() {
        assert!(parse("[defaults]\nhybrid_weight = 1.5").is_err());
    }

    #[test]
    fn test_rejects_unknown_provider() {
        assert!(parse("[embedding]\nprovider = \"magic\"").is_err());
        assert!(parse("[reranker]\nprovider = \"http\"").is_err());
        assert!(parse("[embedding]\nprovider = \"ollama\"").is_err());
    }

    #[test]
    fn test_load_config_reports_missing_file() {
        let err = load_config(Path::new("/nonexistent/arag.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
