//! Offline retrieval evaluation.
//!
//! Scores [`HybridFusionEngine::search_with_fallback`] against labelled
//! cases and grid-searches the dense weight.
//!
//! | Metric | Definition |
//! |--------|------------|
//! | precision@k | relevant ∩ top-k / \|top-k\| (queries with no results count 0) |
//! | recall@k | relevant ∩ top-k / \|relevant\| (cases without labels count 0) |
//! | MRR | mean of 1 / rank of the first relevant result |
//! | phrase recall | share of cases whose `expected_phrase` occurs in a top-k chunk |

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::Result;
use crate::fusion::HybridFusionEngine;
use crate::models::ScoredCandidate;

/// One labelled query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalCase {
    pub query: String,
    /// Chunk ids that answer the query.
    #[serde(default)]
    pub relevant: Vec<String>,
    /// Text that should appear somewhere in the retrieved chunks.
    #[serde(default)]
    pub expected_phrase: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetrievalMetrics {
    pub queries: usize,
    pub precision: BTreeMap<usize, f64>,
    pub recall: BTreeMap<usize, f64>,
    pub mrr: f64,
    /// `None` when no case carries an expected phrase.
    pub phrase_recall: Option<f64>,
}

pub fn precision_at_k(retrieved: &[String], relevant: &HashSet<&str>, k: usize) -> f64 {
    let top: HashSet<&str> = retrieved.iter().take(k).map(String::as_str).collect();
    if top.is_empty() {
        return 0.0;
    }
    top.intersection(relevant).count() as f64 / top.len() as f64
}

pub fn recall_at_k(retrieved: &[String], relevant: &HashSet<&str>, k: usize) -> f64 {
    if relevant.is_empty() {
        return 0.0;
    }
    let top: HashSet<&str> = retrieved.iter().take(k).map(String::as_str).collect();
    top.intersection(relevant).count() as f64 / relevant.len() as f64
}

pub fn reciprocal_rank(retrieved: &[String], relevant: &HashSet<&str>) -> f64 {
    retrieved
        .iter()
        .position(|id| relevant.contains(id.as_str()))
        .map_or(0.0, |rank| 1.0 / (rank + 1) as f64)
}

/// Whether `phrase` occurs (case-insensitively) in any of the first `k` candidates.
pub fn phrase_found(candidates: &[ScoredCandidate], phrase: &str, k: usize) -> bool {
    let phrase = phrase.trim().to_lowercase();
    candidates
        .iter()
        .take(k)
        .any(|c| c.content.to_lowercase().contains(&phrase))
}

/// Evaluate the engine over `cases` at each of `k_values`.
pub async fn evaluate(
    engine: &HybridFusionEngine,
    cases: &[EvalCase],
    k_values: &[usize],
    hybrid_weight: f64,
) -> Result<RetrievalMetrics> {
    let mut metrics = RetrievalMetrics {
        queries: cases.len(),
        ..Default::default()
    };
    if cases.is_empty() || k_values.is_empty() {
        return Ok(metrics);
    }
    let max_k = k_values.iter().copied().max().unwrap_or(1);
    let mut phrase_cases = 0usize;
    let mut phrase_hits = 0usize;

    for case in cases {
        let results = engine
            .search_with_fallback(&case.query, max_k, hybrid_weight)
            .await?;
        let ids: Vec<String> = results.iter().map(|c| c.chunk_id.clone()).collect();
        let relevant: HashSet<&str> = case.relevant.iter().map(String::as_str).collect();

        for &k in k_values {
            *metrics.precision.entry(k).or_default() += precision_at_k(&ids, &relevant, k);
            *metrics.recall.entry(k).or_default() += recall_at_k(&ids, &relevant, k);
        }
        metrics.mrr += reciprocal_rank(&ids, &relevant);

        if let Some(phrase) = &case.expected_phrase {
            phrase_cases += 1;
            if phrase_found(&results, phrase, max_k) {
                phrase_hits += 1;
            }
        }
        debug!(query = %case.query, retrieved = ids.len(), "Evaluated case");
    }

    let n = cases.len() as f64;
    metrics.precision.values_mut().for_each(|v| *v /= n);
    metrics.recall.values_mut().for_each(|v| *v /= n);
    metrics.mrr /= n;
    metrics.phrase_recall = (phrase_cases > 0).then(|| phrase_hits as f64 / phrase_cases as f64);
    Ok(metrics)
}

/// Inclusive grid of dense weights.
#[derive(Debug, Clone, Copy)]
pub struct WeightGrid {
    pub start: f64,
    pub end: f64,
    pub step: f64,
}

impl Default for WeightGrid {
    fn default() -> Self {
        Self {
            start: 0.1,
            end: 0.9,
            step: 0.1,
        }
    }
}

impl WeightGrid {
    pub fn weights(&self) -> Vec<f64> {
        if self.step <= 0.0 || self.end < self.start {
            return vec![self.start];
        }
        let steps = ((self.end - self.start) / self.step).round() as usize;
        (0..=steps)
            .map(|i| ((self.start + i as f64 * self.step) * 1e6).round() / 1e6)
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WeightTuning {
    pub best_weight: f64,
    pub best_score: f64,
    /// `(dense weight, mean precision@10)` per grid point.
    pub scores: Vec<(f64, f64)>,
}

/// Grid-search the dense weight by mean precision@10.
///
/// `current` is kept unless some grid point scores strictly above zero.
pub async fn tune_hybrid_weights(
    engine: &HybridFusionEngine,
    cases: &[EvalCase],
    grid: WeightGrid,
    current: f64,
) -> Result<WeightTuning> {
    const TOP_K: usize = 10;
    let mut tuning = WeightTuning {
        best_weight: current,
        best_score: 0.0,
        scores: Vec::new(),
    };
    if cases.is_empty() {
        return Ok(tuning);
    }

    for weight in grid.weights() {
        let mut total = 0.0;
        for case in cases {
            let ids: Vec<String> = engine
                .search_with_fallback(&case.query, TOP_K, weight)
                .await?
                .into_iter()
                .map(|c| c.chunk_id)
                .collect();
            let relevant: HashSet<&str> = case.relevant.iter().map(String::as_str).collect();
            total += precision_at_k(&ids, &relevant, TOP_K);
        }
        let score = total / cases.len() as f64;
        tuning.scores.push((weight, score));
        if score > tuning.best_score {
            tuning.best_score = score;
            tuning.best_weight = weight;
        }
    }

    info!(
        best_weight = tuning.best_weight,
        best_score = tuning.best_score,
        "Hybrid weight search complete"
    );
    Ok(tuning)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fusion::FusionConfig;
    use crate::models::Chunk;
    use crate::sparse::Bm25Params;

    fn ids(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_precision_and_recall() {
        let retrieved = ids(&["a", "b", "c", "d"]);
        let relevant: HashSet<&str> = ["b", "d", "z"].into_iter().collect();
        assert_eq!(precision_at_k(&retrieved, &relevant, 2), 0.5);
        assert_eq!(precision_at_k(&retrieved, &relevant, 4), 0.5);
        assert!((recall_at_k(&retrieved, &relevant, 4) - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(precision_at_k(&[], &relevant, 3), 0.0);
        assert_eq!(recall_at_k(&retrieved, &HashSet::new(), 3), 0.0);
    }

    #[test]
    fn test_reciprocal_rank() {
        let relevant: HashSet<&str> = ["c"].into_iter().collect();
        assert!((reciprocal_rank(&ids(&["a", "b", "c"]), &relevant) - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(reciprocal_rank(&ids(&["a"]), &relevant), 0.0);
    }

    #[test]
    fn test_weight_grid() {
        assert_eq!(
            WeightGrid::default().weights(),
            vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9]
        );
    }

    fn engine() -> HybridFusionEngine {
        let engine = HybridFusionEngine::new(FusionConfig::default(), Bm25Params::default());
        engine.fit(
            vec![
                Chunk::new("tesla", "Tesla reported record revenue growth in fiscal 2023."),
                Chunk::new("python", "Python is a popular programming language for data science."),
                Chunk::new("pwc", "Completed a summer internship at PwC working on audit analytics."),
            ],
            None,
        );
        engine
    }

    #[tokio::test]
    async fn test_evaluate_sparse_corpus() {
        let cases = vec![
            EvalCase {
                query: "PwC internship".into(),
                relevant: ids(&["pwc"]),
                expected_phrase: Some("audit analytics".into()),
            },
            EvalCase {
                query: "Tesla revenue".into(),
                relevant: ids(&["tesla"]),
                expected_phrase: None,
            },
        ];
        let metrics = evaluate(&engine(), &cases, &[1, 3], 0.5).await.unwrap();
        assert_eq!(metrics.queries, 2);
        assert_eq!(metrics.precision[&1], 1.0);
        assert_eq!(metrics.recall[&3], 1.0);
        assert_eq!(metrics.mrr, 1.0);
        assert_eq!(metrics.phrase_recall, Some(1.0));
    }

    #[tokio::test]
    async fn test_tuning_keeps_current_without_signal() {
        let cases = vec![EvalCase {
            query: "kubernetes".into(),
            relevant: ids(&["archived-chunk"]),
            expected_phrase: None,
        }];
        let tuning = tune_hybrid_weights(&engine(), &cases, WeightGrid::default(), 0.5)
            .await
            .unwrap();
        assert_eq!(tuning.best_weight, 0.5);
        assert_eq!(tuning.scores.len(), 9);
    }
}
