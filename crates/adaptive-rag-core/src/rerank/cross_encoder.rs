//! Cross-encoder rescoring.

use async_trait::async_trait;

use crate::error::{Result, RetrievalError};
use crate::models::ScoredCandidate;

/// Pairwise query/passage relevance scorer.
///
/// Scores are expected in `[0, 1]` (adapters sigmoid-normalize raw logits)
/// so they can be compared against `rerank_threshold`.
#[async_trait]
pub trait CrossEncoder: Send + Sync {
    fn name(&self) -> &str;

    /// One score per passage, in passage order.
    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f64>>;
}

/// Rescore `candidates`, keep the best `2k`, and drop those under
/// `threshold` while at least `k` remain.
pub async fn rescore(
    encoder: &dyn CrossEncoder,
    query: &str,
    mut candidates: Vec<ScoredCandidate>,
    k: usize,
    threshold: f64,
) -> Result<Vec<ScoredCandidate>> {
    let passages: Vec<String> = candidates.iter().map(|c| c.content.clone()).collect();
    let scores = encoder.score(query, &passages).await?;
    if scores.len() != candidates.len() {
        return Err(RetrievalError::provider(
            encoder.name(),
            format!("expected {} scores, got {}", candidates.len(), scores.len()),
        ));
    }

    for (candidate, score) in candidates.iter_mut().zip(scores) {
        candidate.rerank_score = Some(score);
    }
    candidates.sort_by(|a, b| {
        let a = a.rerank_score.unwrap_or(f64::NEG_INFINITY);
        let b = b.rerank_score.unwrap_or(f64::NEG_INFINITY);
        b.partial_cmp(&a).unwrap_or(std::cmp::Ordering::Equal)
    });
    candidates.truncate(k.saturating_mul(2));

    let above = candidates
        .iter()
        .filter(|c| c.rerank_score.is_some_and(|s| s >= threshold))
        .count();
    candidates.truncate(above.max(k));
    Ok(candidates)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::text::tokenize;

    /// Scores a passage by the share of query tokens it contains.
    pub struct TokenOverlapEncoder;

    #[async_trait]
    impl CrossEncoder for TokenOverlapEncoder {
        fn name(&self) -> &str {
            "token-overlap"
        }

        async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f64>> {
            let q = tokenize(query);
            Ok(passages
                .iter()
                .map(|p| {
                    let tokens = tokenize(p);
                    let hits = q.iter().filter(|t| tokens.contains(t)).count();
                    hits as f64 / q.len().max(1) as f64
                })
                .collect())
        }
    }

    pub struct FailingEncoder;

    #[async_trait]
    impl CrossEncoder for FailingEncoder {
        fn name(&self) -> &str {
            "failing"
        }

        async fn score(&self, _query: &str, _passages: &[String]) -> Result<Vec<f64>> {
            Err(RetrievalError::provider("failing", "timed out"))
        }
    }
}
