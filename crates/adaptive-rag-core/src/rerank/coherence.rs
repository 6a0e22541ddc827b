//! Coherence scoring: mean cosine similarity to the rest of the set.

use crate::dense::cosine_similarity;

/// Coherence of each vector against all others; `0.0` for a single vector.
pub fn coherence_scores(vectors: &[Vec<f32>]) -> Vec<f64> {
    let n = vectors.len();
    if n < 2 {
        return vec![0.0; n];
    }
    (0..n)
        .map(|i| {
            let total: f64 = (0..n)
                .filter(|&j| j != i)
                .map(|j| cosine_similarity(&vectors[i], &vectors[j]) as f64)
                .sum();
            total / (n - 1) as f64
        })
        .collect()
}

/// Positions ordered by coherence, highest first; ties keep input order.
pub fn rank_by_coherence(vectors: &[Vec<f32>]) -> Vec<usize> {
    let scores = coherence_scores(vectors);
    let mut order: Vec<usize> = (0..vectors.len()).collect();
    order.sort_by(|&a, &b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    order
}
