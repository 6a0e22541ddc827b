//! Hybrid dense + sparse retrieval with lexical fallback.
//!
//! # Fusion
//!
//! 1. Fetch `max(dense_top_k, top_k)` dense hits (cosine similarity).
//! 2. If the best dense similarity is below `fallback_threshold`, or the
//!    dense path is unavailable, return the BM25 top `top_k` unchanged,
//!    tagged [`RetrievalMethod::SparseFallback`].
//! 3. Otherwise fetch `max(sparse_top_k, top_k)` BM25 hits.
//! 4. Min-max normalize each list to `[0, 1]` (all-equal lists become `1.0`).
//! 5. Merge the union: `hybrid = w × dense + (1 − w) × sparse`, absent = 0.
//! 6. Sort by hybrid score (desc), corpus index (asc); truncate to `top_k`.
//!
//! # Strategy selection
//!
//! [`auto_select_strategy`] counts keyword-style and semantic-style cues in
//! the query; [`HybridFusionEngine::search_adaptive`] then runs dense only,
//! sparse only, or the fallback search above.
//!
//! # Snapshots
//!
//! The chunks, BM25 index, and dense adapter of one corpus generation are
//! held together in an [`IndexedCorpus`] and swapped as a unit by
//! [`HybridFusionEngine::fit`].

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, RwLock};

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::dense::DenseIndexAdapter;
use crate::error::{Result, RetrievalError};
use crate::models::{Chunk, RetrievalMethod, ScoredCandidate};
use crate::sparse::{Bm25Index, Bm25Params, SparseIndex};
use crate::text::tokenize;

#[derive(Debug, Clone, Deserialize)]
pub struct FusionConfig {
    /// Best dense similarity below which the dense list is ignored.
    #[serde(default = "default_fallback_threshold")]
    pub fallback_threshold: f64,
    #[serde(default = "default_top_k")]
    pub dense_top_k: usize,
    #[serde(default = "default_top_k")]
    pub sparse_top_k: usize,
}

fn default_fallback_threshold() -> f64 {
    0.1
}
fn default_top_k() -> usize {
    20
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            fallback_threshold: default_fallback_threshold(),
            dense_top_k: default_top_k(),
            sparse_top_k: default_top_k(),
        }
    }
}

/// Min-max normalize `(index, score)` pairs to `[0.0, 1.0]`.
///
/// If all scores are equal, they are normalized to `1.0`.
pub fn min_max_normalize(scores: &[(usize, f64)]) -> Vec<(usize, f64)> {
    if scores.is_empty() {
        return Vec::new();
    }

    let s_min = scores.iter().map(|(_, s)| *s).fold(f64::INFINITY, f64::min);
    let s_max = scores
        .iter()
        .map(|(_, s)| *s)
        .fold(f64::NEG_INFINITY, f64::max);

    scores
        .iter()
        .map(|&(i, s)| {
            let norm = if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (s - s_min) / (s_max - s_min)
            };
            (i, norm)
        })
        .collect()
}

/// One entry of a fused ranking, before it is joined with chunk content.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusedScore {
    pub index: usize,
    pub dense_score: f64,
    pub sparse_score: f64,
    pub hybrid_score: f64,
    pub method: RetrievalMethod,
}

/// Merge a dense and a sparse ranking by weighted normalized score.
///
/// `hybrid_weight` is the dense weight; the sparse weight is its complement.
pub fn combine(dense: &[(usize, f64)], sparse: &[(usize, f64)], hybrid_weight: f64) -> Vec<FusedScore> {
    let dense_norm: HashMap<usize, f64> = min_max_normalize(dense).into_iter().collect();
    let sparse_norm: HashMap<usize, f64> = min_max_normalize(sparse).into_iter().collect();

    let mut indices: Vec<usize> = dense_norm.keys().chain(sparse_norm.keys()).copied().collect();
    indices.sort_unstable();
    indices.dedup();

    let mut fused: Vec<FusedScore> = indices
        .into_iter()
        .map(|index| {
            let d = dense_norm.get(&index).copied();
            let s = sparse_norm.get(&index).copied();
            let method = match (d, s) {
                (Some(_), Some(_)) => RetrievalMethod::Hybrid,
                (Some(_), None) => RetrievalMethod::Dense,
                _ => RetrievalMethod::Sparse,
            };
            let dense_score = d.unwrap_or(0.0);
            let sparse_score = s.unwrap_or(0.0);
            FusedScore {
                index,
                dense_score,
                sparse_score,
                hybrid_score: hybrid_weight * dense_score + (1.0 - hybrid_weight) * sparse_score,
                method,
            }
        })
        .collect();

    fused.sort_by(|a, b| {
        b.hybrid_score
            .partial_cmp(&a.hybrid_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.index.cmp(&b.index))
    });
    fused
}

/// Retrieval strategy chosen from query shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Dense,
    Sparse,
    Hybrid,
}

static YEAR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\d{4}\b").unwrap());
static AMOUNT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\$\d+|\d+%").unwrap());

const STRUCTURED_PREFIXES: &[&str] = &["name:", "title:", "company:", "date:"];
const CONCEPT_CUES: &[&str] = &["explain", "describe", "what is", "how does", "why"];
const RELATION_CUES: &[&str] = &["similar", "related", "like", "about"];

/// Pick dense, sparse, or hybrid retrieval for `query`.
///
/// Keyword cues: more than 10 word tokens, a structured `field:` prefix,
/// a four-digit year, a dollar amount or percentage. Semantic cues: a
/// conceptual phrase, five words or fewer, a relatedness word. Two keyword
/// cues select sparse; otherwise two semantic cues select dense.
pub fn auto_select_strategy(query: &str) -> Strategy {
    let lower = query.to_lowercase();

    let keyword_cues = [
        tokenize(query).len() > 10,
        STRUCTURED_PREFIXES.iter().any(|p| lower.contains(p)),
        YEAR_RE.is_match(query),
        AMOUNT_RE.is_match(query),
    ];
    let semantic_cues = [
        CONCEPT_CUES.iter().any(|c| lower.contains(c)),
        query.split_whitespace().count() <= 5,
        RELATION_CUES.iter().any(|c| lower.contains(c)),
    ];

    let keyword = keyword_cues.iter().filter(|&&c| c).count();
    let semantic = semantic_cues.iter().filter(|&&c| c).count();

    if keyword >= 2 {
        Strategy::Sparse
    } else if semantic >= 2 {
        Strategy::Dense
    } else {
        Strategy::Hybrid
    }
}

/// One corpus generation: chunks plus the indices built over them.
pub struct IndexedCorpus {
    chunks: Vec<Chunk>,
    sparse: Arc<Bm25Index>,
    dense: Option<DenseIndexAdapter>,
}

impl IndexedCorpus {
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn sparse(&self) -> &Bm25Index {
        &self.sparse
    }

    pub fn dense(&self) -> Option<&DenseIndexAdapter> {
        self.dense.as_ref()
    }

    fn candidate(
        &self,
        index: usize,
        dense: f64,
        sparse: f64,
        hybrid: f64,
        method: RetrievalMethod,
    ) -> Option<ScoredCandidate> {
        self.chunks
            .get(index)
            .map(|chunk| ScoredCandidate::from_chunk(chunk, dense, sparse, hybrid, method))
    }

    fn sparse_only(&self, query: &str, top_k: usize, method: RetrievalMethod) -> Vec<ScoredCandidate> {
        self.sparse
            .search(query, top_k)
            .into_iter()
            .filter_map(|(i, score)| self.candidate(i, 0.0, score, score, method))
            .collect()
    }
}

/// Dense + sparse retrieval over the current corpus snapshot.
pub struct HybridFusionEngine {
    config: FusionConfig,
    sparse: SparseIndex,
    current: RwLock<Option<Arc<IndexedCorpus>>>,
}

impl HybridFusionEngine {
    pub fn new(config: FusionConfig, bm25: Bm25Params) -> Self {
        Self {
            config,
            sparse: SparseIndex::new(bm25),
            current: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// The BM25 handle; always holds the index of the current snapshot.
    pub fn sparse_index(&self) -> &SparseIndex {
        &self.sparse
    }

    /// Index `chunks` and make them the current corpus.
    ///
    /// `dense` must have been built over the same chunks, in the same order.
    /// Without it every search takes the sparse fallback path.
    pub fn fit(&self, chunks: Vec<Chunk>, dense: Option<DenseIndexAdapter>) -> Arc<IndexedCorpus> {
        let texts: Vec<&str> = chunks.iter().map(|c| c.content.as_str()).collect();
        let sparse = Arc::new(Bm25Index::build(&texts, self.sparse.params()));
        let corpus = Arc::new(IndexedCorpus {
            chunks,
            sparse: sparse.clone(),
            dense,
        });
        info!(
            chunks = corpus.len(),
            dense = corpus.dense.is_some(),
            "Corpus indexed"
        );

        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.sparse.install(sparse);
        *guard = Some(corpus.clone());
        corpus
    }

    /// The current corpus, or [`RetrievalError::NotFitted`].
    pub fn snapshot(&self) -> Result<Arc<IndexedCorpus>> {
        let guard = match self.current.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.clone().ok_or(RetrievalError::NotFitted)
    }

    /// Dense hits, or an empty list when the dense path is missing or failing.
    async fn dense_hits(&self, corpus: &IndexedCorpus, query: &str, top_k: usize) -> Vec<(usize, f64)> {
        let Some(dense) = corpus.dense() else {
            return Vec::new();
        };
        match dense.search_text(query, top_k).await {
            Ok(hits) => hits,
            Err(e) => {
                warn!(error = %e, "Dense search unavailable, using BM25 only");
                Vec::new()
            }
        }
    }

    /// Hybrid search that degrades to BM25 when the dense signal is weak.
    pub async fn search_with_fallback(
        &self,
        query: &str,
        top_k: usize,
        hybrid_weight: f64,
    ) -> Result<Vec<ScoredCandidate>> {
        let corpus = self.snapshot()?;
        if query.trim().is_empty() || corpus.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        let dense = self
            .dense_hits(&corpus, query, self.config.dense_top_k.max(top_k))
            .await;
        let best_dense = dense
            .iter()
            .map(|(_, s)| *s)
            .fold(f64::NEG_INFINITY, f64::max);

        if dense.is_empty() || best_dense < self.config.fallback_threshold {
            let best_dense = best_dense.max(0.0);
            info!(
                best_dense,
                threshold = self.config.fallback_threshold,
                "Dense signal below threshold, using BM25 fallback"
            );
            return Ok(corpus.sparse_only(query, top_k, RetrievalMethod::SparseFallback));
        }

        let sparse = corpus
            .sparse
            .search(query, self.config.sparse_top_k.max(top_k));
        let mut fused = combine(&dense, &sparse, hybrid_weight);
        fused.truncate(top_k);
        debug!(
            dense = dense.len(),
            sparse = sparse.len(),
            fused = fused.len(),
            "Hybrid fusion complete"
        );

        Ok(fused
            .into_iter()
            .filter_map(|f| {
                corpus.candidate(f.index, f.dense_score, f.sparse_score, f.hybrid_score, f.method)
            })
            .collect())
    }

    /// Search with the strategy [`auto_select_strategy`] picks for `query`.
    pub async fn search_adaptive(
        &self,
        query: &str,
        top_k: usize,
        hybrid_weight: f64,
    ) -> Result<Vec<ScoredCandidate>> {
        let strategy = auto_select_strategy(query);
        debug!(?strategy, "Adaptive strategy selected");

        match strategy {
            Strategy::Hybrid => self.search_with_fallback(query, top_k, hybrid_weight).await,
            Strategy::Sparse => {
                let corpus = self.snapshot()?;
                if query.trim().is_empty() {
                    return Ok(Vec::new());
                }
                Ok(corpus.sparse_only(query, top_k, RetrievalMethod::SparseAdaptive))
            }
            Strategy::Dense => {
                let corpus = self.snapshot()?;
                if corpus.dense().is_none() {
                    return self.search_with_fallback(query, top_k, hybrid_weight).await;
                }
                let hits = self.dense_hits(&corpus, query, top_k).await;
                if hits.is_empty() {
                    return self.search_with_fallback(query, top_k, hybrid_weight).await;
                }
                Ok(hits
                    .into_iter()
                    .filter_map(|(i, s)| corpus.candidate(i, s, 0.0, s, RetrievalMethod::DenseAdaptive))
                    .collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dense::testing::{BagOfWordsEmbedder, FailingEmbedder};
    use crate::dense::{Embedder, InMemoryVectorIndex};

    const VOCAB: &[&str] = &["tesla", "revenue", "python", "language", "pwc", "internship"];

    fn chunks() -> Vec<Chunk> {
        vec![
            Chunk::new("tesla", "Tesla revenue grew strongly.").with_meta("title", "Tesla"),
            Chunk::new("python", "Python is a programming language.").with_meta("title", "Python"),
            Chunk::new("pwc", "Internship at PwC in audit.").with_meta("title", "PwC Internship"),
        ]
    }

    async fn engine_with(embedder: Arc<dyn Embedder>) -> HybridFusionEngine {
        let engine = HybridFusionEngine::new(FusionConfig::default(), Bm25Params::default());
        let chunks = chunks();
        let index = InMemoryVectorIndex::build(embedder.as_ref(), &chunks, 8)
            .await
            .unwrap_or_default();
        let ids: Vec<String> = chunks.iter().map(|c| c.id.clone()).collect();
        let dense = DenseIndexAdapter::new(embedder, Arc::new(index), ids);
        engine.fit(chunks, Some(dense));
        engine
    }

    #[test]
    fn test_normalize_empty() {
        assert!(min_max_normalize(&[]).is_empty());
    }

    #[test]
    fn test_normalize_range() {
        let result = min_max_normalize(&[(0, 10.0), (1, 5.0), (2, 0.0)]);
        assert!((result[0].1 - 1.0).abs() < 1e-9);
        assert!((result[1].1 - 0.5).abs() < 1e-9);
        assert!(result[2].1.abs() < 1e-9);
    }

    #[test]
    fn test_normalize_all_equal() {
        for (_, score) in min_max_normalize(&[(0, 3.0), (1, 3.0)]) {
            assert!((score - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_combine_with_empty_sparse_is_dense_normalization() {
        let dense = vec![(4, 0.9), (2, 0.5), (7, 0.1)];
        let fused = combine(&dense, &[], 0.3);
        let expected = min_max_normalize(&dense);
        assert_eq!(fused.len(), 3);
        for (f, (i, norm)) in fused.iter().zip(expected) {
            assert_eq!(f.index, i);
            assert_eq!(f.method, RetrievalMethod::Dense);
            assert!((f.dense_score - norm).abs() < 1e-12);
            assert!((f.hybrid_score - 0.3 * norm).abs() < 1e-12);
        }
    }

    #[test]
    fn test_combine_with_empty_dense_is_sparse_only() {
        let fused = combine(&[], &[(1, 4.0), (0, 2.0)], 0.5);
        assert!(fused.iter().all(|f| f.method == RetrievalMethod::Sparse));
        assert_eq!(fused[0].index, 1);
    }

    #[test]
    fn test_combine_union_and_methods() {
        let dense = vec![(0, 0.9), (1, 0.3)];
        let sparse = vec![(1, 8.0), (2, 2.0)];
        let fused = combine(&dense, &sparse, 0.5);
        let by_index: HashMap<usize, FusedScore> = fused.iter().map(|f| (f.index, *f)).collect();
        assert_eq!(by_index[&0].method, RetrievalMethod::Dense);
        assert_eq!(by_index[&1].method, RetrievalMethod::Hybrid);
        assert_eq!(by_index[&2].method, RetrievalMethod::Sparse);
        // idx 0: dense 1.0, sparse 0 → 0.5; idx 1: dense 0, sparse 1 → 0.5; idx 2: 0.
        assert_eq!(fused[0].index, 0);
        assert_eq!(fused[1].index, 1);
        assert!(fused[2].hybrid_score.abs() < 1e-12);
    }

    #[test]
    fn test_hybrid_weight_extremes() {
        let dense = vec![(0, 0.9), (1, 0.1)];
        let sparse = vec![(1, 9.0), (0, 1.0)];
        assert_eq!(combine(&dense, &sparse, 1.0)[0].index, 0);
        assert_eq!(combine(&dense, &sparse, 0.0)[0].index, 1);
    }

    #[test]
    fn test_auto_select_strategy() {
        assert_eq!(auto_select_strategy("explain transformers"), Strategy::Dense);
        assert_eq!(
            auto_select_strategy("company: Tesla revenue 2023 up 15%"),
            Strategy::Sparse
        );
        assert_eq!(
            auto_select_strategy("list the audit engagements completed during the internship"),
            Strategy::Hybrid
        );
    }

    #[tokio::test]
    async fn test_search_before_fit() {
        let engine = HybridFusionEngine::new(FusionConfig::default(), Bm25Params::default());
        let err = engine.search_with_fallback("pwc", 3, 0.5).await.unwrap_err();
        assert_eq!(err, RetrievalError::NotFitted);
    }

    #[tokio::test]
    async fn test_fallback_matches_sparse_order() {
        // Query words are outside the embedding vocabulary: every similarity is 0.
        let engine = engine_with(Arc::new(BagOfWordsEmbedder::new(VOCAB))).await;
        let query = "audit work in";
        let results = engine.search_with_fallback(query, 3, 0.5).await.unwrap();
        let sparse = engine.sparse_index().search(query, 3).unwrap();

        assert_eq!(results.len(), sparse.len());
        for (candidate, (i, score)) in results.iter().zip(sparse) {
            assert_eq!(candidate.method, RetrievalMethod::SparseFallback);
            assert_eq!(candidate.chunk_id, chunks()[i].id);
            assert_eq!(candidate.hybrid_score, score);
            assert_eq!(candidate.dense_score, 0.0);
        }
    }

    #[tokio::test]
    async fn test_failing_embedder_falls_back() {
        let engine = engine_with(Arc::new(FailingEmbedder)).await;
        let results = engine.search_with_fallback("pwc internship", 2, 0.5).await.unwrap();
        assert_eq!(results[0].chunk_id, "pwc");
        assert!(results
            .iter()
            .all(|c| c.method == RetrievalMethod::SparseFallback));
    }

    #[tokio::test]
    async fn test_confident_dense_fuses() {
        let engine = engine_with(Arc::new(BagOfWordsEmbedder::new(VOCAB))).await;
        let results = engine
            .search_with_fallback("PwC internship", 3, 0.5)
            .await
            .unwrap();
        assert_eq!(results[0].chunk_id, "pwc");
        assert_eq!(results[0].method, RetrievalMethod::Hybrid);
        assert!(results.len() <= 3);
    }

    #[tokio::test]
    async fn test_adaptive_sparse_uses_raw_scores() {
        let engine = engine_with(Arc::new(BagOfWordsEmbedder::new(VOCAB))).await;
        let results = engine
            .search_adaptive("company: Tesla revenue 2023", 2, 0.5)
            .await
            .unwrap();
        assert_eq!(results[0].chunk_id, "tesla");
        assert_eq!(results[0].method, RetrievalMethod::SparseAdaptive);
        assert_eq!(results[0].sparse_score, results[0].hybrid_score);
    }

    #[tokio::test]
    async fn test_adaptive_dense() {
        let engine = engine_with(Arc::new(BagOfWordsEmbedder::new(VOCAB))).await;
        let results = engine.search_adaptive("explain python language", 1, 0.5).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk_id, "python");
        assert_eq!(results[0].method, RetrievalMethod::DenseAdaptive);
    }

    #[tokio::test]
    async fn test_refit_swaps_whole_snapshot() {
        let engine = engine_with(Arc::new(BagOfWordsEmbedder::new(VOCAB))).await;
        let before = engine.snapshot().unwrap();
        engine.fit(vec![Chunk::new("solo", "PwC only")], None);
        assert_eq!(before.len(), 3);
        let after = engine.snapshot().unwrap();
        assert_eq!(after.len(), 1);
        assert!(after.dense().is_none());
        assert_eq!(engine.sparse_index().snapshot().unwrap().len(), 1);
    }
}
