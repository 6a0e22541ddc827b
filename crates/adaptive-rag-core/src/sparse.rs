//! BM25 lexical index.
//!
//! # Scoring
//!
//! For each query token `t` present in document `d`:
//!
//! ```text
//! idf(t)   = ln((N − df(t) + 0.5) / (df(t) + 0.5))
//! score   += idf(t) · tf(t)·(k1 + 1) / (tf(t) + k1·(1 − b + b·|d| / avgdl))
//! ```
//!
//! `idf` is negative for terms present in more than half the corpus; such
//! terms push a document below the zero-score documents.
//!
//! # Replacement
//!
//! [`SparseIndex`] holds the current [`Bm25Index`] behind an
//! `RwLock<Option<Arc<_>>>`. [`SparseIndex::fit`] builds the replacement
//! without holding the lock and swaps the handle, so a search never
//! observes a partially built index and in-flight searches finish on the
//! snapshot they started with.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Deserialize;
use tracing::debug;

use crate::error::{Result, RetrievalError};
use crate::text::tokenize;

/// BM25 free parameters.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Bm25Params {
    /// Term-frequency saturation.
    #[serde(default = "default_k1")]
    pub k1: f64,
    /// Length normalization strength.
    #[serde(default = "default_b")]
    pub b: f64,
}

fn default_k1() -> f64 {
    1.5
}
fn default_b() -> f64 {
    0.75
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self {
            k1: default_k1(),
            b: default_b(),
        }
    }
}

/// An immutable, fully built BM25 index.
#[derive(Debug, Clone)]
pub struct Bm25Index {
    params: Bm25Params,
    term_freqs: Vec<HashMap<String, u32>>,
    doc_lens: Vec<usize>,
    avg_doc_len: f64,
    idf: HashMap<String, f64>,
}

impl Bm25Index {
    pub fn build<S: AsRef<str>>(documents: &[S], params: Bm25Params) -> Self {
        let mut term_freqs = Vec::with_capacity(documents.len());
        let mut doc_lens = Vec::with_capacity(documents.len());
        let mut doc_freq: HashMap<String, u32> = HashMap::new();

        for doc in documents {
            let tokens = tokenize(doc.as_ref());
            doc_lens.push(tokens.len());
            let mut tf: HashMap<String, u32> = HashMap::new();
            for token in tokens {
                *tf.entry(token).or_insert(0) += 1;
            }
            for term in tf.keys() {
                *doc_freq.entry(term.clone()).or_insert(0) += 1;
            }
            term_freqs.push(tf);
        }

        let n = documents.len() as f64;
        let avg_doc_len = if documents.is_empty() {
            0.0
        } else {
            doc_lens.iter().sum::<usize>() as f64 / n
        };

        let idf = doc_freq
            .into_iter()
            .map(|(term, df)| {
                let df = df as f64;
                (term, ((n - df + 0.5) / (df + 0.5)).ln())
            })
            .collect();

        Self {
            params,
            term_freqs,
            doc_lens,
            avg_doc_len,
            idf,
        }
    }

    pub fn len(&self) -> usize {
        self.doc_lens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc_lens.is_empty()
    }

    pub fn vocabulary_size(&self) -> usize {
        self.idf.len()
    }

    pub fn avg_doc_len(&self) -> f64 {
        self.avg_doc_len
    }

    pub fn idf(&self, term: &str) -> Option<f64> {
        self.idf.get(term).copied()
    }

    /// BM25 score of every document, in document order.
    pub fn scores(&self, query: &str) -> Vec<f64> {
        let query_tokens = tokenize(query);
        let Bm25Params { k1, b } = self.params;

        self.term_freqs
            .iter()
            .zip(&self.doc_lens)
            .map(|(tf_map, &len)| {
                let len_ratio = if self.avg_doc_len > 0.0 {
                    len as f64 / self.avg_doc_len
                } else {
                    0.0
                };
                query_tokens
                    .iter()
                    .filter_map(|t| {
                        let tf = *tf_map.get(t)? as f64;
                        let idf = self.idf.get(t).copied().unwrap_or(0.0);
                        Some(idf * tf * (k1 + 1.0) / (tf + k1 * (1.0 - b + b * len_ratio)))
                    })
                    .sum()
            })
            .collect()
    }

    /// Top `top_k` `(document index, score)` pairs, best first.
    ///
    /// Equal scores keep document order.
    pub fn search(&self, query: &str, top_k: usize) -> Vec<(usize, f64)> {
        let mut ranked: Vec<(usize, f64)> = self.scores(query).into_iter().enumerate().collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        ranked.truncate(top_k);
        ranked
    }
}

/// Replaceable handle to the current [`Bm25Index`].
#[derive(Debug, Default)]
pub struct SparseIndex {
    params: Bm25Params,
    current: RwLock<Option<Arc<Bm25Index>>>,
}

impl SparseIndex {
    pub fn new(params: Bm25Params) -> Self {
        Self {
            params,
            current: RwLock::new(None),
        }
    }

    /// Build an index over `documents` and make it current.
    pub fn fit<S: AsRef<str>>(&self, documents: &[S]) -> Arc<Bm25Index> {
        let index = Arc::new(Bm25Index::build(documents, self.params));
        debug!(
            docs = index.len(),
            vocabulary = index.vocabulary_size(),
            "BM25 index built"
        );
        self.install(index.clone());
        index
    }

    /// Make an already built index current.
    pub fn install(&self, index: Arc<Bm25Index>) {
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(index);
    }

    /// The current index, or [`RetrievalError::NotFitted`].
    pub fn snapshot(&self) -> Result<Arc<Bm25Index>> {
        let guard = match self.current.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.clone().ok_or(RetrievalError::NotFitted)
    }

    pub fn is_fitted(&self) -> bool {
        self.snapshot().is_ok()
    }

    pub fn params(&self) -> Bm25Params {
        self.params
    }

    pub fn search(&self, query: &str, top_k: usize) -> Result<Vec<(usize, f64)>> {
        Ok(self.snapshot()?.search(query, top_k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corpus() -> Vec<&'static str> {
        vec![
            "Tesla reported record revenue growth in fiscal 2023.",
            "Python is a popular programming language for data science.",
            "Completed a summer internship at PwC working on audit analytics.",
        ]
    }

    #[test]
    fn test_search_before_fit_fails() {
        let index = SparseIndex::new(Bm25Params::default());
        assert_eq!(index.search("anything", 3), Err(RetrievalError::NotFitted));
        assert!(!index.is_fitted());
    }

    #[test]
    fn test_pwc_ranks_first() {
        let index = SparseIndex::new(Bm25Params::default());
        index.fit(&corpus());
        let results = index.search("What did the person do at PwC?", 3).unwrap();
        assert_eq!(results[0].0, 2);
        assert!(results[0].1 > 0.0);
    }

    #[test]
    fn test_idf_formula() {
        let index = Bm25Index::build(&corpus(), Bm25Params::default());
        let expected = ((3.0 - 1.0 + 0.5) / (1.0 + 0.5f64)).ln();
        assert!((index.idf("pwc").unwrap() - expected).abs() < 1e-12);
        // "a" is in two of three documents.
        let common = ((3.0 - 2.0 + 0.5) / (2.0 + 0.5f64)).ln();
        assert!((index.idf("a").unwrap() - common).abs() < 1e-12);
        assert!(common < 0.0);
    }

    #[test]
    fn test_results_sorted_and_bounded() {
        let index = Bm25Index::build(&corpus(), Bm25Params::default());
        for query in ["revenue", "python data", "a", "nothing matches", ""] {
            for top_k in [0, 1, 2, 3, 10] {
                let results = index.search(query, top_k);
                assert!(results.len() <= top_k.min(index.len()));
                for pair in results.windows(2) {
                    assert!(pair[0].1 >= pair[1].1);
                }
            }
        }
    }

    #[test]
    fn test_ties_keep_document_order() {
        let index = Bm25Index::build(&corpus(), Bm25Params::default());
        let results = index.search("unrelated", 3);
        let order: Vec<usize> = results.iter().map(|(i, _)| *i).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn test_empty_corpus() {
        let docs: Vec<&str> = Vec::new();
        let index = SparseIndex::new(Bm25Params::default());
        let built = index.fit(&docs);
        assert_eq!(built.avg_doc_len(), 0.0);
        assert!(index.search("query", 5).unwrap().is_empty());
    }

    #[test]
    fn test_refit_keeps_old_snapshot_alive() {
        let index = SparseIndex::new(Bm25Params::default());
        index.fit(&corpus());
        let old = index.snapshot().unwrap();
        index.fit(&["only one document about pwc"]);
        assert_eq!(old.len(), 3);
        assert_eq!(index.snapshot().unwrap().len(), 1);
    }

    #[test]
    fn test_custom_params_change_scores() {
        let docs = ["pwc pwc pwc audit", "pwc tax advisory consulting work", "other"];
        let flat = Bm25Index::build(&docs, Bm25Params { k1: 1.5, b: 0.0 });
        let normalized = Bm25Index::build(&docs, Bm25Params::default());
        assert_ne!(flat.scores("pwc"), normalized.scores("pwc"));
    }
}
