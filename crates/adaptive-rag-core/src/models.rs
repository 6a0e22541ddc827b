//! Data types passed between retrieval stages.
//!
//! | Type | Lifetime |
//! |------|----------|
//! | [`Chunk`] | Owned by the corpus snapshot, immutable |
//! | [`ScoredCandidate`] | One query, discarded after the response |
//! | [`RetrievalMethod`] | Tag explaining which signal produced a score |

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A metadata value: chunk metadata only carries strings and integers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Int(i64),
    Text(String),
}

impl MetaValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::Text(s) => Some(s),
            MetaValue::Int(_) => None,
        }
    }

    /// Loose equality used by metadata filters: strings compare
    /// case-insensitively, integers also match their decimal text.
    pub fn matches(&self, expected: &MetaValue) -> bool {
        match (self, expected) {
            (MetaValue::Int(a), MetaValue::Int(b)) => a == b,
            (MetaValue::Text(a), MetaValue::Text(b)) => a.eq_ignore_ascii_case(b),
            (MetaValue::Int(a), MetaValue::Text(b)) | (MetaValue::Text(b), MetaValue::Int(a)) => {
                b.trim().parse::<i64>().map(|v| v == *a).unwrap_or(false)
            }
        }
    }
}

impl fmt::Display for MetaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaValue::Int(v) => write!(f, "{}", v),
            MetaValue::Text(v) => write!(f, "{}", v),
        }
    }
}

impl From<&str> for MetaValue {
    fn from(value: &str) -> Self {
        MetaValue::Text(value.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(value: String) -> Self {
        MetaValue::Text(value)
    }
}

impl From<i64> for MetaValue {
    fn from(value: i64) -> Self {
        MetaValue::Int(value)
    }
}

/// Ordered chunk metadata (`source`, `page`, `title`, `doc_id`, ...).
pub type Metadata = BTreeMap<String, MetaValue>;

/// An immutable unit of retrievable text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Stable identifier, also used as the vector-store key.
    pub id: String,
    /// Chunk text.
    pub content: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Chunk {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<MetaValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Which signal produced a candidate's `hybrid_score`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMethod {
    /// Only present in the dense list.
    Dense,
    /// Only present in the sparse list.
    Sparse,
    /// Present in both lists.
    Hybrid,
    /// Dense confidence was too low; raw BM25 order.
    SparseFallback,
    /// Strategy selection chose dense only; raw cosine scores.
    DenseAdaptive,
    /// Strategy selection chose sparse only; raw BM25 scores.
    SparseAdaptive,
}

impl RetrievalMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrievalMethod::Dense => "dense",
            RetrievalMethod::Sparse => "sparse",
            RetrievalMethod::Hybrid => "hybrid",
            RetrievalMethod::SparseFallback => "sparse_fallback",
            RetrievalMethod::DenseAdaptive => "dense_adaptive",
            RetrievalMethod::SparseAdaptive => "sparse_adaptive",
        }
    }
}

impl fmt::Display for RetrievalMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A chunk scored for one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredCandidate {
    pub chunk_id: String,
    pub content: String,
    pub metadata: Metadata,
    /// Normalized dense score (raw cosine for adaptive dense); 0 when absent.
    pub dense_score: f64,
    /// Normalized sparse score (raw BM25 for fallback and adaptive sparse); 0 when absent.
    pub sparse_score: f64,
    pub hybrid_score: f64,
    pub method: RetrievalMethod,
    /// Cross-encoder relevance, set when the rescoring stage ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f64>,
}

impl ScoredCandidate {
    pub fn from_chunk(
        chunk: &Chunk,
        dense_score: f64,
        sparse_score: f64,
        hybrid_score: f64,
        method: RetrievalMethod,
    ) -> Self {
        Self {
            chunk_id: chunk.id.clone(),
            content: chunk.content.clone(),
            metadata: chunk.metadata.clone(),
            dense_score,
            sparse_score,
            hybrid_score,
            method,
            rerank_score: None,
        }
    }
}
