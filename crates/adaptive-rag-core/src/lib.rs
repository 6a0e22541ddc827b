//! # Adaptive RAG Core
//!
//! Retrieval and ranking logic shared by the `arag` service: BM25, hybrid
//! dense + sparse fusion, the rerank pipeline, query analysis, answer
//! judging, and offline evaluation.
//!
//! This crate does no file or network I/O. Embedding models, cross-encoders,
//! language models, and vector stores are reached through the async traits in
//! [`dense`], [`rerank::cross_encoder`], and [`judge`].
//!
//! | Module | Role |
//! |--------|------|
//! | [`sparse`] | BM25 index with copy-on-write refits |
//! | [`dense`] | Embedding and vector search seam |
//! | [`fusion`] | Score fusion, sparse fallback, strategy selection |
//! | [`rerank`] | Cross-encoder, keyword overlap, clustering, coherence |
//! | [`analyzer`] | Query type, complexity, and breadth hints |
//! | [`filter`] | Metadata filters and intent rules |
//! | [`judge`] | Answer quality scoring |
//! | [`attribution`] | Source-anchored prompts and citation checks |
//! | [`evaluation`] | precision@k, recall@k, MRR, weight search |

pub mod analyzer;
pub mod attribution;
pub mod cancel;
pub mod dense;
pub mod error;
pub mod evaluation;
pub mod filter;
pub mod fusion;
pub mod judge;
pub mod models;
pub mod rerank;
pub mod sparse;
pub mod text;

pub use error::{Result, RetrievalError};
