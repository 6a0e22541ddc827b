//! # Adaptive RAG
//!
//! A retrieval service that combines BM25 and dense search, reranks the
//! fused candidates in several stages, and tunes its own parameters from
//! user feedback.
//!
//! The ranking logic lives in the `adaptive-rag-core` crate and does no I/O.
//! This crate wires it to configuration, HTTP providers, on-disk state,
//! and the `arag` CLI.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────────┐   ┌────────────┐   ┌──────────┐
//! │  Query    │──▶│ Orchestrator │──▶│  Fusion    │──▶│  Rerank  │
//! │ Analyzer  │   │  k + filter  │   │ BM25+dense │   │  stages  │
//! └───────────┘   └──────┬───────┘   └────────────┘   └──────────┘
//!                        │ reads
//!                 ┌──────▼───────┐   ┌────────────┐
//!                 │ TuningStore  │◀──│  Feedback  │◀── ratings
//!                 └──────────────┘   │   Tuner    │
//!                                    └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! arag search "Where did Maria work?" --explain
//! arag feedback --session s1 --query "..." --answer "..." --rating negative
//! arag params
//! arag eval cases.json --tune
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`service`] | The assembled service and its operations |
//! | [`orchestrator`] | Per-request k, filter, fusion, and rerank |
//! | [`tuner`] | Feedback log and parameter adjustment |
//! | [`tuning`] | Shared live parameters |
//! | [`monitor`] | Query metrics, health snapshots, alerts |
//! | [`corpus`] | Corpus loading and index construction |
//! | [`embedding`] | OpenAI, Ollama, and local embedders |
//! | [`cross_encoder`] | HTTP and local cross-encoders |
//! | [`llm`] | Ollama text generation |
//! | [`guard`] | Provider deadlines |
//! | [`http`] | Shared HTTP client and retry loop |
//! | [`persist`] | JSON state files |

pub mod config;
pub mod corpus;
pub mod cross_encoder;
pub mod embedding;
pub mod guard;
pub mod http;
pub mod llm;
pub mod monitor;
pub mod orchestrator;
pub mod persist;
pub mod service;
pub mod tuner;
pub mod tuning;
