//! # Adaptive RAG CLI (`arag`)
//!
//! The `arag` binary runs the retrieval service for one command at a time.
//! Tuner and monitor state persist in `storage.data_dir`, so ratings given in
//! one invocation shape the parameters of the next.
//!
//! ## Usage
//!
//! ```bash
//! arag --config ./config/arag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `arag search "<query>"` | Retrieve and rerank chunks for a query |
//! | `arag analyze "<query>"` | Show query type, complexity, and suggested k |
//! | `arag ask "<query>"` | Answer from retrieved sources, then check citations and grade it |
//! | `arag feedback ...` | Record a rating; may adjust parameters |
//! | `arag params` | Print the live tuning parameters |
//! | `arag summary` | Feedback statistics for a time window |
//! | `arag health` | Take a health snapshot and list open alerts |
//! | `arag eval <cases.json>` | precision@k, recall@k, MRR over labelled queries |
//!
//! ## Examples
//!
//! ```bash
//! # Search with the stage trace
//! arag search "Where did Maria work?" --explain
//!
//! # Narrow to one document type
//! arag search "renewable energy" --filter doc_type=report --k 3
//!
//! # Rate an answer
//! arag feedback --session s1 --query "Where did Maria work?" \
//!     --answer "At PwC." --rating positive --k 5 --threshold 0.7
//!
//! # Evaluate and grid-search the dense weight
//! arag eval ./demos/cases.json --tune
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use adaptive_rag::config;
use adaptive_rag::orchestrator::RetrievalResponse;
use adaptive_rag::service::RagService;
use adaptive_rag::tuner::{NewFeedback, Rating, TuningDecision};
use adaptive_rag_core::evaluation::{self, EvalCase, WeightGrid};
use adaptive_rag_core::filter::MetadataFilter;
use adaptive_rag_core::models::MetaValue;

/// Adaptive RAG CLI: hybrid retrieval with feedback-driven tuning.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/arag.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "arag",
    about = "Adaptive RAG: hybrid BM25 + dense retrieval with reranking and feedback tuning",
    version,
    long_about = "Adaptive RAG fuses BM25 and dense similarity, reranks candidates with a \
    cross-encoder, keyword overlap, clustering, and coherence checks, and adjusts retrieval_k \
    and rerank_threshold from user ratings."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/arag.toml`. Corpus, provider, tuner, and
    /// monitor settings are read from this file.
    #[arg(long, global = true, default_value = "./config/arag.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Retrieve chunks for a query.
    ///
    /// Runs query analysis, hybrid fusion (or the BM25 fallback), metadata
    /// filtering, and the rerank stages, then prints the ranked chunks.
    Search {
        query: String,

        /// Number of results. Defaults to the analyzer's suggestion or the
        /// tuned `retrieval_k`.
        #[arg(long)]
        k: Option<usize>,

        /// Metadata criterion `key=value`; repeatable, all must match.
        #[arg(long = "filter", value_parser = parse_filter)]
        filters: Vec<(String, MetaValue)>,

        /// Print query analysis, the filter applied, and each rerank stage.
        #[arg(long)]
        explain: bool,
    },

    /// Classify a query without retrieving anything.
    Analyze { query: String },

    /// Answer from source-anchored context with the LLM, then check its citations.
    ///
    /// Requires `[llm] provider` to be set.
    Ask {
        query: String,

        #[arg(long)]
        k: Option<usize>,
    },

    /// Record a rating for an answer.
    ///
    /// Pass the `k` and threshold the answer was produced with; the tuner
    /// groups feedback by them when deciding adjustments.
    Feedback {
        #[arg(long)]
        session: String,

        #[arg(long)]
        query: String,

        #[arg(long)]
        answer: String,

        /// `positive` or `negative`.
        #[arg(long)]
        rating: Rating,

        #[arg(long)]
        k: usize,

        #[arg(long)]
        threshold: f64,

        #[arg(long, default_value = "hybrid")]
        method: String,

        /// Quality score on a 0-5 scale.
        #[arg(long)]
        quality: Option<f64>,

        /// Confidence on a 0-1 scale.
        #[arg(long)]
        confidence: Option<f64>,

        /// Answer latency in seconds.
        #[arg(long)]
        response_time: Option<f64>,

        #[arg(long)]
        comment: Option<String>,
    },

    /// Print the live tuning parameters.
    Params,

    /// Feedback statistics and recent adjustments.
    Summary {
        /// Window length in hours.
        #[arg(long, default_value_t = 24.0)]
        hours: f64,
    },

    /// Take a health snapshot and list unresolved alerts.
    Health,

    /// Evaluate retrieval over labelled queries.
    ///
    /// The cases file is a JSON array of
    /// `{"query": "...", "relevant": ["chunk-id"], "expected_phrase": "..."}`.
    Eval {
        cases: PathBuf,

        /// Cutoffs for precision@k and recall@k.
        #[arg(long = "k", value_delimiter = ',', default_values_t = [1, 3, 5, 10])]
        k_values: Vec<usize>,

        /// Also grid-search the dense weight by precision@10.
        #[arg(long)]
        tune: bool,
    },
}

fn parse_filter(s: &str) -> Result<(String, MetaValue), String> {
    MetadataFilter::parse_criterion(s)
        .ok_or_else(|| format!("invalid KEY=VALUE filter: '{}'", s))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init()
        .ok();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    // Analysis needs no corpus or providers.
    if let Commands::Analyze { query } = &cli.command {
        let analysis = adaptive_rag_core::analyzer::QueryAnalyzer::new().analyze(query);
        println!("{}", serde_json::to_string_pretty(&analysis)?);
        return Ok(());
    }

    let service = RagService::from_config(cfg).await?;
    let result = run(&service, cli.command).await;
    service.shutdown().await;
    result
}

async fn run(service: &RagService, command: Commands) -> Result<()> {
    match command {
        Commands::Search {
            query,
            k,
            filters,
            explain,
        } => {
            let filter = (!filters.is_empty()).then(|| {
                filters
                    .into_iter()
                    .fold(MetadataFilter::new(), |f, (key, value)| f.with(key, value))
            });
            let response = service.retrieve(&query, k, filter).await?;
            if explain {
                print_explain(&response)?;
            }
            print_candidates(&response);
        }
        Commands::Analyze { .. } => {
            // Handled in main before the service is built
            unreachable!()
        }
        Commands::Ask { query, k } => {
            let response = service.retrieve(&query, k, None).await?;
            let context: Vec<String> = response
                .candidates
                .iter()
                .map(|c| c.content.clone())
                .collect();
            let answer = service.generate_answer(&query, &response.candidates).await?;
            let scores = service.judge_answer(&query, &answer.text, &context).await?;

            println!("{}", answer.text.trim());
            println!();
            let citations = &answer.citations;
            println!(
                "citations: accuracy {:.2}  valid {}  invalid {}  missing {}",
                citations.accuracy,
                citations.valid.len(),
                citations.invalid.len(),
                citations.missing.len()
            );
            for recommendation in &citations.recommendations {
                println!("  - {}", recommendation);
            }
            println!(
                "quality: {:.2}/5  confidence: {:.2}  judge: {}",
                scores.overall, scores.confidence, scores.judge
            );
            println!(
                "retrieval: k={} threshold={:.2} method={}",
                response.k,
                response.parameters.rerank_threshold,
                method_of(&response)
            );
        }
        Commands::Feedback {
            session,
            query,
            answer,
            rating,
            k,
            threshold,
            method,
            quality,
            confidence,
            response_time,
            comment,
        } => {
            let mut feedback = NewFeedback::new(session, query, answer, rating, method, k, threshold);
            if let Some(q) = quality {
                feedback = feedback.with_quality(q);
            }
            if let Some(c) = confidence {
                feedback = feedback.with_confidence(c);
            }
            feedback.response_time = response_time;
            feedback.user_comment = comment;

            let outcome = service.submit_feedback(feedback).await;
            println!("Recorded feedback {}", outcome.feedback_id);
            match outcome.decision {
                TuningDecision::InsufficientData { recent, required } => {
                    println!("No tuning yet: {} of {} ratings in window", recent, required);
                }
                TuningDecision::Cooldown { remaining_secs } => {
                    println!("Tuning on cooldown for {} more minutes", (remaining_secs + 59) / 60);
                }
                TuningDecision::NoChange => println!("Parameters unchanged"),
                TuningDecision::Adjusted { adjustments } => {
                    for adj in adjustments {
                        println!(
                            "Adjusted {}: {} -> {} ({})",
                            adj.parameter_name, adj.old_value, adj.new_value, adj.reason
                        );
                    }
                }
            }
        }
        Commands::Params => {
            println!("{}", serde_json::to_string_pretty(&service.tuning_parameters())?);
        }
        Commands::Summary { hours } => {
            let summary = service.feedback_summary(hours).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Health => {
            let summary = service.feedback_summary(24.0).await?;
            service.monitor().take_snapshot(Some(&summary));
            println!("{}", serde_json::to_string_pretty(&service.health())?);
        }
        Commands::Eval {
            cases,
            k_values,
            tune,
        } => {
            let cases = load_cases(&cases)?;
            let weight = service.tuning_parameters().hybrid_weight;
            let metrics = evaluation::evaluate(service.engine(), &cases, &k_values, weight).await?;

            println!("Evaluated {} queries (dense weight {:.2})", metrics.queries, weight);
            for (k, precision) in &metrics.precision {
                let recall = metrics.recall.get(k).copied().unwrap_or_default();
                println!("  @{:<3} precision {:.3}  recall {:.3}", k, precision, recall);
            }
            println!("  MRR {:.3}", metrics.mrr);
            if let Some(phrase_recall) = metrics.phrase_recall {
                println!("  phrase recall {:.3}", phrase_recall);
            }

            if tune {
                let tuning = evaluation::tune_hybrid_weights(
                    service.engine(),
                    &cases,
                    WeightGrid::default(),
                    weight,
                )
                .await?;
                println!();
                for (w, score) in &tuning.scores {
                    println!("  weight {:.1}  precision@10 {:.3}", w, score);
                }
                println!(
                    "Best dense weight: {:.2} (precision@10 {:.3})",
                    tuning.best_weight, tuning.best_score
                );
            }
        }
    }
    Ok(())
}

fn load_cases(path: &Path) -> Result<Vec<EvalCase>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read cases file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse cases file: {}", path.display()))
}

fn method_of(response: &RetrievalResponse) -> &'static str {
    response
        .candidates
        .first()
        .map(|c| c.method.as_str())
        .unwrap_or("none")
}

fn print_explain(response: &RetrievalResponse) -> Result<()> {
    let analysis = &response.analysis;
    println!(
        "query: type={} complexity={} suggested_k={} confidence={:.2}",
        analysis.query_type, analysis.complexity, analysis.optimal_k, analysis.confidence
    );
    println!(
        "params: k={} threshold={:.2} dense_weight={:.2} candidates={}",
        response.k,
        response.parameters.rerank_threshold,
        response.parameters.hybrid_weight,
        response.candidates_retrieved
    );
    if let Some(applied) = &response.filter_applied {
        println!("filter: {}", serde_json::to_string(applied)?);
    }
    for stage in &response.report.stages {
        println!(
            "stage {:<14} {:>3} -> {:<3} {}",
            stage.stage,
            stage.input,
            stage.output,
            serde_json::to_string(&stage.outcome)?
        );
    }
    println!();
    Ok(())
}

fn print_candidates(response: &RetrievalResponse) {
    if response.candidates.is_empty() {
        println!("No results.");
        return;
    }

    for (i, candidate) in response.candidates.iter().enumerate() {
        println!(
            "{}. [{:.3}] {} ({})",
            i + 1,
            candidate.hybrid_score,
            candidate.chunk_id,
            candidate.method.as_str()
        );
        if let Some(score) = candidate.rerank_score {
            println!("    rerank: {:.3}", score);
        }
        if !candidate.metadata.is_empty() {
            let meta: Vec<String> = candidate
                .metadata
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            println!("    metadata: {}", meta.join(", "));
        }
        println!("    excerpt: \"{}\"", excerpt(&candidate.content, 160));
        println!();
    }
}

fn excerpt(content: &str, max_chars: usize) -> String {
    let flat = content.replace('\n', " ");
    let flat = flat.trim();
    match flat.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &flat[..idx]),
        None => flat.to_string(),
    }
}
