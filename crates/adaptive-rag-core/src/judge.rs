//! Answer quality scoring.
//!
//! An [`AnswerJudge`] grades a generated answer against its query and the
//! retrieved context on four 0–5 dimensions and derives a 0–1 confidence.
//! The overall score is what feedback records carry as `quality_score`.
//!
//! | Judge | Source of scores | Fails when |
//! |-------|------------------|------------|
//! | [`LlmJudge`] | `FAITHFULNESS: 4` style lines from a [`LanguageModel`] | model errors or the verdict is unparseable |
//! | [`HeuristicJudge`] | word overlap and answer shape | never |
//! | [`FallbackJudge`] | first judge in its chain that succeeds | every judge failed |
//!
//! Confidence combines the overall score, context quality, agreement between
//! the four dimensions, and how much context was available:
//!
//! ```text
//! confidence = overall/5 + 0.3·context_quality + max(0, 0.2 − 0.1·stdev) + min(0.2, 0.05·n)
//! ```
//!
//! clamped to `[0, 1]`.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, RetrievalError};

/// Text generation provider.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, prompt: &str) -> Result<String>;
}

/// Per-dimension quality grades for one answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityScores {
    pub faithfulness: f64,
    pub relevance: f64,
    pub completeness: f64,
    pub clarity: f64,
    pub overall: f64,
    pub confidence: f64,
    pub context_quality: f64,
    /// Name of the judge that produced the grades.
    pub judge: String,
}

/// Grades an answer given its query and context.
#[async_trait]
pub trait AnswerJudge: Send + Sync {
    fn name(&self) -> &str;

    async fn judge(&self, query: &str, answer: &str, context: &[String]) -> Result<QualityScores>;
}

/// The four graded dimensions plus their overall mean.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dimensions {
    pub faithfulness: f64,
    pub relevance: f64,
    pub completeness: f64,
    pub clarity: f64,
    pub overall: f64,
}

impl Dimensions {
    fn values(&self) -> [f64; 4] {
        [self.faithfulness, self.relevance, self.completeness, self.clarity]
    }

    /// Attach context quality and confidence.
    pub fn into_scores(self, query: &str, context: &[String], judge: &str) -> QualityScores {
        let context_quality = context_quality(query, context);
        QualityScores {
            faithfulness: self.faithfulness,
            relevance: self.relevance,
            completeness: self.completeness,
            clarity: self.clarity,
            overall: self.overall,
            confidence: confidence_score(&self, context_quality, context.len()),
            context_quality,
            judge: judge.to_string(),
        }
    }
}

fn word_set(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

fn overlap_fraction(of: &HashSet<String>, within: &HashSet<String>) -> f64 {
    of.intersection(within).count() as f64 / of.len().max(1) as f64
}

/// Mean query-word coverage of the context chunks plus a diversity bonus
/// of up to `0.2`, capped at `1.0`.
pub fn context_quality(query: &str, context: &[String]) -> f64 {
    if context.is_empty() {
        return 0.0;
    }
    let query_words = word_set(query);
    let mean = context
        .iter()
        .map(|chunk| overlap_fraction(&query_words, &word_set(chunk)))
        .sum::<f64>()
        / context.len() as f64;
    let diversity = (context.len() as f64 * 0.05).min(0.2);
    (mean + diversity).min(1.0)
}

fn sample_stdev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    var.sqrt()
}

pub fn confidence_score(dims: &Dimensions, context_quality: f64, context_count: usize) -> f64 {
    let base = dims.overall / 5.0;
    let context_factor = context_quality * 0.3;
    let consistency = (0.2 - sample_stdev(&dims.values()) * 0.1).max(0.0);
    let availability = (context_count as f64 * 0.05).min(0.2);
    (base + context_factor + consistency + availability).clamp(0.0, 1.0)
}

/// Parse `NAME: score` lines. All four dimensions are required; `OVERALL`
/// defaults to their mean. Scores outside `[0, 5]` are ignored.
pub fn parse_verdict(response: &str) -> Option<Dimensions> {
    let mut faithfulness = None;
    let mut relevance = None;
    let mut completeness = None;
    let mut clarity = None;
    let mut overall = None;

    for line in response.lines() {
        let line = line.trim().to_uppercase();
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let Some(score) = value
            .split_whitespace()
            .next()
            .and_then(|v| v.parse::<f64>().ok())
        else {
            continue;
        };
        if !(0.0..=5.0).contains(&score) {
            continue;
        }
        let key = key.trim();
        let slot = if key.starts_with("FAITH") {
            &mut faithfulness
        } else if key.starts_with("RELEV") {
            &mut relevance
        } else if key.starts_with("COMPL") {
            &mut completeness
        } else if key.starts_with("CLAR") {
            &mut clarity
        } else if key.starts_with("OVER") {
            &mut overall
        } else {
            continue;
        };
        *slot = Some(score);
    }

    let (faithfulness, relevance, completeness, clarity) =
        (faithfulness?, relevance?, completeness?, clarity?);
    Some(Dimensions {
        faithfulness,
        relevance,
        completeness,
        clarity,
        overall: overall
            .unwrap_or((faithfulness + relevance + completeness + clarity) / 4.0),
    })
}

/// LLM-as-judge.
pub struct LlmJudge {
    model: Arc<dyn LanguageModel>,
}

impl LlmJudge {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    pub fn prompt(query: &str, answer: &str, context: &[String]) -> String {
        let context_text = if context.is_empty() {
            "No context available".to_string()
        } else {
            context.join("\n\n")
        };
        format!(
            "You are an expert evaluator rating the quality of an assistant's answer. \
             Score each dimension from 0 to 5 (5 is excellent, 0 is very poor).\n\n\
             QUERY: {query}\n\n\
             CONTEXT PROVIDED:\n{context_text}\n\n\
             ANSWER TO EVALUATE:\n{answer}\n\n\
             1. FAITHFULNESS (0-5): How well is the answer grounded in the context?\n\
             2. RELEVANCE (0-5): How relevant is the answer to the query?\n\
             3. COMPLETENESS (0-5): How complete is the answer given the context?\n\
             4. CLARITY (0-5): How clear and understandable is the answer?\n\n\
             Respond in exactly this format:\n\
             FAITHFULNESS: [score]\n\
             RELEVANCE: [score]\n\
             COMPLETENESS: [score]\n\
             CLARITY: [score]\n\
             OVERALL: [average of the four scores]"
        )
    }
}

#[async_trait]
impl AnswerJudge for LlmJudge {
    fn name(&self) -> &str {
        "llm"
    }

    async fn judge(&self, query: &str, answer: &str, context: &[String]) -> Result<QualityScores> {
        let response = self
            .model
            .generate(&Self::prompt(query, answer, context))
            .await?;
        let dims = parse_verdict(&response)
            .ok_or_else(|| RetrievalError::provider(self.model.name(), "unparseable verdict"))?;
        Ok(dims.into_scores(query, context, self.name()))
    }
}

/// Overlap and length heuristics; always produces a verdict.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicJudge;

impl HeuristicJudge {
    pub fn dimensions(query: &str, answer: &str, context: &[String]) -> Dimensions {
        let answer_words = word_set(answer);

        let faithfulness = if context.is_empty() {
            3.0
        } else {
            let context_words = word_set(&context.join(" "));
            (overlap_fraction(&answer_words, &context_words) * 5.0).clamp(1.0, 5.0)
        };

        let relevance = (overlap_fraction(&word_set(query), &answer_words) * 5.0).clamp(1.0, 5.0);

        let word_count = answer.split_whitespace().count();
        let mut completeness: f64 = 3.0;
        if word_count >= 20 {
            completeness += 1.0;
        }
        if context.len() > 1 {
            completeness += 0.5;
        }

        let mut clarity: f64 = 3.0;
        if word_count >= 10 {
            clarity += 0.5;
        }
        if word_count <= 200 {
            clarity += 0.5;
        }
        if answer.matches('.').count() >= 2 {
            clarity += 0.5;
        }

        let completeness = completeness.min(5.0);
        let clarity = clarity.min(5.0);
        Dimensions {
            faithfulness,
            relevance,
            completeness,
            clarity,
            overall: (faithfulness + relevance + completeness + clarity) / 4.0,
        }
    }
}

#[async_trait]
impl AnswerJudge for HeuristicJudge {
    fn name(&self) -> &str {
        "heuristic"
    }

    async fn judge(&self, query: &str, answer: &str, context: &[String]) -> Result<QualityScores> {
        Ok(Self::dimensions(query, answer, context).into_scores(query, context, self.name()))
    }
}

/// Tries each judge in order and returns the first verdict.
pub struct FallbackJudge {
    chain: Vec<Arc<dyn AnswerJudge>>,
}

impl FallbackJudge {
    pub fn new(chain: Vec<Arc<dyn AnswerJudge>>) -> Self {
        Self { chain }
    }

    /// `llm` first when present, heuristics last.
    pub fn with_llm(llm: Option<Arc<dyn LanguageModel>>) -> Self {
        let mut chain: Vec<Arc<dyn AnswerJudge>> = Vec::new();
        if let Some(model) = llm {
            chain.push(Arc::new(LlmJudge::new(model)));
        }
        chain.push(Arc::new(HeuristicJudge));
        Self::new(chain)
    }
}

#[async_trait]
impl AnswerJudge for FallbackJudge {
    fn name(&self) -> &str {
        "fallback"
    }

    async fn judge(&self, query: &str, answer: &str, context: &[String]) -> Result<QualityScores> {
        let mut last_err = RetrievalError::provider("fallback", "no judges configured");
        for judge in &self.chain {
            match judge.judge(query, answer, context).await {
                Ok(scores) => {
                    debug!(judge = judge.name(), overall = scores.overall, "Answer judged");
                    return Ok(scores);
                }
                Err(e) => {
                    warn!(judge = judge.name(), error = %e, "Judge failed, trying next");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CannedModel(&'static str);

    #[async_trait]
    impl LanguageModel for CannedModel {
        fn name(&self) -> &str {
            "canned"
        }

        async fn generate(&self, _prompt: &str) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    fn ctx(chunks: &[&str]) -> Vec<String> {
        chunks.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_verdict_with_overall() {
        let dims = parse_verdict(
            "Faithfulness: 4\nRelevance: 5 (direct)\nCompleteness: 3\nClarity: 4\nOverall: 4.2",
        )
        .unwrap();
        assert_eq!(dims.relevance, 5.0);
        assert_eq!(dims.overall, 4.2);
    }

    #[test]
    fn test_parse_verdict_computes_missing_overall() {
        let dims =
            parse_verdict("FAITHFULNESS: 4\nRELEVANCE: 4\nCOMPLETENESS: 2\nCLARITY: 2").unwrap();
        assert_eq!(dims.overall, 3.0);
    }

    #[test]
    fn test_parse_verdict_rejects_incomplete_or_out_of_range() {
        assert!(parse_verdict("FAITHFULNESS: 4\nRELEVANCE: 4").is_none());
        assert!(parse_verdict("FAITHFULNESS: 9\nRELEVANCE: 4\nCOMPLETENESS: 2\nCLARITY: 2").is_none());
        assert!(parse_verdict("Great answer!").is_none());
    }

    #[test]
    fn test_heuristic_scores_within_bounds() {
        let long = "word ".repeat(300);
        let cases = [
            ("", "", ctx(&[])),
            ("what did they do at pwc", "Audit analytics at PwC.", ctx(&["internship at pwc"])),
            ("q", long.as_str(), ctx(&["a", "b", "c", "d", "e"])),
        ];
        for (query, answer, context) in cases {
            let d = HeuristicJudge::dimensions(query, answer, &context);
            for v in d.values().into_iter().chain([d.overall]) {
                assert!((0.0..=5.0).contains(&v), "{v}");
            }
            let c = confidence_score(&d, context_quality(query, &context), context.len());
            assert!((0.0..=1.0).contains(&c));
        }
    }

    #[test]
    fn test_heuristic_completeness_and_clarity() {
        let answer = "The person completed a summer internship at PwC. \
                      They worked on audit analytics for several large clients in the region.";
        let d = HeuristicJudge::dimensions("pwc", answer, &ctx(&["a", "b"]));
        assert_eq!(d.completeness, 4.5);
        assert_eq!(d.clarity, 4.5);
    }

    #[test]
    fn test_context_quality() {
        assert_eq!(context_quality("pwc audit", &[]), 0.0);
        let q = context_quality("pwc audit", &ctx(&["pwc audit team", "tesla"]));
        // mean 0.5 + diversity 0.1
        assert!((q - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_confidence_rewards_consistency() {
        let even = Dimensions {
            faithfulness: 4.0,
            relevance: 4.0,
            completeness: 4.0,
            clarity: 4.0,
            overall: 4.0,
        };
        // 0.8 + 0 + 0.2 + 0
        assert!((confidence_score(&even, 0.0, 0) - 1.0).abs() < 1e-9);
        let low = Dimensions { overall: 1.0, ..even };
        assert!((confidence_score(&low, 0.0, 2) - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_llm_judge_parses_model_output() {
        let judge = LlmJudge::new(Arc::new(CannedModel(
            "FAITHFULNESS: 5\nRELEVANCE: 5\nCOMPLETENESS: 5\nCLARITY: 5",
        )));
        let scores = judge.judge("q", "a", &[]).await.unwrap();
        assert_eq!(scores.overall, 5.0);
        assert_eq!(scores.judge, "llm");
    }

    #[tokio::test]
    async fn test_fallback_uses_heuristics_on_unparseable_verdict() {
        let judge = FallbackJudge::with_llm(Some(Arc::new(CannedModel("looks fine to me"))));
        let scores = judge.judge("pwc", "Audit work at PwC.", &ctx(&["pwc"])).await.unwrap();
        assert_eq!(scores.judge, "heuristic");
    }

    #[tokio::test]
    async fn test_empty_chain_errors() {
        let judge = FallbackJudge::new(Vec::new());
        assert!(judge.judge("q", "a", &[]).await.is_err());
    }
}
