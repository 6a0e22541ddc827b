//! Heuristic query classification.
//!
//! [`QueryAnalyzer::analyze`] maps a query to a [`QueryAnalysis`]: its type,
//! its complexity, and the retrieval breadth and chunking hints derived from
//! both. Classification is a pure function of the query and the static rule
//! tables below; the analyzer holds no mutable state.
//!
//! # Type rules (first type with any matching pattern wins)
//!
//! | Priority | Type | Cues |
//! |----------|------|------|
//! | 1 | Definition | `what is`, `define`, `meaning`, `stands for` |
//! | 2 | Summary | `summarize`, `describe`, `compare`, `versus` |
//! | 3 | Reasoning | `why`, `how`, `impact`, `strategy` |
//! | 4 | Entity | `who`/`when`/`where`/`which` (not before `is`), `role`, `what did` |
//! | 5 | Factual | default |
//!
//! Type confidence is `min(matching patterns / 2, 1)`; Factual is `0.5`.
//!
//! # Breadth
//!
//! `optimal_k = clamp(⌊base_k(type) × multiplier(complexity)⌋, 2, 15)`
//!
//! | Type | base_k | chunk size / overlap |
//! |------|--------|----------------------|
//! | Entity, Factual | 3 | 600 / 200 |
//! | Definition | 2 | 600 / 200 |
//! | Summary | 6 | 900 / 350 |
//! | Reasoning | 7 | 1200 / 400 |
//!
//! Multipliers: Simple ×0.8, Medium ×1.0, Complex ×1.5 for `k`; chunk hints
//! scale ×0.8 (Simple) and ×1.2 (Complex).

use std::fmt;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::text::{dedup_ordered, is_stopword};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    Entity,
    Factual,
    Definition,
    Summary,
    Reasoning,
}

impl QueryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryType::Entity => "entity",
            QueryType::Factual => "factual",
            QueryType::Definition => "definition",
            QueryType::Summary => "summary",
            QueryType::Reasoning => "reasoning",
        }
    }

    fn base_k(&self) -> usize {
        match self {
            QueryType::Entity | QueryType::Factual => 3,
            QueryType::Definition => 2,
            QueryType::Summary => 6,
            QueryType::Reasoning => 7,
        }
    }

    fn base_chunking(&self) -> (usize, usize) {
        match self {
            QueryType::Entity | QueryType::Factual | QueryType::Definition => (600, 200),
            QueryType::Summary => (900, 350),
            QueryType::Reasoning => (1200, 400),
        }
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    Medium,
    Complex,
}

impl Complexity {
    /// `k` multiplier as an exact fraction.
    fn k_multiplier(&self) -> (usize, usize) {
        match self {
            Complexity::Simple => (4, 5),
            Complexity::Medium => (1, 1),
            Complexity::Complex => (3, 2),
        }
    }

    fn chunk_multiplier(&self) -> (usize, usize) {
        match self {
            Complexity::Simple => (4, 5),
            Complexity::Medium => (1, 1),
            Complexity::Complex => (6, 5),
        }
    }
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Complexity::Simple => "simple",
            Complexity::Medium => "medium",
            Complexity::Complex => "complex",
        })
    }
}

/// Retrieval hints for one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryAnalysis {
    pub query_type: QueryType,
    pub complexity: Complexity,
    /// Retrieval breadth in `[2, 15]`.
    pub optimal_k: usize,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub confidence: f64,
    pub entities: Vec<String>,
    pub keywords: Vec<String>,
}

/// Optional named-entity recognizer.
pub trait EntityRecognizer: Send + Sync {
    /// People, organizations, places, and dates mentioned in `text`.
    fn entities(&self, text: &str) -> Vec<String>;
}

/// One pattern, optionally vetoed by what directly follows the match.
struct Pattern {
    regex: Regex,
    not_followed_by: Option<Regex>,
}

impl Pattern {
    fn new(pattern: &str) -> Self {
        Self {
            regex: Regex::new(pattern).unwrap(),
            not_followed_by: None,
        }
    }

    fn unless_followed_by(mut self, pattern: &str) -> Self {
        self.not_followed_by = Some(Regex::new(pattern).unwrap());
        self
    }

    fn is_match(&self, text: &str) -> bool {
        match &self.not_followed_by {
            None => self.regex.is_match(text),
            Some(veto) => self
                .regex
                .find_iter(text)
                .any(|m| !veto.is_match(&text[m.end()..])),
        }
    }
}

fn count_matches(patterns: &[Pattern], text: &str) -> usize {
    patterns.iter().filter(|p| p.is_match(text)).count()
}

struct TypeRule {
    query_type: QueryType,
    patterns: Vec<Pattern>,
}

static TYPE_RULES: LazyLock<Vec<TypeRule>> = LazyLock::new(|| {
    vec![
        TypeRule {
            query_type: QueryType::Definition,
            patterns: vec![
                Pattern::new(r"\b(what is|what does|define|definition|meaning)\b"),
                Pattern::new(r"\b(means|refers to|stands for)\b"),
            ],
        },
        TypeRule {
            query_type: QueryType::Summary,
            patterns: vec![
                Pattern::new(r"\b(summarize|summary|overview)\b"),
                Pattern::new(r"\b(tell me about|describe|explain)\b"),
                Pattern::new(r"\b(compare|comparison|differences|similarities|versus|vs)\b"),
            ],
        },
        TypeRule {
            query_type: QueryType::Reasoning,
            patterns: vec![
                Pattern::new(r"\b(why|how|analyze|analysis|reason|because)\b"),
                Pattern::new(r"\b(relationship|impact|effect|cause|result)\b"),
                Pattern::new(r"\b(strategy|approach|methodology|process)\b"),
            ],
        },
        TypeRule {
            query_type: QueryType::Entity,
            patterns: vec![
                Pattern::new(r"\b(who|when|where|which)\b").unless_followed_by(r"^\s+is\b"),
                Pattern::new(
                    r"\b(name|title|position|role|worked|experience|education|background)\b",
                ),
                Pattern::new(r"\bwhat\s+(position|job|role|title)\b"),
                Pattern::new(r"\bwhat\s+did\b"),
            ],
        },
    ]
});

static COMPLEX_INDICATORS: LazyLock<Vec<Pattern>> = LazyLock::new(|| {
    vec![
        Pattern::new(r"\b(compare|contrast|analyze|evaluate|synthesize)\b"),
        Pattern::new(r"\b(multiple|several|various|different)\b"),
        Pattern::new(r"\b(relationship|correlation|impact|effect)\b"),
        Pattern::new(r"\band\b.*\band\b"),
        Pattern::new(r"\bor\b.*\bor\b"),
    ]
});

static SIMPLE_INDICATORS: LazyLock<Vec<Pattern>> = LazyLock::new(|| {
    vec![
        Pattern::new(r"^\s*\b(who|what|when|where|which)\b.*\??\s*$"),
        Pattern::new(r"^\s*.{1,50}\s*\??\s*$"),
    ]
});

static KEYWORD_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b[a-zA-Z]{3,}\b").unwrap());

/// Stateless query classifier.
#[derive(Clone, Default)]
pub struct QueryAnalyzer {
    recognizer: Option<Arc<dyn EntityRecognizer>>,
}

impl QueryAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_recognizer(recognizer: Arc<dyn EntityRecognizer>) -> Self {
        Self {
            recognizer: Some(recognizer),
        }
    }

    pub fn analyze(&self, query: &str) -> QueryAnalysis {
        let (query_type, type_confidence) = classify_type(query);
        let (complexity, complexity_confidence) = classify_complexity(query);
        let (chunk_size, chunk_overlap) = chunking_for(query_type, complexity);

        QueryAnalysis {
            query_type,
            complexity,
            optimal_k: optimal_k(query_type, complexity),
            chunk_size,
            chunk_overlap,
            confidence: (type_confidence + complexity_confidence) / 2.0,
            entities: self.entities(query),
            keywords: extract_keywords(query),
        }
    }

    fn entities(&self, query: &str) -> Vec<String> {
        match &self.recognizer {
            Some(recognizer) => dedup_ordered(recognizer.entities(query)),
            None => capitalized_words(query),
        }
    }
}

/// Query type and its confidence.
pub fn classify_type(query: &str) -> (QueryType, f64) {
    let lower = query.to_lowercase();
    TYPE_RULES
        .iter()
        .find_map(|rule| {
            let matches = count_matches(&rule.patterns, &lower);
            (matches > 0).then(|| (rule.query_type, (matches as f64 / 2.0).min(1.0)))
        })
        .unwrap_or((QueryType::Factual, 0.5))
}

/// Query complexity and its confidence.
pub fn classify_complexity(query: &str) -> (Complexity, f64) {
    let lower = query.to_lowercase();
    let words = query.split_whitespace().count();
    let simple = count_matches(&SIMPLE_INDICATORS, &lower);
    let complex = count_matches(&COMPLEX_INDICATORS, &lower);

    if simple > 0 && words <= 10 {
        (Complexity::Simple, 0.8)
    } else if complex >= 2 || words > 25 {
        (Complexity::Complex, 0.8)
    } else {
        (Complexity::Medium, 0.6)
    }
}

pub fn optimal_k(query_type: QueryType, complexity: Complexity) -> usize {
    let (num, den) = complexity.k_multiplier();
    (query_type.base_k() * num / den).clamp(2, 15)
}

/// Suggested `(chunk_size, chunk_overlap)`.
pub fn chunking_for(query_type: QueryType, complexity: Complexity) -> (usize, usize) {
    let (size, overlap) = query_type.base_chunking();
    let (num, den) = complexity.chunk_multiplier();
    (size * num / den, overlap * num / den)
}

/// Capitalized, non-stopword words with surrounding punctuation removed.
pub fn capitalized_words(query: &str) -> Vec<String> {
    dedup_ordered(
        query
            .split_whitespace()
            .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
            .filter(|w| w.chars().next().is_some_and(|c| c.is_uppercase()))
            .filter(|w| !is_stopword(&w.to_lowercase()))
            .map(str::to_string),
    )
}

/// Lowercased alphabetic words of three or more letters, minus stopwords.
pub fn extract_keywords(query: &str) -> Vec<String> {
    let lower = query.to_lowercase();
    dedup_ordered(
        KEYWORD_RE
            .find_iter(&lower)
            .map(|m| m.as_str())
            .filter(|w| !is_stopword(w))
            .map(str::to_string),
    )
}
