//! Source anchoring for generated answers.
//!
//! Each passage handed to a language model is wrapped in a label built
//! from its `source`, `page` and `title` metadata:
//!
//! ```text
//! [SOURCE: pwc_internship.txt | PAGE: 2 | TITLE: CV | ID: pwc]
//!
//! The person completed a summer internship at PwC ...
//!
//! [SOURCE: pwc_internship.txt | PAGE: 2 | TITLE: CV | ID: pwc]
//! ```
//!
//! After generation, [`validate_citations`] compares the sources the
//! answer names against the passages it was given:
//!
//! | Bucket | Meaning |
//! |--------|---------|
//! | valid | mentioned and present in the context |
//! | invalid | mentioned but matching no passage |
//! | missing | not mentioned, yet the answer reuses more than 15% of its words |

use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::LazyLock;

use crate::models::{MetaValue, ScoredCandidate};
use crate::text::is_stopword;

const SNIPPET_CHARS: usize = 150;
/// Share of a passage's long words an answer must reuse to count as drawing on it.
const USED_OVERLAP: f64 = 0.15;
const MAX_THEMES: usize = 10;

static CITATION_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\[SOURCE:\s*([^\]]+)\]",
        r"(?i)according to ([^,\n]+)",
        r"(?i)as stated in ([^,\n]+)",
        r"(?i)based on ([^,\n]+)",
        r"(?i)(?:^|[^\[\w])source:\s*([^,\n\]]+)",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});
static LONG_WORD_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\w{4,}\b").unwrap());
static THEME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Z][a-z]+\b|\b\w{5,}\b").unwrap());

/// Where a passage came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceAnchor {
    pub chunk_id: String,
    pub source: String,
    pub page: Option<i64>,
    pub title: Option<String>,
    pub snippet: String,
}

fn meta_text(candidate: &ScoredCandidate, key: &str) -> Option<String> {
    candidate
        .metadata
        .get(key)
        .map(|v| v.to_string())
        .filter(|v| !v.trim().is_empty())
}

impl SourceAnchor {
    pub fn of(candidate: &ScoredCandidate) -> Self {
        let page = match candidate.metadata.get("page") {
            Some(MetaValue::Int(p)) => Some(*p),
            Some(MetaValue::Text(p)) => p.trim().parse().ok(),
            None => None,
        };
        let snippet = if candidate.content.chars().count() > SNIPPET_CHARS {
            let head: String = candidate.content.chars().take(SNIPPET_CHARS).collect();
            format!("{head}...")
        } else {
            candidate.content.clone()
        };
        Self {
            chunk_id: candidate.chunk_id.clone(),
            source: meta_text(candidate, "source").unwrap_or_else(|| "Unknown".to_string()),
            page,
            title: meta_text(candidate, "title"),
            snippet,
        }
    }

    /// `[SOURCE: file | PAGE: n | TITLE: t | ID: chunk]`
    pub fn label(&self) -> String {
        let mut label = format!("[SOURCE: {}", self.source);
        if let Some(page) = self.page {
            label.push_str(&format!(" | PAGE: {page}"));
        }
        if let Some(title) = &self.title {
            label.push_str(&format!(" | TITLE: {title}"));
        }
        label.push_str(&format!(" | ID: {}]", self.chunk_id));
        label
    }

    /// One line for the prompt's source list.
    fn listing(&self) -> String {
        let mut line = format!("- {}", self.source);
        if let Some(page) = self.page {
            line.push_str(&format!(" (Page {page})"));
        }
        if let Some(title) = &self.title {
            line.push_str(&format!(" - {title}"));
        }
        line
    }

    fn matches(&self, mentioned: &str) -> bool {
        let mentioned = mentioned.to_lowercase();
        let source = self.source.to_lowercase();
        if source.contains(&mentioned) || mentioned.contains(&source) {
            return true;
        }
        if let Some(title) = &self.title {
            let title = title.to_lowercase();
            if title.contains(&mentioned) || mentioned.contains(&title) {
                return true;
            }
        }
        mentioned.contains(&self.chunk_id.to_lowercase())
    }
}

/// Passage text wrapped in its source label, before and after.
pub fn anchored_passage(candidate: &ScoredCandidate) -> String {
    let label = SourceAnchor::of(candidate).label();
    format!("{label}\n\n{}\n\n{label}", candidate.content)
}

/// Two sources sharing significant terms.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CrossReference {
    pub first: String,
    pub second: String,
    pub themes: Vec<String>,
}

fn themes(texts: &[&str]) -> BTreeSet<String> {
    texts
        .iter()
        .flat_map(|t| THEME_RE.find_iter(t))
        .map(|m| m.as_str().to_lowercase())
        .filter(|w| w.len() > 3 && !is_stopword(w))
        .collect()
}

/// Pairs of distinct sources whose passages share themes.
pub fn cross_references(candidates: &[ScoredCandidate]) -> Vec<CrossReference> {
    let mut by_source: BTreeMap<String, Vec<&str>> = BTreeMap::new();
    for c in candidates {
        by_source
            .entry(SourceAnchor::of(c).source)
            .or_default()
            .push(c.content.as_str());
    }
    let sources: Vec<(String, BTreeSet<String>)> = by_source
        .into_iter()
        .map(|(source, texts)| (source, themes(&texts)))
        .collect();

    let mut refs = Vec::new();
    for (i, (first, a)) in sources.iter().enumerate() {
        for (second, b) in &sources[i + 1..] {
            let shared: Vec<String> = a.intersection(b).take(MAX_THEMES).cloned().collect();
            if !shared.is_empty() {
                refs.push(CrossReference {
                    first: first.clone(),
                    second: second.clone(),
                    themes: shared,
                });
            }
        }
    }
    refs
}

/// Prompt that lists the sources, their overlaps, and the anchored
/// passages, and asks for `[SOURCE: ...]` citations.
pub fn source_aware_prompt(query: &str, candidates: &[ScoredCandidate]) -> String {
    let sources: Vec<String> = candidates.iter().map(|c| SourceAnchor::of(c).listing()).collect();
    let refs = cross_references(candidates);
    let refs = if refs.is_empty() {
        "None detected; the sources appear to cover different topics.".to_string()
    } else {
        refs.iter()
            .map(|r| {
                let shown: Vec<&str> = r.themes.iter().take(5).map(String::as_str).collect();
                format!("- {} <-> {}: common themes include {}", r.first, r.second, shown.join(", "))
            })
            .collect::<Vec<_>>()
            .join("\n")
    };
    let passages: Vec<String> = candidates.iter().map(anchored_passage).collect();

    format!(
        "Answer the question using only the sources below.\n\
         Cite every factual claim as [SOURCE: filename | PAGE: n].\n\
         Cite each source separately when comparing them, and say so when they disagree.\n\
         If the sources do not contain the answer, say so.\n\n\
         # Sources\n{}\n\n\
         # Cross-document references\n{}\n\n\
         # Context\n{}\n\n\
         # Question\n{}\n\n\
         # Answer\n",
        sources.join("\n"),
        refs,
        passages.join("\n\n"),
        query
    )
}

/// Outcome of [`validate_citations`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CitationReport {
    pub valid: Vec<SourceAnchor>,
    pub invalid: Vec<String>,
    pub missing: Vec<SourceAnchor>,
    /// Distinct cited passages over passages supplied; 0 with no context.
    pub accuracy: f64,
    pub recommendations: Vec<String>,
}

/// Source names an answer cites, in order of appearance, deduplicated.
pub fn mentioned_sources(answer: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut hits: Vec<(usize, String)> = CITATION_RES
        .iter()
        .flat_map(|re| re.captures_iter(answer))
        .filter_map(|caps| caps.get(1))
        .map(|m| {
            let text = m.as_str().trim().trim_matches(|c| matches!(c, '"' | '\'' | '.'));
            (m.start(), text.trim().to_string())
        })
        .filter(|(_, text)| !text.is_empty())
        .collect();
    hits.sort_by_key(|(start, _)| *start);
    hits.into_iter()
        .map(|(_, text)| text)
        .filter(|text| seen.insert(text.to_lowercase()))
        .collect()
}

fn long_words(text: &str) -> HashSet<String> {
    LONG_WORD_RE
        .find_iter(&text.to_lowercase())
        .map(|m| m.as_str().to_string())
        .collect()
}

fn appears_used(answer_words: &HashSet<String>, content: &str) -> bool {
    let words = long_words(content);
    if words.is_empty() {
        return false;
    }
    let shared = words.intersection(answer_words).count();
    shared as f64 / words.len() as f64 > USED_OVERLAP
}

/// Check the citations in `answer` against the passages it was built from.
pub fn validate_citations(answer: &str, candidates: &[ScoredCandidate]) -> CitationReport {
    let anchors: Vec<SourceAnchor> = candidates.iter().map(SourceAnchor::of).collect();
    let mentioned = mentioned_sources(answer);

    let mut report = CitationReport::default();
    let mut cited: HashSet<usize> = HashSet::new();
    for mention in &mentioned {
        match anchors.iter().position(|a| a.matches(mention)) {
            Some(i) => {
                if cited.insert(i) {
                    report.valid.push(anchors[i].clone());
                }
            }
            None => report.invalid.push(mention.clone()),
        }
    }

    let answer_words = long_words(answer);
    for (i, (anchor, candidate)) in anchors.iter().zip(candidates).enumerate() {
        let named = mentioned.iter().any(|m| anchor.matches(m));
        if !named && !cited.contains(&i) && appears_used(&answer_words, &candidate.content) {
            report.missing.push(anchor.clone());
        }
    }

    report.accuracy = if anchors.is_empty() {
        0.0
    } else {
        cited.len() as f64 / anchors.len() as f64
    };
    report.recommendations = recommendations(&report);
    report
}

fn recommendations(report: &CitationReport) -> Vec<String> {
    let mut out = Vec::new();
    if !report.invalid.is_empty() {
        let shown: Vec<&str> = report.invalid.iter().take(3).map(String::as_str).collect();
        out.push(format!(
            "Remove {} invalid citation(s): {}",
            report.invalid.len(),
            shown.join(", ")
        ));
    }
    if !report.missing.is_empty() {
        let shown: Vec<String> = report
            .missing
            .iter()
            .take(3)
            .map(|a| match a.page {
                Some(page) => format!("{} (page {page})", a.source),
                None => a.source.clone(),
            })
            .collect();
        out.push(format!("Add missing citation(s) for: {}", shown.join(", ")));
    }
    if report.valid.is_empty() {
        out.push("Add source citations to support the answer".to_string());
    } else if report.invalid.is_empty() && report.missing.is_empty() {
        out.push("Citations are accurate and complete".to_string());
    }
    out
}
