//! Keyword-overlap filtering with alias expansion.
//!
//! A query keyword matches a candidate when the candidate contains the
//! keyword or any alias in the keyword's group. Single-word terms match
//! whole tokens; multi-word aliases (`"ernst & young"`) match as phrases.

use std::collections::HashSet;

use crate::models::ScoredCandidate;
use crate::text::{dedup_ordered, is_stopword, tokenize};

/// Organization abbreviation groups known out of the box.
pub const DEFAULT_ALIAS_GROUPS: &[&[&str]] = &[
    &["pwc", "pricewaterhousecoopers", "price waterhouse coopers", "pricewaterhouse"],
    &["ey", "ernst & young", "ernst and young", "ernst young"],
    &["kpmg", "klynveld peat marwick goerdeler"],
    &["deloitte", "deloitte touche tohmatsu", "dtt"],
    &["ibm", "international business machines"],
    &["mit", "massachusetts institute of technology"],
    &["ucla", "university of california los angeles"],
    &["nyu", "new york university"],
    &["ml", "machine learning"],
    &["ai", "artificial intelligence"],
];

/// Query words that mark a biographical or education question.
pub const BIOGRAPHICAL_KEYWORDS: &[&str] = &[
    "education", "degree", "university", "college", "school", "graduated", "studied", "study",
    "major", "gpa", "bachelor", "master", "phd", "experience", "worked", "work", "job",
    "internship", "intern", "role", "position", "career", "background", "employment",
];

/// Alias groups, each term lowercased.
#[derive(Debug, Clone)]
pub struct AliasTable {
    groups: Vec<Vec<String>>,
}

impl Default for AliasTable {
    fn default() -> Self {
        Self::new(
            DEFAULT_ALIAS_GROUPS
                .iter()
                .map(|g| g.iter().map(|s| s.to_string()).collect()),
        )
    }
}

impl AliasTable {
    pub fn new(groups: impl IntoIterator<Item = Vec<String>>) -> Self {
        let groups = groups
            .into_iter()
            .map(|g| g.into_iter().map(|t| t.trim().to_lowercase()).collect::<Vec<_>>())
            .filter(|g| !g.is_empty())
            .collect();
        Self { groups }
    }

    /// Default groups followed by `extra` groups.
    pub fn with_extra(extra: &[Vec<String>]) -> Self {
        let mut table = Self::default();
        table.groups.extend(Self::new(extra.iter().cloned()).groups);
        table
    }

    pub fn is_alias_term(&self, term: &str) -> bool {
        self.groups.iter().any(|g| g.iter().any(|t| t == term))
    }

    /// `term` plus every alias of every group containing it.
    pub fn expand(&self, term: &str) -> Vec<String> {
        let mut out = vec![term.to_string()];
        for group in self.groups.iter().filter(|g| g.iter().any(|t| t == term)) {
            out.extend(group.iter().cloned());
        }
        dedup_ordered(out)
    }
}

/// Non-stopword query tokens longer than two characters, plus shorter
/// tokens that are themselves alias terms (`"ey"`).
pub fn query_keywords(query: &str, aliases: &AliasTable) -> Vec<String> {
    dedup_ordered(
        tokenize(query)
            .into_iter()
            .filter(|t| !is_stopword(t) && (t.chars().count() > 2 || aliases.is_alias_term(t))),
    )
}

/// Whether `query` asks about education or work history.
pub fn is_biographical(query: &str, biographical: &[String]) -> bool {
    tokenize(query).iter().any(|t| biographical.contains(t))
}

fn contains_term(tokens: &HashSet<String>, lower: &str, term: &str) -> bool {
    if term.contains(|c: char| !c.is_alphanumeric() && c != '_') {
        lower.contains(term)
    } else {
        tokens.contains(term)
    }
}

/// Fraction of `keywords` matched by `content`, counting alias hits.
pub fn overlap_ratio(content: &str, keywords: &[String], aliases: &AliasTable) -> f64 {
    if keywords.is_empty() {
        return 0.0;
    }
    let lower = content.to_lowercase();
    let tokens: HashSet<String> = tokenize(&lower).into_iter().collect();
    let matched = keywords
        .iter()
        .filter(|k| {
            aliases
                .expand(k)
                .iter()
                .any(|term| contains_term(&tokens, &lower, term))
        })
        .count();
    matched as f64 / keywords.len() as f64
}

/// Result of the overlap stage.
#[derive(Debug)]
pub enum OverlapOutcome {
    /// Candidates at or above the minimum ratio.
    Filtered(Vec<ScoredCandidate>),
    /// The filter did not apply; candidates returned unchanged.
    Skipped(Vec<ScoredCandidate>, &'static str),
}

/// Drop candidates whose overlap ratio is below `min_overlap`.
///
/// Skips when the query has no keywords or when nothing would survive.
pub fn filter_by_overlap(
    query: &str,
    candidates: Vec<ScoredCandidate>,
    min_overlap: f64,
    aliases: &AliasTable,
) -> OverlapOutcome {
    let keywords = query_keywords(query, aliases);
    if keywords.is_empty() {
        return OverlapOutcome::Skipped(candidates, "query has no keywords");
    }

    let keep: Vec<bool> = candidates
        .iter()
        .map(|c| overlap_ratio(&c.content, &keywords, aliases) >= min_overlap)
        .collect();
    if !keep.iter().any(|&k| k) {
        return OverlapOutcome::Skipped(candidates, "no candidate overlaps the query");
    }

    OverlapOutcome::Filtered(
        candidates
            .into_iter()
            .zip(keep)
            .filter_map(|(c, k)| k.then_some(c))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chunk, RetrievalMethod};

    fn candidate(id: &str, text: &str) -> ScoredCandidate {
        ScoredCandidate::from_chunk(&Chunk::new(id, text), 0.0, 0.0, 0.0, RetrievalMethod::Hybrid)
    }

    #[test]
    fn test_query_keywords_filters_stopwords_and_short_tokens() {
        let aliases = AliasTable::default();
        assert_eq!(
            query_keywords("What did the person do at PwC?", &aliases),
            vec!["person", "pwc"]
        );
        assert_eq!(query_keywords("Did she join EY?", &aliases), vec!["join", "ey"]);
    }

    #[test]
    fn test_alias_hit_counts_as_match() {
        let aliases = AliasTable::default();
        let keywords = vec!["pwc".to_string()];
        assert_eq!(
            overlap_ratio("Summer associate at PricewaterhouseCoopers", &keywords, &aliases),
            1.0
        );
        let keywords = vec!["ey".to_string()];
        assert_eq!(overlap_ratio("Audit intern, Ernst & Young LLP", &keywords, &aliases), 1.0);
        // Short aliases match whole tokens only.
        assert_eq!(overlap_ratio("They keyed the survey", &keywords, &aliases), 0.0);
    }

    #[test]
    fn test_extra_aliases() {
        let aliases = AliasTable::with_extra(&[vec!["gs".into(), "Goldman Sachs".into()]]);
        let keywords = query_keywords("Was GS on the list?", &aliases);
        assert_eq!(keywords, vec!["gs", "list"]);
        assert_eq!(overlap_ratio("Analyst at Goldman Sachs", &keywords, &aliases), 0.5);
    }

    #[test]
    fn test_filter_drops_non_overlapping() {
        let aliases = AliasTable::default();
        let out = filter_by_overlap(
            "PwC internship",
            vec![candidate("a", "Internship at PwC"), candidate("b", "Tesla revenue")],
            0.03,
            &aliases,
        );
        match out {
            OverlapOutcome::Filtered(c) => {
                assert_eq!(c.len(), 1);
                assert_eq!(c[0].chunk_id, "a");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_filter_never_empties() {
        let aliases = AliasTable::default();
        let out = filter_by_overlap("kubernetes", vec![candidate("a", "Tesla revenue")], 0.03, &aliases);
        assert!(matches!(out, OverlapOutcome::Skipped(ref c, _) if c.len() == 1));
    }

    #[test]
    fn test_filter_skips_without_keywords() {
        let aliases = AliasTable::default();
        let out = filter_by_overlap("who is it", vec![candidate("a", "x")], 0.03, &aliases);
        assert!(matches!(out, OverlapOutcome::Skipped(_, "query has no keywords")));
    }

    #[test]
    fn test_is_biographical() {
        let bio: Vec<String> = BIOGRAPHICAL_KEYWORDS.iter().map(|s| s.to_string()).collect();
        assert!(is_biographical("Where did she study?", &bio));
        assert!(!is_biographical("Tesla revenue", &bio));
    }
}
