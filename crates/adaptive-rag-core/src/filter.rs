//! Metadata filters and intent-derived filters.
//!
//! A [`MetadataFilter`] is a conjunction of `key = value` criteria; a
//! candidate passes when every key is present in its metadata and the values
//! match loosely (see [`MetaValue::matches`]).
//!
//! [`IntentRule`]s map query cue words to a criterion so a query such as
//! "where did she study?" is narrowed to `doc_type = person` without the
//! caller spelling out a filter.

use serde::{Deserialize, Serialize};

use crate::models::{MetaValue, Metadata, ScoredCandidate};
use crate::rerank::overlap::BIOGRAPHICAL_KEYWORDS;
use crate::text::tokenize;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataFilter {
    criteria: Metadata,
}

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<MetaValue>) -> Self {
        self.criteria.insert(key.into(), value.into());
        self
    }

    /// Parse `key=value`; all-digit values become integers.
    pub fn parse_criterion(raw: &str) -> Option<(String, MetaValue)> {
        let (key, value) = raw.split_once('=')?;
        let (key, value) = (key.trim(), value.trim());
        if key.is_empty() || value.is_empty() {
            return None;
        }
        let value = value
            .parse::<i64>()
            .map(MetaValue::Int)
            .unwrap_or_else(|_| MetaValue::Text(value.to_string()));
        Some((key.to_string(), value))
    }

    pub fn is_empty(&self) -> bool {
        self.criteria.is_empty()
    }

    pub fn criteria(&self) -> &Metadata {
        &self.criteria
    }

    pub fn matches(&self, metadata: &Metadata) -> bool {
        self.criteria
            .iter()
            .all(|(key, expected)| metadata.get(key).is_some_and(|v| v.matches(expected)))
    }

    pub fn apply(&self, candidates: Vec<ScoredCandidate>) -> Vec<ScoredCandidate> {
        candidates
            .into_iter()
            .filter(|c| self.matches(&c.metadata))
            .collect()
    }
}

impl FromIterator<(String, MetaValue)> for MetadataFilter {
    fn from_iter<T: IntoIterator<Item = (String, MetaValue)>>(iter: T) -> Self {
        Self {
            criteria: iter.into_iter().collect(),
        }
    }
}

/// Query cue words that imply one metadata criterion.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IntentRule {
    pub cues: Vec<String>,
    pub key: String,
    pub value: MetaValue,
}

impl IntentRule {
    pub fn new(cues: &[&str], key: &str, value: impl Into<MetaValue>) -> Self {
        Self {
            cues: cues.iter().map(|c| c.to_string()).collect(),
            key: key.to_string(),
            value: value.into(),
        }
    }

    fn fires(&self, tokens: &[String]) -> bool {
        tokens.iter().any(|t| self.cues.iter().any(|c| c == t))
    }
}

/// Biographical questions are scoped to person documents.
pub fn default_intent_rules() -> Vec<IntentRule> {
    vec![IntentRule::new(BIOGRAPHICAL_KEYWORDS, "doc_type", "person")]
}

/// Filter assembled from every rule whose cues occur in `query`.
///
/// `None` when no rule fires.
pub fn derive_filter(query: &str, rules: &[IntentRule]) -> Option<MetadataFilter> {
    let tokens = tokenize(query);
    let filter: MetadataFilter = rules
        .iter()
        .filter(|rule| rule.fires(&tokens))
        .map(|rule| (rule.key.clone(), rule.value.clone()))
        .collect();
    (!filter.is_empty()).then_some(filter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chunk, RetrievalMethod};

    fn candidate(chunk: Chunk) -> ScoredCandidate {
        ScoredCandidate::from_chunk(&chunk, 0.0, 0.0, 0.0, RetrievalMethod::Hybrid)
    }

    #[test]
    fn test_all_criteria_must_match() {
        let filter = MetadataFilter::new().with("doc_type", "person").with("page", 2);
        let both = Chunk::new("a", "x").with_meta("doc_type", "Person").with_meta("page", 2);
        let one = Chunk::new("b", "x").with_meta("doc_type", "person");
        assert!(filter.matches(&both.metadata));
        assert!(!filter.matches(&one.metadata));

        let kept = filter.apply(vec![candidate(both), candidate(one)]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].chunk_id, "a");
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        assert!(MetadataFilter::new().matches(&Metadata::new()));
    }

    #[test]
    fn test_parse_criterion() {
        assert_eq!(
            MetadataFilter::parse_criterion("page=3"),
            Some(("page".to_string(), MetaValue::Int(3)))
        );
        assert_eq!(
            MetadataFilter::parse_criterion(" source = resume.pdf "),
            Some(("source".to_string(), MetaValue::from("resume.pdf")))
        );
        assert_eq!(MetadataFilter::parse_criterion("novalue="), None);
        assert_eq!(MetadataFilter::parse_criterion("plain"), None);
    }

    #[test]
    fn test_derive_filter_from_biographical_cue() {
        let rules = default_intent_rules();
        let filter = derive_filter("Where did she study?", &rules).unwrap();
        assert_eq!(filter.criteria().get("doc_type"), Some(&MetaValue::from("person")));
        assert!(derive_filter("Tesla revenue in 2023", &rules).is_none());
    }
}
