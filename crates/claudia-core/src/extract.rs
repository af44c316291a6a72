//! Regex entity extraction.
//!
//! The degraded path when the language model is unreachable: pull candidate
//! entities out of free text with capitalization and suffix heuristics. Far
//! noisier than LLM extraction, so callers only get entities, never
//! memories or relationships.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

use crate::llm::ExtractedEntity;

/// Organization suffixes that make a capitalized sequence an organization
const ORG_SUFFIXES: &[&str] = &[
    "Corp", "Inc", "LLC", "Ltd", "GmbH", "Labs", "Company", "Co", "Foundation", "University",
    "Institute", "Partners", "Capital", "Ventures", "Studio", "Systems",
];

/// Leading words that look capitalized only because they start a sentence
const STOPWORDS: &[&str] = &[
    "The", "This", "That", "These", "Those", "A", "An", "I", "We", "They", "He", "She", "It",
    "My", "Our", "Their", "When", "Where", "What", "Who", "Why", "How", "If", "But", "And",
    "Or", "So", "Then", "Today", "Tomorrow", "Yesterday", "Monday", "Tuesday", "Wednesday",
    "Thursday", "Friday", "Saturday", "Sunday", "January", "February", "March", "April", "May",
    "June", "July", "August", "September", "October", "November", "December",
];

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // Sequences of capitalized words, allowing internal connectors
        Regex::new(r"\b[A-Z][a-zA-Z0-9']+(?:\s+(?:of|the|and|&|[A-Z][a-zA-Z0-9']+))*\b")
            .expect("static regex compiles")
    })
}

/// Candidate entity extractor with a regex fallback strategy
#[derive(Debug, Default)]
pub struct EntityExtractor;

impl EntityExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Extract candidate entities from free text.
    pub fn extract(&self, text: &str) -> Vec<ExtractedEntity> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut out = Vec::new();

        for capture in name_pattern().find_iter(text) {
            let candidate = capture.as_str().trim();

            let words: Vec<&str> = candidate.split_whitespace().collect();
            // Single stopwords and sentence-initial words are noise
            if words.is_empty() || (words.len() == 1 && STOPWORDS.contains(&words[0])) {
                continue;
            }
            // Strip a leading stopword from multi-word candidates
            let cleaned = if STOPWORDS.contains(&words[0]) && words.len() > 1 {
                words[1..].join(" ")
            } else {
                candidate.to_string()
            };
            if cleaned.len() < 2 {
                continue;
            }

            let key = cleaned.to_lowercase();
            if !seen.insert(key) {
                continue;
            }

            let is_org = cleaned
                .split_whitespace()
                .last()
                .map(|last| ORG_SUFFIXES.contains(&last.trim_end_matches('.')))
                .unwrap_or(false);
            let inferred = if is_org {
                "organization"
            } else if cleaned.split_whitespace().count() >= 2 {
                // Multi-word capitalized sequences are usually people
                "person"
            } else {
                "concept"
            };

            out.push(ExtractedEntity {
                name: cleaned,
                entity_type: Some(inferred.to_string()),
                description: None,
            });
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_people_and_orgs() {
        let extractor = EntityExtractor::new();
        let found =
            extractor.extract("Yesterday Sarah Chen met the team at Acme Corp about Project Atlas.");

        let names: Vec<&str> = found.iter().map(|e| e.name.as_str()).collect();
        assert!(names.contains(&"Sarah Chen"));
        assert!(names.contains(&"Acme Corp"));

        let acme = found.iter().find(|e| e.name == "Acme Corp").unwrap();
        assert_eq!(acme.entity_type.as_deref(), Some("organization"));
        let sarah = found.iter().find(|e| e.name == "Sarah Chen").unwrap();
        assert_eq!(sarah.entity_type.as_deref(), Some("person"));
    }

    #[test]
    fn skips_sentence_initial_stopwords() {
        let extractor = EntityExtractor::new();
        let found = extractor.extract("The meeting went well. Tomorrow we regroup.");
        assert!(found.iter().all(|e| e.name != "The" && e.name != "Tomorrow"));
    }

    #[test]
    fn dedups_candidates() {
        let extractor = EntityExtractor::new();
        let found = extractor.extract("Sarah Chen called. Later Sarah Chen emailed.");
        let sarahs = found.iter().filter(|e| e.name == "Sarah Chen").count();
        assert_eq!(sarahs, 1);
    }

    #[test]
    fn empty_text_yields_nothing() {
        let extractor = EntityExtractor::new();
        assert!(extractor.extract("").is_empty());
        assert!(extractor.extract("all lowercase text here").is_empty());
    }
}
