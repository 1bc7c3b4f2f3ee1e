use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;

use crate::normalizer::EntityNormalizer;
use crate::tokens::{self, is_stopword};

/// Runs of capitalised words, optionally joined by a lowercase connector
/// ("Bank of England", "Marie Curie", "NASA").
static CAPITALISED_PHRASE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[A-Z][\w'-]*(?:\s+(?:of|de|da|von|van|la|del)\s+[A-Z][\w'-]*|\s+[A-Z][\w'-]*)*")
        .expect("capitalised phrase pattern")
});

/// Four or more digits: years, model numbers, identifiers.
static LONG_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{4,}\b").expect("number pattern"));

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordConfig {
    /// Also treat lowercase terms that recur inside the chunk as keywords.
    pub include_recurring_terms: bool,
    pub min_term_len: usize,
    pub min_term_occurrences: usize,
}

impl Default for KeywordConfig {
    fn default() -> Self {
        Self {
            include_recurring_terms: true,
            min_term_len: 6,
            min_term_occurrences: 2,
        }
    }
}

/// Lightweight, model-free entity/keyword extractor.
#[derive(Debug, Clone, Default)]
pub struct KeywordExtractor {
    config: KeywordConfig,
    normalizer: EntityNormalizer,
}

impl KeywordExtractor {
    pub fn new(config: KeywordConfig) -> Self {
        Self {
            config,
            normalizer: EntityNormalizer::new(),
        }
    }

    pub fn extract(&self, text: &str) -> BTreeSet<String> {
        let mut candidates: BTreeSet<String> = BTreeSet::new();

        for phrase in CAPITALISED_PHRASE.find_iter(text) {
            if let Some(entity) = self.phrase_entity(phrase.as_str()) {
                candidates.insert(entity);
            }
        }

        for number in LONG_NUMBER.find_iter(text) {
            candidates.insert(number.as_str().to_string());
        }

        if self.config.include_recurring_terms {
            let mut counts: HashMap<String, usize> = HashMap::new();
            for word in tokens::content_tokens(text) {
                if word.chars().count() >= self.config.min_term_len
                    && !word.chars().all(|c| c.is_ascii_digit())
                {
                    *counts.entry(word).or_insert(0) += 1;
                }
            }
            for (word, count) in counts {
                if count >= self.config.min_term_occurrences {
                    candidates.insert(word);
                }
            }
        }

        self.merge_aliases(candidates)
    }

    /// Drops a leading stopword ("The", "In") that is only capitalised because
    /// it starts a sentence, then normalizes what is left.
    fn phrase_entity(&self, phrase: &str) -> Option<String> {
        let mut words: Vec<&str> = phrase.split_whitespace().collect();
        while let Some(first) = words.first() {
            if is_stopword(&first.to_lowercase()) {
                words.remove(0);
            } else {
                break;
            }
        }
        if words.is_empty() {
            return None;
        }
        let entity = self.normalizer.normalize(&words.join(" "))?;
        if entity.chars().count() < 2 {
            return None;
        }
        Some(entity)
    }

    /// Collapses near-identical multi-word candidates onto the shortest spelling.
    fn merge_aliases(&self, candidates: BTreeSet<String>) -> BTreeSet<String> {
        let mut by_length: Vec<String> = candidates.into_iter().collect();
        by_length.sort_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));

        let mut kept: Vec<String> = Vec::with_capacity(by_length.len());
        for candidate in by_length {
            if !kept.iter().any(|k| self.normalizer.are_similar(k, &candidate)) {
                kept.push(candidate);
            }
        }
        kept.into_iter().collect()
    }
}
