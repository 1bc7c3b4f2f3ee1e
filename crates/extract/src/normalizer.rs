use regex::Regex;
use std::sync::LazyLock;

static PUNCTUATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[.,!?;:'"()\[\]{}]"#).expect("punctuation pattern"));
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("whitespace pattern"));

/// Trailing words that name the same organisation ("OpenAI Inc" == "OpenAI").
const ORG_SUFFIXES: &[&str] = &["inc", "corp", "corporation", "ltd", "llc", "co", "plc", "gmbh"];

/// Leading articles dropped from entity names ("The Louvre" == "Louvre").
const ARTICLES: &[&str] = &["the", "a", "an"];

/// Stateless entity name normalizer.
///
/// Normalization is a pure function of the input so that ingesting the same
/// corpus twice, in any order, produces the same entity sets.
#[derive(Debug, Default, Clone)]
pub struct EntityNormalizer;

impl EntityNormalizer {
    pub fn new() -> Self {
        Self
    }

    /// Lowercase, strip punctuation, collapse spaces, drop articles and org suffixes.
    /// Returns `None` when nothing meaningful is left.
    pub fn normalize(&self, name: &str) -> Option<String> {
        let lowered = name.to_lowercase();
        let stripped = PUNCTUATION.replace_all(lowered.trim(), "");
        let collapsed = WHITESPACE.replace_all(stripped.trim(), " ");

        let mut words: Vec<&str> = collapsed.split(' ').filter(|w| !w.is_empty()).collect();

        while words.len() > 1 && ARTICLES.contains(&words[0]) {
            words.remove(0);
        }
        while words.len() > 1 && words.last().is_some_and(|w| ORG_SUFFIXES.contains(w)) {
            words.pop();
        }

        let normalized = words.join(" ");
        if normalized.is_empty() || ARTICLES.contains(&normalized.as_str()) {
            None
        } else {
            Some(normalized)
        }
    }

    /// Simple similarity check used when merging alias candidates.
    pub fn are_similar(&self, a: &str, b: &str) -> bool {
        if a == b {
            return true;
        }

        let words_a: Vec<&str> = a.split_whitespace().collect();
        let words_b: Vec<&str> = b.split_whitespace().collect();

        if words_a.len() > 1 && words_b.len() > 1 {
            let common = words_a.iter().filter(|w| words_b.contains(w)).count();
            let total = words_a.len().max(words_b.len());
            return common as f64 / total as f64 > 0.7;
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalization() {
        let normalizer = EntityNormalizer::new();

        assert_eq!(normalizer.normalize("GraphRAG").as_deref(), Some("graphrag"));
        assert_eq!(normalizer.normalize("GraphRAG!").as_deref(), Some("graphrag"));
        assert_eq!(normalizer.normalize("  GraphRAG  ").as_deref(), Some("graphrag"));
        assert_eq!(normalizer.normalize("The  Louvre").as_deref(), Some("louvre"));
        assert_eq!(normalizer.normalize("...").as_deref(), None);
    }

    #[test]
    fn test_alias_resolution() {
        let normalizer = EntityNormalizer::new();

        let n1 = normalizer.normalize("OpenAI");
        let n2 = normalizer.normalize("OpenAI Inc.");

        assert_eq!(n1, n2);
    }

    #[test]
    fn test_word_overlap_similarity() {
        let normalizer = EntityNormalizer::new();
        assert!(normalizer.are_similar("new york city hall", "new york city hall annex"));
        assert!(!normalizer.are_similar("marie curie", "pierre curie"));
    }
}
