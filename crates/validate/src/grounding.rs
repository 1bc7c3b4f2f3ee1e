use std::collections::HashSet;

use extract::content_tokens;

/// Share of the answer's content tokens that also occur in the passages.
///
/// An answer without content tokens scores 0.
pub fn answer_overlap<'a>(answer: &str, passages: impl IntoIterator<Item = &'a str>) -> f64 {
    let answer_tokens: HashSet<String> = content_tokens(answer).into_iter().collect();
    if answer_tokens.is_empty() {
        return 0.0;
    }

    let passage_tokens: HashSet<String> = passages.into_iter().flat_map(content_tokens).collect();
    let supported = answer_tokens
        .iter()
        .filter(|t| passage_tokens.contains(*t))
        .count();
    supported as f64 / answer_tokens.len() as f64
}
