use regex::Regex;
use std::sync::LazyLock;

pub use generate::{JudgeCriterion, JudgeVerdict};

static SCORE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^\s*score\s*:\s*(\d+)").expect("score pattern"));
static REASONING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^\s*reasoning\s*:\s*(.*)$").expect("reasoning pattern"));

pub const MIN_SCORE: u8 = 1;
pub const MAX_SCORE: u8 = 5;

struct Rubric {
    task: &'static str,
    scale: [&'static str; 5],
    needs_answer: bool,
    needs_passages: bool,
}

fn rubric(criterion: JudgeCriterion) -> Rubric {
    match criterion {
        JudgeCriterion::Relevance => Rubric {
            task: "Judge whether the answer addresses the question that was asked.",
            scale: [
                "The answer is about something else entirely",
                "The answer touches the topic but not the question",
                "The answer partly addresses the question",
                "The answer addresses the question with minor digressions",
                "The answer addresses exactly what was asked",
            ],
            needs_answer: true,
            needs_passages: false,
        },
        JudgeCriterion::SemanticSimilarity => Rubric {
            task: "Judge whether the question asks about what the passages actually discuss.",
            scale: [
                "The question is unrelated to the passages",
                "The question shares only a few words with the passages",
                "The question is loosely related to the passages",
                "The question is about the passages with a small drift",
                "The question is squarely about the content of the passages",
            ],
            needs_answer: false,
            needs_passages: true,
        },
        JudgeCriterion::Inferability => Rubric {
            task: "Judge whether the answer to the question can be inferred from the passages alone.",
            scale: [
                "The answer contradicts the passages or has no support in them",
                "Only a small part of the answer is supported",
                "The answer is partly supported, some of it needs outside knowledge",
                "The answer is supported, with minor gaps",
                "The answer follows directly from the passages",
            ],
            needs_answer: true,
            needs_passages: true,
        },
        JudgeCriterion::Practicality => Rubric {
            task: "Judge whether a real user of a search or assistant system could plausibly ask this question.",
            scale: [
                "Nobody would ask this; it only makes sense as a test artifact",
                "Contrived, or refers to the passages themselves",
                "Plausible but awkward or overly specific",
                "A natural question with small wording issues",
                "A natural question a user would ask",
            ],
            needs_answer: true,
            needs_passages: false,
        },
    }
}

/// Grading prompt for one criterion. Passages or answer are left out when the
/// criterion does not look at them.
pub fn build_judge_prompt(criterion: JudgeCriterion, question: &str, answer: &str, passages: &[&str]) -> String {
    let rubric = rubric(criterion);
    let scale = rubric
        .scale
        .iter()
        .enumerate()
        .map(|(i, line)| format!("{} - {}", i + 1, line))
        .collect::<Vec<_>>()
        .join("\n");

    let mut prompt = format!(
        "{}\n\nSCORING ({MIN_SCORE}-{MAX_SCORE}):\n{}\n\nQUESTION:\n{}",
        rubric.task,
        scale,
        question.trim()
    );
    if rubric.needs_answer {
        prompt.push_str(&format!("\n\nANSWER:\n{}", answer.trim()));
    }
    if rubric.needs_passages {
        let clues = passages
            .iter()
            .enumerate()
            .map(|(i, passage)| format!("[Passage {}]\n{}", i + 1, passage.trim()))
            .collect::<Vec<_>>()
            .join("\n\n");
        prompt.push_str(&format!("\n\nPASSAGES:\n{clues}"));
    }
    prompt.push_str("\n\nOUTPUT FORMAT:\nReasoning: <one or two sentences>\nScore: <integer 1-5>");
    prompt
}

/// Reads `Reasoning: ...` / `Score: n`. A missing or out-of-range score is `None`.
pub fn parse_judge_response(text: &str) -> Option<JudgeVerdict> {
    let score: u8 = SCORE.captures(text)?.get(1)?.as_str().parse().ok()?;
    if !(MIN_SCORE..=MAX_SCORE).contains(&score) {
        return None;
    }
    let reasoning = REASONING
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|r| !r.is_empty());
    Some(JudgeVerdict { reasoning, score })
}
