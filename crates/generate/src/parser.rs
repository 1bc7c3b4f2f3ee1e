//! Reader for the `v1` output contract:
//!
//! ```text
//! Q: <question>
//! A: <answer, possibly continuing on the following lines>
//! ```
//!
//! Labels are matched case-insensitively. Blank lines around the pair and a
//! wrapping code fence are ignored.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QaPair {
    pub question: String,
    pub answer: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParseError {
    #[error("no `Q:` line")]
    MissingQuestion,
    #[error("no `A:` line")]
    MissingAnswer,
    #[error("`A:` appears before `Q:`")]
    OutOfOrder,
    #[error("label `{label}:` appears more than once")]
    DuplicateLabel { label: char },
    #[error("text before the `Q:` line")]
    UnexpectedPreamble,
    #[error("question is empty")]
    EmptyQuestion,
    #[error("answer is empty")]
    EmptyAnswer,
}

enum Line<'a> {
    Question(&'a str),
    Answer(&'a str),
    Text(&'a str),
}

fn classify(line: &str) -> Line<'_> {
    let trimmed = line.trim_start();
    let mut chars = trimmed.chars();
    let label = chars.next().map(|c| c.to_ascii_lowercase());
    if chars.next() == Some(':') {
        match label {
            Some('q') => return Line::Question(trimmed[2..].trim()),
            Some('a') => return Line::Answer(trimmed[2..].trim()),
            _ => {}
        }
    }
    Line::Text(line.trim())
}

fn strip_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string ("```text") along with the opening fence.
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

pub fn parse_response(response: &str) -> Result<QaPair, ParseError> {
    let body = strip_fence(response);

    let mut question: Option<Vec<&str>> = None;
    let mut answer: Option<Vec<&str>> = None;

    for line in body.lines() {
        match classify(line) {
            Line::Question(text) => {
                // An `A:` line is only accepted after a `Q:` line.
                if question.is_some() {
                    return Err(ParseError::DuplicateLabel { label: 'Q' });
                }
                question = Some(vec![text]);
            }
            Line::Answer(text) => {
                if question.is_none() {
                    return Err(ParseError::OutOfOrder);
                }
                if answer.is_some() {
                    return Err(ParseError::DuplicateLabel { label: 'A' });
                }
                answer = Some(vec![text]);
            }
            Line::Text(text) => match (answer.as_mut(), question.as_mut()) {
                (Some(lines), _) => lines.push(text),
                (None, Some(lines)) => lines.push(text),
                (None, None) if text.is_empty() => {}
                (None, None) => return Err(ParseError::UnexpectedPreamble),
            },
        }
    }

    let question = question.ok_or(ParseError::MissingQuestion)?;
    let answer = answer.ok_or(ParseError::MissingAnswer)?;

    let question = join_words(&question);
    let answer = answer.join("\n").trim().to_string();

    if question.is_empty() {
        return Err(ParseError::EmptyQuestion);
    }
    if answer.is_empty() {
        return Err(ParseError::EmptyAnswer);
    }

    Ok(QaPair { question, answer })
}

fn join_words(lines: &[&str]) -> String {
    lines
        .iter()
        .filter(|l| !l.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(" ")
}
