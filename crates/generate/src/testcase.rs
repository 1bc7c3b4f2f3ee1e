use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::parser::ParseError;
use llm::ModeHint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    SingleHop,
    MultiHop,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::SingleHop => "single-hop",
            Mode::MultiHop => "multi-hop",
        }
    }

    pub fn hint(&self) -> ModeHint {
        match self {
            Mode::SingleHop => ModeHint::SingleHop,
            Mode::MultiHop => ModeHint::MultiHop,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "single-hop" | "single" => Ok(Mode::SingleHop),
            "multi-hop" | "multi" => Ok(Mode::MultiHop),
            other => Err(format!("unknown mode {other:?} (expected single-hop or multi-hop)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    Malformed,
    EmptyQuestion,
    EmptyAnswer,
    HopCountMismatch,
    ProvenanceOutsideOrigin,
    Ungrounded,
    JudgeRejected,
    NearDuplicate,
}

impl RejectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionReason::Malformed => "malformed",
            RejectionReason::EmptyQuestion => "empty_question",
            RejectionReason::EmptyAnswer => "empty_answer",
            RejectionReason::HopCountMismatch => "hop_count_mismatch",
            RejectionReason::ProvenanceOutsideOrigin => "provenance_outside_origin",
            RejectionReason::Ungrounded => "ungrounded",
            RejectionReason::JudgeRejected => "judge_rejected",
            RejectionReason::NearDuplicate => "near_duplicate",
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a grading call asks the judge to score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JudgeCriterion {
    /// The answer addresses the question that was asked.
    Relevance,
    /// The question is about what the passages actually discuss.
    SemanticSimilarity,
    /// The answer can be inferred from the passages alone.
    Inferability,
    /// A real user could plausibly ask the question.
    Practicality,
}

impl JudgeCriterion {
    pub const ALL: [JudgeCriterion; 4] = [
        JudgeCriterion::Relevance,
        JudgeCriterion::SemanticSimilarity,
        JudgeCriterion::Inferability,
        JudgeCriterion::Practicality,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JudgeCriterion::Relevance => "relevance",
            JudgeCriterion::SemanticSimilarity => "semantic_similarity",
            JudgeCriterion::Inferability => "inferability",
            JudgeCriterion::Practicality => "practicality",
        }
    }
}

impl fmt::Display for JudgeCriterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A judge's score for one criterion, with the reasoning it gave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JudgeVerdict {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    pub score: u8,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    pub mode: Mode,
    pub question: String,
    pub answer: String,
    /// Supporting chunk ids, in reading order.
    pub provenance: Vec<String>,
    pub hop_count: usize,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection: Option<RejectionReason>,
    /// Why the model output could not be read, when it could not.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub malformed: Option<ParseError>,
    /// Judge scores by criterion, when the judge ran.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub judgements: BTreeMap<JudgeCriterion, JudgeVerdict>,
    pub prompt_version: String,
}

impl TestCase {
    pub fn new(
        mode: Mode,
        provenance: Vec<String>,
        question: impl Into<String>,
        answer: impl Into<String>,
    ) -> Self {
        Self {
            id: Self::id_for(mode, &provenance),
            mode,
            question: question.into(),
            answer: answer.into(),
            hop_count: provenance.len(),
            provenance,
            status: Status::Pending,
            rejection: None,
            malformed: None,
            judgements: BTreeMap::new(),
            prompt_version: crate::PROMPT_VERSION.to_string(),
        }
    }

    /// Candidate for output that did not follow the output contract.
    pub fn malformed(mode: Mode, provenance: Vec<String>, error: ParseError) -> Self {
        let mut case = Self::new(mode, provenance, "", "");
        case.malformed = Some(error);
        case
    }

    /// Stable id: the same mode and provenance always give the same id.
    pub fn id_for(mode: Mode, provenance: &[String]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(mode.as_str().as_bytes());
        for chunk_id in provenance {
            hasher.update(b"\n");
            hasher.update(chunk_id.as_bytes());
        }
        hex::encode(&hasher.finalize()[..16])
    }

    pub fn accept(mut self) -> Self {
        self.status = Status::Accepted;
        self.rejection = None;
        self
    }

    pub fn reject(mut self, reason: RejectionReason) -> Self {
        self.status = Status::Rejected;
        self.rejection = Some(reason);
        self
    }
}
