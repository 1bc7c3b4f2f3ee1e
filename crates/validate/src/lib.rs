pub mod grounding;
pub mod judge;
pub mod novelty;

pub use generate::RejectionReason;
pub use grounding::answer_overlap;
pub use judge::{build_judge_prompt, parse_judge_response, JudgeCriterion, JudgeVerdict};
pub use novelty::{NearDuplicate, NoveltyIndex};

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use generate::{Mode, ParseError, TestCase, TokenUsage};
use index::{IndexError, RetrievalIndex};
use ingest::Chunk;
use llm::{GenerationFailure, Generator, ModeHint, RetryPolicy};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Minimum share of answer content tokens found in the cited passages.
    pub min_answer_overlap: f64,
    /// Ask the generator to grade the candidate as well.
    pub use_judge: bool,
    /// Graded in this order; every one must reach `min_judge_score`.
    pub judge_criteria: Vec<JudgeCriterion>,
    pub min_judge_score: u8,
    /// Cosine similarity above which a question counts as a duplicate.
    pub novelty_threshold: f32,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            min_answer_overlap: 0.5,
            use_judge: false,
            judge_criteria: vec![JudgeCriterion::Inferability],
            min_judge_score: 3,
            novelty_threshold: 0.92,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Verdict {
    Accepted(TestCase),
    Rejected { case: TestCase, reason: RejectionReason },
}

impl Verdict {
    pub fn case(&self) -> &TestCase {
        match self {
            Verdict::Accepted(case) | Verdict::Rejected { case, .. } => case,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted(_))
    }
}

/// A verdict plus the tokens spent reaching it.
#[derive(Debug, Clone)]
pub struct Validated {
    pub verdict: Verdict,
    pub usage: TokenUsage,
}

/// Validation could not reach a verdict because a capability kept failing.
#[derive(Debug, Error)]
pub enum ValidateError {
    #[error("grounding judge failed: {0}")]
    Judge(#[from] GenerationFailure),
    #[error("question embedding failed: {0}")]
    Embedding(#[from] IndexError),
}

impl ValidateError {
    pub fn attempts(&self) -> usize {
        match self {
            ValidateError::Judge(failure) => failure.attempts,
            ValidateError::Embedding(IndexError::Embedding(failure)) => failure.attempts,
            ValidateError::Embedding(_) => 1,
        }
    }
}

pub struct Validator {
    config: ValidatorConfig,
    index: Arc<RetrievalIndex>,
    novelty: NoveltyIndex,
    judge: Option<Arc<dyn Generator>>,
    retry: RetryPolicy,
}

impl Validator {
    pub fn new(config: ValidatorConfig, index: Arc<RetrievalIndex>, retry: RetryPolicy) -> Self {
        let novelty = NoveltyIndex::new(config.novelty_threshold);
        Self {
            config,
            index,
            novelty,
            judge: None,
            retry,
        }
    }

    /// Grades groundedness with `judge` when `use_judge` is set.
    pub fn with_judge(mut self, judge: Arc<dyn Generator>) -> Self {
        self.judge = Some(judge);
        self
    }

    pub fn novelty(&self) -> &NoveltyIndex {
        &self.novelty
    }

    /// Registers a question accepted before this validator existed (resumed runs).
    pub async fn remember_accepted(&self, case: &TestCase) -> Result<(), ValidateError> {
        let vector = self.index.embed_text(&case.question).await?;
        self.novelty.insert(&case.id, vector);
        Ok(())
    }

    /// Runs the schema, groundedness and novelty checks in that order; the
    /// first failing check decides the rejection reason. `evidence` are the
    /// chunks the candidate was generated from.
    pub async fn validate(&self, mut candidate: TestCase, evidence: &[Chunk]) -> Result<Validated, ValidateError> {
        let mut usage = TokenUsage::default();

        if let Some(reason) = self.check_schema(&candidate, evidence) {
            return Ok(rejected(candidate, reason, usage));
        }

        let passages: Vec<&str> = {
            let cited: HashSet<&str> = candidate.provenance.iter().map(String::as_str).collect();
            evidence
                .iter()
                .filter(|c| cited.contains(c.chunk_id.as_str()))
                .map(|c| c.text.as_str())
                .collect()
        };

        let overlap = answer_overlap(&candidate.answer, passages.iter().copied());
        if overlap < self.config.min_answer_overlap {
            debug!(case = %candidate.id, overlap, "Answer not grounded in passages");
            return Ok(rejected(candidate, RejectionReason::Ungrounded, usage));
        }

        if let (true, Some(judge)) = (self.config.use_judge, self.judge.as_ref()) {
            for &criterion in &self.config.judge_criteria {
                let prompt = build_judge_prompt(criterion, &candidate.question, &candidate.answer, &passages);
                let prompt = prompt.as_str();
                let completion = self
                    .retry
                    .retry(criterion.as_str(), || judge.complete(prompt, ModeHint::GroundingJudge))
                    .await?
                    .value;
                usage.add(TokenUsage {
                    prompt_tokens: completion.prompt_tokens,
                    completion_tokens: completion.completion_tokens,
                });

                // An unreadable grade counts as the lowest score.
                let verdict = parse_judge_response(&completion.text);
                let score = verdict.as_ref().map_or(0, |v| v.score);
                if let Some(verdict) = verdict {
                    candidate.judgements.insert(criterion, verdict);
                }
                if score < self.config.min_judge_score {
                    debug!(case = %candidate.id, criterion = %criterion, score, "Judge rejected candidate");
                    return Ok(rejected(candidate, RejectionReason::JudgeRejected, usage));
                }
            }
        }

        let vector = self.index.embed_text(&candidate.question).await?;
        if let Err(duplicate) = self.novelty.check_and_insert(&candidate.id, vector) {
            debug!(
                case = %candidate.id,
                duplicate_of = %duplicate.case_id,
                similarity = duplicate.similarity,
                "Near-duplicate question"
            );
            return Ok(rejected(candidate, RejectionReason::NearDuplicate, usage));
        }

        Ok(Validated {
            verdict: Verdict::Accepted(candidate.accept()),
            usage,
        })
    }

    fn check_schema(&self, candidate: &TestCase, evidence: &[Chunk]) -> Option<RejectionReason> {
        match &candidate.malformed {
            Some(ParseError::EmptyQuestion) => return Some(RejectionReason::EmptyQuestion),
            Some(ParseError::EmptyAnswer) => return Some(RejectionReason::EmptyAnswer),
            Some(_) => return Some(RejectionReason::Malformed),
            None => {}
        }
        if candidate.question.trim().is_empty() {
            return Some(RejectionReason::EmptyQuestion);
        }
        if candidate.answer.trim().is_empty() {
            return Some(RejectionReason::EmptyAnswer);
        }

        let hops_match_mode = match candidate.mode {
            Mode::SingleHop => candidate.hop_count == 1,
            Mode::MultiHop => candidate.hop_count >= 2,
        };
        if candidate.hop_count != candidate.provenance.len() || !hops_match_mode {
            return Some(RejectionReason::HopCountMismatch);
        }

        let origin: HashSet<&str> = evidence.iter().map(|c| c.chunk_id.as_str()).collect();
        if !candidate.provenance.iter().all(|id| origin.contains(id.as_str())) {
            return Some(RejectionReason::ProvenanceOutsideOrigin);
        }

        None
    }
}

fn rejected(candidate: TestCase, reason: RejectionReason, usage: TokenUsage) -> Validated {
    Validated {
        verdict: Verdict::Rejected {
            case: candidate.reject(reason),
            reason,
        },
        usage,
    }
}
