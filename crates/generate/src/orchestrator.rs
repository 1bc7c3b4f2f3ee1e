use std::sync::Arc;
use tracing::{debug, warn};

use crate::parser::parse_response;
use crate::prompt::{build_multi_hop_prompt, build_single_hop_prompt};
use crate::testcase::{Mode, TestCase, TokenUsage};
use chains::Chain;
use ingest::Chunk;
use llm::{GenerationFailure, Generator, RetryPolicy};

/// Lifecycle of one generation unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Pending,
    Prompted,
    Generated,
    Failed,
}

#[derive(Debug, Clone)]
pub enum GenerationOutcome {
    /// The model answered. The candidate may still be malformed.
    Generated {
        candidate: TestCase,
        usage: TokenUsage,
        attempts: usize,
    },
    /// Retries ran out before the model answered.
    Failed { failure: GenerationFailure },
}

impl GenerationOutcome {
    pub fn state(&self) -> UnitState {
        match self {
            GenerationOutcome::Generated { .. } => UnitState::Generated,
            GenerationOutcome::Failed { .. } => UnitState::Failed,
        }
    }

    pub fn attempts(&self) -> usize {
        match self {
            GenerationOutcome::Generated { attempts, .. } => *attempts,
            GenerationOutcome::Failed { failure } => failure.attempts,
        }
    }
}

pub struct Orchestrator {
    generator: Arc<dyn Generator>,
    retry: RetryPolicy,
}

impl Orchestrator {
    pub fn new(generator: Arc<dyn Generator>, retry: RetryPolicy) -> Self {
        Self { generator, retry }
    }

    pub async fn generate_single_hop(&self, chunk: &Chunk) -> GenerationOutcome {
        let prompt = build_single_hop_prompt(&chunk.text);
        self.run_unit(Mode::SingleHop, vec![chunk.chunk_id.clone()], prompt)
            .await
    }

    pub async fn generate_multi_hop(&self, chain: &Chain) -> GenerationOutcome {
        let passages: Vec<&str> = chain.chunks.iter().map(|c| c.text.as_str()).collect();
        let prompt = build_multi_hop_prompt(&passages);
        self.run_unit(Mode::MultiHop, chain.chunk_ids(), prompt).await
    }

    async fn run_unit(&self, mode: Mode, provenance: Vec<String>, prompt: String) -> GenerationOutcome {
        let unit_id = TestCase::id_for(mode, &provenance);
        let mut state = UnitState::Pending;
        debug!(unit = %unit_id, %mode, ?state, "Unit created");

        state = UnitState::Prompted;
        debug!(unit = %unit_id, ?state, prompt_chars = prompt.len(), "Prompt built");

        let generator = &self.generator;
        let prompt = prompt.as_str();
        let attempted = match self
            .retry
            .retry("generate", || generator.complete(prompt, mode.hint()))
            .await
        {
            Ok(attempted) => attempted,
            Err(failure) => {
                warn!(unit = %unit_id, attempts = failure.attempts, error = %failure.last_error, "Unit failed");
                return GenerationOutcome::Failed { failure };
            }
        };

        let completion = attempted.value;
        let usage = TokenUsage {
            prompt_tokens: completion.prompt_tokens,
            completion_tokens: completion.completion_tokens,
        };

        let candidate = match parse_response(&completion.text) {
            Ok(pair) => TestCase::new(mode, provenance, pair.question, pair.answer),
            Err(error) => {
                debug!(unit = %unit_id, %error, "Response does not follow the output contract");
                TestCase::malformed(mode, provenance, error)
            }
        };

        state = UnitState::Generated;
        debug!(unit = %unit_id, ?state, attempts = attempted.attempts, "Unit generated");

        GenerationOutcome::Generated {
            candidate,
            usage,
            attempts: attempted.attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::ParseError;
    use llm::testing::ScriptedGenerator;
    use llm::CapabilityError;
    use std::collections::BTreeSet;

    fn chunk(doc: &str, text: &str) -> Chunk {
        Chunk::new(
            doc.to_string(),
            0,
            text.to_string(),
            format!("mem://{doc}"),
            (0, text.len()),
            BTreeSet::new(),
        )
    }

    fn orchestrator(generator: ScriptedGenerator) -> (Orchestrator, Arc<ScriptedGenerator>) {
        let generator = Arc::new(generator);
        (
            Orchestrator::new(generator.clone(), RetryPolicy::new(3, 1, 2)),
            generator,
        )
    }

    #[tokio::test]
    async fn test_single_hop_generation() {
        let (orchestrator, _) = orchestrator(ScriptedGenerator::always(
            "Q: What is the capital of France?\nA: Paris",
        ));
        let chunk = chunk("d1", "Paris is the capital of France.");

        let outcome = orchestrator.generate_single_hop(&chunk).await;
        let GenerationOutcome::Generated { candidate, attempts, .. } = outcome else {
            panic!("expected a generated unit");
        };
        assert_eq!(attempts, 1);
        assert_eq!(candidate.answer, "Paris");
        assert_eq!(candidate.hop_count, 1);
        assert_eq!(candidate.provenance, vec![chunk.chunk_id.clone()]);
        assert!(candidate.malformed.is_none());
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let (orchestrator, generator) = orchestrator(ScriptedGenerator::new(vec![
            Err(CapabilityError::RateLimited),
            Err(CapabilityError::RateLimited),
            Ok("Q: What is the capital of France?\nA: Paris".to_string()),
        ]));

        let outcome = orchestrator
            .generate_single_hop(&chunk("d1", "Paris is the capital of France."))
            .await;
        assert_eq!(outcome.state(), UnitState::Generated);
        assert_eq!(outcome.attempts(), 3);
        assert_eq!(generator.calls(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_the_unit() {
        let (orchestrator, generator) = orchestrator(
            ScriptedGenerator::new(Vec::new()).with_fallback(Err(CapabilityError::Timeout)),
        );

        let outcome = orchestrator.generate_single_hop(&chunk("d1", "text")).await;
        let GenerationOutcome::Failed { failure } = outcome else {
            panic!("expected a failed unit");
        };
        assert_eq!(failure.attempts, 4);
        assert_eq!(failure.last_error, CapabilityError::Timeout);
        assert_eq!(generator.calls(), 4);
    }

    #[tokio::test]
    async fn test_malformed_output_is_still_generated() {
        let (orchestrator, _) = orchestrator(ScriptedGenerator::always("The capital is Paris."));

        let outcome = orchestrator.generate_single_hop(&chunk("d1", "text")).await;
        let GenerationOutcome::Generated { candidate, .. } = outcome else {
            panic!("expected a generated unit");
        };
        assert_eq!(candidate.malformed, Some(ParseError::UnexpectedPreamble));
    }

    #[tokio::test]
    async fn test_multi_hop_provenance_follows_chain_order() {
        let (orchestrator, _) = orchestrator(ScriptedGenerator::always(
            "Q: In which country was the discoverer of polonium born?\nA: Poland",
        ));
        let chain = Chain {
            chunks: vec![
                chunk("d1", "Marie Curie discovered polonium."),
                chunk("d2", "Marie Curie was born in Poland."),
            ],
            bridges: vec![BTreeSet::from(["marie curie".to_string()])],
        };

        let GenerationOutcome::Generated { candidate, .. } =
            orchestrator.generate_multi_hop(&chain).await
        else {
            panic!("expected a generated unit");
        };
        assert_eq!(candidate.mode, Mode::MultiHop);
        assert_eq!(candidate.hop_count, 2);
        assert_eq!(candidate.provenance, chain.chunk_ids());
    }
}
