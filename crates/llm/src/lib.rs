pub mod embeddings;
pub mod error;
pub mod ollama;
pub mod openai;
pub mod retry;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use embeddings::{HashingEmbedder, OllamaEmbedder};
pub use error::{CapabilityError, GenerationFailure};
pub use ollama::OllamaClient;
pub use openai::OpenAiClient;
pub use retry::{Attempted, RetryPolicy};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// What a prompt is for. Providers may use it to pick sampling settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeHint {
    SingleHop,
    MultiHop,
    GroundingJudge,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl Completion {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

/// "Generate text given a prompt."
#[async_trait]
pub trait Generator: Send + Sync {
    async fn complete(&self, prompt: &str, hint: ModeHint) -> Result<Completion, CapabilityError>;
}

/// "Embed text into a vector." Every vector from one embedder has the same length.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, CapabilityError>;

    fn dimension(&self) -> Option<usize> {
        None
    }
}

/// Sampling temperature used for a hint when the caller configured `base`.
pub(crate) fn temperature_for(hint: ModeHint, base: f32) -> f32 {
    match hint {
        ModeHint::GroundingJudge => 0.0,
        ModeHint::SingleHop | ModeHint::MultiHop => base,
    }
}
