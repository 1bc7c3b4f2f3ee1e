use std::sync::Arc;
use std::time::Duration;

use crate::config::{ConfigError, EmbedderKind, GeneratorKind, RunConfig};
use llm::{Embedder, Generator, HashingEmbedder, OllamaClient, OllamaEmbedder, OpenAiClient};

/// The two external capabilities a run depends on.
#[derive(Clone)]
pub struct Capabilities {
    pub generator: Arc<dyn Generator>,
    pub embedder: Arc<dyn Embedder>,
}

impl Capabilities {
    pub fn new(generator: Arc<dyn Generator>, embedder: Arc<dyn Embedder>) -> Self {
        Self { generator, embedder }
    }

    pub fn from_config(config: &RunConfig) -> Result<Self, ConfigError> {
        let providers = &config.providers;
        let timeout = Duration::from_secs(config.retry.request_timeout_secs);

        let generator: Arc<dyn Generator> = match providers.generator {
            GeneratorKind::Ollama => Arc::new(
                OllamaClient::new(providers.generator_url.clone(), providers.generator_model.clone())
                    .with_temperature(providers.temperature)
                    .with_system_prompt(providers.system_prompt.clone())
                    .with_request_timeout(timeout)
                    .map_err(http_client)?,
            ),
            GeneratorKind::OpenAi => {
                let api_key = providers.api_key.clone().ok_or(ConfigError::Invalid {
                    field: "providers.api_key",
                    reason: "is required for the openai generator".to_string(),
                })?;
                Arc::new(
                    OpenAiClient::new(
                        providers.generator_url.clone(),
                        api_key,
                        providers.generator_model.clone(),
                    )
                    .with_temperature(providers.temperature)
                    .with_system_prompt(providers.system_prompt.clone())
                    .with_request_timeout(timeout)
                    .map_err(http_client)?,
                )
            }
        };

        let embedder: Arc<dyn Embedder> = match providers.embedder {
            EmbedderKind::Ollama => Arc::new(
                OllamaEmbedder::new(providers.embedder_url.clone(), providers.embedder_model.clone())
                    .with_request_timeout(timeout)
                    .map_err(http_client)?,
            ),
            EmbedderKind::Hashing => Arc::new(HashingEmbedder::new(providers.embedding_dimension)),
        };

        Ok(Self { generator, embedder })
    }
}

fn http_client(err: reqwest::Error) -> ConfigError {
    ConfigError::Invalid {
        field: "retry.request_timeout_secs",
        reason: format!("cannot build the http client: {err}"),
    }
}
