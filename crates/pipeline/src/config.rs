use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use extract::KeywordConfig;
use generate::Mode;
use ingest::ChunkerConfig;
use llm::RetryPolicy;
use validate::ValidatorConfig;

pub const MIN_HOPS: usize = 2;
pub const MAX_HOPS: usize = 8;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {field} {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("cannot load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub mode: Mode,
    /// Chunks per chain in multi-hop mode.
    pub target_hops: usize,
    pub concurrency: usize,
    pub max_concurrency: usize,
    /// Stop after this many seeds; `None` processes the whole corpus.
    pub max_units: Option<usize>,
    pub max_chains_per_seed: usize,
    pub ledger_root: PathBuf,
    pub retry: RetryConfig,
    pub chunking: ChunkerConfig,
    pub keywords: KeywordConfig,
    pub validation: ValidatorConfig,
    pub providers: ProviderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub request_timeout_secs: u64,
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.initial_backoff_ms, self.max_backoff_ms)
            .with_call_timeout(Duration::from_secs(self.request_timeout_secs))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GeneratorKind {
    Ollama,
    OpenAi,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmbedderKind {
    Ollama,
    /// Offline feature-hashing embedder.
    Hashing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub generator: GeneratorKind,
    pub generator_url: String,
    pub generator_model: String,
    /// Never written to the run manifest.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    pub temperature: f32,
    /// Sent ahead of every generation and judge prompt.
    #[serde(default)]
    pub system_prompt: Option<String>,
    pub embedder: EmbedderKind,
    pub embedder_url: String,
    pub embedder_model: String,
    pub embedding_dimension: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            mode: Mode::SingleHop,
            target_hops: 2,
            concurrency: 4,
            max_concurrency: 32,
            max_units: None,
            max_chains_per_seed: 3,
            ledger_root: PathBuf::from("./runs"),
            retry: RetryConfig {
                max_retries: 3,
                initial_backoff_ms: 1000,
                max_backoff_ms: 10000,
                request_timeout_secs: 60,
            },
            chunking: ChunkerConfig::default(),
            keywords: KeywordConfig::default(),
            validation: ValidatorConfig::default(),
            providers: ProviderConfig {
                generator: GeneratorKind::Ollama,
                generator_url: "http://localhost:11434".to_string(),
                generator_model: "llama3".to_string(),
                api_key: None,
                temperature: 0.6,
                system_prompt: None,
                embedder: EmbedderKind::Ollama,
                embedder_url: "http://localhost:11434".to_string(),
                embedder_model: "nomic-embed-text".to_string(),
                embedding_dimension: 512,
            },
        }
    }
}

impl RunConfig {
    /// More workers, fewer retries, no judge.
    pub fn fast() -> Self {
        let mut config = Self::default();
        config.concurrency = 10;
        config.retry = RetryConfig {
            max_retries: 2,
            initial_backoff_ms: 500,
            max_backoff_ms: 5000,
            request_timeout_secs: 30,
        };
        config.validation.use_judge = false;
        config
    }

    /// Fewer workers, patient retries, judge-graded groundedness.
    pub fn thorough() -> Self {
        let mut config = Self::default();
        config.concurrency = 2;
        config.retry = RetryConfig {
            max_retries: 5,
            initial_backoff_ms: 2000,
            max_backoff_ms: 20000,
            request_timeout_secs: 120,
        };
        config.validation.use_judge = true;
        config.validation.judge_criteria = validate::JudgeCriterion::ALL.to_vec();
        config.validation.min_judge_score = 4;
        config
    }

    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "default" => Some(Self::default()),
            "fast" => Some(Self::fast()),
            "thorough" => Some(Self::thorough()),
            _ => None,
        }
    }

    /// Layers `base`, then an optional file, then `RAGTEST__*` environment
    /// variables (`RAGTEST__VALIDATION__NOVELTY_THRESHOLD=0.9`).
    pub fn load(base: RunConfig, file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder().add_source(Config::try_from(&base)?);
        if let Some(path) = file {
            builder = builder.add_source(File::from(path).required(true));
        }
        let config = builder
            .add_source(
                Environment::with_prefix("RAGTEST")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut loaded: RunConfig = config.try_deserialize()?;
        // The key is skipped when `base` is serialized, so carry it over.
        if loaded.providers.api_key.is_none() {
            loaded.providers.api_key = base.providers.api_key;
        }
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: impl Into<String>) -> Result<(), ConfigError> {
            Err(ConfigError::Invalid {
                field,
                reason: reason.into(),
            })
        }

        if self.mode == Mode::MultiHop && !(MIN_HOPS..=MAX_HOPS).contains(&self.target_hops) {
            return invalid(
                "target_hops",
                format!("must be between {MIN_HOPS} and {MAX_HOPS}, got {}", self.target_hops),
            );
        }
        if self.max_concurrency == 0 {
            return invalid("max_concurrency", "must be at least 1");
        }
        if self.concurrency == 0 || self.concurrency > self.max_concurrency {
            return invalid(
                "concurrency",
                format!("must be between 1 and {}, got {}", self.max_concurrency, self.concurrency),
            );
        }
        if self.max_chains_per_seed == 0 {
            return invalid("max_chains_per_seed", "must be at least 1");
        }
        if self.max_units == Some(0) {
            return invalid("max_units", "must be at least 1 when set");
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return invalid("retry.initial_backoff_ms", "must not exceed retry.max_backoff_ms");
        }
        if self.retry.request_timeout_secs == 0 {
            return invalid("retry.request_timeout_secs", "must be at least 1");
        }
        if self.chunking.target_tokens_max == 0 {
            return invalid("chunking.target_tokens_max", "must be at least 1");
        }
        if self.chunking.overlap_tokens >= self.chunking.target_tokens_max {
            return invalid("chunking.overlap_tokens", "must be smaller than chunking.target_tokens_max");
        }

        let threshold = self.validation.novelty_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return invalid("validation.novelty_threshold", format!("must be in (0, 1], got {threshold}"));
        }
        let overlap = self.validation.min_answer_overlap;
        if !(0.0..=1.0).contains(&overlap) {
            return invalid("validation.min_answer_overlap", format!("must be in [0, 1], got {overlap}"));
        }
        if !(validate::judge::MIN_SCORE..=validate::judge::MAX_SCORE).contains(&self.validation.min_judge_score) {
            return invalid("validation.min_judge_score", "must be between 1 and 5");
        }
        if self.validation.use_judge && self.validation.judge_criteria.is_empty() {
            return invalid("validation.judge_criteria", "must name at least one criterion when the judge is on");
        }

        if self.providers.embedder == EmbedderKind::Hashing && self.providers.embedding_dimension == 0 {
            return invalid("providers.embedding_dimension", "must be at least 1");
        }
        if self.providers.generator == GeneratorKind::OpenAi && self.providers.api_key.is_none() {
            return invalid("providers.api_key", "is required for the openai generator");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_and_presets_are_valid() {
        RunConfig::default().validate().unwrap();
        RunConfig::fast().validate().unwrap();
        RunConfig::thorough().validate().unwrap();
        assert_eq!(RunConfig::thorough().validation.judge_criteria.len(), 4);
        assert!(RunConfig::preset("nope").is_none());
    }

    #[test]
    fn test_out_of_range_values_are_rejected() {
        let mut config = RunConfig::default();
        config.mode = Mode::MultiHop;
        config.target_hops = 9;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "target_hops", .. })
        ));

        let mut config = RunConfig::default();
        config.concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = RunConfig::default();
        config.validation.novelty_threshold = 0.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "validation.novelty_threshold", .. })
        ));

        let mut config = RunConfig::default();
        config.validation.min_judge_score = 6;
        assert!(config.validate().is_err());

        let mut config = RunConfig::default();
        config.validation.use_judge = true;
        config.validation.judge_criteria.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "validation.judge_criteria", .. })
        ));
    }

    #[test]
    fn test_single_hop_ignores_hop_count() {
        let mut config = RunConfig::default();
        config.target_hops = 0;
        config.validate().unwrap();
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ragtest.json");
        std::fs::write(
            &path,
            r#"{ "mode": "multi-hop", "target_hops": 3, "validation": { "novelty_threshold": 0.8 } }"#,
        )
        .unwrap();

        let config = RunConfig::load(RunConfig::default(), Some(&path)).unwrap();
        assert_eq!(config.mode, Mode::MultiHop);
        assert_eq!(config.target_hops, 3);
        assert_eq!(config.validation.novelty_threshold, 0.8);
        assert_eq!(config.concurrency, 4);
    }

    #[test]
    fn test_api_key_is_not_serialized() {
        let mut config = RunConfig::default();
        config.providers.api_key = Some("secret".to_string());
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("secret"));
    }
}
