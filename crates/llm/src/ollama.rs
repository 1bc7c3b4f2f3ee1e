use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{temperature_for, CapabilityError, Completion, Generator, ModeHint};

#[derive(Clone)]
pub struct OllamaClient {
    base_url: String,
    model: String,
    temperature: f32,
    system_prompt: Option<String>,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
}

#[derive(Deserialize)]
struct OllamaResponse {
    response: String,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}

impl OllamaClient {
    pub fn new(base_url: String, model: String) -> Self {
        Self {
            base_url,
            model,
            temperature: 0.6,
            system_prompt: None,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_system_prompt(mut self, system_prompt: Option<String>) -> Self {
        self.system_prompt = system_prompt;
        self
    }

    /// Transport-level timeout; the retry policy applies its own per-attempt bound too.
    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Result<Self, reqwest::Error> {
        self.client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(self)
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

impl Default for OllamaClient {
    fn default() -> Self {
        Self::new("http://localhost:11434".to_string(), "llama3".to_string())
    }
}

#[async_trait]
impl Generator for OllamaClient {
    async fn complete(&self, prompt: &str, hint: ModeHint) -> Result<Completion, CapabilityError> {
        let url = format!("{}/api/generate", self.base_url);

        let request = OllamaRequest {
            model: &self.model,
            prompt,
            stream: false,
            system: self.system_prompt.as_deref(),
            options: OllamaOptions {
                temperature: temperature_for(hint, self.temperature),
            },
        };

        let response = self.client.post(&url).json(&request).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CapabilityError::from_status(status, &body));
        }

        let ollama_response: OllamaResponse = response
            .json()
            .await
            .map_err(|e| CapabilityError::Provider(format!("invalid Ollama response: {e}")))?;

        Ok(Completion {
            text: ollama_response.response,
            prompt_tokens: ollama_response.prompt_eval_count.unwrap_or(0),
            completion_tokens: ollama_response.eval_count.unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_shape() {
        let request = OllamaRequest {
            model: "llama3",
            prompt: "hi",
            stream: false,
            system: None,
            options: OllamaOptions { temperature: 0.0 },
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["model"], "llama3");
        assert_eq!(json["stream"], false);
        assert!(json.get("system").is_none());
        assert_eq!(json["options"]["temperature"], 0.0);
    }

    #[test]
    fn test_response_without_counts() {
        let parsed: OllamaResponse = serde_json::from_str(r#"{"response":"Q: a\nA: b"}"#).unwrap();
        assert_eq!(parsed.response, "Q: a\nA: b");
        assert!(parsed.eval_count.is_none());
    }
}
