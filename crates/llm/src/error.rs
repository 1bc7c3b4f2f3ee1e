use thiserror::Error;

/// Failure of a single call into a generation or embedding provider.
/// All variants are transient from the caller's point of view.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("rate limited by provider")]
    RateLimited,
    #[error("provider call timed out")]
    Timeout,
    #[error("provider error: {0}")]
    Provider(String),
}

impl CapabilityError {
    pub fn is_retryable(&self) -> bool {
        true
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Self::RateLimited
        } else if status == reqwest::StatusCode::REQUEST_TIMEOUT
            || status == reqwest::StatusCode::GATEWAY_TIMEOUT
        {
            Self::Timeout
        } else {
            Self::Provider(format!("status {}: {}", status, truncate(body, 200)))
        }
    }
}

impl From<reqwest::Error> for CapabilityError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.status() == Some(reqwest::StatusCode::TOO_MANY_REQUESTS) {
            Self::RateLimited
        } else {
            Self::Provider(err.to_string())
        }
    }
}

/// A capability call that kept failing until the retry ceiling was reached.
#[derive(Debug, Clone, Error)]
#[error("{operation} failed after {attempts} attempts: {last_error}")]
pub struct GenerationFailure {
    pub operation: String,
    pub attempts: usize,
    pub last_error: CapabilityError,
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            CapabilityError::from_status(reqwest::StatusCode::TOO_MANY_REQUESTS, ""),
            CapabilityError::RateLimited
        );
        assert_eq!(
            CapabilityError::from_status(reqwest::StatusCode::GATEWAY_TIMEOUT, ""),
            CapabilityError::Timeout
        );
        assert!(matches!(
            CapabilityError::from_status(reqwest::StatusCode::INTERNAL_SERVER_ERROR, "boom"),
            CapabilityError::Provider(msg) if msg.contains("boom")
        ));
    }
}
