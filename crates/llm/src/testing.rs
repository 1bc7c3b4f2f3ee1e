//! Deterministic provider doubles for tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::{CapabilityError, Completion, Generator, ModeHint};

/// Replays a fixed queue of responses, then keeps returning `fallback`.
pub struct ScriptedGenerator {
    responses: Mutex<VecDeque<Result<String, CapabilityError>>>,
    fallback: Result<String, CapabilityError>,
    calls: AtomicUsize,
}

impl ScriptedGenerator {
    pub fn new(responses: Vec<Result<String, CapabilityError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            fallback: Err(CapabilityError::Provider("script exhausted".to_string())),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn always(text: impl Into<String>) -> Self {
        Self::new(Vec::new()).with_fallback(Ok(text.into()))
    }

    pub fn with_fallback(mut self, fallback: Result<String, CapabilityError>) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn complete(&self, _prompt: &str, _hint: ModeHint) -> Result<Completion, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .responses
            .lock()
            .expect("script lock poisoned")
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        next.map(Completion::text)
    }
}

type ResponseFn = dyn Fn(&str, ModeHint) -> Result<String, CapabilityError> + Send + Sync;

/// Computes each response from the prompt.
#[derive(Clone)]
pub struct FnGenerator {
    respond: Arc<ResponseFn>,
    calls: Arc<AtomicUsize>,
}

impl FnGenerator {
    pub fn new<F>(respond: F) -> Self
    where
        F: Fn(&str, ModeHint) -> Result<String, CapabilityError> + Send + Sync + 'static,
    {
        Self {
            respond: Arc::new(respond),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Generator for FnGenerator {
    async fn complete(&self, prompt: &str, hint: ModeHint) -> Result<Completion, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.respond)(prompt, hint).map(|text| Completion {
            prompt_tokens: prompt.split_whitespace().count() as u64,
            completion_tokens: text.split_whitespace().count() as u64,
            text,
        })
    }
}
