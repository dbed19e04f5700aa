//! Scripted provider for tests and rehearsals.
//!
//! Replies are consumed in FIFO order; once the script runs dry the
//! provider falls back to echoing the prompt. Every call is counted, which
//! is what the single-flight and cost tests lean on.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::{estimate_tokens, Provider, ProviderRequest, ProviderResponse, TokenUsage};
use crate::core::{EngineError, EngineResult};

/// Provider that plays back a queue of outcomes.
#[derive(Debug)]
pub struct ScriptedProvider {
    name: String,
    script: Mutex<VecDeque<EngineResult<ProviderResponse>>>,
    latency: Mutex<Duration>,
    prompts: Mutex<Vec<String>>,
    calls: AtomicU32,
    cancelled: AtomicU32,
}

impl ScriptedProvider {
    /// Create a provider with an empty script.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(VecDeque::new()),
            latency: Mutex::new(Duration::ZERO),
            prompts: Mutex::new(Vec::new()),
            calls: AtomicU32::new(0),
            cancelled: AtomicU32::new(0),
        }
    }

    /// Delay every reply by `latency`.
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.lock() = latency;
        self
    }

    /// Queue a successful reply.
    pub fn push_response(&self, text: impl Into<String>, usage: TokenUsage) {
        self.script.lock().push_back(Ok(ProviderResponse { text: text.into(), usage }));
    }

    /// Queue a failure.
    pub fn push_error(&self, error: EngineError) {
        self.script.lock().push_back(Err(error));
    }

    /// Number of calls that reached this provider.
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of calls aborted through cancellation.
    pub fn cancelled_count(&self) -> u32 {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Prompts received, in arrival order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn send(
        &self,
        request: &ProviderRequest,
        cancel: &CancellationToken,
    ) -> EngineResult<ProviderResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().push(request.prompt.clone());

        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::select! {
                () = cancel.cancelled() => {
                    self.cancelled.fetch_add(1, Ordering::SeqCst);
                    return Err(EngineError::Cancelled);
                }
                () = tokio::time::sleep(latency) => {}
            }
        }

        let next = self.script.lock().pop_front();
        next.unwrap_or_else(|| {
            let text = format!("scripted: {}", request.prompt);
            let usage = TokenUsage::new(
                estimate_tokens(&request.prompt) as u64,
                estimate_tokens(&text) as u64,
            );
            Ok(ProviderResponse { text, usage })
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}
