//! Agent invocation subsystem.
//!
//! Stage handlers talk to language models exclusively through the
//! [`AgentManager`]: it owns the provider adapters, the per-provider rate
//! limiters, the shared [`PromptCache`](crate::cache::PromptCache) and one
//! [`AgentSession`] per stage attempt.
//!
//! ## Adapters
//!
//! - [`EchoProvider`] - deterministic offline backend
//! - [`ScriptedProvider`] - queued responses and failures for tests and dry runs
//!
//! Any other backend plugs in by implementing [`Provider`] and registering it
//! with [`ProviderRegistry::register`].

mod echo;
mod manager;
mod provider;
mod rate_limit;
mod scripted;
mod session;

pub use echo::EchoProvider;
pub use manager::{AgentHandle, AgentManager, DispatchResult};
pub use provider::{Pricing, ProviderConfig, ProviderRegistry, RegisteredProvider};
pub use rate_limit::TokenBucket;
pub use scripted::ScriptedProvider;
pub use session::{
    estimate_tokens, AgentSession, ContextWindow, CostAccumulator, DropOldest, ElideOldest, Role,
    SessionSummary, TruncationPolicy, Turn,
};

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::core::EngineResult;

/// Uniform capability over one language-model backend.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Send one rendered prompt and wait for the completion.
    ///
    /// Implementations should return [`EngineError::Cancelled`](crate::core::EngineError::Cancelled)
    /// promptly once `cancel` fires.
    async fn send(
        &self,
        request: &ProviderRequest,
        cancel: &CancellationToken,
    ) -> EngineResult<ProviderResponse>;

    /// Get the adapter name.
    fn name(&self) -> &str;
}

/// Generation parameters that take part in the cache key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SendParams {
    /// Sampling temperature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Completion length cap
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Stop sequences
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,

    /// Backend-specific extras (ordered so the cache key is stable)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl SendParams {
    /// Set the temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set the completion length cap.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// A request as handed to a provider adapter.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub prompt: String,
    pub model: String,
    pub params: SendParams,
}

/// A provider's completion.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderResponse {
    pub text: String,
    pub usage: TokenUsage,
}

/// Token counts reported for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    /// Create a usage record.
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self { prompt_tokens, completion_tokens }
    }

    /// Prompt plus completion tokens.
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    /// Accumulate another usage record.
    pub fn add(&mut self, other: Self) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }

    /// Price this usage.
    pub fn cost(&self, pricing: &Pricing) -> f64 {
        (self.prompt_tokens as f64 / 1000.0) * pricing.input_per_1k
            + (self.completion_tokens as f64 / 1000.0) * pricing.output_per_1k
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_usage_cost() {
        let usage = TokenUsage::new(2000, 500);
        let pricing = Pricing { input_per_1k: 0.003, output_per_1k: 0.015 };
        let cost = usage.cost(&pricing);
        assert!((cost - 0.0135).abs() < 1e-12);
    }

    #[test]
    fn test_token_usage_add() {
        let mut usage = TokenUsage::new(10, 5);
        usage.add(TokenUsage::new(1, 2));
        assert_eq!(usage, TokenUsage::new(11, 7));
        assert_eq!(usage.total(), 18);
    }

    #[test]
    fn test_send_params_serialization_is_stable() {
        let mut params = SendParams::default().with_temperature(0.5);
        params.extra.insert("zeta".into(), serde_json::json!(1));
        params.extra.insert("alpha".into(), serde_json::json!(2));

        let json = serde_json::to_string(&params).unwrap();
        assert_eq!(json, r#"{"temperature":0.5,"extra":{"alpha":2,"zeta":1}}"#);
    }
}
