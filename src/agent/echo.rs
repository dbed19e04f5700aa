//! Deterministic offline provider.
//!
//! Echoes a digest of the prompt back. Useful for dry runs of a whole
//! lifecycle without network access.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{estimate_tokens, Provider, ProviderRequest, ProviderResponse, TokenUsage};
use crate::core::{EngineError, EngineResult};

/// Longest prompt prefix quoted back in the response.
const QUOTE_CHARS: usize = 120;

/// Offline echo provider.
#[derive(Debug, Clone)]
pub struct EchoProvider {
    name: String,
}

impl EchoProvider {
    /// Create a new echo provider.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Provider for EchoProvider {
    async fn send(
        &self,
        request: &ProviderRequest,
        cancel: &CancellationToken,
    ) -> EngineResult<ProviderResponse> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let quoted: String = request.prompt.chars().take(QUOTE_CHARS).collect();
        let text = format!("[{}] {}", request.model, quoted.trim());
        let usage = TokenUsage::new(
            estimate_tokens(&request.prompt) as u64,
            estimate_tokens(&text) as u64,
        );

        Ok(ProviderResponse { text, usage })
    }

    fn name(&self) -> &str {
        &self.name
    }
}
