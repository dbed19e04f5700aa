//! Engine error types.
//!
//! Every fallible engine operation returns [`EngineResult`]. The retry
//! machinery only looks at [`EngineError::is_retryable`] and
//! [`EngineError::retry_after`]; the variant itself is persisted on
//! execution records as an [`ErrorKind`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors raised by the orchestrator, the agent layer and the state store.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Workflow instance (or session) does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Requested transition is not allowed from the current state.
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// No configured provider offers the capabilities a stage needs.
    #[error("Stage '{stage}' requires unavailable capabilities: {}", missing.join(", "))]
    RequirementUnmet { stage: String, missing: Vec<String> },

    /// A mandatory hook refused the transition.
    #[error("Hook '{hook}' vetoed stage '{stage}': {reason}")]
    HookVeto { stage: String, hook: String, reason: String },

    /// Provider asked us to back off.
    #[error("Provider '{provider}' rate limited, retry after {}ms", retry_after.as_millis())]
    RateLimited { provider: String, retry_after: Duration },

    /// Provider returned an error.
    #[error("Provider '{provider}' error: {message}")]
    Provider { provider: String, message: String },

    /// A provider call or a whole stage ran out of time.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The workflow (or the attempt) was cancelled.
    #[error("Cancelled")]
    Cancelled,

    /// Stage handler reported a failure of its own.
    #[error("Stage handler failed: {0}")]
    Handler(String),

    /// State store read/write failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid configuration or registry definition.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Build a provider error.
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider { provider: provider.into(), message: message.into() }
    }

    /// Build a handler error.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(message.into())
    }

    /// Whether a stage attempt that failed with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::Provider { .. }
                | Self::Timeout(_)
                | Self::Handler(_)
                | Self::HookVeto { .. }
        )
    }

    /// Backoff hint from the provider, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Persistable discriminant.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::InvalidTransition(_) => ErrorKind::InvalidTransition,
            Self::RequirementUnmet { .. } => ErrorKind::RequirementUnmet,
            Self::HookVeto { .. } => ErrorKind::HookVeto,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::Provider { .. } => ErrorKind::Provider,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Handler(_) => ErrorKind::Handler,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Config(_) => ErrorKind::Config,
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(format!("serialization: {err}"))
    }
}

/// Error discriminant stored on execution records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    InvalidTransition,
    RequirementUnmet,
    HookVeto,
    RateLimited,
    Provider,
    Timeout,
    Cancelled,
    Handler,
    Storage,
    Config,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::NotFound => "not_found",
            Self::InvalidTransition => "invalid_transition",
            Self::RequirementUnmet => "requirement_unmet",
            Self::HookVeto => "hook_veto",
            Self::RateLimited => "rate_limited",
            Self::Provider => "provider",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Handler => "handler",
            Self::Storage => "storage",
            Self::Config => "config",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_layer_errors_are_retryable() {
        assert!(EngineError::provider("echo", "boom").is_retryable());
        assert!(EngineError::Timeout("call".into()).is_retryable());
        assert!(EngineError::RateLimited {
            provider: "echo".into(),
            retry_after: Duration::from_secs(2)
        }
        .is_retryable());
    }

    #[test]
    fn test_state_errors_are_not_retryable() {
        assert!(!EngineError::NotFound("wf".into()).is_retryable());
        assert!(!EngineError::InvalidTransition("done".into()).is_retryable());
        assert!(!EngineError::Storage("disk".into()).is_retryable());
        assert!(!EngineError::Cancelled.is_retryable());
        assert!(!EngineError::RequirementUnmet { stage: "x".into(), missing: vec![] }
            .is_retryable());
    }

    #[test]
    fn test_retry_after_hint() {
        let err = EngineError::RateLimited {
            provider: "echo".into(),
            retry_after: Duration::from_millis(1500),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_millis(1500)));
        assert_eq!(EngineError::Cancelled.retry_after(), None);
    }

    #[test]
    fn test_requirement_unmet_display() {
        let err = EngineError::RequirementUnmet {
            stage: "design".into(),
            missing: vec!["vision".into(), "code".into()],
        };
        assert_eq!(err.to_string(), "Stage 'design' requires unavailable capabilities: vision, code");
    }

    #[test]
    fn test_kind_roundtrips_through_serde() {
        let kind = EngineError::Timeout("stage".into()).kind();
        let json = serde_json::to_string(&kind).unwrap();
        assert_eq!(json, "\"timeout\"");
        assert_eq!(kind.to_string(), "timeout");
    }
}
