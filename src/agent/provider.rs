//! Provider configuration and the name-keyed adapter registry.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{EchoProvider, Provider, ScriptedProvider};
use crate::core::retry::millis;
use crate::core::{EngineError, EngineResult};

/// Price per thousand tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pricing {
    /// Price per 1k prompt tokens
    pub input_per_1k: f64,

    /// Price per 1k completion tokens
    pub output_per_1k: f64,
}

/// One configured language-model backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Unique provider name (referenced by sessions)
    pub name: String,

    /// Adapter kind: `echo` or `scripted`
    #[serde(default = "default_kind")]
    pub kind: String,

    /// Model identifier passed to the adapter
    #[serde(default = "default_model")]
    pub model: String,

    /// Request ceiling per minute (0 = unlimited)
    #[serde(default)]
    pub requests_per_minute: u32,

    /// Burst size for the token bucket (defaults to 1 when limited)
    #[serde(default)]
    pub burst: u32,

    /// Per-call timeout
    #[serde(default = "default_request_timeout", with = "millis")]
    pub request_timeout: Duration,

    /// Capabilities this backend offers (e.g. `text`, `code`, `review`)
    #[serde(default)]
    pub capabilities: BTreeSet<String>,

    /// Token pricing
    #[serde(default)]
    pub pricing: Pricing,
}

fn default_kind() -> String {
    "echo".to_string()
}

fn default_model() -> String {
    "echo-1".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(120)
}

impl ProviderConfig {
    /// Create a config with defaults for everything but the name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: default_kind(),
            model: default_model(),
            requests_per_minute: 0,
            burst: 0,
            request_timeout: default_request_timeout(),
            capabilities: BTreeSet::new(),
            pricing: Pricing::default(),
        }
    }

    /// Set the adapter kind.
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    /// Set the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Add capabilities.
    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities.extend(capabilities.into_iter().map(Into::into));
        self
    }

    /// Set the pricing.
    pub fn with_pricing(mut self, input_per_1k: f64, output_per_1k: f64) -> Self {
        self.pricing = Pricing { input_per_1k, output_per_1k };
        self
    }

    /// Set the rate limit.
    pub fn with_rate_limit(mut self, requests_per_minute: u32, burst: u32) -> Self {
        self.requests_per_minute = requests_per_minute;
        self.burst = burst;
        self
    }

    /// Set the per-call timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Whether this backend offers every capability in `required`.
    pub fn covers(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.capabilities)
    }
}

/// An adapter together with the configuration it was registered under.
#[derive(Clone)]
pub struct RegisteredProvider {
    pub config: ProviderConfig,
    pub adapter: Arc<dyn Provider>,
}

impl std::fmt::Debug for RegisteredProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredProvider")
            .field("name", &self.config.name)
            .field("adapter", &self.adapter.name())
            .finish()
    }
}

/// Configured providers, in configuration order.
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    entries: Vec<RegisteredProvider>,
}

impl ProviderRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build adapters for every config entry by `kind`.
    pub fn from_configs(configs: &[ProviderConfig]) -> EngineResult<Self> {
        let mut registry = Self::new();
        for config in configs {
            let adapter: Arc<dyn Provider> = match config.kind.as_str() {
                "echo" => Arc::new(EchoProvider::new(config.name.clone())),
                "scripted" => Arc::new(ScriptedProvider::new(config.name.clone())),
                other => {
                    return Err(EngineError::Config(format!(
                        "provider '{}' has unknown kind '{other}'",
                        config.name
                    )))
                }
            };
            registry.register(config.clone(), adapter)?;
        }
        Ok(registry)
    }

    /// Register an adapter under its config name.
    pub fn register(&mut self, config: ProviderConfig, adapter: Arc<dyn Provider>) -> EngineResult<()> {
        if self.get(&config.name).is_some() {
            return Err(EngineError::Config(format!(
                "provider '{}' registered twice",
                config.name
            )));
        }
        tracing::debug!(provider = %config.name, kind = %config.kind, "Registered provider");
        self.entries.push(RegisteredProvider { config, adapter });
        Ok(())
    }

    /// Look up a provider by name.
    pub fn get(&self, name: &str) -> Option<&RegisteredProvider> {
        self.entries.iter().find(|p| p.config.name == name)
    }

    /// Iterate in configuration order.
    pub fn iter(&self) -> impl Iterator<Item = &RegisteredProvider> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Union of all configured capabilities.
    pub fn capabilities(&self) -> BTreeSet<String> {
        self.entries.iter().flat_map(|p| p.config.capabilities.iter().cloned()).collect()
    }

    /// First provider (in configuration order) offering all of `required`.
    pub fn select_for(&self, required: &BTreeSet<String>) -> Option<&RegisteredProvider> {
        self.entries.iter().find(|p| p.config.covers(required))
    }

    /// Capabilities no single provider can satisfy together.
    ///
    /// Empty when some provider covers everything. Otherwise lists what is
    /// missing from the union, or, when the union is complete but split
    /// across providers, everything required.
    pub fn missing(&self, required: &BTreeSet<String>) -> Vec<String> {
        if self.select_for(required).is_some() {
            return Vec::new();
        }
        let available = self.capabilities();
        let absent: Vec<String> = required.difference(&available).cloned().collect();
        if absent.is_empty() {
            required.iter().cloned().collect()
        } else {
            absent
        }
    }
}
