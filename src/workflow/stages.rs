//! Stage definitions and the ordered stage registry.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::retry::RetryPolicy;
use crate::core::{EngineError, EngineResult};

/// Default token budget for a stage's agent session.
pub const DEFAULT_CONTEXT_BUDGET: usize = 16_000;

/// Default wall-clock limit for one stage attempt.
pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(600);

/// One step of the lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub struct StageDefinition {
    pub id: String,
    pub name: String,
    /// 1-based position in the lifecycle
    pub order: usize,
    pub required_capabilities: BTreeSet<String>,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub context_budget: usize,
}

impl StageDefinition {
    /// Create a stage with default timeout, retry policy and budget.
    pub fn new(id: impl Into<String>, name: impl Into<String>, order: usize) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            order,
            required_capabilities: BTreeSet::new(),
            timeout: DEFAULT_STAGE_TIMEOUT,
            retry: RetryPolicy::default(),
            context_budget: DEFAULT_CONTEXT_BUDGET,
        }
    }

    /// Require capabilities from the provider serving this stage.
    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities.extend(capabilities.into_iter().map(Into::into));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_context_budget(mut self, budget: usize) -> Self {
        self.context_budget = budget;
        self
    }

    /// Apply a config override.
    pub fn apply(&mut self, over: &StageOverride) {
        if let Some(name) = &over.name {
            self.name.clone_from(name);
        }
        if let Some(capabilities) = &over.required_capabilities {
            self.required_capabilities.clone_from(capabilities);
        }
        if let Some(timeout) = over.timeout {
            self.timeout = timeout;
        }
        if let Some(retry) = &over.retry {
            self.retry = retry.clone();
        }
        if let Some(budget) = over.context_budget {
            self.context_budget = budget;
        }
    }
}

/// Per-stage overrides from `[stages.<id>]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageOverride {
    pub name: Option<String>,
    pub required_capabilities: Option<BTreeSet<String>>,
    #[serde(with = "optional_millis", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    pub retry: Option<RetryPolicy>,
    pub context_budget: Option<usize>,
}

mod optional_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_u64(duration.as_millis() as u64),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

/// Default lifecycle: (id, display name, required capabilities).
const LIFECYCLE: [(&str, &str, &[&str]); 12] = [
    ("discovery", "Discovery", &["text"]),
    ("requirements", "Requirements", &["text"]),
    ("architecture", "Architecture", &["text"]),
    ("design", "Design", &["text"]),
    ("planning", "Planning", &["text"]),
    ("implementation", "Implementation", &["text", "code"]),
    ("code_review", "Code Review", &["code", "review"]),
    ("testing", "Testing", &["text", "code"]),
    ("security_review", "Security Review", &["review"]),
    ("documentation", "Documentation", &["text"]),
    ("release", "Release", &["text"]),
    ("retrospective", "Retrospective", &["text"]),
];

/// Ordered, immutable table of stages.
#[derive(Debug, Clone, PartialEq)]
pub struct StageRegistry {
    stages: Vec<StageDefinition>,
}

impl StageRegistry {
    /// The built-in 12-stage lifecycle.
    pub fn lifecycle() -> Self {
        let stages = LIFECYCLE
            .iter()
            .enumerate()
            .map(|(i, (id, name, caps))| {
                let stage = StageDefinition::new(*id, *name, i + 1).with_capabilities(caps.iter().copied());
                if caps.contains(&"code") {
                    stage.with_retry(RetryPolicy::agent_heavy())
                } else {
                    stage
                }
            })
            .collect();
        Self { stages }
    }

    /// Build from arbitrary definitions.
    ///
    /// Ids must be unique and orders must be exactly `1..=N`.
    pub fn from_definitions(mut stages: Vec<StageDefinition>) -> EngineResult<Self> {
        if stages.is_empty() {
            return Err(EngineError::Config("stage registry is empty".into()));
        }

        let mut seen = HashSet::new();
        for stage in &stages {
            if stage.id.trim().is_empty() {
                return Err(EngineError::Config("stage id must not be empty".into()));
            }
            if !seen.insert(stage.id.as_str()) {
                return Err(EngineError::Config(format!("duplicate stage id '{}'", stage.id)));
            }
        }

        stages.sort_by_key(|s| s.order);
        for (i, stage) in stages.iter().enumerate() {
            if stage.order != i + 1 {
                return Err(EngineError::Config(format!(
                    "stage '{}' has order {}, expected {}",
                    stage.id,
                    stage.order,
                    i + 1
                )));
            }
        }

        Ok(Self { stages })
    }

    /// Apply `[stages.<id>]` overrides. Unknown ids are rejected.
    pub fn with_overrides(mut self, overrides: &BTreeMap<String, StageOverride>) -> EngineResult<Self> {
        for (id, over) in overrides {
            let stage = self
                .stages
                .iter_mut()
                .find(|s| &s.id == id)
                .ok_or_else(|| EngineError::Config(format!("override for unknown stage '{id}'")))?;
            stage.apply(over);
        }
        Ok(self)
    }

    pub fn get(&self, id: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Stage with the given 1-based order.
    pub fn by_order(&self, order: usize) -> Option<&StageDefinition> {
        order.checked_sub(1).and_then(|i| self.stages.get(i))
    }

    /// Stage to run when `committed` stages are done.
    pub fn next_after(&self, committed: usize) -> Option<&StageDefinition> {
        self.stages.get(committed)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StageDefinition> {
        self.stages.iter()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::lifecycle()
    }
}
