//! Pre/post stage hooks.
//!
//! Hooks run strictly in registration order. The first failing
//! `must_succeed` hook vetoes the transition; other failures are logged
//! and ignored. Hooks must be idempotent: an attempt may be re-run after a
//! crash or a retry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::stages::StageRegistry;
use super::types::Artifacts;
use crate::core::{EngineError, EngineResult};

/// When a hook runs relative to the stage handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookPhase {
    Pre,
    Post,
}

impl std::fmt::Display for HookPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pre => f.write_str("pre"),
            Self::Post => f.write_str("post"),
        }
    }
}

/// What a hook gets to look at.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub instance_id: String,
    pub project_ref: String,
    pub stage_id: String,
    pub attempt: u32,
    pub phase: HookPhase,
    /// Handler output (empty for pre-hooks)
    pub artifacts: Artifacts,
}

/// A named pre/post handler.
#[async_trait]
pub trait Hook: Send + Sync {
    fn name(&self) -> &str;

    /// Run the hook. An error from a mandatory hook vetoes the stage.
    async fn run(&self, ctx: &HookContext) -> anyhow::Result<()>;
}

/// Hook built from a closure.
pub struct FnHook<F> {
    name: String,
    f: F,
}

impl<F> FnHook<F>
where
    F: Fn(&HookContext) -> anyhow::Result<()> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

#[async_trait]
impl<F> Hook for FnHook<F>
where
    F: Fn(&HookContext) -> anyhow::Result<()> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &HookContext) -> anyhow::Result<()> {
        (self.f)(ctx)
    }
}

#[derive(Clone)]
struct RegisteredHook {
    hook: Arc<dyn Hook>,
    must_succeed: bool,
}

/// Outcome of a pipeline run that did not veto.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HookReport {
    pub ran: usize,
    /// Failures of non-mandatory hooks
    pub warnings: Vec<String>,
}

/// Ordered hooks per `(stage, phase)`.
pub struct HookPipeline {
    stages: Arc<StageRegistry>,
    hooks: HashMap<(String, HookPhase), Vec<RegisteredHook>>,
}

impl std::fmt::Debug for HookPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookPipeline").field("registered", &self.len()).finish()
    }
}

impl HookPipeline {
    pub fn new(stages: Arc<StageRegistry>) -> Self {
        Self { stages, hooks: HashMap::new() }
    }

    /// Register a hook. Unknown stage ids are rejected.
    pub fn register(
        &mut self,
        stage_id: &str,
        phase: HookPhase,
        hook: Arc<dyn Hook>,
        must_succeed: bool,
    ) -> EngineResult<()> {
        if !self.stages.contains(stage_id) {
            return Err(EngineError::Config(format!(
                "hook '{}' registered for unknown stage '{stage_id}'",
                hook.name()
            )));
        }
        tracing::debug!(stage = stage_id, %phase, hook = hook.name(), must_succeed, "Registered hook");
        self.hooks
            .entry((stage_id.to_string(), phase))
            .or_default()
            .push(RegisteredHook { hook, must_succeed });
        Ok(())
    }

    pub fn has_hooks(&self, stage_id: &str, phase: HookPhase) -> bool {
        self.hooks.get(&(stage_id.to_string(), phase)).is_some_and(|h| !h.is_empty())
    }

    /// Total number of registered hooks.
    pub fn len(&self) -> usize {
        self.hooks.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every hook for the context's stage and phase.
    ///
    /// Returns `HookVeto` for the first failing mandatory hook and
    /// `Cancelled` if the token fires between hooks.
    pub async fn run(&self, ctx: &HookContext, cancel: &CancellationToken) -> EngineResult<HookReport> {
        let mut report = HookReport::default();
        let Some(hooks) = self.hooks.get(&(ctx.stage_id.clone(), ctx.phase)) else {
            return Ok(report);
        };

        for registered in hooks {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let name = registered.hook.name();
            report.ran += 1;
            match registered.hook.run(ctx).await {
                Ok(()) => {
                    tracing::trace!(stage = %ctx.stage_id, phase = %ctx.phase, hook = name, "Hook passed");
                }
                Err(err) if registered.must_succeed => {
                    tracing::info!(
                        instance_id = %ctx.instance_id,
                        stage = %ctx.stage_id,
                        attempt = ctx.attempt,
                        hook = name,
                        error = %err,
                        "Hook vetoed stage"
                    );
                    return Err(EngineError::HookVeto {
                        stage: ctx.stage_id.clone(),
                        hook: name.to_string(),
                        reason: format!("{err:#}"),
                    });
                }
                Err(err) => {
                    tracing::warn!(
                        instance_id = %ctx.instance_id,
                        stage = %ctx.stage_id,
                        hook = name,
                        error = %err,
                        "Optional hook failed"
                    );
                    report.warnings.push(format!("{name}: {err:#}"));
                }
            }
        }

        Ok(report)
    }
}
