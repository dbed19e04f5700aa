//! The workflow state machine.
//!
//! `Pending -> Running -> {Completed | Failed}`, with `WaitingOnHook` as a
//! transient sub-state of `Running` and `Cancelled` reachable from any
//! non-terminal state. Every mutation goes through the [`StateStore`] as a
//! single log entry; an attempt only counts once its record is committed.

use std::collections::HashMap;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::handler::{HandlerRegistry, StageContext, StageHandler, StageInput};
use super::hooks::{Hook, HookContext, HookPhase, HookPipeline};
use super::recovery::{RecoveryManager, RecoveryReport};
use super::stages::{StageDefinition, StageRegistry};
use super::store::{CommitRequest, InstanceClaim, StateStore};
use super::types::{
    Artifacts, StageExecutionRecord, StageOutcome, WorkflowInstance, WorkflowSnapshot, WorkflowStatus,
};
use crate::agent::{AgentHandle, AgentManager, ProviderRegistry, SessionSummary};
use crate::cache::PromptCache;
use crate::core::retry::millis;
use crate::core::{EngineConfig, EngineError, EngineResult};

/// What happens when a mandatory hook vetoes an attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VetoPolicy {
    /// Return `HookVeto` and let the caller decide.
    #[default]
    Halt,
    /// Count the veto against the stage retry budget and try again.
    Retry,
}

/// Orchestrator settings (`[orchestrator]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub veto_policy: VetoPolicy,

    /// How long a timed-out handler gets to observe its cancellation
    #[serde(with = "millis")]
    pub cancel_grace: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self { veto_policy: VetoPolicy::Halt, cancel_grace: Duration::from_secs(1) }
    }
}

/// Stages, hooks and handlers, wired up once at startup.
#[derive(Debug)]
pub struct Registry {
    pub stages: Arc<StageRegistry>,
    pub hooks: HookPipeline,
    pub handlers: HandlerRegistry,
}

impl Registry {
    /// Registry with no hooks and the default prompt handler.
    pub fn new(stages: StageRegistry) -> Self {
        let stages = Arc::new(stages);
        Self { hooks: HookPipeline::new(Arc::clone(&stages)), stages, handlers: HandlerRegistry::default() }
    }

    pub fn register_hook(
        &mut self,
        stage_id: &str,
        phase: HookPhase,
        hook: Arc<dyn Hook>,
        must_succeed: bool,
    ) -> EngineResult<()> {
        self.hooks.register(stage_id, phase, hook, must_succeed)
    }

    pub fn register_handler(&mut self, stage_id: &str, handler: Arc<dyn StageHandler>) -> EngineResult<()> {
        if !self.stages.contains(stage_id) {
            return Err(EngineError::Config(format!("handler registered for unknown stage '{stage_id}'")));
        }
        self.handlers.register(stage_id, handler);
        Ok(())
    }
}

/// Result of one `advance_stage` call that reached a commit.
#[derive(Debug, Clone, PartialEq)]
pub struct AdvanceOutcome {
    /// The last committed record
    pub record: StageExecutionRecord,
    /// Instance state after the commit
    pub instance: WorkflowInstance,
}

impl AdvanceOutcome {
    pub fn is_success(&self) -> bool {
        self.record.outcome == StageOutcome::Success
    }

    pub fn is_completed(&self) -> bool {
        self.instance.status == WorkflowStatus::Completed
    }
}

/// Drives workflow instances through the stage registry.
pub struct Orchestrator {
    registry: Registry,
    agents: Arc<AgentManager>,
    store: Arc<dyn StateStore>,
    recovery: RecoveryManager,
    config: OrchestratorConfig,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    cancellations: Mutex<HashMap<String, CancellationToken>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("registry", &self.registry)
            .field("agents", &self.agents)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(
        registry: Registry,
        agents: Arc<AgentManager>,
        store: Arc<dyn StateStore>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            agents,
            recovery: RecoveryManager::new(Arc::clone(&store)),
            store,
            config,
            locks: Mutex::new(HashMap::new()),
            cancellations: Mutex::new(HashMap::new()),
        }
    }

    /// Build the default lifecycle, providers and cache from configuration.
    pub fn from_config(config: &EngineConfig, store: Arc<dyn StateStore>) -> EngineResult<Self> {
        config.validate()?;
        let stages = StageRegistry::lifecycle().with_overrides(&config.stages)?;
        let providers = ProviderRegistry::from_configs(&config.providers)?;
        let cache = Arc::new(PromptCache::new(config.cache.clone()));
        let agents = Arc::new(AgentManager::new(providers, cache));
        Ok(Self::new(Registry::new(stages), agents, store, config.orchestrator.clone()))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn agents(&self) -> &Arc<AgentManager> {
        &self.agents
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Create a `Pending` instance.
    pub async fn start(&self, project_ref: &str) -> EngineResult<WorkflowInstance> {
        let instance = WorkflowInstance::new(project_ref);
        self.store.create(&instance).await?;
        tracing::info!(instance_id = %instance.id, project = project_ref, "Started workflow");
        Ok(instance)
    }

    /// Read-only view of an instance and its history.
    pub async fn snapshot(&self, instance_id: &str) -> EngineResult<WorkflowSnapshot> {
        self.store.load(instance_id).await
    }

    /// Run the next stage until it commits, retrying per the stage policy.
    ///
    /// Returns the last committed record: `Success`, or `Failed` once the
    /// retry budget is exhausted or the error is not retryable. A veto under
    /// [`VetoPolicy::Halt`] returns `HookVeto` without committing anything.
    pub async fn advance_stage(&self, instance_id: &str) -> EngineResult<AdvanceOutcome> {
        let result = {
            let lock = self.instance_lock(instance_id);
            let _guard = lock.try_lock().map_err(|_| {
                EngineError::InvalidTransition(format!("workflow {instance_id} already has a stage in flight"))
            })?;
            let _claim = self.claim(instance_id).await?;
            self.advance_claimed(instance_id).await
        };

        match &result {
            Ok(outcome) if outcome.instance.status.is_terminal() => self.forget(instance_id),
            Err(EngineError::Cancelled) => self.forget(instance_id),
            _ => {}
        }
        result
    }

    async fn advance_claimed(&self, instance_id: &str) -> EngineResult<AdvanceOutcome> {
        let mut snapshot = self.store.load(instance_id).await?;
        if snapshot.instance.status.is_terminal() {
            return Err(EngineError::InvalidTransition(format!(
                "workflow {instance_id} is {}",
                snapshot.instance.status
            )));
        }

        let stage = self
            .registry
            .stages
            .next_after(snapshot.instance.current_stage_index)
            .cloned()
            .ok_or_else(|| EngineError::InvalidTransition(format!("workflow {instance_id} has no stage left")))?;
        self.agents.check_capabilities(&stage.id, &stage.required_capabilities)?;

        // We hold the instance lock, so any marker is left over from a crash.
        if let Some(stale) = snapshot.in_flight.take() {
            tracing::debug!(instance_id, stage = %stale.stage_id, attempt = stale.attempt, "Closing stale attempt");
            self.store.abandon_attempt(instance_id, &stale.stage_id, stale.attempt).await?;
        }
        if snapshot.instance.status != WorkflowStatus::Running {
            snapshot.instance = self.store.set_status(instance_id, WorkflowStatus::Running).await?;
        }

        let cancel = self.cancellation(instance_id);
        let input = StageInput { prior_artifacts: snapshot.committed_artifacts() };
        let is_last = stage.order == self.registry.stages.len();
        let mut attempt = snapshot.next_attempt(&stage.id);
        // Budget spent before a crash still counts. A stage re-driven after
        // its vetoes used everything up still gets one attempt.
        let count_vetoes = self.config.veto_policy == VetoPolicy::Retry;
        let mut used =
            snapshot.attempts_used(&stage.id, count_vetoes).min(stage.retry.attempts().saturating_sub(1));

        let outcome = loop {
            used += 1;
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let started_at = Utc::now();
            if let Err(err) = self.store.begin_attempt(instance_id, &stage.id, attempt).await {
                return Err(self.settle_error(instance_id, err, &cancel).await);
            }
            tracing::info!(instance_id, stage = %stage.id, attempt, "Starting stage attempt");

            let (result, session) = self.run_attempt(&snapshot.instance, &stage, attempt, &input, &cancel).await;

            if cancel.is_cancelled() || matches!(result, Err(EngineError::Cancelled)) {
                self.abandon_quietly(instance_id, &stage.id, attempt).await;
                return Err(EngineError::Cancelled);
            }

            match result {
                Ok(artifacts) => {
                    let status = if is_last { WorkflowStatus::Completed } else { WorkflowStatus::Running };
                    let record = StageExecutionRecord::new(
                        &stage.id,
                        attempt,
                        started_at,
                        StageOutcome::Success,
                        session.as_ref(),
                    )
                    .with_artifacts(artifacts);
                    break self.commit(instance_id, record, status, &cancel).await?;
                }
                Err(err @ EngineError::HookVeto { .. }) => {
                    let record = StageExecutionRecord::new(
                        &stage.id,
                        attempt,
                        started_at,
                        StageOutcome::Vetoed,
                        session.as_ref(),
                    )
                    .with_error(&err);
                    if let Err(store_err) = self.store.record_veto(instance_id, record).await {
                        return Err(self.settle_error(instance_id, store_err, &cancel).await);
                    }

                    if self.config.veto_policy == VetoPolicy::Retry && stage.retry.allows_another(used) {
                        self.backoff(&stage, used, None, &cancel).await?;
                        attempt += 1;
                        continue;
                    }
                    return Err(err);
                }
                Err(err) => {
                    let retry = err.is_retryable() && stage.retry.allows_another(used);
                    let status = if retry { WorkflowStatus::Running } else { WorkflowStatus::Failed };
                    let record = StageExecutionRecord::new(
                        &stage.id,
                        attempt,
                        started_at,
                        StageOutcome::Failed,
                        session.as_ref(),
                    )
                    .with_error(&err);
                    let outcome = self.commit(instance_id, record, status, &cancel).await?;

                    if !retry {
                        tracing::warn!(instance_id, stage = %stage.id, attempt, error = %err, "Stage failed");
                        break outcome;
                    }
                    tracing::info!(instance_id, stage = %stage.id, attempt, error = %err, "Stage attempt failed, retrying");
                    self.backoff(&stage, used, err.retry_after(), &cancel).await?;
                    attempt += 1;
                }
            }
        };
        Ok(outcome)
    }

    /// Advance until the instance is terminal or an error surfaces.
    pub async fn run_to_completion(&self, instance_id: &str) -> EngineResult<WorkflowSnapshot> {
        let mut snapshot = self.store.load(instance_id).await?;
        while !snapshot.instance.status.is_terminal() {
            let outcome = self.advance_stage(instance_id).await?;
            snapshot.instance = outcome.instance;
        }
        self.store.load(instance_id).await
    }

    /// Mark the instance `Cancelled` and signal its in-flight stage.
    pub async fn cancel(&self, instance_id: &str) -> EngineResult<WorkflowInstance> {
        let snapshot = self.store.load(instance_id).await?;
        if snapshot.instance.status.is_terminal() {
            return Err(EngineError::InvalidTransition(format!(
                "workflow {instance_id} is already {}",
                snapshot.instance.status
            )));
        }

        if let Some(token) = self.cancellations.lock().remove(instance_id) {
            token.cancel();
        }
        let instance = self.store.set_status(instance_id, WorkflowStatus::Cancelled).await?;
        self.forget(instance_id);
        tracing::info!(instance_id, "Cancelled workflow");
        Ok(instance)
    }

    /// Put a `Failed` instance back to `Running` at the failed stage.
    pub async fn restart(&self, instance_id: &str) -> EngineResult<WorkflowInstance> {
        let lock = self.instance_lock(instance_id);
        let _guard = lock.try_lock().map_err(|_| {
            EngineError::InvalidTransition(format!("workflow {instance_id} already has a stage in flight"))
        })?;
        let _claim = self.claim(instance_id).await?;

        let snapshot = self.store.load(instance_id).await?;
        if snapshot.instance.status != WorkflowStatus::Failed {
            return Err(EngineError::InvalidTransition(format!(
                "only failed workflows can be restarted; {instance_id} is {}",
                snapshot.instance.status
            )));
        }
        let instance = self.store.set_status(instance_id, WorkflowStatus::Running).await?;
        tracing::info!(instance_id, stage_index = instance.current_stage_index, "Restarted workflow");
        Ok(instance)
    }

    /// Recover one instance, then run it to completion.
    pub async fn resume(&self, instance_id: &str) -> EngineResult<WorkflowSnapshot> {
        {
            let lock = self.instance_lock(instance_id);
            let _guard = lock.try_lock().map_err(|_| {
                EngineError::InvalidTransition(format!("workflow {instance_id} already has a stage in flight"))
            })?;
            let _claim = self.claim(instance_id).await?;
            self.recovery.recover(instance_id).await?;
        }
        self.run_to_completion(instance_id).await
    }

    /// Recover every non-terminal instance that is not currently running here.
    pub async fn recover_all(&self) -> EngineResult<Vec<RecoveryReport>> {
        let mut reports = Vec::new();
        for id in self.store.list_active().await? {
            let lock = self.instance_lock(&id);
            let Ok(_guard) = lock.try_lock() else {
                tracing::debug!(instance_id = %id, "Skipping recovery of busy workflow");
                continue;
            };
            let Some(_claim) = self.store.try_claim(&id).await? else {
                tracing::debug!(instance_id = %id, "Skipping recovery of workflow claimed elsewhere");
                continue;
            };
            reports.push(self.recovery.recover(&id).await?);
        }
        Ok(reports)
    }

    fn instance_lock(&self, instance_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.locks.lock().entry(instance_id.to_string()).or_default())
    }

    async fn claim(&self, instance_id: &str) -> EngineResult<InstanceClaim> {
        self.store.try_claim(instance_id).await?.ok_or_else(|| {
            EngineError::InvalidTransition(format!("workflow {instance_id} is being driven by another process"))
        })
    }

    /// Drop per-instance state once the instance is terminal and idle.
    fn forget(&self, instance_id: &str) {
        self.cancellations.lock().remove(instance_id);
        let mut locks = self.locks.lock();
        if locks.get(instance_id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(instance_id);
        }
    }

    fn cancellation(&self, instance_id: &str) -> CancellationToken {
        self.cancellations.lock().entry(instance_id.to_string()).or_default().clone()
    }

    /// Hooks, handler (under the stage timeout) and post-hooks for one attempt.
    async fn run_attempt(
        &self,
        instance: &WorkflowInstance,
        stage: &StageDefinition,
        attempt: u32,
        input: &StageInput,
        cancel: &CancellationToken,
    ) -> (EngineResult<Artifacts>, Option<SessionSummary>) {
        let attempt_cancel = cancel.child_token();
        let mut hook_ctx = HookContext {
            instance_id: instance.id.clone(),
            project_ref: instance.project_ref.clone(),
            stage_id: stage.id.clone(),
            attempt,
            phase: HookPhase::Pre,
            artifacts: Artifacts::new(),
        };
        if let Err(err) = self.run_hooks(&hook_ctx, &attempt_cancel).await {
            return (Err(err), None);
        }

        let session_id = match self.agents.open_session(
            &stage.id,
            &stage.required_capabilities,
            stage.context_budget,
            attempt_cancel.clone(),
        ) {
            Ok(id) => id,
            Err(err) => return (Err(err), None),
        };
        let ctx = StageContext {
            instance_id: instance.id.clone(),
            project_ref: instance.project_ref.clone(),
            stage: stage.clone(),
            attempt,
            agent: AgentHandle::new(Arc::clone(&self.agents), session_id.clone(), attempt_cancel.clone()),
            cancel: attempt_cancel.clone(),
        };

        let handler = self.registry.handlers.get(&stage.id);
        let result = self.execute_with_timeout(handler.as_ref(), &ctx, input, &attempt_cancel).await;
        let session = self.agents.close_session(&session_id).ok();

        let result = match result {
            Ok(artifacts) => {
                hook_ctx.phase = HookPhase::Post;
                hook_ctx.artifacts = artifacts.clone();
                self.run_hooks(&hook_ctx, &attempt_cancel).await.map(|()| artifacts)
            }
            Err(err) => Err(err),
        };
        (result, session)
    }

    async fn execute_with_timeout(
        &self,
        handler: &dyn StageHandler,
        ctx: &StageContext,
        input: &StageInput,
        attempt_cancel: &CancellationToken,
    ) -> EngineResult<Artifacts> {
        let mut execution = pin!(handler.execute(ctx, input));
        match tokio::time::timeout(ctx.stage.timeout, &mut execution).await {
            Ok(result) => result,
            Err(_) => {
                attempt_cancel.cancel();
                // Give outstanding provider calls a chance to unwind.
                let _ = tokio::time::timeout(self.config.cancel_grace, execution).await;
                tracing::warn!(
                    instance_id = %ctx.instance_id,
                    stage = %ctx.stage.id,
                    attempt = ctx.attempt,
                    timeout_ms = ctx.stage.timeout.as_millis() as u64,
                    "Stage attempt timed out"
                );
                Err(EngineError::Timeout(format!(
                    "stage '{}' exceeded {}ms",
                    ctx.stage.id,
                    ctx.stage.timeout.as_millis()
                )))
            }
        }
    }

    async fn run_hooks(&self, ctx: &HookContext, cancel: &CancellationToken) -> EngineResult<()> {
        if !self.registry.hooks.has_hooks(&ctx.stage_id, ctx.phase) {
            return Ok(());
        }
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        self.store.set_status(&ctx.instance_id, WorkflowStatus::WaitingOnHook).await?;
        let result = self.registry.hooks.run(ctx, cancel).await;
        if !cancel.is_cancelled() {
            self.store.set_status(&ctx.instance_id, WorkflowStatus::Running).await?;
        }

        let report = result?;
        if !report.warnings.is_empty() {
            tracing::debug!(
                instance_id = %ctx.instance_id,
                stage = %ctx.stage_id,
                phase = %ctx.phase,
                warnings = report.warnings.len(),
                "Hooks finished with warnings"
            );
        }
        Ok(())
    }

    async fn commit(
        &self,
        instance_id: &str,
        record: StageExecutionRecord,
        status: WorkflowStatus,
        cancel: &CancellationToken,
    ) -> EngineResult<AdvanceOutcome> {
        if cancel.is_cancelled() {
            self.abandon_quietly(instance_id, &record.stage_id, record.attempt).await;
            return Err(EngineError::Cancelled);
        }

        match self.store.commit_advance(instance_id, CommitRequest { record: record.clone(), status }).await {
            Ok(snapshot) => {
                tracing::info!(
                    instance_id,
                    stage = %record.stage_id,
                    attempt = record.attempt,
                    outcome = ?record.outcome,
                    status = %snapshot.instance.status,
                    cost = record.cost,
                    "Committed stage attempt"
                );
                Ok(AdvanceOutcome { record, instance: snapshot.instance })
            }
            Err(err) => {
                let err = self.settle_error(instance_id, err, cancel).await;
                // Otherwise the marker stays for the next advance or recovery.
                if matches!(err, EngineError::Cancelled) {
                    self.abandon_quietly(instance_id, &record.stage_id, record.attempt).await;
                }
                Err(err)
            }
        }
    }

    async fn backoff(
        &self,
        stage: &StageDefinition,
        used: u32,
        hint: Option<Duration>,
        cancel: &CancellationToken,
    ) -> EngineResult<()> {
        let delay = stage.retry.backoff(used, hint);
        tracing::debug!(stage = %stage.id, delay_ms = delay.as_millis() as u64, "Backing off before retry");
        tokio::select! {
            () = cancel.cancelled() => Err(EngineError::Cancelled),
            () = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Report a store rejection caused by a concurrent cancel as `Cancelled`.
    async fn settle_error(&self, instance_id: &str, err: EngineError, cancel: &CancellationToken) -> EngineError {
        if cancel.is_cancelled() {
            return EngineError::Cancelled;
        }
        if matches!(err, EngineError::InvalidTransition(_)) {
            if let Ok(snapshot) = self.store.load(instance_id).await {
                if snapshot.instance.status == WorkflowStatus::Cancelled {
                    return EngineError::Cancelled;
                }
            }
        }
        err
    }

    async fn abandon_quietly(&self, instance_id: &str, stage_id: &str, attempt: u32) {
        if let Err(err) = self.store.abandon_attempt(instance_id, stage_id, attempt).await {
            tracing::warn!(instance_id, stage = stage_id, attempt, error = %err, "Could not close cancelled attempt");
        }
    }
}
