//! Stage handlers: the code that actually does a stage's work.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::stages::StageDefinition;
use super::types::Artifacts;
use crate::agent::{AgentHandle, SendParams};
use crate::core::{EngineError, EngineResult};

/// Everything a handler may use during one attempt.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub instance_id: String,
    pub project_ref: String,
    pub stage: StageDefinition,
    pub attempt: u32,
    /// Budget-scoped session for this attempt
    pub agent: AgentHandle,
    /// Fires on workflow cancellation or stage timeout
    pub cancel: CancellationToken,
}

impl StageContext {
    /// Deterministic reference for an artifact of this attempt.
    pub fn artifact_ref(&self, name: &str) -> String {
        artifact_ref(&self.instance_id, &self.stage.id, self.attempt, name)
    }

    /// Fail with `Cancelled` if the attempt has been cancelled.
    pub fn checkpoint(&self) -> EngineResult<()> {
        if self.cancel.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Outputs of earlier stages.
#[derive(Debug, Clone, Default)]
pub struct StageInput {
    /// Artifacts of committed stages, keyed by stage id
    pub prior_artifacts: BTreeMap<String, Artifacts>,
}

/// `{instance}/{stage}/{attempt}/{name}`
pub fn artifact_ref(instance_id: &str, stage_id: &str, attempt: u32, name: &str) -> String {
    format!("{instance_id}/{stage_id}/{attempt}/{name}")
}

/// Performs one stage attempt.
///
/// Must be re-invocable for the same `(instance, stage, attempt)`: after a
/// crash the attempt runs again under the same number.
#[async_trait]
pub trait StageHandler: Send + Sync {
    async fn execute(&self, ctx: &StageContext, input: &StageInput) -> EngineResult<Artifacts>;
}

/// Default handler: one prompt per stage through the agent session.
#[derive(Debug, Clone, Default)]
pub struct PromptStageHandler {
    params: SendParams,
}

impl PromptStageHandler {
    pub fn new(params: SendParams) -> Self {
        Self { params }
    }

    fn render(ctx: &StageContext, input: &StageInput) -> String {
        let mut prompt = format!(
            "Project: {}\nStage: {} ({})\nAttempt: {}\n",
            ctx.project_ref, ctx.stage.name, ctx.stage.id, ctx.attempt
        );
        if !input.prior_artifacts.is_empty() {
            prompt.push_str("Prior artifacts:\n");
            for (stage, artifacts) in &input.prior_artifacts {
                for (name, reference) in artifacts {
                    let _ = writeln!(prompt, "- {stage}.{name}: {reference}");
                }
            }
        }
        prompt
    }
}

#[async_trait]
impl StageHandler for PromptStageHandler {
    async fn execute(&self, ctx: &StageContext, input: &StageInput) -> EngineResult<Artifacts> {
        ctx.checkpoint()?;
        ctx.agent.pin_system(format!("You are handling the '{}' stage.", ctx.stage.name))?;

        let prompt = Self::render(ctx, input);
        let result = ctx.agent.dispatch(&prompt, &self.params).await?;
        if result.text.trim().is_empty() {
            return Err(EngineError::handler(format!("empty response for stage '{}'", ctx.stage.id)));
        }

        let mut artifacts = Artifacts::new();
        artifacts.insert("output".to_string(), ctx.artifact_ref("output"));
        Ok(artifacts)
    }
}

/// Handler lookup by stage id, with a fallback.
#[derive(Clone)]
pub struct HandlerRegistry {
    default: Arc<dyn StageHandler>,
    by_stage: HashMap<String, Arc<dyn StageHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut stages: Vec<_> = self.by_stage.keys().collect();
        stages.sort();
        f.debug_struct("HandlerRegistry").field("overrides", &stages).finish()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new(Arc::new(PromptStageHandler::default()))
    }
}

impl HandlerRegistry {
    pub fn new(default: Arc<dyn StageHandler>) -> Self {
        Self { default, by_stage: HashMap::new() }
    }

    /// Use `handler` for one stage.
    pub fn register(&mut self, stage_id: impl Into<String>, handler: Arc<dyn StageHandler>) {
        self.by_stage.insert(stage_id.into(), handler);
    }

    /// Handler for a stage, falling back to the default.
    pub fn get(&self, stage_id: &str) -> Arc<dyn StageHandler> {
        self.by_stage.get(stage_id).map_or_else(|| Arc::clone(&self.default), Arc::clone)
    }

    pub fn has_override(&self, stage_id: &str) -> bool {
        self.by_stage.contains_key(stage_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentManager, ProviderConfig, ProviderRegistry};
    use crate::cache::PromptCache;

    fn context(attempt: u32) -> StageContext {
        let registry = ProviderRegistry::from_configs(&[ProviderConfig::new("local")
            .with_capabilities(["text"])])
        .unwrap();
        let manager = Arc::new(AgentManager::new(registry, Arc::new(PromptCache::default())));
        let cancel = CancellationToken::new();
        let stage = StageDefinition::new("design", "Design", 4).with_capabilities(["text"]);
        let session = manager
            .open_session(&stage.id, &stage.required_capabilities, 4096, cancel.clone())
            .unwrap();
        StageContext {
            instance_id: "wf-1".into(),
            project_ref: "acme".into(),
            stage,
            attempt,
            agent: AgentHandle::new(manager, session, cancel.clone()),
            cancel,
        }
    }

    #[test]
    fn test_artifact_ref_is_deterministic() {
        assert_eq!(artifact_ref("wf", "design", 2, "output"), "wf/design/2/output");
    }

    #[tokio::test]
    async fn test_prompt_handler_produces_attempt_scoped_artifacts() {
        let ctx = context(3);
        let handler = PromptStageHandler::default();
        let artifacts = handler.execute(&ctx, &StageInput::default()).await.unwrap();

        assert_eq!(artifacts.get("output").unwrap(), "wf-1/design/3/output");
        let turns = ctx.agent.context().unwrap();
        assert_eq!(turns.len(), 3);
        assert!(turns[0].pinned);
    }

    #[tokio::test]
    async fn test_prompt_handler_is_reinvocable() {
        let ctx = context(1);
        let handler = PromptStageHandler::default();
        let first = handler.execute(&ctx, &StageInput::default()).await.unwrap();
        let second = handler.execute(&ctx, &StageInput::default()).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_prompt_handler_honours_cancellation() {
        let ctx = context(1);
        ctx.cancel.cancel();
        let err = PromptStageHandler::default().execute(&ctx, &StageInput::default()).await.unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
    }

    #[test]
    fn test_render_lists_prior_artifacts() {
        let ctx = context(1);
        let mut input = StageInput::default();
        let mut prior = Artifacts::new();
        prior.insert("output".into(), "wf-1/discovery/1/output".into());
        input.prior_artifacts.insert("discovery".into(), prior);

        let prompt = PromptStageHandler::render(&ctx, &input);
        assert!(prompt.contains("Stage: Design (design)"));
        assert!(prompt.contains("- discovery.output: wf-1/discovery/1/output"));
    }

    #[test]
    fn test_registry_falls_back_to_default() {
        struct Fixed;

        #[async_trait]
        impl StageHandler for Fixed {
            async fn execute(&self, _ctx: &StageContext, _input: &StageInput) -> EngineResult<Artifacts> {
                Ok(Artifacts::new())
            }
        }

        let mut registry = HandlerRegistry::default();
        registry.register("testing", Arc::new(Fixed));
        assert!(registry.has_override("testing"));
        assert!(!registry.has_override("design"));
        assert!(Arc::ptr_eq(&registry.get("design"), &registry.get("planning")));
        assert!(!Arc::ptr_eq(&registry.get("design"), &registry.get("testing")));
    }
}
