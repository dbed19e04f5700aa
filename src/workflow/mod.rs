//! Workflow orchestration engine.
//!
//! Drives a project through an ordered lifecycle of stages, one committed
//! attempt at a time.
//!
//! ## Building blocks
//!
//! - [`StageRegistry`] - ordered stage definitions (the 12-stage lifecycle by default)
//! - [`HookPipeline`] - mandatory and optional pre/post hooks per stage
//! - [`StageHandler`] - does a stage's work through an [`AgentHandle`](crate::agent::AgentHandle)
//! - [`StateStore`] - append-only instance log ([`InMemoryStateStore`], [`FileStateStore`])
//! - [`RecoveryManager`] - closes attempts interrupted by a crash
//! - [`Orchestrator`] - the state machine tying it together

mod handler;
mod hooks;
mod orchestrator;
mod recovery;
mod stages;
mod store;
mod types;

pub use handler::{artifact_ref, HandlerRegistry, PromptStageHandler, StageContext, StageHandler, StageInput};
pub use hooks::{FnHook, Hook, HookContext, HookPhase, HookPipeline, HookReport};
pub use orchestrator::{AdvanceOutcome, Orchestrator, OrchestratorConfig, Registry, VetoPolicy};
pub use recovery::{RecoveryManager, RecoveryReport};
pub use stages::{StageDefinition, StageOverride, StageRegistry, DEFAULT_CONTEXT_BUDGET, DEFAULT_STAGE_TIMEOUT};
pub use store::{CommitRequest, FileStateStore, InMemoryStateStore, InstanceClaim, StateStore};
pub use types::{
    Artifacts, InFlightAttempt, LogEntry, RecordError, StageExecutionRecord, StageOutcome, WorkflowInstance,
    WorkflowSnapshot, WorkflowStatus,
};
