//! # Stagewright
//!
//! Workflow orchestration for agent-assisted software delivery.
//!
//! A project moves through an ordered lifecycle of stages (discovery through
//! retrospective). Each stage runs pre-hooks, a handler that talks to language
//! models through the agent layer, and post-hooks, then commits exactly one
//! execution record to an append-only log.
//!
//! ## Features
//!
//! - **State machine**: `Pending -> Running -> Completed | Failed`, with cancellation
//! - **Retries**: per-stage exponential backoff with jitter, provider backoff hints honoured
//! - **Crash recovery**: pure replay of the instance log; interrupted attempts rerun under the same number
//! - **Agent sessions**: token-bounded context windows, cost accounting, per-provider rate limits
//! - **Prompt cache**: content-addressed, single-flight, TTL + LRU
//!
//! ## Quick Start
//!
//! ```bash
//! # Start a workflow and run it to the end
//! stagewright start acme --run
//!
//! # Inspect it
//! stagewright status <id>
//! ```

// Token counts and costs move between integer and float domains.
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_lossless)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::match_same_arms)]

pub mod agent;
pub mod cache;
pub mod core;
pub mod workflow;

// Re-export commonly used types
pub use crate::agent::{AgentHandle, AgentManager, Provider, ProviderConfig, ProviderRegistry};
pub use crate::cache::{CacheConfig, PromptCache};
pub use crate::core::{EngineConfig, EngineError, EngineResult};
pub use crate::workflow::{
    Orchestrator, Registry, StageDefinition, StageRegistry, StateStore, WorkflowInstance, WorkflowSnapshot,
    WorkflowStatus,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "stagewright";
