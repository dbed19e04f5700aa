//! Core types shared by the engine.
//!
//! This module contains the error type, configuration, and the retry policy
//! used by the orchestrator.

mod config;
mod error;
pub mod retry;

pub use config::{EngineConfig, GeneralConfig, CONFIG_ENV, LOCAL_CONFIG};
pub use error::{EngineError, EngineResult, ErrorKind};
pub use retry::RetryPolicy;
