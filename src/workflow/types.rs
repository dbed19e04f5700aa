//! Workflow data model and the append-only instance log.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::{SessionSummary, TokenUsage};
use crate::core::{EngineError, EngineResult, ErrorKind};

/// Artifact name -> opaque reference.
pub type Artifacts = BTreeMap<String, String>;

/// Lifecycle status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    /// Transient sub-state of `Running` while hooks execute.
    WaitingOnHook,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    /// Completed, Failed and Cancelled never transition again (except a
    /// manual restart of a Failed instance).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether `self -> next` is a legal status change.
    pub fn can_transition_to(self, next: Self) -> bool {
        use WorkflowStatus::{Cancelled, Completed, Failed, Pending, Running, WaitingOnHook};
        match (self, next) {
            (Pending, Running | Cancelled) => true,
            (Running | WaitingOnHook, Running | WaitingOnHook | Completed | Failed | Cancelled) => {
                true
            }
            // Manual restart.
            (Failed, Running) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::WaitingOnHook => "waiting_on_hook",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.pad(label)
    }
}

/// One run of the lifecycle for one project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: String,
    pub project_ref: String,
    /// Number of committed stages.
    pub current_stage_index: usize,
    pub status: WorkflowStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowInstance {
    /// Fresh `Pending` instance with a random id.
    pub fn new(project_ref: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project_ref: project_ref.into(),
            current_stage_index: 0,
            status: WorkflowStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }
}

/// How an attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Success,
    Failed,
    Vetoed,
}

/// Error summary stored on a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&EngineError> for RecordError {
    fn from(err: &EngineError) -> Self {
        Self { kind: err.kind(), message: err.to_string() }
    }
}

/// One attempt of one stage. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageExecutionRecord {
    pub stage_id: String,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: StageOutcome,
    #[serde(default)]
    pub artifacts: Artifacts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RecordError>,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub usage: TokenUsage,
    #[serde(default)]
    pub provider_calls: u32,
    #[serde(default)]
    pub cache_hits: u32,
}

impl StageExecutionRecord {
    /// Build a record, rolling up the attempt's session totals.
    pub fn new(
        stage_id: impl Into<String>,
        attempt: u32,
        started_at: DateTime<Utc>,
        outcome: StageOutcome,
        session: Option<&SessionSummary>,
    ) -> Self {
        let session = session.cloned().unwrap_or_default();
        Self {
            stage_id: stage_id.into(),
            attempt,
            started_at,
            finished_at: Utc::now(),
            outcome,
            artifacts: Artifacts::new(),
            error: None,
            cost: session.cost,
            usage: session.usage,
            provider_calls: session.provider_calls,
            cache_hits: session.cache_hits,
        }
    }

    /// Attach artifacts.
    pub fn with_artifacts(mut self, artifacts: Artifacts) -> Self {
        self.artifacts = artifacts;
        self
    }

    /// Attach the error that ended the attempt.
    pub fn with_error(mut self, err: &EngineError) -> Self {
        self.error = Some(RecordError::from(err));
        self
    }
}

/// Attempt that has started but has no terminal entry yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InFlightAttempt {
    pub stage_id: String,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
}

/// One persisted event in an instance log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LogEntry {
    Created { instance: WorkflowInstance },
    StatusChanged { status: WorkflowStatus, at: DateTime<Utc> },
    AttemptStarted { stage_id: String, attempt: u32, at: DateTime<Utc> },
    /// Record and resulting status land together.
    Committed { record: StageExecutionRecord, status: WorkflowStatus },
    Vetoed { record: StageExecutionRecord },
    AttemptAbandoned { stage_id: String, attempt: u32, at: DateTime<Utc> },
}

/// Instance state plus history, as rebuilt from the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub instance: WorkflowInstance,
    /// Committed `Success` and `Failed` records, in commit order.
    pub history: Vec<StageExecutionRecord>,
    /// Vetoed attempts, journaled outside the committed history.
    pub vetoes: Vec<StageExecutionRecord>,
    /// Started attempt without a terminal entry.
    pub in_flight: Option<InFlightAttempt>,
    /// Per stage, the last attempt made before a manual restart.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub restarted_after: BTreeMap<String, u32>,
}

impl WorkflowSnapshot {
    /// Snapshot of a freshly created instance.
    pub fn new(instance: WorkflowInstance) -> Self {
        Self {
            instance,
            history: Vec::new(),
            vetoes: Vec::new(),
            in_flight: None,
            restarted_after: BTreeMap::new(),
        }
    }

    /// Rebuild state from a log. Pure: the same entries always give the
    /// same snapshot.
    ///
    /// Entries that fail [`Self::check`] against the state before them are
    /// skipped, so a write that lost a race (a commit landing after a
    /// cancel) can never move a terminal instance again.
    pub fn replay(entries: &[LogEntry]) -> EngineResult<Self> {
        let mut iter = entries.iter();
        let mut snapshot = match iter.next() {
            Some(LogEntry::Created { instance }) => Self::new(instance.clone()),
            Some(_) => {
                return Err(EngineError::Storage("log does not start with a created entry".into()))
            }
            None => return Err(EngineError::Storage("empty instance log".into())),
        };
        for entry in iter {
            if let Err(err) = snapshot.check(entry) {
                tracing::warn!(instance_id = %snapshot.instance.id, error = %err, "Skipping conflicting log entry");
                continue;
            }
            snapshot.apply(entry);
        }
        Ok(snapshot)
    }

    /// Apply one entry. Callers validate with [`Self::check`] first.
    pub fn apply(&mut self, entry: &LogEntry) {
        match entry {
            LogEntry::Created { .. } => {}
            LogEntry::StatusChanged { status, at } => {
                if self.instance.status == WorkflowStatus::Failed && *status == WorkflowStatus::Running {
                    if let Some(last) = self.history.last() {
                        let floor = self.next_attempt(&last.stage_id) - 1;
                        self.restarted_after.insert(last.stage_id.clone(), floor);
                    }
                }
                self.instance.status = *status;
                self.instance.updated_at = *at;
            }
            LogEntry::AttemptStarted { stage_id, attempt, at } => {
                self.in_flight = Some(InFlightAttempt {
                    stage_id: stage_id.clone(),
                    attempt: *attempt,
                    started_at: *at,
                });
            }
            LogEntry::Committed { record, status } => {
                if record.outcome == StageOutcome::Success {
                    self.instance.current_stage_index += 1;
                }
                self.instance.status = *status;
                self.instance.updated_at = record.finished_at;
                self.history.push(record.clone());
                self.in_flight = None;
            }
            LogEntry::Vetoed { record } => {
                self.instance.updated_at = record.finished_at;
                self.vetoes.push(record.clone());
                self.in_flight = None;
            }
            LogEntry::AttemptAbandoned { at, .. } => {
                self.instance.updated_at = *at;
                self.in_flight = None;
            }
        }
    }

    /// Reject entries that would break the instance invariants.
    pub fn check(&self, entry: &LogEntry) -> EngineResult<()> {
        let status = self.instance.status;
        let id = &self.instance.id;
        match entry {
            LogEntry::Created { .. } => {
                Err(EngineError::InvalidTransition(format!("instance {id} already exists")))
            }
            LogEntry::StatusChanged { status: next, .. } => {
                if status.can_transition_to(*next) {
                    Ok(())
                } else {
                    Err(EngineError::InvalidTransition(format!(
                        "instance {id} cannot go from {status} to {next}"
                    )))
                }
            }
            LogEntry::AttemptStarted { stage_id, attempt, .. } => {
                self.check_writable()?;
                if let Some(in_flight) = &self.in_flight {
                    return Err(EngineError::InvalidTransition(format!(
                        "instance {id} already has attempt {} of '{}' in flight",
                        in_flight.attempt, in_flight.stage_id
                    )));
                }
                self.check_attempt(stage_id, *attempt)
            }
            LogEntry::Committed { record, status: next } => {
                self.check_writable()?;
                if record.outcome == StageOutcome::Vetoed {
                    return Err(EngineError::InvalidTransition(
                        "vetoed attempts are not committed".into(),
                    ));
                }
                if !status.can_transition_to(*next) {
                    return Err(EngineError::InvalidTransition(format!(
                        "instance {id} cannot go from {status} to {next}"
                    )));
                }
                self.check_attempt(&record.stage_id, record.attempt)
            }
            LogEntry::Vetoed { record } => {
                self.check_writable()?;
                self.check_attempt(&record.stage_id, record.attempt)
            }
            // Allowed on terminal instances so a cancelled attempt can be closed.
            LogEntry::AttemptAbandoned { .. } => Ok(()),
        }
    }

    fn check_writable(&self) -> EngineResult<()> {
        if self.instance.status.is_terminal() {
            return Err(EngineError::InvalidTransition(format!(
                "instance {} is {}",
                self.instance.id, self.instance.status
            )));
        }
        Ok(())
    }

    fn check_attempt(&self, stage_id: &str, attempt: u32) -> EngineResult<()> {
        let expected = self.next_attempt(stage_id);
        if attempt != expected {
            return Err(EngineError::InvalidTransition(format!(
                "attempt {attempt} of '{stage_id}' out of order (expected {expected})"
            )));
        }
        Ok(())
    }

    /// Next attempt number for a stage. Abandoned attempts are not counted,
    /// so a rerun after a crash reuses the number.
    pub fn next_attempt(&self, stage_id: &str) -> u32 {
        self.history
            .iter()
            .chain(&self.vetoes)
            .filter(|r| r.stage_id == stage_id)
            .map(|r| r.attempt)
            .max()
            .unwrap_or(0)
            + 1
    }

    /// Attempts of a stage that count against its retry budget: failed
    /// commits (and vetoes, when `count_vetoes`) since the last restart.
    pub fn attempts_used(&self, stage_id: &str, count_vetoes: bool) -> u32 {
        let floor = self.restarted_after.get(stage_id).copied().unwrap_or(0);
        let vetoes: &[StageExecutionRecord] = if count_vetoes { &self.vetoes } else { &[] };
        self.history
            .iter()
            .filter(|r| r.outcome == StageOutcome::Failed)
            .chain(vetoes)
            .filter(|r| r.stage_id == stage_id && r.attempt > floor)
            .count() as u32
    }

    /// All attempts (committed and vetoed) for one stage, ordered by attempt.
    pub fn attempts_for(&self, stage_id: &str) -> Vec<&StageExecutionRecord> {
        let mut records: Vec<_> =
            self.history.iter().chain(&self.vetoes).filter(|r| r.stage_id == stage_id).collect();
        records.sort_by_key(|r| r.attempt);
        records
    }

    /// Artifacts of every committed successful stage, keyed by stage id.
    pub fn committed_artifacts(&self) -> BTreeMap<String, Artifacts> {
        self.history
            .iter()
            .filter(|r| r.outcome == StageOutcome::Success)
            .map(|r| (r.stage_id.clone(), r.artifacts.clone()))
            .collect()
    }

    /// Total cost over every recorded attempt.
    pub fn total_cost(&self) -> f64 {
        self.history.iter().chain(&self.vetoes).map(|r| r.cost).sum()
    }
}
