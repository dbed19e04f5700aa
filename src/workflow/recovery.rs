//! Crash recovery for interrupted workflows.

use std::sync::Arc;

use serde::Serialize;

use super::store::StateStore;
use super::types::{InFlightAttempt, WorkflowStatus};
use crate::core::EngineResult;

/// What recovery did to one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub instance_id: String,
    /// Committed stages, as replayed from the log
    pub stage_index: usize,
    pub status: WorkflowStatus,
    /// Attempt closed because it had no terminal record
    pub abandoned: Option<InFlightAttempt>,
    /// `WaitingOnHook` was reset to `Running`
    pub normalised: bool,
}

impl RecoveryReport {
    /// Whether anything was changed.
    pub fn repaired(&self) -> bool {
        self.abandoned.is_some() || self.normalised
    }
}

/// Re-derives the last checkpoint of interrupted instances.
#[derive(Clone)]
pub struct RecoveryManager {
    store: Arc<dyn StateStore>,
}

impl std::fmt::Debug for RecoveryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryManager").finish_non_exhaustive()
    }
}

impl RecoveryManager {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Recover one instance. Terminal instances are left as they are.
    ///
    /// Callers must make sure no attempt of this instance is live.
    pub async fn recover(&self, instance_id: &str) -> EngineResult<RecoveryReport> {
        let snapshot = self.store.load(instance_id).await?;
        let mut report = RecoveryReport {
            instance_id: instance_id.to_string(),
            stage_index: snapshot.instance.current_stage_index,
            status: snapshot.instance.status,
            abandoned: None,
            normalised: false,
        };

        if let Some(in_flight) = snapshot.in_flight {
            self.store.abandon_attempt(instance_id, &in_flight.stage_id, in_flight.attempt).await?;
            tracing::info!(
                instance_id,
                stage = %in_flight.stage_id,
                attempt = in_flight.attempt,
                "Abandoned interrupted attempt"
            );
            report.abandoned = Some(in_flight);
        }

        if report.status == WorkflowStatus::WaitingOnHook {
            let instance = self.store.set_status(instance_id, WorkflowStatus::Running).await?;
            report.status = instance.status;
            report.normalised = true;
        }

        if report.repaired() {
            tracing::info!(instance_id, stage_index = report.stage_index, status = %report.status, "Recovered workflow");
        }
        Ok(report)
    }

    /// Recover every non-terminal instance.
    pub async fn recover_all(&self) -> EngineResult<Vec<RecoveryReport>> {
        let ids = self.store.list_active().await?;
        let mut reports = Vec::with_capacity(ids.len());
        for id in ids {
            reports.push(self.recover(&id).await?);
        }
        Ok(reports)
    }
}
