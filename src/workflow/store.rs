//! Durable workflow state.
//!
//! Every instance is an append-only log of [`LogEntry`] values. Each write
//! appends exactly one entry after re-validating it against the replayed
//! state under the store's write lock, so a rejected or failed write leaves
//! the instance untouched.
//!
//! [`FileStateStore`] holds an advisory lock on the log file for each
//! read-validate-append, and hands out per-instance claims through a
//! sibling `<id>.lock` file, so several processes can share one state
//! directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use fs4::fs_std::FileExt;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;

use super::types::{LogEntry, StageExecutionRecord, WorkflowInstance, WorkflowSnapshot, WorkflowStatus};
use crate::core::{EngineError, EngineResult};

/// A committed attempt plus the status it leaves the instance in.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitRequest {
    pub record: StageExecutionRecord,
    pub status: WorkflowStatus,
}

/// Exclusive right to drive one instance, released on drop.
#[derive(Debug, Default)]
pub struct InstanceClaim {
    _lock: Option<std::fs::File>,
}

/// Persistence seam for workflow instances.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Persist a new instance.
    async fn create(&self, instance: &WorkflowInstance) -> EngineResult<()>;

    /// Replay an instance's log.
    async fn load(&self, instance_id: &str) -> EngineResult<WorkflowSnapshot>;

    /// Mark an attempt as in flight.
    async fn begin_attempt(&self, instance_id: &str, stage_id: &str, attempt: u32) -> EngineResult<()>;

    /// Append a record and the resulting status as one entry.
    async fn commit_advance(&self, instance_id: &str, request: CommitRequest) -> EngineResult<WorkflowSnapshot>;

    /// Journal a vetoed attempt.
    async fn record_veto(&self, instance_id: &str, record: StageExecutionRecord) -> EngineResult<()>;

    /// Change status (validated against the current status).
    async fn set_status(&self, instance_id: &str, status: WorkflowStatus) -> EngineResult<WorkflowInstance>;

    /// Close an in-flight attempt without a record.
    async fn abandon_attempt(&self, instance_id: &str, stage_id: &str, attempt: u32) -> EngineResult<()>;

    /// Ids of all non-terminal instances.
    async fn list_active(&self) -> EngineResult<Vec<String>>;

    /// Every known instance, newest first.
    async fn list(&self) -> EngineResult<Vec<WorkflowInstance>>;

    /// Claim an instance against other processes sharing this store.
    /// `None` while someone else holds it.
    async fn try_claim(&self, _instance_id: &str) -> EngineResult<Option<InstanceClaim>> {
        Ok(Some(InstanceClaim::default()))
    }
}

/// In-process store, used by tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    logs: Mutex<HashMap<String, (Vec<LogEntry>, WorkflowSnapshot)>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw log for an instance.
    pub fn entries(&self, instance_id: &str) -> Vec<LogEntry> {
        self.logs.lock().get(instance_id).map(|(log, _)| log.clone()).unwrap_or_default()
    }

    fn append(&self, instance_id: &str, entry: LogEntry) -> EngineResult<WorkflowSnapshot> {
        let mut logs = self.logs.lock();
        let (log, snapshot) = logs
            .get_mut(instance_id)
            .ok_or_else(|| EngineError::NotFound(format!("workflow {instance_id}")))?;
        snapshot.check(&entry)?;
        snapshot.apply(&entry);
        log.push(entry);
        Ok(snapshot.clone())
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn create(&self, instance: &WorkflowInstance) -> EngineResult<()> {
        let mut logs = self.logs.lock();
        if logs.contains_key(&instance.id) {
            return Err(EngineError::InvalidTransition(format!("workflow {} already exists", instance.id)));
        }
        let entry = LogEntry::Created { instance: instance.clone() };
        logs.insert(instance.id.clone(), (vec![entry], WorkflowSnapshot::new(instance.clone())));
        Ok(())
    }

    async fn load(&self, instance_id: &str) -> EngineResult<WorkflowSnapshot> {
        self.logs
            .lock()
            .get(instance_id)
            .map(|(_, snapshot)| snapshot.clone())
            .ok_or_else(|| EngineError::NotFound(format!("workflow {instance_id}")))
    }

    async fn begin_attempt(&self, instance_id: &str, stage_id: &str, attempt: u32) -> EngineResult<()> {
        let entry = LogEntry::AttemptStarted { stage_id: stage_id.to_string(), attempt, at: Utc::now() };
        self.append(instance_id, entry).map(drop)
    }

    async fn commit_advance(&self, instance_id: &str, request: CommitRequest) -> EngineResult<WorkflowSnapshot> {
        self.append(instance_id, LogEntry::Committed { record: request.record, status: request.status })
    }

    async fn record_veto(&self, instance_id: &str, record: StageExecutionRecord) -> EngineResult<()> {
        self.append(instance_id, LogEntry::Vetoed { record }).map(drop)
    }

    async fn set_status(&self, instance_id: &str, status: WorkflowStatus) -> EngineResult<WorkflowInstance> {
        self.append(instance_id, LogEntry::StatusChanged { status, at: Utc::now() })
            .map(|snapshot| snapshot.instance)
    }

    async fn abandon_attempt(&self, instance_id: &str, stage_id: &str, attempt: u32) -> EngineResult<()> {
        let entry = LogEntry::AttemptAbandoned { stage_id: stage_id.to_string(), attempt, at: Utc::now() };
        self.append(instance_id, entry).map(drop)
    }

    async fn list_active(&self) -> EngineResult<Vec<String>> {
        let mut ids: Vec<String> = self
            .logs
            .lock()
            .values()
            .filter(|(_, s)| !s.instance.status.is_terminal())
            .map(|(_, s)| s.instance.id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn list(&self) -> EngineResult<Vec<WorkflowInstance>> {
        let mut instances: Vec<WorkflowInstance> =
            self.logs.lock().values().map(|(_, s)| s.instance.clone()).collect();
        instances.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(instances)
    }
}

/// JSON-lines store: one `<instance_id>.jsonl` file per instance.
#[derive(Debug)]
pub struct FileStateStore {
    dir: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileStateStore {
    /// Open (creating if needed) a state directory.
    pub fn open(dir: impl Into<PathBuf>) -> EngineResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, write_lock: tokio::sync::Mutex::new(()) })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, instance_id: &str) -> EngineResult<PathBuf> {
        let valid = !instance_id.is_empty()
            && instance_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(EngineError::NotFound(format!("workflow {instance_id}")));
        }
        Ok(self.dir.join(format!("{instance_id}.jsonl")))
    }

    fn lock_path(&self, instance_id: &str) -> EngineResult<PathBuf> {
        self.path_for(instance_id).map(|path| path.with_extension("lock"))
    }

    /// Parse a log file. A torn trailing line (crash mid-write) is ignored
    /// and reported through [`ParsedLog::torn_tail`].
    fn parse(instance_id: &str, content: &str) -> EngineResult<ParsedLog> {
        let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
        let mut parsed = ParsedLog { entries: Vec::with_capacity(lines.len()), torn_tail: false };
        for (i, line) in lines.iter().enumerate() {
            match serde_json::from_str::<LogEntry>(line) {
                Ok(entry) => parsed.entries.push(entry),
                Err(err) if i + 1 == lines.len() && !content.ends_with('\n') => {
                    tracing::warn!(instance_id, error = %err, "Ignoring torn trailing log line");
                    parsed.torn_tail = true;
                }
                Err(err) => {
                    return Err(EngineError::Storage(format!(
                        "corrupt log for {instance_id} at line {}: {err}",
                        i + 1
                    )))
                }
            }
        }
        Ok(parsed)
    }

    async fn read_log(&self, instance_id: &str) -> EngineResult<(PathBuf, String)> {
        let path = self.path_for(instance_id)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok((path, content)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(EngineError::NotFound(format!("workflow {instance_id}")))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Block until this process holds the exclusive lock on `path`.
    async fn lock_file(instance_id: &str, path: &Path) -> EngineResult<std::fs::File> {
        let path = path.to_path_buf();
        let locked = tokio::task::spawn_blocking(move || {
            let file = std::fs::OpenOptions::new().read(true).open(path)?;
            FileExt::lock_exclusive(&file)?;
            Ok::<_, std::io::Error>(file)
        })
        .await
        .map_err(|err| EngineError::Storage(format!("lock task failed: {err}")))?;

        match locked {
            Ok(file) => Ok(file),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(EngineError::NotFound(format!("workflow {instance_id}")))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn append(&self, instance_id: &str, entry: LogEntry) -> EngineResult<WorkflowSnapshot> {
        let _guard = self.write_lock.lock().await;
        let _file_lock = Self::lock_file(instance_id, &self.path_for(instance_id)?).await?;

        let (path, content) = self.read_log(instance_id).await?;
        let parsed = Self::parse(instance_id, &content)?;
        let mut snapshot = WorkflowSnapshot::replay(&parsed.entries)?;
        snapshot.check(&entry)?;

        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new().append(true).open(&path).await?;
        if !content.is_empty() && !content.ends_with('\n') {
            if parsed.torn_tail {
                let keep = content.rfind('\n').map_or(0, |i| i + 1);
                file.set_len(keep as u64).await?;
            } else {
                // Last entry is whole; only its newline is missing.
                line.insert(0, '\n');
            }
        }
        file.write_all(line.as_bytes()).await?;
        file.sync_data().await?;

        snapshot.apply(&entry);
        tracing::trace!(instance_id, "Appended log entry");
        Ok(snapshot)
    }
}

/// Entries of a log file, and whether an unparseable tail was dropped.
#[derive(Debug)]
struct ParsedLog {
    entries: Vec<LogEntry>,
    torn_tail: bool,
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn create(&self, instance: &WorkflowInstance) -> EngineResult<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.path_for(&instance.id)?;

        let mut line = serde_json::to_string(&LogEntry::Created { instance: instance.clone() })?;
        line.push('\n');

        let mut file = match tokio::fs::OpenOptions::new().write(true).create_new(true).open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(EngineError::InvalidTransition(format!(
                    "workflow {} already exists",
                    instance.id
                )))
            }
            Err(err) => return Err(err.into()),
        };
        file.write_all(line.as_bytes()).await?;
        file.sync_data().await?;
        tracing::debug!(instance_id = %instance.id, path = %path.display(), "Created workflow log");
        Ok(())
    }

    async fn load(&self, instance_id: &str) -> EngineResult<WorkflowSnapshot> {
        let (_, content) = self.read_log(instance_id).await?;
        WorkflowSnapshot::replay(&Self::parse(instance_id, &content)?.entries)
    }

    async fn begin_attempt(&self, instance_id: &str, stage_id: &str, attempt: u32) -> EngineResult<()> {
        let entry = LogEntry::AttemptStarted { stage_id: stage_id.to_string(), attempt, at: Utc::now() };
        self.append(instance_id, entry).await.map(drop)
    }

    async fn commit_advance(&self, instance_id: &str, request: CommitRequest) -> EngineResult<WorkflowSnapshot> {
        self.append(instance_id, LogEntry::Committed { record: request.record, status: request.status })
            .await
    }

    async fn record_veto(&self, instance_id: &str, record: StageExecutionRecord) -> EngineResult<()> {
        self.append(instance_id, LogEntry::Vetoed { record }).await.map(drop)
    }

    async fn set_status(&self, instance_id: &str, status: WorkflowStatus) -> EngineResult<WorkflowInstance> {
        self.append(instance_id, LogEntry::StatusChanged { status, at: Utc::now() })
            .await
            .map(|snapshot| snapshot.instance)
    }

    async fn abandon_attempt(&self, instance_id: &str, stage_id: &str, attempt: u32) -> EngineResult<()> {
        let entry = LogEntry::AttemptAbandoned { stage_id: stage_id.to_string(), attempt, at: Utc::now() };
        self.append(instance_id, entry).await.map(drop)
    }

    async fn list_active(&self) -> EngineResult<Vec<String>> {
        let mut ids: Vec<String> = self
            .list()
            .await?
            .into_iter()
            .filter(|i| !i.status.is_terminal())
            .map(|i| i.id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn list(&self) -> EngineResult<Vec<WorkflowInstance>> {
        let mut instances = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.load(id).await {
                Ok(snapshot) => instances.push(snapshot.instance),
                Err(err) => tracing::warn!(path = %path.display(), error = %err, "Skipping unreadable workflow log"),
            }
        }
        instances.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(instances)
    }

    async fn try_claim(&self, instance_id: &str) -> EngineResult<Option<InstanceClaim>> {
        if !tokio::fs::try_exists(self.path_for(instance_id)?).await? {
            return Err(EngineError::NotFound(format!("workflow {instance_id}")));
        }

        let path = self.lock_path(instance_id)?;
        let claimed = tokio::task::spawn_blocking(move || {
            let file = std::fs::OpenOptions::new().create(true).truncate(false).write(true).open(path)?;
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => Ok(Some(file)),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
                Err(err) => Err(err),
            }
        })
        .await
        .map_err(|err| EngineError::Storage(format!("claim task failed: {err}")))??;

        if claimed.is_none() {
            tracing::debug!(instance_id, "Workflow is claimed by another process");
        }
        Ok(claimed.map(|file| InstanceClaim { _lock: Some(file) }))
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::workflow::types::StageOutcome;

    fn record(stage: &str, attempt: u32, outcome: StageOutcome) -> StageExecutionRecord {
        StageExecutionRecord::new(stage, attempt, Utc::now(), outcome, None)
    }

    async fn exercise(store: &dyn StateStore) {
        let instance = WorkflowInstance::new("acme");
        store.create(&instance).await.unwrap();
        assert!(store.create(&instance).await.is_err());

        store.set_status(&instance.id, WorkflowStatus::Running).await.unwrap();
        store.begin_attempt(&instance.id, "a", 1).await.unwrap();
        assert!(store.begin_attempt(&instance.id, "a", 1).await.is_err());

        let snapshot = store
            .commit_advance(
                &instance.id,
                CommitRequest { record: record("a", 1, StageOutcome::Success), status: WorkflowStatus::Running },
            )
            .await
            .unwrap();
        assert_eq!(snapshot.instance.current_stage_index, 1);

        store.record_veto(&instance.id, record("b", 1, StageOutcome::Vetoed)).await.unwrap();
        let loaded = store.load(&instance.id).await.unwrap();
        assert_eq!(loaded.history, snapshot.history);
        assert_eq!(loaded.vetoes.len(), 1);
        assert_eq!(loaded.next_attempt("b"), 2);
        assert_eq!(store.list_active().await.unwrap(), vec![instance.id.clone()]);

        store.set_status(&instance.id, WorkflowStatus::Cancelled).await.unwrap();
        let err = store.begin_attempt(&instance.id, "b", 2).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition(_)));
        assert!(store.list_active().await.unwrap().is_empty());
        assert_eq!(store.list().await.unwrap().len(), 1);

        assert!(matches!(store.load("missing").await, Err(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        exercise(&InMemoryStateStore::new()).await;
    }

    #[tokio::test]
    async fn test_file_store() {
        let dir = TempDir::new().unwrap();
        exercise(&FileStateStore::open(dir.path()).unwrap()).await;
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen_and_torn_tail() {
        let dir = TempDir::new().unwrap();
        let instance = WorkflowInstance::new("acme");
        {
            let store = FileStateStore::open(dir.path()).unwrap();
            store.create(&instance).await.unwrap();
            store.set_status(&instance.id, WorkflowStatus::Running).await.unwrap();
            store.begin_attempt(&instance.id, "a", 1).await.unwrap();
        }

        let path = dir.path().join(format!("{}.jsonl", instance.id));
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str(r#"{"event":"committed","rec"#);
        std::fs::write(&path, content).unwrap();

        let store = FileStateStore::open(dir.path()).unwrap();
        let snapshot = store.load(&instance.id).await.unwrap();
        assert_eq!(snapshot.instance.status, WorkflowStatus::Running);
        assert_eq!(snapshot.in_flight.as_ref().unwrap().attempt, 1);

        // Appending after a torn tail replaces it.
        store.abandon_attempt(&instance.id, "a", 1).await.unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.ends_with('\n'));
        assert!(raw.lines().all(|l| serde_json::from_str::<LogEntry>(l).is_ok()));
        assert!(store.load(&instance.id).await.unwrap().in_flight.is_none());
    }

    #[tokio::test]
    async fn test_file_store_keeps_whole_entry_missing_its_newline() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::open(dir.path()).unwrap();
        let instance = WorkflowInstance::new("acme");
        store.create(&instance).await.unwrap();
        store.set_status(&instance.id, WorkflowStatus::Running).await.unwrap();
        store.begin_attempt(&instance.id, "a", 1).await.unwrap();
        store
            .commit_advance(
                &instance.id,
                CommitRequest { record: record("a", 1, StageOutcome::Success), status: WorkflowStatus::Running },
            )
            .await
            .unwrap();

        // Crash after the entry but before its newline reached disk.
        let path = dir.path().join(format!("{}.jsonl", instance.id));
        let content = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, content.trim_end_matches('\n')).unwrap();
        assert_eq!(store.load(&instance.id).await.unwrap().history.len(), 1);

        store.begin_attempt(&instance.id, "b", 1).await.unwrap();
        let snapshot = store.load(&instance.id).await.unwrap();
        assert_eq!(snapshot.instance.current_stage_index, 1);
        assert_eq!(snapshot.history.len(), 1);
        assert_eq!(snapshot.in_flight.as_ref().unwrap().stage_id, "b");

        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(raw.lines().count(), 5);
        assert!(raw.lines().all(|l| serde_json::from_str::<LogEntry>(l).is_ok()));
    }

    #[tokio::test]
    async fn test_file_store_claims_are_exclusive_across_handles() {
        let dir = TempDir::new().unwrap();
        let first = FileStateStore::open(dir.path()).unwrap();
        let second = FileStateStore::open(dir.path()).unwrap();
        let instance = WorkflowInstance::new("acme");
        first.create(&instance).await.unwrap();

        let claim = first.try_claim(&instance.id).await.unwrap();
        assert!(claim.is_some());
        assert!(second.try_claim(&instance.id).await.unwrap().is_none());

        // Claims do not block log writes from the other handle.
        second.set_status(&instance.id, WorkflowStatus::Cancelled).await.unwrap();

        drop(claim);
        assert!(second.try_claim(&instance.id).await.unwrap().is_some());
        assert!(matches!(second.try_claim("missing").await, Err(EngineError::NotFound(_))));
        assert_eq!(second.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_in_memory_claims_always_succeed() {
        let store = InMemoryStateStore::new();
        assert!(store.try_claim("anything").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_file_store_rejects_corrupt_middle_line() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::open(dir.path()).unwrap();
        let instance = WorkflowInstance::new("acme");
        store.create(&instance).await.unwrap();

        let path = dir.path().join(format!("{}.jsonl", instance.id));
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("garbage\n");
        std::fs::write(&path, content).unwrap();

        assert!(matches!(store.load(&instance.id).await, Err(EngineError::Storage(_))));
    }

    #[tokio::test]
    async fn test_path_traversal_ids_are_not_found() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::open(dir.path()).unwrap();
        assert!(matches!(store.load("../etc/passwd").await, Err(EngineError::NotFound(_))));
    }
}
