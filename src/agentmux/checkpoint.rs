//! Persisted checkpoints for staged runs.
//!
//! Every resumable run owns a directory `<root>/<runId>/` containing:
//!
//! ```text
//! checkpoint.json   — full mutable state (CheckpointData), SHA-256 checksummed
//! metadata.json     — summary derived from the stage states
//! artifacts/        — populated by stages
//! logs/             — populated by stages
//! ```
//!
//! The checksum covers the JSON serialisation of the checkpoint with the
//! `checksum` and `updatedAt` fields removed; a missing or mismatching
//! checksum fails the load with `CHECKSUM_MISMATCH`. Run ids must be
//! lowercase hyphenated UUIDs and must resolve inside the checkpoint root
//! after canonicalisation.
//!
//! # Example
//!
//! ```rust,no_run
//! use agentmux::checkpoint::{CheckpointData, CheckpointStore, ExecutionModeFlags};
//!
//! # fn main() -> Result<(), agentmux::checkpoint::CheckpointError> {
//! let store = CheckpointStore::new("checkpoints")?;
//!
//! let mut data = CheckpointData::new("researcher", "Summarise the corpus");
//! data.mode = ExecutionModeFlags { resumable: true, ..Default::default() };
//! store.save(&mut data)?;
//!
//! let restored = store.load(&data.run_id)?;
//! assert_eq!(restored.agent, "researcher");
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

/// Current checkpoint schema version.
pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

/// Terminal and in-flight states of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    /// Not started.
    Pending,
    /// An attempt is in flight.
    Running,
    /// Finished successfully.
    Completed,
    /// Exhausted its retries (or was aborted mid-failure).
    Error,
    /// Skipped by the user or by resume semantics.
    Skipped,
    /// Paused at the post-stage checkpoint.
    Checkpoint,
}

/// The recorded outcome of one stage execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageOutcome {
    /// `Completed`, `Error`, or `Skipped`.
    pub status: StageStatus,
    /// Stage output, present on completion.
    pub output: Option<String>,
    /// Failure text, present on error.
    pub error: Option<String>,
    /// Wall-clock duration of the final attempt, in milliseconds.
    pub duration_ms: u64,
    /// Total tokens consumed across attempts.
    pub tokens_used: usize,
    /// Retries performed before this outcome.
    pub retries: u32,
    /// When the outcome was recorded.
    pub timestamp: DateTime<Utc>,
    /// Paths of artifacts the stage produced.
    pub artifacts: Vec<String>,
}

/// Persisted snapshot of one declared stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageRecord {
    /// Stage name.
    pub name: String,
    /// Stage description (including any user modifications).
    pub description: String,
    /// Current status.
    pub status: StageStatus,
    /// Retries performed so far.
    pub retries: u32,
    /// Recorded outcome, when the stage reached a terminal state.
    pub result: Option<StageOutcome>,
}

/// Execution mode flags captured in the checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionModeFlags {
    /// Prompt the user at stage boundaries and on failures.
    pub interactive: bool,
    /// Stream provider output (reserved for streaming front-ends).
    pub streaming: bool,
    /// Persist checkpoints and allow resume.
    pub resumable: bool,
    /// Auto-answer every checkpoint prompt with "continue".
    pub auto_confirm: bool,
}

/// Full mutable state of a staged run.
///
/// Field order matches the wire format:
/// `schemaVersion, checksum, runId, agent, task, mode, stages,
/// lastCompletedStageIndex, previousOutputs, sharedData, createdAt,
/// updatedAt`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointData {
    /// Schema version, currently 1.
    pub schema_version: u32,
    /// SHA-256 hex over the serialisation minus `checksum` and `updatedAt`.
    pub checksum: String,
    /// Run identifier (lowercase hyphenated UUID).
    pub run_id: String,
    /// Agent the run belongs to.
    pub agent: String,
    /// The original task.
    pub task: String,
    /// Mode flags.
    pub mode: ExecutionModeFlags,
    /// Stage snapshots.
    pub stages: Vec<StageRecord>,
    /// Greatest index whose stage is `Completed`, `-1` when none.
    pub last_completed_stage_index: i64,
    /// Outputs of completed stages, in stage order.
    pub previous_outputs: Vec<String>,
    /// Free-form data shared across stages.
    pub shared_data: serde_json::Map<String, Value>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last save time.
    pub updated_at: DateTime<Utc>,
}

impl CheckpointData {
    /// Fresh checkpoint for a new run with a generated run id.
    pub fn new(agent: impl Into<String>, task: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            checksum: String::new(),
            run_id: uuid::Uuid::new_v4().to_string(),
            agent: agent.into(),
            task: task.into(),
            mode: ExecutionModeFlags::default(),
            stages: Vec::new(),
            last_completed_stage_index: -1,
            previous_outputs: Vec::new(),
            shared_data: serde_json::Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Recompute `last_completed_stage_index` from the stage snapshots.
    pub fn recompute_last_completed(&mut self) {
        self.last_completed_stage_index = self
            .stages
            .iter()
            .enumerate()
            .filter(|(_, s)| s.status == StageStatus::Completed)
            .map(|(i, _)| i as i64)
            .max()
            .unwrap_or(-1);
    }
}

/// Overall run status derived from the stage states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// A stage is in flight.
    Running,
    /// A stage errored.
    Failed,
    /// Paused at a checkpoint (or not yet finished).
    Paused,
    /// Every stage completed or was skipped.
    Completed,
}

/// Summary persisted next to the checkpoint as `metadata.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointMetadata {
    /// Run identifier.
    pub run_id: String,
    /// Agent the run belongs to.
    pub agent: String,
    /// The original task.
    pub task: String,
    /// Mode flags.
    pub mode: ExecutionModeFlags,
    /// Total number of declared stages.
    pub total_stages: usize,
    /// Number of completed stages.
    pub completed_stages: usize,
    /// Derived run status.
    pub status: RunStatus,
    /// Run creation time.
    pub started_at: DateTime<Utc>,
    /// Last save time.
    pub updated_at: DateTime<Utc>,
    /// Always true for persisted runs.
    pub resumable: bool,
}

/// Derive the summary status from stage states.
///
/// Any `Running` wins, then any `Error`, then any `Checkpoint`; a run whose
/// stages are all `Completed`/`Skipped` is `Completed`; anything else is
/// `Paused`.
pub fn derive_run_status(stages: &[StageRecord]) -> RunStatus {
    if stages.iter().any(|s| s.status == StageStatus::Running) {
        return RunStatus::Running;
    }
    if stages.iter().any(|s| s.status == StageStatus::Error) {
        return RunStatus::Failed;
    }
    if stages.iter().any(|s| s.status == StageStatus::Checkpoint) {
        return RunStatus::Paused;
    }
    if !stages.is_empty()
        && stages
            .iter()
            .all(|s| matches!(s.status, StageStatus::Completed | StageStatus::Skipped))
    {
        return RunStatus::Completed;
    }
    RunStatus::Paused
}

/// Errors surfaced by checkpoint persistence.
#[derive(Debug)]
pub enum CheckpointError {
    /// The run id is not a lowercase hyphenated UUID.
    InvalidRunId(String),
    /// The run directory would escape the checkpoint root.
    PathEscape(String),
    /// The checksum is missing or does not validate.
    ChecksumMismatch,
    /// No checkpoint exists for the run id.
    NotFound(String),
    /// Filesystem failure.
    Io(std::io::Error),
    /// Serialisation failure.
    Serde(serde_json::Error),
}

impl std::fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckpointError::InvalidRunId(id) => write!(f, "Invalid run id: {}", id),
            CheckpointError::PathEscape(id) => {
                write!(f, "Run id escapes the checkpoint root: {}", id)
            }
            CheckpointError::ChecksumMismatch => write!(f, "CHECKSUM_MISMATCH"),
            CheckpointError::NotFound(id) => write!(f, "Checkpoint not found: {}", id),
            CheckpointError::Io(e) => write!(f, "Checkpoint I/O error: {}", e),
            CheckpointError::Serde(e) => write!(f, "Checkpoint serialisation error: {}", e),
        }
    }
}

impl std::error::Error for CheckpointError {}

impl From<std::io::Error> for CheckpointError {
    fn from(e: std::io::Error) -> Self {
        CheckpointError::Io(e)
    }
}

impl From<serde_json::Error> for CheckpointError {
    fn from(e: serde_json::Error) -> Self {
        CheckpointError::Serde(e)
    }
}

/// Reads and writes checkpoints under one root directory.
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    /// Create the store, creating the root directory recursively.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// The checkpoint root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persist a checkpoint: stamps `updated_at`, recomputes the checksum,
    /// and writes `checkpoint.json` plus the derived `metadata.json`. The
    /// `artifacts/` and `logs/` directories are created empty if absent.
    pub fn save(&self, data: &mut CheckpointData) -> Result<(), CheckpointError> {
        let dir = self.run_dir(&data.run_id)?;
        fs::create_dir_all(dir.join("artifacts"))?;
        fs::create_dir_all(dir.join("logs"))?;

        data.updated_at = Utc::now();
        data.checksum = compute_checksum(data)?;

        fs::write(
            dir.join("checkpoint.json"),
            serde_json::to_string_pretty(data)?,
        )?;

        let metadata = CheckpointMetadata {
            run_id: data.run_id.clone(),
            agent: data.agent.clone(),
            task: data.task.clone(),
            mode: data.mode,
            total_stages: data.stages.len(),
            completed_stages: data
                .stages
                .iter()
                .filter(|s| s.status == StageStatus::Completed)
                .count(),
            status: derive_run_status(&data.stages),
            started_at: data.created_at,
            updated_at: data.updated_at,
            resumable: true,
        };
        fs::write(
            dir.join("metadata.json"),
            serde_json::to_string_pretty(&metadata)?,
        )?;
        Ok(())
    }

    /// Load and verify a checkpoint.
    pub fn load(&self, run_id: &str) -> Result<CheckpointData, CheckpointError> {
        let dir = self.run_dir(run_id)?;
        let file = dir.join("checkpoint.json");
        if !file.exists() {
            return Err(CheckpointError::NotFound(run_id.to_string()));
        }
        let data: CheckpointData = serde_json::from_str(&fs::read_to_string(file)?)?;
        if data.checksum.is_empty() || data.checksum != compute_checksum(&data)? {
            return Err(CheckpointError::ChecksumMismatch);
        }
        Ok(data)
    }

    /// Load the summary metadata for a run.
    pub fn metadata(&self, run_id: &str) -> Result<CheckpointMetadata, CheckpointError> {
        let file = self.run_dir(run_id)?.join("metadata.json");
        if !file.exists() {
            return Err(CheckpointError::NotFound(run_id.to_string()));
        }
        Ok(serde_json::from_str(&fs::read_to_string(file)?)?)
    }

    /// Run ids of every stored checkpoint.
    pub fn list(&self) -> Result<Vec<String>, CheckpointError> {
        let mut runs = Vec::new();
        for dir_entry in fs::read_dir(&self.root)? {
            let dir_entry = dir_entry?;
            let name = dir_entry.file_name().to_string_lossy().into_owned();
            if is_valid_run_id(&name) && dir_entry.path().join("checkpoint.json").exists() {
                runs.push(name);
            }
        }
        runs.sort();
        Ok(runs)
    }

    /// Remove one checkpoint directory.
    pub fn delete(&self, run_id: &str) -> Result<(), CheckpointError> {
        let dir = self.run_dir(run_id)?;
        if !dir.exists() {
            return Err(CheckpointError::NotFound(run_id.to_string()));
        }
        fs::remove_dir_all(dir)?;
        Ok(())
    }

    /// Remove checkpoints not saved within the given number of days.
    /// Returns the number removed.
    pub fn cleanup(&self, older_than_days: i64) -> Result<usize, CheckpointError> {
        let cutoff = Utc::now() - ChronoDuration::days(older_than_days);
        let mut removed = 0;
        for run_id in self.list()? {
            let stale = match self.metadata(&run_id) {
                Ok(metadata) => metadata.updated_at < cutoff,
                // A checkpoint without readable metadata is treated as stale.
                Err(_) => true,
            };
            if stale {
                self.delete(&run_id)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Validate the run id and resolve its directory inside the root.
    fn run_dir(&self, run_id: &str) -> Result<PathBuf, CheckpointError> {
        if !is_valid_run_id(run_id) {
            return Err(CheckpointError::InvalidRunId(run_id.to_string()));
        }
        let canonical_root = self
            .root
            .canonicalize()
            .unwrap_or_else(|_| self.root.clone());
        let dir = canonical_root.join(run_id);
        if !dir.starts_with(&canonical_root) {
            return Err(CheckpointError::PathEscape(run_id.to_string()));
        }
        Ok(dir)
    }
}

/// Whether `id` matches `^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$`.
pub fn is_valid_run_id(id: &str) -> bool {
    let bytes = id.as_bytes();
    if bytes.len() != 36 {
        return false;
    }
    for (i, b) in bytes.iter().enumerate() {
        match i {
            8 | 13 | 18 | 23 => {
                if *b != b'-' {
                    return false;
                }
            }
            _ => {
                if !matches!(b, b'0'..=b'9' | b'a'..=b'f') {
                    return false;
                }
            }
        }
    }
    true
}

/// SHA-256 hex over the checkpoint's JSON with `checksum` and `updatedAt`
/// removed. Object keys serialize in a stable order, so the digest is
/// deterministic across save and load.
pub fn compute_checksum(data: &CheckpointData) -> Result<String, serde_json::Error> {
    let mut value = serde_json::to_value(data)?;
    if let Value::Object(map) = &mut value {
        map.remove("checksum");
        map.remove("updatedAt");
    }
    let canonical = serde_json::to_string(&value)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_validation() {
        assert!(is_valid_run_id("01234567-89ab-cdef-0123-456789abcdef"));
        assert!(!is_valid_run_id("01234567-89AB-cdef-0123-456789abcdef"));
        assert!(!is_valid_run_id("not-a-uuid"));
        assert!(!is_valid_run_id("../escape/....-89ab-cdef-0123-456789abcdef"));
        assert!(is_valid_run_id(&uuid::Uuid::new_v4().to_string()));
    }

    #[test]
    fn status_derivation_precedence() {
        let stage = |status| StageRecord {
            name: "s".to_string(),
            description: String::new(),
            status,
            retries: 0,
            result: None,
        };

        assert_eq!(
            derive_run_status(&[stage(StageStatus::Running), stage(StageStatus::Error)]),
            RunStatus::Running
        );
        assert_eq!(
            derive_run_status(&[stage(StageStatus::Completed), stage(StageStatus::Error)]),
            RunStatus::Failed
        );
        assert_eq!(
            derive_run_status(&[stage(StageStatus::Completed), stage(StageStatus::Checkpoint)]),
            RunStatus::Paused
        );
        assert_eq!(
            derive_run_status(&[stage(StageStatus::Completed), stage(StageStatus::Skipped)]),
            RunStatus::Completed
        );
        assert_eq!(
            derive_run_status(&[stage(StageStatus::Completed), stage(StageStatus::Pending)]),
            RunStatus::Paused
        );
    }

    #[test]
    fn checksum_ignores_updated_at() {
        let mut data = CheckpointData::new("agent", "task");
        let first = compute_checksum(&data).unwrap();
        data.updated_at = Utc::now() + ChronoDuration::hours(1);
        let second = compute_checksum(&data).unwrap();
        assert_eq!(first, second);

        data.task = "different task".to_string();
        assert_ne!(first, compute_checksum(&data).unwrap());
    }
}
