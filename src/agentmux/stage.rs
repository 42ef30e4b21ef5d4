//! Checkpointed, resumable execution of an agent's staged workflow.
//!
//! The [`StageExecutionController`] drives the ordered `stages[]` of one
//! agent profile: it materialises defaults onto the declared stages, runs
//! each stage with bounded retries and exponential backoff, optionally
//! pauses at interactive checkpoints, saves a [`CheckpointData`] snapshot
//! after every stage, persists completed stage outputs to the memory store,
//! and resumes a prior run from disk without re-executing completed stages.
//!
//! ```text
//! execute()
//!   ├─ stage 0 — attempt, retry w/ backoff, prompt on failure
//!   │     └─ checkpoint saved, output appended to previous_outputs
//!   ├─ [interactive] continue / modify / skip / abort
//!   ├─ stage 1 — prompt includes stage-0 output
//!   │     └─ ...
//!   └─ result: run_id + per-stage outcomes
//!
//! resume(run_id)
//!   └─ cursor = last_completed_stage_index + 1; error results dropped
//! ```

use crate::agentmux::checkpoint::{
    CheckpointData, CheckpointError, CheckpointStore, ExecutionModeFlags, StageOutcome,
    StageRecord, StageStatus,
};
use crate::agentmux::executor::{AgentExecutor, ExecutionContext, ExecutorError};
use crate::agentmux::memory::{MemoryMetadata, MemoryStore, MemoryType};
use crate::agentmux::profile::{AgentProfile, Stage};
use crate::agentmux::prompt::UserPrompt;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Options for retry actions offered when a stage exhausts its retries.
const FAILURE_CHOICES: [&str; 3] = ["retry", "skip", "abort"];
/// Options offered at a post-stage checkpoint.
const CHECKPOINT_CHOICES: [&str; 4] = ["continue", "modify", "skip", "abort"];

/// Controller defaults materialised onto stages that leave fields unset.
#[derive(Debug, Clone)]
pub struct StageControllerConfig {
    /// Per-attempt timeout default.
    pub default_stage_timeout: Duration,
    /// Retry budget default (retries after the first attempt).
    pub default_max_retries: u32,
    /// Base backoff delay default.
    pub default_retry_delay: Duration,
    /// Save a checkpoint after every stage of resumable runs.
    pub auto_save_checkpoint: bool,
}

impl Default for StageControllerConfig {
    fn default() -> Self {
        Self {
            default_stage_timeout: Duration::from_secs(300),
            default_max_retries: 2,
            default_retry_delay: Duration::from_secs(1),
            auto_save_checkpoint: true,
        }
    }
}

/// A declared stage with its index attached and defaults materialised.
#[derive(Debug, Clone)]
struct EnhancedStage {
    index: usize,
    name: String,
    description: String,
    checkpoint: bool,
    timeout: Duration,
    max_retries: u32,
    retry_delay: Duration,
    save_to_memory: bool,
    key_questions: Vec<String>,
    expected_outputs: Vec<String>,
}

/// Errors surfaced by staged execution.
#[derive(Debug)]
pub enum StageError {
    /// The declared stages are unusable (empty list, duplicate names, or a
    /// checkpoint that does not match the profile).
    Validation(String),
    /// Checkpoint persistence failed.
    Checkpoint(CheckpointError),
}

impl std::fmt::Display for StageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageError::Validation(message) => write!(f, "Invalid stages: {}", message),
            StageError::Checkpoint(e) => write!(f, "Checkpoint failure: {}", e),
        }
    }
}

impl std::error::Error for StageError {}

impl From<CheckpointError> for StageError {
    fn from(e: CheckpointError) -> Self {
        StageError::Checkpoint(e)
    }
}

/// Result of a staged run (complete, aborted, or cancelled partway).
pub struct StagedRunResult {
    /// The run id (preserved across resumes).
    pub run_id: String,
    /// The agent that ran.
    pub agent: String,
    /// Terminal outcomes in stage order (completed, skipped, or error).
    pub results: Vec<StageOutcome>,
    /// Outputs of completed stages, in stage order.
    pub previous_outputs: Vec<String>,
    /// `true` when every stage completed or was skipped.
    pub completed: bool,
    /// `true` when the user (or cancellation) aborted the run early.
    pub aborted: bool,
}

/// Drives one agent's staged workflow. See the module docs.
pub struct StageExecutionController {
    executor: Arc<dyn AgentExecutor>,
    prompt: Arc<dyn UserPrompt>,
    checkpoints: Option<Arc<CheckpointStore>>,
    memory: Option<Arc<MemoryStore>>,
    config: StageControllerConfig,
}

impl StageExecutionController {
    /// Create a controller over the given executor and prompt capability.
    pub fn new(executor: Arc<dyn AgentExecutor>, prompt: Arc<dyn UserPrompt>) -> Self {
        Self {
            executor,
            prompt,
            checkpoints: None,
            memory: None,
            config: StageControllerConfig::default(),
        }
    }

    /// Attach a checkpoint store for resumable runs (builder pattern).
    pub fn with_checkpoints(mut self, store: Arc<CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    /// Attach a memory store for `save_to_memory` stages (builder pattern).
    pub fn with_memory(mut self, memory: Arc<MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Override the controller defaults (builder pattern).
    pub fn with_config(mut self, config: StageControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Execute the profile's staged workflow from the beginning.
    pub async fn execute(
        &self,
        profile: &AgentProfile,
        task: &str,
        mode: ExecutionModeFlags,
        context: &ExecutionContext,
    ) -> Result<StagedRunResult, StageError> {
        let stages = self.enhance(&profile.stages)?;

        let mut data = CheckpointData::new(&profile.name, task);
        data.mode = mode;
        data.stages = stages
            .iter()
            .map(|stage| StageRecord {
                name: stage.name.clone(),
                description: stage.description.clone(),
                status: StageStatus::Pending,
                retries: 0,
                result: None,
            })
            .collect();

        self.run_loop(profile, stages, data, Vec::new(), 0, context)
            .await
    }

    /// Resume a prior run from its checkpoint.
    ///
    /// The cursor is set to `last_completed_stage_index + 1`; retained
    /// results keep only `completed` and `skipped` outcomes so errored
    /// stages re-execute. The run id is preserved. The checkpoint-stored
    /// mode is used unless `mode_override` is supplied.
    pub async fn resume(
        &self,
        profile: &AgentProfile,
        run_id: &str,
        mode_override: Option<ExecutionModeFlags>,
        context: &ExecutionContext,
    ) -> Result<StagedRunResult, StageError> {
        let store = self.checkpoints.as_ref().ok_or_else(|| {
            StageError::Validation("resume requires a checkpoint store".to_string())
        })?;
        let mut data = store.load(run_id)?;

        if data.stages.len() != profile.stages.len() {
            return Err(StageError::Validation(format!(
                "checkpoint has {} stages but profile declares {}",
                data.stages.len(),
                profile.stages.len()
            )));
        }
        if let Some(mode) = mode_override {
            data.mode = mode;
        }

        // Rebuild enhanced stages from the profile, taking descriptions from
        // the checkpoint so user modifications survive the resume.
        let mut stages = self.enhance(&profile.stages)?;
        for (stage, record) in stages.iter_mut().zip(data.stages.iter()) {
            stage.description = record.description.clone();
        }

        // Drop error results; those stages re-execute. Completed and skipped
        // outcomes are retained.
        let results: Vec<StageOutcome> = data
            .stages
            .iter()
            .filter_map(|record| record.result.clone())
            .filter(|outcome| {
                matches!(outcome.status, StageStatus::Completed | StageStatus::Skipped)
            })
            .collect();
        for record in data.stages.iter_mut() {
            if record.status == StageStatus::Error || record.status == StageStatus::Running {
                record.status = StageStatus::Pending;
                record.result = None;
            }
        }

        let cursor = (data.last_completed_stage_index + 1).max(0) as usize;
        log::info!(
            "resuming run {} for agent {} at stage {}",
            run_id,
            profile.name,
            cursor
        );

        self.run_loop(profile, stages, data, results, cursor, context)
            .await
    }

    /// Validate stage declarations and materialise defaults.
    fn enhance(&self, declared: &[Stage]) -> Result<Vec<EnhancedStage>, StageError> {
        if declared.is_empty() {
            return Err(StageError::Validation("no stages declared".to_string()));
        }
        let mut seen = std::collections::HashSet::new();
        for stage in declared {
            if !seen.insert(stage.name.as_str()) {
                return Err(StageError::Validation(format!(
                    "duplicate stage name '{}'",
                    stage.name
                )));
            }
        }

        Ok(declared
            .iter()
            .enumerate()
            .map(|(index, stage)| EnhancedStage {
                index,
                name: stage.name.clone(),
                description: stage.description.clone(),
                checkpoint: stage.checkpoint,
                timeout: stage.timeout.unwrap_or(self.config.default_stage_timeout),
                max_retries: stage.max_retries.unwrap_or(self.config.default_max_retries),
                retry_delay: stage.retry_delay.unwrap_or(self.config.default_retry_delay),
                save_to_memory: stage.save_to_memory,
                key_questions: stage.key_questions.clone(),
                expected_outputs: stage.expected_outputs.clone(),
            })
            .collect())
    }

    /// The main stage loop, shared by [`execute`](Self::execute) and
    /// [`resume`](Self::resume).
    async fn run_loop(
        &self,
        profile: &AgentProfile,
        mut stages: Vec<EnhancedStage>,
        mut data: CheckpointData,
        mut results: Vec<StageOutcome>,
        cursor: usize,
        context: &ExecutionContext,
    ) -> Result<StagedRunResult, StageError> {
        let mut previous_outputs = data.previous_outputs.clone();
        let mut aborted = false;
        let mut index = cursor;

        while index < stages.len() {
            // Stages already skipped (by resume or a checkpoint decision)
            // stay skipped.
            if data.stages[index].status == StageStatus::Skipped {
                index += 1;
                continue;
            }
            if context.cancellation.is_cancelled() {
                aborted = true;
                break;
            }

            let stage = stages[index].clone();
            let prompt_text = compose_stage_prompt(&stage, &data.task, &previous_outputs);

            match self
                .run_stage_with_retries(profile, &stage, &prompt_text, &mut data, context)
                .await?
            {
                StageVerdict::Completed(outcome) => {
                    let output = outcome.output.clone().unwrap_or_default();
                    previous_outputs.push(output.clone());
                    apply_outcome(&mut data, index, StageStatus::Completed, outcome.clone());
                    data.previous_outputs = previous_outputs.clone();
                    results.push(outcome);
                    self.autosave(&mut data)?;
                    self.persist_to_memory(profile, &stage, &output, &results, context);

                    if index + 1 < stages.len() {
                        match self
                            .checkpoint_decision(&stage, &mut stages, &mut data, index)
                            .await
                        {
                            CheckpointVerdict::Continue => {}
                            CheckpointVerdict::SkipNext(outcome) => {
                                results.push(outcome);
                                self.autosave(&mut data)?;
                            }
                            CheckpointVerdict::Abort => {
                                aborted = true;
                                self.autosave(&mut data)?;
                                break;
                            }
                        }
                    }
                }
                StageVerdict::Skipped(outcome) => {
                    apply_outcome(&mut data, index, StageStatus::Skipped, outcome.clone());
                    results.push(outcome);
                    self.autosave(&mut data)?;
                }
                StageVerdict::Errored(outcome) => {
                    apply_outcome(&mut data, index, StageStatus::Error, outcome.clone());
                    results.push(outcome);
                    self.autosave(&mut data)?;
                    aborted = true;
                    break;
                }
                StageVerdict::Cancelled => {
                    aborted = true;
                    self.autosave(&mut data)?;
                    break;
                }
            }

            index += 1;
        }

        let completed = data
            .stages
            .iter()
            .all(|record| matches!(record.status, StageStatus::Completed | StageStatus::Skipped));

        Ok(StagedRunResult {
            run_id: data.run_id.clone(),
            agent: profile.name.clone(),
            results,
            previous_outputs,
            completed,
            aborted,
        })
    }

    /// One stage: bounded retries with exponential backoff, then the
    /// interactive failure menu.
    async fn run_stage_with_retries(
        &self,
        profile: &AgentProfile,
        stage: &EnhancedStage,
        prompt_text: &str,
        data: &mut CheckpointData,
        context: &ExecutionContext,
    ) -> Result<StageVerdict, StageError> {
        let mut extra_retries: u32 = 0;

        loop {
            let budget = stage.max_retries + extra_retries;
            let mut attempt: u32 = data.stages[stage.index].retries;
            let mut last_error = String::new();
            let mut total_tokens = 0usize;

            while attempt <= budget {
                if attempt > 0 {
                    // Exponential backoff: delay × 2^(k−1) before attempt k.
                    // The exponent is capped so the multiplication cannot
                    // overflow after long interactive retry streaks.
                    let delay = stage.retry_delay * 2u32.saturating_pow((attempt - 1).min(16));
                    log::debug!(
                        "stage {} retry {} after {:?}",
                        stage.name,
                        attempt,
                        delay
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = context.cancellation.cancelled() => return Ok(StageVerdict::Cancelled),
                    }
                }

                data.stages[stage.index].status = StageStatus::Running;
                data.stages[stage.index].retries = attempt;

                match self.run_attempt(profile, stage, prompt_text, context).await {
                    AttemptOutcome::Success { output, tokens, duration } => {
                        total_tokens += tokens;
                        return Ok(StageVerdict::Completed(StageOutcome {
                            status: StageStatus::Completed,
                            output: Some(output),
                            error: None,
                            duration_ms: duration.as_millis() as u64,
                            tokens_used: total_tokens,
                            retries: attempt,
                            timestamp: Utc::now(),
                            artifacts: Vec::new(),
                        }));
                    }
                    AttemptOutcome::Cancelled => return Ok(StageVerdict::Cancelled),
                    AttemptOutcome::Failed { error } => {
                        log::warn!(
                            "stage {} attempt {} failed: {}",
                            stage.name,
                            attempt + 1,
                            error
                        );
                        last_error = error;
                        attempt += 1;
                    }
                }
            }

            // Retries exhausted.
            let failed_outcome = StageOutcome {
                status: StageStatus::Error,
                output: None,
                error: Some(last_error.clone()),
                duration_ms: 0,
                tokens_used: total_tokens,
                retries: budget,
                timestamp: Utc::now(),
                artifacts: Vec::new(),
            };

            if !data.mode.interactive || data.mode.auto_confirm {
                return Ok(StageVerdict::Errored(failed_outcome));
            }

            let decision = self
                .prompt
                .select(
                    &format!("Stage '{}' failed: {}. What next?", stage.name, last_error),
                    &FAILURE_CHOICES,
                    2,
                )
                .await;
            match FAILURE_CHOICES[decision.value.min(FAILURE_CHOICES.len() - 1)] {
                // The failed result is discarded, the retry counter grows,
                // and the stage re-executes.
                "retry" => {
                    extra_retries += 1;
                    data.stages[stage.index].retries = budget + 1;
                    continue;
                }
                "skip" => {
                    return Ok(StageVerdict::Skipped(StageOutcome {
                        status: StageStatus::Skipped,
                        output: None,
                        error: Some(last_error),
                        duration_ms: 0,
                        tokens_used: total_tokens,
                        retries: budget,
                        timestamp: Utc::now(),
                        artifacts: Vec::new(),
                    }))
                }
                _ => return Ok(StageVerdict::Errored(failed_outcome)),
            }
        }
    }

    /// One attempt, bounded by the stage timeout. A timeout cancels the
    /// attempt's child token so the provider subprocess is torn down — the
    /// same cascade as an external cancel.
    async fn run_attempt(
        &self,
        profile: &AgentProfile,
        stage: &EnhancedStage,
        prompt_text: &str,
        context: &ExecutionContext,
    ) -> AttemptOutcome {
        let attempt_token = context.cancellation.child_token();
        let mut attempt_context = context.clone();
        attempt_context.cancellation = attempt_token.clone();
        attempt_context.timeout = Some(stage.timeout);

        let started = Instant::now();
        let execution = self
            .executor
            .execute_agent(profile, prompt_text, &attempt_context);

        tokio::select! {
            result = execution => match result {
                Ok(response) => AttemptOutcome::Success {
                    output: response.content,
                    tokens: response.tokens_used.total_tokens,
                    duration: started.elapsed(),
                },
                Err(ExecutorError::Cancelled) => {
                    if context.cancellation.is_cancelled() {
                        AttemptOutcome::Cancelled
                    } else {
                        AttemptOutcome::Failed {
                            error: "attempt cancelled".to_string(),
                        }
                    }
                }
                Err(e) => AttemptOutcome::Failed { error: e.to_string() },
            },
            _ = tokio::time::sleep(stage.timeout) => {
                attempt_token.cancel();
                AttemptOutcome::Failed {
                    error: format!("stage timed out after {:?}", stage.timeout),
                }
            }
        }
    }

    /// The post-stage checkpoint decision.
    async fn checkpoint_decision(
        &self,
        stage: &EnhancedStage,
        stages: &mut [EnhancedStage],
        data: &mut CheckpointData,
        index: usize,
    ) -> CheckpointVerdict {
        if !stage.checkpoint || !data.mode.interactive {
            return CheckpointVerdict::Continue;
        }
        if data.mode.auto_confirm {
            return CheckpointVerdict::Continue;
        }

        let decision = self
            .prompt
            .select(
                &format!("Stage '{}' complete. Continue?", stage.name),
                &CHECKPOINT_CHOICES,
                0,
            )
            .await;

        match CHECKPOINT_CHOICES[decision.value.min(CHECKPOINT_CHOICES.len() - 1)] {
            "modify" => {
                let text = self
                    .prompt
                    .text("Describe the modifications for the next stage:", "")
                    .await;
                if !text.value.is_empty() {
                    let next = &mut stages[index + 1];
                    next.description
                        .push_str(&format!("\n\nUser modifications:\n{}", text.value));
                    data.stages[index + 1].description = next.description.clone();
                }
                CheckpointVerdict::Continue
            }
            "skip" => {
                let outcome = StageOutcome {
                    status: StageStatus::Skipped,
                    output: None,
                    error: None,
                    duration_ms: 0,
                    tokens_used: 0,
                    retries: 0,
                    timestamp: Utc::now(),
                    artifacts: Vec::new(),
                };
                data.stages[index + 1].status = StageStatus::Skipped;
                data.stages[index + 1].result = Some(outcome.clone());
                CheckpointVerdict::SkipNext(outcome)
            }
            "abort" => CheckpointVerdict::Abort,
            _ => CheckpointVerdict::Continue,
        }
    }

    /// Save the checkpoint when the run is resumable and autosave is on.
    fn autosave(&self, data: &mut CheckpointData) -> Result<(), StageError> {
        if !data.mode.resumable || !self.config.auto_save_checkpoint {
            return Ok(());
        }
        let Some(store) = &self.checkpoints else {
            return Ok(());
        };
        data.recompute_last_completed();
        store.save(data)?;
        Ok(())
    }

    /// Persist a completed stage's output to the memory store. Failures are
    /// logged and never fail the stage.
    fn persist_to_memory(
        &self,
        profile: &AgentProfile,
        stage: &EnhancedStage,
        output: &str,
        results: &[StageOutcome],
        context: &ExecutionContext,
    ) {
        if !stage.save_to_memory {
            return;
        }
        let Some(memory) = &self.memory else {
            return;
        };

        let outcome = results.last();
        let mut metadata = MemoryMetadata::new(MemoryType::Task)
            .with_agent_id(&profile.name)
            .with_source(&profile.name)
            .with_extra("stage", json!(stage.name))
            .with_extra("stage_index", json!(stage.index))
            .with_extra("timestamp", json!(Utc::now().to_rfc3339()))
            .with_extra(
                "tokens_used",
                json!(outcome.map(|o| o.tokens_used).unwrap_or(0)),
            )
            .with_extra(
                "duration",
                json!(outcome.map(|o| o.duration_ms).unwrap_or(0)),
            );
        if let Some(session_id) = context.session_id {
            metadata = metadata.with_session_id(session_id.to_string());
        }

        let content = format!("[{}] Stage: {}\n\n{}", profile.name, stage.name, output);
        if let Err(e) = memory.add(content, None, metadata.into_value()) {
            log::warn!("failed to persist stage output to memory: {}", e);
        }
    }
}

enum AttemptOutcome {
    Success {
        output: String,
        tokens: usize,
        duration: Duration,
    },
    Failed {
        error: String,
    },
    Cancelled,
}

enum StageVerdict {
    Completed(StageOutcome),
    Skipped(StageOutcome),
    Errored(StageOutcome),
    Cancelled,
}

enum CheckpointVerdict {
    Continue,
    SkipNext(StageOutcome),
    Abort,
}

fn apply_outcome(
    data: &mut CheckpointData,
    index: usize,
    status: StageStatus,
    outcome: StageOutcome,
) {
    let record = &mut data.stages[index];
    record.status = status;
    record.retries = outcome.retries;
    record.result = Some(outcome);
}

/// Compose the prompt delivered to the provider for one stage.
///
/// ```text
/// # Stage: <name>
/// ## Stage Description
/// <description>
/// ## Original Task
/// <task>
/// ## Previous Stage Outputs        (only after the first stage)
/// ### Stage 1 Output
/// <...>
/// ## Key Questions to Address      (when declared)
/// - ...
/// ## Expected Outputs              (when declared)
/// - ...
/// ```
fn compose_stage_prompt(stage: &EnhancedStage, task: &str, previous_outputs: &[String]) -> String {
    let mut prompt = format!(
        "# Stage: {}\n## Stage Description\n{}\n## Original Task\n{}\n",
        stage.name, stage.description, task
    );

    if stage.index > 0 && !previous_outputs.is_empty() {
        prompt.push_str("## Previous Stage Outputs\n");
        for (i, output) in previous_outputs.iter().enumerate() {
            prompt.push_str(&format!("### Stage {} Output\n{}\n", i + 1, output));
        }
    }

    if !stage.key_questions.is_empty() {
        prompt.push_str("## Key Questions to Address\n");
        for question in &stage.key_questions {
            prompt.push_str(&format!("- {}\n", question));
        }
    }

    if !stage.expected_outputs.is_empty() {
        prompt.push_str("## Expected Outputs\n");
        for output in &stage.expected_outputs {
            prompt.push_str(&format!("- {}\n", output));
        }
    }

    prompt
}
