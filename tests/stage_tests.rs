use agentmux::checkpoint::{
    CheckpointStore, ExecutionModeFlags, RunStatus, StageStatus,
};
use agentmux::executor::{AgentExecutor, ExecutionContext, ExecutorError};
use agentmux::memory::{GetAllOptions, MemoryStore, MemoryStoreConfig};
use agentmux::profile::{AgentProfile, Stage};
use agentmux::prompt::{AutoConfirmPrompt, PromptOutcome, UserPrompt};
use agentmux::provider::{ExecutionResponse, TokenUsage};
use agentmux::stage::{StageControllerConfig, StageExecutionController};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Executor that replays a scripted sequence of outcomes, one per call.
/// When the script runs dry every further call succeeds.
struct SequenceExecutor {
    script: Mutex<VecDeque<Result<String, ExecutorError>>>,
    prompts: Mutex<Vec<String>>,
}

impl SequenceExecutor {
    fn new(script: Vec<Result<String, ExecutorError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn seen_prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentExecutor for SequenceExecutor {
    async fn execute_agent(
        &self,
        _profile: &AgentProfile,
        task: &str,
        _context: &ExecutionContext,
    ) -> Result<ExecutionResponse, ExecutorError> {
        self.prompts.lock().unwrap().push(task.to_string());
        let next = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok("default output".to_string()));
        next.map(|content| ExecutionResponse {
            content,
            model: "mock".to_string(),
            tokens_used: TokenUsage::new(2, 3),
            latency_ms: 1,
            finish_reason: "stop".to_string(),
            cached: false,
        })
    }
}

fn staged_profile() -> AgentProfile {
    let _ = env_logger::builder().is_test(true).try_init();
    AgentProfile::new("researcher", "You research things.")
        .with_stage(Stage::new("collect", "Collect the data."))
        .with_stage(Stage::new("analyze", "Analyze the data."))
        .with_stage(Stage::new("report", "Write the report."))
}

fn fast_config() -> StageControllerConfig {
    StageControllerConfig {
        default_stage_timeout: Duration::from_secs(5),
        default_max_retries: 1,
        default_retry_delay: Duration::from_millis(1),
        auto_save_checkpoint: true,
    }
}

fn resumable_mode() -> ExecutionModeFlags {
    ExecutionModeFlags {
        resumable: true,
        ..Default::default()
    }
}

#[tokio::test]
async fn all_stages_complete_and_outputs_thread_forward() {
    let executor = SequenceExecutor::new(vec![
        Ok("collected".to_string()),
        Ok("analyzed".to_string()),
        Ok("reported".to_string()),
    ]);
    let controller = StageExecutionController::new(executor.clone(), Arc::new(AutoConfirmPrompt))
        .with_config(fast_config());

    let result = controller
        .execute(
            &staged_profile(),
            "study the corpus",
            ExecutionModeFlags::default(),
            &ExecutionContext::new("study the corpus"),
        )
        .await
        .unwrap();

    assert!(result.completed);
    assert!(!result.aborted);
    assert_eq!(result.previous_outputs, vec!["collected", "analyzed", "reported"]);
    assert_eq!(result.results.len(), 3);
    assert!(result
        .results
        .iter()
        .all(|r| r.status == StageStatus::Completed));

    // The second stage's prompt embeds the first stage's output.
    let prompts = executor.seen_prompts();
    assert!(prompts[1].contains("### Stage 1 Output\ncollected"));
    assert!(prompts[2].contains("### Stage 2 Output\nanalyzed"));
}

#[tokio::test]
async fn failed_attempts_are_retried_with_backoff() {
    let executor = SequenceExecutor::new(vec![
        Err(ExecutorError::Failed("transient".to_string())),
        Ok("second try".to_string()),
    ]);
    let controller = StageExecutionController::new(executor, Arc::new(AutoConfirmPrompt))
        .with_config(fast_config());

    let profile = AgentProfile::new("a", "role").with_stage(Stage::new("only", "One stage."));
    let result = controller
        .execute(
            &profile,
            "task",
            ExecutionModeFlags::default(),
            &ExecutionContext::new("task"),
        )
        .await
        .unwrap();

    assert!(result.completed);
    assert_eq!(result.results[0].retries, 1);
    assert_eq!(result.results[0].output.as_deref(), Some("second try"));
}

#[tokio::test]
async fn retries_exhausted_records_an_error_and_stops() {
    let executor = SequenceExecutor::new(vec![
        Err(ExecutorError::Failed("boom 1".to_string())),
        Err(ExecutorError::Failed("boom 2".to_string())),
        Ok("unreachable".to_string()),
    ]);
    let controller = StageExecutionController::new(executor.clone(), Arc::new(AutoConfirmPrompt))
        .with_config(fast_config());

    let result = controller
        .execute(
            &staged_profile(),
            "task",
            ExecutionModeFlags::default(),
            &ExecutionContext::new("task"),
        )
        .await
        .unwrap();

    assert!(!result.completed);
    assert!(result.aborted);
    assert_eq!(result.results.len(), 1);
    assert_eq!(result.results[0].status, StageStatus::Error);
    assert!(result.results[0].error.as_ref().unwrap().contains("boom 2"));
    // Stages after the failure never executed.
    assert_eq!(executor.seen_prompts().len(), 2);
}

#[tokio::test]
async fn checkpoint_saved_after_failure_then_resume_reexecutes_stage_two() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(CheckpointStore::new(dir.path().join("checkpoints")).unwrap());

    // Stage 1 succeeds, stage 2 fails twice (1 retry budget), run stops.
    let executor = SequenceExecutor::new(vec![
        Ok("stage-1 output".to_string()),
        Err(ExecutorError::Failed("first".to_string())),
        Err(ExecutorError::Failed("second".to_string())),
    ]);
    let controller = StageExecutionController::new(executor, Arc::new(AutoConfirmPrompt))
        .with_config(fast_config())
        .with_checkpoints(store.clone());

    let profile = staged_profile();
    let result = controller
        .execute(
            &profile,
            "task",
            resumable_mode(),
            &ExecutionContext::new("task"),
        )
        .await
        .unwrap();
    assert!(result.aborted);
    let run_id = result.run_id.clone();

    // The checkpoint recorded one completed stage and one error stage.
    let data = store.load(&run_id).unwrap();
    assert_eq!(data.last_completed_stage_index, 0);
    assert_eq!(data.stages[0].status, StageStatus::Completed);
    assert_eq!(data.stages[1].status, StageStatus::Error);
    assert_eq!(data.previous_outputs, vec!["stage-1 output"]);
    assert_eq!(store.metadata(&run_id).unwrap().status, RunStatus::Failed);

    // Resume: stage 2 re-executes (the error result was discarded), the run
    // id is preserved, and stage 1 is not re-run.
    let resume_executor = SequenceExecutor::new(vec![
        Ok("stage-2 output".to_string()),
        Ok("stage-3 output".to_string()),
    ]);
    let resume_controller =
        StageExecutionController::new(resume_executor.clone(), Arc::new(AutoConfirmPrompt))
            .with_config(fast_config())
            .with_checkpoints(store.clone());

    let resumed = resume_controller
        .resume(&profile, &run_id, None, &ExecutionContext::new("task"))
        .await
        .unwrap();

    assert_eq!(resumed.run_id, run_id);
    assert!(resumed.completed);
    assert_eq!(
        resumed.previous_outputs,
        vec!["stage-1 output", "stage-2 output", "stage-3 output"]
    );
    // Only stages 2 and 3 hit the executor on resume.
    let prompts = resume_executor.seen_prompts();
    assert_eq!(prompts.len(), 2);
    assert!(prompts[0].starts_with("# Stage: analyze"));
    assert!(prompts[0].contains("### Stage 1 Output\nstage-1 output"));

    let final_data = store.load(&run_id).unwrap();
    assert_eq!(final_data.last_completed_stage_index, 2);
    assert_eq!(store.metadata(&run_id).unwrap().status, RunStatus::Completed);
}

#[tokio::test]
async fn completed_stages_persist_to_memory() {
    let memory = Arc::new(MemoryStore::open(MemoryStoreConfig::default()).unwrap());
    let executor = SequenceExecutor::new(vec![Ok("memorable output".to_string())]);
    let controller = StageExecutionController::new(executor, Arc::new(AutoConfirmPrompt))
        .with_config(fast_config())
        .with_memory(memory.clone());

    let profile = AgentProfile::new("writer", "You write.")
        .with_stage(Stage::new("draft", "Write a draft.").save_to_memory());

    controller
        .execute(
            &profile,
            "task",
            ExecutionModeFlags::default(),
            &ExecutionContext::new("task"),
        )
        .await
        .unwrap();

    let entries = memory.get_all(GetAllOptions::default());
    assert_eq!(entries.len(), 1);
    assert!(entries[0]
        .content
        .starts_with("[writer] Stage: draft\n\nmemorable output"));
    assert_eq!(entries[0].metadata["type"], "task");
    assert_eq!(entries[0].metadata["agent_id"], "writer");
    assert_eq!(entries[0].metadata["stage"], "draft");
}

/// Prompt that replays a scripted list of select choices and one text
/// answer.
struct ScriptedPrompt {
    selections: Mutex<VecDeque<usize>>,
    text_reply: String,
}

#[async_trait]
impl UserPrompt for ScriptedPrompt {
    async fn confirm(&self, _message: &str, default: bool) -> PromptOutcome<bool> {
        PromptOutcome::chosen(default)
    }

    async fn select(
        &self,
        _message: &str,
        _options: &[&str],
        default_index: usize,
    ) -> PromptOutcome<usize> {
        let next = self
            .selections
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(default_index);
        PromptOutcome::chosen(next)
    }

    async fn text(&self, _message: &str, _default: &str) -> PromptOutcome<String> {
        PromptOutcome::chosen(self.text_reply.clone())
    }
}

#[tokio::test]
async fn interactive_failure_menu_skip_replaces_the_error() {
    // One stage, zero retries, always failing; the user picks "skip" (index 1).
    let executor = SequenceExecutor::new(vec![Err(ExecutorError::Failed("nope".to_string()))]);
    let prompt = Arc::new(ScriptedPrompt {
        selections: Mutex::new(VecDeque::from([1usize])),
        text_reply: String::new(),
    });
    let controller = StageExecutionController::new(executor, prompt).with_config(
        StageControllerConfig {
            default_max_retries: 0,
            default_retry_delay: Duration::from_millis(1),
            ..fast_config()
        },
    );

    let profile = AgentProfile::new("a", "role").with_stage(Stage::new("s", "desc"));
    let result = controller
        .execute(
            &profile,
            "task",
            ExecutionModeFlags {
                interactive: true,
                ..Default::default()
            },
            &ExecutionContext::new("task"),
        )
        .await
        .unwrap();

    assert!(result.completed); // skipped counts as terminal
    assert_eq!(result.results[0].status, StageStatus::Skipped);
}

#[tokio::test]
async fn interactive_retry_gives_one_more_attempt() {
    // Zero retries; first attempt fails; the user picks "retry" (index 0);
    // the second attempt succeeds.
    let executor = SequenceExecutor::new(vec![
        Err(ExecutorError::Failed("flaky".to_string())),
        Ok("recovered".to_string()),
    ]);
    let prompt = Arc::new(ScriptedPrompt {
        selections: Mutex::new(VecDeque::from([0usize])),
        text_reply: String::new(),
    });
    let controller = StageExecutionController::new(executor, prompt).with_config(
        StageControllerConfig {
            default_max_retries: 0,
            default_retry_delay: Duration::from_millis(1),
            ..fast_config()
        },
    );

    let profile = AgentProfile::new("a", "role").with_stage(Stage::new("s", "desc"));
    let result = controller
        .execute(
            &profile,
            "task",
            ExecutionModeFlags {
                interactive: true,
                ..Default::default()
            },
            &ExecutionContext::new("task"),
        )
        .await
        .unwrap();

    assert!(result.completed);
    assert_eq!(result.results[0].output.as_deref(), Some("recovered"));
}

#[tokio::test]
async fn checkpoint_modify_appends_user_text_to_the_next_stage() {
    let executor = SequenceExecutor::new(vec![
        Ok("one".to_string()),
        Ok("two".to_string()),
    ]);
    // After stage 1: pick "modify" (index 1); no further scripted choices so
    // later checkpoints default to "continue".
    let prompt = Arc::new(ScriptedPrompt {
        selections: Mutex::new(VecDeque::from([1usize])),
        text_reply: "Focus on the edge cases.".to_string(),
    });
    let controller = StageExecutionController::new(executor.clone(), prompt)
        .with_config(fast_config());

    let profile = AgentProfile::new("a", "role")
        .with_stage(Stage::new("first", "First."))
        .with_stage(Stage::new("second", "Second."));
    let result = controller
        .execute(
            &profile,
            "task",
            ExecutionModeFlags {
                interactive: true,
                ..Default::default()
            },
            &ExecutionContext::new("task"),
        )
        .await
        .unwrap();

    assert!(result.completed);
    let prompts = executor.seen_prompts();
    assert!(prompts[1].contains("Second.\n\nUser modifications:\nFocus on the edge cases."));
}

#[tokio::test]
async fn auto_confirm_suppresses_checkpoint_prompts() {
    // A scripted "abort" would fire at the checkpoint, but auto_confirm
    // short-circuits to continue.
    let executor = SequenceExecutor::new(vec![Ok("one".to_string()), Ok("two".to_string())]);
    let prompt = Arc::new(ScriptedPrompt {
        selections: Mutex::new(VecDeque::from([3usize])),
        text_reply: String::new(),
    });
    let controller = StageExecutionController::new(executor, prompt).with_config(fast_config());

    let profile = AgentProfile::new("a", "role")
        .with_stage(Stage::new("first", "First."))
        .with_stage(Stage::new("second", "Second."));
    let result = controller
        .execute(
            &profile,
            "task",
            ExecutionModeFlags {
                interactive: true,
                auto_confirm: true,
                ..Default::default()
            },
            &ExecutionContext::new("task"),
        )
        .await
        .unwrap();

    assert!(result.completed);
    assert_eq!(result.results.len(), 2);
}

#[tokio::test]
async fn empty_and_duplicate_stage_declarations_are_rejected() {
    let executor = SequenceExecutor::new(vec![]);
    let controller = StageExecutionController::new(executor, Arc::new(AutoConfirmPrompt));

    let empty = AgentProfile::new("a", "role");
    assert!(controller
        .execute(
            &empty,
            "task",
            ExecutionModeFlags::default(),
            &ExecutionContext::new("task")
        )
        .await
        .is_err());

    let duplicated = AgentProfile::new("a", "role")
        .with_stage(Stage::new("same", "one"))
        .with_stage(Stage::new("same", "two"));
    assert!(controller
        .execute(
            &duplicated,
            "task",
            ExecutionModeFlags::default(),
            &ExecutionContext::new("task")
        )
        .await
        .is_err());
}

#[tokio::test]
async fn stage_timeout_is_retried_like_any_failure() {
    // The first attempt hangs past the stage timeout; the retry succeeds.
    struct HangThenSucceed {
        calls: AtomicUsizeWrapper,
    }
    struct AtomicUsizeWrapper(std::sync::atomic::AtomicUsize);

    #[async_trait]
    impl AgentExecutor for HangThenSucceed {
        async fn execute_agent(
            &self,
            _profile: &AgentProfile,
            _task: &str,
            context: &ExecutionContext,
        ) -> Result<ExecutionResponse, ExecutorError> {
            let n = self.calls.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if n == 0 {
                // Hang until the per-attempt token is cancelled by the
                // timeout cascade.
                context.cancellation.cancelled().await;
                return Err(ExecutorError::Cancelled);
            }
            Ok(ExecutionResponse {
                content: "made it".to_string(),
                model: "mock".to_string(),
                tokens_used: TokenUsage::zero(),
                latency_ms: 1,
                finish_reason: "stop".to_string(),
                cached: false,
            })
        }
    }

    let controller = StageExecutionController::new(
        Arc::new(HangThenSucceed {
            calls: AtomicUsizeWrapper(std::sync::atomic::AtomicUsize::new(0)),
        }),
        Arc::new(AutoConfirmPrompt),
    )
    .with_config(StageControllerConfig {
        default_stage_timeout: Duration::from_millis(50),
        default_max_retries: 1,
        default_retry_delay: Duration::from_millis(1),
        auto_save_checkpoint: false,
    });

    let profile = AgentProfile::new("a", "role").with_stage(Stage::new("s", "desc"));
    let result = controller
        .execute(
            &profile,
            "task",
            ExecutionModeFlags::default(),
            &ExecutionContext::new("task"),
        )
        .await
        .unwrap();

    assert!(result.completed);
    assert_eq!(result.results[0].output.as_deref(), Some("made it"));
    assert_eq!(result.results[0].retries, 1);
}
