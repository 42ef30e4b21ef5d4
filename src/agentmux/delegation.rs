//! Agent-to-agent delegation under depth, cycle, and permission rules.
//!
//! The [`DelegationController`] is the only path by which one agent may hand
//! a sub-task to another. Before invoking the target it enforces, in order:
//!
//! 1. the target exists,
//! 2. the target accepts delegation (`orchestration.can_delegate`),
//! 3. the delegation chain stays acyclic,
//! 4. the chain stays within the originating agent's depth budget,
//! 5. no agent delegates to itself (case-insensitive).
//!
//! A successful delegation executes the target with a restricted context
//! whose chain is extended by the delegating agent, and wraps the outcome in
//! a [`DelegationResult`] whose status is exactly one of
//! `success`/`failure`/`timeout` — a timed-out execution maps to `timeout`,
//! every other failure to `failure`, and `result.success` always equals
//! `status == success`.
//!
//! # Example
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use agentmux::delegation::DelegationController;
//! # use agentmux::executor::{AgentExecutor, ExecutionContext};
//! # async fn demo(controller: DelegationController) {
//! let context = ExecutionContext::new("Ship the release");
//! let result = controller
//!     .delegate("cto", "backend", "Implement the API", &context)
//!     .await;
//! match result {
//!     Ok(result) => println!("{} -> {}: {:?}", result.from_agent, result.to_agent, result.status),
//!     Err(e) => eprintln!("delegation refused: {}", e),
//! }
//! # }
//! ```

use crate::agentmux::executor::{AgentExecutor, ExecutionContext, ExecutorError};
use crate::agentmux::profile::{ProfileRegistry, DEFAULT_DELEGATION_DEPTH};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Terminal status of a delegation. There are exactly three values; agents
/// skipped by the scheduler map to `Failure` when a result must be
/// synthesised for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DelegationStatus {
    /// The target produced a response.
    Success,
    /// The target failed (provider error, skip, refusal).
    Failure,
    /// The target's execution timed out.
    Timeout,
}

/// Artifacts produced by a delegation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DelegationOutputs {
    /// Files written into the target's session workspace.
    pub files: Vec<String>,
    /// Memory entries persisted by the target.
    pub memory_ids: Vec<u64>,
    /// The target's session workspace path, when one was used.
    pub workspace_path: Option<String>,
}

/// Outcome of one delegation (or one scheduler-executed agent).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationResult {
    /// Unique id of this delegation.
    pub delegation_id: Uuid,
    /// The delegating agent.
    pub from_agent: String,
    /// The agent that did the work.
    pub to_agent: String,
    /// The delegated task.
    pub task: String,
    /// Terminal status.
    pub status: DelegationStatus,
    /// Always equal to `status == Success`.
    pub success: bool,
    /// The target's response, when one was produced.
    pub response: Option<String>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Artifacts produced.
    pub outputs: DelegationOutputs,
    /// When the delegation started.
    pub start_time: DateTime<Utc>,
    /// When the delegation finished.
    pub end_time: DateTime<Utc>,
}

impl DelegationResult {
    fn base(
        from_agent: &str,
        to_agent: &str,
        task: &str,
        status: DelegationStatus,
        start_time: DateTime<Utc>,
    ) -> Self {
        let end_time = Utc::now();
        Self {
            delegation_id: Uuid::new_v4(),
            from_agent: from_agent.to_string(),
            to_agent: to_agent.to_string(),
            task: task.to_string(),
            status,
            success: status == DelegationStatus::Success,
            response: None,
            duration_ms: (end_time - start_time).num_milliseconds().max(0) as u64,
            outputs: DelegationOutputs::default(),
            start_time,
            end_time,
        }
    }

    /// A successful delegation carrying the target's response.
    pub fn success(
        from_agent: &str,
        to_agent: &str,
        task: &str,
        response: impl Into<String>,
        start_time: DateTime<Utc>,
    ) -> Self {
        let mut result = Self::base(from_agent, to_agent, task, DelegationStatus::Success, start_time);
        result.response = Some(response.into());
        result
    }

    /// A failed delegation carrying the failure text as its response.
    pub fn failure(
        from_agent: &str,
        to_agent: &str,
        task: &str,
        error: impl Into<String>,
        start_time: DateTime<Utc>,
    ) -> Self {
        let mut result = Self::base(from_agent, to_agent, task, DelegationStatus::Failure, start_time);
        result.response = Some(error.into());
        result
    }

    /// A timed-out delegation.
    pub fn timeout(
        from_agent: &str,
        to_agent: &str,
        task: &str,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self::base(from_agent, to_agent, task, DelegationStatus::Timeout, start_time)
    }

    /// Synthesise a result for an agent the scheduler skipped. Uniform
    /// reporting requires such results to carry status `failure`.
    pub fn for_skipped(from_agent: &str, to_agent: &str, task: &str) -> Self {
        let now = Utc::now();
        let mut result = Self::base(from_agent, to_agent, task, DelegationStatus::Failure, now);
        result.response = Some("skipped: a dependency failed".to_string());
        result
    }
}

/// Why a delegation was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegationErrorReason {
    /// The target agent does not exist.
    AgentNotFound,
    /// The target does not accept delegated work.
    NotAllowed,
    /// The target already appears in the delegation chain.
    Cycle,
    /// The chain would exceed the originator's depth budget.
    MaxDepth,
    /// An agent tried to delegate to itself.
    SelfDelegation,
}

/// A refused delegation with its typed reason.
#[derive(Debug, Clone)]
pub struct DelegationError {
    /// Typed refusal reason.
    pub reason: DelegationErrorReason,
    /// Human-readable detail.
    pub message: String,
}

impl DelegationError {
    fn new(reason: DelegationErrorReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for DelegationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for DelegationError {}

/// A `{to_agent, task}` pair extracted from an agent's free-form response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegationIntent {
    /// Target agent name.
    pub to_agent: String,
    /// The task text.
    pub task: String,
}

/// Scan a response for `[DELEGATE:<agent>:<task>]` markers.
///
/// Multiple markers in one response are supported. The engine's correctness
/// properties do not depend on this parser's precision — it only feeds
/// candidate intents back into [`DelegationController::delegate`], which
/// enforces all the real rules.
///
/// # Example
///
/// ```rust
/// use agentmux::delegation::parse_delegations;
///
/// let intents = parse_delegations(
///     "I'll handle the schema. [DELEGATE:frontend:Build the settings page] \
///      Also [DELEGATE:qa:Write the regression suite]",
/// );
/// assert_eq!(intents.len(), 2);
/// assert_eq!(intents[0].to_agent, "frontend");
/// ```
pub fn parse_delegations(text: &str) -> Vec<DelegationIntent> {
    let mut intents = Vec::new();
    let marker = "[DELEGATE:";
    let mut search_from = 0;
    while let Some(start) = text[search_from..].find(marker) {
        let body_start = search_from + start + marker.len();
        let Some(end) = text[body_start..].find(']') else {
            break;
        };
        let body = &text[body_start..body_start + end];
        if let Some((agent, task)) = body.split_once(':') {
            let agent = agent.trim();
            let task = task.trim();
            if !agent.is_empty() && !task.is_empty() {
                intents.push(DelegationIntent {
                    to_agent: agent.to_string(),
                    task: task.to_string(),
                });
            }
        }
        search_from = body_start + end + 1;
    }
    intents
}

/// Enforces the delegation rules and invokes target agents.
pub struct DelegationController {
    registry: Arc<ProfileRegistry>,
    executor: Arc<dyn AgentExecutor>,
    /// Per-delegation execution timeout.
    timeout: Option<Duration>,
}

impl DelegationController {
    /// Create a controller over the given registry and executor.
    pub fn new(registry: Arc<ProfileRegistry>, executor: Arc<dyn AgentExecutor>) -> Self {
        Self {
            registry,
            executor,
            timeout: None,
        }
    }

    /// Bound each delegated execution (builder pattern).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Validate the delegation preconditions without executing anything.
    pub fn check(
        &self,
        from_agent: &str,
        to_agent: &str,
        context: &ExecutionContext,
    ) -> Result<(), DelegationError> {
        let target = self.registry.get(to_agent).ok_or_else(|| {
            DelegationError::new(
                DelegationErrorReason::AgentNotFound,
                format!("Agent not found: {}", to_agent),
            )
        })?;

        if !target.orchestration.can_delegate {
            return Err(DelegationError::new(
                DelegationErrorReason::NotAllowed,
                format!("Agent '{}' does not accept delegation", to_agent),
            ));
        }

        let chain = &context.delegation_chain;
        if chain.iter().any(|name| name == to_agent) || from_agent == to_agent {
            let mut cycle: Vec<String> = chain.clone();
            cycle.push(from_agent.to_string());
            cycle.push(to_agent.to_string());
            return Err(DelegationError::new(
                DelegationErrorReason::Cycle,
                format!("Delegation cycle detected: {}", cycle.join(" -> ")),
            ));
        }

        let origin = chain.first().map(String::as_str).unwrap_or(from_agent);
        let max_depth = self
            .registry
            .get(origin)
            .map(|p| p.orchestration.max_delegation_depth)
            .unwrap_or(DEFAULT_DELEGATION_DEPTH);
        if chain.len() + 1 > max_depth {
            return Err(DelegationError::new(
                DelegationErrorReason::MaxDepth,
                format!("Max delegation depth ({}) exceeded", max_depth),
            ));
        }

        if to_agent.to_lowercase() == from_agent.to_lowercase() {
            return Err(DelegationError::new(
                DelegationErrorReason::SelfDelegation,
                format!("Agent '{}' may not delegate to itself", from_agent),
            ));
        }

        Ok(())
    }

    /// Delegate `task` from `from_agent` to `to_agent`.
    ///
    /// Precondition violations fail fast with a typed [`DelegationError`];
    /// execution outcomes are always reported as a [`DelegationResult`].
    pub async fn delegate(
        &self,
        from_agent: &str,
        to_agent: &str,
        task: &str,
        context: &ExecutionContext,
    ) -> Result<DelegationResult, DelegationError> {
        self.check(from_agent, to_agent, context)?;

        // check() guarantees the target exists.
        let target = self.registry.get(to_agent).unwrap();

        let mut child = context.for_agent(task);
        child.delegation_chain.push(from_agent.to_string());
        if let Some(timeout) = self.timeout {
            child.timeout = Some(timeout);
        }

        let start_time = Utc::now();
        log::info!(
            "delegation {} -> {} (chain depth {})",
            from_agent,
            to_agent,
            child.delegation_chain.len()
        );

        let result = match self.executor.execute_agent(&target, task, &child).await {
            Ok(response) => {
                DelegationResult::success(from_agent, to_agent, task, response.content, start_time)
            }
            Err(ExecutorError::Timeout(_)) => {
                DelegationResult::timeout(from_agent, to_agent, task, start_time)
            }
            Err(e) => {
                DelegationResult::failure(from_agent, to_agent, task, e.to_string(), start_time)
            }
        };
        Ok(result)
    }
}
