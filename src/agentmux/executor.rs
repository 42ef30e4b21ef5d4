//! The agent-execution seam between orchestration and providers.
//!
//! The scheduler, stage controller, and delegation controller all invoke
//! agents through the [`AgentExecutor`] trait rather than talking to the
//! [`Router`](crate::router::Router) directly. Production code uses
//! [`RouterAgentExecutor`]; tests substitute mocks that script successes,
//! failures, and timeouts.

use crate::agentmux::profile::AgentProfile;
use crate::agentmux::provider::{ExecutionRequest, ExecutionResponse};
use crate::agentmux::router::{Router, RouterError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Context shared by a cohort and cloned per agent invocation.
///
/// The scheduler clones the cohort context for each agent, overriding the
/// task when the agent declares its own; the delegation controller clones it
/// for the target agent with an extended delegation chain.
#[derive(Clone)]
pub struct ExecutionContext {
    /// Session this execution belongs to, when one was opened.
    pub session_id: Option<Uuid>,
    /// The task given to the cohort or delegated to the agent.
    pub task: String,
    /// Free-form data shared across agents in the cohort.
    pub shared_data: HashMap<String, serde_json::Value>,
    /// Agent names traversed from the initiator to the current frame.
    pub delegation_chain: Vec<String>,
    /// Cooperative cancellation handle threaded through every suspension
    /// point.
    pub cancellation: CancellationToken,
    /// Per-invocation timeout applied to provider calls.
    pub timeout: Option<Duration>,
}

impl ExecutionContext {
    /// Create a context for the given task with no session and no chain.
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            session_id: None,
            task: task.into(),
            shared_data: HashMap::new(),
            delegation_chain: Vec::new(),
            cancellation: CancellationToken::new(),
            timeout: None,
        }
    }

    /// Attach a session id (builder pattern).
    pub fn with_session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// Thread an existing cancellation token through (builder pattern).
    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// Bound each provider invocation (builder pattern).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Clone this context for a specific agent and task override.
    pub fn for_agent(&self, task: impl Into<String>) -> Self {
        let mut child = self.clone();
        child.task = task.into();
        child
    }
}

/// Failures surfaced by an [`AgentExecutor`].
///
/// Timeouts are kept distinct from other failures because the delegation
/// boundary maps them to their own result status.
#[derive(Debug, Clone)]
pub enum ExecutorError {
    /// The invocation exceeded its time budget.
    Timeout(String),
    /// The caller's cancellation token fired.
    Cancelled,
    /// Any other failure (provider error, no available providers, ...).
    Failed(String),
}

impl std::fmt::Display for ExecutorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutorError::Timeout(message) => write!(f, "Agent execution timed out: {}", message),
            ExecutorError::Cancelled => write!(f, "Agent execution cancelled"),
            ExecutorError::Failed(message) => write!(f, "Agent execution failed: {}", message),
        }
    }
}

impl std::error::Error for ExecutorError {}

/// Executes one agent against a task within a context.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Run `profile` against `task`, honouring the context's cancellation
    /// token and timeout.
    async fn execute_agent(
        &self,
        profile: &AgentProfile,
        task: &str,
        context: &ExecutionContext,
    ) -> Result<ExecutionResponse, ExecutorError>;
}

/// Production executor: builds a provider request from the profile and routes
/// it through the [`Router`].
pub struct RouterAgentExecutor {
    router: Arc<Router>,
    /// Resolved ability snippet bodies spliced into system prompts.
    ability_bodies: HashMap<String, String>,
}

impl RouterAgentExecutor {
    /// Create an executor over the given router.
    pub fn new(router: Arc<Router>) -> Self {
        Self {
            router,
            ability_bodies: HashMap::new(),
        }
    }

    /// Supply resolved ability bodies (builder pattern).
    pub fn with_ability_bodies(mut self, bodies: HashMap<String, String>) -> Self {
        self.ability_bodies = bodies;
        self
    }
}

#[async_trait]
impl AgentExecutor for RouterAgentExecutor {
    async fn execute_agent(
        &self,
        profile: &AgentProfile,
        task: &str,
        context: &ExecutionContext,
    ) -> Result<ExecutionResponse, ExecutorError> {
        let mut request = ExecutionRequest::new(task)
            .with_system_prompt(profile.system_prompt(&self.ability_bodies))
            .with_cancellation(context.cancellation.clone());

        if let Some(model) = &profile.model_params.model {
            request = request.with_model(model.clone());
        }
        if let Some(temperature) = profile.model_params.temperature {
            request = request.with_temperature(temperature);
        }
        if let Some(max_tokens) = profile.model_params.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }
        if let Some(timeout) = context.timeout {
            request = request.with_timeout(timeout);
        }

        self.router.execute(&request).await.map_err(|e| match e {
            RouterError::Cancelled => ExecutorError::Cancelled,
            e if e.is_timeout() => ExecutorError::Timeout(e.to_string()),
            e => ExecutorError::Failed(e.to_string()),
        })
    }
}
