//! The outermost orchestration entry point.
//!
//! [`Orchestrator`] wires the engine together for one cohort run: it opens a
//! [`Session`](crate::session::Session), prepares the session workspace,
//! hands the cohort to the
//! [`DependencyGraphScheduler`](crate::scheduler::DependencyGraphScheduler),
//! and — when an agent's response contains delegation markers — re-enters
//! the [`DelegationController`](crate::delegation::DelegationController)
//! recursively until the delegation rules (depth, cycles, permissions) stop
//! the cascade. Completed responses are persisted to the memory store when
//! one is attached.
//!
//! ```text
//! run_cohort(["cto", "backend"], task)
//!   ├─ SessionManager::create            — participants tracked as agents run
//!   ├─ WorkspaceManager::ensure_session  — outputs/ scratch per agent
//!   ├─ DependencyGraphScheduler::execute — levels, batches, skip propagation
//!   ├─ parse_delegations(response)       — [DELEGATE:agent:task] markers
//!   │     └─ DelegationController::delegate  — recursive, depth-bounded
//!   └─ session completed/failed, memory entries written
//! ```

use crate::agentmux::delegation::{parse_delegations, DelegationController, DelegationResult};
use crate::agentmux::executor::{AgentExecutor, ExecutionContext};
use crate::agentmux::memory::{MemoryMetadata, MemoryStore, MemoryType};
use crate::agentmux::profile::{AgentProfile, ProfileRegistry};
use crate::agentmux::scheduler::{
    DependencyGraphScheduler, SchedulerError, SchedulerOptions, SchedulerResult,
};
use crate::agentmux::session::{SessionError, SessionManager};
use crate::agentmux::workspace::WorkspaceManager;
use std::sync::Arc;
use uuid::Uuid;

/// Errors surfaced by [`Orchestrator::run_cohort`].
#[derive(Debug)]
pub enum OrchestratorError {
    /// A requested agent is not registered.
    UnknownAgent(String),
    /// Graph construction failed.
    Scheduler(SchedulerError),
    /// Session bookkeeping failed.
    Session(SessionError),
}

impl std::fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrchestratorError::UnknownAgent(name) => write!(f, "Agent not found: {}", name),
            OrchestratorError::Scheduler(e) => write!(f, "Scheduler error: {}", e),
            OrchestratorError::Session(e) => write!(f, "Session error: {}", e),
        }
    }
}

impl std::error::Error for OrchestratorError {}

impl From<SchedulerError> for OrchestratorError {
    fn from(e: SchedulerError) -> Self {
        OrchestratorError::Scheduler(e)
    }
}

impl From<SessionError> for OrchestratorError {
    fn from(e: SessionError) -> Self {
        OrchestratorError::Session(e)
    }
}

/// Everything one cohort run produced.
#[derive(Debug)]
pub struct CohortOutcome {
    /// The session opened for the run, when a session manager is attached.
    pub session_id: Option<Uuid>,
    /// The scheduler's result: graph, plan, timeline, agent sets.
    pub scheduler: SchedulerResult,
    /// Every delegation the cohort's responses triggered, in re-entry order.
    pub delegations: Vec<DelegationResult>,
}

/// The outermost engine facade. See the module docs for the control flow.
pub struct Orchestrator {
    registry: Arc<ProfileRegistry>,
    scheduler: DependencyGraphScheduler,
    delegation: DelegationController,
    sessions: Option<Arc<SessionManager>>,
    workspace: Option<Arc<WorkspaceManager>>,
    memory: Option<Arc<MemoryStore>>,
}

impl Orchestrator {
    /// Create an orchestrator over a registry and executor.
    pub fn new(registry: Arc<ProfileRegistry>, executor: Arc<dyn AgentExecutor>) -> Self {
        Self {
            scheduler: DependencyGraphScheduler::new(executor.clone()),
            delegation: DelegationController::new(registry.clone(), executor),
            registry,
            sessions: None,
            workspace: None,
            memory: None,
        }
    }

    /// Attach a session manager (builder pattern).
    pub fn with_sessions(mut self, sessions: Arc<SessionManager>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    /// Attach a workspace manager (builder pattern).
    pub fn with_workspace(mut self, workspace: Arc<WorkspaceManager>) -> Self {
        self.workspace = Some(workspace);
        self
    }

    /// Attach a memory store (builder pattern).
    pub fn with_memory(mut self, memory: Arc<MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Replace the delegation controller, e.g. to set a delegation timeout
    /// (builder pattern).
    pub fn with_delegation(mut self, delegation: DelegationController) -> Self {
        self.delegation = delegation;
        self
    }

    /// Run a cohort of registered agents against one task.
    ///
    /// Resolves profiles, opens a session, prepares the session workspace,
    /// executes the dependency graph, then feeds every completed response
    /// through the delegation parser and controller. The session is closed
    /// as completed or failed according to the scheduler outcome.
    pub async fn run_cohort(
        &self,
        initiator: &str,
        agent_names: &[&str],
        task: &str,
        options: SchedulerOptions,
    ) -> Result<CohortOutcome, OrchestratorError> {
        let mut profiles: Vec<Arc<AgentProfile>> = Vec::with_capacity(agent_names.len());
        for name in agent_names {
            let profile = self
                .registry
                .get(name)
                .ok_or_else(|| OrchestratorError::UnknownAgent(name.to_string()))?;
            profiles.push(profile);
        }

        let session_id = match &self.sessions {
            Some(sessions) => Some(sessions.create(initiator, task)?),
            None => None,
        };
        if let (Some(workspace), Some(session_id)) = (&self.workspace, session_id) {
            if let Err(e) = workspace.ensure_session(&session_id.to_string()) {
                log::warn!("could not prepare session workspace: {}", e);
            }
        }

        let mut context = ExecutionContext::new(task);
        context.cancellation = options.cancellation.clone();
        if let Some(session_id) = session_id {
            context = context.with_session(session_id);
        }

        let scheduler_result = self.scheduler.execute(profiles, context.clone(), options).await?;

        let mut delegations = Vec::new();
        for agent in &scheduler_result.completed_agents {
            if let Some(sessions) = &self.sessions {
                if let Some(session_id) = session_id {
                    sessions.add_participant(session_id, agent.clone())?;
                }
            }

            let response = scheduler_result.graph.nodes[agent]
                .result
                .as_ref()
                .and_then(|r| r.response.clone())
                .unwrap_or_default();
            self.remember_response(agent, &response, session_id);

            self.process_delegations(agent, &response, &context, &mut delegations)
                .await;
        }

        if let Some(sessions) = &self.sessions {
            if let Some(session_id) = session_id {
                if scheduler_result.success {
                    sessions.complete(session_id)?;
                } else {
                    sessions.fail(session_id)?;
                }
            }
        }

        Ok(CohortOutcome {
            session_id,
            scheduler: scheduler_result,
            delegations,
        })
    }

    /// Parse delegation markers out of a response and act on them,
    /// descending into the targets' responses via a worklist. The
    /// controller's cycle and depth rules bound the cascade; refusals are
    /// logged and dropped.
    async fn process_delegations(
        &self,
        from_agent: &str,
        response: &str,
        context: &ExecutionContext,
        delegations: &mut Vec<DelegationResult>,
    ) {
        // Frames of (delegating agent, its response, chain at its frame).
        let mut worklist: Vec<(String, String, Vec<String>)> = vec![(
            from_agent.to_string(),
            response.to_string(),
            context.delegation_chain.clone(),
        )];

        while let Some((from, text, chain)) = worklist.pop() {
            for intent in parse_delegations(&text) {
                let mut frame_context = context.clone();
                frame_context.delegation_chain = chain.clone();

                match self
                    .delegation
                    .delegate(&from, &intent.to_agent, &intent.task, &frame_context)
                    .await
                {
                    Ok(result) => {
                        if let (Some(sessions), Some(session_id)) =
                            (&self.sessions, context.session_id)
                        {
                            let _ = sessions.add_participant(session_id, intent.to_agent.clone());
                        }
                        if let (true, Some(nested)) = (result.success, &result.response) {
                            self.remember_response(&intent.to_agent, nested, context.session_id);
                            // The target executed with the chain extended by
                            // its delegator; descend with that frame.
                            let mut nested_chain = chain.clone();
                            nested_chain.push(from.clone());
                            worklist.push((intent.to_agent.clone(), nested.clone(), nested_chain));
                        }
                        delegations.push(result);
                    }
                    Err(e) => {
                        log::warn!(
                            "delegation {} -> {} refused: {}",
                            from,
                            intent.to_agent,
                            e
                        );
                    }
                }
            }
        }
    }

    /// Persist a response to the memory store when one is attached. Never
    /// fatal.
    fn remember_response(&self, agent: &str, response: &str, session_id: Option<Uuid>) {
        let Some(memory) = &self.memory else {
            return;
        };
        if response.is_empty() {
            return;
        }
        let mut metadata = MemoryMetadata::new(MemoryType::Conversation)
            .with_agent_id(agent)
            .with_source(agent);
        if let Some(session_id) = session_id {
            metadata = metadata.with_session_id(session_id.to_string());
        }
        if let Err(e) = memory.add(response, None, metadata.into_value()) {
            log::warn!("could not persist {}'s response to memory: {}", agent, e);
        }
    }
}
