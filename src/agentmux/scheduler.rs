//! Dependency-graph scheduling of multi-agent cohorts.
//!
//! The [`DependencyGraphScheduler`] takes a cohort of agent profiles, builds
//! an acyclic dependency graph, computes levels (length of the longest path
//! from any root), derives an execution plan of parallel and sequential
//! batches per level, and runs the cohort level by level:
//!
//! ```text
//! level 0:  [a]   [b]        — roots, parallel batch
//! level 1:  [c(deps=a,b)]    — runs only after level 0 reached terminal states
//! level 2:  [d(deps=c)]      — skipped transitively if c fails
//! ```
//!
//! Within one level no ordering is guaranteed between parallel-batch agents;
//! across levels every agent of level *i* reaches a terminal state before
//! level *i+1* starts. A failing agent causes every transitive dependent to
//! be skipped; cancellation stops dispatch and marks still-pending agents
//! cancelled in the timeline.

use crate::agentmux::delegation::DelegationResult;
use crate::agentmux::executor::{AgentExecutor, ExecutionContext};
use crate::agentmux::profile::AgentProfile;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Node state inside one scheduler run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Not yet dispatched.
    Pending,
    /// Dispatched, awaiting the provider.
    Running,
    /// Finished successfully.
    Completed,
    /// The agent's execution failed.
    Failed,
    /// A dependency failed, so this agent never ran.
    Skipped,
    /// Cancellation arrived before this agent was dispatched.
    Cancelled,
}

/// One agent inside the dependency graph.
#[derive(Debug, Clone)]
pub struct GraphNode {
    /// Agent name.
    pub agent: String,
    /// Names of the agents this one depends on.
    pub dependencies: Vec<String>,
    /// Longest path from any root; roots are level 0.
    pub level: usize,
    /// Current state.
    pub status: NodeStatus,
    /// The agent's result, set when it ran.
    pub result: Option<DelegationResult>,
}

/// The dependency graph built at scheduler entry.
///
/// Represented as flat maps keyed by agent name — nodes never hold pointers
/// to each other.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// Nodes keyed by agent name.
    pub nodes: HashMap<String, GraphNode>,
    /// Edges `dependency -> dependents`.
    pub adjacency: HashMap<String, Vec<String>>,
    /// Agent names grouped by level.
    pub levels: BTreeMap<usize, Vec<String>>,
    /// Highest level in the graph.
    pub max_level: usize,
}

/// How a batch dispatches its agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchMode {
    /// All agents of the batch run concurrently.
    Parallel,
    /// Agents run one at a time.
    Sequential,
}

/// One batch of agents within a level.
#[derive(Debug, Clone, Serialize)]
pub struct Batch {
    /// Dispatch mode.
    pub mode: BatchMode,
    /// Agent names, in cohort order.
    pub agents: Vec<String>,
}

/// Batches derived for one level.
#[derive(Debug, Clone, Serialize)]
pub struct LevelPlan {
    /// The level.
    pub level: usize,
    /// Batches, executed to completion in order.
    pub batches: Vec<Batch>,
}

/// The full execution plan for a cohort.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionPlan {
    /// Per-level batch lists, ascending by level.
    pub levels: Vec<LevelPlan>,
}

/// One timeline record per agent terminal state.
#[derive(Debug, Clone)]
pub struct TimelineEntry {
    /// Agent name.
    pub agent_name: String,
    /// Display name, when the profile declares one.
    pub display_name: Option<String>,
    /// When the agent started (equals `end_time` for skip/cancel records).
    pub start_time: DateTime<Utc>,
    /// When the agent reached its terminal state.
    pub end_time: DateTime<Utc>,
    /// `end_time − start_time` in milliseconds.
    pub duration_ms: u64,
    /// The agent's level.
    pub level: usize,
    /// Terminal state.
    pub status: NodeStatus,
    /// Failure text for failed agents.
    pub error: Option<String>,
}

/// Scheduler options.
#[derive(Clone)]
pub struct SchedulerOptions {
    /// Keep executing agents whose dependencies succeeded after another
    /// agent failed.
    pub continue_on_failure: bool,
    /// Cap on concurrently dispatched agents inside one parallel batch.
    pub max_concurrent: Option<usize>,
    /// Cooperative cancellation handle.
    pub cancellation: CancellationToken,
    /// Cap on total cohort execution.
    pub timeout: Option<Duration>,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            continue_on_failure: true,
            max_concurrent: None,
            cancellation: CancellationToken::new(),
            timeout: None,
        }
    }
}

/// Result of one cohort execution.
#[derive(Debug)]
pub struct SchedulerResult {
    /// `true` iff no agent failed.
    pub success: bool,
    /// Agents that completed, in terminal order.
    pub completed_agents: Vec<String>,
    /// Agents that failed.
    pub failed_agents: Vec<String>,
    /// Agents skipped because a dependency failed.
    pub skipped_agents: Vec<String>,
    /// Agents cancelled before dispatch.
    pub cancelled_agents: Vec<String>,
    /// One entry per agent terminal state.
    pub timeline: Vec<TimelineEntry>,
    /// Total cohort wall-clock duration in milliseconds.
    pub total_duration_ms: u64,
    /// The graph, with final node states and results.
    pub graph: DependencyGraph,
    /// The derived execution plan.
    pub plan: ExecutionPlan,
}

/// Errors raised during graph construction.
#[derive(Debug, Clone)]
pub enum SchedulerError {
    /// The cohort contains no agents.
    EmptyCohort,
    /// Two profiles share a name.
    DuplicateAgent(String),
    /// A dependency references an agent outside the cohort.
    UnknownDependency {
        /// The depending agent.
        agent: String,
        /// The missing dependency.
        dependency: String,
    },
    /// The dependency graph contains a cycle; carries one concrete cycle
    /// path, e.g. `["a", "b", "a"]`.
    CircularDependency(Vec<String>),
}

impl std::fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerError::EmptyCohort => write!(f, "Cohort contains no agents"),
            SchedulerError::DuplicateAgent(name) => {
                write!(f, "Duplicate agent in cohort: {}", name)
            }
            SchedulerError::UnknownDependency { agent, dependency } => {
                write!(f, "Agent '{}' depends on unknown agent '{}'", agent, dependency)
            }
            SchedulerError::CircularDependency(cycle) => {
                write!(f, "Circular dependency: {}", cycle.join(" -> "))
            }
        }
    }
}

impl std::error::Error for SchedulerError {}

/// Build the dependency graph for a cohort: nodes, adjacency, levels.
///
/// Levels are computed by Kahn-style propagation — roots at level 0, every
/// other node at `1 + max(level of its dependencies)`. Any node left
/// unlevelled is part of a cycle; a concrete cycle path is surfaced in the
/// error.
pub fn build_graph(profiles: &[Arc<AgentProfile>]) -> Result<DependencyGraph, SchedulerError> {
    if profiles.is_empty() {
        return Err(SchedulerError::EmptyCohort);
    }

    let mut nodes: HashMap<String, GraphNode> = HashMap::new();
    let mut adjacency: HashMap<String, Vec<String>> = HashMap::new();

    for profile in profiles {
        if nodes.contains_key(&profile.name) {
            return Err(SchedulerError::DuplicateAgent(profile.name.clone()));
        }
        nodes.insert(
            profile.name.clone(),
            GraphNode {
                agent: profile.name.clone(),
                dependencies: profile.dependencies.clone(),
                level: 0,
                status: NodeStatus::Pending,
                result: None,
            },
        );
        adjacency.entry(profile.name.clone()).or_default();
    }

    for profile in profiles {
        for dependency in &profile.dependencies {
            if !nodes.contains_key(dependency) {
                return Err(SchedulerError::UnknownDependency {
                    agent: profile.name.clone(),
                    dependency: dependency.clone(),
                });
            }
            adjacency
                .entry(dependency.clone())
                .or_default()
                .push(profile.name.clone());
        }
    }

    // Kahn-style level propagation.
    let mut indegree: HashMap<String, usize> = nodes
        .iter()
        .map(|(name, node)| (name.clone(), node.dependencies.len()))
        .collect();
    let mut queue: Vec<String> = profiles
        .iter()
        .filter(|p| p.dependencies.is_empty())
        .map(|p| p.name.clone())
        .collect();
    let mut levelled: HashMap<String, usize> = queue.iter().map(|n| (n.clone(), 0)).collect();

    while let Some(name) = queue.pop() {
        let level = levelled[&name];
        for dependent in adjacency.get(&name).cloned().unwrap_or_default() {
            let proposed = level + 1;
            let entry = levelled.entry(dependent.clone()).or_insert(0);
            if proposed > *entry {
                *entry = proposed;
            }
            let remaining = indegree.get_mut(&dependent).unwrap();
            *remaining -= 1;
            if *remaining == 0 {
                queue.push(dependent);
            }
        }
    }

    if levelled.len() != nodes.len() {
        let unlevelled: Vec<&String> = nodes
            .keys()
            .filter(|name| !levelled.contains_key(*name))
            .collect();
        let cycle = surface_cycle(&nodes, &levelled, unlevelled[0]);
        return Err(SchedulerError::CircularDependency(cycle));
    }

    let mut levels: BTreeMap<usize, Vec<String>> = BTreeMap::new();
    let mut max_level = 0;
    for profile in profiles {
        let level = levelled[&profile.name];
        nodes.get_mut(&profile.name).unwrap().level = level;
        levels.entry(level).or_default().push(profile.name.clone());
        max_level = max_level.max(level);
    }

    Ok(DependencyGraph {
        nodes,
        adjacency,
        levels,
        max_level,
    })
}

/// Walk an unlevelled node's unlevelled dependencies until one repeats,
/// producing a concrete cycle path such as `["a", "b", "a"]`.
///
/// Every unlevelled node has at least one unlevelled dependency (otherwise
/// propagation would have levelled it), so the walk stays inside the cyclic
/// region and must revisit a node.
fn surface_cycle(
    nodes: &HashMap<String, GraphNode>,
    levelled: &HashMap<String, usize>,
    start: &str,
) -> Vec<String> {
    let mut path: Vec<String> = vec![start.to_string()];
    let mut current = start.to_string();
    loop {
        let node = &nodes[&current];
        let Some(next) = node
            .dependencies
            .iter()
            .find(|dependency| !levelled.contains_key(*dependency))
        else {
            return path;
        };
        if let Some(position) = path.iter().position(|n| n == next) {
            path.push(next.clone());
            return path[position..].to_vec();
        }
        path.push(next.clone());
        current = next.clone();
    }
}

/// Derive the per-level batches.
///
/// Walking each level's agents in cohort order: an agent declaring
/// `parallel == false` gets a sequential batch of its own; runs of parallel
/// agents are grouped into parallel batches capped at `max_concurrent`.
pub fn build_plan(
    graph: &DependencyGraph,
    profiles: &HashMap<String, Arc<AgentProfile>>,
    max_concurrent: Option<usize>,
) -> ExecutionPlan {
    let cap = max_concurrent.unwrap_or(usize::MAX).max(1);
    let mut levels = Vec::new();

    for (level, agents) in &graph.levels {
        let mut batches: Vec<Batch> = Vec::new();
        let mut open_parallel: Vec<String> = Vec::new();

        for agent in agents {
            let parallel = profiles.get(agent).map(|p| p.parallel).unwrap_or(true);
            if parallel {
                open_parallel.push(agent.clone());
                if open_parallel.len() == cap {
                    batches.push(Batch {
                        mode: BatchMode::Parallel,
                        agents: std::mem::take(&mut open_parallel),
                    });
                }
            } else {
                if !open_parallel.is_empty() {
                    batches.push(Batch {
                        mode: BatchMode::Parallel,
                        agents: std::mem::take(&mut open_parallel),
                    });
                }
                batches.push(Batch {
                    mode: BatchMode::Sequential,
                    agents: vec![agent.clone()],
                });
            }
        }
        if !open_parallel.is_empty() {
            batches.push(Batch {
                mode: BatchMode::Parallel,
                agents: open_parallel,
            });
        }

        levels.push(LevelPlan {
            level: *level,
            batches,
        });
    }

    ExecutionPlan { levels }
}

/// Executes cohorts of agents in dependency order.
pub struct DependencyGraphScheduler {
    executor: Arc<dyn AgentExecutor>,
}

impl DependencyGraphScheduler {
    /// Create a scheduler over the given executor.
    pub fn new(executor: Arc<dyn AgentExecutor>) -> Self {
        Self { executor }
    }

    /// Execute a cohort. See the module docs for the execution model.
    pub async fn execute(
        &self,
        profiles: Vec<Arc<AgentProfile>>,
        context: ExecutionContext,
        options: SchedulerOptions,
    ) -> Result<SchedulerResult, SchedulerError> {
        let started = Instant::now();
        let mut graph = build_graph(&profiles)?;
        let profile_map: HashMap<String, Arc<AgentProfile>> = profiles
            .iter()
            .map(|p| (p.name.clone(), p.clone()))
            .collect();
        let plan = build_plan(&graph, &profile_map, options.max_concurrent);

        // The effective token: the caller's token, optionally fused with the
        // cohort timeout so both produce the same cancellation cascade.
        let cancellation = options.cancellation.child_token();
        if let Some(timeout) = options.timeout {
            let timer_token = cancellation.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => timer_token.cancel(),
                    _ = timer_token.cancelled() => {}
                }
            });
        }
        let mut run_context = context;
        run_context.cancellation = cancellation.clone();

        let mut timeline: Vec<TimelineEntry> = Vec::new();

        'levels: for level_plan in &plan.levels {
            for batch in &level_plan.batches {
                if cancellation.is_cancelled() {
                    mark_pending_cancelled(&mut graph, &profile_map, &mut timeline);
                    break 'levels;
                }

                match batch.mode {
                    BatchMode::Parallel => {
                        self.run_parallel_batch(
                            batch,
                            &mut graph,
                            &profile_map,
                            &run_context,
                            &mut timeline,
                        )
                        .await;
                    }
                    BatchMode::Sequential => {
                        for agent in &batch.agents {
                            if cancellation.is_cancelled() {
                                mark_pending_cancelled(&mut graph, &profile_map, &mut timeline);
                                break 'levels;
                            }
                            self.run_one(agent, &mut graph, &profile_map, &run_context, &mut timeline)
                                .await;
                        }
                    }
                }
            }

            let level_failed = graph
                .levels
                .get(&level_plan.level)
                .map(|agents| {
                    agents
                        .iter()
                        .any(|a| graph.nodes[a].status == NodeStatus::Failed)
                })
                .unwrap_or(false);
            if level_failed && !options.continue_on_failure {
                mark_pending_skipped(&mut graph, &profile_map, &mut timeline);
                break;
            }
        }

        let mut completed_agents = Vec::new();
        let mut failed_agents = Vec::new();
        let mut skipped_agents = Vec::new();
        let mut cancelled_agents = Vec::new();
        for entry in &timeline {
            match entry.status {
                NodeStatus::Completed => completed_agents.push(entry.agent_name.clone()),
                NodeStatus::Failed => failed_agents.push(entry.agent_name.clone()),
                NodeStatus::Skipped => skipped_agents.push(entry.agent_name.clone()),
                NodeStatus::Cancelled => cancelled_agents.push(entry.agent_name.clone()),
                _ => {}
            }
        }

        Ok(SchedulerResult {
            success: failed_agents.is_empty(),
            completed_agents,
            failed_agents,
            skipped_agents,
            cancelled_agents,
            timeline,
            total_duration_ms: started.elapsed().as_millis() as u64,
            graph,
            plan,
        })
    }

    /// Dispatch one parallel batch and fold the results back into the graph.
    async fn run_parallel_batch(
        &self,
        batch: &Batch,
        graph: &mut DependencyGraph,
        profiles: &HashMap<String, Arc<AgentProfile>>,
        context: &ExecutionContext,
        timeline: &mut Vec<TimelineEntry>,
    ) {
        let mut runnable = Vec::new();
        for agent in &batch.agents {
            if self.preflight(agent, graph, profiles, timeline) {
                runnable.push(agent.clone());
            }
        }

        let futures = runnable.iter().map(|agent| {
            let profile = profiles[agent].clone();
            let agent_context = context.for_agent(context.task.clone());
            let executor = self.executor.clone();
            async move {
                let start_time = Utc::now();
                let outcome = executor
                    .execute_agent(&profile, &agent_context.task, &agent_context)
                    .await;
                (profile.name.clone(), start_time, outcome)
            }
        });

        for (agent, start_time, outcome) in join_all(futures).await {
            self.settle(&agent, start_time, outcome, graph, profiles, context, timeline);
        }
    }

    /// Dispatch a single agent (sequential batches).
    async fn run_one(
        &self,
        agent: &str,
        graph: &mut DependencyGraph,
        profiles: &HashMap<String, Arc<AgentProfile>>,
        context: &ExecutionContext,
        timeline: &mut Vec<TimelineEntry>,
    ) {
        if !self.preflight(agent, graph, profiles, timeline) {
            return;
        }
        let profile = profiles[agent].clone();
        let start_time = Utc::now();
        let outcome = self
            .executor
            .execute_agent(&profile, &context.task, context)
            .await;
        self.settle(agent, start_time, outcome, graph, profiles, context, timeline);
    }

    /// Dependency check before dispatch. Marks the node skipped (and its
    /// descendants) when any dependency's result is absent or unsuccessful.
    fn preflight(
        &self,
        agent: &str,
        graph: &mut DependencyGraph,
        profiles: &HashMap<String, Arc<AgentProfile>>,
        timeline: &mut Vec<TimelineEntry>,
    ) -> bool {
        let node = &graph.nodes[agent];
        if node.status != NodeStatus::Pending {
            return false;
        }
        let deps_ok = node.dependencies.iter().all(|dependency| {
            graph.nodes[dependency]
                .result
                .as_ref()
                .map(|result| result.success)
                .unwrap_or(false)
        });
        if node.dependencies.is_empty() || deps_ok {
            graph.nodes.get_mut(agent).unwrap().status = NodeStatus::Running;
            return true;
        }

        set_terminal(graph, profiles, timeline, agent, NodeStatus::Skipped, None);
        mark_descendants_skipped(graph, profiles, timeline, agent);
        false
    }

    /// Record an execution outcome in the graph and timeline; failures skip
    /// all transitive dependents.
    #[allow(clippy::too_many_arguments)]
    fn settle(
        &self,
        agent: &str,
        start_time: DateTime<Utc>,
        outcome: Result<crate::agentmux::provider::ExecutionResponse, crate::agentmux::executor::ExecutorError>,
        graph: &mut DependencyGraph,
        profiles: &HashMap<String, Arc<AgentProfile>>,
        context: &ExecutionContext,
        timeline: &mut Vec<TimelineEntry>,
    ) {
        let from_agent = context
            .delegation_chain
            .last()
            .cloned()
            .unwrap_or_else(|| "orchestrator".to_string());

        match outcome {
            Ok(response) => {
                let result = DelegationResult::success(
                    &from_agent,
                    agent,
                    &context.task,
                    response.content,
                    start_time,
                );
                let node = graph.nodes.get_mut(agent).unwrap();
                node.result = Some(result);
                node.status = NodeStatus::Completed;
                push_timeline(graph, profiles, timeline, agent, start_time, NodeStatus::Completed, None);
            }
            Err(crate::agentmux::executor::ExecutorError::Cancelled) => {
                let node = graph.nodes.get_mut(agent).unwrap();
                node.status = NodeStatus::Cancelled;
                push_timeline(
                    graph,
                    profiles,
                    timeline,
                    agent,
                    start_time,
                    NodeStatus::Cancelled,
                    None,
                );
            }
            Err(error) => {
                log::warn!("agent {} failed: {}", agent, error);
                let node = graph.nodes.get_mut(agent).unwrap();
                node.status = NodeStatus::Failed;
                push_timeline(
                    graph,
                    profiles,
                    timeline,
                    agent,
                    start_time,
                    NodeStatus::Failed,
                    Some(error.to_string()),
                );
                mark_descendants_skipped(graph, profiles, timeline, agent);
            }
        }
    }
}

fn push_timeline(
    graph: &DependencyGraph,
    profiles: &HashMap<String, Arc<AgentProfile>>,
    timeline: &mut Vec<TimelineEntry>,
    agent: &str,
    start_time: DateTime<Utc>,
    status: NodeStatus,
    error: Option<String>,
) {
    let end_time = Utc::now();
    timeline.push(TimelineEntry {
        agent_name: agent.to_string(),
        display_name: profiles.get(agent).and_then(|p| p.display_name.clone()),
        start_time,
        end_time,
        duration_ms: (end_time - start_time).num_milliseconds().max(0) as u64,
        level: graph.nodes.get(agent).map(|n| n.level).unwrap_or(0),
        status,
        error,
    });
}

fn set_terminal(
    graph: &mut DependencyGraph,
    profiles: &HashMap<String, Arc<AgentProfile>>,
    timeline: &mut Vec<TimelineEntry>,
    agent: &str,
    status: NodeStatus,
    error: Option<String>,
) {
    graph.nodes.get_mut(agent).unwrap().status = status;
    let now = Utc::now();
    push_timeline(graph, profiles, timeline, agent, now, status, error);
}

/// Recursively mark every still-pending transitive dependent of `agent` as
/// skipped.
fn mark_descendants_skipped(
    graph: &mut DependencyGraph,
    profiles: &HashMap<String, Arc<AgentProfile>>,
    timeline: &mut Vec<TimelineEntry>,
    agent: &str,
) {
    let dependents = graph.adjacency.get(agent).cloned().unwrap_or_default();
    for dependent in dependents {
        if graph.nodes[&dependent].status == NodeStatus::Pending {
            set_terminal(graph, profiles, timeline, &dependent, NodeStatus::Skipped, None);
            mark_descendants_skipped(graph, profiles, timeline, &dependent);
        }
    }
}

fn mark_pending_cancelled(
    graph: &mut DependencyGraph,
    profiles: &HashMap<String, Arc<AgentProfile>>,
    timeline: &mut Vec<TimelineEntry>,
) {
    let pending: Vec<String> = graph
        .nodes
        .values()
        .filter(|n| n.status == NodeStatus::Pending)
        .map(|n| n.agent.clone())
        .collect();
    for agent in pending {
        set_terminal(graph, profiles, timeline, &agent, NodeStatus::Cancelled, None);
    }
}

fn mark_pending_skipped(
    graph: &mut DependencyGraph,
    profiles: &HashMap<String, Arc<AgentProfile>>,
    timeline: &mut Vec<TimelineEntry>,
) {
    let pending: Vec<String> = graph
        .nodes
        .values()
        .filter(|n| n.status == NodeStatus::Pending)
        .map(|n| n.agent.clone())
        .collect();
    for agent in pending {
        set_terminal(graph, profiles, timeline, &agent, NodeStatus::Skipped, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentmux::profile::AgentProfile;

    fn cohort(specs: &[(&str, &[&str])]) -> Vec<Arc<AgentProfile>> {
        specs
            .iter()
            .map(|(name, deps)| {
                let mut profile = AgentProfile::new(*name, "role");
                for dep in *deps {
                    profile = profile.with_dependency(*dep);
                }
                Arc::new(profile)
            })
            .collect()
    }

    #[test]
    fn levels_follow_longest_path() {
        let graph = build_graph(&cohort(&[
            ("a", &[]),
            ("b", &["a"]),
            ("c", &["a", "b"]),
        ]))
        .unwrap();

        assert_eq!(graph.nodes["a"].level, 0);
        assert_eq!(graph.nodes["b"].level, 1);
        assert_eq!(graph.nodes["c"].level, 2);
        assert_eq!(graph.max_level, 2);
    }

    #[test]
    fn cycles_surface_a_concrete_path() {
        let err = build_graph(&cohort(&[("a", &["b"]), ("b", &["a"])])).unwrap_err();
        match err {
            SchedulerError::CircularDependency(cycle) => {
                assert_eq!(cycle.len(), 3);
                assert_eq!(cycle.first(), cycle.last());
            }
            other => panic!("expected a cycle, got {:?}", other),
        }
    }

    #[test]
    fn unknown_dependencies_are_rejected() {
        let err = build_graph(&cohort(&[("a", &["ghost"])])).unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownDependency { .. }));
    }

    #[test]
    fn sequential_agents_break_parallel_batches() {
        let profiles = vec![
            Arc::new(AgentProfile::new("a", "role")),
            Arc::new(AgentProfile::new("b", "role").sequential()),
            Arc::new(AgentProfile::new("c", "role")),
        ];
        let graph = build_graph(&profiles).unwrap();
        let map: HashMap<String, Arc<AgentProfile>> = profiles
            .iter()
            .map(|p| (p.name.clone(), p.clone()))
            .collect();

        let plan = build_plan(&graph, &map, None);
        let batches = &plan.levels[0].batches;
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].mode, BatchMode::Parallel);
        assert_eq!(batches[1].mode, BatchMode::Sequential);
        assert_eq!(batches[2].mode, BatchMode::Parallel);
    }

    #[test]
    fn max_concurrent_chunks_parallel_batches() {
        let profiles: Vec<Arc<AgentProfile>> = (0..5)
            .map(|i| Arc::new(AgentProfile::new(format!("a{}", i), "role")))
            .collect();
        let graph = build_graph(&profiles).unwrap();
        let map: HashMap<String, Arc<AgentProfile>> = profiles
            .iter()
            .map(|p| (p.name.clone(), p.clone()))
            .collect();

        let plan = build_plan(&graph, &map, Some(2));
        let sizes: Vec<usize> = plan.levels[0].batches.iter().map(|b| b.agents.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }
}
