//! Agent profiles and the registry that resolves them.
//!
//! An [`AgentProfile`] is the declarative description of an agent: identity,
//! role prompt, abilities, provider preference, model parameters, an optional
//! sequence of [`Stage`]s, and the [`OrchestrationSettings`] that govern
//! delegation and workspace access. Profiles are created when read from the
//! profile source and are immutable for the duration of one execution — the
//! engine only ever holds them behind `Arc`.
//!
//! # Example
//!
//! ```rust
//! use agentmux::profile::{AgentProfile, OrchestrationSettings, Stage};
//!
//! let profile = AgentProfile::new("backend", "You are a backend engineer.")
//!     .with_display_name("Backend Engineer")
//!     .with_ability("rust-style")
//!     .with_provider("claude")
//!     .with_stage(Stage::new("design", "Sketch the API surface."))
//!     .with_stage(Stage::new("implement", "Write the code."))
//!     .with_orchestration(OrchestrationSettings::coordinator());
//!
//! assert_eq!(profile.name, "backend");
//! assert_eq!(profile.stages.len(), 2);
//! assert_eq!(profile.orchestration.max_delegation_depth, 3);
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Default delegation depth for a regular agent.
pub const DEFAULT_DELEGATION_DEPTH: usize = 2;
/// Delegation depth granted to coordinator-class agents.
pub const COORDINATOR_DELEGATION_DEPTH: usize = 3;
/// Delegation depth granted to implementer-class agents.
pub const IMPLEMENTER_DELEGATION_DEPTH: usize = 1;

/// Delegation and workspace permissions attached to an [`AgentProfile`].
///
/// These settings are the contract the [`DelegationController`](crate::delegation::DelegationController)
/// and [`WorkspaceManager`](crate::workspace::WorkspaceManager) enforce:
/// `max_delegation_depth` bounds how deep a delegation chain originating at
/// this agent may grow, `can_delegate` controls whether the agent may be the
/// target of a delegation at all, `can_read_workspaces` whitelists peer
/// agents whose session outputs this agent may read, and
/// `can_write_to_shared` gates the cross-session shared area.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestrationSettings {
    /// Maximum delegation chain length when this agent originates the chain.
    pub max_delegation_depth: usize,
    /// Whether this agent accepts delegated work.
    pub can_delegate: bool,
    /// Names of peer agents whose session workspaces this agent may read.
    pub can_read_workspaces: Vec<String>,
    /// Whether this agent may write to the cross-session shared workspace.
    pub can_write_to_shared: bool,
}

impl Default for OrchestrationSettings {
    fn default() -> Self {
        Self {
            max_delegation_depth: DEFAULT_DELEGATION_DEPTH,
            can_delegate: true,
            can_read_workspaces: Vec::new(),
            can_write_to_shared: false,
        }
    }
}

impl OrchestrationSettings {
    /// Settings for a coordinator agent (delegation depth 3).
    ///
    /// # Example
    ///
    /// ```rust
    /// use agentmux::profile::OrchestrationSettings;
    ///
    /// let settings = OrchestrationSettings::coordinator();
    /// assert_eq!(settings.max_delegation_depth, 3);
    /// assert!(settings.can_delegate);
    /// ```
    pub fn coordinator() -> Self {
        Self {
            max_delegation_depth: COORDINATOR_DELEGATION_DEPTH,
            ..Self::default()
        }
    }

    /// Settings for an implementer agent (delegation depth 1).
    pub fn implementer() -> Self {
        Self {
            max_delegation_depth: IMPLEMENTER_DELEGATION_DEPTH,
            ..Self::default()
        }
    }

    /// Allow this agent to read the session workspace of `agent` (builder pattern).
    pub fn with_readable_workspace(mut self, agent: impl Into<String>) -> Self {
        self.can_read_workspaces.push(agent.into());
        self
    }

    /// Allow this agent to write to the shared persistent workspace (builder pattern).
    pub fn with_shared_write(mut self) -> Self {
        self.can_write_to_shared = true;
        self
    }
}

/// Model parameters forwarded to the provider for every call made on behalf
/// of the owning agent.
///
/// All fields are optional; unset fields fall back to the provider's own
/// defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ModelParams {
    /// Model identifier passed through to the provider CLI (e.g. `"sonnet"`).
    pub model: Option<String>,
    /// Sampling temperature.
    pub temperature: Option<f32>,
    /// Completion token cap.
    pub max_tokens: Option<usize>,
}

/// One step in an agent's staged workflow.
///
/// Stages are strictly ordered within a profile; names must be unique. Any
/// field left `None` is materialised from the
/// [`StageControllerConfig`](crate::stage::StageControllerConfig) defaults
/// when the [`StageExecutionController`](crate::stage::StageExecutionController)
/// enhances the declared stages.
///
/// # Example
///
/// ```rust
/// use agentmux::profile::Stage;
/// use std::time::Duration;
///
/// let stage = Stage::new("analyze", "Read the codebase and list the risks.")
///     .with_timeout(Duration::from_secs(120))
///     .with_max_retries(2)
///     .with_key_question("Which modules are load-bearing?")
///     .with_expected_output("A ranked risk list")
///     .save_to_memory();
///
/// assert_eq!(stage.name, "analyze");
/// assert!(stage.checkpoint);
/// assert!(stage.save_to_memory);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Stage {
    /// Stage name, unique within the owning profile.
    pub name: String,
    /// What the stage is supposed to accomplish. Included verbatim in the
    /// stage prompt.
    pub description: String,
    /// Whether to pause at the post-stage checkpoint in interactive mode.
    pub checkpoint: bool,
    /// Per-attempt timeout. `None` falls back to the controller default.
    pub timeout: Option<Duration>,
    /// Additional retries after the first attempt. `None` falls back to the
    /// controller default.
    pub max_retries: Option<u32>,
    /// Base delay for exponential backoff between retries.
    pub retry_delay: Option<Duration>,
    /// Persist the stage output to the memory store on completion.
    pub save_to_memory: bool,
    /// Questions the stage output should address. Appended to the prompt.
    pub key_questions: Vec<String>,
    /// Outputs the stage is expected to produce. Appended to the prompt.
    pub expected_outputs: Vec<String>,
}

impl Stage {
    /// Create a stage with the given name and description. Checkpointing
    /// defaults to on, everything else to the controller defaults.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            checkpoint: true,
            timeout: None,
            max_retries: None,
            retry_delay: None,
            save_to_memory: false,
            key_questions: Vec::new(),
            expected_outputs: Vec::new(),
        }
    }

    /// Disable the post-stage checkpoint prompt for this stage (builder pattern).
    pub fn without_checkpoint(mut self) -> Self {
        self.checkpoint = false;
        self
    }

    /// Override the per-attempt timeout (builder pattern).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Override the retry budget (builder pattern).
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Override the base retry delay (builder pattern).
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = Some(retry_delay);
        self
    }

    /// Persist this stage's output to the memory store (builder pattern).
    pub fn save_to_memory(mut self) -> Self {
        self.save_to_memory = true;
        self
    }

    /// Add a key question the stage should address (builder pattern).
    pub fn with_key_question(mut self, question: impl Into<String>) -> Self {
        self.key_questions.push(question.into());
        self
    }

    /// Add an expected output (builder pattern).
    pub fn with_expected_output(mut self, output: impl Into<String>) -> Self {
        self.expected_outputs.push(output.into());
        self
    }
}

/// Declarative description of an agent.
///
/// A profile is identity plus behaviour: the role prompt and abilities shape
/// the system prompt, `provider`/`model_params` steer routing, `stages`
/// switches the agent to staged execution, and `dependencies`/`parallel`
/// position the agent inside a scheduler cohort.
///
/// Profiles are immutable during one execution; the engine shares them via
/// `Arc<AgentProfile>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    /// Unique agent name referenced by dependencies and delegation.
    pub name: String,
    /// Optional human-readable display name for timelines and logs.
    pub display_name: Option<String>,
    /// Role prompt that seeds the system prompt.
    pub role: String,
    /// Names of ability snippets spliced into the system prompt by the
    /// profile source.
    pub abilities: Vec<String>,
    /// Preferred provider name, matched against router candidates.
    pub provider: Option<String>,
    /// Model parameters forwarded on every call.
    pub model_params: ModelParams,
    /// Ordered stages; empty for single-shot agents.
    pub stages: Vec<Stage>,
    /// Whether the scheduler may run this agent inside a parallel batch.
    pub parallel: bool,
    /// Names of agents whose results this agent depends on.
    pub dependencies: Vec<String>,
    /// Delegation and workspace permissions.
    pub orchestration: OrchestrationSettings,
    /// Arbitrary metadata associated with the agent (e.g. team, region).
    pub metadata: HashMap<String, String>,
}

impl AgentProfile {
    /// Create a profile with the mandatory identity and role prompt.
    pub fn new(name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            display_name: None,
            role: role.into(),
            abilities: Vec::new(),
            provider: None,
            model_params: ModelParams::default(),
            stages: Vec::new(),
            parallel: true,
            dependencies: Vec::new(),
            orchestration: OrchestrationSettings::default(),
            metadata: HashMap::new(),
        }
    }

    /// Attach a display name used in timelines and logs (builder pattern).
    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    /// Add an ability snippet name (builder pattern).
    pub fn with_ability(mut self, ability: impl Into<String>) -> Self {
        self.abilities.push(ability.into());
        self
    }

    /// Prefer a specific provider for this agent (builder pattern).
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    /// Override the model parameters (builder pattern).
    pub fn with_model_params(mut self, params: ModelParams) -> Self {
        self.model_params = params;
        self
    }

    /// Append a stage to the staged workflow (builder pattern).
    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    /// Mark this agent as sequential — the scheduler will give it a
    /// single-agent batch instead of folding it into a parallel one
    /// (builder pattern).
    pub fn sequential(mut self) -> Self {
        self.parallel = false;
        self
    }

    /// Declare a dependency on another agent in the same cohort (builder pattern).
    pub fn with_dependency(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    /// Replace the orchestration settings (builder pattern).
    pub fn with_orchestration(mut self, orchestration: OrchestrationSettings) -> Self {
        self.orchestration = orchestration;
        self
    }

    /// Add arbitrary metadata to the profile (builder pattern).
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Display name if set, otherwise the agent name.
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }

    /// Compose the system prompt from the role prompt and ability snippets.
    ///
    /// Ability bodies are resolved by the profile source; here the names are
    /// spliced as section headers so the provider sees which abilities were
    /// granted even when the source supplies no bodies.
    pub fn system_prompt(&self, ability_bodies: &HashMap<String, String>) -> String {
        let mut prompt = self.role.clone();
        for ability in &self.abilities {
            prompt.push_str("\n\n## Ability: ");
            prompt.push_str(ability);
            if let Some(body) = ability_bodies.get(ability) {
                prompt.push('\n');
                prompt.push_str(body);
            }
        }
        prompt
    }
}

/// Errors raised by [`ProfileRegistry`] operations.
#[derive(Debug, Clone)]
pub enum ProfileError {
    /// No profile with the given name is registered.
    NotFound(String),
    /// A profile with the same name is already registered.
    Duplicate(String),
}

impl std::fmt::Display for ProfileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProfileError::NotFound(name) => write!(f, "Agent profile not found: {}", name),
            ProfileError::Duplicate(name) => {
                write!(f, "Agent profile already registered: {}", name)
            }
        }
    }
}

impl std::error::Error for ProfileError {}

/// In-memory registry of agent profiles keyed by name.
///
/// The scheduler, delegation controller, and stage controller all resolve
/// target agents through a registry. It is constructed by the host and
/// passed in — there is no process-wide singleton.
///
/// # Example
///
/// ```rust
/// use agentmux::profile::{AgentProfile, ProfileRegistry};
///
/// let mut registry = ProfileRegistry::new();
/// registry.register(AgentProfile::new("cto", "You are the CTO.")).unwrap();
/// registry.register(AgentProfile::new("backend", "You are a backend engineer.")).unwrap();
///
/// assert!(registry.get("cto").is_some());
/// assert_eq!(registry.names().len(), 2);
/// assert!(registry.register(AgentProfile::new("cto", "dup")).is_err());
/// ```
#[derive(Default)]
pub struct ProfileRegistry {
    profiles: HashMap<String, Arc<AgentProfile>>,
    order: Vec<String>,
}

impl ProfileRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a profile. Fails if the name is already taken.
    pub fn register(&mut self, profile: AgentProfile) -> Result<(), ProfileError> {
        let name = profile.name.clone();
        if self.profiles.contains_key(&name) {
            return Err(ProfileError::Duplicate(name));
        }
        self.order.push(name.clone());
        self.profiles.insert(name, Arc::new(profile));
        Ok(())
    }

    /// Look up a profile by name.
    pub fn get(&self, name: &str) -> Option<Arc<AgentProfile>> {
        self.profiles.get(name).cloned()
    }

    /// Remove a profile, returning it if it was registered.
    pub fn remove(&mut self, name: &str) -> Option<Arc<AgentProfile>> {
        self.order.retain(|n| n != name);
        self.profiles.remove(name)
    }

    /// Registered names in insertion order.
    pub fn names(&self) -> Vec<String> {
        self.order.clone()
    }

    /// Number of registered profiles.
    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orchestration_depth_presets() {
        assert_eq!(
            OrchestrationSettings::default().max_delegation_depth,
            DEFAULT_DELEGATION_DEPTH
        );
        assert_eq!(
            OrchestrationSettings::coordinator().max_delegation_depth,
            COORDINATOR_DELEGATION_DEPTH
        );
        assert_eq!(
            OrchestrationSettings::implementer().max_delegation_depth,
            IMPLEMENTER_DELEGATION_DEPTH
        );
    }

    #[test]
    fn system_prompt_splices_abilities() {
        let profile = AgentProfile::new("a", "Role prompt.")
            .with_ability("style")
            .with_ability("testing");

        let mut bodies = HashMap::new();
        bodies.insert("style".to_string(), "Prefer short functions.".to_string());

        let prompt = profile.system_prompt(&bodies);
        assert!(prompt.starts_with("Role prompt."));
        assert!(prompt.contains("## Ability: style"));
        assert!(prompt.contains("Prefer short functions."));
        assert!(prompt.contains("## Ability: testing"));
    }

    #[test]
    fn registry_rejects_duplicates() {
        let mut registry = ProfileRegistry::new();
        registry
            .register(AgentProfile::new("a", "role"))
            .unwrap();
        let err = registry.register(AgentProfile::new("a", "role")).unwrap_err();
        assert!(matches!(err, ProfileError::Duplicate(_)));
    }
}
