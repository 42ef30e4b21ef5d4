// src/lib.rs

// Import the top-level `agentmux` module.
pub mod agentmux;

// If you want to provide direct access (without having to navigate through the whole hierarchy) to certain types or functionalities at the crate level, you can use re-exports:

// Re-exporting the component modules for easier external access.
pub use agentmux::{
    cache, checkpoint, config, delegation, engine, executor, memory, profile, prompt, provider,
    providers, router, scheduler, session, stage, workspace,
};

// Re-exporting key items for easier external access.
pub use agentmux::delegation::{DelegationController, DelegationResult, DelegationStatus};
pub use agentmux::executor::{AgentExecutor, ExecutionContext};
pub use agentmux::profile::{AgentProfile, ProfileRegistry, Stage};
pub use agentmux::provider::{CliProvider, ExecutionRequest, ExecutionResponse};
pub use agentmux::router::Router;
pub use agentmux::scheduler::DependencyGraphScheduler;
pub use agentmux::stage::StageExecutionController;
