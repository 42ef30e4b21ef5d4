//! The engine configuration surface.
//!
//! Plain structs with `serde` derives, constructed by the host (a config
//! file parser is an external collaborator — this crate introduces no TOML
//! or YAML dependencies). [`AgentmuxConfig::validate`] enforces the bounds
//! and path rules at load time; precedence is CLI-style flags over
//! configuration over the defaults baked into `Default` impls, and on
//! resume the checkpoint-stored mode wins unless explicitly overridden.
//!
//! # Example
//!
//! ```rust
//! use agentmux::config::AgentmuxConfig;
//!
//! let mut config = AgentmuxConfig::default();
//! config.orchestration.delegation.max_depth = 3;
//! assert!(config.validate().is_ok());
//!
//! config.memory.persist_path = Some("../outside".into());
//! assert!(config.validate().is_err());
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

/// Upper bound on retry attempts.
pub const MAX_RETRY_ATTEMPTS: u32 = 10;
/// Bounds on the retry backoff factor.
pub const MIN_BACKOFF_FACTOR: f64 = 1.0;
/// Upper bound on the retry backoff factor.
pub const MAX_BACKOFF_FACTOR: f64 = 10.0;
/// Upper bound on any `cleanup_after_days` field.
pub const MAX_CLEANUP_DAYS: u32 = 365;
/// Upper bound on delegation depth.
pub const MAX_DELEGATION_DEPTH_LIMIT: usize = 5;
/// Upper bound on the workspace file size cap.
pub const MAX_WORKSPACE_FILE_SIZE: u64 = 100 * 1024 * 1024;
/// Upper bound on workspace files per session.
pub const MAX_WORKSPACE_FILES: u32 = 10_000;
/// Upper bound on memory entries.
pub const MAX_MEMORY_ENTRIES: usize = 1_000_000;
/// Upper bound on the rate limit.
pub const MAX_REQUESTS_PER_MINUTE: u32 = 1000;
/// Upper bound on the rate limit burst.
pub const MAX_BURST_SIZE: u32 = 100;

/// A configuration rejected at load time.
#[derive(Debug, Clone)]
pub struct ConfigError {
    /// Dotted path of the offending field, e.g. `execution.retry.max_attempts`.
    pub field: String,
    /// What is wrong with it.
    pub message: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Invalid config at {}: {}", self.field, self.message)
    }
}

impl std::error::Error for ConfigError {}

/// Per-provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    /// Command name or relative path of the provider binary.
    pub command: String,
    /// Whether the router considers this provider.
    pub enabled: bool,
    /// Routing priority; smaller is preferred.
    pub priority: u32,
    /// Per-invocation timeout in milliseconds.
    pub timeout_ms: u64,
    /// Optional health-check loop settings.
    pub health_check: Option<HealthCheckSettings>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            command: String::new(),
            enabled: true,
            priority: 10,
            timeout_ms: 120_000,
            health_check: None,
        }
    }
}

/// Health-check loop settings for one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckSettings {
    /// Loop interval in milliseconds.
    pub interval_ms: u64,
    /// Per-probe timeout in milliseconds.
    pub timeout_ms: u64,
}

/// Retry policy shared by execution paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Total attempts, at most [`MAX_RETRY_ATTEMPTS`].
    pub max_attempts: u32,
    /// First backoff delay in milliseconds.
    pub initial_delay_ms: u64,
    /// Backoff ceiling in milliseconds; must be ≥ the initial delay.
    pub max_delay_ms: u64,
    /// Backoff multiplier within `[1.0, 10.0]`.
    pub backoff_factor: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_factor: 2.0,
        }
    }
}

/// Prompt behaviour inside staged execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptSettings {
    /// Per-decision budget in milliseconds.
    pub timeout_ms: u64,
    /// Auto-answer every decision with its default.
    pub auto_confirm: bool,
    /// Prompt locale.
    pub locale: Locale,
}

impl Default for PromptSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 60_000,
            auto_confirm: false,
            locale: Locale::En,
        }
    }
}

/// Supported prompt locales.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Locale {
    /// English.
    En,
    /// Chinese.
    Zh,
}

/// Progress display hints for staged execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressSettings {
    /// Update interval in milliseconds.
    pub update_interval_ms: u64,
    /// Emit synthetic progress while a provider is silent.
    pub synthetic_progress: bool,
}

impl Default for ProgressSettings {
    fn default() -> Self {
        Self {
            update_interval_ms: 1_000,
            synthetic_progress: false,
        }
    }
}

/// Stage-controller settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StagesSettings {
    /// Whether staged execution is enabled at all.
    pub enabled: bool,
    /// Default per-attempt timeout in milliseconds.
    pub default_timeout_ms: u64,
    /// Checkpoint root, relative to the project.
    pub checkpoint_path: PathBuf,
    /// Save a checkpoint after every stage of resumable runs.
    pub auto_save_checkpoint: bool,
    /// Remove checkpoints older than this many days.
    pub cleanup_after_days: u32,
    /// Stage retry defaults.
    pub retry: StageRetrySettings,
    /// Prompt behaviour.
    pub prompts: PromptSettings,
    /// Progress display hints.
    pub progress: ProgressSettings,
}

impl Default for StagesSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            default_timeout_ms: 300_000,
            checkpoint_path: PathBuf::from("checkpoints"),
            auto_save_checkpoint: true,
            cleanup_after_days: 30,
            retry: StageRetrySettings::default(),
            prompts: PromptSettings::default(),
            progress: ProgressSettings::default(),
        }
    }
}

/// Stage retry defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StageRetrySettings {
    /// Retries after the first attempt.
    pub default_max_retries: u32,
    /// Base backoff delay in milliseconds.
    pub default_retry_delay_ms: u64,
}

impl Default for StageRetrySettings {
    fn default() -> Self {
        Self {
            default_max_retries: 2,
            default_retry_delay_ms: 1_000,
        }
    }
}

/// Execution settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSettings {
    /// Default invocation timeout in milliseconds.
    pub default_timeout_ms: u64,
    /// Retry policy.
    pub retry: RetrySettings,
    /// Provider wait cap in milliseconds.
    pub provider_max_wait_ms: u64,
    /// Staged execution settings.
    pub stages: StagesSettings,
}

/// Session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Cap on concurrently active sessions.
    pub max_sessions: usize,
    /// Cap on serialized session metadata, in bytes.
    pub max_metadata_size: usize,
    /// Persistence debounce in milliseconds.
    pub save_debounce_ms: u64,
    /// Remove closed sessions after this many days.
    pub cleanup_after_days: u32,
    /// UUID collision retry budget.
    pub max_uuid_attempts: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_sessions: 100,
            max_metadata_size: 64 * 1024,
            save_debounce_ms: 500,
            cleanup_after_days: 30,
            max_uuid_attempts: 8,
        }
    }
}

/// Delegation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DelegationSettings {
    /// Depth cap, at most [`MAX_DELEGATION_DEPTH_LIMIT`].
    pub max_depth: usize,
    /// Per-delegation timeout in milliseconds.
    pub timeout_ms: u64,
}

impl Default for DelegationSettings {
    fn default() -> Self {
        Self {
            max_depth: 2,
            timeout_ms: 300_000,
        }
    }
}

/// Workspace settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceSettings {
    /// Workspace root, relative to the project.
    pub base_path: PathBuf,
    /// Per-file size cap in bytes, at most 100 MiB.
    pub max_file_size: u64,
    /// Per-session file cap.
    pub max_files: u32,
    /// Remove inactive session workspaces after this many days.
    pub cleanup_after_days: u32,
}

impl Default for WorkspaceSettings {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("workspaces"),
            max_file_size: 10 * 1024 * 1024,
            max_files: 1_000,
            cleanup_after_days: 30,
        }
    }
}

/// Orchestration settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestrationConfig {
    /// Session settings.
    pub session: SessionSettings,
    /// Delegation settings.
    pub delegation: DelegationSettings,
    /// Workspace settings.
    pub workspace: WorkspaceSettings,
}

/// Memory search settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySearchSettings {
    /// Default result cap.
    pub default_limit: usize,
    /// Hard result cap.
    pub max_limit: usize,
    /// Search timeout in milliseconds.
    pub timeout_ms: u64,
}

impl Default for MemorySearchSettings {
    fn default() -> Self {
        Self {
            default_limit: 10,
            max_limit: 100,
            timeout_ms: 10_000,
        }
    }
}

/// Memory store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySettings {
    /// Entry cap, at most [`MAX_MEMORY_ENTRIES`].
    pub max_entries: usize,
    /// Remove entries older than this many days when auto-cleanup runs.
    pub cleanup_days: u32,
    /// Backing file, relative to the project.
    pub persist_path: Option<PathBuf>,
    /// Run cleanup automatically.
    pub auto_cleanup: bool,
    /// Search settings.
    pub search: MemorySearchSettings,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            max_entries: 100_000,
            cleanup_days: 90,
            persist_path: None,
            auto_cleanup: false,
            search: MemorySearchSettings::default(),
        }
    }
}

/// Tuning for one of the engine caches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Entry cap.
    pub max_entries: usize,
    /// Entry TTL in milliseconds.
    pub ttl_ms: u64,
    /// Sweep interval in milliseconds.
    pub cleanup_interval_ms: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_entries: 500,
            ttl_ms: 300_000,
            cleanup_interval_ms: 60_000,
        }
    }
}

/// Rate limiting settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// Whether rate limiting is enforced.
    pub enabled: bool,
    /// Requests per minute, at most [`MAX_REQUESTS_PER_MINUTE`].
    pub requests_per_minute: u32,
    /// Burst size, at most [`MAX_BURST_SIZE`].
    pub burst_size: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            requests_per_minute: 60,
            burst_size: 10,
        }
    }
}

/// Performance settings: cache tuning and rate limiting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceSettings {
    /// Agent profile cache.
    pub profile_cache: CacheSettings,
    /// Team/cohort cache.
    pub team_cache: CacheSettings,
    /// Provider response cache.
    pub provider_cache: CacheSettings,
    /// Optional rate limiting.
    pub rate_limit: Option<RateLimitSettings>,
}

/// Log retention settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRetentionSettings {
    /// Rotate after this many bytes.
    pub max_size_bytes: u64,
    /// Drop logs older than this many days.
    pub max_age_days: u32,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level filter, e.g. `"info"`.
    pub level: String,
    /// Log file path, relative to the project.
    pub path: Option<PathBuf>,
    /// Also log to the console.
    pub console: bool,
    /// Optional retention policy.
    pub retention: Option<LogRetentionSettings>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            path: None,
            console: true,
            retention: None,
        }
    }
}

/// The full configuration surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentmuxConfig {
    /// Provider settings keyed by provider name.
    pub providers: HashMap<String, ProviderSettings>,
    /// Execution settings.
    pub execution: ExecutionSettings,
    /// Orchestration settings.
    pub orchestration: OrchestrationConfig,
    /// Memory settings.
    pub memory: MemorySettings,
    /// Performance settings.
    pub performance: PerformanceSettings,
    /// Logging settings.
    pub logging: LoggingSettings,
}

impl AgentmuxConfig {
    /// Enforce every bound and path rule; returns the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let retry = &self.execution.retry;
        if retry.max_attempts > MAX_RETRY_ATTEMPTS {
            return Err(bound("execution.retry.max_attempts", MAX_RETRY_ATTEMPTS));
        }
        if retry.max_delay_ms < retry.initial_delay_ms {
            return Err(ConfigError {
                field: "execution.retry.max_delay_ms".to_string(),
                message: "must be >= initial_delay_ms".to_string(),
            });
        }
        if !(MIN_BACKOFF_FACTOR..=MAX_BACKOFF_FACTOR).contains(&retry.backoff_factor) {
            return Err(ConfigError {
                field: "execution.retry.backoff_factor".to_string(),
                message: format!(
                    "must be within [{}, {}]",
                    MIN_BACKOFF_FACTOR, MAX_BACKOFF_FACTOR
                ),
            });
        }

        let stages = &self.execution.stages;
        if stages.cleanup_after_days > MAX_CLEANUP_DAYS {
            return Err(bound("execution.stages.cleanup_after_days", MAX_CLEANUP_DAYS));
        }
        validate_relative_path("execution.stages.checkpoint_path", &stages.checkpoint_path)?;

        let delegation = &self.orchestration.delegation;
        if delegation.max_depth > MAX_DELEGATION_DEPTH_LIMIT {
            return Err(bound(
                "orchestration.delegation.max_depth",
                MAX_DELEGATION_DEPTH_LIMIT as u32,
            ));
        }

        let workspace = &self.orchestration.workspace;
        if workspace.max_file_size > MAX_WORKSPACE_FILE_SIZE {
            return Err(ConfigError {
                field: "orchestration.workspace.max_file_size".to_string(),
                message: format!("must be <= {} bytes", MAX_WORKSPACE_FILE_SIZE),
            });
        }
        if workspace.max_files > MAX_WORKSPACE_FILES {
            return Err(bound("orchestration.workspace.max_files", MAX_WORKSPACE_FILES));
        }
        if workspace.cleanup_after_days > MAX_CLEANUP_DAYS {
            return Err(bound(
                "orchestration.workspace.cleanup_after_days",
                MAX_CLEANUP_DAYS,
            ));
        }
        validate_relative_path("orchestration.workspace.base_path", &workspace.base_path)?;

        if self.orchestration.session.cleanup_after_days > MAX_CLEANUP_DAYS {
            return Err(bound(
                "orchestration.session.cleanup_after_days",
                MAX_CLEANUP_DAYS,
            ));
        }

        if self.memory.max_entries > MAX_MEMORY_ENTRIES {
            return Err(ConfigError {
                field: "memory.max_entries".to_string(),
                message: format!("must be <= {}", MAX_MEMORY_ENTRIES),
            });
        }
        if let Some(path) = &self.memory.persist_path {
            validate_relative_path("memory.persist_path", path)?;
        }

        if let Some(rate_limit) = &self.performance.rate_limit {
            if rate_limit.requests_per_minute > MAX_REQUESTS_PER_MINUTE {
                return Err(bound(
                    "performance.rate_limit.requests_per_minute",
                    MAX_REQUESTS_PER_MINUTE,
                ));
            }
            if rate_limit.burst_size > MAX_BURST_SIZE {
                return Err(bound("performance.rate_limit.burst_size", MAX_BURST_SIZE));
            }
        }

        if let Some(path) = &self.logging.path {
            validate_relative_path("logging.path", path)?;
        }
        for (name, provider) in &self.providers {
            if provider.command.contains("..") {
                return Err(ConfigError {
                    field: format!("providers.{}.command", name),
                    message: "must not contain '..'".to_string(),
                });
            }
        }

        Ok(())
    }
}

fn bound(field: &str, max: u32) -> ConfigError {
    ConfigError {
        field: field.to_string(),
        message: format!("must be <= {}", max),
    }
}

/// Path fields must stay relative within the project: no absolute paths, no
/// `..` components.
fn validate_relative_path(field: &str, path: &Path) -> Result<(), ConfigError> {
    if path.is_absolute() {
        return Err(ConfigError {
            field: field.to_string(),
            message: "must be a relative path".to_string(),
        });
    }
    for component in path.components() {
        if matches!(component, Component::ParentDir) {
            return Err(ConfigError {
                field: field.to_string(),
                message: "must not contain '..'".to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(AgentmuxConfig::default().validate().is_ok());
    }

    #[test]
    fn retry_bounds_are_enforced() {
        let mut config = AgentmuxConfig::default();
        config.execution.retry.max_attempts = 11;
        assert!(config.validate().is_err());

        let mut config = AgentmuxConfig::default();
        config.execution.retry.max_delay_ms = 10;
        config.execution.retry.initial_delay_ms = 100;
        assert!(config.validate().is_err());

        let mut config = AgentmuxConfig::default();
        config.execution.retry.backoff_factor = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn absolute_and_parent_paths_are_rejected() {
        let mut config = AgentmuxConfig::default();
        config.orchestration.workspace.base_path = PathBuf::from("/absolute");
        assert!(config.validate().is_err());

        let mut config = AgentmuxConfig::default();
        config.execution.stages.checkpoint_path = PathBuf::from("a/../../b");
        assert!(config.validate().is_err());
    }

    #[test]
    fn delegation_depth_cap() {
        let mut config = AgentmuxConfig::default();
        config.orchestration.delegation.max_depth = 6;
        assert!(config.validate().is_err());
    }
}
