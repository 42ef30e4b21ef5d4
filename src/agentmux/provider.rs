//! Shared primitives for provider-agnostic CLI providers.
//!
//! The engine talks to external LLM command-line binaries through the
//! [`CliProvider`] trait and the lightweight data types defined here. The
//! trait abstracts over the concrete provider binaries while
//! [`ExecutionRequest`]/[`ExecutionResponse`] describe one completion
//! round-trip in a uniform shape.
//!
//! Concrete adapters live in [`providers`](crate::providers); the
//! [`Router`](crate::router::Router) consumes any number of [`CliProvider`]
//! implementations and orders them by priority.
//!
//! # Basic request/response
//!
//! ```rust,no_run
//! use agentmux::provider::{CliProvider, ExecutionRequest};
//! use agentmux::providers::{ProviderKind, SubprocessProvider};
//!
//! # async {
//! let provider = SubprocessProvider::new(ProviderKind::ClaudeCli);
//! let request = ExecutionRequest::new("Summarise this diff.")
//!     .with_system_prompt("You are a code reviewer.");
//!
//! let response = provider.execute(&request).await?;
//! println!("{} ({} tokens)", response.content, response.tokens_used.total_tokens);
//! # Ok::<(), agentmux::provider::ProviderError>(())
//! # };
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How many tokens were spent on prompt vs. completion?
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Number of prompt/input tokens reported or estimated.
    pub prompt_tokens: usize,
    /// Number of completion/output tokens reported or estimated.
    pub completion_tokens: usize,
    /// Convenience total equal to `prompt_tokens + completion_tokens`.
    pub total_tokens: usize,
}

impl TokenUsage {
    /// Usage with both sides set and the total derived.
    pub fn new(prompt_tokens: usize, completion_tokens: usize) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    /// All-zero usage, used for cache hits.
    pub fn zero() -> Self {
        Self::default()
    }
}

/// One completion request handed to a provider.
///
/// The cancellation token threads through every suspension point below the
/// request: subprocess waits, retry sleeps, and availability probes all
/// observe it.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// The user prompt delivered on the provider's standard input.
    pub prompt: String,
    /// Optional system prompt prepended by the provider's argument shaping.
    pub system_prompt: Option<String>,
    /// Model identifier forwarded to the CLI, when set.
    pub model: Option<String>,
    /// Sampling temperature forwarded to the CLI, when set.
    pub temperature: Option<f32>,
    /// Completion token cap forwarded to the CLI, when set.
    pub max_tokens: Option<usize>,
    /// Per-invocation wall-clock timeout.
    pub timeout: Option<Duration>,
    /// Cooperative cancellation handle.
    pub cancellation: CancellationToken,
}

impl ExecutionRequest {
    /// Create a request carrying only the prompt.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system_prompt: None,
            model: None,
            temperature: None,
            max_tokens: None,
            timeout: None,
            cancellation: CancellationToken::new(),
        }
    }

    /// Attach a system prompt (builder pattern).
    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    /// Select a model (builder pattern).
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set the sampling temperature (builder pattern).
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Cap the completion length (builder pattern).
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Bound the invocation wall-clock time (builder pattern).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Thread an existing cancellation token through this request
    /// (builder pattern).
    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }
}

/// One completion produced by a provider (or replayed from the response cache).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResponse {
    /// The completion text captured from the provider's standard output.
    pub content: String,
    /// Model that produced the completion.
    pub model: String,
    /// Reported or estimated token accounting.
    pub tokens_used: TokenUsage,
    /// Wall-clock latency of the invocation in milliseconds. `0` for cache hits.
    pub latency_ms: u64,
    /// `"stop"` when the CLI exited 0, `"error"` otherwise.
    pub finish_reason: String,
    /// Whether this response was served from the response cache.
    pub cached: bool,
}

/// Errors surfaced by provider execution and discovery.
#[derive(Debug, Clone)]
pub enum ProviderError {
    /// The provider binary could not be spawned.
    SpawnFailed {
        /// Command that failed to start.
        command: String,
        /// Underlying OS error text.
        message: String,
    },
    /// The CLI exited with a non-zero status.
    NonZeroExit {
        /// Exit code, `-1` when terminated by signal.
        code: i32,
        /// Captured standard error, trimmed.
        stderr: String,
    },
    /// The invocation exceeded its wall-clock budget.
    Timeout {
        /// The budget that was exceeded, in milliseconds.
        timeout_ms: u64,
    },
    /// The caller's cancellation token fired.
    Cancelled,
    /// The provider binary is not available on this host.
    Unavailable(String),
    /// An I/O failure while feeding stdin or draining stdout/stderr.
    Io(String),
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderError::SpawnFailed { command, message } => {
                write!(f, "Failed to spawn '{}': {}", command, message)
            }
            ProviderError::NonZeroExit { code, stderr } => {
                write!(f, "Provider exited with code {}: {}", code, stderr)
            }
            ProviderError::Timeout { timeout_ms } => {
                write!(f, "Provider timed out after {}ms", timeout_ms)
            }
            ProviderError::Cancelled => write!(f, "Provider invocation cancelled"),
            ProviderError::Unavailable(name) => write!(f, "Provider unavailable: {}", name),
            ProviderError::Io(message) => write!(f, "Provider I/O error: {}", message),
        }
    }
}

impl std::error::Error for ProviderError {}

impl ProviderError {
    /// Whether this error is a timeout. The delegation boundary maps timeouts
    /// to a distinct result status.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProviderError::Timeout { .. })
    }
}

/// Rolling health counters maintained by a provider across invocations and
/// availability probes.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProviderHealth {
    /// Failures since the last success.
    pub consecutive_failures: u64,
    /// Successes since the last failure.
    pub consecutive_successes: u64,
    /// Fraction of all checks that succeeded, `0.0..=100.0`.
    pub uptime_pct: f64,
}

/// Hit/miss accounting for the availability cache.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AvailabilityCacheMetrics {
    /// Probes answered from the cache.
    pub hits: u64,
    /// Probes that had to run the detector.
    pub misses: u64,
    /// `hits / (hits + misses)`, `0.0` when no probes happened.
    pub hit_rate: f64,
    /// Average age of served cache entries in milliseconds.
    pub avg_age_ms: f64,
}

/// Version probe accounting.
#[derive(Debug, Clone, Default, Serialize)]
pub struct VersionCacheMetrics {
    /// Detected version string, when the probe succeeded.
    pub version: Option<String>,
    /// Probes answered from the process-wide detection cache.
    pub hits: u64,
    /// Probes that ran `--version`.
    pub misses: u64,
}

/// Aggregate cache metrics reported by [`CliProvider::cache_metrics`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProviderCacheMetrics {
    /// Availability cache counters.
    pub availability: AvailabilityCacheMetrics,
    /// Version probe counters.
    pub version: VersionCacheMetrics,
    /// Rolling health counters.
    pub health: ProviderHealth,
}

/// Capability set implemented by every CLI provider adapter.
///
/// Concrete providers differ only in command invocation; the engine treats
/// them uniformly. All implementations must be thread-safe (`Send + Sync`)
/// so the router can probe and execute them concurrently.
#[async_trait]
pub trait CliProvider: Send + Sync {
    /// Stable provider name used by the router, penalty map, and cache keys.
    fn name(&self) -> &str;

    /// Run one completion round-trip against the provider binary.
    ///
    /// Implementations spawn the CLI with the prompt on standard input,
    /// capture standard output as the completion, honour
    /// [`ExecutionRequest::timeout`] and the cancellation token (SIGTERM then
    /// SIGKILL after a grace period), and report `finish_reason == "stop"`
    /// only for a zero exit status.
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResponse, ProviderError>;

    /// Whether the provider binary resolves on this host and a cached
    /// positive probe is still fresh.
    async fn is_available(&self) -> bool;

    /// Rolling health counters.
    fn health(&self) -> ProviderHealth;

    /// Availability/version/health cache metrics.
    fn cache_metrics(&self) -> ProviderCacheMetrics;

    /// Drop all per-provider caches (availability and version probes).
    fn clear_caches(&self);
}

/// Estimate a token count from whitespace-separated length, used when the
/// provider CLI reports no usage.
pub fn estimate_tokens(text: &str) -> usize {
    text.split_whitespace().count()
}
