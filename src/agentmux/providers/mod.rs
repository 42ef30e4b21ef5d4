//! Concrete CLI provider adapters.
//!
//! All supported providers are external command-line binaries that read a
//! prompt and print a completion. They differ only in command name and
//! argument shaping, so there is a single [`SubprocessProvider`] struct
//! parameterised by a [`ProviderKind`] strategy value rather than one type
//! per vendor.
//!
//! ```text
//! Router
//!   ├─ SubprocessProvider(ClaudeCli)   — `claude -p`, prompt on stdin
//!   ├─ SubprocessProvider(GeminiCli)   — `gemini`, prompt on stdin
//!   └─ SubprocessProvider(CodexCli)    — `codex exec <prompt>`, single arg
//! ```
//!
//! Binary discovery and version probing live in [`detect`]; the raw
//! subprocess plumbing (timeout, cancellation, SIGTERM→SIGKILL) lives in
//! [`exec`].

pub mod detect;
pub mod exec;

use crate::agentmux::provider::{
    estimate_tokens, AvailabilityCacheMetrics, CliProvider, ExecutionRequest, ExecutionResponse,
    ProviderCacheMetrics, ProviderError, ProviderHealth, TokenUsage, VersionCacheMetrics,
};
use async_trait::async_trait;
use detect::{detect, DetectorConfig};
use exec::{run_cli, CliInvocation};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Default freshness window for a positive availability probe.
const AVAILABILITY_TTL: Duration = Duration::from_secs(60);
/// Shorter window used while the binary's version is still unknown.
const AVAILABILITY_TTL_UNVERSIONED: Duration = Duration::from_secs(15);

/// Which external CLI a [`SubprocessProvider`] drives.
///
/// Variants differ only in command name and argument shaping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// Anthropic's `claude` CLI; prompt on stdin via `-p`.
    ClaudeCli,
    /// Google's `gemini` CLI; prompt on stdin.
    GeminiCli,
    /// OpenAI's `codex` CLI; prompt as a single `exec` argument.
    CodexCli,
}

impl ProviderKind {
    /// Default command name for this kind.
    pub fn command_name(&self) -> &'static str {
        match self {
            ProviderKind::ClaudeCli => "claude",
            ProviderKind::GeminiCli => "gemini",
            ProviderKind::CodexCli => "codex",
        }
    }

    /// Whether the prompt is delivered on standard input (as opposed to a
    /// single positional argument).
    pub fn prompt_via_stdin(&self) -> bool {
        !matches!(self, ProviderKind::CodexCli)
    }

    /// Shape the argument vector for one request.
    pub fn shape_args(&self, request: &ExecutionRequest) -> Vec<String> {
        let mut args = Vec::new();
        match self {
            ProviderKind::ClaudeCli => {
                args.push("-p".to_string());
                if let Some(model) = &request.model {
                    args.push("--model".to_string());
                    args.push(model.clone());
                }
                if let Some(system_prompt) = &request.system_prompt {
                    args.push("--append-system-prompt".to_string());
                    args.push(system_prompt.clone());
                }
            }
            ProviderKind::GeminiCli => {
                if let Some(model) = &request.model {
                    args.push("-m".to_string());
                    args.push(model.clone());
                }
            }
            ProviderKind::CodexCli => {
                args.push("exec".to_string());
                if let Some(model) = &request.model {
                    args.push("--model".to_string());
                    args.push(model.clone());
                }
                args.push(compose_single_arg_prompt(request));
            }
        }
        args
    }
}

/// Compose the positional prompt for single-argument providers, folding the
/// system prompt in because those binaries have no separate flag for it.
fn compose_single_arg_prompt(request: &ExecutionRequest) -> String {
    match &request.system_prompt {
        Some(system_prompt) => format!("{}\n\n{}", system_prompt, request.prompt),
        None => request.prompt.clone(),
    }
}

struct AvailabilityEntry {
    available: bool,
    checked_at: Instant,
}

#[derive(Default)]
struct HealthCounters {
    total_checks: u64,
    successful_checks: u64,
    consecutive_failures: u64,
    consecutive_successes: u64,
}

#[derive(Default)]
struct AvailabilityCounters {
    hits: u64,
    misses: u64,
    age_sum_ms: u128,
}

/// Adapter driving one external CLI provider as a child process.
///
/// Implements the full [`CliProvider`] capability set: execution with
/// timeout/cancellation, TTL-cached availability, health counters, and cache
/// metrics.
///
/// # Example
///
/// ```rust,no_run
/// use agentmux::providers::{ProviderKind, SubprocessProvider};
/// use agentmux::provider::{CliProvider, ExecutionRequest};
///
/// # async {
/// let provider = SubprocessProvider::new(ProviderKind::ClaudeCli)
///     .with_name("claude");
///
/// if provider.is_available().await {
///     let response = provider.execute(&ExecutionRequest::new("Hello")).await?;
///     println!("{}", response.content);
/// }
/// # Ok::<(), agentmux::provider::ProviderError>(())
/// # };
/// ```
pub struct SubprocessProvider {
    kind: ProviderKind,
    name: String,
    command_override: Option<String>,
    detector_config: DetectorConfig,
    availability: Mutex<Option<AvailabilityEntry>>,
    availability_counters: Mutex<AvailabilityCounters>,
    health: Mutex<HealthCounters>,
    version: Mutex<Option<String>>,
}

impl SubprocessProvider {
    /// Create a provider of the given kind with the kind's default name.
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            name: kind.command_name().to_string(),
            command_override: None,
            detector_config: DetectorConfig::default(),
            availability: Mutex::new(None),
            availability_counters: Mutex::new(AvailabilityCounters::default()),
            health: Mutex::new(HealthCounters::default()),
            version: Mutex::new(None),
        }
    }

    /// Override the router-facing provider name (builder pattern).
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Override the command name or absolute path (builder pattern).
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command_override = Some(command.into());
        self
    }

    /// Supply detector inputs: configured paths and minimum versions
    /// (builder pattern).
    pub fn with_detector_config(mut self, config: DetectorConfig) -> Self {
        self.detector_config = config;
        self
    }

    /// The binary this provider searches for.
    fn lookup_name(&self) -> &str {
        self.command_override
            .as_deref()
            .unwrap_or_else(|| self.kind.command_name())
    }

    fn availability_ttl(&self) -> Duration {
        if self.version.lock().unwrap().is_some() {
            AVAILABILITY_TTL
        } else {
            AVAILABILITY_TTL_UNVERSIONED
        }
    }

    fn record_check(&self, success: bool) {
        let mut health = self.health.lock().unwrap();
        health.total_checks += 1;
        if success {
            health.successful_checks += 1;
            health.consecutive_successes += 1;
            health.consecutive_failures = 0;
        } else {
            health.consecutive_failures += 1;
            health.consecutive_successes = 0;
        }
    }
}

#[async_trait]
impl CliProvider for SubprocessProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResponse, ProviderError> {
        let lookup = self.lookup_name().to_string();
        let detected = detect(&lookup, &self.detector_config)
            .await
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;
        *self.version.lock().unwrap() = detected.version.clone();

        let args = self.kind.shape_args(request);
        // stdin providers take the system prompt via a flag; the payload is
        // only the user prompt.
        let stdin_payload = if self.kind.prompt_via_stdin() {
            Some(request.prompt.clone())
        } else {
            None
        };

        let output = run_cli(CliInvocation {
            command: detected.path.display().to_string(),
            args,
            stdin_payload,
            timeout: request.timeout,
            cancellation: request.cancellation.clone(),
        })
        .await
        .map_err(|e| {
            self.record_check(false);
            e
        })?;

        if output.exit_code != 0 {
            self.record_check(false);
            log::warn!(
                "provider {} exited with code {}",
                self.name,
                output.exit_code
            );
            return Err(ProviderError::NonZeroExit {
                code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        self.record_check(true);

        let content = output.stdout.trim_end().to_string();
        let tokens_used = parse_token_usage(&output.stdout, &output.stderr).unwrap_or_else(|| {
            TokenUsage::new(estimate_tokens(&request.prompt), estimate_tokens(&content))
        });

        Ok(ExecutionResponse {
            content,
            model: request
                .model
                .clone()
                .unwrap_or_else(|| self.name.clone()),
            tokens_used,
            latency_ms: output.duration.as_millis() as u64,
            finish_reason: "stop".to_string(),
            cached: false,
        })
    }

    async fn is_available(&self) -> bool {
        let ttl = self.availability_ttl();
        {
            let cached = self.availability.lock().unwrap();
            if let Some(entry) = cached.as_ref() {
                if entry.checked_at.elapsed() < ttl {
                    let mut counters = self.availability_counters.lock().unwrap();
                    counters.hits += 1;
                    counters.age_sum_ms += entry.checked_at.elapsed().as_millis();
                    return entry.available;
                }
            }
        }

        self.availability_counters.lock().unwrap().misses += 1;
        let lookup = self.lookup_name().to_string();
        let result = detect(&lookup, &self.detector_config).await;
        let available = result.is_ok();
        if let Ok(detected) = &result {
            *self.version.lock().unwrap() = detected.version.clone();
        }
        self.record_check(available);

        *self.availability.lock().unwrap() = Some(AvailabilityEntry {
            available,
            checked_at: Instant::now(),
        });
        available
    }

    fn health(&self) -> ProviderHealth {
        let health = self.health.lock().unwrap();
        ProviderHealth {
            consecutive_failures: health.consecutive_failures,
            consecutive_successes: health.consecutive_successes,
            uptime_pct: if health.total_checks == 0 {
                0.0
            } else {
                100.0 * health.successful_checks as f64 / health.total_checks as f64
            },
        }
    }

    fn cache_metrics(&self) -> ProviderCacheMetrics {
        let counters = self.availability_counters.lock().unwrap();
        let lookups = counters.hits + counters.misses;
        ProviderCacheMetrics {
            availability: AvailabilityCacheMetrics {
                hits: counters.hits,
                misses: counters.misses,
                hit_rate: if lookups == 0 {
                    0.0
                } else {
                    counters.hits as f64 / lookups as f64
                },
                avg_age_ms: if counters.hits == 0 {
                    0.0
                } else {
                    counters.age_sum_ms as f64 / counters.hits as f64
                },
            },
            version: VersionCacheMetrics {
                version: self.version.lock().unwrap().clone(),
                hits: counters.hits,
                misses: counters.misses,
            },
            health: self.health(),
        }
    }

    fn clear_caches(&self) {
        *self.availability.lock().unwrap() = None;
        *self.version.lock().unwrap() = None;
        detect::clear_cache();
    }
}

/// Scan provider output for a JSON object reporting token usage.
///
/// CLIs that report usage print a line such as
/// `{"prompt_tokens": 12, "completion_tokens": 34}` on stdout or stderr.
/// Returns `None` when no such line exists, in which case the caller falls
/// back to a whitespace estimate.
fn parse_token_usage(stdout: &str, stderr: &str) -> Option<TokenUsage> {
    for line in stdout.lines().chain(stderr.lines()) {
        let line = line.trim();
        if !line.starts_with('{') {
            continue;
        }
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(line) {
            let prompt = value.get("prompt_tokens").and_then(|v| v.as_u64());
            let completion = value.get("completion_tokens").and_then(|v| v.as_u64());
            if let (Some(prompt), Some(completion)) = (prompt, completion) {
                return Some(TokenUsage::new(prompt as usize, completion as usize));
            }
        }
    }
    None
}
