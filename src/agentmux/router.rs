//! Provider routing with priorities, penalties, caching, and health checks.
//!
//! The [`Router`] owns an ordered set of [`CliProvider`]s and routes every
//! [`ExecutionRequest`] to the best currently-usable one:
//!
//! 1. Candidates are the configured providers sorted ascending by priority,
//!    minus those still serving a failure penalty, filtered by a concurrent
//!    availability sweep.
//! 2. Each candidate is tried in order. A response-cache hit short-circuits
//!    the invocation; a success caches the response and clears the
//!    provider's penalty; a failure penalizes the provider for the cooldown
//!    window and falls through to the next candidate (when fallback is
//!    enabled).
//!
//! A background health loop periodically refreshes every provider's
//! availability cache so the hot path rarely pays for a probe.
//!
//! # Example
//!
//! ```rust,no_run
//! use agentmux::router::{Router, RouterConfig, RoutedProvider};
//! use agentmux::provider::ExecutionRequest;
//! use agentmux::providers::{ProviderKind, SubprocessProvider};
//! use std::sync::Arc;
//!
//! # async {
//! let router = Router::new(RouterConfig {
//!     providers: vec![
//!         RoutedProvider::new(Arc::new(SubprocessProvider::new(ProviderKind::ClaudeCli)), 1),
//!         RoutedProvider::new(Arc::new(SubprocessProvider::new(ProviderKind::GeminiCli)), 2),
//!     ],
//!     ..RouterConfig::default()
//! });
//!
//! let response = router.execute(&ExecutionRequest::new("Hello")).await?;
//! println!("{} (cached: {})", response.content, response.cached);
//! router.destroy();
//! # Ok::<(), agentmux::router::RouterError>(())
//! # };
//! ```

use crate::agentmux::cache::{Cache, CacheConfig};
use crate::agentmux::provider::{CliProvider, ExecutionRequest, ExecutionResponse, TokenUsage};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Default penalty window after a provider failure.
pub const DEFAULT_PROVIDER_COOLDOWN_MS: u64 = 30_000;

/// One provider plus its routing priority (smaller = preferred).
#[derive(Clone)]
pub struct RoutedProvider {
    /// The adapter.
    pub provider: Arc<dyn CliProvider>,
    /// Routing priority; candidates are sorted ascending.
    pub priority: u32,
}

impl RoutedProvider {
    /// Pair a provider with a priority.
    pub fn new(provider: Arc<dyn CliProvider>, priority: u32) -> Self {
        Self { provider, priority }
    }
}

/// Router construction options.
pub struct RouterConfig {
    /// Providers with their priorities. Sorted at construction.
    pub providers: Vec<RoutedProvider>,
    /// Whether a provider failure falls through to the next candidate.
    pub fallback_enabled: bool,
    /// Interval of the background health loop. `None` disables it.
    pub health_check_interval_ms: Option<u64>,
    /// Penalty window applied to a failing provider.
    pub provider_cooldown_ms: u64,
    /// Response cache configuration. `None` disables response caching.
    pub response_cache: Option<CacheConfig>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            fallback_enabled: true,
            health_check_interval_ms: None,
            provider_cooldown_ms: DEFAULT_PROVIDER_COOLDOWN_MS,
            response_cache: None,
        }
    }
}

/// Errors surfaced by [`Router::execute`].
#[derive(Debug, Clone)]
pub enum RouterError {
    /// Every configured provider is penalized or unavailable.
    NoAvailableProviders,
    /// Every candidate was tried and failed; carries the last failure.
    AllProvidersFailed {
        /// Text of the last provider error.
        last_error: String,
        /// Whether the last failure was a timeout.
        timeout: bool,
    },
    /// A single-candidate failure with fallback disabled.
    ProviderFailed {
        /// Text of the provider error.
        message: String,
        /// Whether the failure was a timeout.
        timeout: bool,
    },
    /// The request's cancellation token fired while routing.
    Cancelled,
}

impl std::fmt::Display for RouterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouterError::NoAvailableProviders => write!(f, "No available providers"),
            RouterError::AllProvidersFailed { last_error, .. } => {
                write!(f, "All providers failed; last error: {}", last_error)
            }
            RouterError::ProviderFailed { message, .. } => {
                write!(f, "Provider failed: {}", message)
            }
            RouterError::Cancelled => write!(f, "Routing cancelled"),
        }
    }
}

impl std::error::Error for RouterError {}

impl RouterError {
    /// Whether the underlying failure was a provider timeout.
    ///
    /// Used at the delegation boundary, where timeouts map to a distinct
    /// result status.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            RouterError::AllProvidersFailed { timeout: true, .. }
                | RouterError::ProviderFailed { timeout: true, .. }
        )
    }
}

/// Counters maintained by the background health loop.
#[derive(Debug, Clone, Default)]
pub struct HealthLoopMetrics {
    /// Wall-clock time of the most recent sweep.
    pub last_check_time: Option<DateTime<Utc>>,
    /// Sweeps performed since construction.
    pub checks_performed: u64,
    /// Total time spent inside sweeps.
    pub total_duration: Duration,
    /// Providers that reported unavailable across all sweeps.
    pub failures: u64,
}

/// Routes execution requests across prioritized CLI providers.
pub struct Router {
    providers: Vec<RoutedProvider>,
    fallback_enabled: bool,
    cooldown: Duration,
    penalized: Arc<Mutex<HashMap<String, Instant>>>,
    response_cache: Option<Cache<String, ExecutionResponse>>,
    health_metrics: Arc<Mutex<HealthLoopMetrics>>,
    health_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl Router {
    /// Build a router. Providers are sorted ascending by priority; when an
    /// interval is configured the health loop fires immediately to warm the
    /// availability caches, then on every tick.
    pub fn new(config: RouterConfig) -> Self {
        let mut providers = config.providers;
        providers.sort_by_key(|p| p.priority);

        let penalized = Arc::new(Mutex::new(HashMap::new()));
        let health_metrics = Arc::new(Mutex::new(HealthLoopMetrics::default()));
        let shutdown = CancellationToken::new();

        let health_task = config.health_check_interval_ms.and_then(|interval_ms| {
            let handle = tokio::runtime::Handle::try_current().ok()?;
            let loop_providers: Vec<Arc<dyn CliProvider>> =
                providers.iter().map(|p| p.provider.clone()).collect();
            let loop_metrics = health_metrics.clone();
            let loop_shutdown = shutdown.clone();
            Some(handle.spawn(async move {
                let interval = Duration::from_millis(interval_ms);
                loop {
                    let started = Instant::now();
                    let checks = join_all(
                        loop_providers.iter().map(|p| p.is_available()),
                    )
                    .await;
                    {
                        let mut metrics = loop_metrics.lock().unwrap();
                        metrics.last_check_time = Some(Utc::now());
                        metrics.checks_performed += 1;
                        metrics.total_duration += started.elapsed();
                        metrics.failures += checks.iter().filter(|ok| !**ok).count() as u64;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {}
                        _ = loop_shutdown.cancelled() => break,
                    }
                }
            }))
        });

        Self {
            providers,
            fallback_enabled: config.fallback_enabled,
            cooldown: Duration::from_millis(config.provider_cooldown_ms),
            penalized,
            response_cache: config.response_cache.map(Cache::new),
            health_metrics,
            health_task: Mutex::new(health_task),
            shutdown,
        }
    }

    /// Route a request to the best usable provider.
    ///
    /// See the module docs for the candidate-selection and fallback
    /// algorithm. A cache hit returns `cached: true`, zero latency, and zero
    /// token usage; the content is byte-identical to the stored response.
    pub async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResponse, RouterError> {
        let candidates = self.candidates(request).await?;

        let mut last_error: Option<(String, bool)> = None;
        for routed in candidates {
            if request.cancellation.is_cancelled() {
                return Err(RouterError::Cancelled);
            }
            let name = routed.provider.name().to_string();

            let cache_key = self
                .response_cache
                .as_ref()
                .map(|_| response_cache_key(&name, request));
            if let (Some(cache), Some(key)) = (&self.response_cache, &cache_key) {
                if let Some(mut cached) = cache.get(key) {
                    cached.cached = true;
                    cached.latency_ms = 0;
                    cached.tokens_used = TokenUsage::zero();
                    log::debug!("router cache hit for provider {}", name);
                    return Ok(cached);
                }
            }

            match routed.provider.execute(request).await {
                Ok(response) => {
                    if let (Some(cache), Some(key)) = (&self.response_cache, cache_key) {
                        cache.set(key, response.clone());
                    }
                    self.penalized.lock().unwrap().remove(&name);
                    return Ok(response);
                }
                Err(error) => {
                    log::warn!("provider {} failed: {}", name, error);
                    self.penalized
                        .lock()
                        .unwrap()
                        .insert(name.clone(), Instant::now() + self.cooldown);
                    let timeout = error.is_timeout();
                    last_error = Some((error.to_string(), timeout));
                    if !self.fallback_enabled {
                        return Err(RouterError::ProviderFailed {
                            message: error.to_string(),
                            timeout,
                        });
                    }
                }
            }
        }

        let (last_error, timeout) =
            last_error.unwrap_or_else(|| ("no candidates were tried".to_string(), false));
        Err(RouterError::AllProvidersFailed { last_error, timeout })
    }

    /// Build the candidate list: priority order, minus penalized providers,
    /// filtered by a concurrent availability sweep.
    async fn candidates(
        &self,
        request: &ExecutionRequest,
    ) -> Result<Vec<RoutedProvider>, RouterError> {
        if request.cancellation.is_cancelled() {
            return Err(RouterError::Cancelled);
        }

        let now = Instant::now();
        let unpenalized: Vec<RoutedProvider> = {
            let penalized = self.penalized.lock().unwrap();
            self.providers
                .iter()
                .filter(|p| {
                    penalized
                        .get(p.provider.name())
                        .map(|expiry| *expiry <= now)
                        .unwrap_or(true)
                })
                .cloned()
                .collect()
        };

        let availability = join_all(
            unpenalized
                .iter()
                .map(|p| p.provider.is_available()),
        )
        .await;

        let candidates: Vec<RoutedProvider> = unpenalized
            .into_iter()
            .zip(availability)
            .filter(|(_, available)| *available)
            .map(|(p, _)| p)
            .collect();

        if candidates.is_empty() {
            return Err(RouterError::NoAvailableProviders);
        }
        Ok(candidates)
    }

    /// Providers currently serving a penalty, with the remaining window.
    pub fn penalized(&self) -> HashMap<String, Duration> {
        let now = Instant::now();
        self.penalized
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, expiry)| **expiry > now)
            .map(|(name, expiry)| (name.clone(), *expiry - now))
            .collect()
    }

    /// Health loop counters.
    pub fn health_metrics(&self) -> HealthLoopMetrics {
        self.health_metrics.lock().unwrap().clone()
    }

    /// Response cache statistics, when the cache is enabled.
    pub fn cache_stats(&self) -> Option<crate::agentmux::cache::CacheStats> {
        self.response_cache.as_ref().map(|c| c.stats())
    }

    /// Cancel the health loop and clear the penalty state.
    pub fn destroy(&self) {
        self.shutdown.cancel();
        if let Some(task) = self.health_task.lock().unwrap().take() {
            task.abort();
        }
        self.penalized.lock().unwrap().clear();
        if let Some(cache) = &self.response_cache {
            cache.destroy();
        }
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Ok(mut guard) = self.health_task.lock() {
            if let Some(task) = guard.take() {
                task.abort();
            }
        }
    }
}

/// Response-cache key: SHA-256 over provider name, prompt, and model
/// parameters.
fn response_cache_key(provider: &str, request: &ExecutionRequest) -> String {
    let mut hasher = Sha256::new();
    hasher.update(provider.as_bytes());
    hasher.update([0u8]);
    hasher.update(request.prompt.as_bytes());
    hasher.update([0u8]);
    hasher.update(request.model.as_deref().unwrap_or("").as_bytes());
    hasher.update([0u8]);
    hasher.update(
        request
            .temperature
            .map(|t| t.to_string())
            .unwrap_or_default()
            .as_bytes(),
    );
    hasher.update([0u8]);
    hasher.update(
        request
            .max_tokens
            .map(|t| t.to_string())
            .unwrap_or_default()
            .as_bytes(),
    );
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_keys_distinguish_model_params() {
        let base = ExecutionRequest::new("prompt");
        let with_model = ExecutionRequest::new("prompt").with_model("fast");
        let with_temp = ExecutionRequest::new("prompt").with_temperature(0.5);

        let k1 = response_cache_key("p", &base);
        let k2 = response_cache_key("p", &with_model);
        let k3 = response_cache_key("p", &with_temp);
        let k4 = response_cache_key("q", &base);

        assert_ne!(k1, k2);
        assert_ne!(k1, k3);
        assert_ne!(k1, k4);
        assert_eq!(k1, response_cache_key("p", &ExecutionRequest::new("prompt")));
    }
}
