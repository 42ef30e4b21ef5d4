//! Provider binary discovery and version probing.
//!
//! Resolution order for a provider named `p`:
//!
//! 1. An explicitly configured path (`DetectorConfig::paths["p"]`).
//! 2. The `P_CLI` environment variable (provider name uppercased, with
//!    non-alphanumeric characters mapped to `_`).
//! 3. The OS search path — `which` semantics on Unix, `where.exe` plus
//!    `PATH × PATHEXT` semantics on Windows (both covered by the `which`
//!    crate).
//!
//! A successful resolution is followed by a `--version` probe. When a
//! minimum version is configured, otherwise-runnable binaries are rejected
//! with reason "version-too-low". Results are cached process-wide until
//! [`clear_cache`] is called.

use crate::agentmux::providers::exec::{run_cli, CliInvocation};
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Budget for the `--version` probe.
const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

lazy_static! {
    /// Process-wide detection results keyed by provider name.
    static ref DETECTION_CACHE: Mutex<HashMap<String, Result<DetectedCli, DetectError>>> =
        Mutex::new(HashMap::new());
}

/// A resolved provider binary.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedCli {
    /// Absolute path of the binary.
    pub path: PathBuf,
    /// Version string parsed from `--version` output, when one was found.
    pub version: Option<String>,
}

/// Detection failures.
#[derive(Debug, Clone, PartialEq)]
pub enum DetectError {
    /// The binary resolves nowhere.
    NotFound(String),
    /// The binary runs but reports a version below the configured minimum.
    VersionTooLow {
        /// Provider name.
        provider: String,
        /// Version the binary reported.
        found: String,
        /// Configured minimum.
        minimum: String,
    },
}

impl std::fmt::Display for DetectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DetectError::NotFound(name) => write!(f, "Provider binary not found: {}", name),
            DetectError::VersionTooLow {
                provider,
                found,
                minimum,
            } => write!(
                f,
                "Provider {} rejected: version-too-low ({} < {})",
                provider, found, minimum
            ),
        }
    }
}

impl std::error::Error for DetectError {}

/// Detector inputs.
#[derive(Debug, Clone, Default)]
pub struct DetectorConfig {
    /// Explicitly configured binary paths, keyed by provider name.
    pub paths: HashMap<String, PathBuf>,
    /// Minimum acceptable versions, keyed by provider name.
    pub minimum_versions: HashMap<String, String>,
}

/// Resolve a provider binary and probe its version, consulting the
/// process-wide cache first.
pub async fn detect(provider: &str, config: &DetectorConfig) -> Result<DetectedCli, DetectError> {
    if let Some(cached) = DETECTION_CACHE.lock().unwrap().get(provider) {
        return cached.clone();
    }
    let result = detect_uncached(provider, config).await;
    DETECTION_CACHE
        .lock()
        .unwrap()
        .insert(provider.to_string(), result.clone());
    result
}

/// Drop every cached detection result. Intended for tests and for hosts that
/// install a provider binary at runtime.
pub fn clear_cache() {
    DETECTION_CACHE.lock().unwrap().clear();
}

async fn detect_uncached(
    provider: &str,
    config: &DetectorConfig,
) -> Result<DetectedCli, DetectError> {
    let path = resolve_path(provider, config)?;

    let version = probe_version(&path).await;
    if let (Some(found), Some(minimum)) = (&version, config.minimum_versions.get(provider)) {
        if version_lt(found, minimum) {
            return Err(DetectError::VersionTooLow {
                provider: provider.to_string(),
                found: found.clone(),
                minimum: minimum.clone(),
            });
        }
    }

    Ok(DetectedCli { path, version })
}

fn resolve_path(provider: &str, config: &DetectorConfig) -> Result<PathBuf, DetectError> {
    if let Some(path) = config.paths.get(provider) {
        if path.exists() {
            return Ok(path.clone());
        }
        return Err(DetectError::NotFound(format!(
            "{} (configured path {} does not exist)",
            provider,
            path.display()
        )));
    }

    if let Ok(value) = std::env::var(env_var_name(provider)) {
        let path = PathBuf::from(value);
        if path.exists() {
            return Ok(path);
        }
    }

    which::which(provider).map_err(|_| DetectError::NotFound(provider.to_string()))
}

/// `claude` → `CLAUDE_CLI`, `my-tool` → `MY_TOOL_CLI`.
fn env_var_name(provider: &str) -> String {
    let mut name: String = provider
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    name.push_str("_CLI");
    name
}

async fn probe_version(path: &PathBuf) -> Option<String> {
    let output = run_cli(CliInvocation {
        command: path.display().to_string(),
        args: vec!["--version".to_string()],
        stdin_payload: None,
        timeout: Some(VERSION_PROBE_TIMEOUT),
        cancellation: CancellationToken::new(),
    })
    .await
    .ok()?;

    if output.exit_code != 0 {
        return None;
    }
    parse_version(&output.stdout)
}

/// Scan output for the first `x.y` / `x.y.z` token.
fn parse_version(text: &str) -> Option<String> {
    for token in text.split_whitespace() {
        let token = token.trim_matches(|c: char| !c.is_ascii_digit());
        let parts: Vec<&str> = token.split('.').collect();
        if parts.len() >= 2 && parts.iter().all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit())) {
            return Some(token.to_string());
        }
    }
    None
}

/// Numeric dot-component comparison; missing components count as zero.
fn version_lt(found: &str, minimum: &str) -> bool {
    let parse = |v: &str| -> Vec<u64> {
        v.split('.')
            .map(|p| p.parse::<u64>().unwrap_or(0))
            .collect()
    };
    let a = parse(found);
    let b = parse(minimum);
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        if x != y {
            return x < y;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_var_names_are_uppercased() {
        assert_eq!(env_var_name("claude"), "CLAUDE_CLI");
        assert_eq!(env_var_name("my-tool"), "MY_TOOL_CLI");
    }

    #[test]
    fn version_parsing_finds_dotted_tokens() {
        assert_eq!(parse_version("claude 1.2.3 (stable)"), Some("1.2.3".to_string()));
        assert_eq!(parse_version("v2.0"), Some("2.0".to_string()));
        assert_eq!(parse_version("no version here"), None);
    }

    #[test]
    fn version_comparison_is_numeric() {
        assert!(version_lt("1.9.0", "1.10"));
        assert!(!version_lt("2.0.0", "1.99.99"));
        assert!(!version_lt("1.2", "1.2.0"));
    }

    #[tokio::test]
    async fn unknown_provider_is_not_found() {
        clear_cache();
        let err = detect("definitely-not-a-real-binary-42", &DetectorConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DetectError::NotFound(_)));
    }
}
