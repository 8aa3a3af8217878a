use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// File name of the cached hardware profile.
pub const PROFILE_CACHE_FILE: &str = "hardware-profile.json";

/// Default probe executable, overridable through `TPC_PROBE_BIN`.
pub const DEFAULT_PROBE_PROGRAM: &str = "tpc-hwprobe";

/// Configuration for a [`ProfileSelector`](crate::ProfileSelector).
///
/// ```rust
/// use tpc_transport::SelectorConfig;
///
/// let config = SelectorConfig::new()
///     .cache_path("/var/lib/tpc/hardware-profile.json")
///     .probe_timeout_ms(5_000);
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SelectorConfig {
    /// Where the selected profile is persisted.
    pub(crate) cache_path: PathBuf,
    /// A cached profile older than this is re-probed.
    pub(crate) max_cache_age_ms: u64,
    /// Upper bound on a single probe run.
    pub(crate) probe_timeout_ms: u64,
    /// Probe executable.
    pub(crate) probe_program: PathBuf,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectorConfig {
    /// Create a config with defaults.
    ///
    /// If `TPC_PROBE_BIN` is set it names the probe executable.
    pub fn new() -> Self {
        let probe_program = std::env::var_os("TPC_PROBE_BIN")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_PROBE_PROGRAM));

        Self {
            cache_path: std::env::temp_dir().join("tpc").join(PROFILE_CACHE_FILE),
            max_cache_age_ms: 24 * 60 * 60 * 1000,
            probe_timeout_ms: 10_000,
            probe_program,
        }
    }

    /// Set the profile cache file.
    pub fn cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_path = path.into();
        self
    }

    /// Set the cache staleness threshold (default: 24 h).
    pub fn max_cache_age_ms(mut self, ms: u64) -> Self {
        self.max_cache_age_ms = ms;
        self
    }

    /// Set the probe timeout (default: 10 s).
    pub fn probe_timeout_ms(mut self, ms: u64) -> Self {
        self.probe_timeout_ms = ms;
        self
    }

    /// Set the probe executable.
    pub fn probe_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.probe_program = program.into();
        self
    }

    pub fn get_cache_path(&self) -> &Path {
        &self.cache_path
    }

    pub fn get_probe_program(&self) -> &Path {
        &self.probe_program
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Configuration for a [`CircuitBreaker`](crate::CircuitBreaker).
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CircuitBreakerConfig {
    /// Failures inside the window that trip the breaker.
    pub(crate) failure_threshold: u32,
    /// Sliding window for failure counting.
    pub(crate) failure_window_ms: u64,
    /// Time spent open before a half-open probe is allowed.
    pub(crate) recovery_timeout_ms: u64,
    /// Consecutive half-open successes needed to close.
    pub(crate) successes_required: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            failure_window_ms: 60_000,
            recovery_timeout_ms: 30_000,
            successes_required: 2,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the trip threshold (default: 3). Clamped to at least 1.
    pub fn failure_threshold(mut self, n: u32) -> Self {
        self.failure_threshold = n.max(1);
        self
    }

    /// Set the failure window (default: 60 s).
    pub fn failure_window_ms(mut self, ms: u64) -> Self {
        self.failure_window_ms = ms;
        self
    }

    /// Set the open → half-open delay (default: 30 s).
    pub fn recovery_timeout_ms(mut self, ms: u64) -> Self {
        self.recovery_timeout_ms = ms;
        self
    }

    /// Set the half-open → closed success count (default: 2). Clamped to at least 1.
    pub fn successes_required(mut self, n: u32) -> Self {
        self.successes_required = n.max(1);
        self
    }
}
