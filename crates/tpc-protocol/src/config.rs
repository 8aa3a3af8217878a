use std::path::{Path, PathBuf};

use serde::Deserialize;
use tpc_transport::{CircuitBreakerConfig, SelectorConfig};

/// Audit log directory override.
pub const AUDIT_DIR_ENV: &str = "TPC_AUDIT_DIR";

/// Configuration for a [`KeyRotationManager`](crate::KeyRotationManager).
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RotationConfig {
    /// How long a retired key still verifies.
    pub(crate) grace_period_ms: u64,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 60 * 60 * 1000,
        }
    }
}

impl RotationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the grace period (default: 1 h).
    pub fn grace_period_ms(mut self, ms: u64) -> Self {
        self.grace_period_ms = ms;
        self
    }

    pub fn get_grace_period_ms(&self) -> u64 {
        self.grace_period_ms
    }
}

/// Configuration for a [`RateLimiter`](crate::RateLimiter).
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RateLimiterConfig {
    pub(crate) max_per_window: u32,
    pub(crate) window_ms: u64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_per_window: 10,
            window_ms: 60_000,
        }
    }
}

impl RateLimiterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests admitted per agent per window (default: 10).
    pub fn max_per_window(mut self, n: u32) -> Self {
        self.max_per_window = n;
        self
    }

    /// Sliding window length (default: 60 s).
    pub fn window_ms(mut self, ms: u64) -> Self {
        self.window_ms = ms;
        self
    }
}

/// Configuration for an [`AuditLogger`](crate::AuditLogger).
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AuditConfig {
    /// Directory holding `tpc-audit-<date>.jsonl` files.
    pub(crate) dir: PathBuf,
    /// A file at or above this size is not appended to.
    pub(crate) max_file_bytes: u64,
    /// In-memory mirror size. 0 disables it.
    pub(crate) ring_capacity: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditConfig {
    /// Defaults, with the directory taken from `TPC_AUDIT_DIR` when set.
    pub fn new() -> Self {
        let dir = std::env::var_os(AUDIT_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("tpc").join("audit"));
        Self {
            dir,
            max_file_bytes: 10 * 1024 * 1024,
            ring_capacity: 1000,
        }
    }

    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = dir.into();
        self
    }

    /// Size threshold for mid-day rotation (default: 10 MiB).
    pub fn max_file_bytes(mut self, bytes: u64) -> Self {
        self.max_file_bytes = bytes;
        self
    }

    /// Ring buffer size (default: 1000, 0 disables).
    pub fn ring_capacity(mut self, n: usize) -> Self {
        self.ring_capacity = n;
        self
    }

    pub fn get_dir(&self) -> &Path {
        &self.dir
    }
}

/// Everything a sender/receiver pair needs, in one deserializable struct.
///
/// ```rust
/// use tpc_protocol::TpcConfig;
///
/// let config: TpcConfig = serde_json::from_str(
///     r#"{"maxAgeSecs": 120, "rateLimit": {"maxPerWindow": 5}}"#,
/// ).unwrap();
/// assert_eq!(config.max_age_secs, 120);
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TpcConfig {
    /// Envelope freshness window.
    pub max_age_secs: u64,
    pub rotation: RotationConfig,
    pub rate_limit: RateLimiterConfig,
    pub breaker: CircuitBreakerConfig,
    pub audit: AuditConfig,
    pub selector: SelectorConfig,
}

impl Default for TpcConfig {
    fn default() -> Self {
        Self {
            max_age_secs: 300,
            rotation: RotationConfig::default(),
            rate_limit: RateLimiterConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            audit: AuditConfig::default(),
            selector: SelectorConfig::default(),
        }
    }
}

impl TpcConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nonces are remembered for twice the freshness window.
    pub fn nonce_ttl_ms(&self) -> u64 {
        self.max_age_secs.saturating_mul(2).saturating_mul(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = TpcConfig::default();
        assert_eq!(config.max_age_secs, 300);
        assert_eq!(config.rotation.grace_period_ms, 3_600_000);
        assert_eq!(config.rate_limit.max_per_window, 10);
        assert_eq!(config.rate_limit.window_ms, 60_000);
        assert_eq!(config.audit.max_file_bytes, 10 * 1024 * 1024);
        assert_eq!(config.audit.ring_capacity, 1000);
        assert_eq!(config.nonce_ttl_ms(), 600_000);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: TpcConfig = serde_json::from_str(
            r#"{"audit": {"dir": "/var/log/tpc", "ringCapacity": 0}, "rotation": {"gracePeriodMs": 5}}"#,
        )
        .unwrap();
        assert_eq!(config.audit.get_dir(), Path::new("/var/log/tpc"));
        assert_eq!(config.audit.ring_capacity, 0);
        assert_eq!(config.audit.max_file_bytes, 10 * 1024 * 1024);
        assert_eq!(config.rotation.get_grace_period_ms(), 5);
        assert_eq!(config.max_age_secs, 300);
    }

    #[test]
    fn builders() {
        let audit = AuditConfig::new().dir("/tmp/x").max_file_bytes(64).ring_capacity(3);
        assert_eq!(audit.get_dir(), Path::new("/tmp/x"));
        assert_eq!(audit.max_file_bytes, 64);
        let rl = RateLimiterConfig::new().max_per_window(2).window_ms(50);
        assert_eq!((rl.max_per_window, rl.window_ms), (2, 50));
    }
}
