//! TPC transport layer.
//!
//! Decides *how* an authenticated frame may leave the node: which physical
//! mode (ultrasonic, audible, dead-drop file) and which modulation
//! parameters, and whether the acoustic path is healthy enough to try.
//! The modem itself lives behind [`TransportDriver`].
//!
//! # Quick start
//!
//! ```rust,no_run
//! use tpc_transport::{CircuitBreaker, CircuitBreakerConfig, ProfileSelector, SelectorConfig};
//!
//! # async fn example() {
//! let selector = ProfileSelector::with_command_probe(SelectorConfig::new());
//! let profile = selector.select_profile(false).await;
//!
//! let breaker = CircuitBreaker::new(CircuitBreakerConfig::new().failure_threshold(3));
//! if profile.selected_mode.is_acoustic() && !breaker.is_allowed() {
//!     // Fail closed: any fallback is the caller's explicit decision.
//! }
//! # }
//! ```

mod breaker;
mod config;
mod driver;
mod error;
mod probe;
mod profile;
mod selector;

pub use breaker::{Admission, BreakerStats, BreakerTransition, CircuitBreaker, CircuitState};
pub use config::{CircuitBreakerConfig, SelectorConfig, DEFAULT_PROBE_PROGRAM, PROFILE_CACHE_FILE};
pub use driver::TransportDriver;
pub use error::TpcTransportError;
pub use probe::{CommandProbe, HardwareProbe, ProbeMeasurement};
pub use profile::{
    HardwareProfile, ModulationParams, TransportMode, AUDIBLE_PARAMS, DEFAULT_PARAMS,
    ULTRASONIC_CARRIERS, ULTRASONIC_PARAMS,
};
pub use selector::{CachedProfile, ProfileSelector};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time in milliseconds since UNIX epoch.
#[inline]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
