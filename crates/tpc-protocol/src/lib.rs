//! TPC protocol layer.
//!
//! Authenticates agent-to-agent envelopes and keeps the trail of what
//! happened to them:
//!
//! - [`Envelope`] / [`SignedEnvelope`]: canonical sorted-key JSON, signed
//!   with Ed25519 or HMAC-SHA256, freshness-checked.
//! - [`KeyStore`] and [`KeyRotationManager`]: PEM key files, scheduled
//!   rotation with a verification grace period.
//! - [`NonceCache`] and [`RateLimiter`]: replay rejection and per-agent
//!   admission control.
//! - [`AuditLogger`]: best-effort JSONL audit files rotated by day and size.
//! - [`SecureSender`] / [`SecureReceiver`]: the composed pipelines on top
//!   of [`tpc_transport`].
//!
//! # Quick start
//!
//! ```rust
//! use tpc_protocol::{Envelope, KeyRotationManager, RotationConfig};
//!
//! let keys = KeyRotationManager::new(RotationConfig::new());
//! keys.init(None);
//!
//! let signed = keys
//!     .sign_with_active(Envelope::new("opaque payload", "agent-a", "agent-b"))
//!     .unwrap();
//! assert!(keys.verify_with_rotation(&signed));
//! assert!(signed.envelope.is_fresh(300));
//! ```

pub mod audit;
pub mod config;
pub mod envelope;
pub mod error;
mod fsutil;
pub mod keys;
pub mod limiter;
pub mod pipeline;
pub mod replay;
pub mod rotation;

pub use audit::{AuditEvent, AuditLogEntry, AuditLogger, AuditStats, Severity};
pub use config::{AuditConfig, RateLimiterConfig, RotationConfig, TpcConfig};
pub use envelope::{
    generate_nonce, Envelope, EnvelopeBuilder, SignatureScheme, SignedEnvelope, VerificationKey,
};
pub use error::TpcError;
pub use keys::{KeyPair, KeyStore};
pub use limiter::{AgentRateStats, RateLimiter};
pub use pipeline::{SecureReceiver, SecureSender, SendReport};
pub use replay::{NonceCache, NonceVerdict};
pub use rotation::{KeyRotationManager, RotationEvent};
