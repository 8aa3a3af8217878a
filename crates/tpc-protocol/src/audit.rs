/// Append-only JSONL audit trail.
///
/// One file per UTC day (`tpc-audit-<YYYY-MM-DD>.jsonl`); when a file
/// reaches `max_file_bytes` the writer moves to `tpc-audit-<date>.1.jsonl`,
/// `.2`, and so on, reusing the first suffix still under the limit.
///
/// Writes are best-effort. An I/O failure is counted and traced, never
/// returned: the operation being audited must not fail because of it.
use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tpc_transport::{BreakerTransition, CircuitState, TransportMode};
use tracing::{debug, warn};

use crate::config::AuditConfig;
use crate::envelope::Envelope;
use crate::error::TpcError;
use crate::fsutil;
use crate::rotation::RotationEvent;

/// Log file name prefix.
pub const AUDIT_FILE_PREFIX: &str = "tpc-audit-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Security,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    Encode,
    Decode,
    VerifyFailed,
    ReplayDetected,
    Fallback,
    KeyRotation,
    CircuitBreaker,
    RateLimited,
}

/// One line of the audit file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    /// RFC 3339, UTC, millisecond precision.
    pub ts: String,
    pub event: AuditEvent,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl AuditLogEntry {
    pub fn new(event: AuditEvent, severity: Severity, at: DateTime<Utc>) -> Self {
        Self {
            ts: at.to_rfc3339_opts(SecondsFormat::Millis, true),
            event,
            severity,
            source: None,
            target: None,
            message_id: None,
            nonce: None,
            transport: None,
            verified: None,
            reason: None,
            details: None,
        }
    }

    /// Copy routing and identity fields from an envelope.
    pub fn with_envelope(mut self, envelope: &Envelope) -> Self {
        self.source = Some(envelope.source_agent.clone());
        self.target = Some(envelope.target_agent.clone());
        self.message_id = Some(envelope.message_id.clone());
        self.nonce = Some(envelope.nonce.clone());
        self
    }

    pub fn with_transport(mut self, transport: TransportMode) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_verified(mut self, verified: bool) -> Self {
        self.verified = Some(verified);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Write counters for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditStats {
    pub written: u64,
    pub failures: u64,
    pub buffered: usize,
}

#[derive(Debug)]
struct OpenLog {
    day: NaiveDate,
    path: PathBuf,
    file: File,
    size: u64,
}

#[derive(Debug)]
pub struct AuditLogger {
    config: AuditConfig,
    current: Mutex<Option<OpenLog>>,
    ring: Mutex<VecDeque<AuditLogEntry>>,
    written: AtomicU64,
    failures: AtomicU64,
}

impl AuditLogger {
    pub fn new(config: AuditConfig) -> Self {
        let ring = VecDeque::with_capacity(config.ring_capacity.min(1024));
        Self {
            config,
            current: Mutex::new(None),
            ring: Mutex::new(ring),
            written: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Create the log directory and open today's file.
    ///
    /// Unlike later writes, a failure here is returned: an audit
    /// directory that cannot be created is a deployment error.
    pub fn init(&self) -> Result<(), TpcError> {
        let now = Utc::now();
        let mut current = self.lock_current();
        if current.as_ref().is_some_and(|log| log.day == now.date_naive()) {
            return Ok(());
        }
        let log = self.open_for(now.date_naive())?;
        debug!(path = %log.path.display(), "audit log opened");
        *current = Some(log);
        Ok(())
    }

    // ── Event-specific entry points ────────────────────────────────────

    /// Outgoing envelope handed to a transport. Failure is `error`.
    pub fn log_encode(
        &self,
        envelope: &Envelope,
        transport: TransportMode,
        success: bool,
        reason: Option<&str>,
    ) {
        let severity = if success { Severity::Info } else { Severity::Error };
        let mut entry = AuditLogEntry::new(AuditEvent::Encode, severity, Utc::now())
            .with_envelope(envelope)
            .with_transport(transport);
        if let Some(reason) = reason {
            entry = entry.with_reason(reason);
        }
        self.record(entry);
    }

    /// Incoming envelope accepted.
    pub fn log_decode(&self, envelope: &Envelope, transport: Option<TransportMode>, verified: bool) {
        let mut entry = AuditLogEntry::new(AuditEvent::Decode, Severity::Info, Utc::now())
            .with_envelope(envelope)
            .with_verified(verified);
        entry.transport = transport;
        self.record(entry);
    }

    pub fn log_verify_failed(&self, envelope: &Envelope, reason: &str) {
        let entry = AuditLogEntry::new(AuditEvent::VerifyFailed, Severity::Security, Utc::now())
            .with_envelope(envelope)
            .with_verified(false)
            .with_reason(reason);
        self.record(entry);
    }

    pub fn log_replay_detected(&self, envelope: &Envelope, reason: &str) {
        let entry = AuditLogEntry::new(AuditEvent::ReplayDetected, Severity::Security, Utc::now())
            .with_envelope(envelope)
            .with_reason(reason);
        self.record(entry);
    }

    /// Explicit switch from one transport to another.
    pub fn log_fallback(
        &self,
        from: TransportMode,
        to: TransportMode,
        reason: &str,
        message_id: Option<&str>,
    ) {
        let mut entry = AuditLogEntry::new(AuditEvent::Fallback, Severity::Warning, Utc::now())
            .with_transport(to)
            .with_reason(reason)
            .with_details(json!({ "from": from, "to": to }));
        entry.message_id = message_id.map(str::to_string);
        self.record(entry);
    }

    pub fn log_key_rotation(&self, event: &RotationEvent) {
        let entry = AuditLogEntry::new(AuditEvent::KeyRotation, Severity::Info, Utc::now())
            .with_details(json!({
                "newKeyId": event.new_key_id,
                "previousKeyId": event.previous_key_id,
                "rotatedAt": event.rotated_at,
                "previousExpiresAt": event.previous_expires_at,
            }));
        self.record(entry);
    }

    /// Breaker transition. Severity follows the state entered.
    pub fn log_circuit_breaker(&self, transport: TransportMode, transition: BreakerTransition) {
        let severity = match transition.to {
            CircuitState::Open => Severity::Error,
            CircuitState::HalfOpen => Severity::Warning,
            CircuitState::Closed => Severity::Info,
        };
        let entry = AuditLogEntry::new(AuditEvent::CircuitBreaker, severity, Utc::now())
            .with_transport(transport)
            .with_details(json!({ "from": transition.from, "to": transition.to }));
        self.record(entry);
    }

    pub fn log_rate_limited(&self, envelope: &Envelope, agent_id: &str) {
        let entry = AuditLogEntry::new(AuditEvent::RateLimited, Severity::Warning, Utc::now())
            .with_envelope(envelope)
            .with_reason("rate limit exceeded")
            .with_details(json!({ "agentId": agent_id }));
        self.record(entry);
    }

    // ── Generic write path ─────────────────────────────────────────────

    /// Append an arbitrary entry. Never fails.
    pub fn record(&self, entry: AuditLogEntry) {
        self.record_at(entry, Utc::now());
    }

    /// Append `entry` to the file for `now`'s UTC day.
    pub fn record_at(&self, entry: AuditLogEntry, now: DateTime<Utc>) {
        if entry.severity == Severity::Security {
            warn!(
                event = ?entry.event,
                message_id = ?entry.message_id,
                reason = ?entry.reason,
                "security audit event"
            );
        }

        match serde_json::to_string(&entry) {
            Ok(line) => match self.append_line(&line, now.date_naive()) {
                Ok(()) => {
                    self.written.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, dir = %self.config.dir.display(), "audit write failed");
                }
            },
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "audit entry serialization failed");
            }
        }

        self.push_ring(entry);
    }

    /// Up to `n` most recent entries, oldest first.
    pub fn recent(&self, n: usize) -> Vec<AuditLogEntry> {
        let ring = self.ring.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = ring.len().saturating_sub(n);
        ring.iter().skip(skip).cloned().collect()
    }

    /// Path of the file currently open for appends.
    pub fn current_file(&self) -> Option<PathBuf> {
        self.lock_current().as_ref().map(|log| log.path.clone())
    }

    pub fn stats(&self) -> AuditStats {
        AuditStats {
            written: self.written.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            buffered: self.ring.lock().unwrap_or_else(PoisonError::into_inner).len(),
        }
    }

    /// Flush and close the current file. A later write reopens it.
    pub fn shutdown(&self) {
        if let Some(mut log) = self.lock_current().take() {
            if let Err(e) = log.file.flush().and_then(|()| log.file.sync_all()) {
                warn!(error = %e, path = %log.path.display(), "audit flush on shutdown failed");
            }
            debug!(path = %log.path.display(), "audit log closed");
        }
    }

    pub fn config(&self) -> &AuditConfig {
        &self.config
    }

    // ── Internal ───────────────────────────────────────────────────────

    fn lock_current(&self) -> MutexGuard<'_, Option<OpenLog>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn max_bytes(&self) -> u64 {
        self.config.max_file_bytes.max(1)
    }

    fn append_line(&self, line: &str, day: NaiveDate) -> io::Result<()> {
        let mut current = self.lock_current();
        let max = self.max_bytes();

        let mut log = match current.take() {
            Some(log) if log.day == day && log.size < max => log,
            previous => {
                if let Some(prev) = previous {
                    debug!(path = %prev.path.display(), "audit log rotated");
                }
                self.open_for(day)?
            }
        };

        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        log.file.write_all(&buf)?;
        log.size += buf.len() as u64;

        *current = Some(log);
        Ok(())
    }

    /// First file for `day` still under the size limit.
    fn open_for(&self, day: NaiveDate) -> io::Result<OpenLog> {
        fsutil::create_private_dir(&self.config.dir)?;
        let max = self.max_bytes();

        let mut index = 0u32;
        loop {
            let path = self.config.dir.join(log_file_name(day, index));
            let size = match std::fs::metadata(&path) {
                Ok(meta) => meta.len(),
                Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
                Err(e) => return Err(e),
            };
            if size < max {
                let file = fsutil::open_append_private(&path)?;
                return Ok(OpenLog {
                    day,
                    path,
                    file,
                    size,
                });
            }
            index += 1;
        }
    }

    fn push_ring(&self, entry: AuditLogEntry) {
        let cap = self.config.ring_capacity;
        if cap == 0 {
            return;
        }
        let mut ring = self.ring.lock().unwrap_or_else(PoisonError::into_inner);
        while ring.len() >= cap {
            ring.pop_front();
        }
        ring.push_back(entry);
    }
}

/// `tpc-audit-2026-01-31.jsonl`, then `tpc-audit-2026-01-31.1.jsonl`, ...
pub fn log_file_name(day: NaiveDate, index: u32) -> String {
    if index == 0 {
        format!("{AUDIT_FILE_PREFIX}{day}.jsonl")
    } else {
        format!("{AUDIT_FILE_PREFIX}{day}.{index}.jsonl")
    }
}

/// Files in `dir` that look like audit logs, sorted by name.
pub fn list_log_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(AUDIT_FILE_PREFIX) && n.ends_with(".jsonl"))
        })
        .collect();
    files.sort();
    Ok(files)
}
