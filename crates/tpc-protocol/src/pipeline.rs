/// Sender and receiver pipelines.
///
/// Sender: profile → rate limit → breaker (acoustic only) → sign →
/// driver → audit + breaker bookkeeping. Receiver: decode → wire shape →
/// verify → freshness → nonce → audit.
///
/// An open breaker is an error, never a silent detour. The only way onto
/// the dead-drop file path after a refusal is [`SecureSender::send_fallback`],
/// which writes a `fallback` audit event first.
use std::sync::Arc;

use ed25519_dalek::VerifyingKey;
use tpc_transport::{
    now_ms, CircuitBreaker, ModulationParams, ProfileSelector, TransportDriver, TransportMode,
    DEFAULT_PARAMS,
};
use tracing::{debug, info, warn};

use crate::audit::AuditLogger;
use crate::config::TpcConfig;
use crate::envelope::{Envelope, EnvelopeBuilder, SignatureScheme, SignedEnvelope, VerificationKey};
use crate::error::TpcError;
use crate::limiter::RateLimiter;
use crate::replay::{NonceCache, NonceVerdict};
use crate::rotation::KeyRotationManager;

/// Outcome of a successful send.
#[derive(Debug, Clone, PartialEq)]
pub struct SendReport {
    pub message_id: String,
    pub mode: TransportMode,
    pub params: ModulationParams,
    pub frame_len: usize,
}

pub struct SecureSender {
    selector: ProfileSelector,
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    keys: Arc<KeyRotationManager>,
    audit: Arc<AuditLogger>,
    driver: Arc<dyn TransportDriver>,
}

impl SecureSender {
    /// Build a sender with its own limiter, breaker and subprocess-backed
    /// selector taken from `config`.
    pub fn new(
        config: &TpcConfig,
        keys: Arc<KeyRotationManager>,
        audit: Arc<AuditLogger>,
        driver: Arc<dyn TransportDriver>,
    ) -> Self {
        Self {
            selector: ProfileSelector::with_command_probe(config.selector.clone()),
            limiter: Arc::new(RateLimiter::new(config.rate_limit.clone())),
            breaker: Arc::new(CircuitBreaker::new(config.breaker.clone())),
            keys,
            audit,
            driver,
        }
    }

    pub fn with_selector(mut self, selector: ProfileSelector) -> Self {
        self.selector = selector;
        self
    }

    /// Share a limiter with other senders.
    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Share a breaker with other senders on the same transport.
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn selector(&self) -> &ProfileSelector {
        &self.selector
    }

    /// Wrap `payload` in a fresh envelope and send it.
    pub async fn send(
        &self,
        payload: impl Into<String>,
        source_agent: impl Into<String>,
        target_agent: impl Into<String>,
    ) -> Result<SendReport, TpcError> {
        let envelope = EnvelopeBuilder::new(payload, source_agent, target_agent).build();
        self.send_envelope(envelope).await
    }

    /// Send a prepared envelope over the selected transport.
    pub async fn send_envelope(&self, envelope: Envelope) -> Result<SendReport, TpcError> {
        let profile = self.selector.select_profile(false).await;
        let mode = profile.selected_mode;
        let params = profile.params();

        if !self.limiter.record(&envelope.target_agent) {
            self.audit.log_rate_limited(&envelope, &envelope.target_agent);
            return Err(TpcError::RateLimited {
                agent_id: envelope.target_agent.clone(),
            });
        }

        if mode.is_acoustic() {
            let admission = self.breaker.try_acquire();
            if let Some(transition) = admission.transition {
                self.audit.log_circuit_breaker(mode, transition);
            }
            if !admission.allowed {
                warn!(%mode, message_id = %envelope.message_id, "transport refused: circuit open");
                self.audit
                    .log_encode(&envelope, mode, false, Some("circuit open"));
                return Err(TpcError::CircuitOpen { transport: mode });
            }
        }

        self.sign_and_transmit(envelope, mode, params).await
    }

    /// Explicit, audited switch to the dead-drop file transport.
    ///
    /// For use after `CircuitOpen` or `TransportFailed` from `from`. The
    /// breaker is not consulted and the rate-limit slot of the refused
    /// attempt is not charged again.
    pub async fn send_fallback(
        &self,
        envelope: Envelope,
        from: TransportMode,
        reason: &str,
    ) -> Result<SendReport, TpcError> {
        warn!(%from, to = %TransportMode::File, message_id = %envelope.message_id, reason, "explicit transport fallback");
        self.audit.log_fallback(
            from,
            TransportMode::File,
            reason,
            Some(&envelope.message_id),
        );
        self.sign_and_transmit(envelope, TransportMode::File, DEFAULT_PARAMS)
            .await
    }

    // ── Internal ───────────────────────────────────────────────────────

    async fn sign_and_transmit(
        &self,
        envelope: Envelope,
        mode: TransportMode,
        params: ModulationParams,
    ) -> Result<SendReport, TpcError> {
        let signed = self.keys.sign_with_active(envelope)?;
        let frame = signed.to_bytes()?;

        match self.driver.transmit(&frame, mode, &params).await {
            Ok(()) => {
                if mode.is_acoustic() {
                    if let Some(transition) = self.breaker.record_success() {
                        self.audit.log_circuit_breaker(mode, transition);
                    }
                }
                self.audit.log_encode(&signed.envelope, mode, true, None);
                debug!(%mode, message_id = %signed.envelope.message_id, bytes = frame.len(), "frame sent");
                Ok(SendReport {
                    message_id: signed.envelope.message_id,
                    mode,
                    params,
                    frame_len: frame.len(),
                })
            }
            Err(reason) => {
                if mode.is_acoustic() {
                    if let Some(transition) = self.breaker.record_failure() {
                        self.audit.log_circuit_breaker(mode, transition);
                    }
                }
                warn!(%mode, message_id = %signed.envelope.message_id, %reason, "transport failed");
                self.audit
                    .log_encode(&signed.envelope, mode, false, Some(&reason));
                Err(TpcError::TransportFailed { mode, reason })
            }
        }
    }
}

pub struct SecureReceiver {
    keys: Arc<KeyRotationManager>,
    audit: Arc<AuditLogger>,
    nonces: NonceCache,
    max_age_secs: u64,
    peer_keys: Vec<VerifyingKey>,
    hmac_secret: Option<Vec<u8>>,
}

impl SecureReceiver {
    pub fn new(config: &TpcConfig, keys: Arc<KeyRotationManager>, audit: Arc<AuditLogger>) -> Self {
        Self {
            keys,
            audit,
            nonces: NonceCache::new(config.nonce_ttl_ms()),
            max_age_secs: config.max_age_secs,
            peer_keys: Vec::new(),
            hmac_secret: None,
        }
    }

    /// Also accept Ed25519 signatures from this peer key.
    pub fn with_peer_key(mut self, key: VerifyingKey) -> Self {
        self.peer_keys.push(key);
        self
    }

    /// Accept HMAC-signed envelopes under this shared secret.
    pub fn with_hmac_secret(mut self, secret: impl Into<Vec<u8>>) -> Self {
        self.hmac_secret = Some(secret.into());
        self
    }

    /// Decode a JSON frame and run it through [`receive`](Self::receive).
    pub fn receive_frame(
        &self,
        frame: &[u8],
        transport: Option<TransportMode>,
    ) -> Result<Envelope, TpcError> {
        let signed = SignedEnvelope::from_bytes(frame).inspect_err(|e| {
            warn!(error = %e, bytes = frame.len(), "undecodable frame dropped");
        })?;
        self.receive(signed, transport)
    }

    /// Authenticate and de-duplicate an envelope. Returns it on success.
    pub fn receive(
        &self,
        signed: SignedEnvelope,
        transport: Option<TransportMode>,
    ) -> Result<Envelope, TpcError> {
        self.receive_at(signed, transport, now_ms())
    }

    pub fn receive_at(
        &self,
        signed: SignedEnvelope,
        transport: Option<TransportMode>,
        now: u64,
    ) -> Result<Envelope, TpcError> {
        if let Err(reason) = signed.envelope.check_wire_shape() {
            warn!(message_id = %signed.envelope.message_id, reason, "malformed envelope dropped");
            self.audit.log_verify_failed(&signed.envelope, reason);
            return Err(TpcError::Deserialization(reason.into()));
        }

        if let Err(reason) = self.verify_at(&signed, now) {
            self.audit.log_verify_failed(&signed.envelope, reason);
            return Err(TpcError::VerificationFailed {
                message_id: signed.envelope.message_id,
            });
        }

        let envelope = signed.envelope;
        if !envelope.is_fresh_at(self.max_age_secs, now / 1000) {
            let reason = "timestamp outside freshness window";
            self.audit.log_replay_detected(&envelope, reason);
            return Err(TpcError::ReplayDetected {
                reason: reason.into(),
            });
        }

        let reason = match self.nonces.check_and_insert_at(&envelope.nonce, now) {
            NonceVerdict::Accepted => None,
            NonceVerdict::Replayed => Some("duplicate nonce"),
            NonceVerdict::CacheFull => Some("nonce cache full"),
        };
        if let Some(reason) = reason {
            self.audit.log_replay_detected(&envelope, reason);
            return Err(TpcError::ReplayDetected {
                reason: reason.into(),
            });
        }

        self.audit.log_decode(&envelope, transport, true);
        info!(message_id = %envelope.message_id, source = %envelope.source_agent, "envelope accepted");
        Ok(envelope)
    }

    fn verify_at(&self, signed: &SignedEnvelope, now: u64) -> Result<(), &'static str> {
        match signed.scheme {
            SignatureScheme::Ed25519 => {
                if self.keys.verify_with_rotation_at(signed, now)
                    || self
                        .peer_keys
                        .iter()
                        .any(|k| signed.verify(VerificationKey::Ed25519(k)))
                {
                    Ok(())
                } else {
                    Err("ed25519 signature did not verify against any accepted key")
                }
            }
            SignatureScheme::Hmac => match &self.hmac_secret {
                Some(secret) if signed.verify(VerificationKey::Hmac(secret)) => Ok(()),
                Some(_) => Err("hmac tag mismatch"),
                None => Err("hmac envelope but no shared secret configured"),
            },
        }
    }
}
