/// Key rotation with an overlap grace period.
///
/// One key is active and signs. Retired keys keep verifying until
/// `retired_at + grace_period`, then are rejected even when the signature
/// is cryptographically valid. The key set is an immutable `Arc<KeyRing>`
/// swapped whole under a write lock, so a verifier sees either the old
/// set or the new one.
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use ed25519_dalek::VerifyingKey;
use tpc_transport::now_ms;
use tracing::{debug, info};

use crate::config::RotationConfig;
use crate::envelope::{Envelope, SignatureScheme, SignedEnvelope, VerificationKey};
use crate::error::TpcError;
use crate::keys::KeyPair;

/// Emitted on every rotation, before `rotate` returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationEvent {
    pub new_key_id: String,
    pub previous_key_id: Option<String>,
    pub rotated_at: u64,
    /// When the previous key stops verifying.
    pub previous_expires_at: Option<u64>,
}

type RotateHook = Box<dyn Fn(&RotationEvent) + Send + Sync>;

#[derive(Debug, Clone)]
struct KeyEntry {
    key_pair: KeyPair,
    key_id: String,
    activated_at: u64,
    /// `None` for the active key.
    expires_at: Option<u64>,
}

impl KeyEntry {
    fn new(key_pair: KeyPair, activated_at: u64) -> Self {
        let key_id = key_pair.key_id();
        Self {
            key_pair,
            key_id,
            activated_at,
            expires_at: None,
        }
    }

    fn accepts_at(&self, now: u64) -> bool {
        self.expires_at.map_or(true, |exp| now < exp)
    }
}

/// Active key first, then retired keys newest first.
#[derive(Debug, Default)]
struct KeyRing {
    entries: Vec<KeyEntry>,
}

impl KeyRing {
    fn active(&self) -> Option<&KeyEntry> {
        self.entries.first().filter(|e| e.expires_at.is_none())
    }
}

pub struct KeyRotationManager {
    config: RotationConfig,
    ring: RwLock<Arc<KeyRing>>,
    on_rotate: Option<RotateHook>,
}

impl fmt::Debug for KeyRotationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRotationManager")
            .field("config", &self.config)
            .field("key_ids", &self.accepted_key_ids())
            .finish()
    }
}

impl KeyRotationManager {
    /// An empty manager. Call [`init`](Self::init) before signing.
    pub fn new(config: RotationConfig) -> Self {
        Self {
            config,
            ring: RwLock::new(Arc::new(KeyRing::default())),
            on_rotate: None,
        }
    }

    /// Register a hook run synchronously on every rotation.
    pub fn on_rotate(mut self, hook: impl Fn(&RotationEvent) + Send + Sync + 'static) -> Self {
        self.on_rotate = Some(Box::new(hook));
        self
    }

    /// Activate `existing` (or a freshly generated key) as the only key.
    pub fn init(&self, existing: Option<KeyPair>) -> KeyPair {
        self.init_at(existing, now_ms())
    }

    pub fn init_at(&self, existing: Option<KeyPair>, now: u64) -> KeyPair {
        let key_pair = existing.unwrap_or_else(KeyPair::generate);
        let entry = KeyEntry::new(key_pair.clone(), now);
        info!(key_id = %entry.key_id, "signing key activated");
        self.swap(KeyRing {
            entries: vec![entry],
        });
        key_pair
    }

    /// Generate a new key, retire the current one for the grace period.
    pub fn rotate(&self) -> KeyPair {
        self.rotate_to_at(KeyPair::generate(), now_ms())
    }

    pub fn rotate_at(&self, now: u64) -> KeyPair {
        self.rotate_to_at(KeyPair::generate(), now)
    }

    /// Rotate to a caller-supplied key.
    pub fn rotate_to_at(&self, next: KeyPair, now: u64) -> KeyPair {
        let grace = self.config.grace_period_ms;
        let new_entry = KeyEntry::new(next.clone(), now);

        let event = {
            let mut guard = self.ring.write().unwrap_or_else(PoisonError::into_inner);
            let current = Arc::clone(&guard);

            let mut previous_key_id = None;
            let mut previous_expires_at = None;
            let mut entries = Vec::with_capacity(current.entries.len() + 1);
            entries.push(new_entry);
            for old in current.entries.iter() {
                let mut old = old.clone();
                if old.expires_at.is_none() {
                    let expires = now.saturating_add(grace);
                    old.expires_at = Some(expires);
                    previous_key_id = Some(old.key_id.clone());
                    previous_expires_at = Some(expires);
                }
                if old.accepts_at(now) {
                    entries.push(old);
                }
            }

            let event = RotationEvent {
                new_key_id: entries[0].key_id.clone(),
                previous_key_id,
                rotated_at: now,
                previous_expires_at,
            };
            *guard = Arc::new(KeyRing { entries });
            event
        };

        info!(
            new_key_id = %event.new_key_id,
            previous_key_id = ?event.previous_key_id,
            grace_ms = grace,
            "signing key rotated"
        );
        if let Some(hook) = &self.on_rotate {
            hook(&event);
        }
        next
    }

    pub fn active_key_pair(&self) -> Option<KeyPair> {
        self.snapshot().active().map(|e| e.key_pair.clone())
    }

    pub fn active_public_key(&self) -> Option<VerifyingKey> {
        self.snapshot().active().map(|e| e.key_pair.verifying_key())
    }

    pub fn active_key_id(&self) -> Option<String> {
        self.snapshot().active().map(|e| e.key_id.clone())
    }

    /// When the active key was activated (Unix ms).
    pub fn active_since(&self) -> Option<u64> {
        self.snapshot().active().map(|e| e.activated_at)
    }

    /// Keys that would verify right now, active included.
    pub fn accepted_key_count(&self) -> usize {
        self.accepted_key_count_at(now_ms())
    }

    pub fn accepted_key_count_at(&self, now: u64) -> usize {
        self.snapshot()
            .entries
            .iter()
            .filter(|e| e.accepts_at(now))
            .count()
    }

    /// IDs of all held keys, active first.
    pub fn accepted_key_ids(&self) -> Vec<String> {
        self.snapshot()
            .entries
            .iter()
            .map(|e| e.key_id.clone())
            .collect()
    }

    /// Verify against the active key, then each unexpired retired key.
    ///
    /// Only Ed25519 envelopes are accepted. An empty key set rejects all.
    pub fn verify_with_rotation(&self, signed: &SignedEnvelope) -> bool {
        self.verify_with_rotation_at(signed, now_ms())
    }

    pub fn verify_with_rotation_at(&self, signed: &SignedEnvelope, now: u64) -> bool {
        if signed.scheme != SignatureScheme::Ed25519 {
            return false;
        }
        let ring = self.snapshot();
        for entry in ring.entries.iter().filter(|e| e.accepts_at(now)) {
            let key = entry.key_pair.verifying_key();
            if signed.verify(VerificationKey::Ed25519(&key)) {
                if entry.expires_at.is_some() {
                    debug!(key_id = %entry.key_id, "verified with retired key");
                }
                return true;
            }
        }
        false
    }

    /// Sign with whatever key is active.
    pub fn sign_with_active(&self, envelope: Envelope) -> Result<SignedEnvelope, TpcError> {
        let ring = self.snapshot();
        let active = ring.active().ok_or(TpcError::NoActiveKey)?;
        Ok(envelope.sign(&active.key_pair))
    }

    /// Drop retired keys whose grace period has ended. Returns how many.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(now_ms())
    }

    pub fn purge_expired_at(&self, now: u64) -> usize {
        let mut guard = self.ring.write().unwrap_or_else(PoisonError::into_inner);
        let before = guard.entries.len();
        let entries: Vec<KeyEntry> = guard
            .entries
            .iter()
            .filter(|e| e.accepts_at(now))
            .cloned()
            .collect();
        let purged = before - entries.len();
        if purged > 0 {
            *guard = Arc::new(KeyRing { entries });
            debug!(purged, "expired keys purged");
        }
        purged
    }

    /// Forget every key. Verification rejects everything afterwards.
    pub fn shutdown(&self) {
        self.swap(KeyRing::default());
        info!("key rotation manager shut down");
    }

    pub fn config(&self) -> &RotationConfig {
        &self.config
    }

    // ── Internal ───────────────────────────────────────────────────────

    fn snapshot(&self) -> Arc<KeyRing> {
        Arc::clone(&self.ring.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn swap(&self, ring: KeyRing) {
        *self.ring.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(ring);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    const GRACE: u64 = 10_000;

    fn manager() -> KeyRotationManager {
        KeyRotationManager::new(RotationConfig::new().grace_period_ms(GRACE))
    }

    fn signed_by(kp: &KeyPair) -> SignedEnvelope {
        Envelope::new("payload", "a", "b").sign(kp)
    }

    #[test]
    fn init_activates_given_key() {
        let m = manager();
        let kp = KeyPair::from_seed(&[1; 32]);
        m.init(Some(kp.clone()));
        assert_eq!(m.active_public_key(), Some(kp.verifying_key()));
        assert_eq!(m.accepted_key_count(), 1);
        assert!(m.verify_with_rotation(&signed_by(&kp)));
    }

    #[test]
    fn uninitialized_rejects_and_cannot_sign() {
        let m = manager();
        let kp = KeyPair::from_seed(&[1; 32]);
        assert!(!m.verify_with_rotation(&signed_by(&kp)));
        assert!(matches!(
            m.sign_with_active(Envelope::new("p", "a", "b")),
            Err(TpcError::NoActiveKey)
        ));
    }

    #[test]
    fn retired_key_verifies_until_grace_ends() {
        let m = manager();
        let old = m.init_at(Some(KeyPair::from_seed(&[1; 32])), 0);
        let signed = signed_by(&old);

        m.rotate_at(1_000);
        assert_eq!(m.accepted_key_count_at(1_000), 2);
        assert!(m.verify_with_rotation_at(&signed, 1_000 + GRACE - 1));
        assert!(!m.verify_with_rotation_at(&signed, 1_000 + GRACE));
        assert_eq!(m.accepted_key_count_at(1_000 + GRACE), 1);
    }

    #[test]
    fn new_key_signs_after_rotation() {
        let m = manager();
        m.init_at(None, 0);
        let new = m.rotate_at(5);
        assert_eq!(m.active_public_key(), Some(new.verifying_key()));
        assert_eq!(m.active_since(), Some(5));
        let signed = m.sign_with_active(Envelope::new("p", "a", "b")).unwrap();
        assert!(signed.verify(VerificationKey::Ed25519(&new.verifying_key())));
        assert!(m.verify_with_rotation_at(&signed, 5));
    }

    #[test]
    fn back_to_back_rotations_use_own_retirement_time() {
        let m = manager();
        let k1 = m.init_at(None, 0);
        let k2 = m.rotate_at(1_000);
        m.rotate_at(4_000);

        let s1 = signed_by(&k1);
        let s2 = signed_by(&k2);
        // k1 retired at 1_000, k2 retired at 4_000.
        assert!(!m.verify_with_rotation_at(&s1, 1_000 + GRACE));
        assert!(m.verify_with_rotation_at(&s2, 1_000 + GRACE));
        assert!(m.verify_with_rotation_at(&s2, 4_000 + GRACE - 1));
        assert!(!m.verify_with_rotation_at(&s2, 4_000 + GRACE));
        assert_eq!(m.accepted_key_ids().len(), 3);
    }

    #[test]
    fn rotation_purges_long_expired_keys() {
        let m = manager();
        m.init_at(None, 0);
        m.rotate_at(1);
        m.rotate_at(1 + GRACE + 1);
        assert_eq!(m.accepted_key_ids().len(), 2);
    }

    #[test]
    fn purge_expired_reports_count() {
        let m = manager();
        m.init_at(None, 0);
        m.rotate_at(0);
        assert_eq!(m.purge_expired_at(GRACE - 1), 0);
        assert_eq!(m.purge_expired_at(GRACE), 1);
        assert_eq!(m.accepted_key_ids().len(), 1);
    }

    #[test]
    fn shutdown_rejects_everything() {
        let m = manager();
        let kp = m.init(None);
        m.shutdown();
        assert_eq!(m.accepted_key_count(), 0);
        assert!(m.active_public_key().is_none());
        assert!(!m.verify_with_rotation(&signed_by(&kp)));
    }

    #[test]
    fn hmac_envelopes_not_accepted() {
        let m = manager();
        m.init(None);
        let signed = Envelope::new("p", "a", "b").sign_hmac(b"k").unwrap();
        assert!(!m.verify_with_rotation(&signed));
    }

    #[test]
    fn on_rotate_fires_with_ids() {
        let seen: Arc<Mutex<Vec<RotationEvent>>> = Arc::default();
        let sink = Arc::clone(&seen);
        let m = manager().on_rotate(move |e| sink.lock().unwrap().push(e.clone()));

        let first = m.init_at(None, 0);
        let second = m.rotate_at(100);

        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].new_key_id, second.key_id());
        assert_eq!(events[0].previous_key_id.as_deref(), Some(first.key_id().as_str()));
        assert_eq!(events[0].previous_expires_at, Some(100 + GRACE));
    }

    #[test]
    fn concurrent_verify_during_rotation_never_sees_empty_set() {
        let m = Arc::new(manager());
        let kp = m.init(None);
        let signed = signed_by(&kp);

        let rotator = {
            let m = Arc::clone(&m);
            std::thread::spawn(move || {
                for _ in 0..50 {
                    m.rotate();
                }
            })
        };
        for _ in 0..200 {
            assert!(m.accepted_key_count() >= 1);
        }
        rotator.join().unwrap();
        // Original key retired well inside the grace period.
        assert!(m.verify_with_rotation(&signed));
    }
}
