use tpc_transport::TransportMode;

/// Protocol-level errors for TPC.
///
/// Wraps transport errors and adds the authentication, replay and
/// admission-control variants. Signature mismatches are reported by
/// `verify*` as `false`; pipelines surface them as `VerificationFailed`
/// only after the security audit event is written.
#[derive(Debug, thiserror::Error)]
pub enum TpcError {
    #[error("transport error: {0}")]
    Transport(#[from] tpc_transport::TpcTransportError),

    #[error("malformed key material: {0}")]
    KeyFormat(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("signature verification failed for message {message_id}")]
    VerificationFailed { message_id: String },

    #[error("replay detected: {reason}")]
    ReplayDetected { reason: String },

    #[error("rate limited: agent {agent_id} exhausted its window")]
    RateLimited { agent_id: String },

    #[error("circuit open: {transport} transport refused")]
    CircuitOpen { transport: TransportMode },

    #[error("no active signing key")]
    NoActiveKey,

    #[error("{mode} transport failed: {reason}")]
    TransportFailed { mode: TransportMode, reason: String },
}

impl From<serde_json::Error> for TpcError {
    fn from(e: serde_json::Error) -> Self {
        if e.is_data() || e.is_syntax() || e.is_eof() {
            TpcError::Deserialization(e.to_string())
        } else {
            TpcError::Serialization(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_key_format() {
        let err = TpcError::KeyFormat("not a PEM block".into());
        assert_eq!(err.to_string(), "malformed key material: not a PEM block");
    }

    #[test]
    fn test_display_replay() {
        let err = TpcError::ReplayDetected {
            reason: "duplicate nonce".into(),
        };
        assert_eq!(err.to_string(), "replay detected: duplicate nonce");
    }

    #[test]
    fn test_display_rate_limited() {
        let err = TpcError::RateLimited {
            agent_id: "agent-7".into(),
        };
        assert_eq!(err.to_string(), "rate limited: agent agent-7 exhausted its window");
    }

    #[test]
    fn test_display_circuit_open() {
        let err = TpcError::CircuitOpen {
            transport: TransportMode::Ultrasonic,
        };
        assert_eq!(err.to_string(), "circuit open: ultrasonic transport refused");
    }

    #[test]
    fn test_json_syntax_maps_to_deserialization() {
        let e = serde_json::from_str::<serde_json::Value>("{oops").unwrap_err();
        assert!(matches!(TpcError::from(e), TpcError::Deserialization(_)));
    }
}
