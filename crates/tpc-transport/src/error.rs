use std::path::PathBuf;
use std::time::Duration;

/// Errors returned by the TPC transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TpcTransportError {
    #[error("hardware probe unavailable: {0}")]
    ProbeUnavailable(String),

    #[error("hardware probe timed out after {0:?}")]
    ProbeTimeout(Duration),

    #[error("profile cache I/O on {path}: {source}")]
    CacheIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("profile cache is not valid JSON: {0}")]
    CacheFormat(#[source] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_probe_unavailable() {
        let err = TpcTransportError::ProbeUnavailable("no audio device".into());
        assert_eq!(err.to_string(), "hardware probe unavailable: no audio device");
    }

    #[test]
    fn display_probe_timeout() {
        let err = TpcTransportError::ProbeTimeout(Duration::from_secs(3));
        assert_eq!(err.to_string(), "hardware probe timed out after 3s");
    }

    #[test]
    fn display_cache_io_includes_path() {
        let err = TpcTransportError::CacheIo {
            path: PathBuf::from("/tmp/hardware-profile.json"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(err.to_string().contains("/tmp/hardware-profile.json"));
    }
}
