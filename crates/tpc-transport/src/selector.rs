/// Transport profile selection.
///
/// Picks the physical mode once, caches the decision on disk, and only
/// re-probes when the cache is stale or a re-probe is forced. A failed or
/// unreachable probe degrades to `file` mode; it never claims ultrasonic
/// support it could not measure.
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::SelectorConfig;
use crate::error::TpcTransportError;
use crate::probe::{CommandProbe, HardwareProbe};
use crate::profile::{HardwareProfile, TransportMode};
use crate::now_ms;

/// On-disk cache entry: `{profile, timestamp}` with epoch-ms timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedProfile {
    pub profile: HardwareProfile,
    pub timestamp: u64,
}

/// Chooses which transport mode to use and with which parameters.
pub struct ProfileSelector {
    config: SelectorConfig,
    probe: Arc<dyn HardwareProbe>,
}

impl ProfileSelector {
    pub fn new(config: SelectorConfig, probe: Arc<dyn HardwareProbe>) -> Self {
        Self { config, probe }
    }

    /// Selector backed by the subprocess probe named in the config.
    pub fn with_command_probe(config: SelectorConfig) -> Self {
        let probe = Arc::new(CommandProbe::from_config(&config));
        Self::new(config, probe)
    }

    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    /// Return the cached profile if fresh, otherwise probe and persist.
    pub async fn select_profile(&self, force_reprobe: bool) -> HardwareProfile {
        self.select_profile_at(force_reprobe, now_ms()).await
    }

    pub async fn select_profile_at(&self, force_reprobe: bool, now: u64) -> HardwareProfile {
        if !force_reprobe {
            if let Some(profile) = self.cached_profile_at(now) {
                debug!(mode = %profile.selected_mode, "using cached hardware profile");
                return profile;
            }
        }

        let profile = self.probe_profile().await;

        if let Err(e) = self.write_cache(&profile, now) {
            warn!(error = %e, "failed to persist hardware profile");
        }
        profile
    }

    /// The cached profile, if present, readable and younger than the max age.
    pub fn cached_profile_at(&self, now: u64) -> Option<HardwareProfile> {
        let cached = match self.read_cache() {
            Ok(Some(cached)) => cached,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "ignoring unreadable hardware profile cache");
                return None;
            }
        };

        if cached.timestamp > now {
            debug!("hardware profile cache is from the future, re-probing");
            return None;
        }
        if now - cached.timestamp >= self.config.max_cache_age_ms {
            debug!(age_ms = now - cached.timestamp, "hardware profile cache is stale");
            return None;
        }
        Some(cached.profile)
    }

    /// Delete the cache file. No-op if absent.
    pub fn invalidate_cache(&self) -> Result<(), TpcTransportError> {
        let path = &self.config.cache_path;
        match fs::remove_file(path) {
            Ok(()) => {
                info!(path = %path.display(), "hardware profile cache invalidated");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(TpcTransportError::CacheIo {
                path: path.clone(),
                source,
            }),
        }
    }

    /// Whether the probe tool itself is reachable, independent of selection.
    pub async fn check_audio_devices(&self) -> bool {
        self.probe.is_reachable().await
    }

    // ── Internal ───────────────────────────────────────────────────────

    async fn probe_profile(&self) -> HardwareProfile {
        let timeout = self.config.probe_timeout();
        let outcome = match tokio::time::timeout(timeout, self.probe.measure()).await {
            Ok(result) => result,
            Err(_) => Err(TpcTransportError::ProbeTimeout(timeout)),
        };

        match outcome {
            Ok(m) => {
                info!(
                    snr_db = m.snr_db,
                    packet_error_rate = m.packet_error_rate,
                    "ultrasonic hardware detected"
                );
                HardwareProfile {
                    ultrasonic_supported: true,
                    selected_mode: TransportMode::Ultrasonic,
                    carrier_frequencies: m.carrier_frequencies,
                    snr_db: m.snr_db,
                    packet_error_rate: m.packet_error_rate,
                }
            }
            Err(e) => {
                warn!(error = %e, "hardware probe failed, falling back to file transport");
                HardwareProfile::file_fallback()
            }
        }
    }

    fn read_cache(&self) -> Result<Option<CachedProfile>, TpcTransportError> {
        let path = &self.config.cache_path;
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(TpcTransportError::CacheIo {
                    path: path.clone(),
                    source,
                })
            }
        };
        serde_json::from_slice(&data)
            .map(Some)
            .map_err(TpcTransportError::CacheFormat)
    }

    fn write_cache(&self, profile: &HardwareProfile, now: u64) -> Result<(), TpcTransportError> {
        let path = &self.config.cache_path;
        let entry = CachedProfile {
            profile: profile.clone(),
            timestamp: now,
        };
        let json = serde_json::to_vec_pretty(&entry).map_err(TpcTransportError::CacheFormat)?;

        write_atomic(path, &json).map_err(|source| TpcTransportError::CacheIo {
            path: path.clone(),
            source,
        })?;
        debug!(path = %path.display(), mode = %profile.selected_mode, "hardware profile cached");
        Ok(())
    }
}

/// Write through a uniquely named sibling temp file so readers never see
/// a torn cache and concurrent writers never share a temp path.
fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeMeasurement;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const T0: u64 = 1_700_000_000_000;
    const DAY_MS: u64 = 24 * 60 * 60 * 1000;

    /// Fake probe with a fixed answer and a call counter.
    struct FakeProbe {
        available: bool,
        calls: AtomicUsize,
    }

    impl FakeProbe {
        fn new(available: bool) -> Arc<Self> {
            Arc::new(Self {
                available,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl HardwareProbe for FakeProbe {
        async fn measure(&self) -> Result<ProbeMeasurement, TpcTransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.available {
                Ok(ProbeMeasurement {
                    snr_db: 24.0,
                    packet_error_rate: 0.01,
                    carrier_frequencies: vec![18_000, 20_000],
                })
            } else {
                Err(TpcTransportError::ProbeUnavailable("fake".into()))
            }
        }

        async fn is_reachable(&self) -> bool {
            self.available
        }
    }

    /// Probe that never answers.
    struct HangingProbe;

    #[async_trait::async_trait]
    impl HardwareProbe for HangingProbe {
        async fn measure(&self) -> Result<ProbeMeasurement, TpcTransportError> {
            std::future::pending().await
        }

        async fn is_reachable(&self) -> bool {
            true
        }
    }

    fn selector(dir: &Path, probe: Arc<dyn HardwareProbe>) -> ProfileSelector {
        let config = SelectorConfig::new()
            .cache_path(dir.join("hardware-profile.json"))
            .probe_timeout_ms(200);
        ProfileSelector::new(config, probe)
    }

    #[tokio::test]
    async fn probe_success_selects_ultrasonic() {
        let dir = tempfile::tempdir().unwrap();
        let probe = FakeProbe::new(true);
        let sel = selector(dir.path(), probe.clone());

        let profile = sel.select_profile_at(false, T0).await;
        assert_eq!(profile.selected_mode, TransportMode::Ultrasonic);
        assert!(profile.ultrasonic_supported);
        assert_eq!(probe.calls(), 1);
    }

    #[tokio::test]
    async fn fresh_cache_skips_probe() {
        let dir = tempfile::tempdir().unwrap();
        let probe = FakeProbe::new(true);
        let sel = selector(dir.path(), probe.clone());

        let first = sel.select_profile_at(false, T0).await;
        let second = sel.select_profile_at(false, T0 + 1_000).await;
        assert_eq!(first, second);
        assert_eq!(probe.calls(), 1);
    }

    #[tokio::test]
    async fn stale_cache_triggers_reprobe() {
        let dir = tempfile::tempdir().unwrap();
        let probe = FakeProbe::new(true);
        let sel = selector(dir.path(), probe.clone());

        sel.select_profile_at(false, T0).await;
        sel.select_profile_at(false, T0 + DAY_MS + 1).await;
        assert_eq!(probe.calls(), 2);
    }

    #[tokio::test]
    async fn force_reprobe_bypasses_cache() {
        let dir = tempfile::tempdir().unwrap();
        let probe = FakeProbe::new(true);
        let sel = selector(dir.path(), probe.clone());

        sel.select_profile_at(false, T0).await;
        sel.select_profile_at(true, T0 + 1).await;
        assert_eq!(probe.calls(), 2);
    }

    #[tokio::test]
    async fn unavailable_probe_falls_back_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let sel = selector(dir.path(), FakeProbe::new(false));

        let profile = sel.select_profile_at(false, T0).await;
        assert_eq!(profile.selected_mode, TransportMode::File);
        assert!(!profile.ultrasonic_supported);

        let raw = fs::read(dir.path().join("hardware-profile.json")).unwrap();
        let cached: CachedProfile = serde_json::from_slice(&raw).unwrap();
        assert_eq!(cached.timestamp, T0);
        assert_eq!(cached.profile.selected_mode, TransportMode::File);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_selections_all_persist() {
        let dir = tempfile::tempdir().unwrap();
        let sel = Arc::new(selector(dir.path(), FakeProbe::new(true)));

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let sel = Arc::clone(&sel);
                tokio::spawn(async move { sel.select_profile_at(true, T0 + i).await })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap().selected_mode, TransportMode::Ultrasonic);
        }

        let raw = fs::read(dir.path().join("hardware-profile.json")).unwrap();
        let cached: CachedProfile = serde_json::from_slice(&raw).unwrap();
        assert!(cached.timestamp >= T0 && cached.timestamp < T0 + 8);
        // No temp files left behind.
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn hanging_probe_times_out_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let sel = selector(dir.path(), Arc::new(HangingProbe));

        let profile = sel.select_profile_at(false, T0).await;
        assert_eq!(profile.selected_mode, TransportMode::File);
    }

    #[tokio::test]
    async fn corrupt_cache_is_reprobed() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("hardware-profile.json"), b"{not json").unwrap();
        let probe = FakeProbe::new(true);
        let sel = selector(dir.path(), probe.clone());

        let profile = sel.select_profile_at(false, T0).await;
        assert_eq!(profile.selected_mode, TransportMode::Ultrasonic);
        assert_eq!(probe.calls(), 1);
    }

    #[tokio::test]
    async fn invalidate_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let sel = selector(dir.path(), FakeProbe::new(true));

        sel.invalidate_cache().unwrap();
        sel.select_profile_at(false, T0).await;
        assert!(sel.cached_profile_at(T0).is_some());

        sel.invalidate_cache().unwrap();
        assert!(sel.cached_profile_at(T0).is_none());
        sel.invalidate_cache().unwrap();
    }

    #[tokio::test]
    async fn check_audio_devices_reports_probe_reachability() {
        let dir = tempfile::tempdir().unwrap();
        assert!(selector(dir.path(), FakeProbe::new(true)).check_audio_devices().await);
        assert!(!selector(dir.path(), FakeProbe::new(false)).check_audio_devices().await);
    }
}
