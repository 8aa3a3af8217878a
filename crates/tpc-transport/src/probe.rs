use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::config::SelectorConfig;
use crate::error::TpcTransportError;
use crate::profile::ULTRASONIC_CARRIERS;

/// Measurements reported by a successful hardware probe.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeMeasurement {
    pub snr_db: f64,
    pub packet_error_rate: f64,
    pub carrier_frequencies: Vec<u32>,
}

/// Collaborator that measures ultrasonic-capable audio hardware.
///
/// In production: [`CommandProbe`] (external subprocess).
/// In tests: any fake that returns canned measurements.
#[async_trait::async_trait]
pub trait HardwareProbe: Send + Sync {
    /// Run a measurement pass. Any error degrades selection to `file` mode.
    async fn measure(&self) -> Result<ProbeMeasurement, TpcTransportError>;

    /// Whether the probe tool itself can be reached.
    async fn is_reachable(&self) -> bool;
}

/// JSON report printed by the probe executable on stdout.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProbeReport {
    available: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    snr_db: Option<f64>,
    #[serde(default)]
    packet_error_rate: Option<f64>,
    #[serde(default)]
    carrier_frequencies: Option<Vec<u32>>,
}

impl ProbeReport {
    fn into_measurement(self) -> Result<ProbeMeasurement, TpcTransportError> {
        if !self.available {
            let reason = self.error.unwrap_or_else(|| "probe reported unavailable".into());
            return Err(TpcTransportError::ProbeUnavailable(reason));
        }
        match (self.snr_db, self.packet_error_rate) {
            (Some(snr_db), Some(packet_error_rate)) => Ok(ProbeMeasurement {
                snr_db,
                packet_error_rate,
                carrier_frequencies: self
                    .carrier_frequencies
                    .unwrap_or_else(|| ULTRASONIC_CARRIERS.to_vec()),
            }),
            _ => Err(TpcTransportError::ProbeUnavailable(
                "probe report missing snrDb/packetErrorRate".into(),
            )),
        }
    }
}

/// Hardware probe run as a subprocess.
///
/// The child is killed when the timeout fires, so a wedged audio stack
/// can never hang the caller.
#[derive(Debug, Clone)]
pub struct CommandProbe {
    program: PathBuf,
    measure_args: Vec<String>,
    check_args: Vec<String>,
    timeout: Duration,
}

impl CommandProbe {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        let frequencies = ULTRASONIC_CARRIERS
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        Self {
            program: program.into(),
            measure_args: vec![
                "--measure".into(),
                "--json".into(),
                format!("--frequencies={frequencies}"),
            ],
            check_args: vec!["--version".into()],
            timeout: Duration::from_secs(10),
        }
    }

    /// Probe configured from a [`SelectorConfig`].
    pub fn from_config(config: &SelectorConfig) -> Self {
        Self::new(config.get_probe_program()).timeout(config.probe_timeout())
    }

    /// Arguments for a measurement run.
    pub fn measure_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.measure_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Arguments for the reachability check.
    pub fn check_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.check_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait::async_trait]
impl HardwareProbe for CommandProbe {
    async fn measure(&self) -> Result<ProbeMeasurement, TpcTransportError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.measure_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| TpcTransportError::ProbeTimeout(self.timeout))?
            .map_err(|e| {
                TpcTransportError::ProbeUnavailable(format!(
                    "cannot run {}: {e}",
                    self.program.display()
                ))
            })?;

        debug!(
            program = %self.program.display(),
            status = ?output.status.code(),
            "hardware probe finished"
        );

        let report: ProbeReport = serde_json::from_slice(&output.stdout).map_err(|e| {
            let stderr = String::from_utf8_lossy(&output.stderr);
            TpcTransportError::ProbeUnavailable(format!(
                "unreadable probe output ({e}): {}",
                stderr.trim()
            ))
        })?;
        report.into_measurement()
    }

    async fn is_reachable(&self) -> bool {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.check_args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        match tokio::time::timeout(self.timeout, cmd.status()).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                debug!(program = %self.program.display(), error = %e, "probe not reachable");
                false
            }
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_success_maps_to_measurement() {
        let report: ProbeReport = serde_json::from_str(
            r#"{"available": true, "snrDb": 21.5, "packetErrorRate": 0.02}"#,
        )
        .unwrap();
        let m = report.into_measurement().unwrap();
        assert_eq!(m.snr_db, 21.5);
        assert_eq!(m.carrier_frequencies, ULTRASONIC_CARRIERS.to_vec());
    }

    #[test]
    fn report_unavailable_carries_error() {
        let report: ProbeReport =
            serde_json::from_str(r#"{"available": false, "error": "no mic"}"#).unwrap();
        match report.into_measurement() {
            Err(TpcTransportError::ProbeUnavailable(reason)) => assert_eq!(reason, "no mic"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn report_missing_measurements_is_unavailable() {
        let report: ProbeReport = serde_json::from_str(r#"{"available": true}"#).unwrap();
        assert!(report.into_measurement().is_err());
    }

    #[tokio::test]
    async fn missing_binary_is_unavailable() {
        let probe = CommandProbe::new("/nonexistent/tpc-hwprobe");
        assert!(matches!(
            probe.measure().await,
            Err(TpcTransportError::ProbeUnavailable(_))
        ));
        assert!(!probe.is_reachable().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn parses_subprocess_report() {
        let probe = CommandProbe::new("sh").measure_args([
            "-c",
            r#"echo '{"available":true,"snrDb":30.0,"packetErrorRate":0.001,"carrierFrequencies":[18000,20000]}'"#,
        ]);
        let m = probe.measure().await.unwrap();
        assert_eq!(m.snr_db, 30.0);
        assert_eq!(m.carrier_frequencies, vec![18_000, 20_000]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_probe_times_out() {
        let probe = CommandProbe::new("sh")
            .measure_args(["-c", "sleep 5"])
            .timeout(Duration::from_millis(100));
        assert!(matches!(
            probe.measure().await,
            Err(TpcTransportError::ProbeTimeout(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn reachable_when_check_succeeds() {
        let probe = CommandProbe::new("sh").check_args(["-c", "exit 0"]);
        assert!(probe.is_reachable().await);
    }
}
