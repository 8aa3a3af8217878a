/// Transport modes and their fixed modulation parameters.
///
/// Parameters are constants, never computed: the selector only decides
/// *which* mode to use, the external driver does the modulation.
use serde::{Deserialize, Serialize};
use std::fmt;

/// Physical channel used to move a signed envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Near-inaudible AFSK (18/20 kHz).
    Ultrasonic,
    /// Bell-202 compatible AFSK.
    Audible,
    /// Dead-drop file exchange, no acoustic path.
    File,
    /// Let the selector decide.
    Auto,
}

impl TransportMode {
    /// Whether this mode goes over a speaker/microphone pair.
    ///
    /// Only acoustic modes are guarded by the circuit breaker.
    pub fn is_acoustic(&self) -> bool {
        matches!(self, TransportMode::Ultrasonic | TransportMode::Audible)
    }

    /// Modulation parameters for this mode.
    pub fn params(&self) -> ModulationParams {
        match self {
            TransportMode::Ultrasonic => ULTRASONIC_PARAMS,
            TransportMode::Audible => AUDIBLE_PARAMS,
            TransportMode::File | TransportMode::Auto => DEFAULT_PARAMS,
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportMode::Ultrasonic => write!(f, "ultrasonic"),
            TransportMode::Audible => write!(f, "audible"),
            TransportMode::File => write!(f, "file"),
            TransportMode::Auto => write!(f, "auto"),
        }
    }
}

/// Two-tone AFSK parameters handed to the transport driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModulationParams {
    /// Tone for a `0` bit (Hz).
    pub space_hz: u32,
    /// Tone for a `1` bit (Hz).
    pub mark_hz: u32,
    /// Sample rate (Hz).
    pub sample_rate: u32,
    /// Symbols per second.
    pub baud: u32,
}

impl ModulationParams {
    /// Nyquist check: the sample rate must exceed twice the higher tone.
    pub fn satisfies_nyquist(&self) -> bool {
        let highest = self.space_hz.max(self.mark_hz);
        self.sample_rate > highest.saturating_mul(2)
    }
}

/// 18 kHz / 20 kHz at 48 kHz, 150 baud.
pub const ULTRASONIC_PARAMS: ModulationParams = ModulationParams {
    space_hz: 18_000,
    mark_hz: 20_000,
    sample_rate: 48_000,
    baud: 150,
};

/// Bell 202: 1200 Hz / 2400 Hz, 300 baud.
pub const AUDIBLE_PARAMS: ModulationParams = ModulationParams {
    space_hz: 1_200,
    mark_hz: 2_400,
    sample_rate: 44_100,
    baud: 300,
};

/// Bookkeeping-only parameters for `file` and `auto`.
pub const DEFAULT_PARAMS: ModulationParams = ModulationParams {
    space_hz: 1_200,
    mark_hz: 2_400,
    sample_rate: 44_100,
    baud: 150,
};

/// Candidate carrier frequencies measured by the hardware probe.
pub const ULTRASONIC_CARRIERS: [u32; 2] = [18_000, 20_000];

/// Result of transport profile selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HardwareProfile {
    pub ultrasonic_supported: bool,
    pub selected_mode: TransportMode,
    pub carrier_frequencies: Vec<u32>,
    /// Measured signal-to-noise ratio (dB). 0 when not measured.
    pub snr_db: f64,
    /// Measured packet error rate in `[0, 1]`. 1 when not measured.
    pub packet_error_rate: f64,
}

impl HardwareProfile {
    /// Profile used when no ultrasonic-capable hardware could be confirmed.
    pub fn file_fallback() -> Self {
        Self {
            ultrasonic_supported: false,
            selected_mode: TransportMode::File,
            carrier_frequencies: Vec::new(),
            snr_db: 0.0,
            packet_error_rate: 1.0,
        }
    }

    /// Modulation parameters for the selected mode.
    pub fn params(&self) -> ModulationParams {
        self.selected_mode.params()
    }
}
