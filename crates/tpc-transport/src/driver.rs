use crate::profile::{ModulationParams, TransportMode};

/// Byte-level transmission, implemented outside this crate.
///
/// The acoustic modem (AFSK modulation on a speaker) and the dead-drop
/// file writer both sit behind this trait. TPC only decides whether to
/// send, with which parameters, and how the frame is authenticated.
#[async_trait::async_trait]
pub trait TransportDriver: Send + Sync {
    /// Transmit one encoded frame using `mode` and `params`.
    async fn transmit(
        &self,
        frame: &[u8],
        mode: TransportMode,
        params: &ModulationParams,
    ) -> Result<(), String>;
}
