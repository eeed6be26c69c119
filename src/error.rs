//! Fatal startup and session errors

use crate::config::ConfigError;
use crate::device::DeviceError;
use crate::mqtt::mqtt_handler::SessionError;

/// Errors that end the process
///
/// Per-message failures never show up here; they stop at the message handler.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Broker error: {0}")]
    Session(#[from] SessionError),
}

impl BridgeError {
    /// Process exit status for this failure
    pub fn exit_code(&self) -> u8 {
        match self {
            BridgeError::Config(_) => 2,
            BridgeError::Device(_) => 3,
            BridgeError::Session(_) => 4,
        }
    }
}
