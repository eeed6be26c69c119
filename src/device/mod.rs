//! Serial device subsystem
//!
//! Finds the IR transmitter among the system serial ports and owns the one
//! open connection to it.
//!
//! 1. [`locator`] - one-time discovery by manufacturer string
//! 2. [`channel`] - the open serial link, written once per command

pub mod channel;
pub mod locator;

pub use channel::{DeviceChannel, SerialChannel, SerialSettings};
pub use locator::{DeviceLocator, PortCandidate};

/// Errors of the serial device subsystem
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// No enumerated port carries the expected manufacturer marker
    #[error("Device not found: no serial port with manufacturer containing {marker:?}")]
    NotFound { marker: String },

    /// Listing the system serial ports failed
    #[error("Failed to enumerate serial ports: {0}")]
    Enumeration(String),

    /// Opening the port failed
    #[error("Failed to open serial port {port}: {reason}")]
    Open { port: String, reason: String },

    /// The transport rejected or timed out a write
    #[error("Failed to write to serial port {port}: {source}")]
    Write {
        port: String,
        #[source]
        source: std::io::Error,
    },

    /// Write attempted after the channel was closed
    #[error("Serial port {port} is closed")]
    Closed { port: String },
}
