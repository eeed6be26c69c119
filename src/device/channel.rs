//! Device channel over a serial port
//!
//! The channel is the single owner of the open port. Writes are bounded by the
//! port timeout so a stuck device cannot stall the dispatch loop forever.

use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::Write;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::DeviceError;

/// Baud rate the transmitter firmware listens on
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Upper bound for a single serial write
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// Sink for command strings
pub trait DeviceChannel: Send {
    /// Writes the bytes in full or reports why it could not
    fn write(&mut self, bytes: &[u8]) -> Result<(), DeviceError>;

    /// Releases the underlying transport; further calls are no-ops
    fn close(&mut self);
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SerialSettings {
    pub baud_rate: u32,
    pub timeout: Duration,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }
}

pub struct SerialChannel {
    port_name: String,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialChannel {
    /// Opens the port for the session
    ///
    /// Some USB serial drivers keep stale state after the first open, so the
    /// port is opened, closed again and then reopened for good.
    pub fn open(port_name: &str, settings: &SerialSettings) -> Result<Self, DeviceError> {
        info!(
            "Opening serial device {} at {} baud (timeout {:?})",
            port_name, settings.baud_rate, settings.timeout
        );

        let first = Self::open_port(port_name, settings)?;
        drop(first);
        debug!("Closed {} after first open to flush driver state", port_name);

        let port = Self::open_port(port_name, settings)?;
        info!("Serial device {} ready", port_name);

        Ok(Self {
            port_name: port_name.to_string(),
            port: Some(port),
        })
    }

    fn open_port(
        port_name: &str,
        settings: &SerialSettings,
    ) -> Result<Box<dyn SerialPort>, DeviceError> {
        serialport::new(port_name, settings.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(settings.timeout)
            .open()
            .map_err(|e| DeviceError::Open {
                port: port_name.to_string(),
                reason: e.to_string(),
            })
    }
}

impl DeviceChannel for SerialChannel {
    fn write(&mut self, bytes: &[u8]) -> Result<(), DeviceError> {
        let port = self.port.as_mut().ok_or_else(|| DeviceError::Closed {
            port: self.port_name.clone(),
        })?;

        port.write_all(bytes)
            .and_then(|_| port.flush())
            .map_err(|source| DeviceError::Write {
                port: self.port_name.clone(),
                source,
            })?;

        debug!("Wrote {} bytes to {}", bytes.len(), self.port_name);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(mut port) = self.port.take() {
            if let Err(e) = port.flush() {
                warn!("Flushing {} before close failed: {}", self.port_name, e);
            }
            drop(port);
            info!("Closed serial device {}", self.port_name);
        }
    }
}

impl Drop for SerialChannel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_match_firmware() {
        let settings = SerialSettings::default();
        assert_eq!(settings.baud_rate, 115_200);
        assert_eq!(settings.timeout, Duration::from_secs(1));
    }

    #[test]
    fn opening_missing_port_fails() {
        let result = SerialChannel::open("/dev/does-not-exist-mqtt2nec", &SerialSettings::default());
        match result {
            Err(DeviceError::Open { port, .. }) => assert_eq!(port, "/dev/does-not-exist-mqtt2nec"),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("opened a port that does not exist"),
        }
    }

    #[test]
    fn closed_channel_rejects_writes() {
        let mut channel = SerialChannel {
            port_name: "test".to_string(),
            port: None,
        };
        channel.close();
        assert!(matches!(
            channel.write(b"1;2"),
            Err(DeviceError::Closed { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn writes_reach_the_port_and_close_releases_it() {
        use serialport::TTYPort;
        use std::io::Read;

        let (mut master, slave) = TTYPort::pair().expect("pseudo terminal pair");
        master.set_timeout(Duration::from_secs(1)).unwrap();
        let name = slave.name().expect("slave port name");

        let mut channel = SerialChannel::open(&name, &SerialSettings::default()).unwrap();
        channel.write(b"1;2").unwrap();

        let mut received = [0u8; 3];
        master.read_exact(&mut received).unwrap();
        assert_eq!(&received, b"1;2");

        channel.close();
        channel.close();
        assert!(matches!(
            channel.write(b"3"),
            Err(DeviceError::Closed { port }) if port == name
        ));

        // Dropping an open channel releases the exclusive lock
        let reopened = SerialChannel::open(&name, &SerialSettings::default()).unwrap();
        drop(reopened);
        let mut again = SerialChannel::open(&name, &SerialSettings::default()).unwrap();
        again.write(b"4").unwrap();
        let mut byte = [0u8; 1];
        master.read_exact(&mut byte).unwrap();
        assert_eq!(&byte, b"4");
    }
}
