//! Device discovery among the enumerated serial ports

use serialport::{SerialPortInfo, SerialPortType};
use tracing::{debug, info};

use super::DeviceError;

/// Manufacturer marker of the transmitter board
pub const DEFAULT_VENDOR_MARKER: &str = "Arduino";

/// Serial port reduced to what discovery looks at
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortCandidate {
    pub port_name: String,
    pub manufacturer: Option<String>,
}

impl From<SerialPortInfo> for PortCandidate {
    fn from(info: SerialPortInfo) -> Self {
        // Only USB ports report a manufacturer
        let manufacturer = match info.port_type {
            SerialPortType::UsbPort(usb) => usb.manufacturer,
            _ => None,
        };
        Self {
            port_name: info.port_name,
            manufacturer,
        }
    }
}

#[derive(Clone, Debug)]
pub struct DeviceLocator {
    marker: String,
}

impl Default for DeviceLocator {
    fn default() -> Self {
        Self::new(DEFAULT_VENDOR_MARKER)
    }
}

impl DeviceLocator {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
        }
    }

    /// Enumerates the system ports and returns the name of the first match
    pub fn locate(&self) -> Result<String, DeviceError> {
        let ports = serialport::available_ports()
            .map_err(|e| DeviceError::Enumeration(e.to_string()))?;
        debug!("Enumerated {} serial ports", ports.len());

        let candidates: Vec<PortCandidate> = ports.into_iter().map(PortCandidate::from).collect();
        let port = self.select(&candidates)?;
        info!("Found device on {}", port.port_name);
        Ok(port.port_name.clone())
    }

    /// Picks the first candidate whose manufacturer contains the marker (case-sensitive)
    pub fn select<'a>(&self, candidates: &'a [PortCandidate]) -> Result<&'a PortCandidate, DeviceError> {
        candidates
            .iter()
            .inspect(|c| debug!("Port {} manufacturer {:?}", c.port_name, c.manufacturer))
            .find(|c| {
                c.manufacturer
                    .as_deref()
                    .is_some_and(|m| m.contains(&self.marker))
            })
            .ok_or_else(|| DeviceError::NotFound {
                marker: self.marker.clone(),
            })
    }
}
