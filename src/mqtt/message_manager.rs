//! Inbound IR command messages and their translation to device writes
//!
//! Every publish on the command topic goes through [`MessageHandler::handle`],
//! the one place where per-message failures end. A malformed payload, an
//! unknown code or a failed serial write is logged and dropped; the broker
//! session keeps running either way.

use rumqttc::Publish;
use serde::Deserialize;
use std::fmt;
use tracing::{debug, error, info};

use crate::codes::{CodeError, CodeResolver};
use crate::device::{DeviceChannel, DeviceError};

const PREVIEW_CHARS: usize = 64;

/// A publish received on the command topic
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Shortened, lossy text form of the payload for logs
    pub fn preview(&self) -> String {
        let text = String::from_utf8_lossy(&self.payload);
        if text.chars().count() > PREVIEW_CHARS {
            let cut: String = text.chars().take(PREVIEW_CHARS).collect();
            format!("{cut}...")
        } else {
            text.into_owned()
        }
    }
}

impl From<Publish> for InboundMessage {
    fn from(publish: Publish) -> Self {
        Self {
            topic: publish.topic,
            payload: publish.payload.to_vec(),
        }
    }
}

impl fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.topic, self.preview())
    }
}

/// JSON body of a command message; other fields are ignored
#[derive(Debug, Deserialize, PartialEq, Eq)]
pub struct IrCommand {
    pub codes: Vec<String>,
}

impl IrCommand {
    pub fn parse(payload: &[u8]) -> Result<Self, HandlerError> {
        let text = std::str::from_utf8(payload)
            .map_err(|e| HandlerError::MalformedPayload(format!("payload is not UTF-8: {e}")))?;
        serde_json::from_str(text).map_err(|e| HandlerError::MalformedPayload(e.to_string()))
    }
}

/// Per-message failures, all recovered at the handler boundary
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error(transparent)]
    InvalidCode(#[from] CodeError),

    #[error("Device write failure: {0}")]
    DeviceWrite(#[from] DeviceError),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HandlerStats {
    pub forwarded: usize,
    pub dropped: usize,
}

/// Translates command messages and forwards them to the device
pub struct MessageHandler<D: DeviceChannel> {
    resolver: CodeResolver,
    device: D,
    stats: HandlerStats,
}

impl<D: DeviceChannel> MessageHandler<D> {
    pub fn new(resolver: CodeResolver, device: D) -> Self {
        Self {
            resolver,
            device,
            stats: HandlerStats::default(),
        }
    }

    /// Handles one message; errors are logged and never returned
    pub fn handle(&mut self, message: &InboundMessage) {
        info!("Message received {}", message);

        match self.try_handle(&message.payload) {
            Ok(command) => {
                self.stats.forwarded += 1;
                debug!("Forwarded {:?} from {}", command, message.topic);
            }
            Err(e) => {
                self.stats.dropped += 1;
                error!(
                    "Dropping message on {} ({:?}): {}",
                    message.topic,
                    message.preview(),
                    e
                );
            }
        }
    }

    /// Decodes, resolves and writes one payload, returning the command string sent
    pub fn try_handle(&mut self, payload: &[u8]) -> Result<String, HandlerError> {
        let command = IrCommand::parse(payload)?;
        let command_string = self.resolver.command_string(&command.codes)?;
        self.device.write(command_string.as_bytes())?;
        Ok(command_string)
    }

    pub fn stats(&self) -> &HandlerStats {
        &self.stats
    }

    /// Closes the device; the handler forwards nothing afterwards
    pub fn close(&mut self) {
        self.device.close();
    }
}
