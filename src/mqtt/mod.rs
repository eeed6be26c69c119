//! # MQTT Integration Module
//!
//! Subscribes to the IR command topic and turns every publish into one
//! serial write.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Broker connection settings and defaults
//! ├── message_manager.rs  - Payload decoding and the per-message error boundary
//! └── mqtt_handler.rs     - Connection state machine and dispatch loop
//! ```
//!
//! ## Message Flow
//!
//! ```text
//! Broker ──► EventLoop ──► MessageHandler ──► CodeResolver ──► DeviceChannel
//!                 ▲                                                 │
//!            (reconnect)                                     "3772793023;439041101"
//! ```
//!
//! Messages are processed one at a time in arrival order. The serial link is
//! a single unsynchronised resource and interleaved writes would corrupt the
//! code sequence seen by the transmitter.

pub mod config;
pub mod message_manager;
pub mod mqtt_handler;
