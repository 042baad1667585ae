//! # MQTT Integration Module
//!
//! Everything that touches the broker.
//!
//! ```text
//! mqtt/
//! ├── connection.rs  - connection task state machine, reconnect, publish/subscribe
//! ├── message.rs     - raw broker message as received
//! └── topics.rs      - eraser topic scheme and typed payload decoding
//! ```
//!
//! The connection layer knows nothing about devices; it hands raw messages to a
//! [`connection::TransportListener`]. [`topics::route`] turns those into per-device events.

pub mod connection;
pub mod message;
pub mod topics;
