//! Relay core for networked whiteboard eraser units.
//!
//! Erasers talk MQTT on `eraser_<id>/<channel>` topics. The relay keeps one broker
//! connection, tracks whether each watched eraser is online and in a session, and sends
//! commands that wait for the eraser's answer. Erasers fronted by a plain HTTP control
//! server are reached through [`gateway::HttpBridge`] instead.

pub mod config;
pub mod device;
pub mod error;
pub mod gateway;
pub mod mqtt;
pub mod relay;

pub use config::RelayConfig;
pub use device::{ConnectionStatus, DeviceId, DeviceSession, Transition};
pub use error::{CommandError, CommandFailure, RelayError};
pub use gateway::{CommandResult, Verb};
pub use relay::{DeviceWatch, Relay};
