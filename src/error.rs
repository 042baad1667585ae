//! Error types for the relay.
//!
//! Transport-level problems ([`RelayError`]) are absorbed by the relay and turned into
//! `Offline` state; only the command gateway hands errors ([`CommandError`]) back to callers.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::device::DeviceId;
use crate::gateway::CommandResult;

/// Errors raised by the connection layer and configuration handling
#[derive(Debug, Error)]
pub enum RelayError {
    /// Invalid or inconsistent configuration values
    #[error("Configuration error: {0}")]
    Config(String),

    /// Reading or writing a configuration file failed
    #[error("Config file {path} could not be accessed: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration file is not valid TOML for [`crate::config::RelayConfig`]
    #[error("Config file could not be parsed: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config could not be serialized: {0}")]
    ConfigWrite(#[from] toml::ser::Error),

    /// Transport-level failure. Never fatal, the connection task keeps retrying.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Subscribing to a topic failed; the subscription is simply absent
    #[error("Subscription to {topic} failed: {reason}")]
    Subscription { topic: String, reason: String },

    #[error("Publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },

    /// The id cannot be embedded in a topic name
    #[error("Invalid device id '{id}': {reason}")]
    InvalidDeviceId { id: String, reason: &'static str },
}

/// Errors returned by [`crate::gateway::CommandGateway`] and the HTTP bridge
#[derive(Debug, Error)]
pub enum CommandError {
    /// The device has not reported `online`; nothing was published
    #[error("Device {0} is offline")]
    DeviceOffline(DeviceId),

    #[error("Device {device} did not respond within {}ms", .timeout.as_millis())]
    Timeout { device: DeviceId, timeout: Duration },

    /// A command for this device is still waiting for its response
    #[error("Device {0} already has a command in flight")]
    Busy(DeviceId),

    /// The relay shut down while the command was waiting
    #[error("Command for device {0} was cancelled")]
    Cancelled(DeviceId),

    #[error("Unknown command verb: {0}")]
    UnknownVerb(String),

    #[error("Invalid HTTP endpoint {endpoint}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("Command failed: {0}")]
    Failed(#[from] CommandFailure),
}

/// Ways a command can fail after it left the gateway
#[derive(Debug, Error)]
pub enum CommandFailure {
    #[error("could not publish to broker: {0}")]
    Publish(#[source] RelayError),

    #[error("HTTP bridge answered {status}: {message}")]
    HttpStatus { status: u16, message: String },

    #[error("HTTP bridge request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// A `response` payload that is not the expected JSON object.
///
/// Carries the raw text so the caller still gets a result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Malformed response payload ({reason})")]
pub struct MalformedResponse {
    pub raw: String,
    pub reason: String,
}

impl MalformedResponse {
    /// Degrades to a result whose message is the raw payload and whose success is unknown
    pub fn into_fallback(self) -> CommandResult {
        CommandResult {
            success: None,
            message: self.raw,
        }
    }
}
