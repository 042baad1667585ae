//! Per-device liveness tracking.
//!
//! ```text
//! device/
//! ├── session.rs   - DeviceSession record and its transition rules
//! └── registry.rs  - shared table of tracked devices, watch/broadcast fan-out
//! ```
//!
//! A device starts `Offline` and only becomes `Online` when it says so on its status
//! topic. Its session flag (`Active`/`Inactive`) is only meaningful while it is online.

pub mod registry;
pub mod session;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RelayError;
use crate::mqtt::topics::Channel;

pub use registry::DeviceRegistry;
pub use session::{
    ActivityState, ConnectionStatus, DeviceSession, DeviceState, Transition, TransitionCause,
};

/// Identifier of one physical eraser unit, used to namespace its topics
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Checks that the id forms exactly one topic level with no wildcards
    pub fn validate(&self) -> Result<(), RelayError> {
        let reason = if self.0.is_empty() {
            "empty"
        } else if self.0.contains(['+', '#']) {
            "contains an MQTT wildcard"
        } else if self.0.contains('/') {
            "contains a topic level separator"
        } else if self.0.contains('\0') {
            "contains a NUL character"
        } else {
            return Ok(());
        };
        Err(RelayError::InvalidDeviceId {
            id: self.0.clone(),
            reason,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `eraser_<id>/<channel>`
    pub fn topic(&self, channel: Channel) -> String {
        crate::mqtt::topics::topic_for(self, channel)
    }

    /// Topics the relay listens on for this device (everything but `command`)
    pub fn telemetry_topics(&self) -> Vec<String> {
        Channel::TELEMETRY
            .iter()
            .map(|channel| self.topic(*channel))
            .collect()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DeviceId {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = Self::new(s.trim());
        id.validate()?;
        Ok(id)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<u32> for DeviceId {
    fn from(id: u32) -> Self {
        Self(id.to_string())
    }
}
