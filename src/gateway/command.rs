use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::device::DeviceId;
use crate::error::CommandError;

/// Everything an eraser unit understands
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verb {
    Forward,
    Backward,
    Left,
    Right,
    Stop,
    StartSequence,
    Capture,
    Erase,
    CaptureErase,
    On,
    Off,
}

impl Verb {
    pub const ALL: [Verb; 11] = [
        Verb::Forward,
        Verb::Backward,
        Verb::Left,
        Verb::Right,
        Verb::Stop,
        Verb::StartSequence,
        Verb::Capture,
        Verb::Erase,
        Verb::CaptureErase,
        Verb::On,
        Verb::Off,
    ];

    /// Wire form, published as the command payload
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Forward => "forward",
            Verb::Backward => "backward",
            Verb::Left => "left",
            Verb::Right => "right",
            Verb::Stop => "stop",
            Verb::StartSequence => "start_sequence",
            Verb::Capture => "capture",
            Verb::Erase => "erase",
            Verb::CaptureErase => "capture_erase",
            Verb::On => "on",
            Verb::Off => "off",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verb {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        Verb::ALL
            .into_iter()
            .find(|verb| verb.as_str() == wanted)
            .ok_or_else(|| CommandError::UnknownVerb(s.to_string()))
    }
}

/// One command on its way to a device
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    pub device_id: DeviceId,
    pub verb: Verb,
    pub issued_at: DateTime<Utc>,
}

impl Command {
    pub fn new(device_id: DeviceId, verb: Verb) -> Self {
        Self {
            device_id,
            verb,
            issued_at: Utc::now(),
        }
    }
}

/// What a device answered. `success` is `None` when the answer was not JSON.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub success: Option<bool>,
    pub message: String,
}

impl fmt::Display for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.success {
            Some(true) => write!(f, "ok: {}", self.message),
            Some(false) => write!(f, "failed: {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}
