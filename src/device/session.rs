use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::DeviceId;
use crate::gateway::CommandResult;
use crate::mqtt::topics::{SessionReport, StatusReport};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionStatus {
    Online,
    #[default]
    Offline,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub enum ActivityState {
    Active,
    #[default]
    Inactive,
}

/// The two independent flags that make up a device's observable state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub struct DeviceState {
    pub connection: ConnectionStatus,
    pub activity: ActivityState,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{:?}", self.connection, self.activity)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum TransitionCause {
    /// A message on the device's status topic
    Status,
    /// A message on the device's session topic
    Session,
    /// Broker connection lost or errored
    TransportOffline,
    /// No status message within the configured staleness window
    Stale,
}

/// A change of [`DeviceState`] for one device
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub device: DeviceId,
    pub cause: TransitionCause,
    pub previous: DeviceState,
    pub current: DeviceState,
    pub at: DateTime<Utc>,
}

/// In-memory record of one tracked device.
///
/// Lives as long as somebody watches the device. Mutated only through the relay core,
/// observers get clones.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeviceSession {
    pub device_id: DeviceId,
    pub state: DeviceState,
    /// Time of the last status message of any value
    pub last_status_at: Option<DateTime<Utc>>,
    pub last_response: Option<CommandResult>,
    pub recent_logs: VecDeque<String>,
}

impl DeviceSession {
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            state: DeviceState::default(),
            last_status_at: None,
            last_response: None,
            recent_logs: VecDeque::new(),
        }
    }

    pub fn is_online(&self) -> bool {
        self.state.connection == ConnectionStatus::Online
    }

    pub fn is_active(&self) -> bool {
        self.state.activity == ActivityState::Active
    }

    pub fn latest_log(&self) -> Option<&str> {
        self.recent_logs.back().map(String::as_str)
    }

    pub(crate) fn observe_status(
        &mut self,
        report: &StatusReport,
        at: DateTime<Utc>,
    ) -> Option<Transition> {
        self.last_status_at = Some(at);
        let next = match report {
            StatusReport::Online if self.is_online() => self.state,
            StatusReport::Online => DeviceState {
                connection: ConnectionStatus::Online,
                activity: ActivityState::Inactive,
            },
            StatusReport::Offline | StatusReport::Unrecognised(_) => DeviceState::default(),
        };
        self.move_to(next, TransitionCause::Status, at)
    }

    pub(crate) fn observe_session(
        &mut self,
        report: &SessionReport,
        at: DateTime<Utc>,
    ) -> Option<Transition> {
        // Session flags of an offline device are stale by definition.
        if !self.is_online() {
            return None;
        }
        let activity = match report {
            SessionReport::Active => ActivityState::Active,
            SessionReport::Inactive | SessionReport::Unrecognised(_) => ActivityState::Inactive,
        };
        let next = DeviceState {
            activity,
            ..self.state
        };
        self.move_to(next, TransitionCause::Session, at)
    }

    pub(crate) fn force_offline(
        &mut self,
        cause: TransitionCause,
        at: DateTime<Utc>,
    ) -> Option<Transition> {
        self.move_to(DeviceState::default(), cause, at)
    }

    /// True when the last status is older than `max_age` (or was never seen while online)
    pub(crate) fn is_stale(&self, now: DateTime<Utc>, max_age: chrono::Duration) -> bool {
        match self.last_status_at {
            Some(seen) => now - seen > max_age,
            None => true,
        }
    }

    pub(crate) fn record_response(&mut self, result: CommandResult) {
        self.last_response = Some(result);
    }

    pub(crate) fn push_log(&mut self, line: String, history: usize) {
        self.recent_logs.push_back(line);
        while self.recent_logs.len() > history.max(1) {
            self.recent_logs.pop_front();
        }
    }

    fn move_to(
        &mut self,
        next: DeviceState,
        cause: TransitionCause,
        at: DateTime<Utc>,
    ) -> Option<Transition> {
        if next == self.state {
            return None;
        }
        let previous = std::mem::replace(&mut self.state, next);
        Some(Transition {
            device: self.device_id.clone(),
            cause,
            previous,
            current: next,
            at,
        })
    }
}
