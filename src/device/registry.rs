use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, trace};

use super::{ConnectionStatus, DeviceId, DeviceSession, Transition, TransitionCause};
use crate::mqtt::topics::{ChannelEvent, RelayEvent};

const TRANSITION_CAPACITY: usize = 256;

/// Table of tracked devices.
///
/// Each device owns a `watch` channel carrying its [`DeviceSession`]; every state change is
/// also published as a [`Transition`] on a shared broadcast channel. Cloning the registry is
/// cheap and all clones share the same table.
///
/// The mutating methods (`apply`, `mark_all_offline`, `expire_stale`) are meant to be called
/// from the connection task only, which keeps a single writer per session.
#[derive(Clone)]
pub struct DeviceRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    devices: Mutex<HashMap<DeviceId, watch::Sender<DeviceSession>>>,
    transitions: broadcast::Sender<Transition>,
    log_history: usize,
}

impl DeviceRegistry {
    pub fn new(log_history: usize) -> Self {
        let (transitions, _) = broadcast::channel(TRANSITION_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                devices: Mutex::new(HashMap::new()),
                transitions,
                log_history,
            }),
        }
    }

    fn devices(&self) -> MutexGuard<'_, HashMap<DeviceId, watch::Sender<DeviceSession>>> {
        self.inner
            .devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts tracking `device` (no-op if already tracked) and returns a receiver for its
    /// snapshots
    pub fn track(&self, device: &DeviceId) -> watch::Receiver<DeviceSession> {
        let mut devices = self.devices();
        match devices.get(device) {
            Some(sender) => sender.subscribe(),
            None => {
                debug!("Tracking device {}", device);
                let (sender, receiver) = watch::channel(DeviceSession::new(device.clone()));
                devices.insert(device.clone(), sender);
                receiver
            }
        }
    }

    /// Drops the session of `device`; its watchers see the channel close
    pub fn forget(&self, device: &DeviceId) -> bool {
        let removed = self.devices().remove(device).is_some();
        if removed {
            debug!("Stopped tracking device {}", device);
        }
        removed
    }

    pub fn is_tracked(&self, device: &DeviceId) -> bool {
        self.devices().contains_key(device)
    }

    pub fn tracked(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self.devices().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn snapshot(&self, device: &DeviceId) -> Option<DeviceSession> {
        self.devices()
            .get(device)
            .map(|sender| sender.borrow().clone())
    }

    /// Untracked devices count as offline
    pub fn connection_status(&self, device: &DeviceId) -> ConnectionStatus {
        self.devices()
            .get(device)
            .map(|sender| sender.borrow().state.connection)
            .unwrap_or(ConnectionStatus::Offline)
    }

    pub fn subscribe_transitions(&self) -> broadcast::Receiver<Transition> {
        self.inner.transitions.subscribe()
    }

    /// Applies one routed event. Events for untracked devices are ignored.
    pub fn apply(&self, event: &RelayEvent, at: DateTime<Utc>) -> Option<Transition> {
        let devices = self.devices();
        let Some(sender) = devices.get(&event.device) else {
            trace!("Ignoring {:?} for untracked device {}", event.kind, event.device);
            return None;
        };

        let mut transition = None;
        sender.send_if_modified(|session| match &event.kind {
            ChannelEvent::Status(report) => {
                transition = session.observe_status(report, at);
                transition.is_some()
            }
            ChannelEvent::Session(report) => {
                transition = session.observe_session(report, at);
                transition.is_some()
            }
            ChannelEvent::Response(result) => {
                session.record_response(result.clone());
                true
            }
            ChannelEvent::Log(line) => {
                session.push_log(line.clone(), self.inner.log_history);
                true
            }
            ChannelEvent::CommandEcho(_) => false,
        });
        drop(devices);

        if let Some(t) = &transition {
            self.announce(t);
        }
        transition
    }

    /// Forces every tracked device to `Offline`/`Inactive` in one pass
    pub fn mark_all_offline(&self, cause: TransitionCause, at: DateTime<Utc>) -> Vec<Transition> {
        let transitions: Vec<Transition> = {
            let devices = self.devices();
            devices
                .values()
                .filter_map(|sender| {
                    let mut transition = None;
                    sender.send_if_modified(|session| {
                        transition = session.force_offline(cause, at);
                        transition.is_some()
                    });
                    transition
                })
                .collect()
        };
        for t in &transitions {
            self.announce(t);
        }
        transitions
    }

    /// Marks online devices offline when their last status is older than `max_age`
    pub fn expire_stale(&self, now: DateTime<Utc>, max_age: chrono::Duration) -> Vec<Transition> {
        let transitions: Vec<Transition> = {
            let devices = self.devices();
            devices
                .values()
                .filter_map(|sender| {
                    let mut transition = None;
                    sender.send_if_modified(|session| {
                        if session.is_online() && session.is_stale(now, max_age) {
                            transition = session.force_offline(TransitionCause::Stale, now);
                        }
                        transition.is_some()
                    });
                    transition
                })
                .collect()
        };
        for t in &transitions {
            self.announce(t);
        }
        transitions
    }

    fn announce(&self, transition: &Transition) {
        info!(
            "Device {}: {} -> {} ({:?})",
            transition.device, transition.previous, transition.current, transition.cause
        );
        // No receivers is fine, watch channels still carry the state.
        let _ = self.inner.transitions.send(transition.clone());
    }
}
