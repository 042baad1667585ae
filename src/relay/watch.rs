//! Reference-counted device observers.
//!
//! Any number of consumers may watch the same device; they all share one broker connection.
//! The first [`DeviceWatch`] for a device subscribes its telemetry topics, dropping the last
//! one unsubscribes them and discards the device's session.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::device::{DeviceId, DeviceRegistry, DeviceSession};
use crate::error::RelayError;

/// Subscription side of the broker connection
pub trait TopicSubscriptions: Send + Sync {
    fn subscribe(&self, topics: &[String]) -> Result<(), RelayError>;
    fn unsubscribe(&self, topics: &[String]);
}

pub struct WatchTable<T: TopicSubscriptions> {
    subscriptions: Arc<T>,
    registry: DeviceRegistry,
    counts: Mutex<HashMap<DeviceId, usize>>,
}

impl<T: TopicSubscriptions + 'static> WatchTable<T> {
    pub fn new(subscriptions: Arc<T>, registry: DeviceRegistry) -> Arc<Self> {
        Arc::new(Self {
            subscriptions,
            registry,
            counts: Mutex::new(HashMap::new()),
        })
    }

    /// Attaches one observer to `device`.
    ///
    /// The count lock is held across subscribe and track so a concurrent release of the
    /// same device cannot undo them.
    pub fn attach(self: &Arc<Self>, device: DeviceId) -> Result<DeviceWatch, RelayError> {
        device.validate()?;

        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        let count = counts.entry(device.clone()).or_insert(0);
        *count += 1;
        let first = *count == 1;

        let receiver = self.registry.track(&device);
        if first {
            debug!("First observer for device {}, subscribing", device);
            if let Err(e) = self.subscriptions.subscribe(&device.telemetry_topics()) {
                warn!("Device {} attached without full telemetry: {}", device, e);
            }
        }
        drop(counts);

        let table: Arc<dyn Release> = self.clone();
        Ok(DeviceWatch {
            device,
            receiver,
            table,
        })
    }

    pub fn observers(&self, device: &DeviceId) -> usize {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(device)
            .copied()
            .unwrap_or(0)
    }
}

trait Release: Send + Sync {
    fn release(&self, device: &DeviceId);
}

impl<T: TopicSubscriptions> Release for WatchTable<T> {
    fn release(&self, device: &DeviceId) {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        match counts.get_mut(device) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                counts.remove(device);
                debug!("Last observer of device {} detached", device);
                self.subscriptions.unsubscribe(&device.telemetry_topics());
                self.registry.forget(device);
            }
            None => {}
        }
    }
}

/// Read-only view of one device. Detaches on drop.
pub struct DeviceWatch {
    device: DeviceId,
    receiver: watch::Receiver<DeviceSession>,
    table: Arc<dyn Release>,
}

impl DeviceWatch {
    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    pub fn snapshot(&self) -> DeviceSession {
        self.receiver.borrow().clone()
    }

    /// Waits for the next state change. `None` once the relay stopped tracking the device.
    pub async fn changed(&mut self) -> Option<DeviceSession> {
        self.receiver.changed().await.ok()?;
        Some(self.receiver.borrow_and_update().clone())
    }

    /// Waits until the device reports online, up to `timeout`
    pub async fn wait_until_online(&mut self, timeout: Duration) -> bool {
        let online = self.receiver.wait_for(|session| session.is_online());
        matches!(tokio::time::timeout(timeout, online).await, Ok(Ok(_)))
    }

    /// Independent receiver for consumers that want to drive their own loop
    pub fn receiver(&self) -> watch::Receiver<DeviceSession> {
        self.receiver.clone()
    }
}

impl Drop for DeviceWatch {
    fn drop(&mut self) {
        self.table.release(&self.device);
    }
}
