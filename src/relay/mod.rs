//! # Relay
//!
//! Ties the pieces together:
//!
//! ```text
//! broker ──► ConnectionManager ──► RelayCore ──► topics::route ──► DeviceRegistry ──► watchers
//!                   ▲                   │
//!                   │                   └── responses ──► PendingCommands
//!                   └──────── CommandGateway (publish)
//! ```
//!
//! [`RelayCore`] is the [`TransportListener`] run by the connection task. It never blocks:
//! state changes go out through `watch`/`broadcast` channels and responses through the
//! one-shot channel of the waiting command.
//!
//! [`Relay`] is the handle callers hold. It owns exactly one broker connection, no matter
//! how many devices are watched.

pub mod watch;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::config::RelayConfig;
use crate::device::{DeviceId, DeviceRegistry, DeviceSession, Transition, TransitionCause};
use crate::error::{CommandError, RelayError};
use crate::gateway::{CommandGateway, CommandResult, HttpBridge, PendingCommands, Verb};
use crate::mqtt::connection::{ConnectionManager, LinkStatus, TransportListener};
use crate::mqtt::message::RawMessage;
use crate::mqtt::topics::{self, ChannelEvent};

pub use self::watch::{DeviceWatch, TopicSubscriptions, WatchTable};

const STALE_SWEEP: Duration = Duration::from_secs(1);

/// Broker-facing half of the relay
pub struct RelayCore {
    registry: DeviceRegistry,
    pending: PendingCommands,
    stale_after: Option<chrono::Duration>,
}

impl RelayCore {
    pub fn new(
        registry: DeviceRegistry,
        pending: PendingCommands,
        stale_after: Option<Duration>,
    ) -> Self {
        Self {
            registry,
            pending,
            stale_after: stale_after.and_then(|d| chrono::Duration::from_std(d).ok()),
        }
    }
}

impl TransportListener for RelayCore {
    fn on_connected(&self) {
        // Sessions stay offline until each device reports its status again.
        debug!("Broker link up, {} device(s) tracked", self.registry.tracked().len());
    }

    fn on_message(&self, message: RawMessage) {
        let Some(event) = topics::route(&message) else {
            return;
        };
        self.registry.apply(&event, message.timestamp());

        if let ChannelEvent::Response(result) = event.kind {
            if !self.pending.resolve(&event.device, result) {
                debug!("Response from device {} with no command waiting", event.device);
            }
        }
    }

    fn on_offline(&self, reason: &str) {
        let collapsed = self
            .registry
            .mark_all_offline(TransitionCause::TransportOffline, Utc::now());
        if !collapsed.is_empty() {
            info!("{} device(s) marked offline: {}", collapsed.len(), reason);
        }
    }

    fn on_tick(&self, now: DateTime<Utc>) {
        if let Some(max_age) = self.stale_after {
            self.registry.expire_stale(now, max_age);
        }
    }
}

/// Running relay: one broker connection shared by every watcher and command
pub struct Relay {
    config: RelayConfig,
    registry: DeviceRegistry,
    connection: Arc<ConnectionManager>,
    gateway: CommandGateway<ConnectionManager>,
    watches: Arc<WatchTable<ConnectionManager>>,
    http: HttpBridge,
}

impl Relay {
    /// Connects to the broker. Returns once the first connection attempt settled, even if
    /// the broker was unreachable.
    pub async fn start(config: RelayConfig) -> Result<Self, RelayError> {
        config.validate()?;

        let registry = DeviceRegistry::new(config.devices.log_history);
        let pending = PendingCommands::default();
        let stale_after = config.stale_after();
        let listener = Arc::new(RelayCore::new(registry.clone(), pending.clone(), stale_after));

        let tick = stale_after.map(|_| STALE_SWEEP);
        let connection = Arc::new(ConnectionManager::connect(&config.broker, listener, tick).await?);

        let gateway = CommandGateway::new(
            connection.clone(),
            registry.clone(),
            pending,
            config.command_timeout(),
        );
        let watches = WatchTable::new(connection.clone(), registry.clone());
        let http = HttpBridge::new(Duration::from_millis(config.http_bridge.timeout_ms))
            .map_err(|e| RelayError::Config(format!("HTTP bridge client: {e}")))?;

        Ok(Self {
            config,
            registry,
            connection,
            gateway,
            watches,
            http,
        })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Starts observing `device`. Its telemetry topics stay subscribed while any watch for it
    /// is alive. Fails for ids that are not a single plain topic level.
    pub fn watch(&self, device: impl Into<DeviceId>) -> Result<DeviceWatch, RelayError> {
        self.watches.attach(device.into())
    }

    pub fn snapshot(&self, device: &DeviceId) -> Option<DeviceSession> {
        self.registry.snapshot(device)
    }

    pub fn transitions(&self) -> broadcast::Receiver<Transition> {
        self.registry.subscribe_transitions()
    }

    pub fn link_status(&self) -> tokio::sync::watch::Receiver<LinkStatus> {
        self.connection.status()
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub async fn send_command(
        &self,
        device: &DeviceId,
        verb: Verb,
    ) -> Result<CommandResult, CommandError> {
        self.gateway.send_command(device, verb).await
    }

    /// HTTP bridge call, against `http_bridge.base_url` when `endpoint` is `None`
    pub async fn send_http_command(
        &self,
        endpoint: Option<&str>,
        verb: Verb,
    ) -> Result<CommandResult, CommandError> {
        let endpoint = endpoint.unwrap_or(&self.config.http_bridge.base_url);
        self.http.send_http_command(endpoint, verb).await
    }

    pub async fn run_motor(&self, endpoint: Option<&str>) -> Result<CommandResult, CommandError> {
        let endpoint = endpoint.unwrap_or(&self.config.http_bridge.base_url);
        self.http.run_motor(endpoint).await
    }

    /// Cancels waiting commands, unsubscribes and closes the broker connection
    pub async fn shutdown(self) {
        info!("Shutting down relay");
        self.gateway.close();
        self.connection.shutdown().await;
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.gateway.close();
        self.connection.cancel();
    }
}
