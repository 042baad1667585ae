//! Command gateway.
//!
//! The only place where relay operations surface errors to callers. A command is only
//! published to a device that currently reports `online`; the call then waits for that
//! device's next `response` message, bounded by the configured timeout.
//!
//! There is no correlation id on the wire, so a device can only have one command in flight.
//! A second call for the same device fails with [`CommandError::Busy`] instead of queueing.

pub mod command;
pub mod http_bridge;
pub mod pending;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::device::{ConnectionStatus, DeviceId, DeviceRegistry};
use crate::error::{CommandError, CommandFailure, RelayError};
use crate::mqtt::topics::Channel;

pub use command::{Command, CommandResult, Verb};
pub use http_bridge::HttpBridge;
pub use pending::PendingCommands;

/// Anything that can put a payload on a broker topic
#[async_trait]
pub trait CommandPublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), RelayError>;
}

pub struct CommandGateway<P: CommandPublisher> {
    publisher: Arc<P>,
    registry: DeviceRegistry,
    pending: PendingCommands,
    timeout: Duration,
    cancel: CancellationToken,
}

impl<P: CommandPublisher> CommandGateway<P> {
    pub fn new(
        publisher: Arc<P>,
        registry: DeviceRegistry,
        pending: PendingCommands,
        timeout: Duration,
    ) -> Self {
        Self {
            publisher,
            registry,
            pending,
            timeout,
            cancel: CancellationToken::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Publishes `verb` to the device and waits for its answer.
    ///
    /// # Errors
    ///
    /// * [`CommandError::DeviceOffline`] - device not online, nothing published
    /// * [`CommandError::Busy`] - another command for this device is still waiting
    /// * [`CommandError::Failed`] - the broker client refused the publish
    /// * [`CommandError::Timeout`] - no response within the configured timeout
    /// * [`CommandError::Cancelled`] - the gateway was closed while waiting
    pub async fn send_command(
        &self,
        device: &DeviceId,
        verb: Verb,
    ) -> Result<CommandResult, CommandError> {
        if self.registry.connection_status(device) != ConnectionStatus::Online {
            warn!("Refusing {} for offline device {}", verb, device);
            return Err(CommandError::DeviceOffline(device.clone()));
        }
        if self.cancel.is_cancelled() {
            return Err(CommandError::Cancelled(device.clone()));
        }

        let command = Command::new(device.clone(), verb);
        let (ticket, reply) = self.pending.register(command)?;
        // Released on every exit path, including the caller dropping this future.
        let _slot = SlotGuard {
            pending: &self.pending,
            device,
            ticket,
        };

        let topic = device.topic(Channel::Command);
        if let Err(e) = self.publisher.publish(&topic, verb.as_str()).await {
            return Err(CommandFailure::Publish(e).into());
        }
        debug!("Waiting up to {:?} for device {} to answer {}", self.timeout, device, verb);

        tokio::select! {
            _ = self.cancel.cancelled() => Err(CommandError::Cancelled(device.clone())),
            _ = tokio::time::sleep(self.timeout) => {
                warn!("Device {} did not answer {} within {:?}", device, verb, self.timeout);
                Err(CommandError::Timeout { device: device.clone(), timeout: self.timeout })
            }
            answer = reply => match answer {
                Ok(result) => {
                    info!("Device {} answered {}: {}", device, verb, result);
                    Ok(result)
                }
                Err(_) => Err(CommandError::Cancelled(device.clone())),
            },
        }
    }

    /// Fails every waiting command with [`CommandError::Cancelled`] and rejects new ones
    pub fn close(&self) {
        self.cancel.cancel();
        let dropped = self.pending.cancel_all();
        if dropped > 0 {
            info!("Cancelled {} pending command(s)", dropped);
        }
    }
}

struct SlotGuard<'a> {
    pending: &'a PendingCommands,
    device: &'a DeviceId,
    ticket: pending::Ticket,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.pending.withdraw(self.device, self.ticket);
    }
}
