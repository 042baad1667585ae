use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tracing::{debug, trace};

use super::{Command, CommandResult};
use crate::device::DeviceId;
use crate::error::CommandError;

/// Identifies one registration so a late cleanup never removes a newer command
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ticket(u64);

struct Waiter {
    ticket: Ticket,
    command: Command,
    reply: oneshot::Sender<CommandResult>,
}

#[derive(Default)]
struct Table {
    next_ticket: u64,
    waiting: HashMap<DeviceId, Waiter>,
}

/// Commands waiting for a response, at most one per device
#[derive(Clone, Default)]
pub struct PendingCommands {
    inner: Arc<Mutex<Table>>,
}

impl PendingCommands {
    fn table(&self) -> MutexGuard<'_, Table> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claims the device's slot, failing with [`CommandError::Busy`] if it is taken
    pub fn register(
        &self,
        command: Command,
    ) -> Result<(Ticket, oneshot::Receiver<CommandResult>), CommandError> {
        let mut table = self.table();
        if table.waiting.contains_key(&command.device_id) {
            return Err(CommandError::Busy(command.device_id));
        }
        table.next_ticket += 1;
        let ticket = Ticket(table.next_ticket);
        let (reply, rx) = oneshot::channel();
        trace!("Registered {} for device {}", command.verb, command.device_id);
        table.waiting.insert(
            command.device_id.clone(),
            Waiter {
                ticket,
                command,
                reply,
            },
        );
        Ok((ticket, rx))
    }

    /// Hands `result` to the command waiting on `device`. Returns false if none was waiting.
    pub fn resolve(&self, device: &DeviceId, result: CommandResult) -> bool {
        let Some(waiter) = self.table().waiting.remove(device) else {
            return false;
        };
        let elapsed = chrono::Utc::now() - waiter.command.issued_at;
        debug!(
            "Device {} answered {} after {}ms",
            device,
            waiter.command.verb,
            elapsed.num_milliseconds()
        );
        waiter.reply.send(result).is_ok()
    }

    /// Removes the registration if it is still the one identified by `ticket`
    pub fn withdraw(&self, device: &DeviceId, ticket: Ticket) {
        let mut table = self.table();
        if table
            .waiting
            .get(device)
            .is_some_and(|waiter| waiter.ticket == ticket)
        {
            table.waiting.remove(device);
        }
    }

    pub fn is_waiting(&self, device: &DeviceId) -> bool {
        self.table().waiting.contains_key(device)
    }

    /// Drops every waiter; their callers see a cancellation
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<_> = self.table().waiting.drain().collect();
        drained.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::Verb;

    fn command(device: &str) -> Command {
        Command::new(DeviceId::from(device), Verb::Capture)
    }

    #[test]
    fn second_registration_is_busy() {
        let pending = PendingCommands::default();
        let _first = pending.register(command("1")).unwrap();
        assert!(matches!(
            pending.register(command("1")),
            Err(CommandError::Busy(_))
        ));
        assert!(pending.register(command("2")).is_ok());
    }

    #[test]
    fn stale_ticket_does_not_remove_newer_command() {
        let pending = PendingCommands::default();
        let id = DeviceId::from("1");
        let (old_ticket, _rx) = pending.register(command("1")).unwrap();
        assert!(pending.resolve(&id, CommandResult { success: Some(true), message: String::new() }));

        let (_new_ticket, _rx2) = pending.register(command("1")).unwrap();
        pending.withdraw(&id, old_ticket);
        assert!(pending.is_waiting(&id));
    }

    #[tokio::test]
    async fn cancel_all_closes_receivers() {
        let pending = PendingCommands::default();
        let (_, rx) = pending.register(command("3")).unwrap();
        assert_eq!(pending.cancel_all(), 1);
        assert!(rx.await.is_err());
    }
}
