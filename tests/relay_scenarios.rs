//! End-to-end scenarios without a broker: broker traffic is injected into [`RelayCore`] the
//! way the connection task would, commands go out through a channel-backed publisher.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eraser_relay::device::{ActivityState, ConnectionStatus, DeviceRegistry};
use eraser_relay::gateway::{CommandGateway, CommandPublisher, PendingCommands};
use eraser_relay::mqtt::connection::TransportListener;
use eraser_relay::mqtt::message::RawMessage;
use eraser_relay::relay::RelayCore;
use eraser_relay::{CommandError, CommandResult, DeviceId, RelayError, Verb};
use tokio::sync::mpsc;

struct ChannelPublisher {
    tx: mpsc::UnboundedSender<(String, String)>,
}

#[async_trait]
impl CommandPublisher for ChannelPublisher {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), RelayError> {
        self.tx
            .send((topic.to_string(), payload.to_string()))
            .map_err(|e| RelayError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }
}

struct Harness {
    core: RelayCore,
    registry: DeviceRegistry,
    gateway: Arc<CommandGateway<ChannelPublisher>>,
    published: mpsc::UnboundedReceiver<(String, String)>,
}

impl Harness {
    fn new(timeout: Duration) -> Self {
        let registry = DeviceRegistry::new(50);
        let pending = PendingCommands::default();
        let (tx, published) = mpsc::unbounded_channel();
        let gateway = CommandGateway::new(
            Arc::new(ChannelPublisher { tx }),
            registry.clone(),
            pending.clone(),
            timeout,
        );
        Self {
            core: RelayCore::new(registry.clone(), pending, None),
            registry,
            gateway: Arc::new(gateway),
            published,
        }
    }

    fn track(&self, device: &str) -> DeviceId {
        let id = DeviceId::from(device);
        self.registry.track(&id);
        id
    }

    fn deliver(&self, topic: &str, payload: &str) {
        self.core.on_message(RawMessage::new(topic, payload));
    }

    fn online(&self, device: &str) -> DeviceId {
        let id = self.track(device);
        self.deliver(&format!("eraser_{device}/status"), "online");
        id
    }

    fn send_in_background(
        &self,
        device: &DeviceId,
        verb: Verb,
    ) -> tokio::task::JoinHandle<Result<CommandResult, CommandError>> {
        let gateway = self.gateway.clone();
        let device = device.clone();
        tokio::spawn(async move { gateway.send_command(&device, verb).await })
    }
}

#[tokio::test]
async fn command_to_silent_device_is_refused() {
    let mut h = Harness::new(Duration::from_secs(10));
    let id = h.track("5");

    let err = h.gateway.send_command(&id, Verb::Capture).await.unwrap_err();

    assert!(matches!(err, CommandError::DeviceOffline(ref d) if *d == id));
    assert!(h.published.try_recv().is_err());
}

#[test]
fn mixed_case_status_counts_as_online() {
    let h = Harness::new(Duration::from_secs(10));
    let id = h.track("2");
    h.deliver("eraser_2/status", "Online");
    assert_eq!(h.registry.connection_status(&id), ConnectionStatus::Online);

    h.deliver("eraser_2/status", " OFFLINE\n");
    assert_eq!(h.registry.connection_status(&id), ConnectionStatus::Offline);
}

#[tokio::test(start_paused = true)]
async fn unanswered_command_times_out_and_keeps_liveness() {
    let mut h = Harness::new(Duration::from_secs(10));
    let id = h.online("1");

    let err = h.gateway.send_command(&id, Verb::Erase).await.unwrap_err();

    assert!(matches!(
        err,
        CommandError::Timeout { ref device, timeout } if *device == id && timeout == Duration::from_secs(10)
    ));
    assert_eq!(
        h.published.try_recv().unwrap(),
        ("eraser_1/command".to_string(), "erase".to_string())
    );
    assert_eq!(h.registry.connection_status(&id), ConnectionStatus::Online);

    // The slot was released, a new command can go out
    let err = h.gateway.send_command(&id, Verb::Stop).await.unwrap_err();
    assert!(matches!(err, CommandError::Timeout { .. }));
}

#[tokio::test]
async fn plain_text_response_is_kept_raw() {
    let mut h = Harness::new(Duration::from_secs(10));
    let id = h.online("3");

    let waiting = h.send_in_background(&id, Verb::CaptureErase);
    assert_eq!(h.published.recv().await.unwrap().1, "capture_erase");
    h.deliver("eraser_3/response", "done");

    let result = waiting.await.unwrap().unwrap();
    assert_eq!(
        result,
        CommandResult {
            success: None,
            message: "done".to_string()
        }
    );
}

#[tokio::test]
async fn command_round_trip() {
    let mut h = Harness::new(Duration::from_secs(10));
    let id = h.online("1");

    let waiting = h.send_in_background(&id, Verb::Capture);
    let (topic, payload) = h.published.recv().await.unwrap();
    assert_eq!(topic, "eraser_1/command");
    assert_eq!(payload, "capture");

    // Another device's answer must not resolve this command
    h.online("2");
    h.deliver("eraser_2/response", r#"{"success": false, "message": "jammed"}"#);
    h.deliver("eraser_1/response", r#"{"success": true, "message": "ok"}"#);

    let result = waiting.await.unwrap().unwrap();
    assert_eq!(result.success, Some(true));
    assert_eq!(result.message, "ok");
    assert_eq!(h.registry.snapshot(&id).unwrap().last_response, Some(result));
}

#[tokio::test]
async fn second_command_for_busy_device_is_rejected() {
    let mut h = Harness::new(Duration::from_secs(10));
    let id = h.online("4");

    let first = h.send_in_background(&id, Verb::Forward);
    h.published.recv().await.unwrap();

    let err = h.gateway.send_command(&id, Verb::Backward).await.unwrap_err();
    assert!(matches!(err, CommandError::Busy(_)));

    h.deliver("eraser_4/response", r#"{"success": true, "message": "moved"}"#);
    assert_eq!(first.await.unwrap().unwrap().message, "moved");
    assert!(h.published.try_recv().is_err());
}

#[test]
fn unsolicited_response_is_recorded() {
    let h = Harness::new(Duration::from_secs(10));
    let id = h.online("6");
    h.deliver("eraser_6/response", r#"{"success": true, "message": "boot complete"}"#);
    assert_eq!(
        h.registry.snapshot(&id).unwrap().last_response,
        Some(CommandResult {
            success: Some(true),
            message: "boot complete".to_string()
        })
    );
}

#[test]
fn repeated_online_is_idempotent() {
    let h = Harness::new(Duration::from_secs(10));
    let id = h.track("7");
    let mut transitions = h.registry.subscribe_transitions();

    for _ in 0..3 {
        h.deliver("eraser_7/status", "online");
    }

    assert_eq!(h.registry.connection_status(&id), ConnectionStatus::Online);
    assert!(transitions.try_recv().is_ok());
    assert!(transitions.try_recv().is_err());
}

#[test]
fn transport_offline_collapses_every_device() {
    let h = Harness::new(Duration::from_secs(10));
    let ids: Vec<DeviceId> = ["1", "2", "3"].into_iter().map(|d| h.online(d)).collect();
    h.deliver("eraser_2/session", "active");
    let mut transitions = h.registry.subscribe_transitions();

    h.core.on_offline("connection refused");

    for id in &ids {
        let snapshot = h.registry.snapshot(id).unwrap();
        assert_eq!(snapshot.state.connection, ConnectionStatus::Offline);
        assert_eq!(snapshot.state.activity, ActivityState::Inactive);
    }
    let mut collapsed = 0;
    while transitions.try_recv().is_ok() {
        collapsed += 1;
    }
    assert_eq!(collapsed, 3);
}

#[derive(Clone, Copy, Debug)]
enum Step {
    Status(&'static str),
    Session(&'static str),
    TransportOffline,
}

const STEPS: [Step; 7] = [
    Step::Status("online"),
    Step::Status("Online "),
    Step::Status("OFFLINE"),
    Step::Status("rebooting"),
    Step::Session("active"),
    Step::Session("not active"),
    Step::TransportOffline,
];

fn sequences(len: usize) -> Vec<Vec<Step>> {
    (0..len).fold(vec![Vec::new()], |acc, _| {
        acc.iter()
            .flat_map(|prefix| {
                STEPS.iter().map(move |step| {
                    let mut next = prefix.clone();
                    next.push(*step);
                    next
                })
            })
            .collect()
    })
}

/// Online iff the last status seen (since the last transport drop) was "online",
/// and never Active while Offline
#[test]
fn liveness_follows_last_status() {
    for len in 1..=4 {
        for sequence in sequences(len) {
            let h = Harness::new(Duration::from_secs(10));
            let id = h.track("9");
            let mut online = false;
            let mut active = false;

            for step in &sequence {
                match step {
                    Step::Status(payload) => {
                        h.deliver("eraser_9/status", payload);
                        let now_online = payload.trim().eq_ignore_ascii_case("online");
                        if !now_online || !online {
                            active = false;
                        }
                        online = now_online;
                    }
                    Step::Session(payload) => {
                        h.deliver("eraser_9/session", payload);
                        if online {
                            active = *payload == "active";
                        }
                    }
                    Step::TransportOffline => {
                        h.core.on_offline("keepalive timeout");
                        online = false;
                        active = false;
                    }
                }

                let snapshot = h.registry.snapshot(&id).unwrap();
                assert_eq!(snapshot.is_online(), online, "after {sequence:?}");
                assert_eq!(snapshot.is_active(), active, "after {sequence:?}");
                assert!(!(snapshot.is_active() && !snapshot.is_online()));
            }
        }
    }
}
