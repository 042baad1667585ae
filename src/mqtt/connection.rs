//! Broker connection manager.
//!
//! One [`ConnectionManager`] owns one MQTT connection. The rumqttc event loop is driven by a
//! single task, modelled as a statum state machine:
//!
//! ```text
//!            ┌──────── tick ────────┐
//!            ▼                      │
//!   ──► Polling ──event──► Dispatching ──► Polling
//!          │  │
//!          │  └──error──► Backoff ──(reconnect interval)──► Polling
//!          └──cancel──► Closing ──(queued unsubscribes written)──► closed
//! ```
//!
//! Every broker callback (connack, publish, error, disconnect, staleness tick) is handed to a
//! [`TransportListener`] on that task. Listeners must not block.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rumqttc::{
    AsyncClient, ConnAck, Event, EventLoop, Outgoing, Packet, QoS, SubscribeReasonCode,
};
use statum::{machine, state};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn, Instrument};

use super::message::RawMessage;
use crate::config::BrokerConfig;
use crate::error::RelayError;
use crate::gateway::CommandPublisher;
use crate::relay::watch::TopicSubscriptions;

/// Receives everything the connection task observes
pub trait TransportListener: Send + Sync {
    fn on_connected(&self);
    fn on_message(&self, message: RawMessage);
    /// Transport error and broker disconnect both end up here
    fn on_offline(&self, reason: &str);
    /// Periodic tick, only delivered when the manager was started with a tick period
    fn on_tick(&self, _now: DateTime<Utc>) {}
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum LinkStatus {
    #[default]
    Connecting,
    Connected,
    Offline(String),
    Closed,
}

/// Upper bound for writing queued unsubscribes once the link is closing
const CLOSE_DRAIN: Duration = Duration::from_secs(1);

struct LinkShared {
    status: watch::Sender<LinkStatus>,
    topics: Mutex<BTreeSet<String>>,
    /// Unsubscribe requests queued on the client but not yet written to the socket
    unsubscribes_queued: AtomicUsize,
}

impl LinkShared {
    fn topics(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn topic_list(&self) -> Vec<String> {
        self.topics().iter().cloned().collect()
    }

    fn is_connected(&self) -> bool {
        *self.status.borrow() == LinkStatus::Connected
    }

    fn set_status(&self, status: LinkStatus) -> LinkStatus {
        self.status.send_replace(status)
    }

    fn unsubscribe_settled(&self) {
        let _ = self
            .unsubscribes_queued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    fn unsubscribes_pending(&self) -> bool {
        self.unsubscribes_queued.load(Ordering::SeqCst) > 0
    }
}

#[state]
#[derive(Debug, Clone)]
enum LinkState {
    Polling,
    Dispatching(Event),
    Backoff(String),
    Closing,
}

#[machine]
struct BrokerLink<S: LinkState> {
    client: AsyncClient,
    eventloop: EventLoop,
    listener: Arc<dyn TransportListener>,
    shared: Arc<LinkShared>,
    cancel: CancellationToken,
    ticker: Option<Interval>,
    reconnect_interval: Duration,
}

enum PollOutcome {
    Event(BrokerLink<Dispatching>),
    Failed(BrokerLink<Backoff>),
    Tick(BrokerLink<Polling>),
    Cancelled(BrokerLink<Closing>),
}

enum Polled {
    Event(Event),
    Failed(String),
    Tick,
    Cancelled,
}

impl<S: LinkState> BrokerLink<S> {
    fn report_offline(&self, reason: &str) {
        self.listener.on_offline(reason);
        let previous = self.shared.set_status(LinkStatus::Offline(reason.to_string()));
        match previous {
            LinkStatus::Offline(_) => debug!("Broker still unreachable: {}", reason),
            _ => warn!(
                "Broker link offline: {}",
                RelayError::Connection(reason.to_string())
            ),
        }
    }
}

impl BrokerLink<Polling> {
    async fn poll(mut self) -> PollOutcome {
        let polled = {
            let cancel = &self.cancel;
            let ticker = &mut self.ticker;
            let eventloop = &mut self.eventloop;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Polled::Cancelled,
                _ = next_tick(ticker) => Polled::Tick,
                result = eventloop.poll() => match result {
                    Ok(event) => Polled::Event(event),
                    Err(e) => Polled::Failed(e.to_string()),
                },
            }
        };

        match polled {
            Polled::Event(event) => PollOutcome::Event(self.transition_with(event)),
            Polled::Failed(reason) => PollOutcome::Failed(self.transition_with(reason)),
            Polled::Tick => PollOutcome::Tick(self),
            Polled::Cancelled => PollOutcome::Cancelled(self.transition()),
        }
    }

    fn tick(self) -> Self {
        self.listener.on_tick(Utc::now());
        self
    }
}

impl BrokerLink<Dispatching> {
    fn dispatch(self) -> BrokerLink<Polling> {
        let event = if let Some(event) = self.get_state_data() {
            event.clone()
        } else {
            warn!("No event in Dispatching state");
            return self.transition();
        };

        match event {
            Event::Incoming(Packet::ConnAck(ack)) => self.on_connack(&ack),
            Event::Incoming(Packet::Publish(publish)) => {
                let message = RawMessage::from_publish(&publish);
                trace!("Received {}", message);
                self.listener.on_message(message);
            }
            Event::Incoming(Packet::SubAck(ack)) => {
                let failed = ack
                    .return_codes
                    .iter()
                    .filter(|code| matches!(code, SubscribeReasonCode::Failure))
                    .count();
                if failed > 0 {
                    let err = RelayError::Subscription {
                        topic: format!("pkid {}", ack.pkid),
                        reason: format!("broker rejected {failed} filter(s)"),
                    };
                    warn!("{}", err);
                } else {
                    debug!("Subscription {} acknowledged", ack.pkid);
                }
            }
            Event::Incoming(Packet::Disconnect) => self.report_offline("broker sent DISCONNECT"),
            Event::Incoming(packet) => trace!("Incoming {:?}", packet),
            Event::Outgoing(Outgoing::Unsubscribe(pkid)) => {
                trace!("Unsubscribe {} written", pkid);
                self.shared.unsubscribe_settled();
            }
            Event::Outgoing(outgoing) => trace!("Outgoing {:?}", outgoing),
        }

        self.transition()
    }

    fn on_connack(&self, ack: &ConnAck) {
        info!(
            "Connected to broker (session present: {})",
            ack.session_present
        );
        self.shared.set_status(LinkStatus::Connected);

        // The broker forgets subscriptions of clean sessions, so replay them.
        for topic in self.shared.topic_list() {
            match self.client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                Ok(()) => debug!("Re-subscribed to {}", topic),
                Err(e) => warn!(
                    "{}",
                    RelayError::Subscription {
                        topic,
                        reason: e.to_string()
                    }
                ),
            }
        }
        self.listener.on_connected();
    }
}

impl BrokerLink<Backoff> {
    async fn back_off(self) -> BrokerLink<Polling> {
        let reason = self
            .get_state_data()
            .cloned()
            .unwrap_or_else(|| "unknown transport error".to_string());
        self.report_offline(&reason);

        debug!("Retrying broker connection in {:?}", self.reconnect_interval);
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = time::sleep(self.reconnect_interval) => {}
        }
        self.transition()
    }
}

impl BrokerLink<Closing> {
    /// Writes any queued unsubscribes, then drops the event loop. The socket is closed
    /// without a DISCONNECT handshake.
    async fn close(mut self) {
        if self.shared.is_connected() {
            self.drain_unsubscribes().await;
        }
        self.listener.on_offline("connection closed");
        self.shared.set_status(LinkStatus::Closed);
        info!("Broker connection closed");
    }

    async fn drain_unsubscribes(&mut self) {
        let deadline = Instant::now() + CLOSE_DRAIN;
        while self.shared.unsubscribes_pending() {
            match time::timeout_at(deadline, self.eventloop.poll()).await {
                Ok(Ok(Event::Outgoing(Outgoing::Unsubscribe(pkid)))) => {
                    trace!("Unsubscribe {} written", pkid);
                    self.shared.unsubscribe_settled();
                }
                Ok(Ok(event)) => trace!("Ignoring {:?} while closing", event),
                Ok(Err(e)) => {
                    debug!("Transport failed while closing: {}", e);
                    break;
                }
                Err(_) => {
                    warn!("Closing with unsubscribes still queued after {:?}", CLOSE_DRAIN);
                    break;
                }
            }
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn run_link(mut link: BrokerLink<Polling>) {
    debug!("Broker connection task started");
    loop {
        link = match link.poll().await {
            PollOutcome::Event(dispatching) => dispatching.dispatch(),
            PollOutcome::Failed(backoff) => backoff.back_off().await,
            PollOutcome::Tick(polling) => polling.tick(),
            PollOutcome::Cancelled(closing) => {
                closing.close().await;
                return;
            }
        };
    }
}

/// Owner of the broker connection.
///
/// Subscriptions are remembered and replayed after every reconnect. Dropping the manager
/// cancels the connection task; [`ConnectionManager::shutdown`] additionally unsubscribes
/// and waits for the task to end.
pub struct ConnectionManager {
    client: AsyncClient,
    client_id: String,
    shared: Arc<LinkShared>,
    cancel: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Starts the connection task and waits for the first connack or transport error.
    ///
    /// An unreachable broker is not an error here: the manager is returned in `Offline`
    /// state and keeps retrying in the background.
    pub async fn connect(
        config: &BrokerConfig,
        listener: Arc<dyn TransportListener>,
        tick: Option<Duration>,
    ) -> Result<Self, RelayError> {
        let manager = Self::start(config, listener, tick)?;

        let mut status = manager.status();
        let first = status
            .wait_for(|s| *s != LinkStatus::Connecting)
            .await
            .map(|s| (*s).clone());
        match first {
            Ok(LinkStatus::Connected) => info!("Broker {} ready as {}", config.endpoint, manager.client_id),
            Ok(LinkStatus::Offline(reason)) => warn!(
                "Broker {} not reachable ({}), retrying every {}ms",
                config.endpoint, reason, config.reconnect_interval_ms
            ),
            Ok(other) => debug!("Connection task reported {:?}", other),
            Err(_) => error!("Connection task ended before reporting a status"),
        }
        Ok(manager)
    }

    /// Starts the connection task without waiting for it
    pub fn start(
        config: &BrokerConfig,
        listener: Arc<dyn TransportListener>,
        tick: Option<Duration>,
    ) -> Result<Self, RelayError> {
        let client_id = config.client_id();
        let options = config.mqtt_options(&client_id)?;
        let (client, eventloop) = AsyncClient::new(options, config.request_capacity);

        let (status, _) = watch::channel(LinkStatus::Connecting);
        let shared = Arc::new(LinkShared {
            status,
            topics: Mutex::new(BTreeSet::new()),
            unsubscribes_queued: AtomicUsize::new(0),
        });
        let cancel = CancellationToken::new();
        let ticker = tick.map(|period| {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        let link = BrokerLink::<Polling>::new(
            client.clone(),
            eventloop,
            listener,
            shared.clone(),
            cancel.clone(),
            ticker,
            Duration::from_millis(config.reconnect_interval_ms),
        );
        info!("Connecting to {} as {}", config.endpoint, client_id);
        let driver = tokio::spawn(run_link(link).in_current_span());

        Ok(Self {
            client,
            client_id,
            shared,
            cancel,
            driver: Mutex::new(Some(driver)),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn status(&self) -> watch::Receiver<LinkStatus> {
        self.shared.status.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    pub fn subscribed_topics(&self) -> Vec<String> {
        self.shared.topic_list()
    }

    /// Remembers `topics` and subscribes to them if connected. Failures are logged and the
    /// first one is returned; the manager keeps running either way.
    pub fn subscribe(&self, topics: &[String]) -> Result<(), RelayError> {
        self.shared.topics().extend(topics.iter().cloned());
        if !self.is_connected() {
            debug!("Not connected, deferring subscription to {:?}", topics);
            return Ok(());
        }

        let mut first_error = None;
        for topic in topics {
            match self.client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                Ok(()) => info!("Subscribed to {}", topic),
                Err(e) => {
                    let err = RelayError::Subscription {
                        topic: topic.clone(),
                        reason: e.to_string(),
                    };
                    warn!("{}", err);
                    first_error.get_or_insert(err);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn unsubscribe(&self, topics: &[String]) {
        {
            let mut known = self.shared.topics();
            for topic in topics {
                known.remove(topic);
            }
        }
        if !self.is_connected() {
            debug!("Not connected, dropped {:?} from subscriptions", topics);
            return;
        }
        for topic in topics {
            // Counted before queueing so the write can never be seen first
            self.shared.unsubscribes_queued.fetch_add(1, Ordering::SeqCst);
            match self.client.try_unsubscribe(topic.as_str()) {
                Ok(()) => info!("Unsubscribed from {}", topic),
                Err(e) => {
                    self.shared.unsubscribe_settled();
                    warn!("Unsubscribe from {} failed: {}", topic, e);
                }
            }
        }
    }

    pub async fn publish(&self, topic: &str, payload: &str) -> Result<(), RelayError> {
        info!("Publishing '{}' to {}", payload, topic);
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload.as_bytes().to_vec())
            .await
            .map_err(|e| {
                let err = RelayError::Publish {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                };
                error!("{}", err);
                err
            })
    }

    /// Stops the connection task without waiting for it
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Unsubscribes everything and force-closes the connection once the unsubscribes are
    /// written or [`CLOSE_DRAIN`] has passed
    pub async fn shutdown(&self) {
        let topics = self.subscribed_topics();
        self.unsubscribe(&topics);
        self.cancel();

        let driver = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = driver {
            if let Err(e) = handle.await {
                error!("Connection task failed: {}", e);
            }
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[async_trait]
impl CommandPublisher for ConnectionManager {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), RelayError> {
        ConnectionManager::publish(self, topic, payload).await
    }
}

impl TopicSubscriptions for ConnectionManager {
    fn subscribe(&self, topics: &[String]) -> Result<(), RelayError> {
        ConnectionManager::subscribe(self, topics)
    }

    fn unsubscribe(&self, topics: &[String]) {
        ConnectionManager::unsubscribe(self, topics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct CountingListener {
        connected: AtomicUsize,
        offline: AtomicUsize,
        messages: AtomicUsize,
    }

    impl TransportListener for CountingListener {
        fn on_connected(&self) {
            self.connected.fetch_add(1, Ordering::SeqCst);
        }

        fn on_message(&self, _message: RawMessage) {
            self.messages.fetch_add(1, Ordering::SeqCst);
        }

        fn on_offline(&self, _reason: &str) {
            self.offline.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn unreachable_broker() -> BrokerConfig {
        BrokerConfig {
            endpoint: "mqtt://127.0.0.1:1".to_string(),
            reconnect_interval_ms: 50,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn unreachable_broker_is_not_fatal() {
        let listener = Arc::new(CountingListener::default());
        let manager = ConnectionManager::connect(&unreachable_broker(), listener.clone(), None)
            .await
            .unwrap();

        assert!(matches!(*manager.status().borrow(), LinkStatus::Offline(_)));
        assert!(listener.offline.load(Ordering::SeqCst) >= 1);
        assert_eq!(listener.connected.load(Ordering::SeqCst), 0);
        assert!(manager.client_id().starts_with("eraser_relay_"));

        manager.shutdown().await;
        assert_eq!(*manager.status().borrow(), LinkStatus::Closed);
    }

    #[tokio::test]
    async fn subscriptions_are_remembered_while_offline() {
        let listener = Arc::new(CountingListener::default());
        let manager = ConnectionManager::connect(&unreachable_broker(), listener, None)
            .await
            .unwrap();

        let topics = vec!["eraser_1/status".to_string(), "eraser_1/logs".to_string()];
        manager.subscribe(&topics).unwrap();
        assert_eq!(
            manager.subscribed_topics(),
            vec!["eraser_1/logs", "eraser_1/status"]
        );

        manager.unsubscribe(&topics[..1]);
        assert_eq!(manager.subscribed_topics(), vec!["eraser_1/logs"]);

        manager.shutdown().await;
        assert!(manager.subscribed_topics().is_empty());
    }

    /// What the local broker saw, tagged with the connection number
    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Seen {
        Connect(usize),
        Subscribe(usize, String),
        Unsubscribe(usize, String),
    }

    /// Minimal MQTT 3.1.1 broker on a loopback port
    struct LocalBroker {
        endpoint: String,
        seen: mpsc::UnboundedReceiver<Seen>,
    }

    impl LocalBroker {
        /// Answers every SUBSCRIBE with `suback_code`. The first connection is dropped after
        /// `hang_up_after` subscriptions when set.
        async fn start(suback_code: u8, hang_up_after: Option<usize>) -> Self {
            let socket = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = socket.local_addr().unwrap().port();
            let (tx, seen) = mpsc::unbounded_channel();
            tokio::spawn(async move {
                let mut connection = 0;
                while let Ok((stream, _)) = socket.accept().await {
                    let limit = if connection == 0 { hang_up_after } else { None };
                    tokio::spawn(serve(stream, connection, suback_code, limit, tx.clone()));
                    connection += 1;
                }
            });
            Self {
                endpoint: format!("mqtt://127.0.0.1:{port}"),
                seen,
            }
        }

        fn config(&self) -> BrokerConfig {
            BrokerConfig {
                endpoint: self.endpoint.clone(),
                reconnect_interval_ms: 50,
                ..Default::default()
            }
        }

        /// Waits up to two seconds for a packet matching `wanted`
        async fn expect(&mut self, wanted: Seen) {
            let found = tokio::time::timeout(Duration::from_secs(2), async {
                while let Some(seen) = self.seen.recv().await {
                    if seen == wanted {
                        return true;
                    }
                }
                false
            })
            .await;
            assert_eq!(found, Ok(true), "broker never saw {wanted:?}");
        }
    }

    async fn read_packet(stream: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
        let header = stream.read_u8().await.ok()?;
        let mut length = 0usize;
        for shift in (0..28).step_by(7) {
            let byte = stream.read_u8().await.ok()?;
            length |= ((byte & 0x7f) as usize) << shift;
            if byte & 0x80 == 0 {
                break;
            }
        }
        let mut body = vec![0; length];
        stream.read_exact(&mut body).await.ok()?;
        Some((header, body))
    }

    fn first_topic(body: &[u8]) -> String {
        let len = u16::from_be_bytes([body[2], body[3]]) as usize;
        String::from_utf8_lossy(&body[4..4 + len]).into_owned()
    }

    async fn serve(
        mut stream: TcpStream,
        connection: usize,
        suback_code: u8,
        hang_up_after: Option<usize>,
        seen: mpsc::UnboundedSender<Seen>,
    ) {
        let mut subscriptions = 0;
        while let Some((header, body)) = read_packet(&mut stream).await {
            let reply = match header & 0xf0 {
                0x10 => {
                    let _ = seen.send(Seen::Connect(connection));
                    vec![0x20, 0x02, 0x00, 0x00]
                }
                0x80 => {
                    let _ = seen.send(Seen::Subscribe(connection, first_topic(&body)));
                    subscriptions += 1;
                    vec![0x90, 0x03, body[0], body[1], suback_code]
                }
                0xa0 => {
                    let _ = seen.send(Seen::Unsubscribe(connection, first_topic(&body)));
                    vec![0xb0, 0x02, body[0], body[1]]
                }
                0xc0 => vec![0xd0, 0x00],
                _ => continue,
            };
            if stream.write_all(&reply).await.is_err() {
                return;
            }
            if hang_up_after == Some(subscriptions) {
                return;
            }
        }
    }

    #[tokio::test]
    async fn shutdown_sends_unsubscribes_before_closing() {
        let mut broker = LocalBroker::start(0x01, None).await;
        let listener = Arc::new(CountingListener::default());
        let manager = ConnectionManager::connect(&broker.config(), listener.clone(), None)
            .await
            .unwrap();
        assert!(manager.is_connected());

        manager.subscribe(&["eraser_1/status".to_string()]).unwrap();
        broker
            .expect(Seen::Subscribe(0, "eraser_1/status".to_string()))
            .await;

        manager.shutdown().await;
        broker
            .expect(Seen::Unsubscribe(0, "eraser_1/status".to_string()))
            .await;
        assert_eq!(*manager.status().borrow(), LinkStatus::Closed);
        assert!(listener.offline.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn remembered_topics_are_replayed_after_reconnect() {
        let mut broker = LocalBroker::start(0x01, Some(2)).await;
        let listener = Arc::new(CountingListener::default());
        let manager = ConnectionManager::start(&broker.config(), listener.clone(), None).unwrap();

        // Still connecting, so both are only remembered until the connack
        let topics = vec!["eraser_1/status".to_string(), "eraser_2/status".to_string()];
        manager.subscribe(&topics).unwrap();

        broker.expect(Seen::Connect(0)).await;
        broker.expect(Seen::Subscribe(0, topics[0].clone())).await;
        broker.expect(Seen::Subscribe(0, topics[1].clone())).await;

        // The broker hung up; the link comes back and asks again
        broker.expect(Seen::Connect(1)).await;
        broker.expect(Seen::Subscribe(1, topics[0].clone())).await;
        broker.expect(Seen::Subscribe(1, topics[1].clone())).await;

        assert!(listener.connected.load(Ordering::SeqCst) >= 2);
        assert!(listener.offline.load(Ordering::SeqCst) >= 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn rejected_subscription_is_logged_and_link_stays_up() {
        let mut broker = LocalBroker::start(0x80, None).await;
        let listener = Arc::new(CountingListener::default());
        let manager = ConnectionManager::connect(&broker.config(), listener.clone(), None)
            .await
            .unwrap();

        manager.subscribe(&["eraser_3/status".to_string()]).unwrap();
        broker
            .expect(Seen::Subscribe(0, "eraser_3/status".to_string()))
            .await;

        let mut logged = false;
        for _ in 0..40 {
            if logs_contain("broker rejected 1 filter(s)") {
                logged = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(logged);
        assert!(manager.is_connected());
        assert_eq!(manager.subscribed_topics(), vec!["eraser_3/status"]);
        assert_eq!(listener.offline.load(Ordering::SeqCst), 0);

        manager.shutdown().await;
    }

    #[test]
    fn rejects_bad_endpoint_before_spawning() {
        let config = BrokerConfig {
            endpoint: "not a url".to_string(),
            ..Default::default()
        };
        let listener = Arc::new(CountingListener::default());
        assert!(matches!(
            ConnectionManager::start(&config, listener, None),
            Err(RelayError::Config(_))
        ));
    }
}
