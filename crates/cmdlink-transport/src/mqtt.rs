//! MQTT transport using rumqttc.
//!
//! `connect()` spawns a background task that drives the rumqttc event loop
//! for the lifetime of the process. Network errors move the session to
//! `Disconnected`; the task then waits the fixed reconnect interval and
//! polls again, which makes rumqttc dial the broker anew. Retries are
//! unbounded. Subscriptions are re-issued on every CONNACK.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use cmdlink_core::{BrokerConfig, topic_matches};
use parking_lot::{Mutex, RwLock};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::ack::AckTracker;
use crate::transport::{
    ConnectionState, InboundMessage, MessageHandler, Qos, Transport, TransportError,
};

/// Capacity of the rumqttc request channel.
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// Maximum MQTT packet size accepted and sent (1 MB).
const MAX_PACKET_SIZE: usize = 1024 * 1024;

struct Subscription {
    pattern: String,
    handler: Arc<dyn MessageHandler>,
}

/// State shared between the transport handle and its event-loop task.
struct Shared {
    client_id: String,
    qos: Qos,
    state_tx: watch::Sender<ConnectionState>,
    client: Mutex<Option<AsyncClient>>,
    subscriptions: RwLock<Vec<Subscription>>,
    acks: AckTracker,
}

impl Shared {
    fn set_state(&self, next: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            info!(client_id = %self.client_id, state = %next, "MQTT connection state changed");
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn client(&self) -> Option<AsyncClient> {
        self.client.lock().clone()
    }

    /// Re-issue every registered subscription. Runs on the event-loop task,
    /// so it must not await the request channel.
    fn resubscribe(&self) {
        let Some(client) = self.client() else {
            return;
        };
        for sub in self.subscriptions.read().iter() {
            match client.try_subscribe(sub.pattern.clone(), self.qos.into()) {
                Ok(()) => debug!(pattern = %sub.pattern, "Subscription issued"),
                Err(e) => warn!(pattern = %sub.pattern, error = %e, "Failed to issue subscription"),
            }
        }
    }

    fn route(&self, message: InboundMessage) {
        let handlers: Vec<Arc<dyn MessageHandler>> = self
            .subscriptions
            .read()
            .iter()
            .filter(|sub| topic_matches(&sub.pattern, &message.topic))
            .map(|sub| sub.handler.clone())
            .collect();

        if handlers.is_empty() {
            debug!(topic = %message.topic, "No handler for inbound message");
            return;
        }

        for handler in handlers {
            let message = message.clone();
            tokio::spawn(async move {
                handler.handle(message).await;
            });
        }
    }

    fn handle_event(&self, event: Event) {
        match event {
            Event::Incoming(Packet::ConnAck(_)) => {
                self.set_state(ConnectionState::Connected);
                self.resubscribe();
            }
            Event::Incoming(Packet::Publish(publish)) => {
                debug!(topic = %publish.topic, bytes = publish.payload.len(), "MQTT message received");
                self.route(InboundMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                    qos: publish.qos.into(),
                    retain: publish.retain,
                    received_at: Utc::now(),
                });
            }
            Event::Incoming(Packet::PubAck(ack)) => self.acks.on_ack(ack.pkid),
            Event::Incoming(Packet::PubComp(comp)) => self.acks.on_ack(comp.pkid),
            Event::Incoming(Packet::Disconnect) => {
                warn!(client_id = %self.client_id, "Broker sent DISCONNECT");
            }
            Event::Outgoing(Outgoing::Publish(pkid)) => self.acks.on_outgoing(pkid),
            _ => {}
        }
    }
}

/// MQTT transport with automatic reconnection.
pub struct MqttTransport {
    config: BrokerConfig,
    shared: Arc<Shared>,
    shutdown_tx: Mutex<Option<watch::Sender<bool>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttTransport {
    /// Create a transport. `role` is folded into the client id so the
    /// dispatcher and consumer processes never collide on the broker.
    pub fn new(config: BrokerConfig, role: &str) -> Self {
        let client_id = format!("{}-{}-{}", config.client_id, role, Uuid::new_v4().simple());
        let qos = Qos::from_level(config.qos).unwrap_or_default();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            config,
            shared: Arc::new(Shared {
                client_id,
                qos,
                state_tx,
                client: Mutex::new(None),
                subscriptions: RwLock::new(Vec::new()),
                acks: AckTracker::new(),
            }),
            shutdown_tx: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.shared.client_id
    }

    /// QoS used for publishes and subscriptions.
    pub fn qos(&self) -> Qos {
        self.shared.qos
    }

    fn mqtt_options(&self) -> MqttOptions {
        let mut options =
            MqttOptions::new(&self.shared.client_id, &self.config.host, self.config.port);
        options.set_keep_alive(self.config.keep_alive.max(Duration::from_secs(5)));
        options.set_clean_session(true);
        options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
        if let Some(username) = &self.config.username {
            options.set_credentials(username, self.config.password.as_deref().unwrap_or(""));
        }
        options
    }

    /// Start the background connection. Returns once the event loop is
    /// running; the session itself comes up asynchronously.
    pub fn connect(&self) -> Result<(), TransportError> {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return Ok(());
        }

        let (client, eventloop) = AsyncClient::new(self.mqtt_options(), REQUEST_CHANNEL_CAPACITY);
        *self.shared.client.lock() = Some(client);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.shutdown_tx.lock() = Some(shutdown_tx);

        info!(
            client_id = %self.shared.client_id,
            broker = %self.config.broker_addr(),
            "Connecting to MQTT broker"
        );
        self.shared.set_state(ConnectionState::Connecting);

        *task = Some(tokio::spawn(run_event_loop(
            eventloop,
            self.shared.clone(),
            self.config.reconnect_interval,
            shutdown_rx,
        )));
        Ok(())
    }

    /// Wait until the session is connected or the timeout elapses.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut rx = self.shared.state_tx.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|s| s.is_connected()))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    /// Stop the event loop and close the session.
    pub async fn disconnect(&self) {
        if let Some(client) = self.shared.client() {
            if let Err(e) = client.try_disconnect() {
                debug!(error = %e, "MQTT disconnect request not delivered");
            }
        }
        if let Some(shutdown) = self.shutdown_tx.lock().take() {
            let _ = shutdown.send(true);
        }

        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
                warn!("MQTT event loop did not stop in time");
            }
        }

        *self.shared.client.lock() = None;
        self.shared.acks.reset(TransportError::NotConnected);
        self.shared.set_state(ConnectionState::Disconnected);
        info!(client_id = %self.shared.client_id, "MQTT transport stopped");
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    shared: Arc<Shared>,
    reconnect_interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            polled = eventloop.poll() => match polled {
                Ok(event) => shared.handle_event(event),
                Err(e) => {
                    shared.set_state(ConnectionState::Disconnected);
                    shared.acks.fail_all(TransportError::NotConnected);
                    error!(
                        client_id = %shared.client_id,
                        error = %e,
                        retry_in_secs = reconnect_interval.as_secs(),
                        "MQTT connection error"
                    );

                    tokio::select! {
                        _ = shutdown_rx.changed() => break,
                        _ = tokio::time::sleep(reconnect_interval) => {}
                    }
                    shared.set_state(ConnectionState::Connecting);
                }
            }
        }
    }
    debug!(client_id = %shared.client_id, "MQTT event loop exited");
}

#[async_trait]
impl Transport for MqttTransport {
    fn connection_state(&self) -> ConnectionState {
        self.shared.state()
    }

    fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let client = self.shared.client().ok_or(TransportError::NotConnected)?;

        if qos == Qos::AtMostOnce {
            return client
                .publish(topic, qos.into(), false, payload)
                .await
                .map_err(|e| TransportError::PublishFailed(e.to_string()));
        }

        let ack = self
            .shared
            .acks
            .submit(|| client.try_publish(topic, qos.into(), false, payload))
            .map_err(|e| TransportError::PublishFailed(e.to_string()))?;

        match tokio::time::timeout(self.config.publish_timeout, ack).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::PublishFailed(
                "acknowledgement tracking dropped".to_string(),
            )),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), TransportError> {
        self.shared.subscriptions.write().push(Subscription {
            pattern: pattern.to_string(),
            handler,
        });

        // Not connected yet: the CONNACK handler issues it
        if self.is_connected() {
            if let Some(client) = self.shared.client() {
                client
                    .subscribe(pattern, self.shared.qos.into())
                    .await
                    .map_err(|e| TransportError::SubscribeFailed(e.to_string()))?;
            }
        }
        info!(pattern = %pattern, "Registered MQTT subscription");
        Ok(())
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}
