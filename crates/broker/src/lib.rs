use std::{collections::VecDeque, sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, NetworkOptions, Packet, QoS, SubscribeReasonCode,
    Transport,
};
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use shared::domain::{topics, LinkStatus, LogDirection, LogEntry};
use storage::LogJournal;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const KEEP_ALIVE: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const EVENT_CHANNEL_CAPACITY: usize = 1024;
const REQUEST_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct BrokerOptions {
    pub url: String,
    pub username: String,
    pub password: String,
    pub client_id_prefix: String,
}

impl BrokerOptions {
    /// Random per-session client id so concurrent consoles never evict
    /// each other from the broker.
    fn client_id(&self) -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{}_{}", self.client_id_prefix, &suffix[..8])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    StatusChanged(LinkStatus),
    MessageReceived { topic: String, payload: String },
}

#[async_trait]
pub trait BrokerLink: Send + Sync {
    /// Publishes at qos 0 without retain, mirroring the outcome into the
    /// journal. Fails when the link is not connected.
    async fn publish(&self, topic: &str, payload: &str) -> Result<()>;
    fn status(&self) -> LinkStatus;
    fn subscribe_events(&self) -> broadcast::Receiver<BrokerEvent>;
    async fn shutdown(&self);
}

/// MQTT link over rumqttc. Reconnection is the client library's job; this
/// layer reflects status transitions, subscribes the fixed topic set after
/// every connect, and mirrors all traffic into the journal.
pub struct MqttBrokerLink {
    client: AsyncClient,
    journal: Arc<LogJournal>,
    events: broadcast::Sender<BrokerEvent>,
    status: watch::Sender<LinkStatus>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttBrokerLink {
    /// Spawns the broker event loop and returns immediately. The link
    /// starts out `connecting` and flips to `connected` on the first
    /// ConnAck.
    pub async fn connect(options: &BrokerOptions, journal: Arc<LogJournal>) -> Result<Arc<Self>> {
        let mqtt_options = build_mqtt_options(options)?;
        let (client, mut event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);
        event_loop.set_network_options(build_network_options());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (status, _) = watch::channel(LinkStatus::Connecting);

        let link = Arc::new(Self {
            client,
            journal,
            events,
            status,
            poll_task: Mutex::new(None),
        });

        let task = link.spawn_poll_loop(event_loop);
        *link.poll_task.lock().await = Some(task);

        info!(url = %options.url, "mqtt link starting");
        Ok(link)
    }

    fn spawn_poll_loop(self: &Arc<Self>, mut event_loop: EventLoop) -> JoinHandle<()> {
        let link = Arc::clone(self);
        tokio::spawn(async move {
            // Subscribe requests are single-topic, so acks come back in
            // request order.
            let mut pending_subscriptions: VecDeque<String> = VecDeque::new();

            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt link established");
                        link.set_status(LinkStatus::Connected);
                        link.mirror(
                            topics::SYSTEM,
                            "Connected to MQTT broker",
                            LogDirection::System,
                        )
                        .await;

                        pending_subscriptions.clear();
                        for topic in topics::ALL {
                            match link.client.subscribe(topic, QoS::AtMostOnce).await {
                                Ok(()) => pending_subscriptions.push_back(topic.to_string()),
                                Err(error) => {
                                    link.mirror(
                                        topics::SYSTEM,
                                        format!("Failed to subscribe to {topic}: {error}"),
                                        LogDirection::Error,
                                    )
                                    .await;
                                }
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::SubAck(ack))) => {
                        let Some(topic) = pending_subscriptions.pop_front() else {
                            debug!(pkid = ack.pkid, "unexpected suback");
                            continue;
                        };
                        match ack.return_codes.first() {
                            Some(SubscribeReasonCode::Failure) => {
                                link.mirror(
                                    topics::SYSTEM,
                                    format!("Failed to subscribe to {topic}: rejected by broker"),
                                    LogDirection::Error,
                                )
                                .await;
                            }
                            _ => {
                                debug!(%topic, "subscription acknowledged");
                                link.mirror(
                                    topics::SYSTEM,
                                    format!("Subscribed to {topic}"),
                                    LogDirection::System,
                                )
                                .await;
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let payload = String::from_utf8_lossy(&publish.payload).to_string();
                        debug!(topic = %publish.topic, bytes = publish.payload.len(), "message received");
                        link.mirror(&publish.topic, payload.clone(), LogDirection::Received)
                            .await;
                        let _ = link.events.send(BrokerEvent::MessageReceived {
                            topic: publish.topic.clone(),
                            payload,
                        });
                    }
                    Ok(_) => {}
                    Err(error) => {
                        warn!(%error, "mqtt link lost");
                        pending_subscriptions.clear();
                        link.set_status(LinkStatus::Disconnected);
                        link.mirror(
                            topics::SYSTEM,
                            format!("MQTT Error: {error}"),
                            LogDirection::Error,
                        )
                        .await;
                        link.mirror(
                            topics::SYSTEM,
                            "Disconnected from MQTT broker",
                            LogDirection::System,
                        )
                        .await;

                        tokio::time::sleep(RECONNECT_DELAY).await;

                        link.set_status(LinkStatus::Connecting);
                        link.mirror(
                            topics::SYSTEM,
                            "Reconnecting to MQTT broker...",
                            LogDirection::System,
                        )
                        .await;
                    }
                }
            }
        })
    }

    fn set_status(&self, status: LinkStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            let _ = self.events.send(BrokerEvent::StatusChanged(status));
        }
    }

    /// Journal writes are best effort: a storage hiccup must not take the
    /// link down.
    async fn mirror(&self, topic: &str, message: impl Into<String>, direction: LogDirection) {
        let entry = LogEntry::local(topic, message, direction);
        if let Err(error) = self.journal.append(entry).await {
            warn!(%error, "failed to mirror broker event into journal");
        }
    }
}

#[async_trait]
impl BrokerLink for MqttBrokerLink {
    async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        let status = self.status();
        if status != LinkStatus::Connected {
            self.mirror(
                topics::SYSTEM,
                "Cannot publish: MQTT not connected",
                LogDirection::Error,
            )
            .await;
            return Err(anyhow!("cannot publish to {topic}: mqtt link is {status}"));
        }

        match self.client.publish(topic, QoS::AtMostOnce, false, payload).await {
            Ok(()) => {
                self.mirror(topic, payload, LogDirection::Sent).await;
                Ok(())
            }
            Err(error) => {
                self.mirror(
                    topic,
                    format!("Publish error: {error}"),
                    LogDirection::Error,
                )
                .await;
                Err(anyhow!("publish to {topic} failed: {error}"))
            }
        }
    }

    fn status(&self) -> LinkStatus {
        *self.status.borrow()
    }

    fn subscribe_events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    async fn shutdown(&self) {
        if let Some(task) = self.poll_task.lock().await.take() {
            let _ = self.client.disconnect().await;
            task.abort();
        }
        self.set_status(LinkStatus::Disconnected);
    }
}

/// Placeholder for clients built without a broker; REST-only flows keep
/// working and every broker operation fails loudly.
pub struct MissingBrokerLink {
    events: broadcast::Sender<BrokerEvent>,
}

impl MissingBrokerLink {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1);
        Self { events }
    }
}

impl Default for MissingBrokerLink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerLink for MissingBrokerLink {
    async fn publish(&self, _topic: &str, _payload: &str) -> Result<()> {
        Err(anyhow!("mqtt link not configured"))
    }

    fn status(&self) -> LinkStatus {
        LinkStatus::Disconnected
    }

    fn subscribe_events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    async fn shutdown(&self) {}
}

fn build_mqtt_options(options: &BrokerOptions) -> Result<MqttOptions> {
    let url = Url::parse(&options.url)
        .with_context(|| format!("invalid broker url '{}'", options.url))?;
    let scheme = url.scheme();
    let host = url
        .host_str()
        .ok_or_else(|| anyhow!("broker url '{}' has no host", options.url))?;
    let port = url.port().unwrap_or_else(|| default_port(scheme));

    let mut mqtt_options = match scheme {
        // rumqttc wants the full url, scheme and path included, as the
        // broker address for websocket transports.
        "ws" => {
            let mut opts = MqttOptions::new(options.client_id(), options.url.clone(), port);
            opts.set_transport(Transport::ws());
            opts
        }
        "wss" => {
            let mut opts = MqttOptions::new(options.client_id(), options.url.clone(), port);
            opts.set_transport(Transport::wss_with_default_config());
            opts
        }
        "mqtts" | "ssl" => {
            let mut opts = MqttOptions::new(options.client_id(), host, port);
            opts.set_transport(Transport::tls_with_default_config());
            opts
        }
        "mqtt" | "tcp" => MqttOptions::new(options.client_id(), host, port),
        other => return Err(anyhow!("unsupported broker url scheme '{other}'")),
    };

    mqtt_options.set_keep_alive(KEEP_ALIVE);
    mqtt_options.set_clean_session(true);
    if !options.username.is_empty() {
        mqtt_options.set_credentials(options.username.clone(), options.password.clone());
    }

    Ok(mqtt_options)
}

/// The connect timeout is a socket concern and rides on the event loop's
/// network options, not on `MqttOptions`.
fn build_network_options() -> NetworkOptions {
    let mut network_options = NetworkOptions::new();
    network_options.set_connection_timeout(CONNECT_TIMEOUT.as_secs());
    network_options
}

fn default_port(scheme: &str) -> u16 {
    match scheme {
        "ws" => 8083,
        "wss" => 8084,
        "mqtts" | "ssl" => 8883,
        _ => 1883,
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
