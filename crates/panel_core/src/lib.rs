use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{info, warn};

use broker::{BrokerEvent, BrokerLink};
use shared::{
    domain::{CurrencyPair, LinkStatus, LogDirection, LogEntry, LogSource},
    protocol::{
        parse_wire_timestamp, DataEnvelope, ExchangeDisplayRequest, ExchangeSnapshot,
        LedSettingsUpdate, LocationUpdate, MessageRecord, MessageSendRequest, RemoteLogRecord,
        WeatherSnapshot,
    },
};
use storage::LogJournal;

pub mod auto;
pub mod config;

pub use auto::{
    AutoRotation, AutoRotationError, AutoStatus, DisplayDispatcher, DisplaySlot,
    BASELINE_SCROLL_SPEED, ROTATION_PERIOD,
};
pub use config::{load_settings, Settings};

const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(30);
const EVENT_CHANNEL_CAPACITY: usize = 1024;
/// Rows requested from each side when building the merged log view.
const AGGREGATE_SOURCE_LIMIT: usize = 100;
/// Rows kept after merging both sides.
const AGGREGATE_TOTAL_LIMIT: usize = 200;

#[derive(Debug, Clone)]
pub enum PanelEvent {
    LinkStatusChanged(LinkStatus),
    BrokerMessage { topic: String, payload: String },
    ServerHealthChanged { online: bool },
    AutoStatusChanged(AutoStatus),
    Notice { text: String },
}

/// Last-write-wins cell for cached snapshots. Responses carry the ticket of
/// the request that produced them; a response from an older request never
/// overwrites one from a newer request.
#[derive(Debug)]
struct Versioned<T> {
    seq: u64,
    value: Option<T>,
}

impl<T> Default for Versioned<T> {
    fn default() -> Self {
        Self {
            seq: 0,
            value: None,
        }
    }
}

impl<T> Versioned<T> {
    fn apply(&mut self, seq: u64, value: Option<T>) -> bool {
        if seq < self.seq {
            return false;
        }
        self.seq = seq;
        self.value = value;
        true
    }
}

#[derive(Default)]
struct PanelState {
    server_online: Option<bool>,
    weather_view: Versioned<WeatherSnapshot>,
    exchange_view: Versioned<ExchangeSnapshot>,
    event_pump: Option<JoinHandle<()>>,
    health_task: Option<JoinHandle<()>>,
}

/// Client facade over the panel backend and the broker link. REST calls go
/// through one `reqwest` client with a global timeout; broker traffic and
/// rotation state surface as [`PanelEvent`]s.
pub struct PanelClient {
    http: Client,
    api_base_url: String,
    auto_pairs: Vec<CurrencyPair>,
    auto_period: Duration,
    broker: Arc<dyn BrokerLink>,
    journal: Arc<LogJournal>,
    auto: Mutex<Option<Arc<AutoRotation>>>,
    inner: Mutex<PanelState>,
    next_ticket: AtomicU64,
    events: broadcast::Sender<PanelEvent>,
}

impl PanelClient {
    pub fn new(
        settings: &Settings,
        broker: Arc<dyn BrokerLink>,
        journal: Arc<LogJournal>,
    ) -> Result<Arc<Self>> {
        let http = Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .context("failed to build http client")?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Arc::new(Self {
            http,
            api_base_url: settings.api_base_url.trim_end_matches('/').to_string(),
            auto_pairs: settings.currency_pairs()?,
            auto_period: settings.auto_period(),
            broker,
            journal,
            auto: Mutex::new(None),
            inner: Mutex::new(PanelState::default()),
            next_ticket: AtomicU64::new(0),
            events,
        }))
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PanelEvent> {
        self.events.subscribe()
    }

    pub fn link_status(&self) -> LinkStatus {
        self.broker.status()
    }

    pub fn journal(&self) -> &Arc<LogJournal> {
        &self.journal
    }

    /// `None` until the first health probe has run.
    pub async fn server_online(&self) -> Option<bool> {
        self.inner.lock().await.server_online
    }

    /// Forwards broker events into the client event stream. Replaces any
    /// pump from an earlier call.
    pub async fn spawn_event_pump(self: &Arc<Self>) {
        let mut broker_events = self.broker.subscribe_events();
        let client = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Ok(event) = broker_events.recv().await {
                let forwarded = match event {
                    BrokerEvent::StatusChanged(status) => PanelEvent::LinkStatusChanged(status),
                    BrokerEvent::MessageReceived { topic, payload } => {
                        PanelEvent::BrokerMessage { topic, payload }
                    }
                };
                let _ = client.events.send(forwarded);
            }
        });
        if let Some(previous) = self.inner.lock().await.event_pump.replace(task) {
            previous.abort();
        }
    }

    /// Probes the backend immediately and then every 30 s, emitting an
    /// event whenever availability flips.
    pub async fn spawn_health_poll(self: &Arc<Self>) {
        let client = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEALTH_POLL_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let online = client.health().await.is_ok();
                client.record_server_health(online).await;
            }
        });
        if let Some(previous) = self.inner.lock().await.health_task.replace(task) {
            previous.abort();
        }
    }

    /// Stops the rotation and the background tasks, then closes the broker
    /// link.
    pub async fn shutdown(&self) {
        if let Some(auto) = self.auto.lock().await.as_ref() {
            auto.stop().await;
        }
        let mut guard = self.inner.lock().await;
        if let Some(task) = guard.event_pump.take() {
            task.abort();
        }
        if let Some(task) = guard.health_task.take() {
            task.abort();
        }
        drop(guard);
        self.broker.shutdown().await;
    }

    pub async fn health(&self) -> Result<serde_json::Value> {
        let value = self
            .http
            .get(format!("{}/api/health", self.api_base_url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(value)
    }

    /// Fetches the current weather snapshot. Returns the freshest value the
    /// client has seen, which is the response itself unless a newer request
    /// already landed; `None` means the backend has no reading yet.
    pub async fn current_weather(&self) -> Result<Option<WeatherSnapshot>> {
        let ticket = self.take_ticket();
        let envelope: DataEnvelope<Option<WeatherSnapshot>> = self
            .http
            .get(format!("{}/api/weather/current", self.api_base_url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut guard = self.inner.lock().await;
        guard.weather_view.apply(ticket, envelope.data);
        Ok(guard.weather_view.value.clone())
    }

    pub async fn cached_weather(&self) -> Option<WeatherSnapshot> {
        self.inner.lock().await.weather_view.value.clone()
    }

    pub async fn update_location(&self, lat: f64, lon: f64) -> Result<()> {
        self.http
            .post(format!("{}/api/weather/location", self.api_base_url))
            .json(&LocationUpdate { lat, lon })
            .send()
            .await?
            .error_for_status()?;
        info!(lat, lon, "weather location updated");
        Ok(())
    }

    pub async fn weather_history(&self, limit: u32) -> Result<Vec<WeatherSnapshot>> {
        let envelope: DataEnvelope<Vec<WeatherSnapshot>> = self
            .http
            .get(format!("{}/api/weather/history", self.api_base_url))
            .query(&[("limit", limit)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(envelope.data)
    }

    /// Fetches the current rate for the pair, with the same last-write-wins
    /// caching as [`current_weather`](Self::current_weather).
    pub async fn current_exchange(&self, pair: &CurrencyPair) -> Result<Option<ExchangeSnapshot>> {
        let ticket = self.take_ticket();
        let envelope: DataEnvelope<Option<ExchangeSnapshot>> = self
            .http
            .get(format!("{}/api/exchange/current", self.api_base_url))
            .query(&[("base", pair.base.as_str()), ("target", pair.target.as_str())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut guard = self.inner.lock().await;
        guard.exchange_view.apply(ticket, envelope.data);
        Ok(guard.exchange_view.value.clone())
    }

    pub async fn cached_exchange(&self) -> Option<ExchangeSnapshot> {
        self.inner.lock().await.exchange_view.value.clone()
    }

    /// Asks the backend to fetch the pair and push it to the panel.
    pub async fn display_exchange(&self, pair: &CurrencyPair) -> Result<()> {
        self.http
            .post(format!("{}/api/exchange/display", self.api_base_url))
            .json(&ExchangeDisplayRequest {
                base: pair.base.clone(),
                target: pair.target.clone(),
            })
            .send()
            .await?
            .error_for_status()?;
        info!(pair = %pair, "exchange rate pushed to the panel");
        Ok(())
    }

    pub async fn exchange_history(&self, limit: u32) -> Result<Vec<ExchangeSnapshot>> {
        let envelope: DataEnvelope<Vec<ExchangeSnapshot>> = self
            .http
            .get(format!("{}/api/exchange/history", self.api_base_url))
            .query(&[("limit", limit)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(envelope.data)
    }

    /// Sends a free-form message to the panel. The message must be
    /// non-empty after trimming; the mode string is passed through opaque.
    pub async fn send_message(&self, message: &str, mode: &str) -> Result<()> {
        let message = message.trim();
        if message.is_empty() {
            return Err(anyhow!("message must not be empty"));
        }
        self.http
            .post(format!("{}/api/message/send", self.api_base_url))
            .json(&MessageSendRequest {
                message: message.to_string(),
                mode: mode.to_string(),
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn message_history(&self, limit: u32) -> Result<Vec<MessageRecord>> {
        let envelope: DataEnvelope<Vec<MessageRecord>> = self
            .http
            .get(format!("{}/api/message/history", self.api_base_url))
            .query(&[("limit", limit)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(envelope.data)
    }

    /// Applies speed, brightness, or mode to the panel. At least one field
    /// must be set.
    pub async fn apply_led_settings(&self, update: &LedSettingsUpdate) -> Result<()> {
        if update.is_empty() {
            return Err(anyhow!("led update must set speed, brightness, or mode"));
        }
        self.http
            .post(format!("{}/api/led/settings", self.api_base_url))
            .json(update)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn trigger_time_display(&self) -> Result<()> {
        self.http
            .post(format!("{}/api/auto/time", self.api_base_url))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn trigger_weather_display(&self) -> Result<()> {
        self.http
            .post(format!("{}/api/auto/weather", self.api_base_url))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn remote_logs(
        &self,
        limit: u32,
        topic_filter: Option<&str>,
    ) -> Result<Vec<RemoteLogRecord>> {
        let mut request = self
            .http
            .get(format!("{}/api/logs", self.api_base_url))
            .query(&[("limit", limit)]);
        if let Some(topic) = topic_filter {
            request = request.query(&[("topic", topic)]);
        }
        let envelope: DataEnvelope<Vec<RemoteLogRecord>> =
            request.send().await?.error_for_status()?.json().await?;
        Ok(envelope.data)
    }

    /// Merged view of the backend request log and the local journal: up to
    /// 100 rows from each side, newest first, 200 rows total. A backend
    /// failure degrades to the local journal alone instead of erroring.
    pub async fn aggregate_logs(&self, topic_filter: Option<&str>) -> Result<Vec<LogEntry>> {
        let remote = match self
            .remote_logs(AGGREGATE_SOURCE_LIMIT as u32, topic_filter)
            .await
        {
            Ok(rows) => rows,
            Err(error) => {
                warn!(%error, "backend log fetch failed, falling back to the local journal");
                let _ = self.events.send(PanelEvent::Notice {
                    text: format!("backend logs unavailable: {error}"),
                });
                Vec::new()
            }
        };

        let local = self
            .journal
            .filtered(topic_filter, AGGREGATE_SOURCE_LIMIT)
            .await?;
        Ok(merge_log_feeds(local, remote))
    }

    pub async fn clear_local_logs(&self) -> Result<()> {
        self.journal.clear().await
    }

    /// Publishes a raw payload on the broker link.
    pub async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        self.broker.publish(topic, payload).await
    }

    pub async fn auto_start(self: &Arc<Self>) -> Result<(), AutoRotationError> {
        self.auto().await.start().await
    }

    pub async fn auto_stop(self: &Arc<Self>) {
        self.auto().await.stop().await
    }

    pub async fn auto_status(self: &Arc<Self>) -> AutoStatus {
        self.auto().await.status().await
    }

    /// Lazily builds the rotation sequencer bound to this client.
    async fn auto(self: &Arc<Self>) -> Arc<AutoRotation> {
        let mut guard = self.auto.lock().await;
        if let Some(existing) = guard.as_ref() {
            return Arc::clone(existing);
        }
        let rotation = AutoRotation::new(
            Arc::clone(self) as Arc<dyn DisplayDispatcher>,
            self.auto_pairs.clone(),
            self.auto_period,
            self.events.clone(),
        );
        *guard = Some(Arc::clone(&rotation));
        rotation
    }

    async fn record_server_health(&self, online: bool) {
        let mut guard = self.inner.lock().await;
        if guard.server_online != Some(online) {
            guard.server_online = Some(online);
            drop(guard);
            let _ = self.events.send(PanelEvent::ServerHealthChanged { online });
        }
    }

    fn take_ticket(&self) -> u64 {
        self.next_ticket.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[async_trait]
impl DisplayDispatcher for PanelClient {
    async fn set_scroll_speed(&self, speed: u32) -> Result<()> {
        self.apply_led_settings(&LedSettingsUpdate {
            speed: Some(speed),
            ..Default::default()
        })
        .await
    }

    async fn show_time(&self) -> Result<()> {
        self.trigger_time_display().await
    }

    async fn show_weather(&self) -> Result<()> {
        self.trigger_weather_display().await
    }

    async fn show_exchange(&self, pair: &CurrencyPair) -> Result<()> {
        self.display_exchange(pair).await
    }
}

/// Merges local and remote rows newest first, keeping at most 200. The sort
/// is stable, so rows with equal timestamps keep their merge order (local
/// before remote). Remote rows with unparseable timestamps are dropped.
pub fn merge_log_feeds(local: Vec<LogEntry>, remote: Vec<RemoteLogRecord>) -> Vec<LogEntry> {
    let mut merged = local;
    merged.extend(remote.into_iter().filter_map(remote_record_to_entry));
    merged.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    merged.truncate(AGGREGATE_TOTAL_LIMIT);
    merged
}

fn remote_record_to_entry(record: RemoteLogRecord) -> Option<LogEntry> {
    let timestamp = parse_wire_timestamp(&record.created_at)?;
    let direction = match record.direction.as_str() {
        "sent" => LogDirection::Sent,
        "received" => LogDirection::Received,
        "error" => LogDirection::Error,
        _ => LogDirection::System,
    };
    Some(LogEntry {
        timestamp,
        topic: record.topic,
        message: record.message,
        direction,
        source: LogSource::Remote,
    })
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
