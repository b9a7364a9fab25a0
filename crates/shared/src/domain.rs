use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Topics the dashboard bridge publishes and listens on. The set is fixed;
/// the broker link subscribes to all of them on every (re)connect.
pub mod topics {
    pub const WEATHER_RAW: &str = "home/weather/raw";
    pub const WEATHER_LED: &str = "home/weather/led";
    pub const EXCHANGE_RAW: &str = "home/exchange/raw";
    pub const EXCHANGE_LED: &str = "home/exchange/led";
    pub const CUSTOM_MESSAGE: &str = "home/custom/message";
    pub const LED_SETTINGS: &str = "home/led/settings";

    /// Pseudo-topic for link lifecycle entries in the journal.
    pub const SYSTEM: &str = "system";

    pub const ALL: [&str; 6] = [
        WEATHER_RAW,
        WEATHER_LED,
        EXCHANGE_RAW,
        EXCHANGE_LED,
        CUSTOM_MESSAGE,
        LED_SETTINGS,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogDirection {
    Sent,
    Received,
    System,
    Error,
}

impl fmt::Display for LogDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogDirection::Sent => "sent",
            LogDirection::Received => "received",
            LogDirection::System => "system",
            LogDirection::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    Local,
    Remote,
}

impl fmt::Display for LogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogSource::Local => "local",
            LogSource::Remote => "remote",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LinkStatus::Disconnected => "disconnected",
            LinkStatus::Connecting => "connecting",
            LinkStatus::Connected => "connected",
        })
    }
}

/// One mirrored broker event. Local entries are written by this process;
/// remote entries come from the backend's request log and only ever exist
/// in aggregated views.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub topic: String,
    pub message: String,
    pub direction: LogDirection,
    pub source: LogSource,
}

impl LogEntry {
    pub fn local(
        topic: impl Into<String>,
        message: impl Into<String>,
        direction: LogDirection,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            topic: topic.into(),
            message: message.into(),
            direction,
            source: LogSource::Local,
        }
    }

    /// Case-insensitive substring match on the topic.
    pub fn topic_contains(&self, needle: &str) -> bool {
        self.topic
            .to_lowercase()
            .contains(&needle.to_lowercase())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CurrencyPair {
    pub base: String,
    pub target: String,
}

impl CurrencyPair {
    pub fn new(base: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            target: target.into(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid currency pair '{0}': expected BASE/TARGET")]
pub struct ParseCurrencyPairError(pub String);

impl FromStr for CurrencyPair {
    type Err = ParseCurrencyPairError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.split_once('/') {
            // Exactly one separator: the target half must not contain
            // another slash.
            Some((base, target))
                if !base.is_empty() && !target.is_empty() && !target.contains('/') =>
            {
                Ok(Self::new(base, target))
            }
            _ => Err(ParseCurrencyPairError(raw.to_string())),
        }
    }
}

impl fmt::Display for CurrencyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.target)
    }
}
