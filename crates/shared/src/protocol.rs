use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Every backend read returns its payload under a `data` key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataEnvelope<T> {
    pub data: T,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationUpdate {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeDisplayRequest {
    pub base: String,
    pub target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageSendRequest {
    pub message: String,
    pub mode: String,
}

/// Partial LED update. Unset fields are omitted from the JSON body so the
/// device keeps its current value for them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedSettingsUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brightness: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

impl LedSettingsUpdate {
    pub fn is_empty(&self) -> bool {
        self.speed.is_none() && self.brightness.is_none() && self.mode.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherSnapshot {
    pub temperature: f64,
    pub humidity: f64,
    pub pressure: f64,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wind_speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeSnapshot {
    pub base_currency: String,
    pub target_currency: String,
    pub rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub message: String,
    #[serde(default)]
    pub mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

/// One row of the backend's own request log. Direction and timestamp stay
/// raw strings on the wire; the aggregator maps them into `LogEntry`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteLogRecord {
    pub topic: String,
    pub message: String,
    #[serde(default)]
    pub direction: String,
    pub created_at: String,
}

/// Backend timestamps arrive either as RFC 3339 or as the bare
/// `YYYY-MM-DD HH:MM:SS` SQL form (taken as UTC).
pub fn parse_wire_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn led_update_omits_unset_fields() {
        let body = serde_json::to_value(LedSettingsUpdate {
            speed: Some(50),
            ..Default::default()
        })
        .expect("json");
        assert_eq!(body, serde_json::json!({ "speed": 50 }));
    }

    #[test]
    fn empty_led_update_serializes_to_empty_object() {
        let update = LedSettingsUpdate::default();
        assert!(update.is_empty());
        let body = serde_json::to_value(update).expect("json");
        assert_eq!(body, serde_json::json!({}));
    }

    #[test]
    fn envelope_unwraps_nullable_payload() {
        let missing: DataEnvelope<Option<WeatherSnapshot>> =
            serde_json::from_str(r#"{"data":null}"#).expect("envelope");
        assert!(missing.data.is_none());

        let present: DataEnvelope<Option<WeatherSnapshot>> = serde_json::from_str(
            r#"{"data":{"temperature":31.2,"humidity":78.0,"pressure":1009.0,"description":"light rain"}}"#,
        )
        .expect("envelope");
        let weather = present.data.expect("weather");
        assert_eq!(weather.description, "light rain");
        assert!(weather.wind_speed.is_none());
    }

    #[test]
    fn parses_both_wire_timestamp_forms() {
        let rfc = parse_wire_timestamp("2024-05-04T10:00:00Z").expect("rfc3339");
        let sql = parse_wire_timestamp("2024-05-04 10:00:00").expect("sql form");
        assert_eq!(rfc, sql);
        assert!(parse_wire_timestamp("yesterday").is_none());
    }

    #[test]
    fn remote_log_record_tolerates_missing_direction() {
        let row: RemoteLogRecord = serde_json::from_str(
            r#"{"topic":"home/led/settings","message":"{\"speed\":50}","created_at":"2024-05-04 10:00:00"}"#,
        )
        .expect("row");
        assert!(row.direction.is_empty());
    }
}
