use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;

use shared::domain::CurrencyPair;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub api_base_url: String,
    pub broker_url: String,
    pub broker_username: String,
    pub broker_password: String,
    pub client_id_prefix: String,
    pub database_url: String,
    pub auto_period_ms: u64,
    pub auto_pairs: Vec<String>,
    pub request_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:8080".into(),
            broker_url: "ws://127.0.0.1:8083/mqtt".into(),
            broker_username: String::new(),
            broker_password: String::new(),
            client_id_prefix: "ledboard".into(),
            database_url: "sqlite://./data/panel.db".into(),
            auto_period_ms: 5000,
            auto_pairs: crate::auto::default_rotation_pairs()
                .iter()
                .map(|pair| pair.to_string())
                .collect(),
            request_timeout_secs: 30,
        }
    }
}

impl Settings {
    pub fn auto_period(&self) -> Duration {
        Duration::from_millis(self.auto_period_ms)
    }

    pub fn currency_pairs(&self) -> anyhow::Result<Vec<CurrencyPair>> {
        self.auto_pairs
            .iter()
            .map(|raw| {
                raw.parse::<CurrencyPair>()
                    .with_context(|| format!("invalid currency pair '{raw}' in auto_pairs"))
            })
            .collect()
    }
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("panel.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            if let Some(v) = file_cfg.get("api_base_url") {
                settings.api_base_url = v.clone();
            }
            if let Some(v) = file_cfg.get("broker_url") {
                settings.broker_url = v.clone();
            }
            if let Some(v) = file_cfg.get("broker_username") {
                settings.broker_username = v.clone();
            }
            if let Some(v) = file_cfg.get("broker_password") {
                settings.broker_password = v.clone();
            }
            if let Some(v) = file_cfg.get("client_id_prefix") {
                settings.client_id_prefix = v.clone();
            }
            if let Some(v) = file_cfg.get("database_url") {
                settings.database_url = v.clone();
            }
            if let Some(v) = file_cfg.get("auto_period_ms") {
                if let Ok(parsed) = v.parse::<u64>() {
                    settings.auto_period_ms = parsed;
                }
            }
            if let Some(v) = file_cfg.get("auto_pairs") {
                settings.auto_pairs = parse_pair_list(v);
            }
            if let Some(v) = file_cfg.get("request_timeout_secs") {
                if let Ok(parsed) = v.parse::<u64>() {
                    settings.request_timeout_secs = parsed;
                }
            }
        }
    }

    if let Ok(v) = std::env::var("API_BASE_URL") {
        settings.api_base_url = v;
    }
    if let Ok(v) = std::env::var("PANEL__API_BASE_URL") {
        settings.api_base_url = v;
    }

    if let Ok(v) = std::env::var("MQTT_BROKER_URL") {
        settings.broker_url = v;
    }
    if let Ok(v) = std::env::var("PANEL__BROKER_URL") {
        settings.broker_url = v;
    }

    if let Ok(v) = std::env::var("MQTT_USERNAME") {
        settings.broker_username = v;
    }
    if let Ok(v) = std::env::var("PANEL__BROKER_USERNAME") {
        settings.broker_username = v;
    }

    if let Ok(v) = std::env::var("MQTT_PASSWORD") {
        settings.broker_password = v;
    }
    if let Ok(v) = std::env::var("PANEL__BROKER_PASSWORD") {
        settings.broker_password = v;
    }

    if let Ok(v) = std::env::var("PANEL__CLIENT_ID_PREFIX") {
        settings.client_id_prefix = v;
    }

    if let Ok(v) = std::env::var("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Ok(v) = std::env::var("PANEL__DATABASE_URL") {
        settings.database_url = v;
    }

    if let Ok(v) = std::env::var("PANEL__AUTO_PERIOD_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.auto_period_ms = parsed;
        }
    }

    if let Ok(v) = std::env::var("PANEL__AUTO_PAIRS") {
        settings.auto_pairs = parse_pair_list(&v);
    }

    if let Ok(v) = std::env::var("PANEL__REQUEST_TIMEOUT_SECS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.request_timeout_secs = parsed;
        }
    }

    settings
}

fn parse_pair_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
mod tests {
    use std::{
        env,
        time::{SystemTime, UNIX_EPOCH},
    };

    use super::*;

    #[test]
    fn normalizes_plain_file_path_to_sqlite_url() {
        assert_eq!(
            normalize_database_url("./data/test.db"),
            "sqlite://./data/test.db"
        );
    }

    #[test]
    fn creates_parent_dir_for_sqlite_url() {
        let suffix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();

        let temp_root = env::temp_dir().join(format!("ledboard_config_test_{suffix}"));
        let raw = format!("{}/data/panel.db", temp_root.display());

        prepare_database_url(&raw).expect("prepare db url");
        assert!(temp_root.join("data").exists());

        fs::remove_dir_all(temp_root).expect("cleanup");
    }

    #[test]
    fn default_auto_pairs_parse_cleanly() {
        let pairs = Settings::default().currency_pairs().expect("pairs");
        assert_eq!(pairs.len(), 6);
        assert_eq!(pairs[0].to_string(), "USD/VND");
    }

    #[test]
    fn invalid_auto_pair_is_rejected() {
        let settings = Settings {
            auto_pairs: vec!["nonsense".into()],
            ..Default::default()
        };
        assert!(settings.currency_pairs().is_err());
    }

    #[test]
    fn pair_list_splits_on_commas_and_trims() {
        assert_eq!(
            parse_pair_list("USD/VND, EUR/VND ,"),
            vec!["USD/VND".to_string(), "EUR/VND".to_string()]
        );
    }

    #[test]
    fn default_period_is_five_seconds() {
        assert_eq!(Settings::default().auto_period(), Duration::from_secs(5));
    }
}
