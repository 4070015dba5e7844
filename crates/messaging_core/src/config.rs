use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use tracing::warn;

use crate::{connection::ConnectionConfig, queue::QueueConfig, retry::RetryConfig};

pub const DEFAULT_CONFIG_PATH: &str = "messaging.toml";

#[derive(Debug, Clone)]
pub struct Settings {
    pub server_url: String,
    pub ws_url: Option<String>,
    pub auth_token: Option<String>,
    pub retry: RetryConfig,
    pub queue: QueueConfig,
    pub connection: ConnectionConfig,
    pub bulk_batch_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:5000".into(),
            ws_url: None,
            auth_token: None,
            retry: RetryConfig::default(),
            queue: QueueConfig::default(),
            connection: ConnectionConfig::default(),
            bulk_batch_size: 10,
        }
    }
}

impl Settings {
    pub fn resolved_ws_url(&self) -> anyhow::Result<url::Url> {
        if let Some(ws_url) = &self.ws_url {
            return Ok(url::Url::parse(ws_url)?);
        }
        let mut url = url::Url::parse(&self.server_url)?;
        let scheme = match url.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => anyhow::bail!("server_url must use http or https, got {other}"),
        };
        url.set_scheme(scheme)
            .map_err(|_| anyhow::anyhow!("cannot derive websocket url from {}", self.server_url))?;
        url.set_path("/ws");
        Ok(url)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileSettings {
    server_url: Option<String>,
    ws_url: Option<String>,
    auth_token: Option<String>,
    retry: FileRetry,
    queue: FileQueue,
    connection: FileConnection,
    bulk: FileBulk,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileRetry {
    max_retries: Option<u32>,
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileQueue {
    batch_size: Option<usize>,
    flush_interval_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConnection {
    max_reconnect_attempts: Option<u32>,
    ack_timeout_ms: Option<u64>,
    typing_idle_ms: Option<u64>,
    reconnect_base_ms: Option<u64>,
    reconnect_max_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileBulk {
    batch_size: Option<usize>,
}

pub fn load_settings() -> Settings {
    let path = std::env::var("MESSAGING_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
    let mut settings = load_settings_from(Path::new(&path));
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    settings
}

pub fn load_settings_from(path: &Path) -> Settings {
    let mut settings = Settings::default();
    let Ok(raw) = fs::read_to_string(path) else {
        return settings;
    };
    match toml::from_str::<FileSettings>(&raw) {
        Ok(file_cfg) => merge_file_settings(&mut settings, file_cfg),
        Err(err) => warn!(path = %path.display(), "config: ignoring unparsable settings file: {err}"),
    }
    settings
}

fn merge_file_settings(settings: &mut Settings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.server_url {
        settings.server_url = v;
    }
    if file_cfg.ws_url.is_some() {
        settings.ws_url = file_cfg.ws_url;
    }
    if file_cfg.auth_token.is_some() {
        settings.auth_token = file_cfg.auth_token;
    }

    let retry = file_cfg.retry;
    if let Some(v) = retry.max_retries {
        settings.retry.max_retries = v;
    }
    if let Some(v) = retry.base_delay_ms {
        settings.retry.base_delay = Duration::from_millis(v);
    }
    if let Some(v) = retry.max_delay_ms {
        settings.retry.max_delay = Duration::from_millis(v);
    }

    if let Some(v) = file_cfg.queue.batch_size {
        settings.queue.batch_size = v;
    }
    if let Some(v) = file_cfg.queue.flush_interval_ms {
        settings.queue.flush_interval = Duration::from_millis(v);
    }

    let connection = file_cfg.connection;
    if let Some(v) = connection.max_reconnect_attempts {
        settings.connection.max_reconnect_attempts = v;
    }
    if let Some(v) = connection.ack_timeout_ms {
        settings.connection.ack_timeout = Duration::from_millis(v);
    }
    if let Some(v) = connection.typing_idle_ms {
        settings.connection.typing_idle = Duration::from_millis(v);
    }
    if let Some(v) = connection.reconnect_base_ms {
        settings.connection.reconnect_base = Duration::from_millis(v);
    }
    if let Some(v) = connection.reconnect_max_ms {
        settings.connection.reconnect_max = Duration::from_millis(v);
    }

    if let Some(v) = file_cfg.bulk.batch_size {
        settings.bulk_batch_size = v;
    }
}

pub fn apply_env_overrides(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("APP__SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = lookup("APP__WS_URL") {
        settings.ws_url = Some(v);
    }
    if let Some(v) = lookup("APP__AUTH_TOKEN") {
        settings.auth_token = Some(v);
    }
    if let Some(v) = parse_override(&lookup, "APP__MAX_RETRIES") {
        settings.retry.max_retries = v;
    }
    if let Some(v) = parse_override(&lookup, "APP__MAX_RECONNECT_ATTEMPTS") {
        settings.connection.max_reconnect_attempts = v;
    }
    if let Some(v) = parse_override(&lookup, "APP__BULK_BATCH_SIZE") {
        settings.bulk_batch_size = v;
    }
}

fn parse_override<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!(key, value = %raw, "config: ignoring invalid numeric override");
            None
        }
    }
}
