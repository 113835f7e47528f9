//! Configuration Module
//!
//! The feed endpoint and subscription are static: `Config::default()` carries
//! the OKX public endpoint and the `books`/`BTC-USDT` subscription. A Java-style
//! `config.properties` file (KEY=VALUE) may override any of them, which is how
//! the integration tests point the client at a loopback server.

use std::collections::HashMap;
use std::num::NonZeroU64;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::manager::{Backoff, RetryPolicy};
use crate::protocol::Subscription;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse property '{key}': {reason}")]
    ParseError { key: String, reason: String },
}

/// Feed client configuration
///
/// Property names: HOST, PORT, PATH, USE_SSL, CHANNEL, INST_ID, SUBPROTOCOL,
/// BACKOFF, RETRY_INTERVAL_MS, MAX_RETRIES, SUMMARY_INTERVAL_MS,
/// CONNECT_TIMEOUT_MS, JSON_SUMMARY
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub use_ssl: bool,
    pub channel: String,
    pub inst_id: String,
    /// Sent as `Sec-WebSocket-Protocol` when set.
    pub subprotocol: Option<String>,
    pub backoff: Backoff,
    pub retry_interval_ms: u64,
    pub max_retries: u32,
    pub summary_interval_ms: u64,
    pub connect_timeout_ms: u64,
    /// Also print each interval summary to stdout as one JSON line.
    pub json_summary: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "ws.okx.com".into(),
            port: 8443,
            path: "/ws/v5/public".into(),
            use_ssl: true,
            channel: "books".into(),
            inst_id: "BTC-USDT".into(),
            subprotocol: None,
            backoff: Backoff::Exponential,
            retry_interval_ms: 1000,
            max_retries: 10,
            summary_interval_ms: 1000,
            connect_timeout_ms: 10_000,
            json_summary: false,
        }
    }
}

impl Config {
    /// Parse a Java-style .properties file into a HashMap.
    /// Skips blank lines and lines starting with '#'.
    fn parse_properties(content: &str) -> HashMap<String, String> {
        let mut map = HashMap::new();
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = trimmed.split_once('=') {
                map.insert(key.trim().to_string(), value.trim().to_string());
            }
        }
        map
    }

    /// Parse a single typed property, `None` when absent.
    fn parse_prop<T: FromStr>(
        props: &HashMap<String, String>,
        key: &str,
        kind: &str,
    ) -> Result<Option<T>, ConfigError> {
        props
            .get(key)
            .map(|v| {
                v.parse().map_err(|_| ConfigError::ParseError {
                    key: key.into(),
                    reason: format!("invalid {}: {}", kind, v),
                })
            })
            .transpose()
    }

    /// Parse a millisecond interval; zero is rejected.
    fn parse_millis(
        props: &HashMap<String, String>,
        key: &str,
        default: u64,
    ) -> Result<u64, ConfigError> {
        Ok(Self::parse_prop::<NonZeroU64>(props, key, "non-zero u64")?
            .map_or(default, NonZeroU64::get))
    }

    /// Load configuration from a .properties file (Java KEY=VALUE format).
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_properties_str(&content)
    }

    /// Parse config from a properties-format string.
    pub fn from_properties_str(content: &str) -> Result<Self, ConfigError> {
        let props = Self::parse_properties(content);
        let defaults = Config::default();

        Ok(Config {
            host: props.get("HOST").cloned().unwrap_or(defaults.host),
            port: Self::parse_prop(&props, "PORT", "u16")?.unwrap_or(defaults.port),
            path: props.get("PATH").cloned().unwrap_or(defaults.path),
            use_ssl: props
                .get("USE_SSL")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.use_ssl),
            channel: props.get("CHANNEL").cloned().unwrap_or(defaults.channel),
            inst_id: props.get("INST_ID").cloned().unwrap_or(defaults.inst_id),
            subprotocol: props
                .get("SUBPROTOCOL")
                .filter(|v| !v.is_empty())
                .cloned()
                .or(defaults.subprotocol),
            backoff: Self::parse_prop(&props, "BACKOFF", "backoff (exponential|fixed)")?
                .unwrap_or(defaults.backoff),
            retry_interval_ms: Self::parse_millis(
                &props,
                "RETRY_INTERVAL_MS",
                defaults.retry_interval_ms,
            )?,
            max_retries: Self::parse_prop(&props, "MAX_RETRIES", "u32")?
                .unwrap_or(defaults.max_retries),
            summary_interval_ms: Self::parse_millis(
                &props,
                "SUMMARY_INTERVAL_MS",
                defaults.summary_interval_ms,
            )?,
            connect_timeout_ms: Self::parse_millis(
                &props,
                "CONNECT_TIMEOUT_MS",
                defaults.connect_timeout_ms,
            )?,
            json_summary: props
                .get("JSON_SUMMARY")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.json_summary),
        })
    }

    /// Load configuration from ./config.properties, falling back to defaults.
    pub fn load_or_default() -> Self {
        let path = "config.properties";

        if Path::new(path).exists() {
            match Self::load(path) {
                Ok(config) => {
                    log::info!("Loaded configuration from {}", path);
                    return config;
                }
                Err(e) => {
                    log::warn!("Failed to parse {}: {}", path, e);
                }
            }
        }

        log::info!("No usable config.properties found, using built-in OKX defaults");
        Self::default()
    }

    /// Generate the WebSocket URL based on configuration
    pub fn websocket_url(&self) -> String {
        let protocol = if self.use_ssl { "wss" } else { "ws" };
        format!("{}://{}:{}{}", protocol, self.host, self.port, self.path)
    }

    pub fn subscription(&self) -> Subscription {
        Subscription::new(&self.channel, &self.inst_id)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            backoff: self.backoff,
            base_interval: Duration::from_millis(self.retry_interval_ms),
            max_attempts: self.max_retries,
        }
    }

    pub fn summary_interval(&self) -> Duration {
        Duration::from_millis(self.summary_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Log all configuration parameters for debugging
    pub fn log_config(&self) {
        log::debug!("Configuration:");
        log::debug!("  url: {}", self.websocket_url());
        log::debug!("  subscription: {}/{}", self.channel, self.inst_id);
        log::debug!("  subprotocol: {:?}", self.subprotocol);
        log::debug!("  backoff: {:?}", self.backoff);
        log::debug!("  retry_interval: {} ms", self.retry_interval_ms);
        log::debug!("  max_retries: {}", self.max_retries);
        log::debug!("  summary_interval: {} ms", self.summary_interval_ms);
        log::debug!("  connect_timeout: {} ms", self.connect_timeout_ms);
        log::debug!("  json_summary: {}", self.json_summary);
    }
}
