use crate::delivery::telegram::DEFAULT_API_BASE;
use crate::stream::backoff::BackoffPolicy;
use crate::stream::manager::ManagerSettings;
use crate::stream::websocket::WebSocketSettings;
use crate::timestamp::DisplayZone;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// All errors that can occur while loading and validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid value {value:?} for {name}: {reason}")]
    InvalidEnv {
        name: String,
        value: String,
        reason: String,
    },

    #[error("validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub stream: StreamConfig,
    pub telegram: TelegramConfig,
    pub logging: LoggingConfig,
    pub format: FormatConfig,
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub url: String,
    /// Backoff base delay.
    pub reconnect_interval_ms: u64,
    pub backoff_growth: f64,
    pub backoff_cap_exponent: u32,
    pub max_reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval_ms: u64,
    pub connection_timeout_ms: u64,
    /// Read-idle timeout of the transport.
    pub ping_timeout_ms: u64,
    pub max_message_size: usize,
    pub max_queue: usize,
    pub poll_interval_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            reconnect_interval_ms: 100,
            backoff_growth: 1.01,
            backoff_cap_exponent: 5,
            max_reconnect_delay_ms: 2000,
            max_reconnect_attempts: 99999,
            heartbeat_interval_ms: 100,
            connection_timeout_ms: 5000,
            ping_timeout_ms: 30_000,
            max_message_size: 1 << 20,
            max_queue: 32,
            poll_interval_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: String,
    pub api_base: String,
    pub request_timeout_ms: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            chat_id: String::new(),
            api_base: DEFAULT_API_BASE.to_string(),
            request_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info` or `feedrelay=debug,warn`.
    pub level: String,
    pub file: Option<PathBuf>,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatConfig {
    pub max_message_length: usize,
    pub batch_display_size: usize,
    /// IANA zone name; system zone when unset.
    pub timezone: Option<String>,
}

impl Default for FormatConfig {
    fn default() -> Self {
        Self {
            max_message_length: 4096,
            batch_display_size: 5,
            timezone: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub enabled: bool,
    pub latency_threshold_ms: u64,
    pub stats_interval_secs: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            latency_threshold_ms: 1000,
            stats_interval_secs: 60,
        }
    }
}

/// `<config dir>/feedrelay/config.toml`, when the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("feedrelay").join("config.toml"))
}

fn parse_env<T>(name: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidEnv {
        name: name.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_env_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            name: name.to_string(),
            value: value.to_string(),
            reason: "expected true or false".to_string(),
        }),
    }
}

impl Config {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Read `path` if given, else the default location if it exists, else
    /// built-in defaults. An explicit path that cannot be read is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_toml_str(&std::fs::read_to_string(path)?),
            None => match default_config_path().filter(|p| p.is_file()) {
                Some(path) => Self::from_toml_str(&std::fs::read_to_string(path)?),
                None => Ok(Self::default()),
            },
        }
    }

    /// Layer environment variables over the file values.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("WSS_URL") {
            self.stream.url = v.trim().to_string();
        }
        if let Some(v) = get("TELEGRAM_BOT_TOKEN") {
            self.telegram.bot_token = v.trim().to_string();
        }
        if let Some(v) = get("TELEGRAM_CHAT_ID") {
            self.telegram.chat_id = v.trim().to_string();
        }
        if let Some(v) = get("RECONNECT_INTERVAL") {
            self.stream.reconnect_interval_ms = parse_env("RECONNECT_INTERVAL", &v)?;
        }
        if let Some(v) = get("MAX_RECONNECT_ATTEMPTS") {
            self.stream.max_reconnect_attempts = parse_env("MAX_RECONNECT_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("HEARTBEAT_INTERVAL") {
            self.stream.heartbeat_interval_ms = parse_env("HEARTBEAT_INTERVAL", &v)?;
        }
        if let Some(v) = get("CONNECTION_TIMEOUT") {
            self.stream.connection_timeout_ms = parse_env("CONNECTION_TIMEOUT", &v)?;
        }
        if let Some(v) = get("LOG_LEVEL") {
            self.logging.level = v.trim().to_ascii_lowercase();
        }
        if let Some(v) = get("LOG_FILE") {
            self.logging.file = Some(PathBuf::from(v.trim()));
        }
        if let Some(v) = get("MAX_MESSAGE_LENGTH") {
            self.format.max_message_length = parse_env("MAX_MESSAGE_LENGTH", &v)?;
        }
        if let Some(v) = get("BATCH_SIZE") {
            self.format.batch_display_size = parse_env("BATCH_SIZE", &v)?;
        }
        if let Some(v) = get("ENABLE_PERFORMANCE_MONITORING") {
            self.monitoring.enabled = parse_env_bool("ENABLE_PERFORMANCE_MONITORING", &v)?;
        }
        if let Some(v) = get("LATENCY_THRESHOLD_MS") {
            self.monitoring.latency_threshold_ms = parse_env("LATENCY_THRESHOLD_MS", &v)?;
        }
        if let Some(v) = get("DISPLAY_TIMEZONE") {
            self.format.timezone = Some(v.trim().to_string());
        }
        Ok(())
    }

    /// Startup checks. Any failure here is fatal.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.telegram.bot_token.trim().is_empty() {
            return Err(ConfigError::Validation(
                "telegram bot token is required (TELEGRAM_BOT_TOKEN)".to_string(),
            ));
        }
        if self.telegram.chat_id.trim().is_empty() {
            return Err(ConfigError::Validation(
                "telegram chat id is required (TELEGRAM_CHAT_ID)".to_string(),
            ));
        }
        if self.stream.url.trim().is_empty() {
            return Err(ConfigError::Validation(
                "stream url is required (WSS_URL)".to_string(),
            ));
        }
        let url = url::Url::parse(&self.stream.url)
            .map_err(|e| ConfigError::Validation(format!("invalid stream url: {}", e)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ConfigError::Validation(format!(
                "stream url must use ws or wss, got {}",
                url.scheme()
            )));
        }
        if self.format.max_message_length <= 100 {
            return Err(ConfigError::Validation(format!(
                "max_message_length must be greater than 100, got {}",
                self.format.max_message_length
            )));
        }
        if !(self.stream.backoff_growth >= 1.0) {
            return Err(ConfigError::Validation(format!(
                "backoff_growth must be at least 1.0, got {}",
                self.stream.backoff_growth
            )));
        }
        if self.stream.heartbeat_interval_ms == 0 || self.stream.poll_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "heartbeat and poll intervals must be non-zero".to_string(),
            ));
        }
        if self.stream.connection_timeout_ms == 0
            || self.stream.ping_timeout_ms == 0
            || self.telegram.request_timeout_ms == 0
        {
            return Err(ConfigError::Validation(
                "connection, ping and request timeouts must be non-zero".to_string(),
            ));
        }
        self.display_zone()?;
        Ok(())
    }

    pub fn display_zone(&self) -> Result<DisplayZone, ConfigError> {
        DisplayZone::from_name(self.format.timezone.as_deref()).map_err(ConfigError::Validation)
    }

    pub fn websocket_settings(&self) -> WebSocketSettings {
        WebSocketSettings {
            url: self.stream.url.clone(),
            connect_timeout: Duration::from_millis(self.stream.connection_timeout_ms),
            idle_timeout: Duration::from_millis(self.stream.ping_timeout_ms),
            max_message_size: self.stream.max_message_size,
            max_queue: self.stream.max_queue,
        }
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.stream.reconnect_interval_ms),
            growth: self.stream.backoff_growth,
            cap_exponent: self.stream.backoff_cap_exponent,
            max_delay: Duration::from_millis(self.stream.max_reconnect_delay_ms),
        }
    }

    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            heartbeat_interval: Duration::from_millis(self.stream.heartbeat_interval_ms),
            poll_interval: self.poll_interval(),
            backoff: self.backoff_policy(),
            max_reconnect_attempts: self.stream.max_reconnect_attempts,
            stats_interval: (self.monitoring.enabled && self.monitoring.stats_interval_secs > 0)
                .then(|| Duration::from_secs(self.monitoring.stats_interval_secs)),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.stream.poll_interval_ms)
    }

    /// Latency warning threshold, when monitoring is on.
    pub fn latency_threshold_ms(&self) -> Option<u64> {
        self.monitoring
            .enabled
            .then_some(self.monitoring.latency_threshold_ms)
    }
}
