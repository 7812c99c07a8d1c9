use intercom_protocol::{AudioFormat, HOME_ASSISTANT_ROLE};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {name}: '{value}' ({reason})")]
    InvalidValue {
        name: String,
        value: String,
        reason: String,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Settings for one intercom client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Hub address as host:port
    pub hub_address: String,
    pub client_id: String,
    pub role: String,
    /// Format requested in `start_audio`; `frame_ms` is always taken from here
    pub preferred_format: AudioFormat,
    /// Request a stream as soon as the client has registered
    pub auto_start: bool,
    /// Stream id to resume when auto starting
    pub requested_stream_id: Option<String>,
    pub connect_timeout: Duration,
    /// Drop pending commands older than this. `None` keeps them until a
    /// response arrives or the connection closes.
    pub command_timeout: Option<Duration>,
    /// Buffer size of the client event channel
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            hub_address: "127.0.0.1:7000".to_string(),
            client_id: uuid::Uuid::new_v4().to_string(),
            role: HOME_ASSISTANT_ROLE.to_string(),
            preferred_format: AudioFormat::default(),
            auto_start: true,
            requested_stream_id: None,
            connect_timeout: Duration::from_secs(10),
            command_timeout: None,
            event_capacity: 64,
        }
    }
}

impl ClientConfig {
    /// Load configuration from the environment, reading `.env` if present
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists (for development)
        dotenvy::dotenv().ok();

        let mut config = Self::default();

        let host = env::var("INTERCOM_HUB_HOST").ok();
        let port = env::var("INTERCOM_HUB_PORT").ok();
        if host.is_some() || port.is_some() {
            let port: u16 = match port {
                Some(port) => parse_value("INTERCOM_HUB_PORT", &port)?,
                None => 7000,
            };
            let host = host.unwrap_or_else(|| "127.0.0.1".to_string());
            config.hub_address = format!("{}:{}", host, port);
        }

        if let Ok(client_id) = env::var("INTERCOM_CLIENT_ID") {
            config.client_id = client_id;
        }
        if let Ok(stream_id) = env::var("INTERCOM_STREAM_ID") {
            if !stream_id.trim().is_empty() {
                config.requested_stream_id = Some(stream_id);
            }
        }
        if let Some(rate) = read_env("INTERCOM_SAMPLE_RATE")? {
            config.preferred_format.sample_rate = rate;
        }
        if let Some(channels) = read_env("INTERCOM_CHANNELS")? {
            config.preferred_format.channels = channels;
        }
        if let Some(frame_ms) = read_env("INTERCOM_FRAME_MS")? {
            config.preferred_format.frame_ms = frame_ms;
        }
        if let Some(auto_start) = read_env("INTERCOM_AUTO_START")? {
            config.auto_start = auto_start;
        }
        if let Some(timeout_ms) = read_env::<u64>("INTERCOM_COMMAND_TIMEOUT_MS")? {
            config.command_timeout = (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms));
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hub_address.trim().is_empty() {
            return Err(ConfigError::Invalid("hub address cannot be empty".to_string()));
        }
        if self.client_id.trim().is_empty() {
            return Err(ConfigError::Invalid("client id cannot be empty".to_string()));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid(
                "event capacity must be at least 1".to_string(),
            ));
        }
        self.preferred_format
            .frame_bytes()
            .map_err(|e| ConfigError::Invalid(format!("preferred format: {}", e)))?;
        Ok(())
    }
}

fn read_env<T>(name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(value) => parse_value(name, &value).map(Some),
        Err(_) => Ok(None),
    }
}

fn parse_value<T>(name: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            name: name.to_string(),
            value: value.to_string(),
            reason: e.to_string(),
        })
}
