use domain_events::retry::RetryConfig;
use domain_events::{NatsTransportConfig, TopologyError, TopologyRegistry, ENVELOPE_CONTENT_TYPE};
use std::env;
use std::str::FromStr;
use std::time::Duration;

const DAY: u64 = 60 * 60 * 24;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unsupported BUS_TYPE '{0}': expected 'nats' or 'inmemory'")]
    UnknownBusType(String),

    #[error("invalid NATS_URL '{url}': {reason}")]
    InvalidBrokerUrl { url: String, reason: String },

    #[error("EVENT_EXCHANGE_NAME is invalid: {0}")]
    InvalidExchangeName(#[from] TopologyError),

    #[error("EVENT_CONTENT_TYPE must be application/json, got '{0}'")]
    UnsupportedContentType(String),

    #[error("{name} must be {expected}, got '{value}'")]
    InvalidValue {
        name: &'static str,
        value: String,
        expected: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusType {
    Nats,
    InMemory,
}

impl BusType {
    pub fn from_env() -> Result<Self, ConfigError> {
        let raw = env::var("BUS_TYPE").unwrap_or_else(|_| "nats".to_string());
        match raw.to_lowercase().as_str() {
            "nats" => Ok(BusType::Nats),
            "inmemory" => Ok(BusType::InMemory),
            _ => Err(ConfigError::UnknownBusType(raw)),
        }
    }
}

/// Event publishing configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub bus_type: BusType,
    pub nats_url: String,
    /// Exchange name, routing prefix and envelope producer
    pub exchange_name: String,
    pub content_type: String,
    pub publish_timeout: Duration,
    pub connect_attempts: u32,
    pub connect_backoff: Duration,
    /// Total time startup may spend waiting for the broker
    pub connect_deadline: Duration,
    pub stream_max_age: Duration,
    pub dlq_max_age: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bus_type = BusType::from_env()?;

        let nats_url =
            env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string());

        let exchange_name =
            env::var("EVENT_EXCHANGE_NAME").unwrap_or_else(|_| "crm".to_string());
        TopologyRegistry::new(&exchange_name)?;

        let content_type =
            env::var("EVENT_CONTENT_TYPE").unwrap_or_else(|_| ENVELOPE_CONTENT_TYPE.to_string());
        if !is_json_content_type(&content_type) {
            return Err(ConfigError::UnsupportedContentType(content_type));
        }

        let publish_timeout_ms: u64 =
            parse_var("EVENT_PUBLISH_TIMEOUT_MS", "5000", "a number of milliseconds")?;
        let connect_attempts: u32 =
            parse_var("BROKER_CONNECT_ATTEMPTS", "5", "a positive integer")?;
        if connect_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                name: "BROKER_CONNECT_ATTEMPTS",
                value: "0".to_string(),
                expected: "a positive integer",
            });
        }
        let connect_backoff_ms: u64 =
            parse_var("BROKER_CONNECT_BACKOFF_MS", "500", "a number of milliseconds")?;
        let connect_deadline_secs: u64 =
            parse_var("BROKER_CONNECT_DEADLINE_SECS", "60", "a number of seconds")?;
        let stream_max_age = parse_days("EVENT_STREAM_MAX_AGE_DAYS", "14")?;
        let dlq_max_age = parse_days("EVENT_DLQ_MAX_AGE_DAYS", "30")?;

        let config = Self {
            bus_type,
            nats_url,
            exchange_name,
            content_type,
            publish_timeout: Duration::from_millis(publish_timeout_ms),
            connect_attempts,
            connect_backoff: Duration::from_millis(connect_backoff_ms),
            connect_deadline: Duration::from_secs(connect_deadline_secs),
            stream_max_age,
            dlq_max_age,
        };

        if config.bus_type == BusType::Nats {
            config
                .nats_transport_config()
                .validate()
                .map_err(|e| ConfigError::InvalidBrokerUrl {
                    url: config.nats_url.clone(),
                    reason: e.to_string(),
                })?;
        }

        Ok(config)
    }

    pub fn nats_transport_config(&self) -> NatsTransportConfig {
        NatsTransportConfig {
            url: self.nats_url.clone(),
            connection_name: format!("{}-events", self.exchange_name),
            connect_retry: RetryConfig {
                max_attempts: self.connect_attempts,
                initial_backoff: self.connect_backoff,
                deadline: Some(self.connect_deadline),
                ..RetryConfig::default()
            },
            ack_timeout: self.publish_timeout,
            stream_max_age: self.stream_max_age,
            dlq_max_age: self.dlq_max_age,
            ..NatsTransportConfig::default()
        }
    }
}

fn parse_var<T: FromStr>(
    name: &'static str,
    default: &str,
    expected: &'static str,
) -> Result<T, ConfigError> {
    let value = env::var(name).unwrap_or_else(|_| default.to_string());
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue { name, value, expected })
}

/// A retention period given in whole days
fn parse_days(name: &'static str, default: &str) -> Result<Duration, ConfigError> {
    const EXPECTED: &str = "a number of days";

    let days: u64 = parse_var(name, default, EXPECTED)?;
    days.checked_mul(DAY)
        .map(Duration::from_secs)
        .ok_or_else(|| ConfigError::InvalidValue {
            name,
            value: days.to_string(),
            expected: EXPECTED,
        })
}

/// `application/json`, optionally with parameters such as a charset
fn is_json_content_type(value: &str) -> bool {
    value
        .split(';')
        .next()
        .map(|mime| mime.trim().eq_ignore_ascii_case(ENVELOPE_CONTENT_TYPE))
        .unwrap_or(false)
}
