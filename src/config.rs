//! Bridge configuration.
//!
//! Plain struct with defaults; `from_env` reads `AMBRIDGE_*` variables so
//! the binary can run unconfigured against a local broker.

use crate::error::{BridgeError, Result};

/// How record bytes coming out of Kafka are decoded into the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deserializer {
    /// Lossy UTF-8 string.
    Utf8String,
    /// Raw bytes.
    Bytes,
}

impl Deserializer {
    fn parse(value: &str) -> Result<Self> {
        match value {
            "string" => Ok(Deserializer::Utf8String),
            "bytes" => Ok(Deserializer::Bytes),
            other => Err(BridgeError::Config(format!(
                "unknown deserializer {other:?}, expected \"string\" or \"bytes\""
            ))),
        }
    }
}

/// Bridge-wide configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// AMQP listener bind address.
    pub amqp_addr: String,
    /// Optional metrics/health HTTP bind address.
    pub metrics_addr: Option<String>,
    /// Kafka bootstrap servers.
    pub bootstrap_servers: String,
    /// Decoding of record keys into the envelope.
    pub key_deserializer: Deserializer,
    /// Decoding of record values into the envelope.
    pub value_deserializer: Deserializer,
    /// Kafka `enable.auto.commit` for settled links. At-least-once links
    /// always commit from dispositions and ignore this.
    pub enable_auto_commit: bool,
    /// Kafka `auto.offset.reset` policy.
    pub auto_offset_reset: String,
    /// Consumer poll timeout in milliseconds.
    pub poll_timeout_ms: u64,
    /// Upper bound on records fetched per poll (`max.poll.records`).
    pub max_poll_records: usize,
    /// In-flight transfer window per sender link before the send queue
    /// reports full.
    pub credit_window: usize,
    /// Commit offsets synchronously instead of asynchronously.
    pub commit_sync: bool,
    /// Consecutive poll failures tolerated before the worker gives up.
    pub poll_failure_threshold: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            amqp_addr: "0.0.0.0:5672".to_string(),
            metrics_addr: None,
            bootstrap_servers: "localhost:9092".to_string(),
            key_deserializer: Deserializer::Utf8String,
            value_deserializer: Deserializer::Bytes,
            enable_auto_commit: false,
            auto_offset_reset: "latest".to_string(),
            poll_timeout_ms: 100,
            max_poll_records: 500,
            credit_window: 1024,
            commit_sync: false,
            poll_failure_threshold: 10,
        }
    }
}

impl BridgeConfig {
    /// Build a config from `AMBRIDGE_*` environment variables, falling back
    /// to defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var("AMBRIDGE_AMQP_ADDR") {
            config.amqp_addr = addr;
        }
        if let Ok(addr) = std::env::var("AMBRIDGE_METRICS_ADDR") {
            config.metrics_addr = Some(addr);
        }
        if let Ok(servers) = std::env::var("AMBRIDGE_BOOTSTRAP_SERVERS") {
            config.bootstrap_servers = servers;
        }
        if let Ok(v) = std::env::var("AMBRIDGE_KEY_DESERIALIZER") {
            config.key_deserializer = Deserializer::parse(&v)?;
        }
        if let Ok(v) = std::env::var("AMBRIDGE_VALUE_DESERIALIZER") {
            config.value_deserializer = Deserializer::parse(&v)?;
        }
        if let Ok(v) = std::env::var("AMBRIDGE_ENABLE_AUTO_COMMIT") {
            config.enable_auto_commit = parse_bool("AMBRIDGE_ENABLE_AUTO_COMMIT", &v)?;
        }
        if let Ok(v) = std::env::var("AMBRIDGE_AUTO_OFFSET_RESET") {
            config.auto_offset_reset = v;
        }
        if let Ok(v) = std::env::var("AMBRIDGE_POLL_TIMEOUT_MS") {
            config.poll_timeout_ms = parse_num("AMBRIDGE_POLL_TIMEOUT_MS", &v)?;
        }
        if let Ok(v) = std::env::var("AMBRIDGE_MAX_POLL_RECORDS") {
            config.max_poll_records = parse_num("AMBRIDGE_MAX_POLL_RECORDS", &v)?;
        }
        if let Ok(v) = std::env::var("AMBRIDGE_CREDIT_WINDOW") {
            config.credit_window = parse_num("AMBRIDGE_CREDIT_WINDOW", &v)?;
        }
        if let Ok(v) = std::env::var("AMBRIDGE_COMMIT_SYNC") {
            config.commit_sync = parse_bool("AMBRIDGE_COMMIT_SYNC", &v)?;
        }
        if let Ok(v) = std::env::var("AMBRIDGE_POLL_FAILURE_THRESHOLD") {
            config.poll_failure_threshold = parse_num("AMBRIDGE_POLL_FAILURE_THRESHOLD", &v)?;
        }
        Ok(config)
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    value
        .parse()
        .map_err(|_| BridgeError::Config(format!("{name}: expected true or false, got {value:?}")))
}

fn parse_num<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| BridgeError::Config(format!("{name}: invalid number {value:?}")))
}
