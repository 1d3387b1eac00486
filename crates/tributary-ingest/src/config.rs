//! Configuration for the ingest service and its broker connection.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Settings rejected before the service starts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be at least 1")]
    Zero { field: &'static str },

    #[error(
        "batch.check_interval_ms ({check_interval_ms}) must not exceed batch.max_age_ms ({max_age_ms})"
    )]
    CheckInterval {
        check_interval_ms: u64,
        max_age_ms: u64,
    },
}

/// Top-level ingest configuration.
///
/// Loaded from `tributary.toml` `[ingest]` section or
/// `TRIBUTARY_INGEST__` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Broker topic (queue) to consume.
    #[serde(default = "default_topic")]
    pub topic: String,

    /// Path to the JSON schema registry.
    #[serde(default = "default_schema_path")]
    pub schema_path: String,

    /// Directory for the dead-letter store.
    #[serde(default = "default_dead_letter_dir")]
    pub dead_letter_dir: String,

    /// What to do with broker acks once records are dead-lettered by the sink path.
    #[serde(default)]
    pub ack_policy: AckPolicy,

    /// Raw messages buffered between the broker pull loop and batch assembly.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    /// Maximum batches concurrently submitted to the sink.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// How long draining waits for in-flight batches before abandoning retries.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Interval between statistics log lines.
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,

    #[serde(default)]
    pub batch: BatchConfig,

    #[serde(default)]
    pub retry: RetryConfig,
}

/// Acknowledgment policy for sink-side dead letters.
///
/// `AckAnyway` keeps the stream moving: the dead-letter store becomes the
/// only copy and operators replay from it. `Withhold` leaves the message
/// unacknowledged so the broker redelivers it on the next session; because
/// acknowledgments are positional, everything behind it also waits.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    #[default]
    AckAnyway,
    Withhold,
}

/// Batch-close thresholds.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    /// Close a batch once it holds this many records.
    #[serde(default = "default_max_size")]
    pub max_size: usize,

    /// Close a batch once its first record is this old.
    #[serde(default = "default_max_age_ms")]
    pub max_age_ms: u64,

    /// Period of the batch-age timer.
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
}

/// Sink submission retry budget.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt before dead-lettering.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Upper bound on a single sink call.
    #[serde(default = "default_submit_timeout")]
    pub submit_timeout_secs: u64,
}

/// Broker connection settings.
///
/// Loaded from the `[broker]` section or `TRIBUTARY_BROKER__` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    #[serde(default = "default_virtual_host")]
    pub virtual_host: String,

    /// Exchange the topic queue is bound to, if any.
    #[serde(default)]
    pub exchange: Option<String>,

    /// Unacknowledged deliveries the broker may push ahead of acks.
    #[serde(default = "default_prefetch")]
    pub prefetch: u16,

    #[serde(default)]
    pub tls: TlsConfig,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    #[serde(default)]
    pub queue: QueueConfig,
}

/// Arguments for the durable topic queue declaration.
///
/// The broker refuses to redeclare an existing queue with different
/// arguments, so these must match how the queue was first created.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// `x-message-ttl`: messages older than this are expired by the broker.
    #[serde(default = "default_message_ttl_ms")]
    pub message_ttl_ms: Option<u32>,

    /// `x-dead-letter-exchange`: where the broker routes expired or rejected messages.
    #[serde(default = "default_dead_letter_exchange")]
    pub dead_letter_exchange: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// PEM bundle of trusted CA certificates; system roots when unset.
    #[serde(default)]
    pub ca_cert_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Give up after this many consecutive failed attempts; unlimited when unset.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

fn default_topic() -> String {
    "udl.ingest".to_string()
}

fn default_schema_path() -> String {
    "./schema.json".to_string()
}

fn default_dead_letter_dir() -> String {
    "./dead-letters".to_string()
}

fn default_buffer_capacity() -> usize {
    1024
}

fn default_max_in_flight() -> usize {
    4
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_stats_interval() -> u64 {
    60
}

fn default_max_size() -> usize {
    100
}

fn default_max_age_ms() -> u64 {
    1000
}

fn default_check_interval_ms() -> u64 {
    250
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_submit_timeout() -> u64 {
    30
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5671
}

fn default_virtual_host() -> String {
    "/".to_string()
}

fn default_prefetch() -> u16 {
    64
}

fn default_message_ttl_ms() -> Option<u32> {
    Some(300_000)
}

fn default_dead_letter_exchange() -> Option<String> {
    Some("udl.dlq".to_string())
}

fn default_true() -> bool {
    true
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            topic: default_topic(),
            schema_path: default_schema_path(),
            dead_letter_dir: default_dead_letter_dir(),
            ack_policy: AckPolicy::default(),
            buffer_capacity: default_buffer_capacity(),
            max_in_flight: default_max_in_flight(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            stats_interval_secs: default_stats_interval(),
            batch: BatchConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl IngestConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Reject settings that would deadlock or spin the pipeline.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("batch.max_size", self.batch.max_size as u64),
            ("max_in_flight", self.max_in_flight as u64),
            ("buffer_capacity", self.buffer_capacity as u64),
            ("batch.max_age_ms", self.batch.max_age_ms),
            ("batch.check_interval_ms", self.batch.check_interval_ms),
        ];
        if let Some((field, _)) = positive.into_iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero { field });
        }
        // A coarser timer would let batches outlive max_age.
        if self.batch.check_interval_ms > self.batch.max_age_ms {
            return Err(ConfigError::CheckInterval {
                check_interval_ms: self.batch.check_interval_ms,
                max_age_ms: self.batch.max_age_ms,
            });
        }
        Ok(())
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            max_age_ms: default_max_age_ms(),
            check_interval_ms: default_check_interval_ms(),
        }
    }
}

impl BatchConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_millis(self.max_age_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            submit_timeout_secs: default_submit_timeout(),
        }
    }
}

impl RetryConfig {
    pub fn submit_timeout(&self) -> Duration {
        Duration::from_secs(self.submit_timeout_secs)
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            username: String::new(),
            password: String::new(),
            virtual_host: default_virtual_host(),
            exchange: None,
            prefetch: default_prefetch(),
            tls: TlsConfig::default(),
            reconnect: ReconnectConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            message_ttl_ms: default_message_ttl_ms(),
            dead_letter_exchange: default_dead_letter_exchange(),
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            ca_cert_path: None,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_attempts: None,
        }
    }
}
