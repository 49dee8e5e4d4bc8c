use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub publisher: PublisherConfig,
    pub schema_registry: RegistryConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaConfig {
    pub brokers: Vec<String>,
    pub topic: String,
    #[serde(default)]
    pub acks: AckLevel,
    #[serde(default = "default_compression")]
    pub compression: String,
    /// Stable identifier for this producer; a UUID is generated when unset.
    #[serde(default)]
    pub producer_session_id: Option<String>,
    #[serde(default)]
    pub create_topic: bool,
    #[serde(default = "default_topic_partitions")]
    pub topic_partitions: i32,
    #[serde(default = "default_replication_factor")]
    pub replication_factor: i32,
}

/// How much replication a broker must complete before acknowledging.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AckLevel {
    /// Fire-and-forget.
    None,
    /// The partition leader has persisted the record.
    Leader,
    /// Every in-sync replica has persisted the record.
    #[default]
    All,
}

impl AckLevel {
    /// Value of the librdkafka `acks` property.
    pub fn as_kafka_value(&self) -> &'static str {
        match self {
            AckLevel::None => "0",
            AckLevel::Leader => "1",
            AckLevel::All => "all",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PublisherConfig {
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_request_size")]
    pub max_request_size: usize,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight_per_connection: usize,
    #[serde(default = "default_buffer_records")]
    pub buffer_records: usize,
    #[serde(default = "default_enqueue_timeout_ms")]
    pub enqueue_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_retry_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegistryConfig {
    pub url: String,
    #[serde(default)]
    pub subject_strategy: SubjectNameStrategy,
    #[serde(default = "default_registry_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_resolve_timeout_ms")]
    pub resolve_timeout_ms: u64,
    #[serde(default = "default_registry_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_registry_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_registry_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
}

/// How a registry subject is derived from the topic and the record's
/// fully-qualified name.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubjectNameStrategy {
    #[default]
    TopicName,
    RecordName,
    TopicRecordName,
}

impl SubjectNameStrategy {
    pub fn subject(&self, topic: &str, record_name: &str) -> String {
        match self {
            SubjectNameStrategy::TopicName => format!("{}-value", topic),
            SubjectNameStrategy::RecordName => record_name.to_string(),
            SubjectNameStrategy::TopicRecordName => format!("{}-{}", topic, record_name),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("ORDER_EVENTS")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.kafka.brokers.iter().all(|b| b.trim().is_empty()) {
            return Err(Error::InvalidConfig("kafka.brokers must list at least one broker".into()));
        }
        if self.kafka.topic.trim().is_empty() {
            return Err(Error::InvalidConfig("kafka.topic must not be empty".into()));
        }
        if self.schema_registry.url.trim().is_empty() {
            return Err(Error::InvalidConfig("schema_registry.url must not be empty".into()));
        }
        if self.schema_registry.max_attempts == 0 {
            return Err(Error::InvalidConfig("schema_registry.max_attempts must be at least 1".into()));
        }
        if self.schema_registry.resolve_timeout_ms >= self.publisher.delivery_timeout_ms {
            return Err(Error::InvalidConfig(format!(
                "schema_registry.resolve_timeout_ms ({}) must be shorter than publisher.delivery_timeout_ms ({})",
                self.schema_registry.resolve_timeout_ms, self.publisher.delivery_timeout_ms
            )));
        }
        self.publisher.validate()
    }
}

impl PublisherConfig {
    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(Error::InvalidConfig("publisher.pool_size must be at least 1".into()));
        }
        if self.max_in_flight_per_connection == 0 {
            return Err(Error::InvalidConfig(
                "publisher.max_in_flight_per_connection must be at least 1".into(),
            ));
        }
        if self.buffer_records == 0 {
            return Err(Error::InvalidConfig("publisher.buffer_records must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(Error::InvalidConfig("publisher.batch_size must be at least 1".into()));
        }
        Ok(())
    }

    pub fn linger(&self) -> Duration {
        Duration::from_millis(self.linger_ms)
    }

    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            linger_ms: default_linger_ms(),
            batch_size: default_batch_size(),
            max_request_size: default_max_request_size(),
            pool_size: default_pool_size(),
            max_in_flight_per_connection: default_max_in_flight(),
            buffer_records: default_buffer_records(),
            enqueue_timeout_ms: default_enqueue_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            delivery_timeout_ms: default_delivery_timeout_ms(),
            retries: default_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            retry_backoff_max_ms: default_retry_backoff_max_ms(),
        }
    }
}

impl RegistryConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            subject_strategy: SubjectNameStrategy::default(),
            request_timeout_ms: default_registry_request_timeout_ms(),
            resolve_timeout_ms: default_resolve_timeout_ms(),
            max_attempts: default_registry_max_attempts(),
            backoff_base_ms: default_registry_backoff_base_ms(),
            backoff_cap_ms: default_registry_backoff_cap_ms(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }
}

fn default_compression() -> String {
    "none".to_string()
}

fn default_topic_partitions() -> i32 {
    3
}

fn default_replication_factor() -> i32 {
    1
}

fn default_linger_ms() -> u64 {
    10
}

fn default_batch_size() -> usize {
    16384
}

fn default_max_request_size() -> usize {
    1_048_576 // 1MB
}

fn default_pool_size() -> usize {
    1
}

fn default_max_in_flight() -> usize {
    5
}

fn default_buffer_records() -> usize {
    10_000
}

fn default_enqueue_timeout_ms() -> u64 {
    5_000
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_delivery_timeout_ms() -> u64 {
    30_000
}

fn default_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    100
}

fn default_retry_backoff_max_ms() -> u64 {
    2_000
}

fn default_registry_request_timeout_ms() -> u64 {
    2_000
}

fn default_resolve_timeout_ms() -> u64 {
    5_000
}

fn default_registry_max_attempts() -> u32 {
    3
}

fn default_registry_backoff_base_ms() -> u64 {
    100
}

fn default_registry_backoff_cap_ms() -> u64 {
    2_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let file = write_config(
            r#"
            [kafka]
            brokers = ["localhost:9092"]
            topic = "order.v1"

            [schema_registry]
            url = "http://localhost:8081"
            "#,
        );

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.kafka.acks, AckLevel::All);
        assert_eq!(config.kafka.producer_session_id, None);
        assert_eq!(config.publisher.linger_ms, 10);
        assert_eq!(config.publisher.batch_size, 16384);
        assert_eq!(config.publisher.retries, 3);
        assert_eq!(config.schema_registry.max_attempts, 3);
        assert_eq!(config.schema_registry.backoff_base_ms, 100);
        assert_eq!(config.schema_registry.backoff_cap_ms, 2000);
        assert_eq!(config.schema_registry.subject_strategy, SubjectNameStrategy::TopicName);
    }

    #[test]
    fn test_explicit_values_override_defaults() {
        let file = write_config(
            r#"
            [kafka]
            brokers = ["b1:9092", "b2:9092"]
            topic = "orders"
            acks = "leader"
            producer_session_id = "order-service-1"

            [publisher]
            linger_ms = 5
            retries = 7

            [schema_registry]
            url = "http://registry:8081"
            subject_strategy = "topic_record_name"
            "#,
        );

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.kafka.brokers.len(), 2);
        assert_eq!(config.kafka.acks, AckLevel::Leader);
        assert_eq!(config.kafka.producer_session_id.as_deref(), Some("order-service-1"));
        assert_eq!(config.publisher.linger(), Duration::from_millis(5));
        assert_eq!(config.publisher.retries, 7);
        assert_eq!(
            config.schema_registry.subject_strategy,
            SubjectNameStrategy::TopicRecordName
        );
    }

    #[test]
    fn test_environment_overrides_file() {
        let file = write_config(
            r#"
            [kafka]
            brokers = ["localhost:9092"]
            topic = "order.v1"
            compression = "none"

            [schema_registry]
            url = "http://localhost:8081"
            "#,
        );

        std::env::set_var("ORDER_EVENTS_KAFKA__COMPRESSION", "lz4");
        let config = Config::from_file(file.path());
        std::env::remove_var("ORDER_EVENTS_KAFKA__COMPRESSION");

        assert_eq!(config.unwrap().kafka.compression, "lz4");
    }

    #[test]
    fn test_empty_topic_is_rejected() {
        let file = write_config(
            r#"
            [kafka]
            brokers = ["localhost:9092"]
            topic = "  "

            [schema_registry]
            url = "http://localhost:8081"
            "#,
        );

        let err = Config::from_file(file.path()).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_resolve_deadline_must_be_shorter_than_delivery() {
        let file = write_config(
            r#"
            [kafka]
            brokers = ["localhost:9092"]
            topic = "order.v1"

            [publisher]
            delivery_timeout_ms = 2000

            [schema_registry]
            url = "http://localhost:8081"
            resolve_timeout_ms = 2000
            "#,
        );

        let err = Config::from_file(file.path()).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(ref msg) if msg.contains("resolve_timeout_ms")));
    }

    #[test]
    fn test_zero_pool_size_is_rejected() {
        let publisher = PublisherConfig {
            pool_size: 0,
            ..Default::default()
        };
        assert!(publisher.validate().is_err());
    }

    #[test]
    fn test_ack_level_kafka_values() {
        assert_eq!(AckLevel::None.as_kafka_value(), "0");
        assert_eq!(AckLevel::Leader.as_kafka_value(), "1");
        assert_eq!(AckLevel::All.as_kafka_value(), "all");
    }

    #[test]
    fn test_subject_name_strategies() {
        assert_eq!(
            SubjectNameStrategy::TopicName.subject("order.v1", "orders.events.OrderCreated"),
            "order.v1-value"
        );
        assert_eq!(
            SubjectNameStrategy::RecordName.subject("order.v1", "orders.events.OrderCreated"),
            "orders.events.OrderCreated"
        );
        assert_eq!(
            SubjectNameStrategy::TopicRecordName.subject("order.v1", "orders.events.OrderCreated"),
            "order.v1-orders.events.OrderCreated"
        );
    }
}
