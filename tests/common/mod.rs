#![allow(dead_code)]

use order_events::config::{
    AckLevel, Config, KafkaConfig, PublisherConfig, RegistryConfig, SubjectNameStrategy,
};
use order_events::kafka::{BrokerTransport, ConnectionPool, MemoryBroker, Publisher};
use order_events::order::OrderRequest;
use order_events::schema::{RegistryTransport, SchemaRegistryClient};
use order_events::OrderPipeline;
use std::env;
use std::sync::Arc;

pub const TEST_TOPIC: &str = "order.v1";

/// Get test configuration from environment variables
pub fn get_test_config() -> Config {
    let kafka = KafkaConfig {
        brokers: env::var("TEST_KAFKA_BROKERS")
            .unwrap_or_else(|_| "localhost:9092".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .collect(),
        topic: format!("test_orders_{}", std::process::id()),
        acks: AckLevel::All,
        compression: "none".to_string(),
        producer_session_id: Some(format!("test-session-{}", std::process::id())),
        create_topic: true,
        topic_partitions: 3,
        replication_factor: 1,
    };

    let schema_registry = RegistryConfig {
        subject_strategy: SubjectNameStrategy::TopicName,
        ..RegistryConfig::new(
            env::var("TEST_SCHEMA_REGISTRY_URL").unwrap_or_else(|_| "http://localhost:8081".to_string()),
        )
    };

    Config {
        kafka,
        publisher: fast_publisher_config(),
        schema_registry,
    }
}

/// Publisher settings that keep tests fast: no linger, millisecond backoff.
pub fn fast_publisher_config() -> PublisherConfig {
    PublisherConfig {
        linger_ms: 0,
        retry_backoff_ms: 1,
        retry_backoff_max_ms: 5,
        ..PublisherConfig::default()
    }
}

pub fn fast_registry_config(url: &str) -> RegistryConfig {
    RegistryConfig {
        backoff_base_ms: 1,
        backoff_cap_ms: 5,
        ..RegistryConfig::new(url)
    }
}

/// Wires a pipeline over the given registry transport and broker.
pub async fn create_pipeline(
    registry: Arc<dyn RegistryTransport>,
    registry_config: &RegistryConfig,
    broker: Arc<MemoryBroker>,
    publisher_config: PublisherConfig,
) -> OrderPipeline {
    let pool = ConnectionPool::new(
        vec![broker as Arc<dyn BrokerTransport>],
        publisher_config.max_in_flight_per_connection,
    )
    .unwrap();
    let publisher = Publisher::start(publisher_config, TEST_TOPIC, "test-session", pool)
        .await
        .unwrap();
    let client = Arc::new(SchemaRegistryClient::new(registry_config, TEST_TOPIC, registry));
    OrderPipeline::new(client, publisher).unwrap()
}

pub fn create_test_request(order_id: &str, qty: i64, price: f64) -> OrderRequest {
    OrderRequest {
        order_id: order_id.to_string(),
        symbol: "AAPL".to_string(),
        qty,
        price,
    }
}
