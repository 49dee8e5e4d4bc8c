use crate::{Error, Result};
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::{Client, ClientContext, DefaultClientContext};
use rdkafka::error::RDKafkaErrorCode;
use rdkafka::ClientConfig;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

const METADATA_TIMEOUT: Duration = Duration::from_secs(5);
const ADMIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Number of partitions `topic` currently has.
///
/// Blocks for up to `timeout`; async callers should run it off the runtime.
pub(crate) fn fetch_partition_count<C: ClientContext>(
    client: &Client<C>,
    topic: &str,
    timeout: Duration,
) -> Result<i32> {
    let metadata = client.fetch_metadata(Some(topic), timeout)?;

    match metadata.topics().iter().find(|t| t.name() == topic) {
        Some(t) if t.error().is_none() && !t.partitions().is_empty() => {
            Ok(t.partitions().len() as i32)
        }
        Some(t) => Err(Error::Metadata {
            message: format!("topic '{}' is not available: {:?}", topic, t.error()),
        }),
        None => Err(Error::Metadata {
            message: format!("topic '{}' not found", topic),
        }),
    }
}

pub struct TopicManager {
    admin_client: Arc<AdminClient<DefaultClientContext>>,
    default_partitions: i32,
    default_replication_factor: i32,
    verified_topics: HashSet<String>,
}

impl TopicManager {
    pub fn new(brokers: &[String], partitions: i32, replication_factor: i32) -> Result<Self> {
        let admin_client: AdminClient<_> = ClientConfig::new()
            .set("bootstrap.servers", brokers.join(","))
            .create()?;

        Ok(Self {
            admin_client: Arc::new(admin_client),
            default_partitions: partitions,
            default_replication_factor: replication_factor,
            verified_topics: HashSet::new(),
        })
    }

    #[instrument(skip(self), fields(topic = %topic_name))]
    pub async fn ensure_topic_exists(&mut self, topic_name: &str) -> Result<()> {
        if self.verified_topics.contains(topic_name) {
            debug!("Topic '{}' already verified to exist", topic_name);
            return Ok(());
        }

        match self.partition_count(topic_name).await {
            Ok(partitions) => {
                info!("Topic '{}' exists with {} partition(s)", topic_name, partitions);
            }
            Err(Error::Metadata { .. }) => {
                info!("Creating topic '{}'", topic_name);
                self.create_topic(topic_name).await?;
            }
            Err(e) => {
                warn!("Failed to check if topic '{}' exists: {}", topic_name, e);
                return Err(e);
            }
        }

        self.verified_topics.insert(topic_name.to_string());
        Ok(())
    }

    pub async fn partition_count(&self, topic_name: &str) -> Result<i32> {
        let admin_client = Arc::clone(&self.admin_client);
        let topic = topic_name.to_string();
        tokio::task::spawn_blocking(move || {
            fetch_partition_count(admin_client.inner(), &topic, METADATA_TIMEOUT)
        })
        .await
        .map_err(|e| Error::Metadata {
            message: format!("metadata task failed: {}", e),
        })?
    }

    async fn create_topic(&self, topic_name: &str) -> Result<()> {
        let new_topic = NewTopic::new(
            topic_name,
            self.default_partitions,
            TopicReplication::Fixed(self.default_replication_factor),
        )
        .set("cleanup.policy", "delete");

        let opts = AdminOptions::new().operation_timeout(Some(ADMIN_TIMEOUT));

        let results = self.admin_client.create_topics(&[new_topic], &opts).await?;

        for result in results {
            match result {
                Ok(topic) => info!("Successfully created topic: {}", topic),
                // Another publisher won the race.
                Err((_topic, RDKafkaErrorCode::TopicAlreadyExists)) => {}
                Err((_topic, error)) => {
                    return Err(Error::Kafka(rdkafka::error::KafkaError::AdminOp(error)));
                }
            }
        }

        Ok(())
    }

    pub async fn delete_topic(&self, topic_name: &str) -> Result<()> {
        let opts = AdminOptions::new().operation_timeout(Some(ADMIN_TIMEOUT));

        let results = self.admin_client.delete_topics(&[topic_name], &opts).await?;

        for result in results {
            match result {
                Ok(topic) => info!("Successfully deleted topic: {}", topic),
                Err((_topic, error)) => {
                    return Err(Error::Kafka(rdkafka::error::KafkaError::AdminOp(error)));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_partition_count_runs_off_the_runtime() {
        let manager = TopicManager::new(&["127.0.0.1:9".to_string()], 1, 1).unwrap();

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        tokio::spawn(async move { flag.store(true, Ordering::SeqCst) });

        // On the single-threaded test runtime the spawned task can only run
        // if the lookup yields instead of blocking the thread.
        let result = manager.partition_count("order.v1").await;
        assert!(result.is_err());
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    #[ignore] // Requires running Kafka
    async fn test_topic_creation() {
        let mut manager = TopicManager::new(&["localhost:9092".to_string()], 3, 1).unwrap();

        let topic_name = "order-events-topic-creation";
        let _ = manager.delete_topic(topic_name).await;

        manager.ensure_topic_exists(topic_name).await.unwrap();
        assert_eq!(manager.partition_count(topic_name).await.unwrap(), 3);

        manager.delete_topic(topic_name).await.unwrap();
    }
}
