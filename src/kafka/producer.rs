use super::record::{PublishRecord, RecordAck};
use super::topic_manager::fetch_partition_count;
use crate::config::{AckLevel, KafkaConfig, PublisherConfig};
use crate::error::SendError;
use crate::Result;
use async_trait::async_trait;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{DeliveryFuture, FutureProducer, FutureRecord, Producer};
use rdkafka::ClientConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

/// One connection's worth of produce capability.
///
/// Implementations should keep a partition's log in send order: once a record
/// in a batch fails retriably, no later record of that batch should be stored.
/// If one is, the publisher fails the earlier record instead of resending it.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    async fn partition_count(&self, topic: &str) -> std::result::Result<i32, SendError>;

    /// Sends `records` to `partition`, returning one result per record in
    /// the same order.
    async fn send_batch(
        &self,
        partition: i32,
        records: &[PublishRecord],
    ) -> Vec<std::result::Result<RecordAck, SendError>>;
}

/// [`BrokerTransport`] backed by a librdkafka producer.
pub struct KafkaTransport {
    producer: FutureProducer,
}

impl KafkaTransport {
    pub fn new(kafka: &KafkaConfig, publisher: &PublisherConfig, client_id: &str) -> Result<Self> {
        let mut client = ClientConfig::new();
        client
            .set("bootstrap.servers", kafka.brokers.join(","))
            .set("client.id", client_id)
            .set("compression.type", &kafka.compression)
            .set("acks", kafka.acks.as_kafka_value())
            // Records arrive already batched by the publisher.
            .set("linger.ms", "0")
            .set("batch.size", publisher.batch_size.to_string())
            .set("message.max.bytes", publisher.max_request_size.to_string())
            .set("message.timeout.ms", publisher.request_timeout_ms.to_string());

        if kafka.acks == AckLevel::All {
            client
                .set("enable.idempotence", "true")
                // A failed message fails the producer instead of leaving a gap.
                .set("enable.gapless.guarantee", "true")
                .set(
                    "max.in.flight.requests.per.connection",
                    publisher.max_in_flight_per_connection.min(5).to_string(),
                );
        } else {
            client.set("max.in.flight.requests.per.connection", "1");
        }

        let producer: FutureProducer = client.create()?;
        debug!("Created Kafka producer '{}'", client_id);

        Ok(Self { producer })
    }

    /// Opens `pool_size` producers, one per pool slot, each with its own
    /// client id derived from the session.
    pub fn connect_pool(
        kafka: &KafkaConfig,
        publisher: &PublisherConfig,
        session_id: &str,
    ) -> Result<Vec<Arc<dyn BrokerTransport>>> {
        let mut pool: Vec<Arc<dyn BrokerTransport>> = Vec::with_capacity(publisher.pool_size);
        for slot in 0..publisher.pool_size {
            let client_id = format!("{}-{}", session_id, slot);
            pool.push(Arc::new(Self::new(kafka, publisher, &client_id)?));
        }
        info!(
            "Connected {} producer(s) to {}",
            pool.len(),
            kafka.brokers.join(",")
        );
        Ok(pool)
    }
}

enum Queued {
    Delivery(DeliveryFuture),
    Rejected(SendError),
}

#[async_trait]
impl BrokerTransport for KafkaTransport {
    async fn partition_count(&self, topic: &str) -> std::result::Result<i32, SendError> {
        let producer = self.producer.clone();
        let topic = topic.to_string();
        tokio::task::spawn_blocking(move || {
            fetch_partition_count(producer.client(), &topic, METADATA_TIMEOUT)
        })
        .await
        .map_err(|e| SendError::retriable(format!("metadata task failed: {}", e)))?
        .map_err(|e| SendError::retriable(e.to_string()))
    }

    async fn send_batch(
        &self,
        partition: i32,
        records: &[PublishRecord],
    ) -> Vec<std::result::Result<RecordAck, SendError>> {
        // Enqueue everything first so librdkafka can pack one produce request.
        let mut queued = Vec::with_capacity(records.len());
        for record in records {
            let mut headers = OwnedHeaders::new_with_capacity(record.headers.len());
            for (name, value) in &record.headers {
                headers = headers.insert(Header {
                    key: name.as_str(),
                    value: Some(value.as_ref()),
                });
            }

            let future_record = FutureRecord::to(&record.topic)
                .partition(partition)
                .key(record.key.as_ref())
                .payload(record.value.as_ref())
                .timestamp(record.timestamp.timestamp_millis())
                .headers(headers);

            queued.push(match self.producer.send_result(future_record) {
                Ok(delivery) => Queued::Delivery(delivery),
                Err((e, _)) => Queued::Rejected(classify(&e)),
            });
        }

        let mut results = Vec::with_capacity(queued.len());
        for entry in queued {
            results.push(match entry {
                Queued::Delivery(delivery) => match delivery.await {
                    Ok(Ok((partition, offset))) => Ok(RecordAck { partition, offset }),
                    Ok(Err((e, _))) => Err(classify(&e)),
                    Err(_) => Err(SendError::retriable("producer dropped before delivery report")),
                },
                Queued::Rejected(e) => Err(e),
            });
        }
        results
    }
}

/// Splits librdkafka errors into those a resend can fix and those it cannot.
fn classify(error: &KafkaError) -> SendError {
    match error.rdkafka_error_code() {
        Some(
            RDKafkaErrorCode::MessageSizeTooLarge
            | RDKafkaErrorCode::InvalidMessageSize
            | RDKafkaErrorCode::InvalidMessage
            | RDKafkaErrorCode::InvalidRecord
            | RDKafkaErrorCode::InvalidRequiredAcks
            | RDKafkaErrorCode::TopicAuthorizationFailed
            | RDKafkaErrorCode::ClusterAuthorizationFailed
            | RDKafkaErrorCode::UnsupportedVersion,
        ) => SendError::fatal(error.to_string()),
        _ => SendError::retriable(error.to_string()),
    }
}
