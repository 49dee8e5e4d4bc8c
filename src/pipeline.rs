//! The ingestion path: request in, delivery outcome out.
//!
//! ```text
//! OrderRequest -> validate -> resolve schema -> OrderCreatedEvent
//!              -> encode -> select key -> PublishRecord -> Publisher
//! ```
//!
//! Every stage before the publisher fails fast with a [`SubmitError`];
//! nothing reaches the registry or the broker for a request that fails an
//! earlier stage.

use crate::error::SubmitError;
use crate::kafka::record::headers;
use crate::kafka::{DeliveryHandle, DeliveryOutcome, PartitionKeySelector, PublishRecord, Publisher};
use crate::order::{validate, OrderCreatedEvent, OrderRequest, ORDER_CREATED};
use crate::schema::{EventCodec, SchemaRegistryClient};
use crate::Result;
use std::sync::Arc;
use tracing::{debug, instrument};

pub const AVRO_CONTENT_TYPE: &str = "application/vnd.order-events.avro";

/// Publishes `OrderCreated` events for incoming order requests.
#[derive(Clone)]
pub struct OrderPipeline {
    registry: Arc<SchemaRegistryClient>,
    codec: Arc<EventCodec>,
    keys: PartitionKeySelector,
    publisher: Publisher,
}

impl OrderPipeline {
    pub fn new(registry: Arc<SchemaRegistryClient>, publisher: Publisher) -> Result<Self> {
        let codec = EventCodec::new(Arc::clone(&registry))?;
        Ok(Self {
            registry,
            codec: Arc::new(codec),
            keys: PartitionKeySelector,
            publisher,
        })
    }

    pub fn codec(&self) -> &EventCodec {
        &self.codec
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    /// Runs every stage and hands the record to the publisher.
    ///
    /// Returns once the record is queued. Requests submitted one after the
    /// other for the same order id are delivered in that order.
    #[instrument(skip(self, request), fields(order_id = %request.order_id))]
    pub async fn submit(&self, request: OrderRequest) -> std::result::Result<DeliveryHandle, SubmitError> {
        let order = validate(request)?;
        let binding = self.registry.resolve(ORDER_CREATED, self.codec.schema()).await?;
        let event = OrderCreatedEvent::new(order, &binding);
        let value = self.codec.encode(&event, &binding)?;
        let key = self.keys.select_key(&event);

        debug!(
            schema_id = binding.schema_id,
            bytes = value.len(),
            "Encoded order event"
        );

        let record = PublishRecord::new(self.publisher.topic(), key, value)
            .with_header(headers::EVENT_TYPE, ORDER_CREATED.as_bytes().to_vec())
            .with_header(headers::SCHEMA_ID, binding.schema_id.to_string().into_bytes())
            .with_header(headers::CONTENT_TYPE, AVRO_CONTENT_TYPE.as_bytes().to_vec());

        Ok(self.publisher.publish(record).await)
    }

    /// [`submit`](Self::submit), then waits for the delivery outcome.
    pub async fn submit_order(
        &self,
        request: OrderRequest,
    ) -> std::result::Result<DeliveryOutcome, SubmitError> {
        let handle = self.submit(request).await?;
        Ok(self.publisher.tracker().await_outcome(handle).await)
    }
}
