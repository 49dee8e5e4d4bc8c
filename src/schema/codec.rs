//! Avro encoding of order events in the Confluent wire format.
//!
//! ```text
//! byte 0      magic byte (0x00)
//! bytes 1..5  schema id, big-endian
//! bytes 5..   Avro binary datum
//! ```
//!
//! The embedded id lets a reader pick the writer schema without any
//! out-of-band hint.

use super::{SchemaBinding, SchemaRegistryClient};
use crate::error::{DecodeError, EncodeError};
use crate::order::OrderCreatedEvent;
use crate::Result;
use apache_avro::Schema;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Avro schema of the `OrderCreated` event.
pub const ORDER_CREATED_SCHEMA: &str = r#"{
    "type": "record",
    "name": "OrderCreated",
    "namespace": "orders.events",
    "fields": [
        {"name": "orderId", "type": "string"},
        {"name": "symbol", "type": "string"},
        {"name": "qty", "type": "long"},
        {"name": "price", "type": "double"}
    ]
}"#;

const MAGIC_BYTE: u8 = 0x00;
const HEADER_LEN: usize = 5;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderCreatedRecord {
    order_id: String,
    symbol: String,
    qty: i64,
    price: f64,
}

pub struct EventCodec {
    schema: Arc<Schema>,
    registry: Arc<SchemaRegistryClient>,
}

impl EventCodec {
    pub fn new(registry: Arc<SchemaRegistryClient>) -> Result<Self> {
        let schema = Schema::parse_str(ORDER_CREATED_SCHEMA)?;
        Ok(Self {
            schema: Arc::new(schema),
            registry,
        })
    }

    /// The schema events are encoded with.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn encode(
        &self,
        event: &OrderCreatedEvent,
        binding: &SchemaBinding,
    ) -> std::result::Result<Bytes, EncodeError> {
        if event.schema_id != binding.schema_id {
            return Err(EncodeError::SchemaMismatch {
                event: event.schema_id,
                binding: binding.schema_id,
            });
        }

        let record = OrderCreatedRecord {
            order_id: event.order_id.clone(),
            symbol: event.symbol.clone(),
            qty: event.qty,
            price: event.price,
        };
        let value = apache_avro::to_value(&record)?;
        let datum = apache_avro::to_avro_datum(&self.schema, value)?;

        let mut buf = BytesMut::with_capacity(HEADER_LEN + datum.len());
        buf.put_u8(MAGIC_BYTE);
        buf.put_u32(binding.schema_id);
        buf.put_slice(&datum);
        Ok(buf.freeze())
    }

    /// Decodes using only schemas this process already knows.
    pub fn decode(&self, bytes: &[u8]) -> std::result::Result<OrderCreatedEvent, DecodeError> {
        let (schema_id, datum) = split_header(bytes)?;
        let writer = self
            .registry
            .cached_schema(schema_id)
            .ok_or(DecodeError::UnknownSchema(schema_id))?;
        self.decode_datum(schema_id, &writer, datum)
    }

    /// Decodes, fetching the writer schema from the registry if it is not
    /// cached. Used when replaying records written by other producers.
    pub async fn decode_resolving(
        &self,
        bytes: &[u8],
    ) -> std::result::Result<OrderCreatedEvent, DecodeError> {
        let (schema_id, datum) = split_header(bytes)?;
        let writer = self.registry.schema_by_id(schema_id).await?;
        self.decode_datum(schema_id, &writer, datum)
    }

    fn decode_datum(
        &self,
        schema_id: u32,
        writer: &Schema,
        datum: &[u8],
    ) -> std::result::Result<OrderCreatedEvent, DecodeError> {
        let mut reader = datum;
        let value = apache_avro::from_avro_datum(writer, &mut reader, Some(&self.schema))
            .map_err(|e| DecodeError::Malformed(e.to_string()))?;
        if !reader.is_empty() {
            return Err(DecodeError::Malformed(format!(
                "{} trailing byte(s) after datum",
                reader.len()
            )));
        }

        let record: OrderCreatedRecord =
            apache_avro::from_value(&value).map_err(|e| DecodeError::Malformed(e.to_string()))?;

        Ok(OrderCreatedEvent {
            order_id: record.order_id,
            symbol: record.symbol,
            qty: record.qty,
            price: record.price,
            schema_id,
        })
    }
}

fn split_header(bytes: &[u8]) -> std::result::Result<(u32, &[u8]), DecodeError> {
    if bytes.len() < HEADER_LEN {
        return Err(DecodeError::Malformed(format!(
            "payload is {} byte(s), shorter than the {}-byte header",
            bytes.len(),
            HEADER_LEN
        )));
    }
    if bytes[0] != MAGIC_BYTE {
        return Err(DecodeError::Malformed(format!("unknown magic byte {:#04x}", bytes[0])));
    }
    let schema_id = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
    Ok((schema_id, &bytes[HEADER_LEN..]))
}
