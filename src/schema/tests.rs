use super::*;
use crate::config::{RegistryConfig, SubjectNameStrategy};
use crate::error::{DecodeError, EncodeError, RegistryError};
use crate::order::{validate, OrderCreatedEvent, OrderRequest, ORDER_CREATED};
use apache_avro::Schema;
use std::sync::Arc;

fn fast_config() -> RegistryConfig {
    RegistryConfig {
        backoff_base_ms: 1,
        backoff_cap_ms: 5,
        ..RegistryConfig::new("http://registry.test")
    }
}

fn client_with(registry: Arc<MemoryRegistry>) -> Arc<SchemaRegistryClient> {
    Arc::new(SchemaRegistryClient::new(&fast_config(), "order.v1", registry))
}

fn create_test_event(order_id: &str, qty: i64, price: f64, binding: &SchemaBinding) -> OrderCreatedEvent {
    let order = validate(OrderRequest {
        order_id: order_id.to_string(),
        symbol: "AAPL".to_string(),
        qty,
        price,
    })
    .unwrap();
    OrderCreatedEvent::new(order, binding)
}

#[tokio::test]
async fn test_resolution_is_cached() {
    let registry = Arc::new(MemoryRegistry::starting_at(7));
    let client = client_with(Arc::clone(&registry));
    let codec = EventCodec::new(Arc::clone(&client)).unwrap();

    let first = client.resolve(ORDER_CREATED, codec.schema()).await.unwrap();
    let second = client.resolve(ORDER_CREATED, codec.schema()).await.unwrap();

    assert_eq!(first.schema_id, 7);
    assert_eq!(first, second);
    assert_eq!(first.fingerprint, fingerprint(codec.schema()));
    assert_eq!(registry.calls(), 1);
}

#[tokio::test]
async fn test_concurrent_first_use_registers_once() {
    let registry = Arc::new(MemoryRegistry::new());
    let client = client_with(Arc::clone(&registry));
    let codec = Arc::new(EventCodec::new(Arc::clone(&client)).unwrap());

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let client = Arc::clone(&client);
        let codec = Arc::clone(&codec);
        tasks.push(tokio::spawn(async move {
            client.resolve(ORDER_CREATED, codec.schema()).await
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap().schema_id, 1);
    }
    assert_eq!(registry.calls(), 1);
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let registry = Arc::new(MemoryRegistry::new());
    registry.fail_next(2, TransportError::Unavailable("connection refused".into()));
    let client = client_with(Arc::clone(&registry));
    let codec = EventCodec::new(Arc::clone(&client)).unwrap();

    let binding = client.resolve(ORDER_CREATED, codec.schema()).await.unwrap();
    assert_eq!(binding.schema_id, 1);
    assert_eq!(registry.calls(), 3);
}

#[tokio::test]
async fn test_unavailable_after_max_attempts() {
    let registry = Arc::new(MemoryRegistry::new());
    registry.fail_next(10, TransportError::Unavailable("connection refused".into()));
    let client = client_with(Arc::clone(&registry));
    let codec = EventCodec::new(Arc::clone(&client)).unwrap();

    let err = client.resolve(ORDER_CREATED, codec.schema()).await.unwrap_err();
    assert_eq!(
        err,
        RegistryError::Unavailable {
            attempts: 3,
            reason: "connection refused".to_string()
        }
    );
    assert_eq!(registry.calls(), 3);
}

#[tokio::test]
async fn test_single_mismatch_is_re_resolved() {
    let registry = Arc::new(MemoryRegistry::new());
    registry.fail_next(1, TransportError::Conflict("fingerprint mismatch".into()));
    let client = client_with(Arc::clone(&registry));
    let codec = EventCodec::new(Arc::clone(&client)).unwrap();

    let binding = client.resolve(ORDER_CREATED, codec.schema()).await.unwrap();
    assert_eq!(binding.schema_id, 1);
    assert_eq!(registry.calls(), 2);
}

#[tokio::test]
async fn test_second_mismatch_is_incompatible() {
    let registry = Arc::new(MemoryRegistry::new());
    registry.reject_subject("order.v1-value");
    let client = client_with(Arc::clone(&registry));
    let codec = EventCodec::new(Arc::clone(&client)).unwrap();

    let err = client.resolve(ORDER_CREATED, codec.schema()).await.unwrap_err();
    assert!(matches!(err, RegistryError::Incompatible { ref subject, .. } if subject == "order.v1-value"));
    assert_eq!(registry.calls(), 2);
}

#[tokio::test]
async fn test_rejection_is_not_retried() {
    let registry = Arc::new(MemoryRegistry::new());
    registry.fail_next(
        1,
        TransportError::Rejected {
            status: 401,
            message: "unauthorized".into(),
        },
    );
    let client = client_with(Arc::clone(&registry));
    let codec = EventCodec::new(Arc::clone(&client)).unwrap();

    let err = client.resolve(ORDER_CREATED, codec.schema()).await.unwrap_err();
    assert!(matches!(err, RegistryError::Rejected { status: 401, .. }));
    assert_eq!(registry.calls(), 1);
}

#[tokio::test]
async fn test_changed_local_schema_evicts_binding() {
    let registry = Arc::new(MemoryRegistry::new());
    let client = client_with(Arc::clone(&registry));
    let codec = EventCodec::new(Arc::clone(&client)).unwrap();

    let original = client.resolve(ORDER_CREATED, codec.schema()).await.unwrap();
    let encoded = codec
        .encode(&create_test_event("o-101", 10, 175.5, &original), &original)
        .unwrap();

    let evolved = Schema::parse_str(
        r#"{"type": "record", "name": "OrderCreated", "namespace": "orders.events", "fields": [
            {"name": "orderId", "type": "string"},
            {"name": "symbol", "type": "string"},
            {"name": "qty", "type": "long"},
            {"name": "price", "type": "double"},
            {"name": "side", "type": "string", "default": "BUY"}
        ]}"#,
    )
    .unwrap();
    let updated = client.resolve(ORDER_CREATED, &evolved).await.unwrap();

    assert_ne!(original.schema_id, updated.schema_id);
    assert_ne!(original.fingerprint, updated.fingerprint);
    assert_eq!(registry.calls(), 2);

    // Records written under the old id stay readable without a fetch.
    assert!(client.cached_schema(original.schema_id).is_some());
    let decoded = codec.decode(&encoded).unwrap();
    assert_eq!(decoded.order_id, "o-101");
    assert_eq!(decoded.schema_id, original.schema_id);
    assert_eq!(registry.calls(), 2);
}

#[tokio::test]
async fn test_record_name_subject_uses_full_name() {
    let registry = Arc::new(MemoryRegistry::new());
    registry.reject_subject("orders.events.OrderCreated");
    let config = RegistryConfig {
        subject_strategy: SubjectNameStrategy::RecordName,
        ..fast_config()
    };
    let transport: Arc<dyn RegistryTransport> = registry.clone();
    let client = Arc::new(SchemaRegistryClient::new(&config, "order.v1", transport));
    let codec = EventCodec::new(Arc::clone(&client)).unwrap();

    assert_eq!(
        client.subject_for(ORDER_CREATED, codec.schema()),
        "orders.events.OrderCreated"
    );
    let err = client.resolve(ORDER_CREATED, codec.schema()).await.unwrap_err();
    assert!(matches!(
        err,
        RegistryError::Incompatible { ref subject, .. } if subject == "orders.events.OrderCreated"
    ));
}

#[tokio::test]
async fn test_topic_record_name_subject() {
    let config = RegistryConfig {
        subject_strategy: SubjectNameStrategy::TopicRecordName,
        ..fast_config()
    };
    let client = SchemaRegistryClient::new(&config, "order.v1", Arc::new(MemoryRegistry::new()));
    let schema = Schema::parse_str(ORDER_CREATED_SCHEMA).unwrap();

    assert_eq!(
        client.subject_for(ORDER_CREATED, &schema),
        "order.v1-orders.events.OrderCreated"
    );
}

#[tokio::test]
async fn test_round_trip() {
    let registry = Arc::new(MemoryRegistry::starting_at(7));
    let client = client_with(registry);
    let codec = EventCodec::new(Arc::clone(&client)).unwrap();
    let binding = client.resolve(ORDER_CREATED, codec.schema()).await.unwrap();

    for (order_id, qty, price) in [("o-101", 10, 175.5), ("o-102", 1, 0.0), ("ünïcode-ørder", i64::MAX, 1e-9)] {
        let event = create_test_event(order_id, qty, price, &binding);
        let bytes = codec.encode(&event, &binding).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), event);
    }
}

#[tokio::test]
async fn test_encoding_embeds_schema_id() {
    let registry = Arc::new(MemoryRegistry::starting_at(7));
    let client = client_with(registry);
    let codec = EventCodec::new(Arc::clone(&client)).unwrap();
    let binding = client.resolve(ORDER_CREATED, codec.schema()).await.unwrap();

    let bytes = codec
        .encode(&create_test_event("o-101", 10, 175.5, &binding), &binding)
        .unwrap();
    assert_eq!(&bytes[..5], &[0x00, 0, 0, 0, 7]);
}

#[tokio::test]
async fn test_encode_rejects_foreign_binding() {
    let registry = Arc::new(MemoryRegistry::new());
    let codec = EventCodec::new(client_with(registry)).unwrap();
    let binding = SchemaBinding {
        schema_id: 1,
        fingerprint: String::new(),
    };
    let other = SchemaBinding {
        schema_id: 2,
        fingerprint: String::new(),
    };

    let event = create_test_event("o-1", 1, 1.0, &binding);
    assert!(matches!(
        codec.encode(&event, &other),
        Err(EncodeError::SchemaMismatch { event: 1, binding: 2 })
    ));
}

#[tokio::test]
async fn test_decode_failures() {
    let registry = Arc::new(MemoryRegistry::new());
    let client = client_with(registry);
    let codec = EventCodec::new(Arc::clone(&client)).unwrap();
    let binding = client.resolve(ORDER_CREATED, codec.schema()).await.unwrap();
    let bytes = codec
        .encode(&create_test_event("o-1", 1, 1.0, &binding), &binding)
        .unwrap();

    // Unknown id
    let mut foreign = bytes.to_vec();
    foreign[4] = 99;
    assert_eq!(codec.decode(&foreign), Err(DecodeError::UnknownSchema(99)));

    // Short header
    assert!(matches!(codec.decode(&[0, 0, 0]), Err(DecodeError::Malformed(_))));

    // Wrong magic byte
    let mut magic = bytes.to_vec();
    magic[0] = 1;
    assert!(matches!(codec.decode(&magic), Err(DecodeError::Malformed(_))));

    // Truncated datum
    assert!(matches!(
        codec.decode(&bytes[..bytes.len() - 3]),
        Err(DecodeError::Malformed(_))
    ));

    // Trailing garbage
    let mut trailing = bytes.to_vec();
    trailing.push(0xff);
    assert!(matches!(codec.decode(&trailing), Err(DecodeError::Malformed(_))));
}

#[tokio::test]
async fn test_decode_resolving_fetches_unknown_writer() {
    let registry = Arc::new(MemoryRegistry::new());
    let writer = Arc::new(MemoryRegistry::starting_at(42));

    // Encode with one process...
    let producer = client_with(Arc::clone(&writer));
    let producer_codec = EventCodec::new(Arc::clone(&producer)).unwrap();
    let binding = producer.resolve(ORDER_CREATED, producer_codec.schema()).await.unwrap();
    let bytes = producer_codec
        .encode(&create_test_event("o-7", 3, 9.99, &binding), &binding)
        .unwrap();

    // ...and replay in another that has never seen id 42.
    registry.insert_schema(42, producer_codec.schema().canonical_form());
    let replay = client_with(Arc::clone(&registry));
    let replay_codec = EventCodec::new(Arc::clone(&replay)).unwrap();

    assert_eq!(replay_codec.decode(&bytes), Err(DecodeError::UnknownSchema(42)));
    let event = replay_codec.decode_resolving(&bytes).await.unwrap();
    assert_eq!(event.order_id, "o-7");
    assert_eq!(event.schema_id, 42);

    // Now cached.
    assert!(replay_codec.decode(&bytes).is_ok());
    assert_eq!(registry.calls(), 1);
}

#[tokio::test]
async fn test_decode_resolving_unknown_id() {
    let registry = Arc::new(MemoryRegistry::new());
    let codec = EventCodec::new(client_with(registry)).unwrap();

    assert_eq!(
        codec.decode_resolving(&[0, 0, 0, 0, 5, 0]).await,
        Err(DecodeError::UnknownSchema(5))
    );
}
