pub mod delivery;
pub mod key_strategy;
pub mod memory;
pub mod producer;
pub mod publisher;
pub mod record;
pub mod topic_manager;


pub use delivery::{DeliveryHandle, DeliveryOutcome, DeliveryStats, DeliveryTracker};
pub use key_strategy::{partition_for_key, PartitionKeySelector};
pub use memory::MemoryBroker;
pub use producer::{BrokerTransport, KafkaTransport};
pub use publisher::{ConnectionPool, Publisher};
pub use record::{PublishRecord, RecordAck};
pub use topic_manager::TopicManager;
