//! Error types and result handling for order-events.
//!
//! This module defines the crate-level error type [`Error`], the convenience
//! [`Result`] alias, and the typed failures each pipeline stage reports.
//!
//! # Example
//!
//! ```rust
//! use order_events::error::ValidationError;
//! use order_events::order::{validate, OrderRequest};
//!
//! let request = OrderRequest {
//!     order_id: "".to_string(),
//!     symbol: "AAPL".to_string(),
//!     qty: 10,
//!     price: 175.5,
//! };
//!
//! match validate(request) {
//!     Ok(order) => println!("Accepted {}", order.order_id),
//!     Err(ValidationError::EmptyOrderId) => eprintln!("Missing order id"),
//!     Err(e) => eprintln!("Rejected: {}", e),
//! }
//! ```

use thiserror::Error;

/// The main error type for order-events infrastructure.
///
/// Covers failures while wiring the pipeline together: configuration,
/// client construction and I/O. Per-request failures use the stage-specific
/// types below.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration could not be loaded from file or environment.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Configuration loaded but failed validation.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Kafka client or admin error.
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// HTTP client error talking to the schema registry.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Avro schema could not be parsed or used.
    #[error("Schema error: {0}")]
    Schema(#[from] apache_avro::Error),

    /// JSON serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error, typically reading order input.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Broker metadata could not be obtained at startup.
    #[error("Metadata error: {message}")]
    Metadata {
        /// Description of what was missing
        message: String,
    },
}

/// A convenient Result type alias for order-events operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Why an order request was rejected before any event was built.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("orderId must not be empty")]
    EmptyOrderId,

    #[error("symbol must not be empty")]
    EmptySymbol,

    #[error("qty must be greater than zero, got {0}")]
    NonPositiveQty(i64),

    #[error("price must be a finite, non-negative number, got {0}")]
    InvalidPrice(f64),
}

/// Failures resolving a schema against the registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The registry could not be reached within the retry budget or deadline.
    #[error("schema registry unavailable after {attempts} attempt(s): {reason}")]
    Unavailable {
        /// Network attempts made before giving up
        attempts: u32,
        /// Last failure observed
        reason: String,
    },

    /// The registry rejected the schema as incompatible with the subject.
    #[error("schema for subject '{subject}' is incompatible: {reason}")]
    Incompatible {
        /// Registry subject
        subject: String,
        /// Registry explanation
        reason: String,
    },

    /// The registry refused the request for a non-transient reason.
    #[error("schema registry rejected request ({status}): {message}")]
    Rejected {
        /// HTTP status returned
        status: u16,
        /// Response body
        message: String,
    },

    /// The registry returned a schema that could not be parsed.
    #[error("invalid schema from registry: {0}")]
    InvalidSchema(String),
}

/// Failures turning an event into bytes.
#[derive(Error, Debug)]
pub enum EncodeError {
    /// The event was built against a different schema id than the binding.
    #[error("event carries schema id {event} but binding is {binding}")]
    SchemaMismatch {
        /// Id stored on the event
        event: u32,
        /// Id of the binding passed to the encoder
        binding: u32,
    },

    #[error("avro encoding failed: {0}")]
    Avro(#[from] apache_avro::Error),
}

/// Failures reading an encoded event back. Only used on the replay path.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The embedded schema id is not known to this process or the registry.
    #[error("unknown schema id {0}")]
    UnknownSchema(u32),

    /// The bytes do not follow the wire framing or the schema layout.
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// The registry could not be consulted for the embedded schema id.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Transport-level failure of a single record send.
///
/// The retriable flag drives the publisher's retry loop; non-retriable
/// failures become terminal immediately.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct SendError {
    /// Description of the failure
    pub message: String,
    /// Whether resending the identical record may succeed
    pub retriable: bool,
}

impl SendError {
    /// A transient failure such as a leader election or unreachable broker.
    pub fn retriable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retriable: true,
        }
    }

    /// A failure that resending cannot fix, such as an oversized record.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retriable: false,
        }
    }
}

/// Every way `submit_order` can fail before a delivery outcome exists.
#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("schema resolution failed: {0}")]
    Registry(#[from] RegistryError),

    #[error("encoding failed: {0}")]
    Encode(#[from] EncodeError),
}
