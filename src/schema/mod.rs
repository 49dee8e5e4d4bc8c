pub mod codec;
pub mod http;
pub mod memory;
pub mod registry;

#[cfg(test)]
mod tests;

use async_trait::async_trait;
use thiserror::Error;

pub use codec::{EventCodec, ORDER_CREATED_SCHEMA};
pub use http::HttpRegistry;
pub use memory::MemoryRegistry;
pub use registry::{fingerprint, SchemaRegistryClient};

/// A schema id resolved from the registry, with the fingerprint of the
/// local schema it was resolved for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaBinding {
    pub schema_id: u32,
    pub fingerprint: String,
}

/// Failure of one registry round-trip, before retry policy is applied.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Network failure, timeout or server-side error. Worth retrying.
    #[error("registry unreachable: {0}")]
    Unavailable(String),

    /// The registry refused the schema because it does not match what the
    /// subject already holds.
    #[error("schema mismatch: {0}")]
    Conflict(String),

    #[error("registry rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
}

/// Request/response access to a schema registry.
#[async_trait]
pub trait RegistryTransport: Send + Sync {
    /// Registers `schema` under `subject`, returning its id. Registering a
    /// schema the subject already holds returns the existing id.
    async fn register(&self, subject: &str, schema: &str) -> Result<u32, TransportError>;

    /// Fetches the schema text stored under `id`, or `None` if unknown.
    async fn fetch_schema(&self, id: u32) -> Result<Option<String>, TransportError>;
}
