pub mod backoff;
pub mod config;
pub mod error;
pub mod order;
pub mod pipeline;

pub mod kafka;
pub mod schema;

pub use config::Config;
pub use error::{Error, Result};
pub use pipeline::OrderPipeline;
