use super::{RegistryTransport, TransportError};
use crate::config::RegistryConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::debug;

const CONTENT_TYPE: &str = "application/vnd.schemaregistry.v1+json";

/// Confluent-compatible schema registry over HTTP.
pub struct HttpRegistry {
    client: Client,
    base_url: Url,
}

#[derive(Serialize)]
struct RegisterRequest<'a> {
    schema: &'a str,
}

#[derive(Deserialize)]
struct RegisterResponse {
    id: u32,
}

#[derive(Deserialize)]
struct SchemaResponse {
    schema: String,
}

impl HttpRegistry {
    pub fn new(config: &RegistryConfig) -> Result<Self> {
        let base_url = Url::parse(&config.url)
            .map_err(|e| Error::InvalidConfig(format!("schema_registry.url '{}': {}", config.url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(Error::InvalidConfig(format!(
                "schema_registry.url '{}' is not a base URL",
                config.url
            )));
        }

        let client = Client::builder().timeout(config.request_timeout()).build()?;

        Ok(Self { client, base_url })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }
}

#[async_trait]
impl RegistryTransport for HttpRegistry {
    async fn register(&self, subject: &str, schema: &str) -> std::result::Result<u32, TransportError> {
        let url = self.endpoint(&["subjects", subject, "versions"]);
        debug!(url = %url, "Registering schema");

        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE)
            .json(&RegisterRequest { schema })
            .send()
            .await
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;

        let response = check_status(response).await?;
        let body: RegisterResponse = response.json().await.map_err(|e| TransportError::Rejected {
            status: StatusCode::OK.as_u16(),
            message: format!("unexpected register response: {}", e),
        })?;
        Ok(body.id)
    }

    async fn fetch_schema(&self, id: u32) -> std::result::Result<Option<String>, TransportError> {
        let id_segment = id.to_string();
        let url = self.endpoint(&["schemas", "ids", &id_segment]);
        debug!(url = %url, "Fetching schema");

        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, CONTENT_TYPE)
            .send()
            .await
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let response = check_status(response).await?;
        let body: SchemaResponse = response.json().await.map_err(|e| TransportError::Rejected {
            status: StatusCode::OK.as_u16(),
            message: format!("unexpected schema response: {}", e),
        })?;
        Ok(Some(body.schema))
    }
}

async fn check_status(response: Response) -> std::result::Result<Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::CONFLICT => TransportError::Conflict(body),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            TransportError::Unavailable(format!("{}: {}", status, body))
        }
        s if s.is_server_error() => TransportError::Unavailable(format!("{}: {}", status, body)),
        s => TransportError::Rejected {
            status: s.as_u16(),
            message: body,
        },
    })
}
