use super::{RegistryTransport, SchemaBinding, TransportError};
use crate::backoff::Backoff;
use crate::config::{RegistryConfig, SubjectNameStrategy};
use crate::error::{DecodeError, RegistryError};
use apache_avro::rabin::Rabin;
use apache_avro::Schema;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// Fingerprint identifying a schema's canonical form.
pub fn fingerprint(schema: &Schema) -> String {
    schema.fingerprint::<Rabin>().to_string()
}

#[derive(Debug, Clone, Default)]
struct CacheSnapshot {
    by_subject: HashMap<String, SchemaBinding>,
    by_id: HashMap<u32, Arc<Schema>>,
}

/// Resolves schema ids against a registry and caches the results.
///
/// The cache is copy-on-write: every update publishes a new snapshot, so a
/// reader holding the previous `Arc` never sees a half-applied change.
pub struct SchemaRegistryClient {
    transport: Arc<dyn RegistryTransport>,
    topic: String,
    strategy: SubjectNameStrategy,
    backoff: Backoff,
    max_attempts: u32,
    resolve_timeout: Duration,
    cache: RwLock<Arc<CacheSnapshot>>,
    // Serializes cache misses so concurrent first uses cost one registration.
    resolve_lock: Mutex<()>,
}

impl SchemaRegistryClient {
    pub fn new(
        config: &RegistryConfig,
        topic: impl Into<String>,
        transport: Arc<dyn RegistryTransport>,
    ) -> Self {
        Self {
            transport,
            topic: topic.into(),
            strategy: config.subject_strategy,
            backoff: Backoff::from_millis(config.backoff_base_ms, config.backoff_cap_ms),
            max_attempts: config.max_attempts.max(1),
            resolve_timeout: config.resolve_timeout(),
            cache: RwLock::new(Arc::new(CacheSnapshot::default())),
            resolve_lock: Mutex::new(()),
        }
    }

    /// Subject `schema` is registered under. Record-based strategies use the
    /// schema's fully-qualified name, falling back to `event_type` for
    /// unnamed schemas.
    pub fn subject_for(&self, event_type: &str, schema: &Schema) -> String {
        let record_name = schema
            .name()
            .map(|name| name.fullname(None))
            .unwrap_or_else(|| event_type.to_string());
        self.strategy.subject(&self.topic, &record_name)
    }

    /// Returns the binding for `schema` under the subject derived from it,
    /// registering the schema on first use.
    #[instrument(skip(self, schema), fields(event_type = %event_type))]
    pub async fn resolve(
        &self,
        event_type: &str,
        schema: &Schema,
    ) -> Result<SchemaBinding, RegistryError> {
        let subject = self.subject_for(event_type, schema);
        let fingerprint = fingerprint(schema);

        if let Some(binding) = self.cached_binding(&subject, &fingerprint) {
            return Ok(binding);
        }

        let attempts = AtomicU32::new(0);
        match tokio::time::timeout(
            self.resolve_timeout,
            self.resolve_uncached(&subject, schema, &fingerprint, &attempts),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                warn!(subject = %subject, timeout = ?self.resolve_timeout, "Schema resolution timed out");
                Err(RegistryError::Unavailable {
                    attempts: attempts.load(Ordering::Relaxed),
                    reason: format!("resolution exceeded {:?}", self.resolve_timeout),
                })
            }
        }
    }

    /// Returns the schema registered under `id`, fetching it if this process
    /// has not seen it yet.
    pub async fn schema_by_id(&self, id: u32) -> Result<Arc<Schema>, DecodeError> {
        if let Some(schema) = self.cached_schema(id) {
            return Ok(schema);
        }

        let attempts = AtomicU32::new(0);
        let fetched = self
            .with_retry(&attempts, || self.transport.fetch_schema(id))
            .await
            .map_err(|e| into_registry_error(e, &attempts, &format!("id {}", id)))?;

        let Some(text) = fetched else {
            return Err(DecodeError::UnknownSchema(id));
        };
        let schema = Arc::new(
            Schema::parse_str(&text).map_err(|e| RegistryError::InvalidSchema(e.to_string()))?,
        );

        self.update(|cache| {
            cache.by_id.insert(id, Arc::clone(&schema));
        });
        debug!(schema_id = id, "Fetched schema by id");
        Ok(schema)
    }

    /// Looks up a schema by id without any network access.
    pub fn cached_schema(&self, id: u32) -> Option<Arc<Schema>> {
        self.snapshot().by_id.get(&id).cloned()
    }

    /// Drops the cached binding for `subject`; the next resolve goes to the
    /// registry. Schemas stay cached by id since an id never changes meaning.
    pub fn evict(&self, subject: &str) {
        self.update(|cache| {
            cache.by_subject.remove(subject);
        });
    }

    fn cached_binding(&self, subject: &str, fingerprint: &str) -> Option<SchemaBinding> {
        let snapshot = self.snapshot();
        let binding = snapshot.by_subject.get(subject)?;
        if binding.fingerprint == fingerprint {
            return Some(binding.clone());
        }

        info!(
            subject = %subject,
            schema_id = binding.schema_id,
            "Local schema changed since it was cached, evicting binding"
        );
        self.evict(subject);
        None
    }

    async fn resolve_uncached(
        &self,
        subject: &str,
        schema: &Schema,
        fingerprint: &str,
        attempts: &AtomicU32,
    ) -> Result<SchemaBinding, RegistryError> {
        let _guard = self.resolve_lock.lock().await;

        if let Some(binding) = self.cached_binding(subject, fingerprint) {
            return Ok(binding);
        }

        let canonical = schema.canonical_form();
        let mut mismatches = 0;

        loop {
            let registered = self
                .with_retry(attempts, || self.transport.register(subject, &canonical))
                .await;

            match registered {
                Ok(schema_id) => {
                    let binding = SchemaBinding {
                        schema_id,
                        fingerprint: fingerprint.to_string(),
                    };
                    let schema = Arc::new(schema.clone());
                    self.update(|cache| {
                        cache.by_subject.insert(subject.to_string(), binding.clone());
                        cache.by_id.insert(schema_id, schema);
                    });
                    info!(subject = %subject, schema_id, "Resolved schema");
                    return Ok(binding);
                }
                Err(TransportError::Conflict(reason)) if mismatches == 0 => {
                    mismatches += 1;
                    warn!(subject = %subject, reason = %reason, "Registry reported schema mismatch, re-resolving");
                    self.evict(subject);
                }
                Err(TransportError::Conflict(reason)) => {
                    return Err(RegistryError::Incompatible {
                        subject: subject.to_string(),
                        reason,
                    });
                }
                Err(e) => return Err(into_registry_error(e, attempts, subject)),
            }
        }
    }

    async fn with_retry<T, F, Fut>(&self, attempts: &AtomicU32, op: F) -> Result<T, TransportError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            attempts.fetch_add(1, Ordering::Relaxed);

            match op().await {
                Err(TransportError::Unavailable(reason)) if attempt < self.max_attempts => {
                    let delay = self.backoff.delay(attempt);
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay = ?delay,
                        reason = %reason,
                        "Schema registry unavailable, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }

    fn snapshot(&self) -> Arc<CacheSnapshot> {
        Arc::clone(&self.cache.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn update(&self, apply: impl FnOnce(&mut CacheSnapshot)) {
        let mut current = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = CacheSnapshot::clone(&current);
        apply(&mut next);
        *current = Arc::new(next);
    }
}

fn into_registry_error(err: TransportError, attempts: &AtomicU32, subject: &str) -> RegistryError {
    match err {
        TransportError::Unavailable(reason) => RegistryError::Unavailable {
            attempts: attempts.load(Ordering::Relaxed),
            reason,
        },
        TransportError::Conflict(reason) => RegistryError::Incompatible {
            subject: subject.to_string(),
            reason,
        },
        TransportError::Rejected { status, message } => RegistryError::Rejected { status, message },
    }
}
