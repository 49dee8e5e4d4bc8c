//! Batching publisher with bounded buffering, per-partition ordering and
//! retry.
//!
//! Records flow through three stages:
//!
//! 1. [`Publisher::publish`] checks size and buffer capacity, then hands the
//!    record to the accumulator.
//! 2. The accumulator groups records per partition and flushes a batch when
//!    it reaches `batch_size` bytes or has waited `linger_ms`.
//! 3. One lane task per partition sends batches in order over the pool
//!    connection that owns the partition, retrying transient failures.
//!
//! A lane does not start the next batch until the current one has reached a
//! terminal outcome, so a retried record is never overtaken by a later
//! record for the same key.

use super::delivery::{DeliveryHandle, DeliveryReporter, DeliveryTracker};
use super::key_strategy::partition_for_key;
use super::producer::BrokerTransport;
use super::record::{headers, PublishRecord, RecordAck};
use crate::backoff::Backoff;
use crate::config::PublisherConfig;
use crate::error::SendError;
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};

/// Slack on top of `request_timeout` so the transport reports its own
/// timeout before the publisher abandons the call.
const SEND_GRACE: Duration = Duration::from_millis(250);

struct Connection {
    transport: Arc<dyn BrokerTransport>,
    in_flight: Arc<Semaphore>,
}

/// Fixed set of broker connections. Each partition is always served by the
/// same connection.
pub struct ConnectionPool {
    connections: Vec<Connection>,
}

impl ConnectionPool {
    pub fn new(
        transports: Vec<Arc<dyn BrokerTransport>>,
        max_in_flight_per_connection: usize,
    ) -> Result<Self> {
        if transports.is_empty() {
            return Err(Error::InvalidConfig(
                "connection pool needs at least one transport".into(),
            ));
        }
        if max_in_flight_per_connection == 0 {
            return Err(Error::InvalidConfig(
                "max_in_flight_per_connection must be at least 1".into(),
            ));
        }

        let connections = transports
            .into_iter()
            .map(|transport| Connection {
                transport,
                in_flight: Arc::new(Semaphore::new(max_in_flight_per_connection)),
            })
            .collect();

        Ok(Self { connections })
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    fn for_partition(&self, partition: i32) -> &Connection {
        let slot = partition.unsigned_abs() as usize % self.connections.len();
        &self.connections[slot]
    }

    fn primary(&self) -> &Connection {
        &self.connections[0]
    }
}

/// A record waiting for its outcome. Holds a buffer slot until dropped.
struct Pending {
    record: PublishRecord,
    partition: i32,
    deadline: Instant,
    reporter: DeliveryReporter,
    _slot: OwnedSemaphorePermit,
}

struct Batch {
    partition: i32,
    records: Vec<Pending>,
    bytes: usize,
    opened_at: Instant,
}

impl Batch {
    fn new(partition: i32) -> Self {
        Self {
            partition,
            records: Vec::new(),
            bytes: 0,
            opened_at: Instant::now(),
        }
    }
}

struct Lane {
    tx: mpsc::UnboundedSender<Vec<Pending>>,
    handle: JoinHandle<()>,
}

/// Shared by the accumulator and every lane.
struct Dispatcher {
    pool: ConnectionPool,
    config: PublisherConfig,
    backoff: Backoff,
}

struct Inner {
    topic: String,
    partitions: i32,
    session_id: String,
    config: PublisherConfig,
    tracker: DeliveryTracker,
    buffer: Arc<Semaphore>,
    record_tx: mpsc::UnboundedSender<Pending>,
    shutdown_tx: watch::Sender<bool>,
    closed: AtomicBool,
    accumulator: Mutex<Option<JoinHandle<()>>>,
}

/// Publishes records to one topic. Cheap to clone; clones share buffers,
/// connections and the delivery tracker.
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<Inner>,
}

impl Publisher {
    /// Reads the topic's partition count and starts the background tasks.
    pub async fn start(
        config: PublisherConfig,
        topic: impl Into<String>,
        session_id: impl Into<String>,
        pool: ConnectionPool,
    ) -> Result<Self> {
        config.validate()?;
        let topic = topic.into();
        let session_id = session_id.into();

        let partitions = pool
            .primary()
            .transport
            .partition_count(&topic)
            .await
            .map_err(|e| Error::Metadata {
                message: format!("partition count for '{}': {}", topic, e),
            })?;
        if partitions <= 0 {
            return Err(Error::Metadata {
                message: format!("topic '{}' reports {} partitions", topic, partitions),
            });
        }

        let (record_tx, record_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let dispatcher = Arc::new(Dispatcher {
            backoff: Backoff::from_millis(config.retry_backoff_ms, config.retry_backoff_max_ms),
            config: config.clone(),
            pool,
        });
        let accumulator = tokio::spawn(accumulate(dispatcher, record_rx, shutdown_rx));

        info!(
            topic = %topic,
            partitions,
            session = %session_id,
            "Publisher started"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                buffer: Arc::new(Semaphore::new(config.buffer_records)),
                topic,
                partitions,
                session_id,
                config,
                tracker: DeliveryTracker::new(),
                record_tx,
                shutdown_tx,
                closed: AtomicBool::new(false),
                accumulator: Mutex::new(Some(accumulator)),
            }),
        })
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn partitions(&self) -> i32 {
        self.inner.partitions
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn tracker(&self) -> &DeliveryTracker {
        &self.inner.tracker
    }

    /// Partition a record with this key is sent to.
    pub fn partition_for(&self, key: &[u8]) -> i32 {
        partition_for_key(key, self.inner.partitions)
    }

    /// Queues `record` and returns a handle to its outcome.
    ///
    /// Waits up to `enqueue_timeout_ms` for buffer space. Failures that
    /// happen before the record is queued resolve the handle immediately.
    pub async fn publish(&self, record: PublishRecord) -> DeliveryHandle {
        let inner = &self.inner;
        let (reporter, handle) = inner.tracker.track();

        if inner.closed.load(Ordering::Acquire) {
            reporter.failure("publisher is shut down", false);
            return handle;
        }
        if record.topic != inner.topic {
            reporter.failure(
                format!("publisher serves '{}', not '{}'", inner.topic, record.topic),
                false,
            );
            return handle;
        }

        let record = record.with_header(
            headers::PRODUCER_SESSION,
            inner.session_id.clone().into_bytes(),
        );
        let size = record.size();
        if size > inner.config.max_request_size {
            warn!(
                size,
                max = inner.config.max_request_size,
                "Record exceeds max request size"
            );
            reporter.failure(
                format!(
                    "record is {} bytes, larger than max_request_size {}",
                    size, inner.config.max_request_size
                ),
                false,
            );
            return handle;
        }

        let deadline = Instant::now() + inner.config.delivery_timeout();
        let slot = match timeout(
            inner.config.enqueue_timeout(),
            Arc::clone(&inner.buffer).acquire_owned(),
        )
        .await
        {
            Ok(Ok(slot)) => slot,
            Ok(Err(_)) => {
                reporter.failure("publisher is shut down", false);
                return handle;
            }
            Err(_) => {
                warn!(
                    buffered = inner.config.buffer_records,
                    "Publish buffer full, giving up"
                );
                reporter.failure(
                    format!(
                        "buffer full: no space within {:?}",
                        inner.config.enqueue_timeout()
                    ),
                    true,
                );
                return handle;
            }
        };

        let pending = Pending {
            partition: partition_for_key(&record.key, inner.partitions),
            record,
            deadline,
            reporter,
            _slot: slot,
        };
        if let Err(mpsc::error::SendError(pending)) = inner.record_tx.send(pending) {
            pending.reporter.failure("publisher is shut down", false);
        }

        handle
    }

    /// Stops accepting records, flushes everything buffered and waits for
    /// every outstanding delivery to finish.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if !inner.closed.swap(true, Ordering::AcqRel) {
            info!(topic = %inner.topic, "Shutting down publisher");
        }
        inner.buffer.close();
        let _ = inner.shutdown_tx.send(true);

        if let Some(accumulator) = inner.accumulator.lock().await.take() {
            if let Err(e) = accumulator.await {
                error!("Publisher accumulator task failed: {}", e);
            }
        }
        inner.tracker.wait_idle().await;

        let stats = inner.tracker.stats();
        info!(
            succeeded = stats.succeeded,
            failed = stats.failed,
            "Publisher stopped"
        );
    }
}

async fn accumulate(
    dispatcher: Arc<Dispatcher>,
    mut rx: mpsc::UnboundedReceiver<Pending>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let linger = dispatcher.config.linger();
    let batch_size = dispatcher.config.batch_size;
    let mut batches: HashMap<i32, Batch> = HashMap::new();
    let mut lanes: HashMap<i32, Lane> = HashMap::new();
    let mut draining = false;

    loop {
        let next_expiry = batches.values().map(|b| b.opened_at + linger).min();

        tokio::select! {
            biased;

            changed = shutdown_rx.changed(), if !draining => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    debug!("Accumulator draining");
                    draining = true;
                    rx.close();
                }
            }

            received = rx.recv() => {
                let Some(pending) = received else { break };
                let partition = pending.partition;
                let size = pending.record.size();

                let overflows = batches
                    .get(&partition)
                    .is_some_and(|b| !b.records.is_empty() && b.bytes + size > batch_size);
                if overflows {
                    if let Some(full) = batches.remove(&partition) {
                        dispatch(&dispatcher, &mut lanes, full);
                    }
                }

                let batch = batches
                    .entry(partition)
                    .or_insert_with(|| Batch::new(partition));
                batch.bytes += size;
                batch.records.push(pending);

                if batch.bytes >= batch_size || linger.is_zero() {
                    if let Some(ready) = batches.remove(&partition) {
                        dispatch(&dispatcher, &mut lanes, ready);
                    }
                }
            }

            _ = sleep_until(next_expiry.unwrap_or_else(Instant::now)), if next_expiry.is_some() => {
                let now = Instant::now();
                let expired: Vec<i32> = batches
                    .values()
                    .filter(|b| b.opened_at + linger <= now)
                    .map(|b| b.partition)
                    .collect();
                for partition in expired {
                    if let Some(batch) = batches.remove(&partition) {
                        dispatch(&dispatcher, &mut lanes, batch);
                    }
                }
            }
        }
    }

    for (_, batch) in batches.drain() {
        dispatch(&dispatcher, &mut lanes, batch);
    }

    for (partition, lane) in lanes {
        drop(lane.tx);
        if let Err(e) = lane.handle.await {
            error!(partition, "Partition lane failed: {}", e);
        }
    }
}

fn dispatch(dispatcher: &Arc<Dispatcher>, lanes: &mut HashMap<i32, Lane>, batch: Batch) {
    debug!(
        partition = batch.partition,
        records = batch.records.len(),
        bytes = batch.bytes,
        "Flushing batch"
    );

    let lane = lanes
        .entry(batch.partition)
        .or_insert_with(|| spawn_lane(Arc::clone(dispatcher), batch.partition));

    if let Err(mpsc::error::SendError(records)) = lane.tx.send(batch.records) {
        for pending in records {
            pending.reporter.failure("partition lane stopped", true);
        }
    }
}

fn spawn_lane(dispatcher: Arc<Dispatcher>, partition: i32) -> Lane {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<Pending>>();
    let handle = tokio::spawn(async move {
        while let Some(batch) = rx.recv().await {
            dispatcher.deliver(partition, batch).await;
        }
    });
    Lane { tx, handle }
}

impl Dispatcher {
    /// Sends one batch until every record has a terminal outcome.
    async fn deliver(&self, partition: i32, mut pending: Vec<Pending>) {
        let connection = self.pool.for_partition(partition);
        let mut attempt: u32 = 0;

        loop {
            pending = expire(pending, Instant::now());
            if pending.is_empty() {
                return;
            }

            let records: Vec<PublishRecord> = pending.iter().map(|p| p.record.clone()).collect();
            let results = self.send(connection, partition, &records).await;

            // A failed record that sits before a stored one cannot be resent
            // without landing behind it.
            let last_stored = results.iter().rposition(|r| r.is_ok());

            let mut retry = Vec::new();
            let mut last_error = None;
            for (index, (entry, result)) in pending.into_iter().zip(results).enumerate() {
                match result {
                    Ok(ack) => {
                        let timestamp = entry.record.timestamp;
                        into_reporter(entry).success(ack.partition, ack.offset, timestamp);
                    }
                    Err(e) if e.retriable && last_stored.is_some_and(|last| index < last) => {
                        warn!(
                            partition,
                            id = entry.reporter.id(),
                            "Later records of the batch were stored, not resending: {}",
                            e
                        );
                        into_reporter(entry).failure(
                            format!("{} (not resent: later records were already stored)", e.message),
                            true,
                        );
                    }
                    Err(e) if e.retriable => {
                        debug!(id = entry.reporter.id(), "Retriable send failure: {}", e);
                        last_error = Some(e);
                        retry.push(entry);
                    }
                    Err(e) => {
                        warn!(partition, "Record rejected by broker: {}", e);
                        into_reporter(entry).failure(e.message, false);
                    }
                }
            }
            if retry.is_empty() {
                return;
            }

            attempt += 1;
            let reason = last_error.map(|e| e.message).unwrap_or_default();
            if attempt > self.config.retries {
                warn!(
                    partition,
                    records = retry.len(),
                    attempts = attempt,
                    "Retries exhausted: {}",
                    reason
                );
                for entry in retry {
                    into_reporter(entry).failure(
                        format!("retries exhausted after {} attempt(s): {}", attempt, reason),
                        true,
                    );
                }
                return;
            }

            let delay = self.backoff.delay(attempt);
            debug!(
                partition,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Retrying batch"
            );
            pending = expire(retry, Instant::now() + delay);
            if pending.is_empty() {
                return;
            }
            tokio::time::sleep(delay).await;
        }
    }

    async fn send(
        &self,
        connection: &Connection,
        partition: i32,
        records: &[PublishRecord],
    ) -> Vec<std::result::Result<RecordAck, SendError>> {
        let request_timeout = self.config.request_timeout();

        let _permit = match timeout(request_timeout, connection.in_flight.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return fail_all(records.len(), SendError::retriable("connection closed")),
            Err(_) => {
                return fail_all(
                    records.len(),
                    SendError::retriable("timed out waiting for an in-flight slot"),
                )
            }
        };

        match timeout(
            request_timeout + SEND_GRACE,
            connection.transport.send_batch(partition, records),
        )
        .await
        {
            Ok(results) if results.len() == records.len() => results,
            Ok(results) => {
                error!(
                    expected = records.len(),
                    got = results.len(),
                    "Transport returned wrong number of results"
                );
                fail_all(
                    records.len(),
                    SendError::retriable("transport returned incomplete results"),
                )
            }
            Err(_) => fail_all(
                records.len(),
                SendError::retriable(format!("request timed out after {:?}", request_timeout)),
            ),
        }
    }
}

fn into_reporter(pending: Pending) -> DeliveryReporter {
    pending.reporter
}

fn fail_all(count: usize, error: SendError) -> Vec<std::result::Result<RecordAck, SendError>> {
    vec![Err(error); count]
}

/// Fails every record whose deadline falls at or before `at`.
fn expire(pending: Vec<Pending>, at: Instant) -> Vec<Pending> {
    let (expired, live): (Vec<_>, Vec<_>) = pending.into_iter().partition(|p| p.deadline <= at);
    for entry in expired {
        into_reporter(entry).failure("delivery timeout exceeded", true);
    }
    live
}
