use super::producer::BrokerTransport;
use super::record::{PublishRecord, RecordAck};
use crate::error::SendError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// In-process broker for tests and dry runs.
///
/// Appends records to per-partition logs and hands out offsets the way a
/// single-replica broker would. Faults can be queued per send call.
pub struct MemoryBroker {
    partitions: i32,
    latency: Duration,
    state: Mutex<BrokerState>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

#[derive(Default)]
struct BrokerState {
    logs: HashMap<i32, Vec<PublishRecord>>,
    base_offset: i64,
    faults: VecDeque<SendError>,
    batch_sizes: Vec<usize>,
}

impl MemoryBroker {
    pub fn new(partitions: i32) -> Self {
        Self {
            partitions,
            latency: Duration::ZERO,
            state: Mutex::new(BrokerState::default()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Every send call takes at least `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// First offset assigned in every partition.
    pub fn with_base_offset(self, offset: i64) -> Self {
        self.lock().base_offset = offset;
        self
    }

    /// Fails the next `count` send calls, whole batches at a time.
    pub fn fail_next(&self, count: usize, error: SendError) {
        let mut state = self.lock();
        state.faults.extend(std::iter::repeat(error).take(count));
    }

    pub fn send_calls(&self) -> usize {
        self.lock().batch_sizes.len()
    }

    /// Records per send call, in call order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.lock().batch_sizes.clone()
    }

    /// Stored records of `partition`, in offset order.
    pub fn records(&self, partition: i32) -> Vec<PublishRecord> {
        self.lock().logs.get(&partition).cloned().unwrap_or_default()
    }

    pub fn total_records(&self) -> usize {
        self.lock().logs.values().map(Vec::len).sum()
    }

    /// Highest number of send calls that overlapped.
    pub fn max_concurrent_sends(&self) -> usize {
        self.max_in_flight.load(Ordering::Acquire)
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl BrokerTransport for MemoryBroker {
    async fn partition_count(&self, _topic: &str) -> Result<i32, SendError> {
        Ok(self.partitions)
    }

    async fn send_batch(
        &self,
        partition: i32,
        records: &[PublishRecord],
    ) -> Vec<Result<RecordAck, SendError>> {
        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.max_in_flight.fetch_max(now, Ordering::AcqRel);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let results = {
            let mut state = self.lock();
            state.batch_sizes.push(records.len());

            if let Some(fault) = state.faults.pop_front() {
                vec![Err(fault); records.len()]
            } else if partition < 0 || partition >= self.partitions {
                vec![
                    Err(SendError::fatal(format!("unknown partition {}", partition)));
                    records.len()
                ]
            } else {
                let base = state.base_offset;
                let log = state.logs.entry(partition).or_default();
                records
                    .iter()
                    .map(|record| {
                        let offset = base + log.len() as i64;
                        log.push(record.clone());
                        Ok(RecordAck { partition, offset })
                    })
                    .collect()
            }
        };

        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn record(key: &'static str) -> PublishRecord {
        PublishRecord::new("order.v1", Bytes::from_static(key.as_bytes()), Bytes::new())
    }

    #[tokio::test]
    async fn test_offsets_are_sequential_per_partition() {
        let broker = MemoryBroker::new(2).with_base_offset(480);

        let first = broker.send_batch(0, &[record("a"), record("b")]).await;
        let second = broker.send_batch(1, &[record("c")]).await;

        assert_eq!(
            first,
            vec![
                Ok(RecordAck { partition: 0, offset: 480 }),
                Ok(RecordAck { partition: 0, offset: 481 })
            ]
        );
        assert_eq!(second, vec![Ok(RecordAck { partition: 1, offset: 480 })]);
        assert_eq!(broker.records(0).len(), 2);
        assert_eq!(broker.batch_sizes(), vec![2, 1]);
    }

    #[tokio::test]
    async fn test_faults_fail_whole_batches() {
        let broker = MemoryBroker::new(1);
        broker.fail_next(1, SendError::retriable("leader not available"));

        let failed = broker.send_batch(0, &[record("a"), record("b")]).await;
        assert!(failed.iter().all(|r| r.as_ref().is_err_and(|e| e.retriable)));
        assert_eq!(broker.total_records(), 0);

        let ok = broker.send_batch(0, &[record("a")]).await;
        assert_eq!(ok, vec![Ok(RecordAck { partition: 0, offset: 0 })]);
    }

    #[tokio::test]
    async fn test_unknown_partition_is_fatal() {
        let broker = MemoryBroker::new(1);
        let results = broker.send_batch(3, &[record("a")]).await;
        assert!(matches!(&results[0], Err(e) if !e.retriable));
    }
}
