use super::{RegistryTransport, TransportError};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, PoisonError};

/// In-process schema registry.
///
/// Backs `--dry-run` and the test suite. Failures can be scripted with
/// [`fail_next`](Self::fail_next) and [`reject_subject`](Self::reject_subject).
pub struct MemoryRegistry {
    state: Mutex<RegistryState>,
}

struct RegistryState {
    next_id: u32,
    schemas: HashMap<u32, String>,
    subjects: HashMap<String, Vec<u32>>,
    rejected_subjects: HashSet<String>,
    faults: VecDeque<TransportError>,
    calls: u32,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// A registry that hands out ids from `first_id` upwards.
    pub fn starting_at(first_id: u32) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                next_id: first_id,
                schemas: HashMap::new(),
                subjects: HashMap::new(),
                rejected_subjects: HashSet::new(),
                faults: VecDeque::new(),
                calls: 0,
            }),
        }
    }

    /// Makes the next `count` calls fail with `error`.
    pub fn fail_next(&self, count: usize, error: TransportError) {
        let mut state = self.lock();
        state.faults.extend(std::iter::repeat(error).take(count));
    }

    /// Makes every registration under `subject` fail as incompatible.
    pub fn reject_subject(&self, subject: impl Into<String>) {
        self.lock().rejected_subjects.insert(subject.into());
    }

    /// Stores a schema under a fixed id without going through a subject.
    pub fn insert_schema(&self, id: u32, schema: impl Into<String>) {
        let mut state = self.lock();
        state.schemas.insert(id, schema.into());
        state.next_id = state.next_id.max(id + 1);
    }

    /// Number of requests served, including failed ones.
    pub fn calls(&self) -> u32 {
        self.lock().calls
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RegistryTransport for MemoryRegistry {
    async fn register(&self, subject: &str, schema: &str) -> Result<u32, TransportError> {
        let mut state = self.lock();
        state.calls += 1;

        if let Some(fault) = state.faults.pop_front() {
            return Err(fault);
        }
        if state.rejected_subjects.contains(subject) {
            return Err(TransportError::Conflict(format!(
                "schema being registered is incompatible with an earlier schema for subject '{}'",
                subject
            )));
        }

        let existing = state.subjects.get(subject).and_then(|ids| {
            ids.iter()
                .copied()
                .find(|id| state.schemas.get(id).map(String::as_str) == Some(schema))
        });
        if let Some(id) = existing {
            return Ok(id);
        }

        let id = state.next_id;
        state.next_id += 1;
        state.schemas.insert(id, schema.to_string());
        state.subjects.entry(subject.to_string()).or_default().push(id);
        Ok(id)
    }

    async fn fetch_schema(&self, id: u32) -> Result<Option<String>, TransportError> {
        let mut state = self.lock();
        state.calls += 1;

        if let Some(fault) = state.faults.pop_front() {
            return Err(fault);
        }
        Ok(state.schemas.get(&id).cloned())
    }
}
