//! In-memory sink used by tests and `--dry-run`

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tabload_common::{ConnectionError, Record, SinkError};

use super::{DocumentSink, SinkConnector};

type FailWhen = dyn Fn(&[Record]) -> Option<SinkError> + Send + Sync;

#[derive(Debug, Default)]
struct Written {
    records: Vec<Record>,
    batch_sizes: Vec<usize>,
}

/// Sink that keeps (or counts) everything it is given.
///
/// Tracks how many `insert_many` calls are in flight at once so concurrency
/// bounds can be asserted.
pub struct MemorySink {
    namespace: String,
    retain: bool,
    written: Mutex<Written>,
    inserted: AtomicUsize,
    latency: Option<Duration>,
    fail_when: Option<Box<FailWhen>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl std::fmt::Debug for MemorySink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySink")
            .field("namespace", &self.namespace)
            .field("retain", &self.retain)
            .field("inserted", &self.inserted.load(Ordering::Relaxed))
            .field("latency", &self.latency)
            .finish_non_exhaustive()
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySink {
    pub fn new() -> Self {
        Self {
            namespace: "memory.records".to_string(),
            retain: true,
            written: Mutex::new(Written::default()),
            inserted: AtomicUsize::new(0),
            latency: None,
            fail_when: None,
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Acknowledge every record without keeping it
    pub fn discarding() -> Self {
        Self {
            namespace: "dry-run".to_string(),
            retain: false,
            ..Self::new()
        }
    }

    /// Sleep this long inside every insert
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail any batch for which `check` returns an error. Nothing from a
    /// failed batch is recorded.
    pub fn fail_when<F>(mut self, check: F) -> Self
    where
        F: Fn(&[Record]) -> Option<SinkError> + Send + Sync + 'static,
    {
        self.fail_when = Some(Box::new(check));
        self
    }

    /// Every retained record, in arrival order
    pub fn records(&self) -> Vec<Record> {
        self.lock().records.clone()
    }

    /// Size of each acknowledged batch, in arrival order
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.lock().batch_sizes.clone()
    }

    /// Total records acknowledged, including discarded ones
    pub fn inserted(&self) -> usize {
        self.inserted.load(Ordering::SeqCst)
    }

    /// Highest number of concurrent `insert_many` calls observed
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, Written> {
        // A panicking test thread must not hide what was already written
        self.written.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl DocumentSink for MemorySink {
    fn namespace(&self) -> String {
        self.namespace.clone()
    }

    async fn insert_many(&self, batch: &[Record]) -> Result<usize, SinkError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        if let Some(err) = self.fail_when.as_ref().and_then(|check| check(batch)) {
            return Err(err);
        }

        {
            let mut written = self.lock();
            if self.retain {
                written.records.extend_from_slice(batch);
            }
            written.batch_sizes.push(batch.len());
        }
        self.inserted.fetch_add(batch.len(), Ordering::SeqCst);

        Ok(batch.len())
    }
}

/// Connector handing out a shared [`MemorySink`]
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    sink: Arc<MemorySink>,
    failure: Option<ConnectionError>,
}

impl MemoryConnector {
    pub fn new(sink: Arc<MemorySink>) -> Self {
        Self {
            sink,
            failure: None,
        }
    }

    /// Connector whose `open` always fails with `err`
    pub fn failing(err: ConnectionError) -> Self {
        Self {
            sink: Arc::new(MemorySink::new()),
            failure: Some(err),
        }
    }

    pub fn sink(&self) -> Arc<MemorySink> {
        Arc::clone(&self.sink)
    }
}

#[async_trait]
impl SinkConnector for MemoryConnector {
    fn target(&self) -> String {
        format!("memory ({})", self.sink.namespace)
    }

    async fn open(&self) -> Result<Arc<dyn DocumentSink>, ConnectionError> {
        match &self.failure {
            Some(err) => Err(err.clone()),
            None => Ok(self.sink.clone() as Arc<dyn DocumentSink>),
        }
    }
}
