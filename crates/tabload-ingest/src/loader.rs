//! Batch loader
//!
//! Splits a job's records into contiguous batches and inserts them one at a
//! time. Batch `n + 1` is never submitted before the insert call for batch
//! `n` has returned, so the sink sees rows in source order.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tabload_common::{LoadError, Record, SinkError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::job::panic_message;
use crate::report::{Reporter, RunEvent};
use crate::sink::DocumentSink;

/// Default number of records per insert call
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Batching settings for one job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadSettings {
    batch_size: usize,
    /// Upper bound for a single insert call; `None` leaves it to the sink
    pub batch_timeout: Option<Duration>,
}

impl LoadSettings {
    /// A batch size of zero is treated as one
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            batch_timeout: None,
        }
    }

    pub fn with_batch_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.batch_timeout = timeout.filter(|t| !t.is_zero());
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

impl Default for LoadSettings {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_SIZE)
    }
}

/// What a successful load did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOutcome {
    pub inserted: usize,
    pub batches: usize,
}

/// Number of batches `records` records split into
pub fn batch_count(records: usize, batch_size: usize) -> usize {
    records.div_ceil(batch_size.max(1))
}

/// Inserts batches into a shared sink on behalf of one job
#[derive(Debug, Clone)]
pub struct BatchLoader {
    sink: Arc<dyn DocumentSink>,
    settings: LoadSettings,
    reporter: Reporter,
    cancel: CancellationToken,
}

impl BatchLoader {
    pub fn new(
        sink: Arc<dyn DocumentSink>,
        settings: LoadSettings,
        reporter: Reporter,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            sink,
            settings,
            reporter,
            cancel,
        }
    }

    /// Insert every record of `source`, reporting each committed batch.
    ///
    /// On failure nothing is rolled back; the error carries the failing
    /// batch index and how many records earlier batches committed.
    pub async fn load(&self, source: &str, records: &[Record]) -> Result<LoadOutcome, LoadError> {
        let mut inserted = 0usize;
        let mut batches = 0usize;

        for (offset, batch) in records.chunks(self.settings.batch_size).enumerate() {
            let batch_index = offset + 1;

            if self.cancel.is_cancelled() {
                return Err(LoadError::Cancelled {
                    batch_index,
                    inserted_so_far: inserted,
                });
            }

            let written = self
                .insert(batch)
                .await
                .map_err(|source| LoadError::SinkWriteFailed {
                    batch_index,
                    inserted_so_far: inserted,
                    source,
                })?;

            inserted += written;
            batches += 1;

            debug!(source, batch = batch_index, size = written, "Batch committed");
            self.reporter.emit(RunEvent::BatchInserted {
                source: source.to_string(),
                index: batch_index,
                size: written,
                running_total: inserted,
            });
        }

        Ok(LoadOutcome { inserted, batches })
    }

    async fn insert(&self, batch: &[Record]) -> Result<usize, SinkError> {
        // A panicking sink fails this batch; earlier batches stay counted
        let call = AssertUnwindSafe(self.sink.insert_many(batch)).catch_unwind();
        let outcome = match self.settings.batch_timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| SinkError::Timeout(limit))?,
            None => call.await,
        };
        let written = outcome.map_err(|payload| SinkError::Panicked(panic_message(payload.as_ref())))??;

        if written != batch.len() {
            return Err(SinkError::PartialWrite {
                expected: batch.len(),
                inserted: written,
            });
        }

        Ok(written)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::report::EventLog;
    use crate::sink::MemorySink;
    use async_trait::async_trait;
    use proptest::prelude::*;
    use tabload_common::Value;

    fn rows(n: usize) -> Vec<Record> {
        (0..n)
            .map(|i| std::iter::once(("n", Value::Int(i as i64))).collect())
            .collect()
    }

    fn loader(sink: Arc<dyn DocumentSink>, batch_size: usize, log: Arc<EventLog>) -> BatchLoader {
        BatchLoader::new(
            sink,
            LoadSettings::new(batch_size),
            Reporter::new(log),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_batches_and_running_totals() {
        let sink = Arc::new(MemorySink::new());
        let log = Arc::new(EventLog::new());

        let outcome = loader(sink.clone(), 1000, log.clone())
            .load("orders.csv", &rows(2500))
            .await
            .unwrap();

        assert_eq!(outcome, LoadOutcome { inserted: 2500, batches: 3 });
        assert_eq!(sink.batch_sizes(), vec![1000, 1000, 500]);
        assert_eq!(
            log.batches_for("orders.csv"),
            vec![(1, 1000, 1000), (2, 1000, 2000), (3, 500, 2500)]
        );
    }

    #[tokio::test]
    async fn test_empty_input_inserts_nothing() {
        let sink = Arc::new(MemorySink::new());
        let log = Arc::new(EventLog::new());

        let outcome = loader(sink.clone(), 10, log.clone()).load("empty.csv", &[]).await.unwrap();

        assert_eq!(outcome.inserted, 0);
        assert!(sink.batch_sizes().is_empty());
        assert_eq!(log.count("batch_inserted"), 0);
    }

    #[tokio::test]
    async fn test_failure_reports_batch_and_committed_count() {
        let calls = std::sync::atomic::AtomicUsize::new(0);
        let sink = Arc::new(MemorySink::new().fail_when(move |_| {
            let call = calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
            (call == 3).then(|| SinkError::Write("E11000 duplicate key".into()))
        }));
        let log = Arc::new(EventLog::new());

        let err = loader(sink.clone(), 4, log.clone())
            .load("orders.csv", &rows(20))
            .await
            .unwrap_err();

        assert_eq!(err.batch_index(), 3);
        assert_eq!(err.inserted_so_far(), 8);
        assert_eq!(sink.inserted(), 8);
        assert_eq!(log.count("batch_inserted"), 2);
    }

    struct ShortWrites;

    #[async_trait]
    impl DocumentSink for ShortWrites {
        fn namespace(&self) -> String {
            "short".into()
        }

        async fn insert_many(&self, batch: &[Record]) -> Result<usize, SinkError> {
            Ok(batch.len().saturating_sub(1))
        }
    }

    #[tokio::test]
    async fn test_short_write_is_hard_failure() {
        let err = loader(Arc::new(ShortWrites), 5, Arc::new(EventLog::new()))
            .load("orders.csv", &rows(5))
            .await
            .unwrap_err();

        match err {
            LoadError::SinkWriteFailed { source, .. } => assert_eq!(
                source,
                SinkError::PartialWrite {
                    expected: 5,
                    inserted: 4
                }
            ),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_panicking_sink_fails_the_batch_and_keeps_the_count() {
        let calls = std::sync::atomic::AtomicUsize::new(0);
        let sink = Arc::new(MemorySink::new().fail_when(move |_| {
            let call = calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
            if call == 2 {
                panic!("driver bug");
            }
            None
        }));
        let log = Arc::new(EventLog::new());

        let err = loader(sink.clone(), 10, log.clone())
            .load("orders.csv", &rows(30))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            LoadError::SinkWriteFailed {
                batch_index: 2,
                inserted_so_far: 10,
                source: SinkError::Panicked("driver bug".to_string()),
            }
        );
        assert_eq!(sink.inserted(), 10);
        assert_eq!(log.batches_for("orders.csv"), vec![(1, 10, 10)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_timeout() {
        let sink = Arc::new(MemorySink::new().with_latency(Duration::from_secs(30)));
        let loader = BatchLoader::new(
            sink,
            LoadSettings::new(10).with_batch_timeout(Some(Duration::from_secs(1))),
            Reporter::new(Arc::new(EventLog::new())),
            CancellationToken::new(),
        );

        let err = loader.load("slow.csv", &rows(3)).await.unwrap_err();
        assert!(matches!(
            err,
            LoadError::SinkWriteFailed {
                source: SinkError::Timeout(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_batch() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let sink = Arc::new(MemorySink::new());
        let loader = BatchLoader::new(
            sink.clone(),
            LoadSettings::new(2),
            Reporter::new(Arc::new(EventLog::new())),
            cancel,
        );

        let err = loader.load("a.csv", &rows(4)).await.unwrap_err();
        assert_eq!(
            err,
            LoadError::Cancelled {
                batch_index: 1,
                inserted_so_far: 0
            }
        );
        assert_eq!(sink.inserted(), 0);
    }

    #[test]
    fn test_zero_batch_size_is_clamped() {
        assert_eq!(LoadSettings::new(0).batch_size(), 1);
        assert_eq!(LoadSettings::default().with_batch_timeout(Some(Duration::ZERO)).batch_timeout, None);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_batches_cover_every_record(n in 0usize..400, batch_size in 1usize..64) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();
            let sink = Arc::new(MemorySink::new());

            let outcome = runtime
                .block_on(loader(sink.clone(), batch_size, Arc::new(EventLog::new())).load("p.csv", &rows(n)))
                .unwrap();

            let sizes = sink.batch_sizes();
            prop_assert_eq!(sizes.len(), batch_count(n, batch_size));
            prop_assert_eq!(outcome.inserted, n);
            if let Some((last, full)) = sizes.split_last() {
                prop_assert!(full.iter().all(|s| *s == batch_size));
                let expected_last = if n % batch_size == 0 { batch_size } else { n % batch_size };
                prop_assert_eq!(*last, expected_last);
            }
        }
    }
}
