//! Run lifecycle events and their observers
//!
//! Observers are side-effect only. A panicking observer is logged and
//! skipped; it never changes how the pipeline proceeds.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::job::Stage;

/// A lifecycle milestone of a run
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    RunStarted {
        run_id: Uuid,
        sources: usize,
        max_concurrency: usize,
    },
    Connected {
        target: String,
    },
    RunAborted {
        reason: String,
    },
    Extracted {
        source: String,
        records: usize,
    },
    Transformed {
        source: String,
    },
    BatchInserted {
        source: String,
        /// 1-based
        index: usize,
        size: usize,
        running_total: usize,
    },
    JobCompleted {
        source: String,
        inserted: usize,
        elapsed: Duration,
    },
    JobFailed {
        source: String,
        stage: Option<Stage>,
        error: String,
        inserted: usize,
    },
    RunCompleted {
        total_inserted: usize,
        elapsed: Duration,
        succeeded: usize,
        failed: usize,
    },
}

impl RunEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RunEvent::RunStarted { .. } => "run_started",
            RunEvent::Connected { .. } => "connected",
            RunEvent::RunAborted { .. } => "run_aborted",
            RunEvent::Extracted { .. } => "extracted",
            RunEvent::Transformed { .. } => "transformed",
            RunEvent::BatchInserted { .. } => "batch_inserted",
            RunEvent::JobCompleted { .. } => "job_completed",
            RunEvent::JobFailed { .. } => "job_failed",
            RunEvent::RunCompleted { .. } => "run_completed",
        }
    }
}

/// Receives run events. Called concurrently from every job.
pub trait RunObserver: Send + Sync {
    fn observe(&self, event: &RunEvent);
}

fn observe_guarded(observer: &dyn RunObserver, event: &RunEvent) {
    if catch_unwind(AssertUnwindSafe(|| observer.observe(event))).is_err() {
        warn!(event = event.name(), "Run observer panicked, event dropped");
    }
}

/// Cloneable handle the pipeline emits through
#[derive(Clone)]
pub struct Reporter {
    observer: Arc<dyn RunObserver>,
}

impl std::fmt::Debug for Reporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reporter").finish_non_exhaustive()
    }
}

impl Reporter {
    pub fn new(observer: Arc<dyn RunObserver>) -> Self {
        Self { observer }
    }

    pub fn emit(&self, event: RunEvent) {
        observe_guarded(self.observer.as_ref(), &event);
    }
}

/// Logs every event through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl RunObserver for TracingReporter {
    fn observe(&self, event: &RunEvent) {
        match event {
            RunEvent::RunStarted {
                run_id,
                sources,
                max_concurrency,
            } => info!(
                run_id = %run_id,
                sources,
                max_concurrency,
                "Starting parallel ETL process"
            ),
            RunEvent::Connected { target } => info!(target = %target, "Connected to sink"),
            RunEvent::RunAborted { reason } => error!(reason = %reason, "Run aborted"),
            RunEvent::Extracted { source, records } => {
                info!(source = %source, records, "Extracted {} rows from {}", records, source)
            },
            RunEvent::Transformed { source } => {
                info!(source = %source, "Transformation complete.")
            },
            RunEvent::BatchInserted {
                source,
                index,
                size,
                running_total,
            } => info!(
                source = %source,
                batch = index,
                size,
                running_total,
                "{}: Inserted batch {} ({} records).",
                source,
                index,
                size
            ),
            RunEvent::JobCompleted {
                source,
                inserted,
                elapsed,
            } => info!(
                source = %source,
                inserted,
                elapsed_ms = elapsed.as_millis() as u64,
                "{}: Finished inserting {} records",
                source,
                inserted
            ),
            RunEvent::JobFailed {
                source,
                stage,
                error,
                inserted,
            } => {
                let stage = stage.map(|s| s.as_str()).unwrap_or("unknown");
                error!(
                    source = %source,
                    stage,
                    inserted,
                    error = %error,
                    "{}: Job failed",
                    source
                )
            },
            RunEvent::RunCompleted {
                total_inserted,
                elapsed,
                succeeded,
                failed,
            } => info!(
                total_inserted,
                succeeded,
                failed,
                "Parallel ETL process completed in {:.2} seconds",
                elapsed.as_secs_f64()
            ),
        }
    }
}

/// Keeps every event in memory, in arrival order
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<RunEvent>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RunEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// `(index, size, running_total)` of every batch reported for `source`
    pub fn batches_for(&self, source: &str) -> Vec<(usize, usize, usize)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                RunEvent::BatchInserted {
                    source: s,
                    index,
                    size,
                    running_total,
                } if s == source => Some((index, size, running_total)),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events().iter().filter(|e| e.name() == name).count()
    }
}

impl RunObserver for EventLog {
    fn observe(&self, event: &RunEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event.clone()),
            Err(poisoned) => poisoned.into_inner().push(event.clone()),
        }
    }
}

/// Fans every event out to several observers
#[derive(Default)]
pub struct Observers {
    observers: Vec<Arc<dyn RunObserver>>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl RunObserver for Observers {
    fn observe(&self, event: &RunEvent) {
        for observer in &self.observers {
            observe_guarded(observer.as_ref(), event);
        }
    }
}
