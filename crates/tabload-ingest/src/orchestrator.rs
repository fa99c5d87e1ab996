//! Run orchestration
//!
//! Opens the sink once, fans one [`Job`] per source out over a bounded pool
//! and waits for every job to finish. A failing job never stops its
//! siblings; only configuration and connection errors abort the run.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tabload_common::{ConfigError, ConnectionError};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::job::{Job, JobContext, JobError, JobReport};
use crate::report::{Reporter, RunEvent, RunObserver};
use crate::sink::SinkConnector;
use crate::source::CsvReader;

/// Orchestrator lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Connecting,
    Dispatching,
    AwaitingJobs,
    Reporting,
    Done,
    Aborted,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Connecting => "connecting",
            RunState::Dispatching => "dispatching",
            RunState::AwaitingJobs => "awaiting_jobs",
            RunState::Reporting => "reporting",
            RunState::Done => "done",
            RunState::Aborted => "aborted",
        }
    }
}

/// Errors that stop a run before any job is dispatched
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Sink unavailable: {0}")]
    Connection(#[from] ConnectionError),
}

/// Aggregate outcome of a run
#[derive(Debug)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub total_inserted: usize,
    pub elapsed: Duration,
    /// One report per source, in configuration order
    pub jobs: Vec<JobReport>,
}

impl RunSummary {
    pub fn succeeded(&self) -> usize {
        self.jobs.iter().filter(|job| job.succeeded()).count()
    }

    pub fn failed(&self) -> usize {
        self.jobs.len() - self.succeeded()
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }
}

/// Drives a single run against one sink connection
pub struct Orchestrator {
    config: PipelineConfig,
    connector: Arc<dyn SinkConnector>,
    reporter: Reporter,
    cancel: CancellationToken,
    state: RunState,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("target", &self.connector.target())
            .field("sources", &self.config.sources.len())
            .field("state", &self.state)
            .finish()
    }
}

impl Orchestrator {
    pub fn new(
        config: PipelineConfig,
        connector: Arc<dyn SinkConnector>,
        observer: Arc<dyn RunObserver>,
    ) -> Self {
        Self {
            config,
            connector,
            reporter: Reporter::new(observer),
            cancel: CancellationToken::new(),
            state: RunState::Idle,
        }
    }

    /// Use an externally owned token, e.g. one cancelled on Ctrl-C
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn transition(&mut self, next: RunState) {
        debug!(from = self.state.as_str(), to = next.as_str(), "Run state change");
        self.state = next;
    }

    fn abort(&mut self, reason: String) {
        self.reporter.emit(RunEvent::RunAborted { reason });
        self.transition(RunState::Aborted);
    }

    /// Execute the run to completion
    pub async fn run(&mut self) -> Result<RunSummary, RunError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", run_id = %run_id);
        self.execute(run_id).instrument(span).await
    }

    async fn execute(&mut self, run_id: Uuid) -> Result<RunSummary, RunError> {
        let started_at = Utc::now();
        let started = Instant::now();

        if let Err(err) = self.config.validate() {
            self.abort(err.to_string());
            return Err(err.into());
        }

        let workers = self.config.worker_count();
        self.reporter.emit(RunEvent::RunStarted {
            run_id,
            sources: self.config.sources.len(),
            max_concurrency: workers,
        });

        self.transition(RunState::Connecting);
        let sink = match self.connector.open().await {
            Ok(sink) => sink,
            Err(err) => {
                self.abort(err.to_string());
                return Err(err.into());
            },
        };
        self.reporter.emit(RunEvent::Connected {
            target: self.connector.target(),
        });

        self.transition(RunState::Dispatching);
        let ctx = JobContext {
            sink,
            reader: CsvReader::new(self.config.reader_options()),
            duplicate_columns: self.config.duplicate_columns,
            load: self.config.load_settings(),
            reporter: self.reporter.clone(),
            cancel: self.cancel.clone(),
        };
        let permits = Arc::new(Semaphore::new(workers));
        let mut join_set: JoinSet<(usize, JobReport)> = JoinSet::new();

        for (index, source) in self.config.sources.iter().cloned().enumerate() {
            let job = Job::new(source.clone(), ctx.clone());
            let permits = Arc::clone(&permits);
            let reporter = self.reporter.clone();

            join_set.spawn(
                async move {
                    let report = match permits.acquire_owned().await {
                        Ok(_permit) => run_guarded(job, source, &reporter).await,
                        Err(closed) => JobReport::failed(
                            source,
                            JobError::Panicked {
                                stage: None,
                                message: format!("worker pool closed: {}", closed),
                            },
                            Duration::ZERO,
                        ),
                    };
                    (index, report)
                }
                .in_current_span(),
            );
        }

        self.transition(RunState::AwaitingJobs);
        let mut slots: Vec<Option<JobReport>> = self.config.sources.iter().map(|_| None).collect();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, report)) => slots[index] = Some(report),
                Err(join_err) => error!("Job task did not complete: {}", join_err),
            }
        }

        self.transition(RunState::Reporting);
        let jobs: Vec<JobReport> = slots
            .into_iter()
            .zip(self.config.sources.iter())
            .map(|(slot, source)| {
                slot.unwrap_or_else(|| {
                    JobReport::failed(
                        source.clone(),
                        JobError::Panicked {
                            stage: None,
                            message: "job task was lost".to_string(),
                        },
                        Duration::ZERO,
                    )
                })
            })
            .collect();

        let summary = RunSummary {
            run_id,
            started_at,
            total_inserted: jobs.iter().map(|job| job.inserted).sum(),
            elapsed: started.elapsed(),
            jobs,
        };

        self.reporter.emit(RunEvent::RunCompleted {
            total_inserted: summary.total_inserted,
            elapsed: summary.elapsed,
            succeeded: summary.succeeded(),
            failed: summary.failed(),
        });
        self.transition(RunState::Done);

        Ok(summary)
    }
}

/// Run a job, turning a panic anywhere inside it into that job's failure
async fn run_guarded(job: Job, source: PathBuf, reporter: &Reporter) -> JobReport {
    let started = Instant::now();

    match AssertUnwindSafe(job.run()).catch_unwind().await {
        Ok(report) => report,
        Err(payload) => {
            let err = JobError::panicked(None, payload.as_ref());
            warn!(source = %source.display(), error = %err, "Job panicked");
            reporter.emit(RunEvent::JobFailed {
                source: source.display().to_string(),
                stage: None,
                error: err.to_string(),
                inserted: 0,
            });
            JobReport::failed(source, err, started.elapsed())
        },
    }
}
