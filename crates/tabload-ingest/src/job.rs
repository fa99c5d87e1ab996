//! One source file's extract, transform and load pipeline

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tabload_common::{LoadError, Record, SourceError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::loader::{BatchLoader, LoadSettings};
use crate::normalize::{DuplicateColumns, Normalizer};
use crate::report::{Reporter, RunEvent};
use crate::sink::DocumentSink;
use crate::source::CsvReader;

/// Pipeline stage a job is in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extract,
    Transform,
    Load,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Extract => "extract",
            Stage::Transform => "transform",
            Stage::Load => "load",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job lifecycle. Transitions only move forward; `Completed` and `Failed`
/// are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Extracting,
    Transforming,
    Loading,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Extracting => "extracting",
            JobState::Transforming => "transforming",
            JobState::Loading => "loading",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Extracting)
                | (Extracting, Transforming)
                | (Transforming, Loading)
                | (Loading, Completed)
                | (Pending | Extracting | Transforming | Loading, Failed)
        )
    }
}

/// Why a job failed
#[derive(Debug, Error)]
pub enum JobError {
    #[error("{0}")]
    Extract(#[from] SourceError),

    #[error("{0}")]
    Load(#[from] LoadError),

    #[error("Cancelled before {stage}")]
    Cancelled { stage: Stage },

    #[error("Job panicked during {}: {message}", stage.map(|s| s.as_str()).unwrap_or("unknown stage"))]
    Panicked {
        stage: Option<Stage>,
        message: String,
    },
}

impl JobError {
    /// Stage that raised the error, if known
    pub fn stage(&self) -> Option<Stage> {
        match self {
            JobError::Extract(_) => Some(Stage::Extract),
            JobError::Load(_) => Some(Stage::Load),
            JobError::Cancelled { stage } => Some(*stage),
            JobError::Panicked { stage, .. } => *stage,
        }
    }

    /// Records committed before the failure
    pub fn inserted(&self) -> usize {
        match self {
            JobError::Load(err) => err.inserted_so_far(),
            _ => 0,
        }
    }

    pub(crate) fn panicked(stage: Option<Stage>, payload: &(dyn Any + Send)) -> Self {
        JobError::Panicked {
            stage,
            message: panic_message(payload),
        }
    }
}

/// Text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

/// Terminal status of a job
#[derive(Debug)]
pub enum JobStatus {
    Completed,
    Failed(JobError),
}

impl JobStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, JobStatus::Completed)
    }

    pub fn error(&self) -> Option<&JobError> {
        match self {
            JobStatus::Completed => None,
            JobStatus::Failed(err) => Some(err),
        }
    }
}

/// Outcome of one job
#[derive(Debug)]
pub struct JobReport {
    pub source: PathBuf,
    pub extracted: usize,
    pub inserted: usize,
    pub elapsed: Duration,
    pub status: JobStatus,
}

impl JobReport {
    pub fn succeeded(&self) -> bool {
        self.status.is_completed()
    }

    pub(crate) fn failed(source: PathBuf, error: JobError, elapsed: Duration) -> Self {
        Self {
            source,
            extracted: 0,
            inserted: error.inserted(),
            elapsed,
            status: JobStatus::Failed(error),
        }
    }
}

/// Everything a job shares with its siblings
#[derive(Debug, Clone)]
pub struct JobContext {
    pub sink: Arc<dyn DocumentSink>,
    pub reader: CsvReader,
    pub duplicate_columns: DuplicateColumns,
    pub load: LoadSettings,
    pub reporter: Reporter,
    pub cancel: CancellationToken,
}

/// The pipeline for a single source file
#[derive(Debug)]
pub struct Job {
    source: PathBuf,
    label: String,
    state: JobState,
    extracted: usize,
    ctx: JobContext,
}

impl Job {
    pub fn new(source: impl Into<PathBuf>, ctx: JobContext) -> Self {
        let source = source.into();
        Self {
            label: source.display().to_string(),
            source,
            state: JobState::Pending,
            extracted: 0,
            ctx,
        }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    fn transition(&mut self, next: JobState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal job transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!(
            source = %self.label,
            from = self.state.as_str(),
            to = next.as_str(),
            "Job state change"
        );
        self.state = next;
    }

    fn ensure_running(&self, stage: Stage) -> Result<(), JobError> {
        if self.ctx.cancel.is_cancelled() {
            return Err(JobError::Cancelled { stage });
        }
        Ok(())
    }

    /// Run to completion. Never returns an error; failures land in the report.
    #[instrument(name = "job", skip(self), fields(source = %self.label))]
    pub async fn run(mut self) -> JobReport {
        let started = Instant::now();
        let result = self.execute().await;
        let elapsed = started.elapsed();

        match result {
            Ok(inserted) => {
                self.transition(JobState::Completed);
                self.ctx.reporter.emit(RunEvent::JobCompleted {
                    source: self.label.clone(),
                    inserted,
                    elapsed,
                });
                JobReport {
                    source: self.source,
                    extracted: self.extracted,
                    inserted,
                    elapsed,
                    status: JobStatus::Completed,
                }
            },
            Err(err) => {
                self.transition(JobState::Failed);
                self.ctx.reporter.emit(RunEvent::JobFailed {
                    source: self.label.clone(),
                    stage: err.stage(),
                    error: err.to_string(),
                    inserted: err.inserted(),
                });
                JobReport {
                    extracted: self.extracted,
                    ..JobReport::failed(self.source, err, elapsed)
                }
            },
        }
    }

    async fn execute(&mut self) -> Result<usize, JobError> {
        self.ensure_running(Stage::Extract)?;
        self.transition(JobState::Extracting);
        let records = self.extract().await?;
        self.extracted = records.len();
        self.ctx.reporter.emit(RunEvent::Extracted {
            source: self.label.clone(),
            records: records.len(),
        });

        self.ensure_running(Stage::Transform)?;
        self.transition(JobState::Transforming);
        let records = self.transform(records).await?;
        self.ctx.reporter.emit(RunEvent::Transformed {
            source: self.label.clone(),
        });

        self.transition(JobState::Loading);
        let loader = BatchLoader::new(
            Arc::clone(&self.ctx.sink),
            self.ctx.load,
            self.ctx.reporter.clone(),
            self.ctx.cancel.clone(),
        );
        let outcome = loader.load(&self.label, &records).await?;

        Ok(outcome.inserted)
    }

    async fn extract(&self) -> Result<Vec<Record>, JobError> {
        let reader = self.ctx.reader.clone();
        let path = self.source.clone();

        tokio::task::spawn_blocking(move || reader.read(&path))
            .await
            .map_err(|join| blocking_failure(Stage::Extract, join))?
            .map_err(JobError::from)
    }

    async fn transform(&self, records: Vec<Record>) -> Result<Vec<Record>, JobError> {
        let policy = self.ctx.duplicate_columns;

        tokio::task::spawn_blocking(move || Normalizer::new(policy).normalize(records))
            .await
            .map_err(|join| blocking_failure(Stage::Transform, join))
    }
}

fn blocking_failure(stage: Stage, join: tokio::task::JoinError) -> JobError {
    match join.try_into_panic() {
        Ok(payload) => JobError::panicked(Some(stage), payload.as_ref()),
        Err(join) => JobError::Panicked {
            stage: Some(stage),
            message: join.to_string(),
        },
    }
}
