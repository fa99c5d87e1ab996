//! Tabload Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Batched, concurrent loading of delimited text files into a document store.
//!
//! # Pipeline
//!
//! Each source file becomes one [`job::Job`]: read ([`source`]), normalize
//! column names and nulls ([`normalize`]), then insert in fixed-size batches
//! ([`loader`]). The [`orchestrator::Orchestrator`] opens a single sink
//! connection, runs jobs on a bounded pool and aggregates a
//! [`orchestrator::RunSummary`]. One job failing never stops the others.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tabload_ingest::config::PipelineConfig;
//! use tabload_ingest::report::TracingReporter;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = PipelineConfig::load(None)?;
//!     let summary = tabload_ingest::run(config, Arc::new(TracingReporter)).await?;
//!     println!("inserted {} records", summary.total_inserted);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod job;
pub mod loader;
pub mod normalize;
pub mod orchestrator;
pub mod progress;
pub mod report;
pub mod sink;
pub mod source;

pub use config::PipelineConfig;
pub use job::{JobError, JobReport, JobStatus, Stage};
pub use orchestrator::{Orchestrator, RunError, RunSummary};
pub use report::{RunEvent, RunObserver};

use std::sync::Arc;

/// Run the pipeline described by `config` against MongoDB
pub async fn run(
    config: PipelineConfig,
    observer: Arc<dyn RunObserver>,
) -> Result<RunSummary, RunError> {
    let connector = sink::MongoConnector::new(
        config.sink.mongo_uri.clone(),
        config.sink.connect_timeout,
        config.sink.db_name.clone(),
        config.sink.collection_name.clone(),
    );
    Orchestrator::new(config, Arc::new(connector), observer).run().await
}
