//! End-to-end pipeline tests against the in-memory sink
//!
//! These tests verify:
//! - Batch partitioning and running totals across a whole run
//! - Abort-before-dispatch on connection failure
//! - Job isolation and partial-load visibility
//! - Column-name and null normalization as stored in the sink
//! - The worker pool bound and run-level cancellation

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tabload_common::{ConnectionError, LoadError, SinkError, SourceError, Value};
use tabload_ingest::config::PipelineConfig;
use tabload_ingest::job::{Job, JobContext, JobError, JobStatus, Stage};
use tabload_ingest::loader::LoadSettings;
use tabload_ingest::normalize::DuplicateColumns;
use tabload_ingest::orchestrator::{Orchestrator, RunError, RunState};
use tabload_ingest::report::{EventLog, Reporter, RunEvent};
use tabload_ingest::sink::{MemoryConnector, MemorySink};
use tabload_ingest::source::{CsvReader, ReaderOptions};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Write `rows` data rows of `id,src,amount` to `dir/name`
fn write_source(dir: &TempDir, name: &str, rows: usize) -> PathBuf {
    let path = dir.path().join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "id,src,amount").unwrap();
    for i in 1..=rows {
        writeln!(file, "{},{},{}.5", i, name, i).unwrap();
    }
    path
}

fn write_raw(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

fn config(sources: Vec<PathBuf>, batch_size: usize, max_concurrency: usize) -> PipelineConfig {
    PipelineConfig {
        sources,
        batch_size,
        max_concurrency,
        ..Default::default()
    }
}

fn source_name(path: &Path) -> String {
    path.display().to_string()
}

#[tokio::test]
async fn test_scenario_a_batches_of_a_large_file() {
    let dir = tempfile::tempdir().unwrap();
    let orders = write_source(&dir, "orders.csv", 2500);
    let sink = Arc::new(MemorySink::new());
    let log = Arc::new(EventLog::new());

    let summary = Orchestrator::new(
        config(vec![orders.clone()], 1000, 4),
        Arc::new(MemoryConnector::new(sink.clone())),
        log.clone(),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(summary.total_inserted, 2500);
    assert_eq!(sink.batch_sizes(), vec![1000, 1000, 500]);
    assert_eq!(
        log.batches_for(&source_name(&orders)),
        vec![(1, 1000, 1000), (2, 1000, 2000), (3, 500, 2500)]
    );
}

#[tokio::test]
async fn test_scenario_b_connection_timeout_aborts_run() {
    let dir = tempfile::tempdir().unwrap();
    let orders = write_source(&dir, "orders.csv", 10);
    let log = Arc::new(EventLog::new());

    let mut orchestrator = Orchestrator::new(
        config(vec![orders], 5, 4),
        Arc::new(MemoryConnector::failing(ConnectionError::Timeout {
            target: "mongodb://db:27017/".into(),
            after: Duration::from_secs(5),
        })),
        log.clone(),
    );
    let result = orchestrator.run().await;

    assert!(matches!(
        result,
        Err(RunError::Connection(ConnectionError::Timeout { .. }))
    ));
    assert_eq!(orchestrator.state(), RunState::Aborted);
    assert_eq!(log.count("batch_inserted"), 0);
    assert_eq!(log.count("extracted"), 0);
    assert_eq!(log.count("run_aborted"), 1);
}

#[tokio::test]
async fn test_scenario_c_malformed_source_does_not_stop_sibling() {
    let dir = tempfile::tempdir().unwrap();
    let broken = write_raw(&dir, "broken.csv", "id,name\n1,ok\n2,too,many,fields\n");
    let good = write_source(&dir, "good.csv", 50);
    let sink = Arc::new(MemorySink::new());

    let summary = Orchestrator::new(
        config(vec![broken, good], 20, 2),
        Arc::new(MemoryConnector::new(sink.clone())),
        Arc::new(EventLog::new()),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(summary.succeeded(), 1);
    assert_eq!(summary.failed(), 1);
    assert_eq!(summary.total_inserted, 50);

    let broken_report = &summary.jobs[0];
    assert_eq!(broken_report.inserted, 0);
    assert!(matches!(
        broken_report.status,
        JobStatus::Failed(JobError::Extract(SourceError::Parse { .. }))
    ));

    let good_report = &summary.jobs[1];
    assert!(good_report.succeeded());
    assert_eq!(good_report.inserted, 50);
    assert_eq!(sink.inserted(), 50);
}

#[tokio::test]
async fn test_scenario_d_normalized_names_and_nulls_reach_the_sink() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_raw(&dir, "notes.csv", " Order  ID ,Note,Comment\n7,NA,\n");
    let sink = Arc::new(MemorySink::new());

    // Only NA counts as missing, so the empty cell stays an empty string
    let reader = CsvReader::new(ReaderOptions {
        missing_markers: vec!["NA".to_string()],
        ..Default::default()
    });
    let ctx = JobContext {
        sink: sink.clone(),
        reader,
        duplicate_columns: DuplicateColumns::LastWins,
        load: LoadSettings::new(100),
        reporter: Reporter::new(Arc::new(EventLog::new())),
        cancel: CancellationToken::new(),
    };

    let report = Job::new(&path, ctx).run().await;
    assert!(report.succeeded());

    let records = sink.records();
    let record = &records[0];
    assert_eq!(
        record.fields().collect::<Vec<_>>(),
        vec!["order_id", "note", "comment"]
    );
    assert_eq!(record.get("order_id"), Some(&Value::Int(7)));
    assert_eq!(record.get("note"), Some(&Value::Null));
    assert_eq!(record.get("comment"), Some(&Value::from("")));
    assert_ne!(record.get("note"), record.get("comment"));
}

#[tokio::test]
async fn test_isolation_and_partial_load_visibility() {
    let dir = tempfile::tempdir().unwrap();
    let failing = write_source(&dir, "failing.csv", 100);
    let healthy = write_source(&dir, "healthy.csv", 95);

    // Fail the 4th batch of failing.csv (ids 31..=40)
    let sink = Arc::new(MemorySink::new().fail_when(|batch| {
        let first = &batch[0];
        let from_failing = first.get("src") == Some(&Value::from("failing.csv"));
        (from_failing && first.get("id") == Some(&Value::Int(31)))
            .then(|| SinkError::Write("E11000 duplicate key error".into()))
    }));
    let log = Arc::new(EventLog::new());

    let summary = Orchestrator::new(
        config(vec![failing.clone(), healthy.clone()], 10, 2),
        Arc::new(MemoryConnector::new(sink.clone())),
        log.clone(),
    )
    .run()
    .await
    .unwrap();

    let failed = &summary.jobs[0];
    assert_eq!(failed.extracted, 100);
    assert_eq!(failed.inserted, 30);
    match &failed.status {
        JobStatus::Failed(JobError::Load(LoadError::SinkWriteFailed {
            batch_index,
            inserted_so_far,
            ..
        })) => {
            assert_eq!(*batch_index, 4);
            assert_eq!(*inserted_so_far, 30);
        },
        other => panic!("unexpected status {other:?}"),
    }

    let ok = &summary.jobs[1];
    assert!(ok.succeeded());
    assert_eq!(ok.inserted, 95);
    assert_eq!(summary.total_inserted, 125);
    assert_eq!(sink.inserted(), 125);

    let job_failed = log
        .events()
        .into_iter()
        .find(|e| matches!(e, RunEvent::JobFailed { .. }))
        .unwrap();
    match job_failed {
        RunEvent::JobFailed {
            source,
            stage,
            inserted,
            ..
        } => {
            assert_eq!(source, source_name(&failing));
            assert_eq!(stage, Some(Stage::Load));
            assert_eq!(inserted, 30);
        },
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_counts_are_conserved_across_many_sources() {
    let dir = tempfile::tempdir().unwrap();
    let sizes = [0usize, 1, 9, 10, 11, 57];
    let sources: Vec<PathBuf> = sizes
        .iter()
        .enumerate()
        .map(|(i, n)| write_source(&dir, &format!("part-{}.csv", i), *n))
        .collect();
    let sink = Arc::new(MemorySink::new());

    let summary = Orchestrator::new(
        config(sources, 10, 3),
        Arc::new(MemoryConnector::new(sink.clone())),
        Arc::new(EventLog::new()),
    )
    .run()
    .await
    .unwrap();

    assert!(summary.is_success());
    for (report, expected) in summary.jobs.iter().zip(sizes) {
        assert_eq!(report.extracted, expected);
        assert_eq!(report.inserted, expected);
    }
    assert_eq!(summary.total_inserted, sizes.iter().sum::<usize>());
    assert_eq!(sink.records().len(), summary.total_inserted);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_worker_pool_is_bounded() {
    let dir = tempfile::tempdir().unwrap();
    let sources: Vec<PathBuf> = (0..6)
        .map(|i| write_source(&dir, &format!("f{}.csv", i), 30))
        .collect();
    let sink = Arc::new(MemorySink::new().with_latency(Duration::from_millis(15)));

    let summary = Orchestrator::new(
        config(sources, 10, 2),
        Arc::new(MemoryConnector::new(sink.clone())),
        Arc::new(EventLog::new()),
    )
    .run()
    .await
    .unwrap();

    assert!(summary.is_success());
    assert_eq!(summary.total_inserted, 180);
    assert!(sink.peak_in_flight() <= 2, "peak was {}", sink.peak_in_flight());
    assert!(sink.peak_in_flight() >= 1);
}

#[tokio::test]
async fn test_cancelled_run_loads_nothing_and_reports_every_job() {
    let dir = tempfile::tempdir().unwrap();
    let a = write_source(&dir, "a.csv", 5);
    let b = write_source(&dir, "b.csv", 5);
    let sink = Arc::new(MemorySink::new());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let summary = Orchestrator::new(
        config(vec![a, b], 2, 2),
        Arc::new(MemoryConnector::new(sink.clone())),
        Arc::new(EventLog::new()),
    )
    .with_cancellation(cancel)
    .run()
    .await
    .unwrap();

    assert_eq!(summary.failed(), 2);
    assert_eq!(sink.inserted(), 0);
    for report in &summary.jobs {
        assert!(matches!(
            report.status,
            JobStatus::Failed(JobError::Cancelled { .. })
        ));
    }
}
