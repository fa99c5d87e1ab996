//! Error types for tabload
//!
//! Every failure a run can hit is one of these. Connection and config errors
//! abort the whole run; source and load errors only fail the job that
//! raised them.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failure to reach or authenticate against the sink
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Timed out after {after:?} waiting for {target} to answer a ping")]
    Timeout { target: String, after: Duration },

    #[error("Connection to {target} refused: {reason}")]
    Refused { target: String, reason: String },

    #[error("Authentication against {target} failed: {reason}")]
    Unauthorized { target: String, reason: String },

    #[error("Invalid connection string: {0}")]
    InvalidUri(String),
}

/// Failure to read a source file
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Source file not found: '{}'", path.display())]
    NotFound { path: PathBuf },

    #[error("Failed to parse '{}'{}: {reason}", path.display(), line.map(|l| format!(" at line {}", l)).unwrap_or_default())]
    Parse {
        path: PathBuf,
        line: Option<u64>,
        reason: String,
    },

    #[error("Failed to read '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SourceError {
    pub fn parse(path: impl Into<PathBuf>, line: Option<u64>, reason: impl Into<String>) -> Self {
        Self::Parse {
            path: path.into(),
            line,
            reason: reason.into(),
        }
    }
}

/// Failure of a single bulk insert call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("Insert rejected by sink: {0}")]
    Write(String),

    #[error("Sink acknowledged {inserted} of {expected} records")]
    PartialWrite { expected: usize, inserted: usize },

    #[error("Insert did not complete within {0:?}")]
    Timeout(Duration),

    #[error("Sink panicked during insert: {0}")]
    Panicked(String),
}

/// Failure while loading a job's batches. Batch indices are 1-based.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error("Batch {batch_index} failed after {inserted_so_far} records were inserted: {source}")]
    SinkWriteFailed {
        batch_index: usize,
        inserted_so_far: usize,
        #[source]
        source: SinkError,
    },

    #[error("Cancelled before batch {batch_index}; {inserted_so_far} records were inserted")]
    Cancelled {
        batch_index: usize,
        inserted_so_far: usize,
    },
}

impl LoadError {
    /// Records committed by fully-acknowledged batches before the failure
    pub fn inserted_so_far(&self) -> usize {
        match self {
            LoadError::SinkWriteFailed {
                inserted_so_far, ..
            }
            | LoadError::Cancelled {
                inserted_so_far, ..
            } => *inserted_so_far,
        }
    }

    pub fn batch_index(&self) -> usize {
        match self {
            LoadError::SinkWriteFailed { batch_index, .. }
            | LoadError::Cancelled { batch_index, .. } => *batch_index,
        }
    }
}

/// Configuration is missing or invalid
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing configuration value '{key}'. Set it in the config file or as an environment variable.")]
    Missing { key: String },

    #[error("Invalid value for '{key}': {reason}")]
    Invalid { key: String, reason: String },

    #[error("Failed to load configuration: {0}")]
    Load(String),
}

impl ConfigError {
    pub fn missing(key: impl Into<String>) -> Self {
        Self::Missing { key: key.into() }
    }

    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Strip credentials from a connection string before it is logged
pub fn redact_uri(uri: &str) -> String {
    let Some(scheme_end) = uri.find("://") else {
        return uri.to_string();
    };
    let rest = &uri[scheme_end + 3..];
    let authority_end = rest.find('/').unwrap_or(rest.len());

    match rest[..authority_end].rfind('@') {
        Some(at) => format!("{}://***@{}", &uri[..scheme_end], &rest[at + 1..]),
        None => uri.to_string(),
    }
}
