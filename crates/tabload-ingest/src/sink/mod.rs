//! Sink abstraction
//!
//! The pipeline only needs two capabilities from the target store: open one
//! health-checked connection per run, and bulk-insert an ordered batch of
//! records. Implementations must be safe to share across concurrent jobs
//! without external locking.

use async_trait::async_trait;
use std::sync::Arc;
use tabload_common::{ConnectionError, Record, SinkError};

pub mod memory;
pub mod mongo;

pub use memory::{MemoryConnector, MemorySink};
pub use mongo::{connect, MongoConnector, MongoSink, SinkConnection};

/// A collection handle accepting bulk inserts
#[async_trait]
pub trait DocumentSink: Send + Sync {
    /// Human-readable target, e.g. `etl_db.etl_collection`
    fn namespace(&self) -> String;

    /// Insert the whole batch, returning how many records the store acknowledged
    async fn insert_many(&self, batch: &[Record]) -> Result<usize, SinkError>;
}

impl std::fmt::Debug for dyn DocumentSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentSink")
            .field("namespace", &self.namespace())
            .finish()
    }
}

/// Opens the single shared sink handle for a run
#[async_trait]
pub trait SinkConnector: Send + Sync {
    /// Redacted description of where the connector points
    fn target(&self) -> String;

    /// Connect, verify liveness and derive the collection handle
    async fn open(&self) -> Result<Arc<dyn DocumentSink>, ConnectionError>;
}
