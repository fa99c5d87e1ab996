//! Tabload Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, error handling and logging for the tabload workspace.
//!
//! # Overview
//!
//! - **Types**: [`Record`] and [`Value`], the row model every pipeline stage speaks
//! - **Error Handling**: the connection, source, sink, load and config error taxonomy
//! - **Logging**: tracing subscriber setup driven by [`logging::LogConfig`]
//!
//! # Example
//!
//! ```
//! use tabload_common::{Record, Value};
//!
//! let mut record = Record::new();
//! record.insert("order_id", 42i64);
//! record.insert("note", Value::Null);
//! assert_eq!(record.to_json().unwrap(), r#"{"order_id":42,"note":null}"#);
//! ```

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{redact_uri, ConfigError, ConnectionError, LoadError, SinkError, SourceError};
pub use types::{Record, Value};
