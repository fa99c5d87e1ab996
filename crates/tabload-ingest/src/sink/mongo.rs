//! MongoDB sink
//!
//! One [`Client`] per run. The driver pools and multiplexes connections, so
//! the derived [`MongoSink`] is shared by every job as-is.

use async_trait::async_trait;
use mongodb::bson::{doc, Bson, Document};
use mongodb::error::{Error as MongoError, ErrorKind};
use mongodb::options::ClientOptions;
use mongodb::{Client, Collection};
use std::sync::Arc;
use std::time::Duration;
use tabload_common::{redact_uri, ConnectionError, Record, SinkError, Value};
use tracing::{debug, info};

use super::{DocumentSink, SinkConnector};

/// Application name reported to the server
const APP_NAME: &str = "tabload";

/// Slack on top of the server-selection timeout before the ping is abandoned
const PING_GRACE: Duration = Duration::from_secs(1);

// Server error codes for failed authentication and missing privileges
const AUTHENTICATION_FAILED: i32 = 18;
const UNAUTHORIZED: i32 = 13;

/// A live, health-checked client
#[derive(Debug, Clone)]
pub struct SinkConnection {
    client: Client,
    target: String,
}

impl SinkConnection {
    /// Derive a collection handle. Namespaces are created lazily on first write.
    pub fn collection(&self, db_name: &str, collection_name: &str) -> MongoSink {
        MongoSink {
            collection: self
                .client
                .database(db_name)
                .collection::<Document>(collection_name),
            namespace: format!("{}.{}", db_name, collection_name),
        }
    }

    /// Redacted connection string this client was built from
    pub fn target(&self) -> &str {
        &self.target
    }
}

/// Connect to `uri` and run a `ping` against `admin` within `timeout`
pub async fn connect(uri: &str, timeout: Duration) -> Result<SinkConnection, ConnectionError> {
    let target = redact_uri(uri);

    let mut options = ClientOptions::parse(uri)
        .await
        .map_err(|err| classify(&target, timeout, err))?;
    options.server_selection_timeout = Some(timeout);
    options.connect_timeout = Some(timeout);
    options.app_name.get_or_insert_with(|| APP_NAME.to_string());

    let client = Client::with_options(options).map_err(|err| classify(&target, timeout, err))?;

    debug!(target = %target, timeout = ?timeout, "Pinging sink");
    let ping = async { client.database("admin").run_command(doc! { "ping": 1 }).await };

    match tokio::time::timeout(timeout.saturating_add(PING_GRACE), ping).await {
        Err(_) => Err(ConnectionError::Timeout {
            target,
            after: timeout,
        }),
        Ok(Err(err)) => Err(classify(&target, timeout, err)),
        Ok(Ok(_)) => {
            info!(target = %target, "Connected to MongoDB");
            Ok(SinkConnection { client, target })
        },
    }
}

fn classify(target: &str, timeout: Duration, err: MongoError) -> ConnectionError {
    let refused = |reason: String| ConnectionError::Refused {
        target: target.to_string(),
        reason,
    };
    let unauthorized = |reason: String| ConnectionError::Unauthorized {
        target: target.to_string(),
        reason,
    };

    match err.kind.as_ref() {
        ErrorKind::InvalidArgument { message, .. } => ConnectionError::InvalidUri(message.clone()),
        ErrorKind::Authentication { message, .. } => unauthorized(message.clone()),
        ErrorKind::Command(command)
            if command.code == AUTHENTICATION_FAILED || command.code == UNAUTHORIZED =>
        {
            unauthorized(command.message.clone())
        },
        ErrorKind::ServerSelection { message, .. } => classify_selection(target, timeout, message),
        ErrorKind::Io(io) if io.kind() == std::io::ErrorKind::TimedOut => ConnectionError::Timeout {
            target: target.to_string(),
            after: timeout,
        },
        _ => refused(err.to_string()),
    }
}

/// Server selection gave up; the driver only leaves its reason in the message
fn classify_selection(target: &str, timeout: Duration, message: &str) -> ConnectionError {
    let lowered = message.to_lowercase();
    if lowered.contains("authentication") || lowered.contains("auth error") {
        ConnectionError::Unauthorized {
            target: target.to_string(),
            reason: message.to_string(),
        }
    } else if lowered.contains("refused") {
        ConnectionError::Refused {
            target: target.to_string(),
            reason: message.to_string(),
        }
    } else {
        ConnectionError::Timeout {
            target: target.to_string(),
            after: timeout,
        }
    }
}

/// Collection handle backed by the MongoDB driver
#[derive(Debug, Clone)]
pub struct MongoSink {
    collection: Collection<Document>,
    namespace: String,
}

#[async_trait]
impl DocumentSink for MongoSink {
    fn namespace(&self) -> String {
        self.namespace.clone()
    }

    async fn insert_many(&self, batch: &[Record]) -> Result<usize, SinkError> {
        // The server rejects an empty insert
        if batch.is_empty() {
            return Ok(0);
        }

        let documents: Vec<Document> = batch.iter().map(to_document).collect();
        let result = self
            .collection
            .insert_many(documents)
            .await
            .map_err(|err| SinkError::Write(err.to_string()))?;

        Ok(result.inserted_ids.len())
    }
}

/// Convert a normalized record into a BSON document, keeping field order
pub fn to_document(record: &Record) -> Document {
    let mut document = Document::new();
    for (field, value) in record.iter() {
        document.insert(field, to_bson(value));
    }
    document
}

fn to_bson(value: &Value) -> Bson {
    match value {
        Value::Null | Value::Missing => Bson::Null,
        Value::Bool(v) => Bson::Boolean(*v),
        Value::Int(v) => Bson::Int64(*v),
        Value::Float(v) => Bson::Double(*v),
        Value::String(v) => Bson::String(v.clone()),
    }
}

/// Connector that opens a [`MongoSink`] for one database and collection
#[derive(Debug, Clone)]
pub struct MongoConnector {
    uri: String,
    connect_timeout: Duration,
    db_name: String,
    collection_name: String,
}

impl MongoConnector {
    pub fn new(
        uri: impl Into<String>,
        connect_timeout: Duration,
        db_name: impl Into<String>,
        collection_name: impl Into<String>,
    ) -> Self {
        Self {
            uri: uri.into(),
            connect_timeout,
            db_name: db_name.into(),
            collection_name: collection_name.into(),
        }
    }
}

#[async_trait]
impl SinkConnector for MongoConnector {
    fn target(&self) -> String {
        format!(
            "{} ({}.{})",
            redact_uri(&self.uri),
            self.db_name,
            self.collection_name
        )
    }

    async fn open(&self) -> Result<Arc<dyn DocumentSink>, ConnectionError> {
        let connection = connect(&self.uri, self.connect_timeout).await?;
        Ok(Arc::new(connection.collection(&self.db_name, &self.collection_name)))
    }
}
