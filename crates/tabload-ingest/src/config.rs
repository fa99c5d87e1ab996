//! Pipeline configuration
//!
//! Layered, lowest precedence first:
//! 1. built-in defaults
//! 2. an INI file with `[etl]` and `[database]` sections (`config.ini` by default)
//! 3. `TABLOAD_`-prefixed environment variables, `__` separating section and
//!    key (`TABLOAD_ETL__BATCH_SIZE=500`)
//!
//! Command-line flags are applied on top by the binary before [`PipelineConfig::validate`].

use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tabload_common::ConfigError;

use crate::loader::{LoadSettings, DEFAULT_BATCH_SIZE};
use crate::normalize::DuplicateColumns;
use crate::source::ReaderOptions;

/// File read when no `--config` is given; skipped if absent
pub const DEFAULT_CONFIG_FILE: &str = "config.ini";
/// Environment variable prefix
pub const ENV_PREFIX: &str = "TABLOAD";

pub const DEFAULT_MONGO_URI: &str = "mongodb://localhost:27017/";
pub const DEFAULT_DB_NAME: &str = "etl_db";
pub const DEFAULT_COLLECTION: &str = "etl_collection";
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;
/// Longest accepted `connect_timeout_secs`
pub const MAX_CONNECT_TIMEOUT_SECS: u64 = 3600;

/// Untyped view of the layered sources; every value arrives as text
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawConfig {
    etl: RawEtl,
    database: RawDatabase,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawEtl {
    csv_file: Option<String>,
    csv_files: Option<String>,
    batch_size: Option<String>,
    max_concurrency: Option<String>,
    delimiter: Option<String>,
    infer_types: Option<String>,
    duplicate_columns: Option<String>,
    batch_timeout_secs: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawDatabase {
    mongo_uri: Option<String>,
    db_name: Option<String>,
    collection_name: Option<String>,
    optimized_collection: Option<String>,
    connect_timeout_secs: Option<String>,
}

/// Where and how to connect to the document store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkConfig {
    pub mongo_uri: String,
    pub db_name: String,
    pub collection_name: String,
    pub connect_timeout: Duration,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            mongo_uri: DEFAULT_MONGO_URI.to_string(),
            db_name: DEFAULT_DB_NAME.to_string(),
            collection_name: DEFAULT_COLLECTION.to_string(),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }
}

impl SinkConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mongo_uri.trim().is_empty() {
            return Err(ConfigError::missing("database.mongo_uri"));
        }
        if !(self.mongo_uri.starts_with("mongodb://") || self.mongo_uri.starts_with("mongodb+srv://")) {
            return Err(ConfigError::invalid(
                "database.mongo_uri",
                "must start with mongodb:// or mongodb+srv://",
            ));
        }
        if self.db_name.trim().is_empty() {
            return Err(ConfigError::missing("database.db_name"));
        }
        if self.collection_name.trim().is_empty() {
            return Err(ConfigError::missing("database.collection_name"));
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "database.connect_timeout_secs",
                "must be greater than 0",
            ));
        }
        if self.connect_timeout > Duration::from_secs(MAX_CONNECT_TIMEOUT_SECS) {
            return Err(ConfigError::invalid(
                "database.connect_timeout_secs",
                format!("must be at most {}", MAX_CONNECT_TIMEOUT_SECS),
            ));
        }
        Ok(())
    }
}

/// Typed configuration for one run
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub sources: Vec<PathBuf>,
    pub batch_size: usize,
    pub max_concurrency: usize,
    pub delimiter: u8,
    pub infer_types: bool,
    pub duplicate_columns: DuplicateColumns,
    pub batch_timeout: Option<Duration>,
    pub sink: SinkConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            delimiter: b',',
            infer_types: true,
            duplicate_columns: DuplicateColumns::default(),
            batch_timeout: None,
            sink: SinkConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load from `path` (required) or from `config.ini` in the working
    /// directory (optional), then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => File::from(path).format(FileFormat::Ini).required(true),
            None => File::new(DEFAULT_CONFIG_FILE, FileFormat::Ini).required(false),
        };

        let settings = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .map_err(|e| ConfigError::Load(e.to_string()))?;

        Self::from_settings(settings)
    }

    /// Parse INI text without consulting the environment
    pub fn from_ini_str(text: &str) -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .add_source(File::from_str(text, FileFormat::Ini))
            .build()
            .map_err(|e| ConfigError::Load(e.to_string()))?;

        Self::from_settings(settings)
    }

    fn from_settings(settings: Config) -> Result<Self, ConfigError> {
        let raw: RawConfig = settings
            .try_deserialize()
            .map_err(|e| ConfigError::Load(e.to_string()))?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let etl = raw.etl;
        let db = raw.database;

        // The list form wins when both are present
        let sources = etl
            .csv_files
            .or(etl.csv_file)
            .map(|list| split_paths(&list))
            .unwrap_or_default();

        let batch_timeout = parse_or("etl.batch_timeout_secs", etl.batch_timeout_secs, 0u64)?;
        let connect_timeout = parse_or(
            "database.connect_timeout_secs",
            db.connect_timeout_secs,
            DEFAULT_CONNECT_TIMEOUT_SECS,
        )?;

        Ok(Self {
            sources,
            batch_size: parse_or("etl.batch_size", etl.batch_size, defaults.batch_size)?,
            max_concurrency: parse_or(
                "etl.max_concurrency",
                etl.max_concurrency,
                defaults.max_concurrency,
            )?,
            delimiter: match etl.delimiter {
                Some(value) => parse_delimiter(&value)?,
                None => defaults.delimiter,
            },
            infer_types: match etl.infer_types {
                Some(value) => parse_bool("etl.infer_types", &value)?,
                None => defaults.infer_types,
            },
            duplicate_columns: match etl.duplicate_columns {
                Some(value) => value
                    .parse()
                    .map_err(|reason: String| ConfigError::invalid("etl.duplicate_columns", reason))?,
                None => defaults.duplicate_columns,
            },
            batch_timeout: (batch_timeout > 0).then(|| Duration::from_secs(batch_timeout)),
            sink: SinkConfig {
                mongo_uri: non_empty(db.mongo_uri).unwrap_or(defaults.sink.mongo_uri),
                db_name: non_empty(db.db_name).unwrap_or(defaults.sink.db_name),
                collection_name: non_empty(db.collection_name)
                    .or_else(|| non_empty(db.optimized_collection))
                    .unwrap_or(defaults.sink.collection_name),
                connect_timeout: Duration::from_secs(connect_timeout),
            },
        })
    }

    /// Check everything a `run` needs
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sources.is_empty() {
            return Err(ConfigError::missing("etl.csv_file"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::invalid("etl.batch_size", "must be greater than 0"));
        }
        if self.max_concurrency == 0 {
            return Err(ConfigError::invalid("etl.max_concurrency", "must be greater than 0"));
        }
        self.sink.validate()
    }

    /// Workers actually started: never more than there are sources
    pub fn worker_count(&self) -> usize {
        self.max_concurrency.min(self.sources.len()).max(1)
    }

    pub fn reader_options(&self) -> ReaderOptions {
        ReaderOptions {
            delimiter: self.delimiter,
            infer_types: self.infer_types,
            ..ReaderOptions::default()
        }
    }

    pub fn load_settings(&self) -> LoadSettings {
        LoadSettings::new(self.batch_size).with_batch_timeout(self.batch_timeout)
    }
}

fn split_paths(list: &str) -> Vec<PathBuf> {
    list.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .collect()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_or<T>(key: &str, value: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match non_empty(value) {
        Some(value) => value
            .parse()
            .map_err(|e: T::Err| ConfigError::invalid(key, format!("'{}': {}", value, e))),
        None => Ok(default),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        other => Err(ConfigError::invalid(key, format!("'{}' is not a boolean", other))),
    }
}

fn parse_delimiter(value: &str) -> Result<u8, ConfigError> {
    match value {
        "\\t" | "tab" | "\t" => Ok(b'\t'),
        _ => match value.as_bytes() {
            [byte] if byte.is_ascii() => Ok(*byte),
            _ => Err(ConfigError::invalid(
                "etl.delimiter",
                format!("'{}' must be a single ASCII character", value),
            )),
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_when_sections_missing() {
        let config = PipelineConfig::from_ini_str("").unwrap();

        assert!(config.sources.is_empty());
        assert_eq!(config.batch_size, 1000);
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.sink.mongo_uri, "mongodb://localhost:27017/");
        assert_eq!(config.sink.db_name, "etl_db");
        assert_eq!(config.sink.collection_name, "etl_collection");
        assert_eq!(config.sink.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.batch_timeout, None);
    }

    #[test]
    fn test_reads_both_sections() {
        let config = PipelineConfig::from_ini_str(
            "[etl]\ncsv_files = data/a.csv, data/b.csv ,\nbatch_size = 250\nmax_concurrency = 2\n\
             delimiter = |\nduplicate_columns = suffix\nbatch_timeout_secs = 30\n\n\
             [database]\nmongo_uri = mongodb://db:27017/\ndb_name = sales\noptimized_collection = orders_opt\n",
        )
        .unwrap();

        assert_eq!(
            config.sources,
            vec![PathBuf::from("data/a.csv"), PathBuf::from("data/b.csv")]
        );
        assert_eq!(config.batch_size, 250);
        assert_eq!(config.max_concurrency, 2);
        assert_eq!(config.delimiter, b'|');
        assert_eq!(config.duplicate_columns, DuplicateColumns::Suffix);
        assert_eq!(config.batch_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.sink.db_name, "sales");
        assert_eq!(config.sink.collection_name, "orders_opt");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_csv_files_wins_over_csv_file() {
        let config =
            PipelineConfig::from_ini_str("[etl]\ncsv_file = one.csv\ncsv_files = two.csv,three.csv\n")
                .unwrap();
        assert_eq!(config.sources.len(), 2);
    }

    #[test]
    fn test_collection_name_wins_over_alias() {
        let config = PipelineConfig::from_ini_str(
            "[database]\ncollection_name = main\noptimized_collection = alt\n",
        )
        .unwrap();
        assert_eq!(config.sink.collection_name, "main");
    }

    #[test]
    fn test_invalid_values_name_the_key() {
        let err = PipelineConfig::from_ini_str("[etl]\nbatch_size = lots\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "etl.batch_size"));

        let err = PipelineConfig::from_ini_str("[etl]\ndelimiter = ::\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "etl.delimiter"));
    }

    #[test]
    fn test_validate() {
        let mut config = PipelineConfig::default();
        assert!(matches!(config.validate(), Err(ConfigError::Missing { .. })));

        config.sources = vec![PathBuf::from("a.csv")];
        assert!(config.validate().is_ok());

        config.batch_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));

        config.batch_size = 10;
        config.sink.mongo_uri = "http://localhost".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_connect_timeout_is_bounded() {
        let mut sink = SinkConfig::default();
        sink.connect_timeout = Duration::from_secs(u64::MAX);
        assert!(matches!(sink.validate(), Err(ConfigError::Invalid { key, .. }) if key == "database.connect_timeout_secs"));

        sink.connect_timeout = Duration::from_secs(MAX_CONNECT_TIMEOUT_SECS);
        assert!(sink.validate().is_ok());
    }

    #[test]
    fn test_worker_count_is_bounded_by_sources() {
        let config = PipelineConfig {
            sources: vec![PathBuf::from("a.csv"), PathBuf::from("b.csv")],
            max_concurrency: 8,
            ..Default::default()
        };
        assert_eq!(config.worker_count(), 2);
    }

    #[test]
    fn test_environment_overrides_file() {
        let mut file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
        writeln!(file, "[etl]\ncsv_file = a.csv\nbatch_timeout_secs = 10").unwrap();

        std::env::set_var("TABLOAD_ETL__BATCH_TIMEOUT_SECS", "42");
        let config = PipelineConfig::load(Some(file.path()));
        std::env::remove_var("TABLOAD_ETL__BATCH_TIMEOUT_SECS");

        assert_eq!(config.unwrap().batch_timeout, Some(Duration::from_secs(42)));
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        let err = PipelineConfig::load(Some(Path::new("/no/such/tabload.ini"))).unwrap_err();
        assert!(matches!(err, ConfigError::Load(_)));
    }
}
