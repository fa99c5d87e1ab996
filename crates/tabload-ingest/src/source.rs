//! Delimited-text source reader
//!
//! Reads a whole file into memory as [`Record`]s keyed by the raw header
//! names. Cells matching a missing-value marker become [`Value::Missing`];
//! everything else is typed per column when inference is enabled.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use tabload_common::{Record, SourceError, Value};

/// Markers treated as a missing cell, matching the usual dataframe defaults
pub const DEFAULT_MISSING_MARKERS: &[&str] = &[
    "", "#N/A", "#N/A N/A", "#NA", "-1.#IND", "-1.#QNAN", "-NaN", "-nan", "1.#IND", "1.#QNAN",
    "<NA>", "N/A", "NA", "NULL", "NaN", "None", "n/a", "nan", "null",
];

/// Options controlling how a source file is parsed
#[derive(Debug, Clone)]
pub struct ReaderOptions {
    /// Field delimiter byte
    pub delimiter: u8,
    /// Type each column as int, float or bool when every present cell allows it
    pub infer_types: bool,
    /// Cell contents treated as missing
    pub missing_markers: Vec<String>,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            delimiter: b',',
            infer_types: true,
            missing_markers: DEFAULT_MISSING_MARKERS.iter().map(|m| m.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Int,
    Float,
    Bool,
    Text,
}

/// Reads delimited files with a header row
#[derive(Debug, Clone, Default)]
pub struct CsvReader {
    options: ReaderOptions,
}

impl CsvReader {
    pub fn new(options: ReaderOptions) -> Self {
        Self { options }
    }

    /// Read every row of the file at `path`
    pub fn read(&self, path: &Path) -> Result<Vec<Record>, SourceError> {
        let file = File::open(path).map_err(|source| match source.kind() {
            io::ErrorKind::NotFound => SourceError::NotFound {
                path: path.to_path_buf(),
            },
            _ => SourceError::Io {
                path: path.to_path_buf(),
                source,
            },
        })?;

        self.read_from(path, file)
    }

    /// Read rows from any reader; `path` only labels errors
    pub fn read_from<R: Read>(&self, path: &Path, input: R) -> Result<Vec<Record>, SourceError> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.options.delimiter)
            .has_headers(true)
            .flexible(false)
            .from_reader(input);

        let headers = reader
            .headers()
            .map_err(|err| csv_error(path, err))?
            .clone();

        if headers.is_empty() {
            return Err(SourceError::parse(path, Some(1), "no header row"));
        }

        let columns = dedupe_headers(headers.iter());

        let mut rows: Vec<Vec<Option<String>>> = Vec::new();
        for row in reader.records() {
            let row = row.map_err(|err| csv_error(path, err))?;
            rows.push(row.iter().map(|cell| self.cell(cell)).collect());
        }

        let kinds: Vec<ColumnKind> = (0..columns.len())
            .map(|index| {
                if self.options.infer_types {
                    infer_column(rows.iter().filter_map(|row| row[index].as_deref()))
                } else {
                    ColumnKind::Text
                }
            })
            .collect();

        Ok(rows
            .into_iter()
            .map(|row| {
                let mut record = Record::with_capacity(columns.len());
                for ((name, kind), cell) in columns.iter().zip(&kinds).zip(row) {
                    record.push(name.clone(), typed(cell, *kind));
                }
                record
            })
            .collect())
    }

    fn cell(&self, raw: &str) -> Option<String> {
        if self.options.missing_markers.iter().any(|m| m == raw) {
            None
        } else {
            Some(raw.to_string())
        }
    }
}

/// Repeated raw headers get a `.N` suffix so no column is silently dropped.
/// The returned names are unique.
fn dedupe_headers<'a>(headers: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen: HashMap<&str, usize> = HashMap::new();
    let mut taken: HashSet<String> = HashSet::new();
    let mut columns = Vec::new();

    for header in headers {
        let count = seen.entry(header).or_insert(0);
        let mut column = header.to_string();
        while taken.contains(&column) {
            *count += 1;
            column = format!("{}.{}", header, count);
        }
        taken.insert(column.clone());
        columns.push(column);
    }

    columns
}

fn infer_column<'a>(cells: impl Iterator<Item = &'a str>) -> ColumnKind {
    let mut any = false;
    let (mut all_int, mut all_float, mut all_bool) = (true, true, true);

    for cell in cells {
        any = true;
        let trimmed = cell.trim();
        all_int = all_int && trimmed.parse::<i64>().is_ok();
        all_float = all_float && trimmed.parse::<f64>().is_ok_and(f64::is_finite);
        all_bool = all_bool && parse_bool(trimmed).is_some();

        if !(all_int || all_float || all_bool) {
            return ColumnKind::Text;
        }
    }

    match (any, all_int, all_float, all_bool) {
        (false, ..) => ColumnKind::Text,
        (true, true, _, _) => ColumnKind::Int,
        (true, false, true, _) => ColumnKind::Float,
        (true, false, false, true) => ColumnKind::Bool,
        _ => ColumnKind::Text,
    }
}

fn parse_bool(cell: &str) -> Option<bool> {
    if cell.eq_ignore_ascii_case("true") {
        Some(true)
    } else if cell.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

fn typed(cell: Option<String>, kind: ColumnKind) -> Value {
    let Some(cell) = cell else {
        return Value::Missing;
    };

    // Inference already checked every present cell, the fallbacks are unreachable
    match kind {
        ColumnKind::Int => cell.trim().parse().map(Value::Int).unwrap_or(Value::String(cell)),
        ColumnKind::Float => cell.trim().parse().map(Value::Float).unwrap_or(Value::String(cell)),
        ColumnKind::Bool => parse_bool(cell.trim()).map(Value::Bool).unwrap_or(Value::String(cell)),
        ColumnKind::Text => Value::String(cell),
    }
}

fn csv_error(path: &Path, err: csv::Error) -> SourceError {
    let line = err.position().map(|p| p.line());
    let reason = err.to_string();

    match err.into_kind() {
        csv::ErrorKind::Io(source) => SourceError::Io {
            path: path.to_path_buf(),
            source,
        },
        _ => SourceError::parse(path, line, reason),
    }
}
