//! Column-name and null normalization
//!
//! Column names are trimmed, lowercased and have each run of internal
//! whitespace replaced by a single underscore (`" Order  ID "` becomes
//! `order_id`). Missing cells become the explicit [`Value::Null`] sentinel.
//! Both rewrites are idempotent.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tabload_common::{Record, Value};

/// What to do when two columns normalize to the same name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateColumns {
    /// Keep the first column's position and the last column's value
    #[default]
    LastWins,
    /// Rename later columns to `name_2`, `name_3`, ...
    Suffix,
}

impl std::str::FromStr for DuplicateColumns {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "last_wins" | "last-wins" | "last" => Ok(DuplicateColumns::LastWins),
            "suffix" => Ok(DuplicateColumns::Suffix),
            other => Err(format!("expected 'last_wins' or 'suffix', got '{}'", other)),
        }
    }
}

impl std::fmt::Display for DuplicateColumns {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DuplicateColumns::LastWins => f.write_str("last_wins"),
            DuplicateColumns::Suffix => f.write_str("suffix"),
        }
    }
}

/// Normalize a single column name
pub fn normalize_column_name(name: &str) -> String {
    name.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("_")
}

/// Where each raw column of one header lands in the normalized record
#[derive(Debug)]
struct Layout {
    raw: Vec<String>,
    fields: Vec<String>,
    slots: Vec<usize>,
}

impl Layout {
    fn new<'a>(raw: impl Iterator<Item = &'a str>, policy: DuplicateColumns) -> Self {
        let raw: Vec<String> = raw.map(str::to_string).collect();
        let mut fields: Vec<String> = Vec::with_capacity(raw.len());
        let mut slots = Vec::with_capacity(raw.len());
        let mut taken: HashMap<String, usize> = HashMap::with_capacity(raw.len());

        for name in &raw {
            let field = normalize_column_name(name);
            let slot = match (policy, taken.get(&field).copied()) {
                (DuplicateColumns::LastWins, Some(slot)) => slot,
                (_, existing) => {
                    let field = match existing {
                        Some(_) => next_free(&taken, &field),
                        None => field,
                    };
                    taken.insert(field.clone(), fields.len());
                    fields.push(field);
                    fields.len() - 1
                },
            };
            slots.push(slot);
        }

        Self { raw, fields, slots }
    }

    fn matches(&self, record: &Record) -> bool {
        record.len() == self.raw.len()
            && record.fields().zip(&self.raw).all(|(field, raw)| field == raw.as_str())
    }

    fn apply(&self, record: Record) -> Record {
        let mut values: Vec<Option<Value>> = vec![None; self.fields.len()];
        for ((_, value), slot) in record.into_iter().zip(&self.slots) {
            values[*slot] = Some(if value.is_null() { Value::Null } else { value });
        }

        let mut normalized = Record::with_capacity(self.fields.len());
        for (field, value) in self.fields.iter().zip(values) {
            normalized.push(field.clone(), value.unwrap_or(Value::Null));
        }
        normalized
    }
}

/// First of `base_2`, `base_3`, ... not yet taken
fn next_free(taken: &HashMap<String, usize>, base: &str) -> String {
    let mut n = 2;
    loop {
        let candidate = format!("{}_{}", base, n);
        if !taken.contains_key(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// Rewrites records into their normalized form.
///
/// Every row of a source repeats the same header, so the column layout is
/// worked out once and reused until a record with different fields arrives.
#[derive(Debug, Default)]
pub struct Normalizer {
    policy: DuplicateColumns,
    layout: Option<Layout>,
}

impl Normalizer {
    pub fn new(policy: DuplicateColumns) -> Self {
        Self {
            policy,
            layout: None,
        }
    }

    pub fn normalize(&mut self, records: Vec<Record>) -> Vec<Record> {
        records
            .into_iter()
            .map(|record| self.normalize_record(record))
            .collect()
    }

    pub fn normalize_record(&mut self, record: Record) -> Record {
        let layout = match self.layout.take() {
            Some(layout) if layout.matches(&record) => layout,
            _ => Layout::new(record.fields(), self.policy),
        };
        let normalized = layout.apply(record);
        self.layout = Some(layout);
        normalized
    }
}

/// Normalize a whole sequence with the given duplicate-column policy
pub fn normalize(records: Vec<Record>, policy: DuplicateColumns) -> Vec<Record> {
    Normalizer::new(policy).normalize(records)
}
