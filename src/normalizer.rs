//! Maps raw source records into canonical rows.
//!
//! Column names are case-folded and sanitized, composite values are dropped or
//! stringified, the timestamp column is rewritten to one format, and the
//! partition column is guaranteed to be present so the resume tracker always
//! has something to count against. When the destination schema is known only
//! its columns survive, coerced to the column kinds.
use std::collections::HashMap;

use chrono::NaiveDateTime;
use serde::Deserialize;
use serde_json::Value;

use crate::{
    error::RowError,
    record::{CanonicalRow, ColumnKind, Partition, RawRecord, Scalar, TableSchema},
};

/// Output format of the timestamp column
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const TIMESTAMP_INPUTS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%m/%d/%Y %I:%M:%S %p",
    "%m/%d/%Y %H:%M:%S",
];

/// What to do with a list/object valued field.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompositePolicy {
    Drop,
    Stringify,
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    partition_column: String,
    timestamp_column: Option<String>,
    composite_fields: HashMap<String, CompositePolicy>,
}

impl Normalizer {
    pub fn new(
        partition_column: &str,
        timestamp_column: Option<&str>,
        composite_fields: &HashMap<String, CompositePolicy>,
    ) -> Self {
        Normalizer {
            partition_column: canonical_name(partition_column),
            timestamp_column: timestamp_column.map(canonical_name),
            composite_fields: composite_fields
                .iter()
                .map(|(k, v)| (canonical_name(k), *v))
                .collect(),
        }
    }

    pub fn partition_column(&self) -> &str {
        &self.partition_column
    }

    pub fn normalize(
        &self,
        raw: &RawRecord,
        partition: &Partition,
        schema: Option<&TableSchema>,
    ) -> Result<CanonicalRow, RowError> {
        let mut row = CanonicalRow::new();
        for (key, value) in raw {
            let name = canonical_name(key);
            if row.contains(&name) {
                continue;
            }
            let scalar = match value {
                Value::Array(_) | Value::Object(_) => {
                    match self.composite_fields.get(&name) {
                        Some(CompositePolicy::Drop) => continue,
                        Some(CompositePolicy::Stringify) | None => Scalar::Text(value.to_string()),
                    }
                }
                v => Scalar::from(v),
            };
            row.insert(name, scalar);
        }

        if let Some(ts) = &self.timestamp_column {
            let formatted = match row.get(ts) {
                Some(Scalar::Text(value)) => Some(
                    normalize_timestamp(value)
                        .ok_or_else(|| RowError::new(ts, format!("unparsable timestamp {value:?}")))?,
                ),
                _ => None,
            };
            if let Some(formatted) = formatted {
                row.insert(ts.clone(), Scalar::Text(formatted));
            }
        }

        let year = match row.get(&self.partition_column) {
            None | Some(Scalar::Null) => Scalar::Int(i64::from(partition.year)),
            Some(v) => match v.coerce(ColumnKind::Int) {
                Some(Scalar::Int(y)) => Scalar::Int(y),
                _ => return Err(RowError::new(&self.partition_column, format!("not a year: {v:?}"))),
            },
        };
        row.insert(self.partition_column.clone(), year);

        match schema {
            None => Ok(row),
            Some(schema) => {
                let mut fitted = CanonicalRow::new();
                for column in &schema.columns {
                    if let Some(value) = row.remove(&column.name) {
                        let value = value.coerce(column.kind).ok_or_else(|| {
                            RowError::new(&column.name, format!("{value:?} is not {:?}", column.kind))
                        })?;
                        fitted.insert(column.name.clone(), value);
                    }
                }
                Ok(fitted)
            }
        }
    }
}

/// Lower-cases a source field name and replaces anything outside `[a-z0-9_]`.
pub fn canonical_name(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| match c.to_ascii_lowercase() {
            c @ ('a'..='z' | '0'..='9' | '_') => c,
            _ => '_',
        })
        .collect()
}

pub fn normalize_timestamp(value: &str) -> Option<String> {
    let value = value.trim();
    TIMESTAMP_INPUTS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|ts| ts.format(TIMESTAMP_FORMAT).to_string())
}
