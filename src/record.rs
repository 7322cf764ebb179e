//! Record shapes flowing through the loader
use std::{collections::BTreeMap, fmt};

/// Raw record as delivered by a source adapter.
/// Loosely typed; never passed beyond the normalizer.
pub type RawRecord = serde_json::Map<String, serde_json::Value>;

/// Unit of ingestion progress: one table, one year.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Partition {
    pub table: String,
    pub year: i32,
}

impl Partition {
    pub fn new(table: &str, year: i32) -> Self {
        Partition {
            table: table.to_owned(),
            year,
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table, self.year)
    }
}

/// One bounded batch of raw records.
#[derive(Debug, Default, Clone)]
pub struct Page {
    pub records: Vec<RawRecord>,
    /// source has nothing beyond this page
    pub fully_consumed: bool,
}

impl Page {
    /// Builds a page, marking it as the last one when it is short.
    pub fn new(records: Vec<RawRecord>, page_size: usize) -> Self {
        let fully_consumed = records.len() < page_size;
        Page {
            records,
            fully_consumed,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Bool,
    Int,
    Float,
    Text,
}

impl Scalar {
    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }

    /// Kind a value naturally belongs to, `None` for nulls.
    pub fn kind(&self) -> Option<ColumnKind> {
        match self {
            Scalar::Null => None,
            Scalar::Bool(_) => Some(ColumnKind::Bool),
            Scalar::Int(_) => Some(ColumnKind::Int),
            Scalar::Float(_) => Some(ColumnKind::Float),
            Scalar::Text(_) => Some(ColumnKind::Text),
        }
    }

    /// Converts the value to `kind`, `None` if it does not fit.
    /// Nulls fit every kind.
    pub fn coerce(&self, kind: ColumnKind) -> Option<Scalar> {
        match (self, kind) {
            (Scalar::Null, _) => Some(Scalar::Null),

            (Scalar::Text(s), ColumnKind::Text) => Some(Scalar::Text(s.clone())),
            (Scalar::Int(x), ColumnKind::Text) => Some(Scalar::Text(x.to_string())),
            (Scalar::Float(x), ColumnKind::Text) => Some(Scalar::Text(x.to_string())),
            (Scalar::Bool(x), ColumnKind::Text) => Some(Scalar::Text(x.to_string())),

            (Scalar::Int(x), ColumnKind::Int) => Some(Scalar::Int(*x)),
            (Scalar::Float(x), ColumnKind::Int) if x.fract() == 0.0 && x.is_finite() => {
                Some(Scalar::Int(*x as i64))
            }
            (Scalar::Bool(x), ColumnKind::Int) => Some(Scalar::Int(i64::from(*x))),
            (Scalar::Text(s), ColumnKind::Int) => parse_text(s, |t| t.parse::<i64>().ok().map(Scalar::Int)),

            (Scalar::Float(x), ColumnKind::Float) => Some(Scalar::Float(*x)),
            (Scalar::Int(x), ColumnKind::Float) => Some(Scalar::Float(*x as f64)),
            (Scalar::Text(s), ColumnKind::Float) => {
                parse_text(s, |t| t.parse::<f64>().ok().filter(|f| f.is_finite()).map(Scalar::Float))
            }

            (Scalar::Bool(x), ColumnKind::Bool) => Some(Scalar::Bool(*x)),
            (Scalar::Int(0), ColumnKind::Bool) => Some(Scalar::Bool(false)),
            (Scalar::Int(1), ColumnKind::Bool) => Some(Scalar::Bool(true)),
            (Scalar::Text(s), ColumnKind::Bool) => parse_text(s, parse_flag),

            _ => None,
        }
    }
}

fn parse_text(s: &str, parse: impl Fn(&str) -> Option<Scalar>) -> Option<Scalar> {
    let t = s.trim();
    if t.is_empty() {
        return Some(Scalar::Null);
    }
    parse(t)
}

fn parse_flag(s: &str) -> Option<Scalar> {
    match s.to_ascii_lowercase().as_str() {
        "true" | "t" | "y" | "yes" | "1" => Some(Scalar::Bool(true)),
        "false" | "f" | "n" | "no" | "0" => Some(Scalar::Bool(false)),
        _ => None,
    }
}

impl From<&serde_json::Value> for Scalar {
    /// Composite values are not handled here; see the normalizer.
    fn from(v: &serde_json::Value) -> Self {
        use serde_json::Value;
        match v {
            Value::Null => Scalar::Null,
            Value::Bool(b) => Scalar::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Scalar::Int(i),
                None => n.as_f64().map(Scalar::Float).unwrap_or(Scalar::Null),
            },
            Value::String(s) => Scalar::Text(s.clone()),
            composite => Scalar::Text(composite.to_string()),
        }
    }
}

/// Normalized record: canonical column names to scalar values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CanonicalRow {
    columns: BTreeMap<String, Scalar>,
}

impl CanonicalRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, column: &str) -> Option<&Scalar> {
        self.columns.get(column)
    }

    pub fn insert(&mut self, column: String, value: Scalar) {
        self.columns.insert(column, value);
    }

    pub fn remove(&mut self, column: &str) -> Option<Scalar> {
        self.columns.remove(column)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.columns.contains_key(column)
    }

    pub fn columns(&self) -> impl Iterator<Item = (&String, &Scalar)> {
        self.columns.iter()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

impl<const N: usize> From<[(&str, Scalar); N]> for CanonicalRow {
    fn from(values: [(&str, Scalar); N]) -> Self {
        CanonicalRow {
            columns: values.into_iter().map(|(k, v)| (k.to_owned(), v)).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub kind: ColumnKind,
    pub nullable: bool,
}

impl Column {
    pub fn nullable(name: &str, kind: ColumnKind) -> Self {
        Column {
            name: name.to_owned(),
            kind,
            nullable: true,
        }
    }
}

/// Column layout of a destination table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableSchema {
    pub columns: Vec<Column>,
}

impl TableSchema {
    pub fn new(columns: Vec<Column>) -> Self {
        TableSchema { columns }
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Derives a schema from a batch of rows, used when the first page defines the table.
    /// All columns are nullable; `partition_column` is always an integer.
    pub fn infer(rows: &[CanonicalRow], partition_column: &str) -> Self {
        let mut kinds: BTreeMap<&str, Option<ColumnKind>> = BTreeMap::new();
        for row in rows {
            for (name, value) in row.columns() {
                let seen = kinds.entry(name.as_str()).or_insert(None);
                *seen = match (*seen, value.kind()) {
                    (prev, None) => prev,
                    (None, next) => next,
                    (Some(a), Some(b)) if a == b => Some(a),
                    (Some(ColumnKind::Int), Some(ColumnKind::Float))
                    | (Some(ColumnKind::Float), Some(ColumnKind::Int)) => Some(ColumnKind::Float),
                    _ => Some(ColumnKind::Text),
                };
            }
        }
        kinds.entry(partition_column).or_insert(None);
        let columns = kinds
            .into_iter()
            .map(|(name, kind)| {
                let kind = if name == partition_column {
                    ColumnKind::Int
                } else {
                    kind.unwrap_or(ColumnKind::Text)
                };
                Column::nullable(name, kind)
            })
            .collect();
        TableSchema { columns }
    }
}
