//! Error kinds of the loader
use thiserror::Error;

use crate::ingester::{PartitionReport, Phase};

/// Failure of a source adapter fetch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// network, timeout, rate limiting: worth retrying
    #[error("transient source error: {0}")]
    Transient(String),
    /// missing or malformed input: retrying will not help
    #[error("fatal source error: {0}")]
    Fatal(String),
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) if !(status.is_server_error() || status.as_u16() == 429) => {
                SourceError::Fatal(format!("request rejected: {e}"))
            }
            _ => SourceError::Transient(e.to_string()),
        }
    }
}

impl From<csv::Error> for SourceError {
    fn from(e: csv::Error) -> Self {
        SourceError::Fatal(format!("reading delimited file: {e}"))
    }
}

impl From<std::io::Error> for SourceError {
    fn from(e: std::io::Error) -> Self {
        SourceError::Fatal(format!("io: {e}"))
    }
}

#[derive(Error, Debug)]
pub enum WarehouseError {
    #[error("clickhouse: {0}")]
    Clickhouse(#[from] clickhouse_rs::errors::Error),
    #[error("table {0} does not exist")]
    MissingTable(String),
    #[error("warehouse unavailable: {0}")]
    Unavailable(String),
}

/// A single record that cannot be brought into canonical form.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("column {column}: {message}")]
pub struct RowError {
    pub column: String,
    pub message: String,
}

impl RowError {
    pub fn new(column: &str, message: impl Into<String>) -> Self {
        RowError {
            column: column.to_owned(),
            message: message.into(),
        }
    }
}

/// Append that failed part way; `written` rows before the failing chunk are durable.
#[derive(Error, Debug)]
#[error("append failed after {written} rows: {source}")]
pub struct WriteFailure {
    pub written: u64,
    #[source]
    pub source: WarehouseError,
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("{partition}: retries exhausted during {phase:?} after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        partition: String,
        phase: Phase,
        attempts: u32,
        last_error: String,
    },
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Warehouse(#[from] WarehouseError),
}

/// A run stopped by a halting partition, with the reports of the partitions
/// finished before it.
#[derive(Error, Debug)]
#[error("run halted: {error}")]
pub struct Halted {
    pub reports: Vec<PartitionReport>,
    #[source]
    pub error: IngestError,
}
