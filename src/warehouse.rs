//! Destination store
pub mod clickhouse;
pub mod memory;

use async_trait::async_trait;

use crate::{
    error::WarehouseError,
    record::{CanonicalRow, Column, Scalar, TableSchema},
};

/// Rows whose partition column equals `value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionFilter {
    pub column: String,
    pub value: i64,
}

/// Everything the loader and the compactor need from the store.
/// Each call is one statement; nothing spans calls.
#[async_trait]
pub trait Warehouse: Send + Sync {
    fn get_name(&self) -> String;

    /// Column layout of `table`, `None` if it does not exist.
    async fn schema(&self, table: &str) -> Result<Option<TableSchema>, WarehouseError>;

    async fn create_table(&self, table: &str, schema: &TableSchema) -> Result<(), WarehouseError>;

    async fn count(
        &self,
        table: &str,
        filter: Option<&PartitionFilter>,
    ) -> Result<u64, WarehouseError>;

    /// Distinct non-null values of `column`.
    async fn count_distinct(&self, table: &str, column: &str) -> Result<u64, WarehouseError>;

    async fn count_nulls(&self, table: &str, column: &str) -> Result<u64, WarehouseError>;

    /// Row count per partition value, ascending.
    async fn partition_counts(
        &self,
        table: &str,
        column: &str,
    ) -> Result<Vec<(i64, u64)>, WarehouseError>;

    /// Appends rows laid out according to `schema`; absent columns are written as nulls.
    async fn insert(
        &self,
        table: &str,
        schema: &TableSchema,
        rows: &[CanonicalRow],
    ) -> Result<(), WarehouseError>;

    /// Creates empty `target` shaped like `source`, accepting at most one row per `key`.
    async fn create_unique_like(
        &self,
        source: &str,
        target: &str,
        key: &str,
    ) -> Result<(), WarehouseError>;

    /// Copies `limit` rows of `source` ordered by `key`, starting at `offset`,
    /// into `target`, skipping rows whose key is already there.
    async fn copy_ignoring_conflicts(
        &self,
        source: &str,
        target: &str,
        key: &str,
        offset: u64,
        limit: u64,
    ) -> Result<(), WarehouseError>;

    /// Puts `replacement` in place of `table` and drops the old contents.
    async fn swap_in(&self, table: &str, replacement: &str) -> Result<(), WarehouseError>;

    async fn drop_table(&self, table: &str) -> Result<(), WarehouseError>;
}

/// Lays a row out in schema order, coercing each value to its column kind.
/// Absent columns and values that do not fit become nulls.
pub fn layout<'a>(
    schema: &'a TableSchema,
    row: &'a CanonicalRow,
) -> impl Iterator<Item = (&'a Column, Scalar)> + 'a {
    schema.columns.iter().map(move |column| {
        let value = row
            .get(&column.name)
            .and_then(|v| v.coerce(column.kind))
            .unwrap_or(Scalar::Null);
        (column, value)
    })
}

/// Table and column names are interpolated into SQL, so only plain identifiers are accepted.
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
