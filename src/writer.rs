//! Append-only chunked writes to the destination table
use std::sync::Arc;

use tracing::{debug, info};

use crate::{
    error::{WarehouseError, WriteFailure},
    record::{CanonicalRow, TableSchema},
    warehouse::Warehouse,
};

pub struct Writer {
    warehouse: Arc<dyn Warehouse>,
    chunk_size: usize,
}

impl Writer {
    pub fn new(warehouse: Arc<dyn Warehouse>, chunk_size: usize) -> Self {
        Writer {
            warehouse,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Creates `table` with a schema inferred from `rows` and returns the schema
    /// the warehouse ends up with.
    pub async fn ensure_table(
        &self,
        table: &str,
        rows: &[CanonicalRow],
        partition_column: &str,
    ) -> Result<TableSchema, WarehouseError> {
        let schema = TableSchema::infer(rows, partition_column);
        info!(table, columns = schema.columns.len(), "creating table from first page");
        self.warehouse.create_table(table, &schema).await?;
        // someone else may have created it first
        Ok(self.warehouse.schema(table).await?.unwrap_or(schema))
    }

    /// Inserts `rows` in chunks of at most `chunk_size`.
    /// Chunks are separate statements: on failure the rows of the chunks before
    /// the failing one stay written and are reported in [WriteFailure::written].
    pub async fn append(
        &self,
        table: &str,
        schema: &TableSchema,
        rows: &[CanonicalRow],
    ) -> Result<u64, WriteFailure> {
        let mut written = 0;
        for chunk in rows.chunks(self.chunk_size) {
            if let Err(source) = self.warehouse.insert(table, schema, chunk).await {
                return Err(WriteFailure { written, source });
            }
            written += chunk.len() as u64;
            debug!(table, written, "chunk written");
        }
        Ok(written)
    }
}
