//! Offline duplicate removal by natural key.
//!
//! At-least-once loading leaves duplicates behind whenever a page is
//! re-fetched after a partial write. Compaction rebuilds the table instead of
//! deleting in place: rows are copied in key order, batch by batch, into a
//! staging table that keeps one row per key, and the staging table is then
//! swapped in. Batching bounds memory and keeps every statement short.
use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::{error::WarehouseError, warehouse::Warehouse};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DuplicateReport {
    pub total: u64,
    pub distinct: u64,
    /// rows without a key; compaction removes them too
    pub null_keys: u64,
    /// extra copies of keys already counted in `distinct`
    pub duplicates: u64,
}

impl DuplicateReport {
    /// Rows [compact] would remove.
    pub fn removable(&self) -> u64 {
        self.null_keys + self.duplicates
    }
}

pub async fn duplicates(
    warehouse: &Arc<dyn Warehouse>,
    table: &str,
    key: &str,
) -> Result<DuplicateReport, WarehouseError> {
    let total = warehouse.count(table, None).await?;
    let distinct = warehouse.count_distinct(table, key).await?;
    let null_keys = warehouse.count_nulls(table, key).await?;
    Ok(DuplicateReport {
        total,
        distinct,
        null_keys,
        duplicates: total.saturating_sub(distinct).saturating_sub(null_keys),
    })
}

/// Removes duplicate rows of `table` by `key`, returning how many were removed.
/// Rows without a key are removed as well; see [DuplicateReport::null_keys].
pub async fn compact(
    warehouse: &Arc<dyn Warehouse>,
    table: &str,
    key: &str,
    batch_size: u64,
) -> Result<u64, WarehouseError> {
    let report = duplicates(warehouse, table, key).await?;
    if report.removable() == 0 {
        info!(table, rows = report.total, "no duplicates");
        return Ok(0);
    }
    info!(
        table,
        rows = report.total,
        duplicates = report.duplicates,
        null_keys = report.null_keys,
        "compacting"
    );

    let staging = format!("{table}_dedup_{}", Uuid::new_v4().simple());
    match rebuild(warehouse, table, &staging, key, report.total, batch_size.max(1)).await {
        Ok(kept) => {
            warehouse.swap_in(table, &staging).await?;
            let removed = report.total.saturating_sub(kept);
            info!(table, removed, kept, "compacted");
            Ok(removed)
        }
        Err(e) => {
            if let Err(cleanup) = warehouse.drop_table(&staging).await {
                warn!(table = %staging, "cannot drop staging table: {cleanup}");
            }
            Err(e)
        }
    }
}

/// Fills `staging` with one row per key and returns its size.
async fn rebuild(
    warehouse: &Arc<dyn Warehouse>,
    table: &str,
    staging: &str,
    key: &str,
    total: u64,
    batch_size: u64,
) -> Result<u64, WarehouseError> {
    warehouse.create_unique_like(table, staging, key).await?;
    let mut offset = 0;
    while offset < total {
        warehouse
            .copy_ignoring_conflicts(table, staging, key, offset, batch_size)
            .await?;
        offset += batch_size;
        info!(table, scanned = offset.min(total), total, "copy batch done");
    }
    warehouse.count(staging, None).await
}
