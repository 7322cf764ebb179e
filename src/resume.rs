//! Resume offsets derived from what is already in the warehouse
use std::sync::Arc;

use tracing::{info, warn};

use crate::{
    record::Partition,
    warehouse::{PartitionFilter, Warehouse},
};

/// Counts the rows already written for a partition.
///
/// The count is the cursor to resume from. It is only exact while writes are
/// append-only, in source order, and whole pages are the unit of re-fetch;
/// anything else shows up as duplicates for the compactor, never as gaps.
pub struct ResumeTracker {
    warehouse: Arc<dyn Warehouse>,
    partition_column: String,
}

impl ResumeTracker {
    pub fn new(warehouse: Arc<dyn Warehouse>, partition_column: &str) -> Self {
        ResumeTracker {
            warehouse,
            partition_column: partition_column.to_owned(),
        }
    }

    /// Rows of `partition` already in the destination; 0 when that cannot be determined.
    pub async fn resume_offset(&self, partition: &Partition) -> u64 {
        let filter = PartitionFilter {
            column: self.partition_column.clone(),
            value: i64::from(partition.year),
        };
        match self.warehouse.count(&partition.table, Some(&filter)).await {
            Ok(n) => {
                if n > 0 {
                    info!(%partition, offset = n, "resuming");
                }
                n
            }
            Err(e) => {
                warn!(%partition, "cannot count existing rows, starting from 0: {e}");
                0
            }
        }
    }
}
