#![allow(dead_code)]
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use blotter::{
    error::SourceError,
    ingester::{Ingester, OnExhausted, RetryPolicy},
    normalizer::{CompositePolicy, Normalizer},
    record::{Page, Partition, RawRecord},
    source::Source,
    warehouse::Warehouse,
};
use serde_json::json;

/// In-memory upstream serving fixed records per partition.
#[derive(Default)]
pub struct StubSource {
    pub data: HashMap<Partition, Vec<RawRecord>>,
    /// every fetch as (partition, cursor)
    pub calls: Arc<Mutex<Vec<(Partition, u64)>>>,
    /// transient failures to return before serving data
    pub transient_failures: u32,
    /// fail every fetch with this error
    pub always: Option<SourceError>,
    /// fail every fetch of these partitions
    pub broken: HashMap<Partition, SourceError>,
}

impl StubSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, partition: &Partition, records: Vec<RawRecord>) -> Self {
        self.data.insert(partition.clone(), records);
        self
    }

    pub fn calls(&self) -> Arc<Mutex<Vec<(Partition, u64)>>> {
        self.calls.clone()
    }
}

#[async_trait]
impl Source for StubSource {
    fn get_name(&self) -> String {
        String::from("stub")
    }

    async fn fetch(
        &mut self,
        partition: &Partition,
        cursor: u64,
        page_size: usize,
    ) -> Result<Page, SourceError> {
        self.calls.lock().unwrap().push((partition.clone(), cursor));
        if let Some(err) = self.always.as_ref().or_else(|| self.broken.get(partition)) {
            return Err(err.clone());
        }
        if self.transient_failures > 0 {
            self.transient_failures -= 1;
            return Err(SourceError::Transient("connection reset".into()));
        }
        let records = self
            .data
            .get(partition)
            .ok_or_else(|| SourceError::Fatal(format!("no data for {partition}")))?;
        let page = records
            .iter()
            .skip(cursor as usize)
            .take(page_size)
            .cloned()
            .collect();
        Ok(Page::new(page, page_size))
    }
}

/// Chicago-shaped raw records, ids `<year>-<n>`.
pub fn crimes(year: i32, n: usize) -> Vec<RawRecord> {
    (0..n)
        .map(|i| {
            let v = json!({
                "ID": format!("{year}-{i}"),
                "Date": format!("{year}-01-01T{:02}:{:02}:00.000", (i / 60) % 24, i % 60),
                "Primary_Type": "THEFT",
                "Arrest": i % 2 == 0,
                "Location": {"latitude": "41.88", "longitude": "-87.63"},
            });
            match v {
                serde_json::Value::Object(m) => m,
                _ => unreachable!(),
            }
        })
        .collect()
}

pub fn policy(limit: u32, on_exhausted: OnExhausted) -> RetryPolicy {
    RetryPolicy {
        limit,
        backoff: Duration::ZERO,
        on_exhausted,
    }
}

pub fn ingester(
    source: StubSource,
    warehouse: Arc<dyn Warehouse>,
    page_size: usize,
    chunk_size: usize,
    policy: RetryPolicy,
) -> Ingester {
    let composites = HashMap::from([("location".to_owned(), CompositePolicy::Drop)]);
    let normalizer = Normalizer::new("year", Some("date"), &composites);
    Ingester::new(Box::new(source), warehouse, normalizer, page_size, chunk_size, policy)
}
