//! In-process warehouse.
//!
//! Backs `load --dry-run` and the test suite. Tables live behind a mutex;
//! inserts and count queries can be made to fail on demand to exercise the
//! loader's retry and resume paths.
use std::{
    cmp::Ordering,
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;

use super::{layout, PartitionFilter, Warehouse};
use crate::{
    error::WarehouseError,
    record::{CanonicalRow, ColumnKind, Scalar, TableSchema},
};

#[derive(Debug, Clone)]
struct Table {
    schema: TableSchema,
    rows: Vec<CanonicalRow>,
    unique_key: Option<String>,
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<String, Table>,
    /// rows that may still be inserted before inserts start failing
    insert_budget: Option<u64>,
    /// inserts to reject before accepting again
    failing_inserts: u32,
    fail_counts: bool,
    fail_schema: bool,
}

#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    state: Mutex<State>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a table, bypassing uniqueness and fault injection.
    pub fn with_table(self, table: &str, schema: TableSchema, rows: Vec<CanonicalRow>) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.tables.insert(
                table.to_owned(),
                Table {
                    schema,
                    rows,
                    unique_key: None,
                },
            );
        }
        self
    }

    pub fn rows(&self, table: &str) -> Vec<CanonicalRow> {
        self.state()
            .ok()
            .and_then(|s| s.tables.get(table).map(|t| t.rows.clone()))
            .unwrap_or_default()
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state()
            .map(|s| s.tables.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Lets `rows` more rows in, then rejects every insert that would exceed it.
    pub fn fail_inserts_after(&self, rows: u64) {
        if let Ok(mut state) = self.state() {
            state.insert_budget = Some(rows);
        }
    }

    /// Rejects the next `n` inserts, then accepts again.
    pub fn fail_next_inserts(&self, n: u32) {
        if let Ok(mut state) = self.state() {
            state.failing_inserts = n;
        }
    }

    pub fn fail_counts(&self, fail: bool) {
        if let Ok(mut state) = self.state() {
            state.fail_counts = fail;
        }
    }

    pub fn fail_schema(&self, fail: bool) {
        if let Ok(mut state) = self.state() {
            state.fail_schema = fail;
        }
    }

    /// Clears all injected faults.
    pub fn heal(&self) {
        if let Ok(mut state) = self.state() {
            state.insert_budget = None;
            state.failing_inserts = 0;
            state.fail_counts = false;
            state.fail_schema = false;
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, WarehouseError> {
        self.state
            .lock()
            .map_err(|_| WarehouseError::Unavailable("memory warehouse poisoned".into()))
    }
}

fn table<'a>(state: &'a State, name: &str) -> Result<&'a Table, WarehouseError> {
    state
        .tables
        .get(name)
        .ok_or_else(|| WarehouseError::MissingTable(name.to_owned()))
}

fn key_repr(value: Option<&Scalar>) -> Option<String> {
    match value {
        None | Some(Scalar::Null) => None,
        Some(v) => Some(format!("{v:?}")),
    }
}

fn compare(a: Option<&Scalar>, b: Option<&Scalar>) -> Ordering {
    fn rank(v: Option<&Scalar>) -> u8 {
        match v {
            None | Some(Scalar::Null) => 0,
            Some(Scalar::Bool(_)) => 1,
            Some(Scalar::Int(_) | Scalar::Float(_)) => 2,
            Some(Scalar::Text(_)) => 3,
        }
    }
    match (a, b) {
        (Some(Scalar::Bool(x)), Some(Scalar::Bool(y))) => x.cmp(y),
        (Some(Scalar::Text(x)), Some(Scalar::Text(y))) => x.cmp(y),
        (Some(x @ (Scalar::Int(_) | Scalar::Float(_))), Some(y @ (Scalar::Int(_) | Scalar::Float(_)))) => {
            let as_f64 = |v: &Scalar| match v.coerce(ColumnKind::Float) {
                Some(Scalar::Float(f)) => f,
                _ => 0.0,
            };
            as_f64(x).partial_cmp(&as_f64(y)).unwrap_or(Ordering::Equal)
        }
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Appends to `target`, skipping rows that clash on its unique key.
fn append(target: &mut Table, rows: impl IntoIterator<Item = CanonicalRow>) {
    let mut seen: HashSet<String> = match &target.unique_key {
        Some(key) => target
            .rows
            .iter()
            .filter_map(|r| key_repr(r.get(key)))
            .collect(),
        None => HashSet::new(),
    };
    for row in rows {
        let fitted: CanonicalRow = {
            let mut fitted = CanonicalRow::new();
            for (column, value) in layout(&target.schema, &row) {
                fitted.insert(column.name.clone(), value);
            }
            fitted
        };
        if let Some(key) = &target.unique_key {
            let fresh = key_repr(fitted.get(key)).map_or(false, |k| seen.insert(k));
            if !fresh {
                continue;
            }
        }
        target.rows.push(fitted);
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    fn get_name(&self) -> String {
        String::from("memory")
    }

    async fn schema(&self, table: &str) -> Result<Option<TableSchema>, WarehouseError> {
        let state = self.state()?;
        if state.fail_schema {
            return Err(WarehouseError::Unavailable("schema introspection failed".into()));
        }
        Ok(state.tables.get(table).map(|t| t.schema.clone()))
    }

    async fn create_table(&self, table: &str, schema: &TableSchema) -> Result<(), WarehouseError> {
        self.state()?
            .tables
            .entry(table.to_owned())
            .or_insert_with(|| Table {
                schema: schema.clone(),
                rows: Vec::new(),
                unique_key: None,
            });
        Ok(())
    }

    async fn count(
        &self,
        table_name: &str,
        filter: Option<&PartitionFilter>,
    ) -> Result<u64, WarehouseError> {
        let state = self.state()?;
        if state.fail_counts {
            return Err(WarehouseError::Unavailable("count query failed".into()));
        }
        let t = table(&state, table_name)?;
        let n = match filter {
            None => t.rows.len(),
            Some(f) => t
                .rows
                .iter()
                .filter(|r| {
                    r.get(&f.column).and_then(|v| v.coerce(ColumnKind::Int)) == Some(Scalar::Int(f.value))
                })
                .count(),
        };
        Ok(n as u64)
    }

    async fn count_distinct(&self, table_name: &str, column: &str) -> Result<u64, WarehouseError> {
        let state = self.state()?;
        if state.fail_counts {
            return Err(WarehouseError::Unavailable("count query failed".into()));
        }
        let t = table(&state, table_name)?;
        let distinct: HashSet<String> = t.rows.iter().filter_map(|r| key_repr(r.get(column))).collect();
        Ok(distinct.len() as u64)
    }

    async fn count_nulls(&self, table_name: &str, column: &str) -> Result<u64, WarehouseError> {
        let state = self.state()?;
        if state.fail_counts {
            return Err(WarehouseError::Unavailable("count query failed".into()));
        }
        let t = table(&state, table_name)?;
        Ok(t.rows.iter().filter(|r| key_repr(r.get(column)).is_none()).count() as u64)
    }

    async fn partition_counts(
        &self,
        table_name: &str,
        column: &str,
    ) -> Result<Vec<(i64, u64)>, WarehouseError> {
        let state = self.state()?;
        let t = table(&state, table_name)?;
        let mut counts: BTreeMap<i64, u64> = BTreeMap::new();
        for row in &t.rows {
            if let Some(Scalar::Int(p)) = row.get(column).and_then(|v| v.coerce(ColumnKind::Int)) {
                *counts.entry(p).or_default() += 1;
            }
        }
        Ok(counts.into_iter().collect())
    }

    async fn insert(
        &self,
        table_name: &str,
        _schema: &TableSchema,
        rows: &[CanonicalRow],
    ) -> Result<(), WarehouseError> {
        let mut state = self.state()?;
        if state.failing_inserts > 0 {
            state.failing_inserts -= 1;
            return Err(WarehouseError::Unavailable("insert rejected".into()));
        }
        if let Some(budget) = state.insert_budget {
            let n = rows.len() as u64;
            if n > budget {
                return Err(WarehouseError::Unavailable("insert rejected".into()));
            }
            state.insert_budget = Some(budget - n);
        }
        let target = state
            .tables
            .get_mut(table_name)
            .ok_or_else(|| WarehouseError::MissingTable(table_name.to_owned()))?;
        append(target, rows.iter().cloned());
        Ok(())
    }

    async fn create_unique_like(
        &self,
        source: &str,
        target: &str,
        key: &str,
    ) -> Result<(), WarehouseError> {
        let mut state = self.state()?;
        let schema = table(&state, source)?.schema.clone();
        state.tables.insert(
            target.to_owned(),
            Table {
                schema,
                rows: Vec::new(),
                unique_key: Some(key.to_owned()),
            },
        );
        Ok(())
    }

    async fn copy_ignoring_conflicts(
        &self,
        source: &str,
        target: &str,
        key: &str,
        offset: u64,
        limit: u64,
    ) -> Result<(), WarehouseError> {
        let mut state = self.state()?;
        let mut batch = table(&state, source)?.rows.clone();
        batch.sort_by(|a, b| compare(a.get(key), b.get(key)));
        let batch: Vec<CanonicalRow> = batch
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect();
        let target = state
            .tables
            .get_mut(target)
            .ok_or_else(|| WarehouseError::MissingTable(target.to_owned()))?;
        append(target, batch);
        Ok(())
    }

    async fn swap_in(&self, table_name: &str, replacement: &str) -> Result<(), WarehouseError> {
        let mut state = self.state()?;
        let mut new = state
            .tables
            .remove(replacement)
            .ok_or_else(|| WarehouseError::MissingTable(replacement.to_owned()))?;
        new.unique_key = None;
        state.tables.insert(table_name.to_owned(), new);
        Ok(())
    }

    async fn drop_table(&self, table_name: &str) -> Result<(), WarehouseError> {
        self.state()?.tables.remove(table_name);
        Ok(())
    }
}
