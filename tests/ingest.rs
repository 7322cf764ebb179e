mod common;

use std::{collections::HashMap, fs, sync::Arc};

use blotter::{
    compactor,
    error::{IngestError, SourceError},
    ingester::{Ingester, OnExhausted, Outcome, Phase},
    record::{CanonicalRow, Column, ColumnKind, Partition, Scalar, TableSchema},
    settings::Job,
    source::get_source,
    warehouse::{memory::MemoryWarehouse, Warehouse},
};
use common::{crimes, ingester, policy, StubSource};

fn cursors(calls: &std::sync::Mutex<Vec<(Partition, u64)>>) -> Vec<u64> {
    calls.lock().unwrap().iter().map(|(_, c)| *c).collect()
}

#[tokio::test]
async fn short_page_ends_partition() {
    let p = Partition::new("chicago_crimes", 2021);
    let source = StubSource::new().with(&p, crimes(2021, 25));
    let calls = source.calls();
    let mem = Arc::new(MemoryWarehouse::new());

    let reports = ingester(source, mem.clone(), 10, 1000, policy(3, OnExhausted::Abort))
        .run(&[p])
        .await
        .unwrap();

    assert_eq!(reports[0].outcome, Outcome::Completed);
    assert_eq!(reports[0].rows_written, 25);
    assert_eq!(reports[0].fetches, 3);
    assert_eq!(cursors(&calls), vec![0, 10, 20]);
    assert_eq!(mem.rows("chicago_crimes").len(), 25);
}

#[tokio::test]
async fn exact_multiple_needs_one_empty_fetch() {
    let p = Partition::new("chicago_crimes", 2021);
    let source = StubSource::new().with(&p, crimes(2021, 20));
    let calls = source.calls();
    let mem = Arc::new(MemoryWarehouse::new());

    let reports = ingester(source, mem.clone(), 10, 1000, policy(3, OnExhausted::Abort))
        .run(&[p])
        .await
        .unwrap();

    assert_eq!(reports[0].outcome, Outcome::Completed);
    assert_eq!(cursors(&calls), vec![0, 10, 20]);
    assert_eq!(mem.rows("chicago_crimes").len(), 20);
}

#[tokio::test]
async fn rows_are_normalized() {
    let p = Partition::new("chicago_crimes", 2021);
    let source = StubSource::new().with(&p, crimes(2021, 2));
    let mem = Arc::new(MemoryWarehouse::new());

    ingester(source, mem.clone(), 10, 1000, policy(0, OnExhausted::Abort))
        .run(&[p])
        .await
        .unwrap();

    let rows = mem.rows("chicago_crimes");
    let first = &rows[0];
    assert_eq!(first.get("id"), Some(&Scalar::Text("2021-0".into())));
    assert_eq!(first.get("primary_type"), Some(&Scalar::Text("THEFT".into())));
    assert_eq!(first.get("date"), Some(&Scalar::Text("2021-01-01 00:00:00".into())));
    assert_eq!(first.get("year"), Some(&Scalar::Int(2021)));
    assert_eq!(first.get("arrest"), Some(&Scalar::Bool(true)));
    assert!(!first.contains("location"));
}

#[tokio::test]
async fn retries_are_bounded() {
    let p = Partition::new("chicago_crimes", 2021);
    let mut source = StubSource::new().with(&p, crimes(2021, 5));
    source.always = Some(SourceError::Transient("503 Service Unavailable".into()));
    let calls = source.calls();
    let mem = Arc::new(MemoryWarehouse::new());

    let reports = ingester(source, mem.clone(), 10, 1000, policy(3, OnExhausted::Abort))
        .run(&[p])
        .await
        .unwrap();

    assert_eq!(calls.lock().unwrap().len(), 4);
    assert_eq!(reports[0].rows_written, 0);
    assert!(matches!(
        reports[0].outcome,
        Outcome::Abandoned {
            phase: Phase::Fetch,
            attempts: 4,
            ..
        }
    ));
    assert!(mem.table_names().is_empty());
}

#[tokio::test]
async fn abort_moves_on_halt_stops() {
    let first = Partition::new("chicago_crimes", 2020);
    let second = Partition::new("chicago_crimes", 2021);

    let mut source = StubSource::new()
        .with(&first, crimes(2020, 5))
        .with(&second, crimes(2021, 5));
    source.always = Some(SourceError::Transient("timeout".into()));
    let calls = source.calls();
    let reports = ingester(source, Arc::new(MemoryWarehouse::new()), 10, 10, policy(1, OnExhausted::Abort))
        .run(&[first.clone(), second.clone()])
        .await
        .unwrap();
    assert_eq!(reports.len(), 2);
    assert_eq!(calls.lock().unwrap().len(), 4);

    let third = Partition::new("chicago_crimes", 2022);
    let mut source = StubSource::new()
        .with(&first, crimes(2020, 5))
        .with(&second, crimes(2021, 5))
        .with(&third, crimes(2022, 5));
    source
        .broken
        .insert(second.clone(), SourceError::Transient("timeout".into()));
    let calls = source.calls();
    let halted = ingester(source, Arc::new(MemoryWarehouse::new()), 10, 10, policy(1, OnExhausted::Halt))
        .run(&[first.clone(), second.clone(), third.clone()])
        .await
        .unwrap_err();

    // partitions finished before the halt keep their reports
    assert_eq!(halted.reports.len(), 1);
    assert_eq!(halted.reports[0].partition, first);
    assert_eq!(halted.reports[0].outcome, Outcome::Completed);
    assert_eq!(halted.reports[0].rows_written, 5);
    match halted.error {
        IngestError::RetriesExhausted {
            partition,
            phase,
            attempts,
            ..
        } => {
            assert_eq!(partition, second.to_string());
            assert_eq!(phase, Phase::Fetch);
            assert_eq!(attempts, 2);
        }
        other => panic!("unexpected error {other}"),
    }
    assert!(calls.lock().unwrap().iter().all(|(p, _)| *p != third));
}

#[tokio::test]
async fn transient_fetch_failures_recover() {
    let p = Partition::new("chicago_crimes", 2021);
    let mut source = StubSource::new().with(&p, crimes(2021, 15));
    source.transient_failures = 2;
    let calls = source.calls();
    let mem = Arc::new(MemoryWarehouse::new());

    let reports = ingester(source, mem.clone(), 10, 1000, policy(3, OnExhausted::Abort))
        .run(&[p])
        .await
        .unwrap();

    assert_eq!(reports[0].outcome, Outcome::Completed);
    assert_eq!(cursors(&calls), vec![0, 0, 0, 10]);
    assert_eq!(mem.rows("chicago_crimes").len(), 15);
}

#[tokio::test]
async fn resumes_from_existing_rows() {
    let p = Partition::new("chicago_crimes", 2021);
    let records = crimes(2021, 30);
    let mem = Arc::new(MemoryWarehouse::new());

    // first run only gets the first 12 records
    let source = StubSource::new().with(&p, records[..12].to_vec());
    ingester(source, mem.clone(), 10, 1000, policy(0, OnExhausted::Abort))
        .run(&[p.clone()])
        .await
        .unwrap();
    assert_eq!(mem.rows("chicago_crimes").len(), 12);

    let source = StubSource::new().with(&p, records);
    let calls = source.calls();
    let reports = ingester(source, mem.clone(), 10, 1000, policy(0, OnExhausted::Abort))
        .run(&[p])
        .await
        .unwrap();

    assert_eq!(reports[0].resumed_at, 12);
    assert_eq!(cursors(&calls), vec![12, 22]);
    assert_eq!(mem.rows("chicago_crimes").len(), 30);
    let wh: Arc<dyn Warehouse> = mem;
    assert_eq!(compactor::duplicates(&wh, "chicago_crimes", "id").await.unwrap().duplicates, 0);
}

#[tokio::test]
async fn resume_counts_only_own_year() {
    let y2020 = Partition::new("chicago_crimes", 2020);
    let y2021 = Partition::new("chicago_crimes", 2021);
    let mem = Arc::new(MemoryWarehouse::new());
    let source = StubSource::new().with(&y2020, crimes(2020, 7));
    ingester(source, mem.clone(), 10, 1000, policy(0, OnExhausted::Abort))
        .run(&[y2020.clone()])
        .await
        .unwrap();

    let source = StubSource::new()
        .with(&y2020, crimes(2020, 7))
        .with(&y2021, crimes(2021, 3));
    let calls = source.calls();
    let reports = ingester(source, mem.clone(), 10, 1000, policy(0, OnExhausted::Abort))
        .run(&[y2020, y2021])
        .await
        .unwrap();

    assert_eq!(reports[0].resumed_at, 7);
    assert_eq!(reports[0].rows_written, 0);
    assert_eq!(reports[1].resumed_at, 0);
    assert_eq!(cursors(&calls), vec![7, 0]);
    assert_eq!(mem.rows("chicago_crimes").len(), 10);
}

#[tokio::test]
async fn partial_page_write_resumes_after_durable_prefix() {
    let p = Partition::new("chicago_crimes", 2021);
    let records = crimes(2021, 1000);
    let mem = Arc::new(MemoryWarehouse::new());
    mem.fail_inserts_after(400);

    let source = StubSource::new().with(&p, records.clone());
    let calls = source.calls();
    let reports = ingester(source, mem.clone(), 1000, 100, policy(2, OnExhausted::Abort))
        .run(&[p.clone()])
        .await
        .unwrap();

    assert!(matches!(
        reports[0].outcome,
        Outcome::Abandoned {
            phase: Phase::Write,
            attempts: 3,
            ..
        }
    ));
    assert_eq!(reports[0].rows_written, 400);
    assert_eq!(calls.lock().unwrap().len(), 1);
    assert_eq!(mem.rows("chicago_crimes").len(), 400);

    mem.heal();
    let source = StubSource::new().with(&p, records);
    let calls = source.calls();
    let reports = ingester(source, mem.clone(), 1000, 100, policy(2, OnExhausted::Abort))
        .run(&[p])
        .await
        .unwrap();

    assert_eq!(reports[0].outcome, Outcome::Completed);
    assert_eq!(cursors(&calls), vec![400]);
    assert_eq!(mem.rows("chicago_crimes").len(), 1000);
}

#[tokio::test]
async fn rejected_writes_retry_without_refetch() {
    let p = Partition::new("chicago_crimes", 2021);
    let mem = Arc::new(MemoryWarehouse::new());
    let source = StubSource::new().with(&p, crimes(2021, 5));
    ingester(source, mem.clone(), 10, 10, policy(0, OnExhausted::Abort))
        .run(&[p.clone()])
        .await
        .unwrap();

    let p2 = Partition::new("chicago_crimes", 2022);
    mem.fail_next_inserts(2);
    let source = StubSource::new().with(&p2, crimes(2022, 8));
    let calls = source.calls();
    let reports = ingester(source, mem.clone(), 10, 3, policy(3, OnExhausted::Abort))
        .run(&[p2])
        .await
        .unwrap();

    assert_eq!(reports[0].outcome, Outcome::Completed);
    assert_eq!(reports[0].rows_written, 8);
    assert_eq!(calls.lock().unwrap().len(), 1);
    let wh: Arc<dyn Warehouse> = mem.clone();
    assert_eq!(mem.rows("chicago_crimes").len(), 13);
    assert_eq!(compactor::duplicates(&wh, "chicago_crimes", "id").await.unwrap().duplicates, 0);
}

#[tokio::test]
async fn fatal_source_error_skips_partition() {
    let missing = Partition::new("chicago_crimes", 2019);
    let present = Partition::new("chicago_crimes", 2020);
    let source = StubSource::new().with(&present, crimes(2020, 4));
    let calls = source.calls();
    let mem = Arc::new(MemoryWarehouse::new());

    let reports = ingester(source, mem.clone(), 10, 10, policy(5, OnExhausted::Halt))
        .run(&[missing, present])
        .await
        .unwrap();

    assert!(matches!(reports[0].outcome, Outcome::Skipped { .. }));
    assert_eq!(reports[1].outcome, Outcome::Completed);
    assert_eq!(calls.lock().unwrap().len(), 2);
    assert_eq!(mem.rows("chicago_crimes").len(), 4);
}

#[tokio::test]
async fn bad_records_are_dropped_but_cursor_advances() {
    let p = Partition::new("chicago_crimes", 2021);
    let mut records = crimes(2021, 10);
    records[3].insert("Date".into(), "yesterday".into());
    records[7].insert("Date".into(), "31/31/2021".into());
    let source = StubSource::new().with(&p, records);
    let calls = source.calls();
    let mem = Arc::new(MemoryWarehouse::new());

    let reports = ingester(source, mem.clone(), 5, 10, policy(0, OnExhausted::Abort))
        .run(&[p])
        .await
        .unwrap();

    assert_eq!(reports[0].rows_dropped, 2);
    assert_eq!(reports[0].rows_written, 8);
    assert_eq!(cursors(&calls), vec![0, 5, 10]);
}

#[tokio::test]
async fn schema_introspection_failure_skips() {
    let p = Partition::new("chicago_crimes", 2021);
    let source = StubSource::new().with(&p, crimes(2021, 3));
    let calls = source.calls();
    let mem = Arc::new(MemoryWarehouse::new());
    mem.fail_schema(true);

    let reports = ingester(source, mem.clone(), 10, 10, policy(3, OnExhausted::Halt))
        .run(&[p])
        .await
        .unwrap();

    assert!(matches!(reports[0].outcome, Outcome::Skipped { .. }));
    assert!(calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn existing_schema_filters_and_coerces() {
    let p = Partition::new("chicago_crimes", 2021);
    let schema = TableSchema::new(vec![
        Column::nullable("id", ColumnKind::Text),
        Column::nullable("year", ColumnKind::Int),
        Column::nullable("arrest", ColumnKind::Bool),
    ]);
    let mem = Arc::new(MemoryWarehouse::new().with_table("chicago_crimes", schema, Vec::new()));
    let source = StubSource::new().with(&p, crimes(2021, 3));

    ingester(source, mem.clone(), 10, 10, policy(0, OnExhausted::Abort))
        .run(&[p])
        .await
        .unwrap();

    let rows = mem.rows("chicago_crimes");
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|r| r.len() == 3 && !r.contains("primary_type")));
}

#[tokio::test]
async fn lost_resume_count_duplicates_then_compacts() {
    let p = Partition::new("chicago_crimes", 2021);
    let records = crimes(2021, 6);
    let mem = Arc::new(MemoryWarehouse::new());
    let source = StubSource::new().with(&p, records[..4].to_vec());
    ingester(source, mem.clone(), 10, 10, policy(0, OnExhausted::Abort))
        .run(&[p.clone()])
        .await
        .unwrap();

    // resume count unavailable: reload from the start
    mem.fail_counts(true);
    let source = StubSource::new().with(&p, records);
    let calls = source.calls();
    let reports = ingester(source, mem.clone(), 10, 10, policy(0, OnExhausted::Abort))
        .run(&[p])
        .await
        .unwrap();
    assert_eq!(reports[0].resumed_at, 0);
    assert_eq!(cursors(&calls), vec![0]);
    mem.heal();

    let wh: Arc<dyn Warehouse> = mem.clone();
    assert_eq!(compactor::duplicates(&wh, "chicago_crimes", "id").await.unwrap().duplicates, 4);
    assert_eq!(compactor::compact(&wh, "chicago_crimes", "id", 4).await.unwrap(), 4);
    assert_eq!(mem.rows("chicago_crimes").len(), 6);
    assert_eq!(compactor::duplicates(&wh, "chicago_crimes", "id").await.unwrap().duplicates, 0);
}

fn csv_job(data_dir: &std::path::Path) -> Job {
    let custom = toml::Value::Table(toml::map::Map::from_iter([(
        "data_dir".to_owned(),
        toml::Value::String(data_dir.display().to_string()),
    )]));
    Job {
        source: "csv_dir".into(),
        clickhouse_url: "tcp://localhost:9000/crimes".into(),
        tables: vec!["nibrs_incident".into()],
        first_year: 2019,
        last_year: 2020,
        page_size: Some(2),
        chunk_size: Some(2),
        retry_limit: Some(0),
        backoff_seconds: Some(0),
        on_exhausted: Some(OnExhausted::Abort),
        partition_column: Some("data_year".into()),
        timestamp_column: None,
        natural_key: Some("incident_id".into()),
        composite_fields: HashMap::new(),
        custom: Some(custom),
    }
}

#[tokio::test]
async fn loads_csv_directories() {
    let dir = tempfile::tempdir().unwrap();
    for (year, body) in [
        (2019, "DATA_YEAR,INCIDENT_ID,AGENCY_ID,CLEARED\n2019,11,0042,\n2019,12,0042,Y\n2019,13,0107,N\n"),
        (2020, "DATA_YEAR,INCIDENT_ID,AGENCY_ID,CLEARED\n2020,21,0042,N\n"),
    ] {
        let year_dir = dir.path().join(format!("IL-{year}"));
        fs::create_dir(&year_dir).unwrap();
        fs::write(year_dir.join("nibrs_incident.csv"), body).unwrap();
    }

    let job = csv_job(dir.path());
    let mem = Arc::new(MemoryWarehouse::new());
    let source = get_source(&job.source, job.custom.clone()).unwrap();
    let reports = Ingester::from_job(&job, source, mem.clone())
        .run(&job.partitions())
        .await
        .unwrap();

    assert!(reports.iter().all(|r| r.outcome == Outcome::Completed));
    let rows: Vec<CanonicalRow> = mem.rows("nibrs_incident");
    assert_eq!(rows.len(), 4);
    assert_eq!(rows[0].get("agency_id"), Some(&Scalar::Text("0042".into())));
    assert_eq!(rows[0].get("cleared"), Some(&Scalar::Null));
    assert_eq!(
        mem.partition_counts("nibrs_incident", "data_year").await.unwrap(),
        vec![(2019, 3), (2020, 1)]
    );

    // second run finds everything loaded
    let source = get_source(&job.source, job.custom.clone()).unwrap();
    let reports = Ingester::from_job(&job, source, mem.clone())
        .run(&job.partitions())
        .await
        .unwrap();
    assert_eq!(reports[0].resumed_at, 3);
    assert_eq!(reports.iter().map(|r| r.rows_written).sum::<u64>(), 0);
    assert_eq!(mem.rows("nibrs_incident").len(), 4);
}

#[tokio::test]
async fn code_columns_keep_later_alphanumeric_pages() {
    let dir = tempfile::tempdir().unwrap();
    let year_dir = dir.path().join("IL-2021");
    fs::create_dir(&year_dir).unwrap();
    fs::write(
        year_dir.join("nibrs_offense.csv"),
        "DATA_YEAR,OFFENSE_ID,OFFENSE_CODE\n2021,1,220\n2021,2,240\n2021,3,13A\n2021,4,23H\n",
    )
    .unwrap();

    let job = Job {
        tables: vec!["nibrs_offense".into()],
        first_year: 2021,
        last_year: 2021,
        natural_key: Some("offense_id".into()),
        ..csv_job(dir.path())
    };
    let mem = Arc::new(MemoryWarehouse::new());
    let source = get_source(&job.source, job.custom.clone()).unwrap();
    let reports = Ingester::from_job(&job, source, mem.clone())
        .run(&job.partitions())
        .await
        .unwrap();

    assert_eq!(reports[0].outcome, Outcome::Completed);
    assert_eq!(reports[0].rows_dropped, 0);
    assert_eq!(reports[0].rows_written, 4);
    let codes: Vec<_> = mem
        .rows("nibrs_offense")
        .iter()
        .map(|r| r.get("offense_code").cloned())
        .collect();
    assert_eq!(
        codes,
        ["220", "240", "13A", "23H"]
            .map(|c| Some(Scalar::Text(c.into())))
            .to_vec()
    );
}
