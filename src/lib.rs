//! ## blotter
//! Resumable bulk loader of public crime-incident data into ClickHouse.
//!
//! ## Installation
//! Just use cargo.
//!
//! ## Configuration
//! Example config:
//! ```toml
//! [jobs.chicago]
//! source = "socrata"                      # paged REST API
//! clickhouse_url = "tcp://localhost:9000/crimes"
//! tables = ["chicago_crimes"]
//! first_year = 2015
//! last_year = 2024
//! page_size = 1000
//! retry_limit = 10
//! on_exhausted = "abort"                  # give up on the year, go on with the next
//! timestamp_column = "date"
//! natural_key = "id"
//! composite_fields = { location = "drop" }
//! custom.domain = "data.cityofchicago.org"
//! custom.dataset = "ijzp-q8t2"
//!
//! [jobs.nibrs]
//! source = "csv_dir"                      # IL-2015/nibrs_incident.csv, IL-2016/...
//! clickhouse_url = "tcp://localhost:9000/crimes"
//! tables = ["nibrs_incident", "nibrs_offense", "nibrs_victim"]
//! first_year = 2015
//! last_year = 2024
//! partition_column = "data_year"
//! on_exhausted = "halt"                   # stop the run when retries run out
//! custom.data_dir = "/data/fbi"
//! ```
//! Any value can be overridden from the environment,
//! e.g. `BLOTTER__JOBS__CHICAGO__CUSTOM__APP_TOKEN`.
//!
//! ## Extending
//! New upstreams are added by implementing the [Source] trait and registering
//! the implementation in [get_source].
//!
//! [Source]: source::Source
//! [get_source]: source::get_source
//!
//! ## Resuming and duplicates
//! Blotter keeps no checkpoints. Each (table, year) partition resumes from the
//! number of its rows already in ClickHouse, so an interrupted run is simply
//! started again. Delivery is at-least-once: a page whose write failed half way
//! is fetched again from the old offset, which can duplicate rows.
//! `blotter check` reports duplicates by natural key and `blotter compact`
//! removes them.
//!
//! Run at most one loader per table: the row-count cursor is not safe under
//! concurrent writers.
//!
//! Offsets assume the upstream only grows at the end of a year. If it
//! backfills records with earlier timestamps into a year that is already
//! loaded, resuming skips as many records as were inserted before the
//! cursor. Reload that year and compact to recover them.

pub mod compactor;
pub mod error;
pub mod ingester;
pub mod normalizer;
pub mod record;
pub mod resume;
pub mod settings;
pub mod source;
pub mod warehouse;
pub mod writer;
