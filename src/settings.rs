//! Application config
use std::{collections::HashMap, time::Duration};

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::{
    ingester::{OnExhausted, RetryPolicy},
    normalizer::CompositePolicy,
    record::Partition,
    warehouse::is_identifier,
};

/// configuration of single load job
#[derive(Deserialize, Debug, Clone)]
pub struct Job {
    /// name of source adapter to use (`socrata` or `csv_dir`)
    pub source: String,
    /// URL of ClickHouse
    pub clickhouse_url: String,
    /// destination tables; for `csv_dir` also the file names
    pub tables: Vec<String>,
    /// first year to load, inclusive
    pub first_year: i32,
    /// last year to load, inclusive
    pub last_year: i32,
    /// records requested per fetch (default: 1000)
    pub page_size: Option<usize>,
    /// max rows per insert statement (default: 1000)
    pub chunk_size: Option<usize>,
    /// retries of one fetch or write before giving up (default: 10 for socrata, 5 otherwise)
    pub retry_limit: Option<u32>,
    /// fixed pause between retries (default: 2s)
    pub backoff_seconds: Option<u64>,
    /// what to do when retries run out (default: abort the partition)
    pub on_exhausted: Option<OnExhausted>,
    /// column holding the partition year (default: `year`)
    pub partition_column: Option<String>,
    /// column rewritten to a canonical timestamp format
    pub timestamp_column: Option<String>,
    /// source-assigned id used by `check` and `compact`
    pub natural_key: Option<String>,
    /// per-field handling of list/object values, e.g. `{ location = "drop" }`
    #[serde(default)]
    pub composite_fields: HashMap<String, CompositePolicy>,
    /// Source-specific configuration
    pub custom: Option<toml::Value>,
}

impl Job {
    pub fn page_size(&self) -> usize {
        self.page_size.unwrap_or(1000)
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size.unwrap_or(1000)
    }

    /// Socrata throttles more often than local files fail, so it gets more retries.
    pub fn retry_limit(&self) -> u32 {
        match self.retry_limit {
            Some(limit) => limit,
            None if self.source == "socrata" => 10,
            None => 5,
        }
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_seconds.unwrap_or(2))
    }

    pub fn on_exhausted(&self) -> OnExhausted {
        self.on_exhausted.unwrap_or(OnExhausted::Abort)
    }

    pub fn partition_column(&self) -> &str {
        self.partition_column.as_deref().unwrap_or("year")
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            limit: self.retry_limit(),
            backoff: self.backoff(),
            on_exhausted: self.on_exhausted(),
        }
    }

    /// Partitions in load order: years ascending, tables in configured order.
    pub fn partitions(&self) -> Vec<Partition> {
        (self.first_year..=self.last_year)
            .flat_map(|year| self.tables.iter().map(move |t| Partition::new(t, year)))
            .collect()
    }

    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        let fail = |msg: String| Err(ConfigError::Message(format!("job {name}: {msg}")));
        if self.tables.is_empty() {
            return fail("no tables".into());
        }
        if self.first_year > self.last_year {
            return fail(format!("first_year {} after last_year {}", self.first_year, self.last_year));
        }
        let identifiers = self
            .tables
            .iter()
            .chain(self.partition_column.iter())
            .chain(self.natural_key.iter());
        for ident in identifiers {
            if !is_identifier(ident) {
                return fail(format!("{ident:?} is not a valid identifier"));
            }
        }
        if self.page_size == Some(0) || self.chunk_size == Some(0) {
            return fail("page_size and chunk_size must be positive".into());
        }
        Ok(())
    }
}

#[derive(Deserialize, Debug)]
pub struct Settings {
    /// Map of job names and settings
    pub jobs: HashMap<String, Job>,
}

impl Settings {
    pub fn new(cfgfile: &str) -> Result<Self, ConfigError> {
        let cfg = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(cfgfile).required(true))
            .add_source(Environment::with_prefix("BLOTTER").prefix_separator("__").separator("__"))
            .build()?;
        Self::from_config(cfg)
    }

    fn from_config(cfg: Config) -> Result<Self, ConfigError> {
        let mut settings: Settings = cfg.try_deserialize()?;
        for (name, cfg) in &mut settings.jobs {
            cfg.validate(name)?;
            cfg.page_size = Some(cfg.page_size());
            cfg.chunk_size = Some(cfg.chunk_size());
            cfg.retry_limit = Some(cfg.retry_limit());
            cfg.backoff_seconds = Some(cfg.backoff().as_secs());
            cfg.on_exhausted = Some(cfg.on_exhausted());
            cfg.partition_column = Some(cfg.partition_column().to_owned());
        }
        Ok(settings)
    }

    pub fn job(&self, name: &str) -> Result<&Job, ConfigError> {
        self.jobs
            .get(name)
            .ok_or_else(|| ConfigError::NotFound(format!("jobs.{name}")))
    }
}
