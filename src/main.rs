use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use blotter::{
    compactor,
    ingester::{Ingester, Outcome, PartitionReport},
    settings::{Job, Settings},
    source::get_source,
    warehouse::{clickhouse::ClickhouseWarehouse, memory::MemoryWarehouse, Warehouse},
};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[doc(hidden)]
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(short, long)]
    config: String,
    #[command(subcommand)]
    command: Command,
}

#[doc(hidden)]
#[derive(Subcommand, Debug)]
enum Command {
    /// Load configured jobs, resuming every partition where it stopped
    Load {
        /// only this job (default: all jobs)
        #[arg(short, long)]
        job: Option<String>,
        /// load into memory instead of ClickHouse
        #[arg(long)]
        dry_run: bool,
    },
    /// Report rows, duplicates and rows per partition
    Check {
        #[arg(short, long)]
        job: String,
        #[arg(short, long)]
        table: Option<String>,
    },
    /// Remove duplicate rows by natural key
    Compact {
        #[arg(short, long)]
        job: String,
        #[arg(short, long)]
        table: Option<String>,
        /// natural key column (default: the job's natural_key)
        #[arg(short, long)]
        key: Option<String>,
        #[arg(long, default_value_t = 100_000)]
        batch_size: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();
    let settings = Settings::new(&args.config).context("cannot load config")?;
    match args.command {
        Command::Load { job, dry_run } => load(&settings, job.as_deref(), dry_run).await,
        Command::Check { job, table } => check(settings.job(&job)?, table.as_deref()).await,
        Command::Compact {
            job,
            table,
            key,
            batch_size,
        } => compact(settings.job(&job)?, table.as_deref(), key.as_deref(), batch_size).await,
    }
}

fn tables<'a>(job: &'a Job, table: Option<&'a str>) -> Vec<&'a str> {
    match table {
        Some(t) => vec![t],
        None => job.tables.iter().map(String::as_str).collect(),
    }
}

async fn load(settings: &Settings, only: Option<&str>, dry_run: bool) -> Result<()> {
    let mut names: Vec<&String> = match only {
        Some(name) => vec![settings
            .jobs
            .get_key_value(name)
            .map(|(k, _)| k)
            .ok_or_else(|| anyhow!("unknown job {name}"))?],
        None => settings.jobs.keys().collect(),
    };
    names.sort();
    for name in names {
        let job = &settings.jobs[name];
        let warehouse: Arc<dyn Warehouse> = if dry_run {
            Arc::new(MemoryWarehouse::new())
        } else {
            Arc::new(ClickhouseWarehouse::new(&job.clickhouse_url))
        };
        let source = get_source(&job.source, job.custom.clone())
            .with_context(|| format!("failed to create source for job {name}"))?;
        info!(job = %name, source = %source.get_name(), warehouse = %warehouse.get_name(), "starting");
        let mut ingester = Ingester::from_job(job, source, warehouse);
        match ingester.run(&job.partitions()).await {
            Ok(reports) => summarize(name, &reports),
            Err(halted) => {
                summarize(name, &halted.reports);
                return Err(halted.error).with_context(|| format!("job {name} halted"));
            }
        }
    }
    Ok(())
}

fn summarize(job: &str, reports: &[PartitionReport]) {
    for r in reports {
        let partition = r.partition.to_string();
        match &r.outcome {
            Outcome::Completed => info!(
                job,
                %partition,
                resumed_at = r.resumed_at,
                rows_written = r.rows_written,
                rows_dropped = r.rows_dropped,
                fetches = r.fetches,
                "completed"
            ),
            Outcome::Abandoned {
                phase,
                attempts,
                error,
            } => error!(
                job,
                %partition,
                ?phase,
                attempts,
                rows_written = r.rows_written,
                "abandoned, retries exhausted: {error}"
            ),
            Outcome::Skipped { reason } => warn!(job, %partition, "skipped: {reason}"),
        }
    }
}

async fn check(job: &Job, table: Option<&str>) -> Result<()> {
    let warehouse: Arc<dyn Warehouse> = Arc::new(ClickhouseWarehouse::new(&job.clickhouse_url));
    let partition_column = job.partition_column();
    for table in tables(job, table) {
        println!("--- {table}");
        match &job.natural_key {
            Some(key) => {
                let report = compactor::duplicates(&warehouse, table, key).await?;
                println!("rows: {}", report.total);
                println!("distinct {key}: {}", report.distinct);
                println!("duplicates: {}", report.duplicates);
                println!("null {key} (removed by compact): {}", report.null_keys);
            }
            None => println!("rows: {}", warehouse.count(table, None).await?),
        }
        for (partition, rows) in warehouse.partition_counts(table, partition_column).await? {
            println!("{partition_column} {partition}: {rows}");
        }
    }
    Ok(())
}

async fn compact(job: &Job, table: Option<&str>, key: Option<&str>, batch_size: u64) -> Result<()> {
    let key = key
        .or(job.natural_key.as_deref())
        .ok_or_else(|| anyhow!("no natural key configured, pass --key"))?;
    let warehouse: Arc<dyn Warehouse> = Arc::new(ClickhouseWarehouse::new(&job.clickhouse_url));
    for table in tables(job, table) {
        let removed = compactor::compact(&warehouse, table, key, batch_size)
            .await
            .with_context(|| format!("compacting {table}"))?;
        println!("{table}: removed {removed} duplicate rows");
    }
    Ok(())
}
