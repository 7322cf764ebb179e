//! The ingestion loop.
//!
//! Every partition runs through a small state machine:
//!
//! ```text
//! CheckResume -> Fetch -> Normalize -> Write -> Advance -> Fetch | Done
//!                  |                     |
//!                  +-> RetryWait(phase) <-+   (transient failure)
//!                  +-> Abort | Halt           (retries exhausted)
//!                  +-> Skip                   (fatal source failure)
//! ```
//!
//! [transition] decides the next step from the current one and what just
//! happened; [Ingester] performs the I/O for each step.
use std::{sync::Arc, time::Duration};

use serde::Deserialize;
use tokio::time::sleep;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    error::{Halted, IngestError, SourceError, WriteFailure},
    normalizer::Normalizer,
    record::{CanonicalRow, Page, Partition, TableSchema},
    resume::ResumeTracker,
    settings::Job,
    source::Source,
    warehouse::Warehouse,
    writer::Writer,
};

/// What happens once a fetch or write has failed more than the retry limit.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OnExhausted {
    /// give up on the partition, continue with the next one
    Abort,
    /// stop the whole run
    Halt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// retries after the first attempt
    pub limit: u32,
    pub backoff: Duration,
    pub on_exhausted: OnExhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Fetch,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    CheckResume,
    Fetch,
    Normalize,
    Write,
    Advance,
    RetryWait(Phase),
    Done,
    Skip,
    Abort(Phase),
    Halt(Phase),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Resumed,
    Fetched,
    Normalized,
    Written,
    Advanced { fully_consumed: bool },
    /// `attempts` failed attempts so far for the current page
    Failed { attempts: u32 },
    Fatal,
    Waited,
}

/// Next step of the loop. Pure; panics on pairs the driver never produces.
pub fn transition(step: Step, event: Event, policy: &RetryPolicy) -> Step {
    match (step, event) {
        (Step::CheckResume, Event::Resumed) => Step::Fetch,
        (Step::CheckResume | Step::Fetch, Event::Fatal) => Step::Skip,
        (Step::Fetch, Event::Fetched) => Step::Normalize,
        (Step::Normalize, Event::Normalized) => Step::Write,
        (Step::Write, Event::Written) => Step::Advance,
        (Step::Advance, Event::Advanced { fully_consumed: true }) => Step::Done,
        (Step::Advance, Event::Advanced { fully_consumed: false }) => Step::Fetch,
        (Step::Fetch | Step::Write, Event::Failed { attempts }) => {
            let phase = if step == Step::Fetch { Phase::Fetch } else { Phase::Write };
            if attempts <= policy.limit {
                Step::RetryWait(phase)
            } else {
                match policy.on_exhausted {
                    OnExhausted::Abort => Step::Abort(phase),
                    OnExhausted::Halt => Step::Halt(phase),
                }
            }
        }
        (Step::RetryWait(Phase::Fetch), Event::Waited) => Step::Fetch,
        (Step::RetryWait(Phase::Write), Event::Waited) => Step::Write,
        (step, event) => unreachable!("no transition from {step:?} on {event:?}"),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// source exhausted
    Completed,
    /// retries ran out, partition left for the next run
    Abandoned {
        phase: Phase,
        attempts: u32,
        error: String,
    },
    /// source could not serve the partition at all
    Skipped { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionReport {
    pub partition: Partition,
    pub outcome: Outcome,
    /// cursor the partition started from
    pub resumed_at: u64,
    pub fetches: u32,
    pub rows_written: u64,
    pub rows_dropped: u64,
}

pub struct Ingester {
    source: Box<dyn Source>,
    tracker: ResumeTracker,
    warehouse: Arc<dyn Warehouse>,
    writer: Writer,
    normalizer: Normalizer,
    page_size: usize,
    policy: RetryPolicy,
}

impl Ingester {
    pub fn new(
        source: Box<dyn Source>,
        warehouse: Arc<dyn Warehouse>,
        normalizer: Normalizer,
        page_size: usize,
        chunk_size: usize,
        policy: RetryPolicy,
    ) -> Ingester {
        Ingester {
            source,
            tracker: ResumeTracker::new(warehouse.clone(), normalizer.partition_column()),
            writer: Writer::new(warehouse.clone(), chunk_size),
            warehouse,
            normalizer,
            page_size: page_size.max(1),
            policy,
        }
    }

    /// Wires an ingester for a configured job.
    pub fn from_job(job: &Job, source: Box<dyn Source>, warehouse: Arc<dyn Warehouse>) -> Ingester {
        let normalizer = Normalizer::new(
            job.partition_column(),
            job.timestamp_column.as_deref(),
            &job.composite_fields,
        );
        Ingester::new(
            source,
            warehouse,
            normalizer,
            job.page_size(),
            job.chunk_size(),
            job.retry_policy(),
        )
    }

    /// Loads partitions one after the other.
    /// Only a halt stops the run early; every other outcome is in the reports.
    pub async fn run(&mut self, partitions: &[Partition]) -> Result<Vec<PartitionReport>, Halted> {
        let mut reports = Vec::with_capacity(partitions.len());
        for partition in partitions {
            let span = info_span!("partition", table = %partition.table, year = partition.year);
            match self.ingest_partition(partition).instrument(span).await {
                Ok(report) => reports.push(report),
                Err(error) => return Err(Halted { reports, error }),
            }
        }
        Ok(reports)
    }

    pub async fn ingest_partition(&mut self, partition: &Partition) -> Result<PartitionReport, IngestError> {
        let mut report = PartitionReport {
            partition: partition.clone(),
            outcome: Outcome::Completed,
            resumed_at: 0,
            fetches: 0,
            rows_written: 0,
            rows_dropped: 0,
        };
        let mut step = Step::CheckResume;
        let mut cursor = 0u64;
        let mut attempts = 0u32;
        let mut schema: Option<TableSchema> = None;
        let mut page = Page::default();
        let mut rows: Vec<CanonicalRow> = Vec::new();
        // rows of the current page already durable
        let mut flushed = 0usize;
        let mut last_error = String::new();

        loop {
            let event = match step {
                Step::CheckResume => {
                    cursor = self.tracker.resume_offset(partition).await;
                    report.resumed_at = cursor;
                    match self.warehouse.schema(&partition.table).await {
                        Ok(s) => {
                            schema = s;
                            Event::Resumed
                        }
                        Err(e) => {
                            last_error = format!("schema introspection: {e}");
                            Event::Fatal
                        }
                    }
                }
                Step::Fetch => {
                    report.fetches += 1;
                    match self.source.fetch(partition, cursor, self.page_size).await {
                        Ok(p) => {
                            page = p;
                            Event::Fetched
                        }
                        Err(SourceError::Transient(e)) => {
                            attempts += 1;
                            warn!(cursor, attempts, "fetch failed: {e}");
                            last_error = e;
                            Event::Failed { attempts }
                        }
                        Err(SourceError::Fatal(e)) => {
                            last_error = e;
                            Event::Fatal
                        }
                    }
                }
                Step::Normalize => {
                    rows = self.normalize_page(&page, partition, schema.as_ref(), &mut report);
                    flushed = 0;
                    Event::Normalized
                }
                Step::Write => match self.write_pending(partition, &mut schema, &rows[flushed..]).await {
                    Ok(n) => {
                        flushed += n as usize;
                        report.rows_written += n;
                        Event::Written
                    }
                    Err(WriteFailure { written, source }) => {
                        flushed += written as usize;
                        report.rows_written += written;
                        attempts += 1;
                        warn!(cursor, attempts, pending = rows.len() - flushed, "write failed: {source}");
                        last_error = source.to_string();
                        Event::Failed { attempts }
                    }
                },
                Step::Advance => {
                    cursor += page.records.len() as u64;
                    attempts = 0;
                    info!(cursor, rows_written = report.rows_written, "page written");
                    Event::Advanced {
                        fully_consumed: page.fully_consumed,
                    }
                }
                Step::RetryWait(phase) => {
                    debug!(?phase, backoff = ?self.policy.backoff, "waiting before retry");
                    sleep(self.policy.backoff).await;
                    Event::Waited
                }
                Step::Done => {
                    info!(rows_written = report.rows_written, "partition complete");
                    return Ok(report);
                }
                Step::Skip => {
                    warn!("skipping partition: {last_error}");
                    report.outcome = Outcome::Skipped { reason: last_error };
                    return Ok(report);
                }
                Step::Abort(phase) => {
                    error!(?phase, attempts, rows_written = report.rows_written, "retries exhausted, abandoning partition: {last_error}");
                    report.outcome = Outcome::Abandoned {
                        phase,
                        attempts,
                        error: last_error,
                    };
                    return Ok(report);
                }
                Step::Halt(phase) => {
                    error!(?phase, attempts, rows_written = report.rows_written, "retries exhausted, halting: {last_error}");
                    return Err(IngestError::RetriesExhausted {
                        partition: partition.to_string(),
                        phase,
                        attempts,
                        last_error,
                    });
                }
            };
            step = transition(step, event, &self.policy);
        }
    }

    fn normalize_page(
        &self,
        page: &Page,
        partition: &Partition,
        schema: Option<&TableSchema>,
        report: &mut PartitionReport,
    ) -> Vec<CanonicalRow> {
        let mut rows = Vec::with_capacity(page.records.len());
        for raw in &page.records {
            match self.normalizer.normalize(raw, partition, schema) {
                Ok(row) => rows.push(row),
                Err(e) => {
                    report.rows_dropped += 1;
                    debug!("dropping record: {e}");
                }
            }
        }
        if rows.len() < page.records.len() {
            warn!(dropped = page.records.len() - rows.len(), "records dropped during normalization");
        }
        rows
    }

    /// Writes `rows`, creating the table from them first if it does not exist yet.
    async fn write_pending(
        &self,
        partition: &Partition,
        schema: &mut Option<TableSchema>,
        rows: &[CanonicalRow],
    ) -> Result<u64, WriteFailure> {
        if rows.is_empty() {
            return Ok(0);
        }
        if schema.is_none() {
            let created = self
                .writer
                .ensure_table(&partition.table, rows, self.normalizer.partition_column())
                .await
                .map_err(|source| WriteFailure { written: 0, source })?;
            *schema = Some(created);
        }
        match schema {
            Some(s) => self.writer.append(&partition.table, s, rows).await,
            None => Ok(0),
        }
    }
}
