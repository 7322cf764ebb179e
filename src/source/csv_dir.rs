//! Per-year directories of delimited extracts, one file per table:
//! `data_dir/IL-2021/nibrs_incident.csv`.
use std::{fs::File, path::PathBuf};

use anyhow::anyhow;
use async_trait::async_trait;
use csv::{Reader, ReaderBuilder, StringRecord};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::{
    error::SourceError,
    record::{Page, Partition, RawRecord},
};

#[derive(Deserialize, Debug, Clone)]
pub struct CsvDirSettings {
    pub data_dir: PathBuf,
    /// name of the per-year directory, `{year}` is substituted (default: `IL-{year}`)
    #[serde(default = "default_dir_pattern")]
    pub dir_pattern: String,
    #[serde(default = "default_extension")]
    pub extension: String,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
}

fn default_dir_pattern() -> String {
    String::from("IL-{year}")
}

fn default_extension() -> String {
    String::from("csv")
}

fn default_delimiter() -> char {
    ','
}

/// File currently being read, kept between fetches so consecutive pages are
/// read as successive chunks instead of rescanning from the top.
struct OpenFile {
    partition: Partition,
    reader: Reader<File>,
    headers: Vec<String>,
    position: u64,
}

impl OpenFile {
    fn skip(&mut self, n: u64) -> Result<(), SourceError> {
        let mut record = StringRecord::new();
        while self.position < n {
            if !self.reader.read_record(&mut record)? {
                break;
            }
            self.position += 1;
        }
        Ok(())
    }

    fn read(&mut self, n: usize) -> Result<Vec<RawRecord>, SourceError> {
        let mut records = Vec::with_capacity(n);
        let mut record = StringRecord::new();
        while records.len() < n && self.reader.read_record(&mut record)? {
            self.position += 1;
            records.push(
                self.headers
                    .iter()
                    .zip(record.iter())
                    .map(|(h, v)| (h.clone(), cell(v)))
                    .collect(),
            );
        }
        Ok(records)
    }
}

/// Empty cells are nulls, everything else is text.
/// Headers carry no types and code columns mix digits with letters
/// (`220`, `13A`), so kinds are left to the destination schema.
fn cell(value: &str) -> Value {
    if value.trim().is_empty() {
        Value::Null
    } else {
        Value::String(value.to_owned())
    }
}

pub struct CsvDirSource {
    settings: CsvDirSettings,
    delimiter: u8,
    open: Option<OpenFile>,
}

impl CsvDirSource {
    pub fn new(settings: CsvDirSettings) -> anyhow::Result<Self> {
        let delimiter = u8::try_from(settings.delimiter)
            .map_err(|_| anyhow!("delimiter {:?} is not a single byte", settings.delimiter))?;
        Ok(CsvDirSource {
            settings,
            delimiter,
            open: None,
        })
    }

    pub fn path_for(&self, partition: &Partition) -> PathBuf {
        self.settings
            .data_dir
            .join(
                self.settings
                    .dir_pattern
                    .replace("{year}", &partition.year.to_string()),
            )
            .join(format!("{}.{}", partition.table, self.settings.extension))
    }

    fn open_file(&self, partition: &Partition) -> Result<OpenFile, SourceError> {
        let path = self.path_for(partition);
        if let Some(dir) = path.parent() {
            if !dir.is_dir() {
                return Err(SourceError::Fatal(format!("missing directory {}", dir.display())));
            }
        }
        if !path.is_file() {
            return Err(SourceError::Fatal(format!("missing file {}", path.display())));
        }
        debug!(path = %path.display(), "opening");
        let mut reader = ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(true)
            .from_path(&path)?;
        let headers = reader.headers()?.iter().map(str::to_owned).collect();
        Ok(OpenFile {
            partition: partition.clone(),
            reader,
            headers,
            position: 0,
        })
    }
}

#[async_trait]
impl super::Source for CsvDirSource {
    fn get_name(&self) -> String {
        String::from("csv_dir")
    }

    async fn fetch(
        &mut self,
        partition: &Partition,
        cursor: u64,
        page_size: usize,
    ) -> Result<Page, SourceError> {
        let mut file = match self.open.take() {
            Some(f) if f.partition == *partition && f.position == cursor => f,
            _ => {
                let mut f = self.open_file(partition)?;
                f.skip(cursor)?;
                f
            }
        };
        let records = file.read(page_size)?;
        if records.len() == page_size {
            self.open = Some(file);
        }
        Ok(Page::new(records, page_size))
    }
}
