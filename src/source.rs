//! Manages source adapters
pub mod csv_dir;
pub mod socrata;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::{
    error::SourceError,
    record::{Page, Partition},
};

/// Source adapter: one upstream behind a paged `fetch`.
///
/// `cursor` is the number of records of `partition` already consumed.
/// Records must come back in the same order on every call, so that a growing
/// cursor never skips or repeats records of an unchanged upstream.
#[async_trait]
pub trait Source: Send {
    fn get_name(&self) -> String;
    async fn fetch(
        &mut self,
        partition: &Partition,
        cursor: u64,
        page_size: usize,
    ) -> Result<Page, SourceError>;
}

/// Creates source adapter of specified name.
/// If you add your own adapters, register them here
pub fn get_source(name: &str, source_settings: Option<toml::Value>) -> Result<Box<dyn Source>> {
    match name {
        "socrata" => match source_settings {
            Some(s) => Ok(Box::new(socrata::SocrataSource::new(s.try_into()?)?)),
            None => Err(anyhow!("socrata config missing")),
        },
        "csv_dir" => match source_settings {
            Some(s) => Ok(Box::new(csv_dir::CsvDirSource::new(s.try_into()?)?)),
            None => Err(anyhow!("csv_dir config missing")),
        },
        _ => Err(anyhow!("unknown source {}", name)),
    }
}
