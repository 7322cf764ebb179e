//! Socrata open-data (SODA) API, paged with `$limit`/`$offset`.
//!
//! One partition is one calendar year of the dataset, selected by a half-open
//! range on the timestamp field and read in ascending timestamp order, with
//! the Socrata row id breaking ties so offsets stay stable between calls.
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{
    header::{HeaderMap, HeaderValue},
    Client, StatusCode,
};
use serde::Deserialize;
use tracing::debug;

use crate::{
    error::SourceError,
    record::{Page, Partition, RawRecord},
};

#[derive(Deserialize, Debug, Clone)]
pub struct SocrataSettings {
    /// e.g. `data.cityofchicago.org`
    pub domain: String,
    /// dataset identifier, e.g. `ijzp-q8t2`
    pub dataset: String,
    pub app_token: Option<String>,
    /// field used for the year range and ordering (default: `date`)
    #[serde(default = "default_timestamp_field")]
    pub timestamp_field: String,
    /// request timeout (default: 30s)
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    /// base URL override, mostly for pointing at a local mirror (default: `https://{domain}`)
    pub base_url: Option<String>,
}

fn default_timestamp_field() -> String {
    String::from("date")
}

fn default_timeout() -> u64 {
    30
}

pub struct SocrataSource {
    client: Client,
    endpoint: String,
    timestamp_field: String,
}

impl SocrataSource {
    pub fn new(settings: SocrataSettings) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &settings.app_token {
            headers.insert("X-App-Token", HeaderValue::from_str(token).context("invalid app token")?);
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_seconds))
            .default_headers(headers)
            .build()
            .context("building http client")?;
        let base = settings
            .base_url
            .clone()
            .unwrap_or_else(|| format!("https://{}", settings.domain));
        Ok(SocrataSource {
            client,
            endpoint: format!("{}/resource/{}.json", base.trim_end_matches('/'), settings.dataset),
            timestamp_field: settings.timestamp_field,
        })
    }
}

/// SoQL parameters selecting one page of one year.
pub fn query_params(
    timestamp_field: &str,
    year: i32,
    cursor: u64,
    page_size: usize,
) -> Vec<(&'static str, String)> {
    vec![
        (
            "$where",
            format!(
                "{timestamp_field} >= '{year}-01-01T00:00:00' AND {timestamp_field} < '{}-01-01T00:00:00'",
                year + 1
            ),
        ),
        ("$order", format!("{timestamp_field} ASC, :id ASC")),
        ("$limit", page_size.to_string()),
        ("$offset", cursor.to_string()),
    ]
}

/// Rate limiting and server-side failures are worth another try; other rejections are not.
pub fn classify_status(status: StatusCode) -> Option<SourceError> {
    if status.is_success() {
        None
    } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Some(SourceError::Transient(format!("upstream answered {status}")))
    } else {
        Some(SourceError::Fatal(format!("upstream rejected query: {status}")))
    }
}

#[async_trait]
impl super::Source for SocrataSource {
    fn get_name(&self) -> String {
        String::from("socrata")
    }

    async fn fetch(
        &mut self,
        partition: &Partition,
        cursor: u64,
        page_size: usize,
    ) -> Result<Page, SourceError> {
        let params = query_params(&self.timestamp_field, partition.year, cursor, page_size);
        debug!(endpoint = %self.endpoint, ?params, "fetching page");
        let resp = self.client.get(&self.endpoint).query(&params).send().await?;
        if let Some(err) = classify_status(resp.status()) {
            return Err(err);
        }
        let records: Vec<RawRecord> = resp
            .json()
            .await
            .map_err(|e| SourceError::Transient(format!("decoding page: {e}")))?;
        Ok(Page::new(records, page_size))
    }
}
