//! Source collector contracts + the open-data records API implementation.

use async_trait::async_trait;
use chrono::{Days, NaiveDate};
use serde::Deserialize;
use serde_json::{Map as JsonMap, Value as JsonValue};
use strata_core::{JobDescriptor, Lookback, RecordBatch, Value};
use strata_storage::{FetchError, HttpFetcher};
use thiserror::Error;
use tracing::info;

pub const DEFAULT_PAGE_SIZE: u32 = 10_000;

/// Day format the records API expects inside `q` filters.
pub const QUERY_DATE_FORMAT: &str = "%Y/%m/%d";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("fetching {dataset}: {source}")]
    Fetch {
        dataset: String,
        #[source]
        source: FetchError,
    },
    #[error("decoding response for {dataset}: {source}")]
    Decode {
        dataset: String,
        #[source]
        source: serde_json::Error,
    },
}

/// What a single sourcing run asks of the API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchWindow {
    /// One request for the whole dataset, bounded by the page size.
    Full,
    /// One request per day, filtered server-side on `date_column`.
    Days {
        days: Vec<NaiveDate>,
        date_column: String,
    },
}

impl FetchWindow {
    pub fn for_job(job: &JobDescriptor, today: NaiveDate) -> Self {
        match &job.lookback {
            Lookback::Disabled => FetchWindow::Full,
            Lookback::Days {
                days,
                source_date_column,
            } => FetchWindow::Days {
                days: lookback_days(today, *days),
                date_column: source_date_column.clone(),
            },
        }
    }
}

/// Calendar days `[today - days, today]`, oldest first, both ends included.
pub fn lookback_days(today: NaiveDate, days: u32) -> Vec<NaiveDate> {
    (0..=u64::from(days))
        .rev()
        .filter_map(|offset| today.checked_sub_days(Days::new(offset)))
        .collect()
}

#[async_trait]
pub trait RecordSource: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(&self, dataset: &str, window: &FetchWindow) -> Result<RecordBatch, SourceError>;
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    records: Vec<ApiRecord>,
}

#[derive(Debug, Deserialize)]
struct ApiRecord {
    fields: JsonMap<String, JsonValue>,
}

fn json_to_value(value: JsonValue) -> Value {
    match value {
        JsonValue::Null => Value::Null,
        JsonValue::Bool(v) => Value::Boolean(v),
        JsonValue::Number(n) => match n.as_i64() {
            Some(v) => Value::Integer(v),
            None => n.as_f64().map(Value::Real).unwrap_or(Value::Null),
        },
        JsonValue::String(v) => Value::Text(v),
        nested @ (JsonValue::Array(_) | JsonValue::Object(_)) => Value::Text(nested.to_string()),
    }
}

/// Flattens a `{records: [{fields: {...}}]}` response into a batch, one row per record.
pub fn parse_records(body: &[u8]) -> Result<RecordBatch, serde_json::Error> {
    let response: SearchResponse = serde_json::from_slice(body)?;
    Ok(RecordBatch::from_records(response.records.into_iter().map(
        |record| {
            record
                .fields
                .into_iter()
                .map(|(name, value)| (name, json_to_value(value)))
                .collect()
        },
    )))
}

/// Open-data portal records search API (`GET .../records/1.0/search/`).
#[derive(Debug, Clone)]
pub struct OpenDataApi {
    http: HttpFetcher,
    base_url: String,
    page_size: u32,
}

impl OpenDataApi {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>, page_size: u32) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            page_size,
        }
    }

    pub fn request_params(
        &self,
        dataset: &str,
        day: Option<(NaiveDate, &str)>,
    ) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("dataset", dataset.to_string()),
            ("rows", self.page_size.to_string()),
        ];
        match day {
            Some((day, date_column)) => {
                params.push((
                    "q",
                    format!("{date_column} = {}", day.format(QUERY_DATE_FORMAT)),
                ));
                params.push(("sort", date_column.to_string()));
            }
            None => params.push(("start", "0".to_string())),
        }
        params.push(("format", "json".to_string()));
        params.push(("timezone", "UTC".to_string()));
        params
    }

    async fn fetch_page(
        &self,
        dataset: &str,
        day: Option<(NaiveDate, &str)>,
    ) -> Result<RecordBatch, SourceError> {
        let params = self.request_params(dataset, day);
        let response = self
            .http
            .fetch_bytes(&self.base_url, &params)
            .await
            .map_err(|source| SourceError::Fetch {
                dataset: dataset.to_string(),
                source,
            })?;
        parse_records(&response.body).map_err(|source| SourceError::Decode {
            dataset: dataset.to_string(),
            source,
        })
    }
}

#[async_trait]
impl RecordSource for OpenDataApi {
    fn name(&self) -> &str {
        "open-data-api"
    }

    async fn fetch(&self, dataset: &str, window: &FetchWindow) -> Result<RecordBatch, SourceError> {
        match window {
            FetchWindow::Full => {
                let batch = self.fetch_page(dataset, None).await?;
                info!(dataset, rows = batch.len(), "fetched full dataset");
                Ok(batch)
            }
            FetchWindow::Days { days, date_column } => {
                info!(dataset, days = days.len(), date_column = %date_column, "collecting lookback window");
                let mut batches = Vec::with_capacity(days.len());
                for day in days {
                    let batch = self
                        .fetch_page(dataset, Some((*day, date_column.as_str())))
                        .await?;
                    info!(dataset, %day, rows = batch.len(), "fetched lookback day");
                    batches.push(batch);
                }
                Ok(RecordBatch::concat(batches))
            }
        }
    }
}
