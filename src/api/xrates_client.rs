use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use reqwest::Client;
use polars::prelude::{Column, DataFrame, NamedFrom, ParquetReader, ParquetWriter, SerReader};
use scraper::{ElementRef, Html, Selector};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};
use url::Url;

use crate::errors::{FailureCause, IngestError};
use crate::models::{AbortPolicy, Config, RawObservation, WorkItem, SOURCE_XRATES};
use super::{ObservationStream, RateSource, RequestThrottle, SourceFailure};

/// One row of the historical rate table, also one row of the day's cache file
#[derive(Debug, Clone, PartialEq)]
pub struct RateRow {
    pub target: String,
    pub rate: String,
    pub inverse: String,
}

/// Historical rate website client.
///
/// One page per (code, date); every page is cached under
/// `{cache_dir}/{code}/{date}.parquet` and read back instead of refetched.
pub struct XRatesClient {
    client: Client,
    base_url: String,
    cache_dir: PathBuf,
    throttle: RequestThrottle,
    policy: AbortPolicy,
}

impl XRatesClient {
    pub fn new(config: &Config, client: Client, throttle: RequestThrottle) -> Self {
        Self {
            client,
            base_url: config.historical_base_url.clone(),
            cache_dir: config.cache_dir.clone(),
            throttle,
            policy: config.abort_policy,
        }
    }

    pub fn day_url(&self, code: &str, date: NaiveDate) -> String {
        let date = date.format("%Y-%m-%d").to_string();
        match Url::parse_with_params(&self.base_url, &[("from", code), ("amount", "1"), ("date", date.as_str())]) {
            Ok(url) => url.to_string(),
            Err(_) => format!("{}?from={}&amount=1&date={}", self.base_url, code, date),
        }
    }

    pub fn cache_path(&self, code: &str, date: NaiveDate) -> PathBuf {
        self.cache_dir
            .join(code)
            .join(format!("{}.parquet", date.format("%Y-%m-%d")))
    }

    /// Rows for one day, from the cache when present
    pub async fn fetch_day(&self, code: &str, date: NaiveDate) -> Result<Vec<RateRow>, IngestError> {
        let cache_path = self.cache_path(code, date);
        if tokio::fs::try_exists(&cache_path).await.unwrap_or(false) {
            debug!("Cache hit for {} {}: {}", code, date, cache_path.display());
            return read_cached_rows(&cache_path).await;
        }

        let url = self.day_url(code, date);
        let body = self.download_page(&url).await?;
        let rows = parse_rate_table(&body).map_err(|message| IngestError::parse(url.clone(), message))?;

        write_cached_rows(&cache_path, &rows).await?;
        debug!("Fetched {} rows for {} {}", rows.len(), code, date);
        Ok(rows)
    }

    async fn download_page(&self, url: &str) -> Result<String, IngestError> {
        self.throttle.wait().await;
        debug!("Making request to: {}", url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| IngestError::from_transport(url, &e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(IngestError::from_status(url, status.as_u16()));
        }

        response.text().await.map_err(|e| IngestError::from_transport(url, &e))
    }

    fn should_abort(&self, error: &IngestError) -> bool {
        match self.policy {
            AbortPolicy::AnyFailure => true,
            AbortPolicy::BlockedOnly => error.failure_cause() == FailureCause::Blocked,
        }
    }

    fn historical_stream<'a>(&'a self, code: &'a str, dates: &'a [NaiveDate]) -> ObservationStream<'a> {
        struct State {
            next: usize,
            pending: VecDeque<Result<RawObservation, SourceFailure>>,
            finished: bool,
        }

        let initial = State {
            next: 0,
            pending: VecDeque::new(),
            finished: false,
        };

        stream::unfold(initial, move |mut state| async move {
            loop {
                if let Some(item) = state.pending.pop_front() {
                    return Some((item, state));
                }
                if state.finished || state.next >= dates.len() {
                    return None;
                }

                let date = dates[state.next];
                state.next += 1;

                match self.fetch_day(code, date).await {
                    Ok(rows) => {
                        let origin = self.day_url(code, date);
                        state.pending.extend(rows.into_iter().map(|row| {
                            Ok(RawObservation {
                                source: SOURCE_XRATES,
                                base: code.to_string(),
                                target: row.target,
                                date: date.format("%Y-%m-%d").to_string(),
                                value: row.rate,
                                origin: origin.clone(),
                            })
                        }));
                    }
                    Err(error) => {
                        let cause = error.failure_cause();
                        let skipped = if self.should_abort(&error) {
                            state.finished = true;
                            dates.len() - state.next
                        } else {
                            0
                        };

                        if skipped > 0 {
                            error!(
                                "❌ {} {}: {} ({}), abandoning {} remaining dates",
                                code, date, error, cause, skipped
                            );
                        } else {
                            warn!("⚠️ {} {}: {} ({}), date skipped", code, date, error, cause);
                        }

                        state.pending.push_back(Err(SourceFailure {
                            item: code.to_string(),
                            date: Some(date),
                            skipped,
                            error,
                        }));
                    }
                }
            }
        })
        .boxed()
    }
}

impl RateSource for XRatesClient {
    fn source_tag(&self) -> &'static str {
        SOURCE_XRATES
    }

    fn observations<'a>(&'a self, item: &'a WorkItem) -> ObservationStream<'a> {
        match item {
            WorkItem::Historical { code, dates } => self.historical_stream(code, dates),
            other => {
                let failure = SourceFailure {
                    item: other.label(),
                    date: None,
                    skipped: 0,
                    error: IngestError::Config(format!("historical source cannot fetch {}", other.label())),
                };
                stream::once(async move { Err::<RawObservation, SourceFailure>(failure) }).boxed()
            }
        }
    }
}

fn selector(css: &str) -> Result<Selector, String> {
    Selector::parse(css).map_err(|e| format!("invalid selector {}: {:?}", css, e))
}

fn cell_text(cell: &ElementRef<'_>) -> String {
    cell.text().collect::<String>().trim().to_string()
}

/// Pull the quote code out of a rate link such as `/graph/?from=USD&to=ARS`
fn target_code(href: &str) -> Option<String> {
    let base = Url::parse("https://www.x-rates.com/").ok()?;
    let url = base.join(href).ok()?;
    url.query_pairs()
        .find(|(key, _)| key == "to")
        .map(|(_, value)| value.trim().to_uppercase())
        .filter(|code| !code.is_empty())
}

/// Parse the rate table out of a historical page.
///
/// The page carries two tables; the second lists every currency with the rate
/// for one unit of the base and the inverse rate.
pub fn parse_rate_table(html: &str) -> Result<Vec<RateRow>, String> {
    let document = Html::parse_document(html);
    let table_selector = selector("table")?;
    let row_selector = selector("tr")?;
    let cell_selector = selector("td")?;
    let link_selector = selector("a")?;

    let table = document
        .select(&table_selector)
        .nth(1)
        .ok_or_else(|| "expected at least two tables".to_string())?;

    let mut rows = Vec::new();
    for row in table.select(&row_selector) {
        let cells: Vec<ElementRef<'_>> = row.select(&cell_selector).collect();
        if cells.is_empty() {
            continue; // header row
        }
        if cells.len() < 3 {
            return Err(format!("row has {} cells, expected 3", cells.len()));
        }

        let href = cells[1]
            .select(&link_selector)
            .next()
            .and_then(|link| link.value().attr("href"))
            .ok_or_else(|| format!("no rate link for {}", cell_text(&cells[0])))?;
        let target = target_code(href).ok_or_else(|| format!("no target code in link {}", href))?;

        rows.push(RateRow {
            target,
            rate: cell_text(&cells[1]),
            inverse: cell_text(&cells[2]),
        });
    }

    if rows.is_empty() {
        return Err("rate table has no rows".to_string());
    }
    Ok(rows)
}

async fn read_cached_rows(path: &Path) -> Result<Vec<RateRow>, IngestError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || read_parquet(&path))
        .await
        .map_err(|e| IngestError::Cache(format!("cache reader stopped: {}", e)))?
}

async fn write_cached_rows(path: &Path, rows: &[RateRow]) -> Result<(), IngestError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let path = path.to_path_buf();
    let rows = rows.to_vec();
    tokio::task::spawn_blocking(move || write_parquet(&path, &rows))
        .await
        .map_err(|e| IngestError::Cache(format!("cache writer stopped: {}", e)))?
}

fn rows_to_dataframe(rows: &[RateRow]) -> Result<DataFrame, String> {
    let targets: Vec<&str> = rows.iter().map(|row| row.target.as_str()).collect();
    let rates: Vec<&str> = rows.iter().map(|row| row.rate.as_str()).collect();
    let inverses: Vec<&str> = rows.iter().map(|row| row.inverse.as_str()).collect();

    DataFrame::new(vec![
        Column::new("target".into(), targets),
        Column::new("rate".into(), rates),
        Column::new("inverse".into(), inverses),
    ])
    .map_err(|e| format!("dataframe creation: {}", e))
}

fn dataframe_to_rows(df: &DataFrame) -> Result<Vec<RateRow>, String> {
    let text_column = |name: &str| {
        df.column(name)
            .and_then(|column| column.str())
            .map_err(|e| format!("{} column: {}", name, e))
    };
    let targets = text_column("target")?;
    let rates = text_column("rate")?;
    let inverses = text_column("inverse")?;

    (0..df.height())
        .map(|i| {
            let cell = |values: &polars::prelude::StringChunked, name: &str| {
                values
                    .get(i)
                    .map(str::to_string)
                    .ok_or_else(|| format!("null {} at row {}", name, i))
            };
            Ok(RateRow {
                target: cell(targets, "target")?,
                rate: cell(rates, "rate")?,
                inverse: cell(inverses, "inverse")?,
            })
        })
        .collect()
}

fn read_parquet(path: &Path) -> Result<Vec<RateRow>, IngestError> {
    let context = path.display().to_string();
    let file = std::fs::File::open(path)?;
    let df = ParquetReader::new(file)
        .finish()
        .map_err(|e| IngestError::parse(context.clone(), format!("read parquet: {}", e)))?;
    if df.height() == 0 {
        return Err(IngestError::parse(context, "empty cache file"));
    }
    dataframe_to_rows(&df).map_err(|message| IngestError::parse(context, message))
}

fn write_parquet(path: &Path, rows: &[RateRow]) -> Result<(), IngestError> {
    let mut df = rows_to_dataframe(rows).map_err(IngestError::Cache)?;

    // Never leave a half-written artifact under the final name
    let partial = path.with_extension("parquet.tmp");
    let file = std::fs::File::create(&partial)?;
    if let Err(e) = ParquetWriter::new(file).finish(&mut df) {
        let _ = std::fs::remove_file(&partial);
        return Err(IngestError::Cache(format!("write parquet {}: {}", partial.display(), e)));
    }
    std::fs::rename(&partial, path).map_err(|e| {
        let _ = std::fs::remove_file(&partial);
        IngestError::Io(e)
    })
}
