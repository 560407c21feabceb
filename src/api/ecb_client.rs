use futures::stream::{self, StreamExt};
use reqwest::Client;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};
use url::Url;

use crate::errors::IngestError;
use crate::models::{Config, DateWindow, RawObservation, WorkItem, SOURCE_ECB};
use super::{ObservationStream, RateSource, SourceFailure};

const DAILY: &str = "D";

/// Column positions of the fields we read from the statistical feed
struct FeedColumns {
    freq: usize,
    base: usize,
    target: usize,
    period: usize,
    value: usize,
}

impl FeedColumns {
    fn locate(headers: &csv::StringRecord) -> Result<Self, String> {
        let find = |name: &str| {
            headers
                .iter()
                .position(|header| header.trim() == name)
                .ok_or_else(|| format!("missing column {}", name))
        };
        Ok(Self {
            freq: find("FREQ")?,
            base: find("CURRENCY")?,
            target: find("CURRENCY_DENOM")?,
            period: find("TIME_PERIOD")?,
            value: find("OBS_VALUE")?,
        })
    }
}

/// Central-bank statistical feed client.
///
/// Downloads one CSV per (yesterday, today) window into the cache directory
/// and skips the download when the window file is already there.
pub struct EcbClient {
    client: Client,
    base_url: String,
    cache_dir: PathBuf,
}

impl EcbClient {
    pub fn new(config: &Config, client: Client) -> Self {
        Self {
            client,
            base_url: config.ecb_base_url.clone(),
            cache_dir: config.cache_dir.clone(),
        }
    }

    pub fn window_url(&self, window: &DateWindow) -> String {
        let start = window.start.format("%Y-%m-%d").to_string();
        let end = window.end.format("%Y-%m-%d").to_string();
        let params = [
            ("startPeriod", start.as_str()),
            ("endPeriod", end.as_str()),
            ("format", "csvdata"),
        ];
        match Url::parse_with_params(&self.base_url, &params) {
            Ok(url) => url.to_string(),
            Err(_) => format!("{}?startPeriod={}&endPeriod={}&format=csvdata", self.base_url, start, end),
        }
    }

    pub fn window_path(&self, window: &DateWindow) -> PathBuf {
        self.cache_dir.join(window.file_name())
    }

    /// Make sure the window file exists locally. Returns its path and whether
    /// a download happened.
    pub async fn ensure_window_file(&self, window: &DateWindow) -> Result<(PathBuf, bool), IngestError> {
        let path = self.window_path(window);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            info!("📁 Window file {} already present, skipping download", path.display());
            return Ok((path, false));
        }

        let url = self.window_url(window);
        self.download(&url, &path).await?;
        Ok((path, true))
    }

    async fn download(&self, url: &str, path: &Path) -> Result<(), IngestError> {
        info!("📥 Downloading {} to {}", url, path.display());

        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| IngestError::from_transport(url, &e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(IngestError::from_status(url, status.as_u16()));
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let partial = path.with_extension("csv.part");
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut written = 0usize;
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    file.write_all(&chunk).await?;
                    written += chunk.len();
                }
                Ok(None) => break,
                Err(e) => {
                    drop(file);
                    let _ = tokio::fs::remove_file(&partial).await;
                    return Err(IngestError::from_transport(url, &e));
                }
            }
        }
        file.flush().await?;
        drop(file);

        tokio::fs::rename(&partial, path).await?;
        debug!("Downloaded {} bytes from {}", written, url);
        Ok(())
    }

    /// Read the daily rows of a bulk-format CSV file
    pub async fn read_file(&self, path: &Path) -> Result<Vec<RawObservation>, IngestError> {
        let bytes = tokio::fs::read(path).await?;
        let origin = path.display().to_string();
        parse_feed(&bytes, &origin).map_err(|message| IngestError::parse(origin.clone(), message))
    }

    async fn load(&self, item: &WorkItem) -> Result<Vec<RawObservation>, IngestError> {
        match item {
            WorkItem::BulkWindow(window) => {
                let (path, _) = self.ensure_window_file(window).await?;
                self.read_file(&path).await
            }
            WorkItem::File(path) => self.read_file(path).await,
            other => Err(IngestError::Config(format!("bulk source cannot fetch {}", other.label()))),
        }
    }
}

impl RateSource for EcbClient {
    fn source_tag(&self) -> &'static str {
        SOURCE_ECB
    }

    fn observations<'a>(&'a self, item: &'a WorkItem) -> ObservationStream<'a> {
        stream::once(async move {
            match self.load(item).await {
                Ok(rows) => {
                    info!("📊 {}: {} daily rows", item.label(), rows.len());
                    rows.into_iter().map(Ok).collect::<Vec<_>>()
                }
                Err(error) => {
                    error!("❌ {}: {}, nothing ingested from it", item.label(), error);
                    vec![Err(SourceFailure {
                        item: item.label(),
                        date: None,
                        skipped: 0,
                        error,
                    })]
                }
            }
        })
        .flat_map(stream::iter)
        .boxed()
    }
}

/// Parse the feed CSV, keeping only daily observations
pub fn parse_feed(bytes: &[u8], origin: &str) -> Result<Vec<RawObservation>, String> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(bytes);
    let headers = reader.headers().map_err(|e| e.to_string())?.clone();
    let columns = FeedColumns::locate(&headers)?;

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| e.to_string())?;
        let field = |index: usize| record.get(index).unwrap_or("").trim().to_string();

        if field(columns.freq) != DAILY {
            continue;
        }
        rows.push(RawObservation {
            source: SOURCE_ECB,
            base: field(columns.base),
            target: field(columns.target),
            date: field(columns.period),
            value: field(columns.value),
            origin: origin.to_string(),
        });
    }
    Ok(rows)
}
