use chrono::{Duration as ChronoDuration, NaiveDate};
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::{DeliveryFailureKind, IngestError};

/// Source tag for the historical rate website
pub const SOURCE_XRATES: &str = "XRATES";
/// Source tag for the central-bank statistical feed
pub const SOURCE_ECB: &str = "ECB";

/// One unvalidated record as it came out of a source
#[derive(Debug, Clone, PartialEq)]
pub struct RawObservation {
    pub source: &'static str,
    pub base: String,
    pub target: String,
    pub date: String,
    pub value: String,
    /// URL or file the row was read from, kept for failure logs
    pub origin: String,
}

/// Canonical exchange rate, ready for delivery.
///
/// `precision >= scale`; both count digits of the observed text, while
/// `value` holds the canonical decimal with exactly `scale` fractional digits.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRate {
    pub base: String,
    pub target: String,
    pub date: NaiveDate,
    pub source: String,
    pub value: Decimal,
    pub precision: u32,
    pub scale: u32,
}

/// Inclusive calendar window, used for the bulk feed download
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    /// Yesterday through `today`
    pub fn ending_on(today: NaiveDate) -> Self {
        Self {
            start: today - ChronoDuration::days(1),
            end: today,
        }
    }

    pub fn days_count(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    /// Cache file name shared by every run inside the same window
    pub fn file_name(&self) -> String {
        format!("ecb_{}_{}.csv", self.start.format("%Y-%m-%d"), self.end.format("%Y-%m-%d"))
    }
}

/// A unit of fetch work scheduled by the orchestrator
#[derive(Debug, Clone, PartialEq)]
pub enum WorkItem {
    /// One entity code and its dates, ascending
    Historical { code: String, dates: Vec<NaiveDate> },
    /// Bulk feed download for a window
    BulkWindow(DateWindow),
    /// Bulk-format CSV already on disk
    File(PathBuf),
}

impl WorkItem {
    pub fn label(&self) -> String {
        match self {
            WorkItem::Historical { code, dates } => format!("{} ({} dates)", code, dates.len()),
            WorkItem::BulkWindow(window) => window.file_name(),
            WorkItem::File(path) => path.display().to_string(),
        }
    }
}

/// Result of pushing one rate to the sink
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Delivered {
        rate: NormalizedRate,
        status: u16,
    },
    Failed {
        rate: NormalizedRate,
        kind: DeliveryFailureKind,
        status: Option<u16>,
        body: String,
    },
}

impl DeliveryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }

    pub fn rate(&self) -> &NormalizedRate {
        match self {
            DeliveryOutcome::Delivered { rate, .. } | DeliveryOutcome::Failed { rate, .. } => rate,
        }
    }

    pub fn failure_kind(&self) -> Option<DeliveryFailureKind> {
        match self {
            DeliveryOutcome::Delivered { .. } => None,
            DeliveryOutcome::Failed { kind, .. } => Some(*kind),
        }
    }
}

/// What to do with the remaining dates of a code after one date fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AbortPolicy {
    /// Abandon the code on the first failure of any kind
    #[default]
    AnyFailure,
    /// Abandon the code only when the source blocks us; skip other failed dates
    BlockedOnly,
}

impl FromStr for AbortPolicy {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "any-failure" | "any" => Ok(AbortPolicy::AnyFailure),
            "blocked-only" | "blocked" => Ok(AbortPolicy::BlockedOnly),
            other => Err(IngestError::Config(format!("unknown ABORT_POLICY {:?}", other))),
        }
    }
}

/// Configuration for the application
#[derive(Debug, Clone)]
pub struct Config {
    pub sink_base_url: String,
    pub sink_token: String,
    pub sink_max_connections: usize,
    pub fetch_workers: usize,
    pub fetch_rate_limit_per_minute: u32,
    pub request_timeout: Duration,
    pub cache_dir: PathBuf,
    pub historical_base_url: String,
    pub ecb_base_url: String,
    pub historical_epoch: NaiveDate,
    pub currencies_path: PathBuf,
    pub log_file: PathBuf,
    pub abort_policy: AbortPolicy,
}

impl Config {
    /// Defaults for everything except the sink location and credential
    pub fn new(sink_base_url: impl Into<String>, sink_token: impl Into<String>) -> Self {
        Config {
            sink_base_url: sink_base_url.into(),
            sink_token: sink_token.into(),
            sink_max_connections: 32,
            fetch_workers: 16,
            fetch_rate_limit_per_minute: 0,
            request_timeout: Duration::from_secs(30),
            cache_dir: PathBuf::from("data/exchange_rates"),
            historical_base_url: "https://www.x-rates.com/historical/".to_string(),
            ecb_base_url: "https://data-api.ecb.europa.eu/service/data/EXR/".to_string(),
            historical_epoch: NaiveDate::from_ymd_opt(2014, 1, 1).unwrap_or_default(),
            currencies_path: PathBuf::from("currencies.csv"),
            log_file: PathBuf::from("jobs.log"),
            abort_policy: AbortPolicy::AnyFailure,
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, IngestError> {
        dotenvy::dotenv().ok(); // Load .env file if it exists

        let sink_token = std::env::var("SINK_TOKEN")
            .map_err(|_| IngestError::Config("SINK_TOKEN environment variable required".to_string()))?;
        let sink_base_url =
            std::env::var("SINK_BASE_URL").unwrap_or_else(|_| "http://127.0.0.1:8000/".to_string());
        let defaults = Config::new(sink_base_url, sink_token);

        let config = Config {
            sink_max_connections: env_parse("SINK_MAX_CONNECTIONS", defaults.sink_max_connections)?,
            fetch_workers: env_parse("FETCH_WORKERS", defaults.fetch_workers)?,
            fetch_rate_limit_per_minute: env_parse(
                "FETCH_RATE_LIMIT_PER_MINUTE",
                defaults.fetch_rate_limit_per_minute,
            )?,
            request_timeout: Duration::from_secs(env_parse(
                "REQUEST_TIMEOUT_SECS",
                defaults.request_timeout.as_secs(),
            )?),
            cache_dir: env_parse("CACHE_DIR", defaults.cache_dir.clone())?,
            historical_base_url: std::env::var("HISTORICAL_BASE_URL")
                .unwrap_or_else(|_| defaults.historical_base_url.clone()),
            ecb_base_url: std::env::var("ECB_BASE_URL").unwrap_or_else(|_| defaults.ecb_base_url.clone()),
            historical_epoch: env_parse("HISTORICAL_EPOCH", defaults.historical_epoch)?,
            currencies_path: env_parse("CURRENCIES_PATH", defaults.currencies_path.clone())?,
            log_file: env_parse("LOG_FILE", defaults.log_file.clone())?,
            abort_policy: env_parse("ABORT_POLICY", defaults.abort_policy)?,
            ..defaults
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), IngestError> {
        if self.sink_token.trim().is_empty() {
            return Err(IngestError::Config("SINK_TOKEN must not be empty".to_string()));
        }
        if self.sink_max_connections == 0 {
            return Err(IngestError::Config("SINK_MAX_CONNECTIONS must be at least 1".to_string()));
        }
        if self.fetch_workers == 0 {
            return Err(IngestError::Config("FETCH_WORKERS must be at least 1".to_string()));
        }
        url::Url::parse(&self.sink_base_url)
            .map_err(|e| IngestError::Config(format!("SINK_BASE_URL {}: {}", self.sink_base_url, e)))?;
        Ok(())
    }
}

fn env_parse<T>(key: &str, default: T) -> Result<T, IngestError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| IngestError::Config(format!("{}={:?}: {}", key, raw, e))),
        Err(_) => Ok(default),
    }
}
