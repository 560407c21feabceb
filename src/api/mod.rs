use futures::stream::BoxStream;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use chrono::NaiveDate;
use reqwest::Client;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::{FailureCause, IngestError};
use crate::models::{RawObservation, WorkItem};

pub mod ecb_client;
pub mod sink_client;
pub mod xrates_client;

pub use ecb_client::EcbClient;
pub use sink_client::{RateSink, SinkClient};
pub use xrates_client::XRatesClient;

const USER_AGENT: &str = "fx-rates-ingest/0.1";

/// Failure reported by a source stream for one work item
#[derive(Debug)]
pub struct SourceFailure {
    pub item: String,
    pub date: Option<NaiveDate>,
    /// Dates of the same item abandoned because of this failure
    pub skipped: usize,
    pub error: IngestError,
}

impl SourceFailure {
    pub fn cause(&self) -> FailureCause {
        self.error.failure_cause()
    }

    pub fn aborted(&self) -> bool {
        self.skipped > 0
    }
}

/// Lazy, finite sequence of observations for one work item.
///
/// A failure that abandons the rest of the item is the last element.
pub type ObservationStream<'a> = BoxStream<'a, Result<RawObservation, SourceFailure>>;

/// Common capability of every rate source
pub trait RateSource: Send + Sync {
    fn source_tag(&self) -> &'static str;

    fn observations<'a>(&'a self, item: &'a WorkItem) -> ObservationStream<'a>;
}

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Request quota shared by every worker talking to the same source
#[derive(Clone, Default)]
pub struct RequestThrottle {
    limiter: Option<Arc<DirectRateLimiter>>,
}

impl RequestThrottle {
    /// Evenly spaced requests, no burst. `0` disables throttling.
    pub fn per_minute(requests_per_minute: u32) -> Self {
        let limiter = NonZeroU32::new(requests_per_minute)
            .and_then(|limit| Quota::with_period(Duration::from_secs(60) / limit.get()))
            .map(|quota| Arc::new(RateLimiter::direct(quota)));
        Self { limiter }
    }

    pub fn is_enabled(&self) -> bool {
        self.limiter.is_some()
    }

    pub async fn wait(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }
    }
}

/// HTTP client shared by the source fetchers
pub fn build_source_client(timeout: Duration) -> Result<Client, IngestError> {
    Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| IngestError::Config(format!("failed to build HTTP client: {}", e)))
}
