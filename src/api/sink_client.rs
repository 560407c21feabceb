use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info};
use url::Url;

use crate::errors::{DeliveryFailureKind, IngestError};
use crate::models::{Config, DeliveryOutcome, NormalizedRate};

pub const EXCHANGE_RATES_PATH: &str = "api/v1/exchange_rates";

/// JSON body accepted by the sink
#[derive(Debug, Serialize)]
pub struct RatePayload<'a> {
    pub base: &'a str,
    pub target: &'a str,
    pub date: String,
    pub conversion_rate: String,
    pub source: &'a str,
    pub precision: u32,
    pub scale: u32,
}

impl<'a> From<&'a NormalizedRate> for RatePayload<'a> {
    fn from(rate: &'a NormalizedRate) -> Self {
        Self {
            base: &rate.base,
            target: &rate.target,
            date: rate.date.format("%Y-%m-%d").to_string(),
            conversion_rate: rate.value.to_string(),
            source: &rate.source,
            precision: rate.precision,
            scale: rate.scale,
        }
    }
}

/// Anything that can take delivery of normalized rates
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RateSink: Send + Sync {
    /// Push one rate. Never retries; the outcome says what happened.
    async fn deliver(&self, rate: &NormalizedRate) -> DeliveryOutcome;
}

/// HTTP client for the storage API.
///
/// The bearer credential is fixed at construction. A semaphore sized to the
/// sink's connection budget is the only throttle on concurrent deliveries.
pub struct SinkClient {
    client: Client,
    endpoint: String,
    connections: Arc<Semaphore>,
    max_connections: usize,
}

impl SinkClient {
    pub fn new(config: &Config) -> Result<Self, IngestError> {
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", config.sink_token))
            .map_err(|e| IngestError::Config(format!("invalid SINK_TOKEN: {}", e)))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .timeout(config.request_timeout)
            .user_agent("fx-rates-ingest/0.1")
            .default_headers(headers)
            .pool_max_idle_per_host(config.sink_max_connections)
            .build()
            .map_err(|e| IngestError::Config(format!("failed to build sink client: {}", e)))?;

        let endpoint = sink_base(&config.sink_base_url)
            .and_then(|base| base.join(EXCHANGE_RATES_PATH))
            .map_err(|e| IngestError::Config(format!("SINK_BASE_URL {}: {}", config.sink_base_url, e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            connections: Arc::new(Semaphore::new(config.sink_max_connections)),
            max_connections: config.sink_max_connections,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    fn failed(rate: &NormalizedRate, kind: DeliveryFailureKind, status: Option<u16>, body: String) -> DeliveryOutcome {
        let payload = serde_json::to_string(&RatePayload::from(rate)).unwrap_or_default();
        error!(
            "❌ Delivery failed ({}) status={:?} body={} record={}",
            kind, status, body, payload
        );
        DeliveryOutcome::Failed {
            rate: rate.clone(),
            kind,
            status,
            body,
        }
    }
}

/// Parse the sink root so that joining keeps any path prefix
fn sink_base(base_url: &str) -> Result<Url, url::ParseError> {
    let mut base = Url::parse(base_url)?;
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    Ok(base)
}

#[async_trait]
impl RateSink for SinkClient {
    async fn deliver(&self, rate: &NormalizedRate) -> DeliveryOutcome {
        let _permit = match self.connections.acquire().await {
            Ok(permit) => permit,
            Err(e) => return Self::failed(rate, DeliveryFailureKind::Network, None, e.to_string()),
        };

        let payload = RatePayload::from(rate);
        debug!("POST {} {:?}", self.endpoint, payload);

        let response = match self.client.post(&self.endpoint).json(&payload).send().await {
            Ok(response) => response,
            Err(e) => return Self::failed(rate, DeliveryFailureKind::Network, None, e.to_string()),
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) if status.is_success() => {
                // The sink accepted the record; only the echo got lost
                debug!("Could not read sink response body: {}", e);
                String::new()
            }
            Err(e) => e.to_string(),
        };

        if status.is_success() {
            info!("{}", body);
            DeliveryOutcome::Delivered {
                rate: rate.clone(),
                status: status.as_u16(),
            }
        } else {
            Self::failed(
                rate,
                DeliveryFailureKind::from_status(status.as_u16()),
                Some(status.as_u16()),
                body,
            )
        }
    }
}
