//! Error types for the ingestion pipeline.
//!
//! Every per-unit error is caught at the unit boundary and turned into a logged
//! outcome. Only setup failures (configuration, metadata, log file) end the run.

use thiserror::Error;

/// Why a network call to a source failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchFailureKind {
    /// The source refused us (HTTP 403 or 429).
    Blocked,
    Timeout,
    Network,
    UnexpectedStatus(u16),
}

impl std::fmt::Display for FetchFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchFailureKind::Blocked => write!(f, "blocked by source"),
            FetchFailureKind::Timeout => write!(f, "timed out"),
            FetchFailureKind::Network => write!(f, "network error"),
            FetchFailureKind::UnexpectedStatus(status) => write!(f, "unexpected status {}", status),
        }
    }
}

/// Tag carried by a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryFailureKind {
    /// Transport error or timeout before a response arrived.
    Network,
    /// The sink answered 400 or 422.
    Validation,
    /// Any other non-2xx answer.
    SinkRejected,
}

impl DeliveryFailureKind {
    pub fn from_status(status: u16) -> Self {
        match status {
            400 | 422 => DeliveryFailureKind::Validation,
            _ => DeliveryFailureKind::SinkRejected,
        }
    }
}

impl std::fmt::Display for DeliveryFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryFailureKind::Network => write!(f, "network"),
            DeliveryFailureKind::Validation => write!(f, "validation"),
            DeliveryFailureKind::SinkRejected => write!(f, "sink-rejection"),
        }
    }
}

/// Coarse reason used to explain why a code's remaining dates were skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureCause {
    /// The source is refusing requests; continuing would only make it worse.
    Blocked,
    /// Timeouts, connection resets, 5xx answers.
    Transient,
    /// The response arrived but did not have the expected shape.
    Malformed,
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureCause::Blocked => write!(f, "rate-limited/blocked"),
            FailureCause::Transient => write!(f, "transient"),
            FailureCause::Malformed => write!(f, "malformed"),
        }
    }
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("malformed number {text:?}: {reason}")]
    MalformedNumber { text: String, reason: &'static str },

    #[error("malformed date {text:?}")]
    MalformedDate { text: String },

    #[error("fetch failed for {url}: {kind}")]
    Fetch { url: String, kind: FetchFailureKind },

    #[error("unexpected response shape ({context}): {message}")]
    Parse { context: String, message: String },

    #[error("cache error: {0}")]
    Cache(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl IngestError {
    pub fn malformed(text: impl Into<String>, reason: &'static str) -> Self {
        IngestError::MalformedNumber {
            text: text.into(),
            reason,
        }
    }

    pub fn parse(context: impl Into<String>, message: impl Into<String>) -> Self {
        IngestError::Parse {
            context: context.into(),
            message: message.into(),
        }
    }

    /// Classify a reqwest transport error for `url`.
    pub fn from_transport(url: &str, err: &reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            FetchFailureKind::Timeout
        } else {
            FetchFailureKind::Network
        };
        IngestError::Fetch {
            url: url.to_string(),
            kind,
        }
    }

    /// Classify a non-2xx source answer for `url`.
    pub fn from_status(url: &str, status: u16) -> Self {
        let kind = match status {
            403 | 429 => FetchFailureKind::Blocked,
            _ => FetchFailureKind::UnexpectedStatus(status),
        };
        IngestError::Fetch {
            url: url.to_string(),
            kind,
        }
    }

    pub fn failure_cause(&self) -> FailureCause {
        match self {
            IngestError::Fetch {
                kind: FetchFailureKind::Blocked,
                ..
            } => FailureCause::Blocked,
            IngestError::Fetch { .. } | IngestError::Io(_) | IngestError::Cache(_) => FailureCause::Transient,
            _ => FailureCause::Malformed,
        }
    }
}
