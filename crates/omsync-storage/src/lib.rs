//! Transport and tabular storage backends for omsync.
//!
//! The remote API is reached through [`ApiTransport`]; destination tables
//! live behind [`TabularStore`]. Both are traits so the pipeline can run
//! against fixtures and in-memory workbooks as easily as against the network
//! and a file on disk.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, debug_span, Instrument};

mod workbook;

pub use workbook::{CellRange, FormatRule, SheetData, StoreError, TabularStore, Workbook, WorkbookData};

pub const CRATE_NAME: &str = "omsync-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Response as received, whatever its status. Callers decide what a non-2xx
/// answer means; the API reports "no more pages" through a fault body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn disposition(&self) -> RetryDisposition {
        match StatusCode::from_u16(self.status) {
            Ok(status) => classify_status(status),
            Err(_) => RetryDisposition::NonRetryable,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

impl TransportError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            TransportError::Request(err) => classify_reqwest_error(err),
            TransportError::Unavailable(_) => RetryDisposition::Retryable,
        }
    }
}

/// JSON-over-HTTP POST. Implementations must not turn an HTTP error status
/// into an `Err`; only failures to obtain a response are errors.
#[async_trait]
pub trait ApiTransport: Send + Sync {
    async fn post_json(&self, url: &str, body: &JsonValue) -> Result<RawResponse, TransportError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ApiTransport for HttpTransport {
    async fn post_json(&self, url: &str, body: &JsonValue) -> Result<RawResponse, TransportError> {
        let span = debug_span!("api_post", url);
        async {
            let resp = self.client.post(url).json(body).send().await?;
            let status = resp.status();
            let body = resp.bytes().await?.to_vec();
            debug!(status = status.as_u16(), bytes = body.len(), "api response");
            Ok(RawResponse {
                status: status.as_u16(),
                body,
            })
        }
        .instrument(span)
        .await
    }
}
