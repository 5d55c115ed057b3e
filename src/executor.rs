//! Request execution against the ledger.
//!
//! The [`RequestExecutor`] trait is the boundary between the load engine and
//! the system under test. Implementations must always return a
//! [`MetricSample`]: transport failures, timeouts and unexpected statuses are
//! recorded as failures, never raised to the caller.

use std::time::SystemTime;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::errors::ErrorCategory;
use crate::metrics::{
    CONCURRENT_REQUESTS, REQUEST_DURATION_SECONDS, REQUEST_ERRORS_BY_CATEGORY,
    REQUEST_STATUS_CODES, REQUEST_TOTAL,
};
use crate::workload::WorkloadRequest;

/// Header carrying the client-supplied idempotency token.
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Which wire call produced a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Transfer,
    AccountRead,
}

impl RequestKind {
    pub const ALL: [RequestKind; 2] = [RequestKind::Transfer, RequestKind::AccountRead];

    /// Kind whose [`label`](Self::label) is `label`.
    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.label() == label)
    }

    pub fn label(&self) -> &'static str {
        match self {
            RequestKind::Transfer => "transfer",
            RequestKind::AccountRead => "account_read",
        }
    }

    /// Whether `status` counts as success for this kind of request.
    pub fn is_success_status(&self, status: u16) -> bool {
        match self {
            RequestKind::Transfer => status == 200 || status == 201,
            RequestKind::AccountRead => status == 200,
        }
    }
}

impl From<&WorkloadRequest> for RequestKind {
    fn from(request: &WorkloadRequest) -> Self {
        match request {
            WorkloadRequest::Transfer { .. } => RequestKind::Transfer,
            WorkloadRequest::AccountRead { .. } => RequestKind::AccountRead,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
}

/// The measurement produced by one request.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub kind: RequestKind,
    pub latency: Duration,
    pub outcome: Outcome,
    /// HTTP status, if a response was received
    pub status: Option<u16>,
    pub error_category: Option<ErrorCategory>,
    pub timestamp: SystemTime,
}

impl MetricSample {
    /// Classifies a received status for `kind`.
    pub fn from_status(kind: RequestKind, status: u16, latency: Duration) -> Self {
        let success = kind.is_success_status(status);
        let error_category = if success {
            None
        } else {
            // 2xx/3xx statuses that are not expected for this call still fail
            Some(ErrorCategory::from_status_code(status).unwrap_or(ErrorCategory::OtherError))
        };

        Self {
            kind,
            latency,
            outcome: if success {
                Outcome::Success
            } else {
                Outcome::Failure
            },
            status: Some(status),
            error_category,
            timestamp: SystemTime::now(),
        }
    }

    /// A failure without any response (timeout, refused connection, ...).
    pub fn transport_failure(kind: RequestKind, category: ErrorCategory, latency: Duration) -> Self {
        Self {
            kind,
            latency,
            outcome: Outcome::Failure,
            status: None,
            error_category: Some(category),
            timestamp: SystemTime::now(),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.outcome == Outcome::Failure
    }
}

/// Sends one workload request and reports what happened.
#[async_trait]
pub trait RequestExecutor: Send + Sync {
    async fn execute(&self, request: &WorkloadRequest) -> MetricSample;
}

/// Executor speaking the ledger's HTTP API.
///
/// The per-request timeout is configured on the `reqwest::Client`
/// (see [`crate::client::build_client`]).
#[derive(Clone)]
pub struct HttpExecutor {
    client: reqwest::Client,
    base_url: String,
}

impl HttpExecutor {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn build_request(&self, request: &WorkloadRequest) -> reqwest::RequestBuilder {
        match request {
            WorkloadRequest::Transfer {
                idempotency_key, ..
            } => {
                let body = request.transaction_body().unwrap_or_default();
                self.client
                    .post(format!("{}/transactions", self.base_url))
                    .header(CONTENT_TYPE, "application/json")
                    .header(IDEMPOTENCY_KEY_HEADER, idempotency_key.as_str())
                    .body(body.to_string())
            }
            WorkloadRequest::AccountRead { account_id } => self
                .client
                .get(format!("{}/accounts/{}", self.base_url, account_id)),
        }
    }
}

#[async_trait]
impl RequestExecutor for HttpExecutor {
    async fn execute(&self, request: &WorkloadRequest) -> MetricSample {
        let kind = RequestKind::from(request);

        CONCURRENT_REQUESTS.inc();
        REQUEST_TOTAL.with_label_values(&[kind.label()]).inc();

        let request_start_time = Instant::now();

        let sample = match self.build_request(request).send().await {
            Ok(mut response) => {
                let status = response.status().as_u16();
                REQUEST_STATUS_CODES
                    .with_label_values(&[status_code_label(status)])
                    .inc();

                // Drain the body so latency covers the full response
                let body_result = loop {
                    match response.chunk().await {
                        Ok(Some(_chunk)) => continue,
                        Ok(None) => break Ok(()),
                        Err(e) => break Err(e),
                    }
                };

                match body_result {
                    Ok(()) => {
                        debug!(kind = kind.label(), status_code = status, "Request completed");
                        MetricSample::from_status(kind, status, request_start_time.elapsed())
                    }
                    Err(e) => {
                        let category = ErrorCategory::from_reqwest_error(&e);
                        warn!(
                            kind = kind.label(),
                            status_code = status,
                            error = %e,
                            "Failed reading response body"
                        );
                        let mut sample = MetricSample::transport_failure(
                            kind,
                            category,
                            request_start_time.elapsed(),
                        );
                        sample.status = Some(status);
                        sample
                    }
                }
            }
            Err(e) => {
                REQUEST_STATUS_CODES.with_label_values(&["error"]).inc();
                let category = ErrorCategory::from_reqwest_error(&e);
                warn!(
                    kind = kind.label(),
                    error = %e,
                    error_category = category.label(),
                    "Request failed"
                );
                MetricSample::transport_failure(kind, category, request_start_time.elapsed())
            }
        };

        if let Some(category) = sample.error_category {
            REQUEST_ERRORS_BY_CATEGORY
                .with_label_values(&[category.label()])
                .inc();
        }
        REQUEST_DURATION_SECONDS.observe(sample.latency.as_secs_f64());
        CONCURRENT_REQUESTS.dec();

        sample
    }
}

/// Returns a static string label for common HTTP status codes.
///
/// Uncommon codes fall back to "other" rather than allocating a unique string.
fn status_code_label(code: u16) -> &'static str {
    match code {
        200 => "200",
        201 => "201",
        204 => "204",
        400 => "400",
        401 => "401",
        403 => "403",
        404 => "404",
        409 => "409",
        422 => "422",
        429 => "429",
        500 => "500",
        502 => "502",
        503 => "503",
        504 => "504",
        _ => "other",
    }
}
