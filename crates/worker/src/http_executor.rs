//! HTTP client for the marketplace-client service.
//!
//! Each attempt is `POST {endpoint}/actions/{marketplace}/{action_code}` with
//! the `ActionRequest` as JSON body and the tenant in `X-Tenant-Id`. A 2xx
//! response body becomes the job result; other statuses are classified into
//! retryable and permanent failures.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde_json::Value as JsonValue;

use relister_infra::jobs::{ActionError, ActionErrorKind, ActionExecutor, ActionRequest, ActionSuccess};

const TENANT_HEADER: &str = "X-Tenant-Id";
const ATTEMPT_HEADER: &str = "X-Attempt";
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Clone)]
pub struct HttpActionExecutor {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpActionExecutor {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self::with_client(client, endpoint))
    }

    pub fn with_client(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, request: &ActionRequest) -> String {
        format!(
            "{}/actions/{}/{}",
            self.endpoint, request.marketplace, request.action_code
        )
    }
}

#[async_trait]
impl ActionExecutor for HttpActionExecutor {
    async fn execute_action(&self, request: ActionRequest) -> Result<ActionSuccess, ActionError> {
        let response = self
            .client
            .post(self.url(&request))
            .header(TENANT_HEADER, request.tenant_id.to_string())
            .header(ATTEMPT_HEADER, request.attempt.to_string())
            .json(&request)
            .send()
            .await
            .map_err(|e| ActionError::new(ActionErrorKind::Network, e.to_string()).at_step("send"))?;

        let status = response.status();
        let retry_after = retry_after(response.headers());

        if status.is_success() {
            let bytes = response
                .bytes()
                .await
                .map_err(|e| ActionError::new(ActionErrorKind::Network, e.to_string()).at_step("receive"))?;
            let result = if bytes.is_empty() {
                JsonValue::Null
            } else {
                serde_json::from_slice(&bytes).map_err(|e| {
                    ActionError::new(ActionErrorKind::Upstream, format!("invalid response body: {e}"))
                        .at_step("decode")
                })?
            };
            return Ok(ActionSuccess { result });
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify(status, retry_after, &body))
    }
}

/// Map a non-success response onto an action failure.
pub fn classify(status: StatusCode, retry_after: Option<Duration>, body: &str) -> ActionError {
    let kind = match status {
        StatusCode::TOO_MANY_REQUESTS => ActionErrorKind::RateLimited,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ActionErrorKind::Unauthorized,
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => ActionErrorKind::Validation,
        StatusCode::REQUEST_TIMEOUT => ActionErrorKind::Network,
        s if s.is_server_error() => ActionErrorKind::Upstream,
        _ => ActionErrorKind::Rejected,
    };

    let (message, step) = match serde_json::from_str::<JsonValue>(body) {
        Ok(json) => (
            json.get("error")
                .and_then(JsonValue::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| truncate(body)),
            json.get("step").and_then(JsonValue::as_str).map(str::to_string),
        ),
        Err(_) => (truncate(body), None),
    };
    let message = if message.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {message}")
    };

    let mut err = ActionError::new(kind, message).at_step(step.unwrap_or_else(|| "execute".to_string()));
    if let Some(delay) = retry_after {
        err = err.retry_after(delay);
    }
    err
}

/// `Retry-After` in delta-seconds. HTTP-date values are ignored.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn truncate(body: &str) -> String {
    let body = body.trim();
    match body.char_indices().nth(MAX_ERROR_BODY) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}
