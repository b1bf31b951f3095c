//! Batch submission to the coordinator.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use pulsewatch_types::{EventType, ParserEvent, RawSnapshot};
use reqwest::StatusCode;

use crate::SdkError;

/// Header carrying the shared secret.
pub const TOKEN_HEADER: &str = "X-Parser-Token";

/// Default coordinator endpoint.
pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:8000/internal/parser-events";

/// Submits snapshot batches to the coordinator's intake endpoint.
///
/// A `queue_full` answer surfaces as [`SdkError::Backpressure`]; callers should
/// keep the batch and resubmit on their next cycle.
#[derive(Debug, Clone)]
pub struct Reporter {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl Reporter {
    /// Create a reporter.
    ///
    /// # Arguments
    ///
    /// * `endpoint` - Full URL of `/internal/parser-events`
    /// * `token` - Shared secret; blank means none
    /// * `timeout` - Per-request timeout
    pub fn new(
        endpoint: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, SdkError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            token: token.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()),
        })
    }

    /// Reporter configured from `PARSER_EVENTS_URL`, `PARSER_INTERNAL_TOKEN`,
    /// and `PARSER_EVENTS_TIMEOUT_SEC`.
    pub fn from_env() -> Result<Self, SdkError> {
        let endpoint = std::env::var("PARSER_EVENTS_URL")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
        let timeout = std::env::var("PARSER_EVENTS_TIMEOUT_SEC")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(15);
        Self::new(
            endpoint,
            std::env::var("PARSER_INTERNAL_TOKEN").ok(),
            Duration::from_secs(timeout),
        )
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Submit one batch. An empty batch is a no-op.
    ///
    /// Returns the coordinator's queue depth after enqueueing.
    pub async fn submit(
        &self,
        event_type: EventType,
        stats_by_url: BTreeMap<String, RawSnapshot>,
    ) -> Result<u64, SdkError> {
        if stats_by_url.is_empty() {
            return Ok(0);
        }
        let event = ParserEvent {
            event_type,
            stats_by_url,
            sent_at_utc: Some(Utc::now()),
            received_at_utc: None,
        };

        let mut request = self.client.post(&self.endpoint).json(&event);
        if let Some(token) = &self.token {
            request = request.header(TOKEN_HEADER, token);
        }
        let response = request.send().await?;
        let status = response.status();
        let body: serde_json::Value = response.json().await.unwrap_or_default();

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(SdkError::Backpressure);
        }
        if !status.is_success() {
            let reason = body
                .get("error")
                .and_then(|e| e.as_str())
                .unwrap_or("unknown")
                .to_string();
            return Err(SdkError::Rejected {
                status: status.as_u16(),
                reason,
            });
        }
        Ok(body.get("queue_size").and_then(|q| q.as_u64()).unwrap_or(0))
    }
}
