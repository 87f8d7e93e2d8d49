// Agent Service Client
// HTTP communication with the remote agent service, including bounded
// exponential-backoff retry for transient network failures.

use crate::error::{EngineError, Result};
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);

fn build_http_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .build()
        .expect("Failed to create HTTP client")
}

fn build_stream_client() -> Client {
    // No overall timeout: streamed responses stay open for the lifetime of
    // an agent run.
    Client::builder()
        .http1_only()
        .tcp_keepalive(Duration::from_secs(60))
        .build()
        .expect("Failed to create stream client")
}

/// Decide whether a request error is worth retrying.
///
/// Classification is based on error signatures, never on HTTP status codes:
/// non-2xx responses are returned as normal responses at this layer.
fn is_transient(err: &reqwest::Error) -> bool {
    if err.is_connect() || err.is_timeout() {
        return true;
    }
    let msg = err.to_string();
    msg.contains("connection refused")
        || msg.contains("connection reset")
        || msg.contains("connection closed")
        || msg.contains("error sending request")
        || msg.contains("dns error")
}

/// HTTP client for the remote agent service.
#[derive(Clone)]
pub struct AgentClient {
    http_client: Client,
    stream_client: Client,
    base_url: String,
}

impl AgentClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http_client: build_http_client(Duration::from_secs(30)),
            stream_client: build_stream_client(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// POST a JSON body expecting a streamed response, retrying transient
    /// network failures with exponential backoff.
    ///
    /// Delay before attempt `n` (n >= 1) is `base_delay * 2^(n-1)`. A
    /// cancelled token short-circuits with [`EngineError::Cancelled`] and is
    /// never retried. HTTP error statuses are returned as `Ok` responses for
    /// the caller to interpret.
    pub async fn post_stream_with_retry(
        &self,
        path: &str,
        body: &Value,
        cancel: &CancellationToken,
        max_retries: u32,
        base_delay: Duration,
    ) -> Result<reqwest::Response> {
        let url = self.url(path);
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let send = self.stream_client.post(&url).json(body).send();
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                r = send => r,
            };

            match result {
                Ok(response) => return Ok(response),
                Err(err) if is_transient(&err) && attempt < max_retries => {
                    let delay = base_delay * 2u32.saturating_pow(attempt);
                    tracing::warn!(
                        "Transient network failure on {} (attempt {}): {}; retrying in {:?}",
                        url,
                        attempt + 1,
                        err,
                        delay
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(err) => {
                    return Err(EngineError::Network(format!(
                        "Request to {} failed: {}",
                        url, err
                    )));
                }
            }
        }
    }

    /// Start a planning stream.
    /// POST /agent/plan
    pub async fn start_plan(
        &self,
        body: &Value,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response> {
        self.post_stream_with_retry(
            "/agent/plan",
            body,
            cancel,
            DEFAULT_MAX_RETRIES,
            DEFAULT_BASE_DELAY,
        )
        .await
    }

    /// Start an execution stream for an approved plan.
    /// POST /agent/execute
    pub async fn start_execution(
        &self,
        body: &Value,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response> {
        self.post_stream_with_retry(
            "/agent/execute",
            body,
            cancel,
            DEFAULT_MAX_RETRIES,
            DEFAULT_BASE_DELAY,
        )
        .await
    }

    /// Start a direct execution stream (image-bearing or continuation turns).
    /// POST /agent
    pub async fn start_direct(
        &self,
        body: &Value,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response> {
        self.post_stream_with_retry(
            "/agent",
            body,
            cancel,
            DEFAULT_MAX_RETRIES,
            DEFAULT_BASE_DELAY,
        )
        .await
    }

    /// Best-effort stop notification for a session.
    /// POST /agent/stop/{sessionId}
    ///
    /// Failures are logged and swallowed; the caller has already cancelled
    /// the local stream and must not fail because the service is unreachable.
    pub async fn stop_session(&self, session_id: &str) {
        let url = self.url(&format!("/agent/stop/{session_id}"));
        tracing::info!("Stopping session: {}", session_id);
        let result = self
            .http_client
            .post(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => {
                tracing::debug!("Stop request acknowledged for session {}", session_id);
            }
            Ok(resp) => {
                tracing::warn!("Stop request returned {} for session {}", resp.status(), session_id);
            }
            Err(e) => {
                tracing::warn!("Failed to send stop request for session {}: {}", session_id, e);
            }
        }
    }

    /// Post a permission decision.
    /// POST /agent/permission
    pub async fn respond_permission(
        &self,
        session_id: &str,
        permission_id: &str,
        approved: bool,
    ) -> Result<()> {
        let url = self.url("/agent/permission");
        let body = serde_json::json!({
            "sessionId": session_id,
            "permissionId": permission_id,
            "approved": approved,
        });
        let response = self
            .http_client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::Network(format!("Failed to post permission: {}", e)))?;

        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(EngineError::Protocol(format!(
                "Permission response rejected: {} {}",
                status, body
            )))
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
