//! C16: Hook/Webhook Manager — ordered dispatch of lifecycle events with
//! HMAC-SHA256-signed outbound webhook delivery.

use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use tracing::warn;

use crate::db::{DbError, Store};

type HmacSha256 = Hmac<Sha256>;

/// A lifecycle event payload delivered to registered webhook endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct HookEvent {
    /// Event name, e.g. `"agent_run_completed"`, `"tool_call_denied"`.
    pub event: String,
    /// RFC3339 timestamp of the event.
    pub timestamp: DateTime<Utc>,
    /// Session identifier, if the event is session-scoped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Channel the event relates to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Tool name, for tool-scoped events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// Human-readable message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Error text, for failure events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Arbitrary extra structured data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

impl HookEvent {
    /// Start building an event with just a name, timestamped now.
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            timestamp: Utc::now(),
            session_id: None,
            channel: None,
            tool_name: None,
            message: None,
            error: None,
            extra: None,
        }
    }
}

/// A configured outbound webhook endpoint.
#[derive(Debug, Clone)]
pub struct WebhookEndpoint {
    /// Target URL.
    pub url: String,
    /// Optional HMAC signing secret.
    pub secret: Option<String>,
}

/// Errors raised by hook dispatch.
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    /// Underlying storage failure while logging a delivery attempt.
    #[error("storage error: {0}")]
    Storage(#[from] DbError),
}

/// Dispatches lifecycle events to configured webhook endpoints, retrying
/// transient failures with a fixed delay, and logging every attempt.
pub struct HookManager {
    store: std::sync::Arc<Store>,
    client: reqwest::Client,
    endpoints: Vec<WebhookEndpoint>,
    max_retries: u32,
    retry_delay: Duration,
}

impl HookManager {
    /// Build a hook manager with `max_retries` attempts spaced `retry_delay`
    /// apart (per spec default: 3 attempts, 1000ms delay), using
    /// `request_timeout` as the per-attempt HTTP client timeout.
    pub fn new(
        store: std::sync::Arc<Store>,
        endpoints: Vec<WebhookEndpoint>,
        max_retries: u32,
        retry_delay: Duration,
        request_timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_default();
        Self {
            store,
            client,
            endpoints,
            max_retries,
            retry_delay,
        }
    }

    /// Dispatch `event` to every configured endpoint. Each endpoint is
    /// independent: a failure at one does not affect delivery to another.
    pub async fn dispatch(&self, event: &HookEvent) {
        let body = serde_json::to_vec(event).unwrap_or_default();
        for endpoint in &self.endpoints {
            self.deliver(endpoint, &event.event, &body).await;
        }
    }

    async fn deliver(&self, endpoint: &WebhookEndpoint, event_name: &str, body: &[u8]) {
        let signature = endpoint.secret.as_deref().map(|secret| sign(secret, body));

        let mut attempt = 0;
        loop {
            attempt = attempt.saturating_add(1);
            let mut request = self.client.post(&endpoint.url).body(body.to_owned());
            if let Some(sig) = &signature {
                request = request.header("X-Webhook-Signature", format!("sha256={sig}"));
            }

            let outcome = request.send().await;
            let (succeeded, status_code) = match &outcome {
                Ok(response) => (response.status().is_success(), Some(i64::from(response.status().as_u16()))),
                Err(_) => (false, None),
            };

            self.log_attempt(event_name, &endpoint.url, status_code, attempt, succeeded);

            if succeeded || attempt >= self.max_retries {
                if !succeeded {
                    warn!(url = %endpoint.url, event = event_name, attempts = attempt, "webhook delivery exhausted retries");
                }
                return;
            }
            tokio::time::sleep(self.retry_delay).await;
        }
    }

    fn log_attempt(&self, event: &str, url: &str, status_code: Option<i64>, attempt: u32, succeeded: bool) {
        let result = self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO webhook_delivery_log (event, url, status_code, attempt, succeeded, dispatched_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    event,
                    url,
                    status_code,
                    attempt,
                    i32::from(succeeded),
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        });
        if let Err(e) = result {
            warn!(error = %e, "failed to log webhook delivery attempt");
        }
    }
}

/// Compute the hex-encoded HMAC-SHA256 signature of `body` under `secret`.
fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic_hex() {
        let a = sign("secret", b"payload");
        let b = sign("secret", b"payload");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn different_secrets_produce_different_signatures() {
        assert_ne!(sign("one", b"payload"), sign("two", b"payload"));
    }

    #[tokio::test]
    async fn dispatch_with_no_endpoints_is_a_no_op() {
        let store = std::sync::Arc::new(Store::open_in_memory().expect("open_in_memory should succeed"));
        let manager = HookManager::new(store, vec![], 3, Duration::from_millis(1), Duration::from_secs(10));
        manager.dispatch(&HookEvent::new("agent_run_completed")).await;
    }
}
