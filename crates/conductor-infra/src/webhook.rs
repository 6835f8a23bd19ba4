//! Webhook delivery of workflow events

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_core::NotificationSettings;
use conductor_workflow::{HookError, NotificationHook, WorkflowEvent};
use hmac::{Hmac, Mac};
use reqwest::Client;
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Conductor-Signature";
pub const EVENT_HEADER: &str = "X-Conductor-Event";

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub url: String,
    /// Event type patterns to forward; empty forwards everything
    pub patterns: Vec<String>,
    pub secret: Option<String>,
    pub timeout: Duration,
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl WebhookConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            patterns: Vec::new(),
            secret: None,
            timeout: Duration::from_secs(10),
            max_attempts: 3,
            retry_delay: Duration::from_millis(500),
        }
    }

    pub fn with_patterns(mut self, patterns: Vec<String>) -> Self {
        self.patterns = patterns;
        self
    }

    pub fn with_secret(mut self, secret: Option<String>) -> Self {
        self.secret = secret;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// `None` when no webhook URL is configured
    pub fn from_settings(settings: &NotificationSettings) -> Option<Self> {
        settings.webhook_url.as_ref().map(|url| {
            Self::new(url.clone())
                .with_patterns(settings.patterns.clone())
                .with_secret(settings.webhook_secret.clone())
        })
    }
}

/// Posts event envelopes to a URL
pub struct WebhookNotifier {
    config: WebhookConfig,
    client: Client,
}

impl WebhookNotifier {
    pub fn new(config: WebhookConfig) -> crate::Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent("Conductor-Webhook/1.0")
            .build()?;
        Ok(Self { config, client })
    }

    /// `t={unix},sha256={hex}` over `"{unix}.{body}"`
    fn sign(secret: &str, body: &[u8], timestamp: DateTime<Utc>) -> Result<String, HookError> {
        let ts = timestamp.timestamp().to_string();
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| HookError(format!("invalid webhook secret: {}", e)))?;
        mac.update(ts.as_bytes());
        mac.update(b".");
        mac.update(body);
        Ok(format!("t={},sha256={}", ts, hex::encode(mac.finalize().into_bytes())))
    }

    async fn deliver(&self, event_type: &str, body: &[u8]) -> Result<(), String> {
        let mut request = self
            .client
            .post(&self.config.url)
            .header("Content-Type", "application/json")
            .header(EVENT_HEADER, event_type);
        if let Some(secret) = &self.config.secret {
            let signature = Self::sign(secret, body, Utc::now()).map_err(|e| e.0)?;
            request = request.header(SIGNATURE_HEADER, signature);
        }

        let response = request
            .body(body.to_vec())
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("endpoint returned {}", response.status()))
        }
    }
}

#[async_trait]
impl NotificationHook for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn notify(&self, event: &WorkflowEvent) -> Result<(), HookError> {
        let envelope = event.to_event();
        if !envelope.matches_any(&self.config.patterns) {
            return Ok(());
        }
        let body = serde_json::to_vec(&envelope).map_err(|e| HookError(e.to_string()))?;

        let attempts = self.config.max_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.deliver(&envelope.event_type, &body).await {
                Ok(()) => {
                    debug!(event_type = %envelope.event_type, run_id = %event.run_id(), attempt, "Webhook delivered");
                    return Ok(());
                }
                Err(e) => {
                    warn!(event_type = %envelope.event_type, attempt, error = %e, "Webhook delivery failed");
                    last_error = e;
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.retry_delay * attempt).await;
            }
        }

        Err(HookError(format!(
            "gave up after {} attempts: {}",
            attempts, last_error
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn completed() -> WorkflowEvent {
        WorkflowEvent::RunCompleted {
            run_id: "run-1".to_string(),
        }
    }

    fn notifier(server: &MockServer, patterns: &[&str]) -> WebhookNotifier {
        WebhookNotifier::new(
            WebhookConfig::new(format!("{}/hooks", server.uri()))
                .with_patterns(patterns.iter().map(|p| p.to_string()).collect())
                .with_secret(Some("s3cret".to_string()))
                .with_retry_delay(Duration::from_millis(10)),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_posts_signed_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hooks"))
            .and(header(EVENT_HEADER, "run.completed"))
            .and(header_exists(SIGNATURE_HEADER))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        notifier(&server, &["run.*"]).notify(&completed()).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body["event_type"], "run.completed");
        assert_eq!(body["metadata"]["run_id"], "run-1");
    }

    #[tokio::test]
    async fn test_filtered_events_are_not_sent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        notifier(&server, &["step.*"]).notify(&completed()).await.unwrap();
    }

    #[tokio::test]
    async fn test_retries_then_reports_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let err = notifier(&server, &[]).notify(&completed()).await.unwrap_err();
        assert!(err.0.contains("3 attempts"));
    }

    #[test]
    fn test_signature_format() {
        let ts = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let signature = WebhookNotifier::sign("key", b"{}", ts).unwrap();

        assert!(signature.starts_with("t=1704067200,sha256="));
        assert_eq!(signature.len(), "t=1704067200,sha256=".len() + 64);
        assert_eq!(signature, WebhookNotifier::sign("key", b"{}", ts).unwrap());
        assert_ne!(signature, WebhookNotifier::sign("other", b"{}", ts).unwrap());
    }
}
