use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use leavegate_core::config::PublisherConfig;
use leavegate_core::publisher::{OutcomePublisher, PublishError};
use leavegate_core::OutcomeEvent;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-leavegate-signature";
pub const IDEMPOTENCY_HEADER: &str = "x-leavegate-idempotency-key";

/// Posts each outcome as JSON to a downstream webhook. Receivers deduplicate
/// on the idempotency header, since the same outcome can be delivered again
/// after a redelivered event.
pub struct WebhookOutcomePublisher {
    client: Client,
    url: String,
    secret: Option<SecretString>,
}

impl WebhookOutcomePublisher {
    pub fn new(url: impl Into<String>, secret: Option<SecretString>, timeout: Duration) -> Self {
        let client = Client::builder().timeout(timeout).build().unwrap_or_else(|_| Client::new());
        Self { client, url: url.into(), secret }
    }

    pub fn from_config(config: &PublisherConfig) -> Option<Self> {
        let url = config.webhook_url.as_deref()?.trim();
        if url.is_empty() {
            return None;
        }
        Some(Self::new(
            url,
            config.webhook_secret.clone(),
            Duration::from_secs(config.timeout_secs.max(1)),
        ))
    }
}

#[async_trait]
impl OutcomePublisher for WebhookOutcomePublisher {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn publish(&self, outcome: &OutcomeEvent) -> Result<(), PublishError> {
        let body = serde_json::to_vec(outcome)
            .map_err(|error| PublishError::new(self.name(), format!("encode outcome: {error}")))?;

        let mut request = self
            .client
            .post(&self.url)
            .header("content-type", "application/json")
            .header(IDEMPOTENCY_HEADER, idempotency_key(outcome));
        if let Some(secret) = &self.secret {
            request = request.header(SIGNATURE_HEADER, sign(secret, &body));
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|error| PublishError::new(self.name(), error.to_string()))?;

        if !response.status().is_success() {
            return Err(PublishError::new(
                self.name(),
                format!("webhook returned {}", response.status()),
            ));
        }
        Ok(())
    }
}

pub fn idempotency_key(outcome: &OutcomeEvent) -> String {
    format!("{}:{}", outcome.request_id, outcome.event_type.as_str())
}

/// `sha256=<hex>` over the raw body.
pub fn sign(secret: &SecretString, body: &[u8]) -> String {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.expose_secret().as_bytes()) else {
        return String::new();
    };
    mac.update(body);
    format!("sha256={}", encode_hex(mac.finalize().into_bytes().as_slice()))
}

fn encode_hex(bytes: &[u8]) -> String {
    let mut output = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use leavegate_core::chrono::{TimeZone, Utc};
    use leavegate_core::config::PublisherConfig;
    use leavegate_core::publisher::OutcomePublisher;
    use leavegate_core::{
        Decision, DecisionReason, EmployeeId, LeaveEventType, OutcomeEvent, RequestId,
    };
    use secrecy::SecretString;

    use super::{idempotency_key, sign, WebhookOutcomePublisher};

    fn outcome() -> OutcomeEvent {
        OutcomeEvent {
            request_id: RequestId("r-7".to_string()),
            employee_id: EmployeeId("emp-007".to_string()),
            event_type: LeaveEventType::Submitted,
            decision: Decision::Approved,
            reason: DecisionReason::WithinPolicy,
            decided_at: Utc.with_ymd_and_hms(2026, 5, 4, 9, 30, 0).single().expect("ts"),
        }
    }

    #[test]
    fn signature_matches_the_rfc_4231_vector() {
        // RFC 4231 test case 2.
        let secret = SecretString::from("Jefe");
        assert_eq!(
            sign(&secret, b"what do ya want for nothing?"),
            "sha256=5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn idempotency_key_is_request_and_event_type() {
        assert_eq!(idempotency_key(&outcome()), "r-7:SUBMITTED");
    }

    #[test]
    fn publisher_is_only_built_for_a_configured_url() {
        let mut config = PublisherConfig {
            webhook_url: None,
            webhook_secret: None,
            max_retries: 3,
            base_delay_ms: 100,
            timeout_secs: 5,
            relay_interval_ms: 1_000,
        };
        assert!(WebhookOutcomePublisher::from_config(&config).is_none());

        config.webhook_url = Some("   ".to_string());
        assert!(WebhookOutcomePublisher::from_config(&config).is_none());

        config.webhook_url = Some("http://127.0.0.1:9/outcomes".to_string());
        let publisher = WebhookOutcomePublisher::from_config(&config).expect("publisher");
        assert_eq!(publisher.name(), "webhook");
    }

    #[tokio::test]
    async fn unreachable_webhook_reports_a_publish_error() {
        let publisher = WebhookOutcomePublisher::new(
            "http://127.0.0.1:9/outcomes",
            Some(SecretString::from("s3cret")),
            Duration::from_millis(500),
        );
        let error = publisher.publish(&outcome()).await.expect_err("nothing listens on port 9");
        assert_eq!(error.publisher, "webhook");
    }
}
