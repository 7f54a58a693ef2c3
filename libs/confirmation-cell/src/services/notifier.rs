use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, warn};

use shared_config::AppConfig;

use crate::error::ConfirmationError;
use crate::models::NotificationOutcome;
use crate::services::signing::SignedPayload;

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
pub const EVENT_HEADER: &str = "X-Webhook-Event";

/// The external Notification Endpoint. Implementations never fail: every
/// problem is reported as an undelivered outcome.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, payload: &SignedPayload) -> NotificationOutcome;
}

pub struct HttpNotifier {
    client: Client,
    url: String,
}

impl HttpNotifier {
    pub fn new(config: &AppConfig) -> Result<Self, ConfirmationError> {
        Self::with_timeout(&config.webhook_url, Duration::from_secs(config.webhook_timeout_seconds))
    }

    pub fn with_timeout(url: &str, timeout: Duration) -> Result<Self, ConfirmationError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfirmationError::Notifier(e.to_string()))?;

        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    fn headers(payload: &SignedPayload) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Ok(signature) = HeaderValue::from_str(&payload.signature) {
            headers.insert(SIGNATURE_HEADER, signature);
        }
        if let Ok(event) = HeaderValue::from_str(&payload.event) {
            headers.insert(EVENT_HEADER, event);
        }
        headers
    }
}

fn transport_failure(e: &reqwest::Error) -> NotificationOutcome {
    let code = if e.is_timeout() {
        "TIMEOUT"
    } else if e.is_connect() {
        "CONNECTION_FAILED"
    } else {
        "REQUEST_FAILED"
    };

    NotificationOutcome {
        delivered: false,
        http_status: None,
        response: json!({ "error": e.to_string(), "code": code }).to_string(),
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify(&self, payload: &SignedPayload) -> NotificationOutcome {
        debug!("Posting {} webhook to {}", payload.event, self.url);

        let response = match self
            .client
            .post(&self.url)
            .headers(Self::headers(payload))
            .body(payload.body.clone())
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!("Webhook call failed: {}", e);
                return transport_failure(&e);
            }
        };

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        let data = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

        if !status.is_success() {
            warn!("Webhook endpoint answered {}", status);
        }

        NotificationOutcome {
            delivered: status.is_success(),
            http_status: Some(status.as_u16()),
            response: json!({
                "status": status.as_u16(),
                "statusText": status.canonical_reason().unwrap_or_default(),
                "data": data,
            })
            .to_string(),
        }
    }
}
