use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::error::AppError;
use crate::models::PushKeys;

/// Why a delivery attempt failed, from the dispatcher's point of view.
///
/// Permanent means the endpoint itself is gone and should be deregistered;
/// transient covers everything worth leaving registered for the next
/// naturally occurring trigger. Neither variant ever surfaces to the request
/// that triggered the dispatch.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("endpoint gone: {0}")]
    Permanent(String),

    #[error("delivery failed: {0}")]
    Transient(String),
}

impl DeliveryError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, DeliveryError::Permanent(_))
    }
}

/// Delivery to one registered push endpoint.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn deliver(
        &self,
        endpoint: &str,
        keys: &PushKeys,
        payload: &serde_json::Value,
    ) -> Result<(), DeliveryError>;
}

/// Web-Push delivery over HTTP.
///
/// Posts the payload to the subscription's endpoint URL with the registered
/// key material. A 404/410 response means the browser dropped the
/// subscription: the endpoint is dead and gets classified permanent;
/// anything else (5xx, timeout, connection refused) is transient.
pub struct WebPushClient {
    http: reqwest::Client,
}

impl WebPushClient {
    pub fn new(timeout: Duration) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Config(format!("push http client: {e}")))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl PushTransport for WebPushClient {
    async fn deliver(
        &self,
        endpoint: &str,
        keys: &PushKeys,
        payload: &serde_json::Value,
    ) -> Result<(), DeliveryError> {
        let body = serde_json::json!({
            "keys": { "p256dh": keys.p256dh, "auth": keys.auth },
            "notification": payload,
        });

        let response = self
            .http
            .post(endpoint)
            .header("TTL", "60")
            .json(&body)
            .send()
            .await
            .map_err(|e| DeliveryError::Transient(format!("send: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let detail = format!("endpoint returned {status}");
        match status.as_u16() {
            404 | 410 => Err(DeliveryError::Permanent(detail)),
            _ => Err(DeliveryError::Transient(detail)),
        }
    }
}
