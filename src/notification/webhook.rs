use anyhow::Result;
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::deletion::code::ConfirmationCode;
use crate::deletion::ApproverNotifier;
use crate::models::deletion::DeletionRequest;

// ── Webhook Event Types ───────────────────────────────────────

/// A structured event payload sent to webhook endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookEvent {
    /// Event type identifier, e.g. "deletion_confirmation_requested".
    pub event_type: String,
    /// ISO-8601 timestamp of when the event occurred.
    pub timestamp: String,
    pub project_id: String,
    /// Event-specific details.
    pub details: serde_json::Value,
}

impl WebhookEvent {
    /// Ask an approver to confirm a deletion. Carries the plaintext code; this
    /// is the only place it ever leaves the process.
    pub fn confirmation_requested(
        request: &DeletionRequest,
        approver_id: &str,
        code: &ConfirmationCode,
    ) -> Self {
        Self {
            event_type: "deletion_confirmation_requested".to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            project_id: request.project_id.clone(),
            details: serde_json::json!({
                "deletion_request_id": request.id,
                "resource_kind": request.resource_kind,
                "resource_id": request.resource_id,
                "requested_by": request.requested_by,
                "expires_at": request.expires_at().to_rfc3339(),
                "approver_id": approver_id,
                "code": code.as_str(),
            }),
        }
    }
}

// ── HMAC Signing ─────────────────────────────────────────────

/// Compute HMAC-SHA256 of `payload` using `secret`.
/// Returns lowercase hex digest (e.g. "sha256=<hex>").
fn hmac_sha256_hex(secret: &str, payload: &[u8]) -> Result<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("invalid HMAC key: {}", e))?;
    mac.update(payload);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

// ── Webhook Notifier ──────────────────────────────────────────

/// Delivers webhook events to the configured URLs.
/// - HMAC-SHA256 signing (`x-delgate-signature` header) when a secret is set
/// - retries with back-off (1s → 5s → 25s by default)
#[derive(Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    urls: Vec<String>,
    secret: Option<String>,
    retry_delays: Vec<Duration>,
}

impl WebhookNotifier {
    pub fn new(urls: Vec<String>, secret: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent("DeletionGate-Webhook/1.0")
            .build()?;
        Ok(Self {
            client,
            urls,
            secret,
            retry_delays: [0, 1, 5, 25].into_iter().map(Duration::from_secs).collect(),
        })
    }

    /// Replace the delay schedule. One attempt is made per entry.
    pub fn with_retry_delays(mut self, delays: Vec<Duration>) -> Self {
        self.retry_delays = delays;
        self
    }

    pub fn has_targets(&self) -> bool {
        !self.urls.is_empty()
    }

    /// Send a signed event to a single URL with retry.
    /// Returns `Ok(())` if delivery succeeded on any attempt.
    pub async fn send_signed(&self, url: &str, event: &WebhookEvent) -> Result<()> {
        let payload = serde_json::to_vec(event)
            .map_err(|e| anyhow::anyhow!("webhook serialize error: {}", e))?;
        let delivery_id = uuid::Uuid::new_v4().to_string();
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let signature = self
            .secret
            .as_deref()
            .map(|s| hmac_sha256_hex(s, &payload))
            .transpose()?;

        for (attempt, delay) in self.retry_delays.iter().enumerate() {
            if !delay.is_zero() {
                debug!(
                    url,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    event_type = %event.event_type,
                    "retrying webhook delivery"
                );
                tokio::time::sleep(*delay).await;
            }

            let mut req = self
                .client
                .post(url)
                .header("content-type", "application/json")
                .header("x-delgate-delivery-id", &delivery_id)
                .header("x-delgate-timestamp", &timestamp)
                .header("x-delgate-event", &event.event_type);

            if let Some(ref sig) = signature {
                req = req.header("x-delgate-signature", sig.as_str());
            }

            match req.body(payload.clone()).send().await {
                Ok(resp) if resp.status().is_success() => {
                    info!(
                        url,
                        event_type = %event.event_type,
                        delivery_id = %delivery_id,
                        attempt,
                        status = %resp.status(),
                        "webhook delivered successfully"
                    );
                    return Ok(());
                }
                Ok(resp) => {
                    warn!(
                        url,
                        event_type = %event.event_type,
                        delivery_id = %delivery_id,
                        attempt,
                        status = %resp.status(),
                        "webhook delivery failed (non-2xx), will retry"
                    );
                }
                Err(e) => {
                    warn!(
                        url,
                        event_type = %event.event_type,
                        delivery_id = %delivery_id,
                        attempt,
                        error = %e,
                        "webhook request error, will retry"
                    );
                }
            }
        }

        Err(anyhow::anyhow!(
            "webhook delivery failed after {} attempts: {}",
            self.retry_delays.len(),
            url
        ))
    }

    /// Send to every configured URL. Succeeds if at least one accepted it.
    pub async fn deliver(&self, event: &WebhookEvent) -> Result<()> {
        if self.urls.is_empty() {
            anyhow::bail!("no webhook targets configured");
        }
        let mut delivered = false;
        let mut last_error = None;
        for url in &self.urls {
            match self.send_signed(url, event).await {
                Ok(()) => delivered = true,
                Err(e) => last_error = Some(e),
            }
        }
        match (delivered, last_error) {
            (true, _) => Ok(()),
            (false, Some(e)) => Err(e),
            (false, None) => anyhow::bail!("webhook delivery failed"),
        }
    }
}

#[async_trait]
impl ApproverNotifier for WebhookNotifier {
    async fn notify(
        &self,
        approver_id: &str,
        request: &DeletionRequest,
        code: &ConfirmationCode,
    ) -> Result<()> {
        let event = WebhookEvent::confirmation_requested(request, approver_id, code);
        self.deliver(&event).await
    }
}

/// Notifier used when no webhook is configured. Records that a code was issued
/// and reports it undelivered, so the create response lists the approver.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl ApproverNotifier for LogNotifier {
    async fn notify(
        &self,
        approver_id: &str,
        request: &DeletionRequest,
        _code: &ConfirmationCode,
    ) -> Result<()> {
        warn!(
            request_id = %request.id,
            approver_id,
            "no notification channel configured; confirmation code not delivered"
        );
        anyhow::bail!("no notification channel configured")
    }
}

// ── Tests ─────────────────────────────────────────────────────
