//! Push delivery through an HTTP gateway, plus payload construction.
//!
//! A send that returns `Ok(false)` and one that returns an error are treated
//! the same by the pipeline; the error only adds detail for classification.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};

use snowline_common::error::AppError;
use snowline_common::types::{NotificationEvent, NotificationKind, PushAction, PushPayload};

/// Default HTTP timeout for gateway requests.
const GATEWAY_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait PushSender: Send + Sync {
    /// Whether this deployment can deliver push notifications at all.
    fn is_supported(&self) -> bool;

    async fn is_permission_granted(&self) -> bool;

    /// Re-check permission after it was lost. Returns the new state.
    async fn refresh_permission(&self) -> anyhow::Result<bool>;

    async fn send_notification(&self, payload: &PushPayload) -> anyhow::Result<bool>;
}

/// Sends push payloads as JSON to an HTTP push gateway.
pub struct HttpPushGateway {
    client: Client,
    url: String,
    token: Option<String>,
    /// Set when the gateway rejects our credentials.
    revoked: AtomicBool,
}

impl HttpPushGateway {
    pub fn new(url: impl Into<String>, token: Option<String>) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(GATEWAY_TIMEOUT)
            .build()
            .map_err(|e| AppError::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: url.into(),
            token,
            revoked: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl PushSender for HttpPushGateway {
    fn is_supported(&self) -> bool {
        true
    }

    async fn is_permission_granted(&self) -> bool {
        !self.revoked.load(Ordering::Acquire)
    }

    async fn refresh_permission(&self) -> anyhow::Result<bool> {
        // The gateway has no permission check endpoint; the next send re-verifies.
        self.revoked.store(false, Ordering::Release);
        tracing::info!(url = %self.url, "Push permission re-enabled");
        Ok(true)
    }

    async fn send_notification(&self, payload: &PushPayload) -> anyhow::Result<bool> {
        let mut request = self.client.post(&self.url).json(payload);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AppError::Network(format!("push gateway request failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(true);
        }

        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            self.revoked.store(true, Ordering::Release);
            return Err(AppError::Permission(format!("push gateway rejected credentials ({})", status)).into());
        }

        tracing::warn!(status = %status, tag = ?payload.tag, "Push gateway did not accept notification");
        Ok(false)
    }
}

/// Stand-in used when no push gateway is configured.
pub struct UnsupportedPush;

#[async_trait]
impl PushSender for UnsupportedPush {
    fn is_supported(&self) -> bool {
        false
    }

    async fn is_permission_granted(&self) -> bool {
        false
    }

    async fn refresh_permission(&self) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn send_notification(&self, _payload: &PushPayload) -> anyhow::Result<bool> {
        Err(AppError::Config("push delivery is not supported".to_string()).into())
    }
}

pub fn notification_title(kind: NotificationKind) -> &'static str {
    match kind {
        NotificationKind::Start => "Snow removal started",
        NotificationKind::End => "Snow removal finished",
    }
}

/// Build the push payload for an event. The tag groups notifications per
/// `area:type` so a newer one replaces an older one on the device.
pub fn build_push_payload(event: &NotificationEvent, icon: Option<&str>) -> PushPayload {
    PushPayload {
        title: notification_title(event.kind).to_string(),
        body: event.message.clone(),
        icon: icon.map(str::to_string),
        badge: icon.map(str::to_string),
        tag: Some(event.group_key().to_string()),
        actions: vec![
            PushAction {
                action: "view".to_string(),
                title: "View".to_string(),
            },
            PushAction {
                action: "dismiss".to_string(),
                title: "Dismiss".to_string(),
            },
        ],
        data: Some(serde_json::json!({
            "notificationId": event.id,
            "area": event.area,
            "type": event.kind,
            "reportId": event.source_record_id,
        })),
    }
}
