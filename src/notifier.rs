//! Outbound notifications to the chat bot
//!
//! Events are POSTed as JSON to the bot's HTTP API. Delivery is
//! fire-and-forget: the `Dispatcher` spawns the request and returns, a
//! failed or slow delivery is logged and dropped. There is no retry queue.
//!
//! The configured base URL is reduced to `scheme://host[:port]` and the
//! event path is appended, so a base URL that was pasted with a stale path
//! (`http://bot:3000/api/old-endpoint`) still reaches `/linked`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use crate::config::NotifierConfig;
use crate::error::DeliveryError;

/// Event sent to the bot, wrapped in the common envelope
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundEvent {
    pub platform_user_id: i64,
    pub external_user_id: String,
    #[serde(flatten)]
    pub kind: EventKind,
    /// Unix seconds at which the event was produced
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    #[serde(rename_all = "camelCase")]
    Linked {
        external_username: Option<String>,
        code: String,
    },
    #[serde(rename_all = "camelCase")]
    QuizCompleted {
        topic: String,
        activity_title: String,
        correct: bool,
        response_time_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    AttemptCompleted {
        topic: String,
        activity_title: String,
        total_questions: u32,
        correct_answers: u32,
        duration_ms: u64,
    },
}

impl EventKind {
    /// Endpoint path on the bot API
    pub fn path(&self) -> &'static str {
        match self {
            EventKind::Linked { .. } => "/linked",
            EventKind::QuizCompleted { .. } => "/quiz-completed",
            EventKind::AttemptCompleted { .. } => "/attempt-completed",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Linked { .. } => "linked",
            EventKind::QuizCompleted { .. } => "quiz_completed",
            EventKind::AttemptCompleted { .. } => "attempt_completed",
        }
    }
}

/// Delivery backend
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, event: &OutboundEvent) -> Result<(), DeliveryError>;
}

/// Reduce `base` to `scheme://host[:port]` and append `path`
pub fn endpoint_url(base: &str, path: &str) -> Result<Url, DeliveryError> {
    let invalid = |reason: &str| DeliveryError::InvalidUrl {
        url: base.to_string(),
        reason: reason.to_string(),
    };

    let parsed = Url::parse(base.trim()).map_err(|e| invalid(&e.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(invalid("scheme must be http or https"));
    }
    let host = parsed.host_str().ok_or_else(|| invalid("missing host"))?;

    let mut origin = format!("{}://{}", parsed.scheme(), host);
    if let Some(port) = parsed.port() {
        origin.push_str(&format!(":{}", port));
    }

    Url::parse(&format!("{}{}", origin, path)).map_err(|e| invalid(&e.to_string()))
}

/// POSTs events to the bot over HTTP
pub struct HttpNotifier {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpNotifier {
    pub fn new(base_url: &str, timeout: Duration, auth_token: Option<String>) -> Result<Self, DeliveryError> {
        // Reject a broken base URL at startup rather than on every event
        endpoint_url(base_url, "")?;

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DeliveryError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.to_string(),
            auth_token: auth_token.filter(|t| !t.is_empty()),
        })
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn deliver(&self, event: &OutboundEvent) -> Result<(), DeliveryError> {
        let url = endpoint_url(&self.base_url, event.kind.path())?;

        let mut request = self.client.post(url.clone()).json(event);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::Status(status.as_u16()));
        }

        debug!(url = %url, event = event.kind.name(), "Delivered notification");
        Ok(())
    }
}

/// Used when no bot URL is configured
#[derive(Debug, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn deliver(&self, _event: &OutboundEvent) -> Result<(), DeliveryError> {
        Err(DeliveryError::Disabled)
    }
}

/// Pick the backend for a notifier config section
pub fn from_config(config: &NotifierConfig) -> Result<Arc<dyn Notifier>, DeliveryError> {
    match config.base_url.as_deref().map(str::trim) {
        Some(url) if !url.is_empty() => {
            let notifier = HttpNotifier::new(
                url,
                Duration::from_millis(config.timeout_ms),
                config.auth_token.clone(),
            )?;
            Ok(Arc::new(notifier))
        }
        _ => Ok(Arc::new(NoopNotifier)),
    }
}

/// Fire-and-forget front of a `Notifier`
#[derive(Clone)]
pub struct Dispatcher {
    notifier: Arc<dyn Notifier>,
}

impl Dispatcher {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }

    /// Spawn delivery and return immediately.
    ///
    /// Outside a tokio runtime the event is dropped with a warning.
    pub fn send(&self, event: OutboundEvent) -> Option<JoinHandle<()>> {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(event = event.kind.name(), "No runtime available, notification dropped");
                return None;
            }
        };

        let notifier = Arc::clone(&self.notifier);
        Some(handle.spawn(async move {
            match notifier.deliver(&event).await {
                Ok(()) => {}
                Err(DeliveryError::Disabled) => {
                    debug!(event = event.kind.name(), "Notifier disabled, event skipped");
                }
                Err(e) => {
                    warn!(
                        event = event.kind.name(),
                        platform_user_id = event.platform_user_id,
                        error = %e,
                        "Notification delivery failed"
                    );
                }
            }
        }))
    }
}
