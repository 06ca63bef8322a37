//! Operator notifications.
//!
//! Delivery is fire-and-forget: [`Notifier::notify`] returns immediately
//! and any delivery failure is logged and dropped. Control flow never
//! depends on whether a notification arrived.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::NotifyConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub severity: Severity,
    pub title: String,
    pub message: String,
}

impl Notification {
    pub fn info(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Info, title, message)
    }

    pub fn warning(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, title, message)
    }

    pub fn critical(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Critical, title, message)
    }

    fn new(severity: Severity, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            title: title.into(),
            message: message.into(),
        }
    }
}

/// Sink for operator notifications.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Drops every notification. Used when no target is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, notification: Notification) {
        debug!(title = %notification.title, "notifications disabled, dropping");
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    /// Chat-style webhooks render this field.
    text: String,
    severity: Severity,
    title: &'a str,
    message: &'a str,
    service: &'a str,
    host: &'a str,
    timestamp: String,
}

/// POSTs JSON notifications to a webhook from a detached task.
#[derive(Clone)]
pub struct WebhookNotifier {
    url: String,
    service: String,
    host: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: &str, service: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("reforged/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self {
            url: url.to_string(),
            service: service.to_string(),
            host: sysinfo::System::host_name().unwrap_or_else(|| "unknown".to_string()),
            client,
        }
    }

    fn payload(&self, n: &Notification) -> serde_json::Value {
        let payload = WebhookPayload {
            text: format!("[{:?}] {}: {} ({})", n.severity, n.title, n.message, self.service),
            severity: n.severity,
            title: &n.title,
            message: &n.message,
            service: &self.service,
            host: &self.host,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        serde_json::to_value(&payload).unwrap_or(serde_json::Value::Null)
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, notification: Notification) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(title = %notification.title, "no async runtime, notification dropped");
            return;
        };

        let body = self.payload(&notification);
        let client = self.client.clone();
        let url = self.url.clone();

        handle.spawn(async move {
            match client.post(&url).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(%url, "notification delivered");
                }
                Ok(resp) => {
                    warn!(%url, status = %resp.status(), "notification rejected");
                }
                Err(e) => {
                    warn!(%url, error = %e, "notification delivery failed");
                }
            }
        });
    }
}

/// Build the notifier described by the config. No webhook means a silent sink.
pub fn from_config(config: &NotifyConfig, service: &str) -> Arc<dyn Notifier> {
    match config.webhook_url.as_deref() {
        Some(url) if !url.trim().is_empty() => {
            Arc::new(WebhookNotifier::new(url, service, config.timeout))
        }
        _ => Arc::new(NullNotifier),
    }
}
