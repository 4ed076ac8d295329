//! Notification channels registered by name, and the timeout-bounded service
//! that routes `send` calls to them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use ontos_protocol::{NotificationChannel, OntosError, OntosResult};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InAppMessage {
    pub recipient: String,
    pub subject: String,
    pub content: String,
    #[serde(default)]
    pub extra: Value,
    pub sent_at: DateTime<Utc>,
}

/// Messages kept in process, per recipient, for the UI to poll.
#[derive(Debug, Default)]
pub struct InAppChannel {
    inbox: Mutex<HashMap<String, Vec<InAppMessage>>>,
}

impl InAppChannel {
    pub const NAME: &'static str = "in_app";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages_for(&self, recipient: &str) -> Vec<InAppMessage> {
        self.inbox.lock().get(recipient).cloned().unwrap_or_default()
    }

    pub fn total(&self) -> usize {
        self.inbox.lock().values().map(Vec::len).sum()
    }
}

#[async_trait]
impl NotificationChannel for InAppChannel {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn send(&self, recipient: &str, subject: &str, content: &str, extra: &Value) -> OntosResult<bool> {
        let message = InAppMessage {
            recipient: recipient.to_owned(),
            subject: subject.to_owned(),
            content: content.to_owned(),
            extra: extra.clone(),
            sent_at: Utc::now(),
        };
        self.inbox
            .lock()
            .entry(recipient.to_owned())
            .or_default()
            .push(message);
        Ok(true)
    }
}

/// Posts `{recipient, subject, content, extra}` as JSON to a fixed URL.
#[derive(Debug, Clone)]
pub struct WebhookChannel {
    url: String,
    client: reqwest::Client,
}

impl WebhookChannel {
    pub const NAME: &'static str = "webhook";

    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            url: url.into(),
            client,
        }
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn send(&self, recipient: &str, subject: &str, content: &str, extra: &Value) -> OntosResult<bool> {
        let body = json!({
            "recipient": recipient,
            "subject": subject,
            "content": content,
            "extra": extra,
        });
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| OntosError::upstream(Self::NAME, e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            warn!(url = %self.url, status = status.as_u16(), "webhook rejected notification");
        }
        Ok(status.is_success())
    }
}

/// Routes notifications to named channels. Every send is bounded by the
/// configured timeout; a timeout or transport failure is reported as
/// `UpstreamUnavailable` so callers can log and carry on.
pub struct NotificationService {
    channels: RwLock<IndexMap<String, Arc<dyn NotificationChannel>>>,
    timeout: Duration,
}

impl Default for NotificationService {
    fn default() -> Self {
        Self::new(Duration::from_millis(5_000))
    }
}

impl NotificationService {
    pub fn new(timeout: Duration) -> Self {
        Self {
            channels: RwLock::new(IndexMap::new()),
            timeout,
        }
    }

    pub fn register(&self, channel: Arc<dyn NotificationChannel>) {
        debug!(channel = channel.name(), "notification channel registered");
        self.channels
            .write()
            .insert(channel.name().to_owned(), channel);
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channels.read().keys().cloned().collect()
    }

    #[instrument(skip(self, content, extra), fields(channel = %channel, recipient = %recipient))]
    pub async fn send(
        &self,
        channel: &str,
        recipient: &str,
        subject: &str,
        content: &str,
        extra: &Value,
    ) -> OntosResult<bool> {
        let target = self.channels.read().get(channel).cloned().ok_or_else(|| {
            OntosError::Configuration(format!("notification channel not registered: {channel}"))
        })?;
        match timeout(self.timeout, target.send(recipient, subject, content, extra)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(OntosError::upstream(
                channel,
                format!("timed out after {}ms", self.timeout.as_millis()),
            )),
        }
    }

    /// `send` for side effects that must never fail the caller.
    pub async fn notify(&self, channel: &str, recipient: &str, subject: &str, content: &str, extra: &Value) -> bool {
        match self.send(channel, recipient, subject, content, extra).await {
            Ok(sent) => sent,
            Err(error) => {
                warn!(channel, recipient, %error, "notification dropped");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    struct StallingChannel;

    #[async_trait]
    impl NotificationChannel for StallingChannel {
        fn name(&self) -> &str {
            "stalling"
        }

        async fn send(&self, _: &str, _: &str, _: &str, _: &Value) -> OntosResult<bool> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(true)
        }
    }

    #[tokio::test]
    async fn in_app_channel_collects_per_recipient() -> Result<()> {
        let service = NotificationService::default();
        let inbox = Arc::new(InAppChannel::new());
        service.register(inbox.clone());

        let sent = service
            .send("in_app", "housekeeping", "清洁任务", "Room 101 needs cleaning", &json!({"room": "101"}))
            .await?;
        assert!(sent);
        assert_eq!(inbox.messages_for("housekeeping").len(), 1);
        assert!(inbox.messages_for("manager").is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn slow_channel_times_out_as_upstream_unavailable() {
        let service = NotificationService::new(Duration::from_millis(20));
        service.register(Arc::new(StallingChannel));
        let err = service
            .send("stalling", "m1", "s", "c", &Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "UPSTREAM_UNAVAILABLE");
        assert!(!service.notify("stalling", "m1", "s", "c", &Value::Null).await);
    }

    #[tokio::test]
    async fn unknown_channel_is_configuration_error() {
        let service = NotificationService::default();
        let err = service.send("email", "m1", "s", "c", &Value::Null).await.unwrap_err();
        assert_eq!(err.error_code(), "CONFIGURATION_ERROR");
    }
}
