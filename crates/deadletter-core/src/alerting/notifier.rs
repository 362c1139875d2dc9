//! Notification delivery for alarm transitions

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::db::RedisPool;
use crate::error::{Error, Result};
use crate::models::{AlarmTransition, Severity};

/// Notification errors
#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    /// Transport failure or non-success response
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Redis publish failure
    #[error("Redis error: {0}")]
    RedisError(String),

    /// The in-process receiver went away
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Delivery took longer than the fan-out allows
    #[error("Delivery timed out after {0:?}")]
    Timeout(Duration),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// Anything that wants to hear about alarms
#[async_trait::async_trait]
pub trait Subscriber: Send + Sync {
    /// Stable identifier used in results and logs
    fn id(&self) -> &str;

    /// Deliver one transition
    async fn notify(&self, transition: &AlarmTransition) -> std::result::Result<(), NotificationError>;
}

/// Result of delivering to one subscriber
#[derive(Debug, Clone, Serialize)]
pub struct NotificationResult {
    pub subscriber: String,
    pub success: bool,
    pub error: Option<String>,
    pub sent_at: DateTime<Utc>,
}

/// Notification channel configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationChannel {
    /// Write transitions to the process log
    Log,
    /// POST the transition as JSON
    Webhook {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    /// Slack incoming webhook
    Slack {
        webhook_url: String,
        #[serde(default)]
        channel: Option<String>,
    },
    /// Redis PUBLISH
    Redis { channel: String },
}

impl NotificationChannel {
    /// Short name of the channel kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Webhook { .. } => "webhook",
            Self::Slack { .. } => "slack",
            Self::Redis { .. } => "redis",
        }
    }

    /// Reject channels that could never deliver
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Log => Ok(()),
            Self::Webhook { url, .. } => validate_http_url(url).map(|_| ()),
            Self::Slack { webhook_url, .. } => validate_http_url(webhook_url).map(|_| ()),
            Self::Redis { channel } if channel.trim().is_empty() => {
                Err(Error::config("redis notification channel name must not be empty"))
            }
            Self::Redis { .. } => Ok(()),
        }
    }
}

fn validate_http_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw).map_err(|e| Error::config(format!("invalid URL '{raw}': {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(Error::config(format!(
            "unsupported URL scheme '{other}' in '{raw}'"
        ))),
    }
}

/// Publishes alarm transitions to every registered subscriber
pub struct NotificationFanout {
    subscribers: RwLock<Vec<Arc<dyn Subscriber>>>,
    delivery_timeout: Duration,
}

impl NotificationFanout {
    /// Create an empty fan-out
    pub fn new(delivery_timeout: Duration) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            delivery_timeout,
        }
    }

    /// Build subscribers for every configured channel
    ///
    /// `redis` is required only when a Redis channel is configured.
    pub fn from_channels(
        channels: &[NotificationChannel],
        delivery_timeout: Duration,
        redis: Option<&RedisPool>,
    ) -> Result<Self> {
        let fanout = Self::new(delivery_timeout);
        let client = Client::builder()
            .timeout(delivery_timeout)
            .build()
            .map_err(|e| Error::Notification(format!("cannot build HTTP client: {e}")))?;

        for channel in channels {
            channel.validate()?;
            let subscriber: Arc<dyn Subscriber> = match channel {
                NotificationChannel::Log => Arc::new(LogSubscriber::new()),
                NotificationChannel::Webhook { url, headers } => Arc::new(
                    WebhookSubscriber::with_client(client.clone(), url).with_headers(headers.clone()),
                ),
                NotificationChannel::Slack {
                    webhook_url,
                    channel,
                } => Arc::new(SlackSubscriber::with_client(
                    client.clone(),
                    webhook_url,
                    channel.clone(),
                )),
                NotificationChannel::Redis { channel } => {
                    let pool = redis.ok_or_else(|| {
                        Error::config("redis notification channel configured without a redis pool")
                    })?;
                    Arc::new(RedisSubscriber::new(pool.clone(), channel))
                }
            };
            fanout.subscribe(subscriber);
        }

        Ok(fanout)
    }

    /// Register a subscriber for all later publications
    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber>) {
        debug!(subscriber = subscriber.id(), "Subscriber registered");
        self.subscribers.write().push(subscriber);
    }

    /// Number of registered subscribers
    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Whether nobody is subscribed
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver a transition to every subscriber
    ///
    /// Deliveries run concurrently and each one is bounded by the delivery timeout,
    /// so one slow or failing subscriber cannot hold up the others. Returns after
    /// every delivery has finished or timed out.
    pub async fn publish(&self, transition: &AlarmTransition) -> Vec<NotificationResult> {
        let subscribers = self.subscribers.read().clone();

        let results = join_all(
            subscribers
                .iter()
                .map(|subscriber| self.deliver(subscriber.as_ref(), transition)),
        )
        .await;

        let failed = results.iter().filter(|r| !r.success).count();
        info!(
            rule = %transition.rule_name,
            to = %transition.to,
            delivered = results.len() - failed,
            failed,
            "Alarm notification published"
        );

        results
    }

    async fn deliver(
        &self,
        subscriber: &dyn Subscriber,
        transition: &AlarmTransition,
    ) -> NotificationResult {
        let sent_at = Utc::now();

        let outcome = match tokio::time::timeout(self.delivery_timeout, subscriber.notify(transition)).await {
            Ok(result) => result,
            Err(_) => Err(NotificationError::Timeout(self.delivery_timeout)),
        };

        let label = if outcome.is_ok() { "success" } else { "failure" };
        metrics::counter!(
            "deadletter_notifications_total",
            "subscriber" => subscriber.id().to_string(),
            "outcome" => label
        )
        .increment(1);

        if let Err(e) = &outcome {
            warn!(subscriber = subscriber.id(), rule = %transition.rule_name, error = %e, "Notification failed");
        }

        NotificationResult {
            subscriber: subscriber.id().to_string(),
            success: outcome.is_ok(),
            error: outcome.err().map(|e| e.to_string()),
            sent_at,
        }
    }
}

/// Writes transitions to the tracing log
pub struct LogSubscriber {
    id: String,
}

impl LogSubscriber {
    /// Create a new log subscriber
    pub fn new() -> Self {
        Self {
            id: "log".to_string(),
        }
    }
}

impl Default for LogSubscriber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Subscriber for LogSubscriber {
    fn id(&self) -> &str {
        &self.id
    }

    async fn notify(&self, transition: &AlarmTransition) -> std::result::Result<(), NotificationError> {
        error!(
            rule = %transition.rule_name,
            severity = ?transition.severity,
            from = %transition.from,
            to = %transition.to,
            value = ?transition.value,
            threshold = transition.threshold,
            "{}",
            transition.reason
        );
        Ok(())
    }
}

/// Forwards transitions into an in-process channel
pub struct ChannelSubscriber {
    id: String,
    tx: mpsc::UnboundedSender<AlarmTransition>,
}

impl ChannelSubscriber {
    /// Create a subscriber and the receiving end of its channel
    pub fn new(id: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<AlarmTransition>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { id: id.into(), tx }, rx)
    }
}

#[async_trait::async_trait]
impl Subscriber for ChannelSubscriber {
    fn id(&self) -> &str {
        &self.id
    }

    async fn notify(&self, transition: &AlarmTransition) -> std::result::Result<(), NotificationError> {
        self.tx
            .send(transition.clone())
            .map_err(|_| NotificationError::ChannelClosed(self.id.clone()))
    }
}

/// POSTs transitions as JSON to an HTTP endpoint
pub struct WebhookSubscriber {
    id: String,
    client: Client,
    url: String,
    headers: HashMap<String, String>,
}

impl WebhookSubscriber {
    /// Create a webhook subscriber sharing an HTTP client
    pub fn with_client(client: Client, url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            id: format!("webhook:{url}"),
            client,
            url,
            headers: HashMap::new(),
        }
    }

    /// Extra headers sent with every request
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }
}

#[async_trait::async_trait]
impl Subscriber for WebhookSubscriber {
    fn id(&self) -> &str {
        &self.id
    }

    async fn notify(&self, transition: &AlarmTransition) -> std::result::Result<(), NotificationError> {
        let payload = WebhookPayload::from(transition);

        let mut request = self.client.post(&self.url).json(&payload);
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| NotificationError::HttpError(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(NotificationError::HttpError(format!(
                "Webhook returned {}: {}",
                status, body
            )));
        }

        debug!(url = %self.url, rule = %transition.rule_name, "Webhook notification sent");
        Ok(())
    }
}

/// Posts transitions to a Slack incoming webhook
pub struct SlackSubscriber {
    id: String,
    client: Client,
    webhook_url: String,
    channel: Option<String>,
}

impl SlackSubscriber {
    /// Create a Slack subscriber sharing an HTTP client
    pub fn with_client(client: Client, webhook_url: impl Into<String>, channel: Option<String>) -> Self {
        Self {
            id: format!("slack:{}", channel.as_deref().unwrap_or("default")),
            client,
            webhook_url: webhook_url.into(),
            channel,
        }
    }

    fn payload(&self, transition: &AlarmTransition) -> SlackPayload {
        let color = match transition.severity {
            Severity::Critical => "#dc3545",
            Severity::Warning => "#ffc107",
            Severity::Info => "#17a2b8",
        };

        let value = transition
            .value
            .map_or_else(|| "no data".to_string(), |v| format!("{v:.2}"));

        SlackPayload {
            channel: self.channel.clone(),
            username: Some("deadletter".to_string()),
            icon_emoji: Some(":rotating_light:".to_string()),
            attachments: vec![SlackAttachment {
                color: color.to_string(),
                title: format!("{}: {} -> {}", transition.rule_name, transition.from, transition.to),
                text: transition.reason.clone(),
                fields: vec![
                    SlackField {
                        title: "Severity".to_string(),
                        value: format!("{:?}", transition.severity),
                        short: true,
                    },
                    SlackField {
                        title: "Value".to_string(),
                        value,
                        short: true,
                    },
                    SlackField {
                        title: "Threshold".to_string(),
                        value: format!("{:.2}", transition.threshold),
                        short: true,
                    },
                ],
                footer: Some("deadletter alarms".to_string()),
                ts: Some(transition.window_end.timestamp()),
            }],
        }
    }
}

#[async_trait::async_trait]
impl Subscriber for SlackSubscriber {
    fn id(&self) -> &str {
        &self.id
    }

    async fn notify(&self, transition: &AlarmTransition) -> std::result::Result<(), NotificationError> {
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&self.payload(transition))
            .send()
            .await
            .map_err(|e| NotificationError::HttpError(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(NotificationError::HttpError(format!(
                "Slack returned {}: {}",
                status, body
            )));
        }

        debug!(rule = %transition.rule_name, "Slack notification sent");
        Ok(())
    }
}

/// Publishes transitions as JSON on a Redis pub/sub channel
pub struct RedisSubscriber {
    id: String,
    pool: RedisPool,
    channel: String,
}

impl RedisSubscriber {
    /// Create a new Redis subscriber
    pub fn new(pool: RedisPool, channel: impl Into<String>) -> Self {
        let channel = channel.into();
        Self {
            id: format!("redis:{channel}"),
            pool,
            channel,
        }
    }
}

#[async_trait::async_trait]
impl Subscriber for RedisSubscriber {
    fn id(&self) -> &str {
        &self.id
    }

    async fn notify(&self, transition: &AlarmTransition) -> std::result::Result<(), NotificationError> {
        let payload = serde_json::to_string(&WebhookPayload::from(transition))
            .map_err(|e| NotificationError::SerializationError(e.to_string()))?;

        let mut conn = self
            .pool
            .connection()
            .await
            .map_err(|e| NotificationError::RedisError(e.to_string()))?;

        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(&self.channel)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| NotificationError::RedisError(e.to_string()))?;

        debug!(channel = %self.channel, receivers, "Redis notification published");
        Ok(())
    }
}

// Slack payload types
#[derive(Debug, Serialize)]
struct SlackPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    icon_emoji: Option<String>,
    attachments: Vec<SlackAttachment>,
}

#[derive(Debug, Serialize)]
struct SlackAttachment {
    color: String,
    title: String,
    text: String,
    fields: Vec<SlackField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    footer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ts: Option<i64>,
}

#[derive(Debug, Serialize)]
struct SlackField {
    title: String,
    value: String,
    short: bool,
}

// Generic webhook payload
#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    transition_id: String,
    rule_id: String,
    rule_name: &'a str,
    severity: Severity,
    from: String,
    to: String,
    reason: &'a str,
    value: Option<f64>,
    threshold: f64,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    timestamp: DateTime<Utc>,
}

impl<'a> From<&'a AlarmTransition> for WebhookPayload<'a> {
    fn from(t: &'a AlarmTransition) -> Self {
        Self {
            transition_id: t.id.to_string(),
            rule_id: t.rule_id.to_string(),
            rule_name: &t.rule_name,
            severity: t.severity,
            from: t.from.to_string(),
            to: t.to.to_string(),
            reason: &t.reason,
            value: t.value,
            threshold: t.threshold,
            window_start: t.window_start,
            window_end: t.window_end,
            timestamp: t.timestamp,
        }
    }
}
