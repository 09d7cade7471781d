//! Notification channels
//!
//! The set of channels is closed: email over SMTP, a JSON webhook using the
//! Alertmanager payload layout, and a Slack-compatible chat webhook. All of
//! them implement [`Deliver`].

use crate::aggregator::AggregatedAlert;
use crate::models::{Alert, AlertStatus, Labels, Severity};
use async_trait::async_trait;
use lettre::message::{header::ContentType, Mailbox};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors from a single delivery attempt
#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    #[error("receiver returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("SMTP error: {reason}")]
    Smtp { reason: String, transient: bool },

    #[error("channel not configured: {0}")]
    NotConfigured(String),

    #[error("failed to build payload: {0}")]
    Payload(String),
}

impl ChannelError {
    /// Transport failures, timeouts, 5xx and 429 are worth retrying
    pub fn is_retryable(&self) -> bool {
        match self {
            ChannelError::Transport(_) | ChannelError::Timeout => true,
            ChannelError::Status { status, .. } => *status == 429 || *status >= 500,
            ChannelError::Smtp { transient, .. } => *transient,
            ChannelError::NotConfigured(_) | ChannelError::Payload(_) => false,
        }
    }
}

impl From<reqwest::Error> for ChannelError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ChannelError::Timeout
        } else {
            ChannelError::Transport(e.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Email,
    Webhook,
    Chat,
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelKind::Email => write!(f, "email"),
            ChannelKind::Webhook => write!(f, "webhook"),
            ChannelKind::Chat => write!(f, "chat"),
        }
    }
}

/// Why a notification is sent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Firing,
    Resolved,
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationKind::Firing => write!(f, "firing"),
            NotificationKind::Resolved => write!(f, "resolved"),
        }
    }
}

/// Payload handed to a channel
#[derive(Debug, Clone)]
pub struct Notification {
    pub alert: Alert,
    pub kind: NotificationKind,
    /// Escalation step, 0 for the rule's own channels
    pub step: usize,
    /// Step recipients; channels fall back to their configured targets
    pub recipients: Vec<String>,
    /// Aggregation group the alert belongs to, if any
    pub group: Option<AggregatedAlert>,
}

impl Notification {
    pub fn title(&self) -> String {
        let status = match self.kind {
            NotificationKind::Firing => "FIRING",
            NotificationKind::Resolved => "RESOLVED",
        };
        format!(
            "[{}:{}] {} {}",
            status,
            self.alert.severity,
            self.alert.rule_name,
            format_labels(&self.alert.labels)
        )
    }

    pub fn body(&self) -> String {
        let alert = &self.alert;
        let mut lines = vec![
            format!("Alert: {} ({})", alert.rule_name, alert.id),
            format!("Status: {}", alert.status),
            format!("Severity: {}", alert.severity),
            format!("Value: {}", alert.value),
        ];
        if let Some(upper) = alert.threshold.upper {
            lines.push(format!("Upper threshold: {}", upper));
        }
        if let Some(lower) = alert.threshold.lower {
            lines.push(format!("Lower threshold: {}", lower));
        }
        if let Some(score) = alert.threshold.score {
            lines.push(format!("Anomaly score: {:.2}", score));
        }
        if let Some(starts_at) = alert.starts_at {
            lines.push(format!("Started: {}", starts_at.to_rfc3339()));
        }
        if let Some(ends_at) = alert.ends_at {
            lines.push(format!("Ended: {}", ends_at.to_rfc3339()));
        }
        for (key, value) in &alert.annotations {
            lines.push(format!("{}: {}", key, value));
        }
        if let Some(group) = &self.group {
            lines.push(format!("Group: {}", group.summary()));
        }
        lines.join("\n")
    }
}

fn format_labels(labels: &Labels) -> String {
    labels
        .iter()
        .filter(|(k, _)| k.as_str() != "alertname")
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Capability shared by every channel
#[async_trait]
pub trait Deliver: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> ChannelKind;
    async fn send(&self, notification: &Notification) -> Result<(), ChannelError>;
}

/// Token bucket limits for one channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimit {
    /// Burst size
    pub capacity: u32,
    pub per_second: f64,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            capacity: 10,
            per_second: 1.0,
        }
    }
}

/// Channel settings as written in the daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSpec {
    pub id: String,
    #[serde(default)]
    pub rate_limit: RateLimit,
    #[serde(flatten)]
    pub config: ChannelConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChannelConfig {
    Email {
        smtp_host: String,
        #[serde(default = "default_smtp_port")]
        smtp_port: u16,
        #[serde(default = "default_true")]
        starttls: bool,
        #[serde(default)]
        username: Option<String>,
        /// Environment variable holding the SMTP password
        #[serde(default)]
        password_env: Option<String>,
        from: String,
        #[serde(default)]
        to: Vec<String>,
    },
    Webhook {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    Chat {
        webhook_url: String,
        #[serde(default)]
        channel: Option<String>,
        #[serde(default)]
        username: Option<String>,
    },
}

fn default_smtp_port() -> u16 {
    587
}

fn default_true() -> bool {
    true
}

impl ChannelConfig {
    pub fn kind(&self) -> ChannelKind {
        match self {
            ChannelConfig::Email { .. } => ChannelKind::Email,
            ChannelConfig::Webhook { .. } => ChannelKind::Webhook,
            ChannelConfig::Chat { .. } => ChannelKind::Chat,
        }
    }
}

/// Build a channel from its configuration
pub fn build_channel(spec: &ChannelSpec, timeout: Duration) -> Result<Arc<dyn Deliver>, ChannelError> {
    let client = || {
        reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChannelError::NotConfigured(e.to_string()))
    };

    let channel: Arc<dyn Deliver> = match &spec.config {
        ChannelConfig::Webhook { url, headers } => Arc::new(WebhookChannel {
            id: spec.id.clone(),
            url: parse_url(url)?,
            headers: headers.clone(),
            client: client()?,
        }),
        ChannelConfig::Chat {
            webhook_url,
            channel,
            username,
        } => Arc::new(ChatChannel {
            id: spec.id.clone(),
            url: parse_url(webhook_url)?,
            channel: channel.clone(),
            username: username.clone(),
            client: client()?,
        }),
        ChannelConfig::Email {
            smtp_host,
            smtp_port,
            starttls,
            username,
            password_env,
            from,
            to,
        } => {
            let mut builder = if *starttls {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(smtp_host)
                    .map_err(|e| ChannelError::NotConfigured(e.to_string()))?
            } else {
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(smtp_host)
            };
            builder = builder.port(*smtp_port).timeout(Some(timeout));

            if let Some(username) = username {
                let password = match password_env {
                    Some(var) => std::env::var(var).map_err(|_| {
                        ChannelError::NotConfigured(format!("environment variable {} not set", var))
                    })?,
                    None => String::new(),
                };
                builder = builder.credentials(Credentials::new(username.clone(), password));
            }

            Arc::new(EmailChannel {
                id: spec.id.clone(),
                transport: builder.build(),
                from: parse_mailbox(from)?,
                to: to.iter().map(|a| parse_mailbox(a)).collect::<Result<_, _>>()?,
            })
        }
    };
    Ok(channel)
}

fn parse_url(url: &str) -> Result<url::Url, ChannelError> {
    url::Url::parse(url).map_err(|e| ChannelError::NotConfigured(format!("invalid url {}: {}", url, e)))
}

fn parse_mailbox(address: &str) -> Result<Mailbox, ChannelError> {
    address
        .parse()
        .map_err(|e| ChannelError::NotConfigured(format!("invalid address {}: {}", address, e)))
}

async fn check_status(response: reqwest::Response) -> Result<(), ChannelError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(ChannelError::Status {
        status: status.as_u16(),
        body: body.chars().take(512).collect(),
    })
}

/// Alert in the Alertmanager webhook layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAlert {
    pub status: String,
    pub labels: Labels,
    pub annotations: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub starts_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ends_at: Option<String>,
    pub fingerprint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub version: String,
    pub receiver: String,
    pub status: String,
    pub alerts: Vec<WebhookAlert>,
    pub group_labels: Labels,
    pub escalation_step: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_summary: Option<String>,
}

impl WebhookPayload {
    pub fn from_notification(receiver: &str, notification: &Notification) -> Self {
        let alert = &notification.alert;
        let status = match notification.kind {
            NotificationKind::Firing => "firing",
            NotificationKind::Resolved => "resolved",
        };

        let mut labels = alert.labels.clone();
        labels.insert("severity".to_string(), alert.severity.to_string());
        let mut annotations = alert.annotations.clone();
        annotations.insert("value".to_string(), alert.value.to_string());
        annotations.insert("alert_id".to_string(), alert.id.clone());

        Self {
            version: "4".to_string(),
            receiver: receiver.to_string(),
            status: status.to_string(),
            alerts: vec![WebhookAlert {
                status: status.to_string(),
                labels,
                annotations,
                starts_at: alert.starts_at.map(|t| t.to_rfc3339()),
                ends_at: alert.ends_at.map(|t| t.to_rfc3339()),
                fingerprint: alert.fingerprint.clone(),
            }],
            group_labels: notification
                .group
                .as_ref()
                .map(|g| g.labels.clone())
                .unwrap_or_default(),
            escalation_step: notification.step,
            group_summary: notification.group.as_ref().map(|g| g.summary()),
        }
    }
}

pub struct WebhookChannel {
    id: String,
    url: url::Url,
    headers: BTreeMap<String, String>,
    client: reqwest::Client,
}

#[async_trait]
impl Deliver for WebhookChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Webhook
    }

    async fn send(&self, notification: &Notification) -> Result<(), ChannelError> {
        let payload = WebhookPayload::from_notification(&self.id, notification);
        let mut request = self.client.post(self.url.clone()).json(&payload);
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        check_status(request.send().await?).await
    }
}

/// Slack-compatible incoming webhook message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub attachments: Vec<ChatAttachment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatAttachment {
    pub color: String,
    pub title: String,
    pub text: String,
    pub fields: Vec<ChatField>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatField {
    pub title: String,
    pub value: String,
    pub short: bool,
}

impl ChatMessage {
    pub fn from_notification(
        notification: &Notification,
        channel: Option<String>,
        username: Option<String>,
    ) -> Self {
        let alert = &notification.alert;
        let color = match (notification.kind, alert.severity) {
            (NotificationKind::Resolved, _) => "good",
            (_, Severity::Critical) => "danger",
            (_, Severity::Warning) => "warning",
            (_, Severity::Info) => "#439FE0",
        };

        let mut fields = vec![
            ChatField {
                title: "Severity".to_string(),
                value: alert.severity.to_string(),
                short: true,
            },
            ChatField {
                title: "Value".to_string(),
                value: alert.value.to_string(),
                short: true,
            },
        ];
        if alert.status == AlertStatus::Acknowledged {
            if let Some(by) = &alert.acknowledged_by {
                fields.push(ChatField {
                    title: "Acknowledged by".to_string(),
                    value: by.clone(),
                    short: true,
                });
            }
        }
        if let Some(group) = &notification.group {
            fields.push(ChatField {
                title: "Group".to_string(),
                value: group.summary(),
                short: false,
            });
        }

        Self {
            text: notification.title(),
            channel,
            username,
            attachments: vec![ChatAttachment {
                color: color.to_string(),
                title: alert.rule_name.clone(),
                text: alert
                    .annotations
                    .get("summary")
                    .cloned()
                    .unwrap_or_default(),
                fields,
            }],
        }
    }
}

pub struct ChatChannel {
    id: String,
    url: url::Url,
    channel: Option<String>,
    username: Option<String>,
    client: reqwest::Client,
}

#[async_trait]
impl Deliver for ChatChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Chat
    }

    async fn send(&self, notification: &Notification) -> Result<(), ChannelError> {
        let message =
            ChatMessage::from_notification(notification, self.channel.clone(), self.username.clone());
        let response = self
            .client
            .post(self.url.clone())
            .json(&message)
            .send()
            .await?;
        check_status(response).await
    }
}

pub struct EmailChannel {
    id: String,
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Vec<Mailbox>,
}

impl EmailChannel {
    fn build_message(&self, notification: &Notification) -> Result<Message, ChannelError> {
        let recipients: Vec<Mailbox> = if notification.recipients.is_empty() {
            self.to.clone()
        } else {
            notification
                .recipients
                .iter()
                .map(|r| parse_mailbox(r))
                .collect::<Result<_, _>>()?
        };
        if recipients.is_empty() {
            return Err(ChannelError::NotConfigured(format!(
                "email channel {} has no recipients",
                self.id
            )));
        }

        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(notification.title())
            .header(ContentType::TEXT_PLAIN);
        for to in recipients {
            builder = builder.to(to);
        }
        builder
            .body(notification.body())
            .map_err(|e| ChannelError::Payload(e.to_string()))
    }
}

#[async_trait]
impl Deliver for EmailChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Email
    }

    async fn send(&self, notification: &Notification) -> Result<(), ChannelError> {
        let message = self.build_message(notification)?;
        self.transport
            .send(message)
            .await
            .map(|_| ())
            .map_err(|e| ChannelError::Smtp {
                transient: !e.is_permanent(),
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Threshold;
    use chrono::Utc;

    fn sample_alert() -> Alert {
        let mut labels = Labels::new();
        labels.insert("alertname".into(), "HighCpu".into());
        labels.insert("host".into(), "web-01".into());
        Alert {
            id: "alert-1".into(),
            rule_id: "R1".into(),
            rule_name: "HighCpu".into(),
            fingerprint: "abc123".into(),
            status: AlertStatus::Firing,
            severity: Severity::Critical,
            labels,
            annotations: BTreeMap::new(),
            value: 85.0,
            threshold: Threshold {
                upper: Some(80.0),
                confidence: 1.0,
                ..Default::default()
            },
            pending_since: None,
            starts_at: Some(Utc::now()),
            ends_at: None,
            updated_at: Utc::now(),
            acknowledged_by: None,
            acknowledged_at: None,
            resolved_by: None,
            reopen_count: 0,
            related_to: None,
        }
    }

    fn notification() -> Notification {
        Notification {
            alert: sample_alert(),
            kind: NotificationKind::Firing,
            step: 0,
            recipients: Vec::new(),
            group: None,
        }
    }

    fn webhook_spec(url: String) -> ChannelSpec {
        ChannelSpec {
            id: "ops-webhook".into(),
            rate_limit: RateLimit::default(),
            config: ChannelConfig::Webhook {
                url,
                headers: BTreeMap::new(),
            },
        }
    }

    #[test]
    fn test_error_classification() {
        assert!(ChannelError::Timeout.is_retryable());
        assert!(ChannelError::Status {
            status: 503,
            body: String::new()
        }
        .is_retryable());
        assert!(ChannelError::Status {
            status: 429,
            body: String::new()
        }
        .is_retryable());
        assert!(!ChannelError::Status {
            status: 404,
            body: String::new()
        }
        .is_retryable());
        assert!(!ChannelError::NotConfigured("x".into()).is_retryable());
    }

    #[test]
    fn test_channel_spec_deserializes() {
        let json = r##"[
            {"id": "ops", "type": "webhook", "url": "http://localhost/hook"},
            {"id": "chat", "type": "chat", "webhook_url": "http://localhost/chat", "channel": "#ops"},
            {"id": "mail", "type": "email", "smtp_host": "smtp.example.com", "from": "alerts@example.com", "to": ["oncall@example.com"], "rate_limit": {"capacity": 2, "per_second": 0.5}}
        ]"##;
        let specs: Vec<ChannelSpec> = serde_json::from_str(json).unwrap();
        assert_eq!(specs[0].config.kind(), ChannelKind::Webhook);
        assert_eq!(specs[1].config.kind(), ChannelKind::Chat);
        match &specs[2].config {
            ChannelConfig::Email { smtp_port, starttls, .. } => {
                assert_eq!(*smtp_port, 587);
                assert!(*starttls);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(specs[2].rate_limit.capacity, 2);
    }

    #[test]
    fn test_webhook_payload_layout() {
        let payload = WebhookPayload::from_notification("ops-webhook", &notification());
        let json = serde_json::to_value(&payload).unwrap();

        assert_eq!(json["status"], "firing");
        assert_eq!(json["alerts"][0]["labels"]["severity"], "critical");
        assert_eq!(json["alerts"][0]["labels"]["host"], "web-01");
        assert_eq!(json["alerts"][0]["fingerprint"], "abc123");
        assert!(json["alerts"][0]["startsAt"].is_string());
        assert!(json["alerts"][0].get("endsAt").is_none());
    }

    #[test]
    fn test_chat_message_colors() {
        let firing = ChatMessage::from_notification(&notification(), Some("#ops".into()), None);
        assert_eq!(firing.attachments[0].color, "danger");
        assert!(firing.text.starts_with("[FIRING:critical] HighCpu host=web-01"));

        let mut resolved = notification();
        resolved.kind = NotificationKind::Resolved;
        let message = ChatMessage::from_notification(&resolved, None, None);
        assert_eq!(message.attachments[0].color, "good");
    }

    #[tokio::test]
    async fn test_webhook_delivery() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hook")
            .match_header("content-type", "application/json")
            .match_body(mockito::Matcher::PartialJsonString(
                r#"{"receiver": "ops-webhook", "status": "firing"}"#.to_string(),
            ))
            .with_status(200)
            .create_async()
            .await;

        let channel =
            build_channel(&webhook_spec(format!("{}/hook", server.url())), Duration::from_secs(5))
                .unwrap();
        channel.send(&notification()).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_webhook_status_errors_are_classified() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/unavailable")
            .with_status(503)
            .with_body("try later")
            .create_async()
            .await;
        server
            .mock("POST", "/gone")
            .with_status(410)
            .create_async()
            .await;

        let flaky =
            build_channel(&webhook_spec(format!("{}/unavailable", server.url())), Duration::from_secs(5))
                .unwrap();
        let err = flaky.send(&notification()).await.unwrap_err();
        assert!(err.is_retryable());

        let gone = build_channel(&webhook_spec(format!("{}/gone", server.url())), Duration::from_secs(5))
            .unwrap();
        let err = gone.send(&notification()).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_invalid_configuration_is_rejected() {
        assert!(matches!(
            build_channel(&webhook_spec("not a url".into()), Duration::from_secs(1)),
            Err(ChannelError::NotConfigured(_))
        ));
    }

    #[test]
    fn test_email_message_uses_step_recipients() {
        let channel = EmailChannel {
            id: "mail".into(),
            transport: AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous("localhost").build(),
            from: parse_mailbox("alerts@example.com").unwrap(),
            to: vec![parse_mailbox("team@example.com").unwrap()],
        };

        let mut escalated = notification();
        escalated.recipients = vec!["manager@example.com".into()];
        let message = channel.build_message(&escalated).unwrap();
        let rendered = String::from_utf8(message.formatted()).unwrap();
        assert!(rendered.contains("manager@example.com"));
        assert!(!rendered.contains("team@example.com"));
        assert!(rendered.contains("Subject: [FIRING:critical] HighCpu host=web-01"));

        let default = channel.build_message(&notification()).unwrap();
        let rendered = String::from_utf8(default.formatted()).unwrap();
        assert!(rendered.contains("team@example.com"));
    }
}
