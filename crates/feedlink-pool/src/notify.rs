//! Alert delivery channels.
//!
//! Every channel is a [`Notifier`]. The hub fans an alert out to the
//! channels of its rule concurrently; one channel failing is logged and
//! counted without affecting the others.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use feedlink_core::alert::{Alert, AlertSeverity, NotificationChannel};
use feedlink_core::config::{EmailConfig, NotificationConfig};
use futures::future::join_all;
use reqwest::Client;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::metrics::AlertMetrics;

/// A delivery channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn channel(&self) -> NotificationChannel;

    async fn notify(&self, alert: &Alert) -> Result<()>;
}

/// Prints the alert summary to stdout.
pub struct ConsoleNotifier;

#[async_trait]
impl Notifier for ConsoleNotifier {
    fn channel(&self) -> NotificationChannel {
        NotificationChannel::Console
    }

    async fn notify(&self, alert: &Alert) -> Result<()> {
        println!("{}", alert.summary());
        Ok(())
    }
}

/// Emits the alert through `tracing` at a level matching its severity.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn channel(&self) -> NotificationChannel {
        NotificationChannel::Log
    }

    async fn notify(&self, alert: &Alert) -> Result<()> {
        let connection_id = alert.connection_id.as_deref().unwrap_or("-");
        match alert.severity {
            AlertSeverity::Info => info!(
                alert_id = %alert.id,
                alert_type = alert.alert_type.as_str(),
                connection_id,
                "{}",
                alert.message
            ),
            AlertSeverity::Warning => warn!(
                alert_id = %alert.id,
                alert_type = alert.alert_type.as_str(),
                connection_id,
                "{}",
                alert.message
            ),
            AlertSeverity::Error | AlertSeverity::Critical => error!(
                alert_id = %alert.id,
                alert_type = alert.alert_type.as_str(),
                severity = alert.severity.as_str(),
                connection_id,
                "{}",
                alert.message
            ),
        }
        Ok(())
    }
}

/// POSTs the full alert as JSON.
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn channel(&self) -> NotificationChannel {
        NotificationChannel::Webhook
    }

    async fn notify(&self, alert: &Alert) -> Result<()> {
        self.client
            .post(&self.url)
            .json(alert)
            .send()
            .await
            .context("webhook request failed")?
            .error_for_status()
            .context("webhook rejected alert")?;
        Ok(())
    }
}

/// POSTs `{"text": summary}` to a chat incoming-webhook.
pub struct ChatWebhookNotifier {
    client: Client,
    url: String,
}

impl ChatWebhookNotifier {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl Notifier for ChatWebhookNotifier {
    fn channel(&self) -> NotificationChannel {
        NotificationChannel::ChatWebhook
    }

    async fn notify(&self, alert: &Alert) -> Result<()> {
        let payload = json!({ "text": alert.summary() });
        self.client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .context("chat webhook request failed")?
            .error_for_status()
            .context("chat webhook rejected alert")?;
        Ok(())
    }
}

/// Hands the alert to an HTTP mail relay.
pub struct EmailNotifier {
    client: Client,
    config: EmailConfig,
}

impl EmailNotifier {
    pub fn new(client: Client, config: EmailConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    fn channel(&self) -> NotificationChannel {
        NotificationChannel::Email
    }

    async fn notify(&self, alert: &Alert) -> Result<()> {
        let payload = json!({
            "from": self.config.from,
            "to": self.config.to,
            "subject": format!("[{}] {}", alert.severity.as_str().to_uppercase(), alert.alert_type),
            "body": serde_json::to_string_pretty(alert)?,
        });
        self.client
            .post(&self.config.relay_url)
            .json(&payload)
            .send()
            .await
            .context("mail relay request failed")?
            .error_for_status()
            .context("mail relay rejected alert")?;
        Ok(())
    }
}

/// Stands in for a channel with no endpoint configured.
pub struct UnconfiguredNotifier(pub NotificationChannel);

#[async_trait]
impl Notifier for UnconfiguredNotifier {
    fn channel(&self) -> NotificationChannel {
        self.0
    }

    async fn notify(&self, _alert: &Alert) -> Result<()> {
        bail!("{} channel is not configured", self.0)
    }
}

/// Outcome of delivering one alert on one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub channel: NotificationChannel,
    pub delivered: bool,
}

/// Routes alerts to their channels.
pub struct NotificationHub {
    notifiers: HashMap<NotificationChannel, Arc<dyn Notifier>>,
    metrics: Arc<AlertMetrics>,
}

impl NotificationHub {
    /// Builds every channel from configuration. Channels without an
    /// endpoint fail each delivery.
    pub fn from_config(config: &NotificationConfig, metrics: Arc<AlertMetrics>) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .context("failed to build notification HTTP client")?;

        let mut hub = Self::empty(metrics);
        hub.register(Arc::new(ConsoleNotifier));
        hub.register(Arc::new(LogNotifier));
        match &config.webhook_url {
            Some(url) => hub.register(Arc::new(WebhookNotifier::new(client.clone(), url))),
            None => hub.register(Arc::new(UnconfiguredNotifier(NotificationChannel::Webhook))),
        }
        match &config.chat_webhook_url {
            Some(url) => hub.register(Arc::new(ChatWebhookNotifier::new(client.clone(), url))),
            None => hub.register(Arc::new(UnconfiguredNotifier(
                NotificationChannel::ChatWebhook,
            ))),
        }
        match &config.email {
            Some(email) => hub.register(Arc::new(EmailNotifier::new(client, email.clone()))),
            None => hub.register(Arc::new(UnconfiguredNotifier(NotificationChannel::Email))),
        }
        Ok(hub)
    }

    pub fn empty(metrics: Arc<AlertMetrics>) -> Self {
        Self {
            notifiers: HashMap::new(),
            metrics,
        }
    }

    /// Adds or replaces the notifier for its channel.
    pub fn register(&mut self, notifier: Arc<dyn Notifier>) {
        self.notifiers.insert(notifier.channel(), notifier);
    }

    /// Delivers `alert` on every listed channel.
    pub async fn dispatch(&self, alert: &Alert, channels: &[NotificationChannel]) -> Vec<Delivery> {
        let deliveries = channels.iter().map(|channel| async move {
            let result = match self.notifiers.get(channel) {
                Some(notifier) => notifier.notify(alert).await,
                None => Err(anyhow::anyhow!("no notifier for {channel}")),
            };
            let delivered = match result {
                Ok(()) => true,
                Err(e) => {
                    error!(
                        alert_id = %alert.id,
                        channel = channel.as_str(),
                        error = %e,
                        "Failed to deliver alert"
                    );
                    self.metrics.record_delivery_failure(*channel);
                    false
                }
            };
            Delivery {
                channel: *channel,
                delivered,
            }
        });
        join_all(deliveries).await
    }
}
