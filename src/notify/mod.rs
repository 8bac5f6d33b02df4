//! Fire-and-forget notifications about traffic anomalies and alarms.

pub mod conomi;
pub mod mail;

use crate::config::types::Config;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("notification server returned error status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("invalid notifier configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, NotifyError>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IpReport {
    pub ip: String,
    pub count: usize,
    pub known: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NotificationKind {
    TrafficSurge {
        ratio: f64,
        current: usize,
        mean: f64,
    },
    IpOutliers {
        threshold: usize,
        outliers: Vec<IpReport>,
    },
    SuspiciousIps {
        ips: Vec<IpReport>,
    },
    ErrorAlarm {
        count: usize,
        range_secs: u64,
    },
    LogInactivity {
        path: String,
        idle_secs: u64,
    },
    Test,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub app_type: String,
    pub subject: String,
    pub body: Vec<String>,
    pub kind: NotificationKind,
}

impl Notification {
    pub fn new(app_type: &str, subject: impl Into<String>, kind: NotificationKind) -> Self {
        Self {
            app_type: app_type.to_string(),
            subject: subject.into(),
            body: Vec::new(),
            kind,
        }
    }

    pub fn line(mut self, line: impl Into<String>) -> Self {
        self.body.push(line.into());
        self
    }

    pub fn metadata(&self) -> serde_json::Value {
        serde_json::to_value(&self.kind).unwrap_or(serde_json::Value::Null)
    }
}

#[async_trait]
pub trait NotificationTransport: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, notification: &Notification) -> Result<()>;
}

/// Discards everything
#[derive(Debug, Default)]
pub struct NullTransport;

#[async_trait]
impl NotificationTransport for NullTransport {
    fn name(&self) -> &'static str {
        "null"
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        debug!(subject = %notification.subject, "Dropping notification (no notifier configured)");
        Ok(())
    }
}

/// Sends through every inner transport, reporting the first failure
pub struct FanoutTransport {
    transports: Vec<Arc<dyn NotificationTransport>>,
}

impl FanoutTransport {
    pub fn new(transports: Vec<Arc<dyn NotificationTransport>>) -> Self {
        Self { transports }
    }
}

#[async_trait]
impl NotificationTransport for FanoutTransport {
    fn name(&self) -> &'static str {
        "fanout"
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        let mut first_err = None;
        for transport in &self.transports {
            if let Err(e) = transport.send(notification).await {
                error!(transport = transport.name(), error = %e, "Failed to send notification");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Transport for the notifiers configured in `config`
pub fn transport_from_config(config: &Config) -> Result<Arc<dyn NotificationTransport>> {
    let mut transports: Vec<Arc<dyn NotificationTransport>> = Vec::new();
    if let Some(conf) = &config.conomi_notification {
        transports.push(Arc::new(conomi::ConomiTransport::new(conf)?));
    }
    if let Some(conf) = &config.email_notification {
        transports.push(Arc::new(mail::MailLogTransport::new(conf)?));
    }
    Ok(match transports.len() {
        0 => Arc::new(NullTransport),
        1 => transports.remove(0),
        _ => Arc::new(FanoutTransport::new(transports)),
    })
}

/// Cheap handle used by analyzers and alarms. Sending never blocks and
/// never fails, a notifier without a worker drops messages.
#[derive(Debug, Clone, Default)]
pub struct Notifier {
    tx: Option<mpsc::UnboundedSender<Notification>>,
    tag: Option<String>,
}

impl Notifier {
    /// Notifier backed by a worker task owning the transport
    pub fn spawn(
        transport: Arc<dyn NotificationTransport>,
        tag: Option<String>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Notification>();
        let handle = tokio::spawn(async move {
            while let Some(notification) = rx.recv().await {
                if let Err(e) = transport.send(&notification).await {
                    error!(
                        transport = transport.name(),
                        subject = %notification.subject,
                        error = %e,
                        "Failed to send notification"
                    );
                }
            }
        });
        (Self { tx: Some(tx), tag }, handle)
    }

    /// Notifier whose messages can be inspected directly
    pub fn channel(tag: Option<String>) -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx), tag }, rx)
    }

    pub fn notify(&self, mut notification: Notification) {
        let Some(tx) = &self.tx else {
            return;
        };
        if let Some(tag) = &self.tag {
            notification.subject = format!("[{}] {}", tag, notification.subject);
        }
        if tx.send(notification).is_err() {
            debug!("Notification worker is gone, dropping notification");
        }
    }
}
