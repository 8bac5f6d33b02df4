use super::{Notification, NotificationTransport, NotifyError, Result};
use crate::config::types::ConomiConfig;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Serialize)]
struct Message<'a> {
    sender: &'a str,
    subject: &'a str,
    message: String,
    severity: &'static str,
    metadata: serde_json::Value,
}

/// Reports sent to a conomi notification hub
#[derive(Debug)]
pub struct ConomiTransport {
    url: String,
    sender: String,
    client: reqwest::Client,
}

impl ConomiTransport {
    pub fn new(config: &ConomiConfig) -> Result<Self> {
        if config.server.is_empty() {
            return Err(NotifyError::Config("conomi server is not set".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.req_timeout_secs))
            .build()?;
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        let sender = if config.instance.is_empty() {
            format!("{}@{}", config.app, host)
        } else {
            format!("{}/{}@{}", config.app, config.instance, host)
        };
        Ok(Self {
            url: format!("{}/api/message", config.server.trim_end_matches('/')),
            sender,
            client,
        })
    }
}

#[async_trait]
impl NotificationTransport for ConomiTransport {
    fn name(&self) -> &'static str {
        "conomi"
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        let mut metadata = notification.metadata();
        if let Some(obj) = metadata.as_object_mut() {
            obj.insert(
                "appType".to_string(),
                serde_json::Value::String(notification.app_type.clone()),
            );
        }
        let body = Message {
            sender: &self.sender,
            subject: &notification.subject,
            message: notification.body.join("\n\n"),
            severity: "warning",
            metadata,
        };
        let response = self.client.post(&self.url).json(&body).send().await?;

        if !response.status().is_success() {
            return Err(NotifyError::Status {
                status: response.status().as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_server() {
        let conf = ConomiConfig {
            server: String::new(),
            app: "logfeed".to_string(),
            instance: String::new(),
            req_timeout_secs: 5,
        };
        assert!(matches!(
            ConomiTransport::new(&conf),
            Err(NotifyError::Config(_))
        ));
    }

    #[test]
    fn test_message_url() {
        let conf = ConomiConfig {
            server: "http://conomi.local:8080/".to_string(),
            app: "logfeed".to_string(),
            instance: "tail".to_string(),
            req_timeout_secs: 5,
        };
        let transport = ConomiTransport::new(&conf).unwrap();
        assert_eq!(transport.url, "http://conomi.local:8080/api/message");
        assert!(transport.sender.starts_with("logfeed/tail@"));
    }
}
