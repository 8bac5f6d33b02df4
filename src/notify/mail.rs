use super::{Notification, NotificationTransport, NotifyError, Result};
use crate::config::types::EmailConfig;
use async_trait::async_trait;
use tracing::warn;

const DEFAULT_SENDER: &str = "logfeed@localhost";

/// E-mail notifications are handed to the log, delivery is left to the
/// host's log shipping.
#[derive(Debug)]
pub struct MailLogTransport {
    sender: String,
    recipients: Vec<String>,
}

fn looks_like_address(addr: &str) -> bool {
    match addr.split_once('@') {
        Some((local, domain)) => !local.is_empty() && !domain.is_empty() && !addr.contains(' '),
        None => false,
    }
}

impl MailLogTransport {
    pub fn new(config: &EmailConfig) -> Result<Self> {
        let sender = if config.sender.is_empty() {
            warn!("e-mail sender not set, using default {}", DEFAULT_SENDER);
            DEFAULT_SENDER.to_string()
        } else {
            config.sender.clone()
        };
        if config.recipients.is_empty() {
            return Err(NotifyError::Config("no e-mail recipients".to_string()));
        }
        for addr in std::iter::once(&sender).chain(config.recipients.iter()) {
            if !looks_like_address(addr) {
                return Err(NotifyError::Config(format!(
                    "incorrect e-mail address {}",
                    addr
                )));
            }
        }
        Ok(Self {
            sender,
            recipients: config.recipients.clone(),
        })
    }
}

#[async_trait]
impl NotificationTransport for MailLogTransport {
    fn name(&self) -> &'static str {
        "email"
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        warn!(
            from = %self.sender,
            to = %self.recipients.join(", "),
            app_type = %notification.app_type,
            subject = %notification.subject,
            body = %notification.body.join(" | "),
            "Notification"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conf(sender: &str, recipients: &[&str]) -> EmailConfig {
        EmailConfig {
            sender: sender.to_string(),
            recipients: recipients.iter().map(|r| r.to_string()).collect(),
            smtp_server: String::new(),
        }
    }

    #[test]
    fn test_default_sender() {
        let t = MailLogTransport::new(&conf("", &["ops@example.org"])).unwrap();
        assert_eq!(t.sender, DEFAULT_SENDER);
    }

    #[test]
    fn test_rejects_bad_address() {
        assert!(MailLogTransport::new(&conf("me@example.org", &["nobody"])).is_err());
        assert!(MailLogTransport::new(&conf("me@example.org", &[])).is_err());
    }
}
