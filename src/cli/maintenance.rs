//! One-off actions against the document index and the notifiers.

use super::CliError;
use crate::config::types::DocUpdateConfig;
use crate::config::Config;
use crate::notify::{self, Notification, NotificationKind};
use crate::sink::elastic::{search_query, ElasticWriter};
use tracing::{error, info};

fn doc_update_section(config: &Config) -> Result<&DocUpdateConfig, CliError> {
    config
        .doc_update
        .as_ref()
        .ok_or(CliError::MissingSection("docUpdate"))
}

/// Index suffix of the selected documents, all app types when unfiltered
fn target_app_type(conf: &DocUpdateConfig) -> &str {
    conf.filters
        .iter()
        .find_map(|f| f.app_type.as_deref())
        .unwrap_or("*")
}

pub async fn doc_update(config: &Config, dry_run: bool) -> Result<(), CliError> {
    let es = config
        .elastic_search
        .as_ref()
        .ok_or(CliError::MissingSection("elasticSearch"))?;
    let conf = doc_update_section(config)?;
    if conf.update.is_empty() {
        return Err(CliError::MissingSection("docUpdate.update"));
    }
    if dry_run {
        info!(query = %search_query(&conf.filters), fields = ?conf.update.keys().collect::<Vec<_>>(), "Dry run, documents not updated");
        return Ok(());
    }
    let writer = ElasticWriter::new(es)?;
    let updated = writer.update_by_query(target_app_type(conf), conf).await?;
    println!("updated {} documents", updated);
    Ok(())
}

pub async fn key_remove(config: &Config, dry_run: bool) -> Result<(), CliError> {
    let es = config
        .elastic_search
        .as_ref()
        .ok_or(CliError::MissingSection("elasticSearch"))?;
    let conf = doc_update_section(config)?;
    let key = conf
        .remove_key
        .as_deref()
        .ok_or(CliError::MissingSection("docUpdate.removeKey"))?;
    if dry_run {
        info!(query = %search_query(&conf.filters), key, "Dry run, key not removed");
        return Ok(());
    }
    let writer = ElasticWriter::new(es)?;
    let updated = writer.remove_key(target_app_type(conf), conf, key).await?;
    println!("removed key {} from {} documents", key, updated);
    Ok(())
}

/// Send one message straight through the configured transports
pub async fn test_notification(config: &Config) -> Result<(), CliError> {
    let transport = notify::transport_from_config(config)?;
    let mut subject = "logfeed test notification".to_string();
    if let Some(tag) = &config.notification_tag {
        subject = format!("[{}] {}", tag, subject);
    }
    let notification = Notification::new("logfeed", subject, NotificationKind::Test)
        .line("This is a test message sent by logfeed test-notification");
    match transport.send(&notification).await {
        Ok(()) => {
            println!("test notification sent via {}", transport.name());
            Ok(())
        }
        Err(e) => {
            error!(transport = transport.name(), error = %e, "Test notification failed");
            Err(e.into())
        }
    }
}
