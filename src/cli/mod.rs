pub mod batch;
pub mod maintenance;
pub mod run;

use crate::config::{load_config, Config, ConfigError};
use crate::notify::{self, NotifyError, Notifier};
use crate::pipeline::supervisor::SupervisorError;
use crate::pipeline::{EnvError, EnvOptions};
use crate::services::ServiceError;
use crate::sink::SinkError;
use crate::source::BatchError;
use crate::storage::WorklogError;
use chrono::{DateTime, FixedOffset, NaiveDateTime, Offset, TimeZone, Utc};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "logfeed")]
#[command(about = "Log tailing and analysis feeding a document index and a time-series store", long_about = None)]
pub struct Cli {
    /// Print records instead of writing them, saves no state
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Start every configured file from its beginning
    #[arg(long, global = true)]
    pub worklog_reset: bool,

    /// Unix timestamp, RFC 3339 or `YYYY-MM-DD HH:MM:SS` in the configured time zone
    #[arg(long, global = true, value_name = "TS")]
    pub from_time: Option<String>,

    #[arg(long, global = true, value_name = "TS")]
    pub to_time: Option<String>,

    /// Run history and analyzers only, write nothing to the sinks
    #[arg(long, global = true)]
    pub analysis_only: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Process the `logFiles` directories once
    Batch { config_path: PathBuf },
    /// Tail the `logTail` files until interrupted
    Tail { config_path: PathBuf },
    /// Set fields of documents selected by `docUpdate`
    Docupdate { config_path: PathBuf },
    /// Remove `docUpdate.removeKey` from selected documents
    Keyremove { config_path: PathBuf },
    Version,
    Mkscript { config_path: PathBuf },
    /// Send a test message through the configured notifiers
    TestNotification { config_path: PathBuf },
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Env(#[from] EnvError),

    #[error("tail error: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("batch error: {0}")]
    Batch(#[from] BatchError),

    #[error("worklog error: {0}")]
    Worklog(#[from] WorklogError),

    #[error("notification error: {0}")]
    Notify(#[from] NotifyError),

    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("{0}")]
    Service(#[from] ServiceError),

    #[error("invalid time '{0}', expected a unix timestamp, RFC 3339 or YYYY-MM-DD HH:MM:SS")]
    InvalidTime(String),

    #[error("config has no {0} section")]
    MissingSection(&'static str),

    #[error("action {0} is not supported by this build")]
    ServiceUnsupported(&'static str),
}

/// Global flags resolved against the loaded config
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub dry_run: bool,
    pub worklog_reset: bool,
    pub analysis_only: bool,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl RunOptions {
    pub fn from_cli(cli: &Cli, config: &Config) -> Result<Self, CliError> {
        let parse = |value: &Option<String>| {
            value
                .as_deref()
                .map(|v| parse_time_arg(v, config.time_zone))
                .transpose()
        };
        Ok(Self {
            dry_run: cli.dry_run,
            worklog_reset: cli.worklog_reset,
            analysis_only: cli.analysis_only,
            from: parse(&cli.from_time)?,
            to: parse(&cli.to_time)?,
        })
    }

    pub fn env_options(&self) -> EnvOptions {
        EnvOptions {
            dry_run: self.dry_run,
            analysis_only: self.analysis_only,
        }
    }
}

/// Parse a `--from-time` / `--to-time` value
pub fn parse_time_arg(value: &str, zone: Option<FixedOffset>) -> Result<DateTime<Utc>, CliError> {
    let value = value.trim();
    if let Ok(ts) = value.parse::<i64>() {
        return Utc
            .timestamp_opt(ts, 0)
            .single()
            .ok_or_else(|| CliError::InvalidTime(value.to_string()));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    let zone = zone.unwrap_or_else(|| Utc.fix());
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .and_then(|naive| zone.from_local_datetime(&naive).single())
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| CliError::InvalidTime(value.to_string()))
}

/// Notifier with its worker for the notifiers configured in `config`
pub fn start_notifier(config: &Config) -> Result<(Notifier, JoinHandle<()>), NotifyError> {
    let transport = notify::transport_from_config(config)?;
    Ok(Notifier::spawn(transport, config.notification_tag.clone()))
}

fn load(config_path: &Path) -> Result<Config, CliError> {
    info!(config_path = %config_path.display(), "Loading configuration");
    Ok(load_config(config_path)?)
}

/// Run the selected action
pub async fn dispatch(cli: Cli) -> Result<(), CliError> {
    match &cli.command {
        Command::Version => {
            println!("logfeed {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Command::Mkscript { .. } => Err(CliError::ServiceUnsupported("mkscript")),
        Command::Tail { config_path } => {
            let config = load(config_path)?;
            let options = RunOptions::from_cli(&cli, &config)?;
            run::run_tail(&config, &options).await
        }
        Command::Batch { config_path } => {
            let config = load(config_path)?;
            let options = RunOptions::from_cli(&cli, &config)?;
            batch::run_batch(&config, &options).await
        }
        Command::Docupdate { config_path } => {
            let config = load(config_path)?;
            maintenance::doc_update(&config, cli.dry_run).await
        }
        Command::Keyremove { config_path } => {
            let config = load(config_path)?;
            maintenance::key_remove(&config, cli.dry_run).await
        }
        Command::TestNotification { config_path } => {
            let config = load(config_path)?;
            maintenance::test_notification(&config).await
        }
    }
}
