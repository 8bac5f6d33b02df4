use super::{start_notifier, CliError, RunOptions};
use crate::config::Config;
use crate::pipeline::supervisor::{reset_tail_state, shutdown_signal, TailSupervisor};
use crate::pipeline::PipelineEnv;
use crate::storage::Worklog;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const NOTIFIER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn run_tail(config: &Config, options: &RunOptions) -> Result<(), CliError> {
    let tail = config
        .log_tail
        .as_ref()
        .ok_or(CliError::MissingSection("logTail"))?;

    info!(path = %tail.worklog_path.display(), "Loading worklog");
    let worklog = Arc::new(Worklog::load(&tail.worklog_path)?);
    if options.worklog_reset {
        reset_tail_state(tail, &worklog)?;
        info!(files = tail.files.len(), "Worklog reset, files are read from the beginning");
    }
    if options.from.is_some() || options.to.is_some() {
        warn!("--from-time and --to-time apply to batch mode only");
    }

    let (notifier, notifier_handle) = start_notifier(config)?;
    let env = PipelineEnv::from_config(config, options.env_options(), notifier)?;
    let supervisor = TailSupervisor::from_config(config, tail, worklog, env)?;

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_cancel.cancel();
    });

    info!("Tailing started, press Ctrl+C to shutdown");
    supervisor.run(cancel).await?;

    // the worker ends once the last notifier clone is gone
    if tokio::time::timeout(NOTIFIER_DRAIN_TIMEOUT, notifier_handle)
        .await
        .is_err()
    {
        warn!("Pending notifications were not sent before shutdown");
    }
    info!("Shutdown complete");
    Ok(())
}
