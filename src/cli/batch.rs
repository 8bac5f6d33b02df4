use super::{start_notifier, CliError, RunOptions};
use crate::config::Config;
use crate::pipeline::PipelineEnv;
use crate::source::BatchReader;
use std::time::Duration;
use tracing::{info, warn};

pub async fn run_batch(config: &Config, options: &RunOptions) -> Result<(), CliError> {
    if config.log_files.is_empty() {
        return Err(CliError::MissingSection("logFiles"));
    }
    let (notifier, notifier_handle) = start_notifier(config)?;
    {
        let env = PipelineEnv::from_config(config, options.env_options(), notifier)?;
        for conf in &config.log_files {
            let reader = BatchReader::new(config, conf, env.clone())?;
            if options.worklog_reset {
                reader.batch_worklog().reset()?;
                info!(path = %conf.worklog_path.display(), "Batch worklog reset");
            }
            let summary = reader.run(options.from, options.to).await?;
            if summary.failures > 0 {
                warn!(
                    src = %conf.src_path.display(),
                    failures = summary.failures,
                    "Batch finished with write failures"
                );
            }
        }
    }
    if tokio::time::timeout(Duration::from_secs(5), notifier_handle)
        .await
        .is_err()
    {
        warn!("Pending notifications were not sent before exit");
    }
    Ok(())
}
