use crate::alarm::{ErrorAlarm, TailProcAlarm};
use crate::buffer::state::{remove_state_file, state_file_path};
use crate::buffer::{BufferError, DummyBuffer, RecordBuffer, SharedHistory};
use crate::config::types::{Config, TailConfig, TailFileConfig};
use crate::notify::{Notification, NotificationKind};
use crate::pipeline::ledger::{follow_check, CheckOutcome};
use crate::pipeline::processor::FileProcessor;
use crate::pipeline::PipelineEnv;
use crate::record::LogRange;
use crate::services::{self, ExcludeIpList, LineParser, ServiceError, Transformer, TransformerContext};
use crate::source::reader::{get_inode, ReadStats, ReaderError, TailReader};
use crate::storage::{Worklog, WorklogError};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("worklog error: {0}")]
    Worklog(#[from] WorklogError),

    #[error("buffer state error: {0}")]
    Buffer(#[from] BufferError),

    #[error("service error: {0}")]
    Service(#[from] ServiceError),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

#[derive(Debug)]
struct Inactivity {
    last_growth: DateTime<Utc>,
    alarmed: bool,
}

/// Everything kept between checks of one file
pub struct TailFile {
    key: String,
    app_type: String,
    reader: TailReader,
    processor: FileProcessor,
    inactivity: Inactivity,
}

impl TailFile {
    pub fn path(&self) -> &str {
        &self.key
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    pub files: usize,
    pub lines: usize,
    pub failures: usize,
    pub unavailable: usize,
}

struct FileReport {
    read: std::result::Result<ReadStats, ReaderError>,
    outcome: CheckOutcome,
}

/// Buffer key of a file, shared buffers are keyed by their id
fn buffer_key(file: &TailFileConfig) -> String {
    match file.buffer.as_ref().and_then(|b| b.id.clone()) {
        Some(id) => format!("buffer:{}", id),
        None => file.path.to_string_lossy().to_string(),
    }
}

fn file_key(file: &TailFileConfig) -> String {
    file.path.to_string_lossy().to_string()
}

/// Point every tail file at its start and drop the stored buffer states
pub fn reset_tail_state(tail: &TailConfig, worklog: &Worklog) -> Result<()> {
    let state_dir = tail.buffer_state_dir();
    for file in &tail.files {
        let key = file_key(file);
        match worklog.reset_file(&key) {
            Ok(_) => {}
            Err(WorklogError::Io { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                warn!(path = %key, "Cannot reset worklog of a missing file");
            }
            Err(e) => return Err(e.into()),
        }
        remove_state_file(&state_file_path(&state_dir, &buffer_key(file)))?;
    }
    worklog.flush()?;
    Ok(())
}

/// Periodic scheduler of all tailed files
pub struct TailSupervisor {
    files: Vec<TailFile>,
    worklog: Arc<Worklog>,
    buffers: Vec<(PathBuf, SharedHistory)>,
    env: PipelineEnv,
    interval: Duration,
    max_lines: usize,
    inactivity_secs: u64,
}

impl TailSupervisor {
    pub fn from_config(config: &Config, tail: &TailConfig, worklog: Arc<Worklog>, env: PipelineEnv) -> Result<Self> {
        let state_dir = tail.buffer_state_dir();
        let exclude_ips = ExcludeIpList::new(&tail.exclude_ip_list);
        let mut shared: HashMap<String, SharedHistory> = HashMap::new();
        let mut buffers = Vec::new();
        let mut files = Vec::with_capacity(tail.files.len());

        for file_conf in &tail.files {
            let app = services::resolve(&file_conf.app_type, &file_conf.version)?;
            let key = file_key(file_conf);
            let transformer = Transformer::for_app(
                app,
                TransformerContext {
                    anonymous_users: config.anonymous_users.clone(),
                    exclude_ips: exclude_ips.clone(),
                    buffer: file_conf.buffer.clone(),
                    notifier: env.notifier.clone(),
                },
            );

            // sessions live in the buffer state even without lookup items
            let history: SharedHistory = match &file_conf.buffer {
                Some(buffer_conf) => {
                    let bkey = buffer_key(file_conf);
                    match shared.get(&bkey) {
                        Some(history) => history.clone(),
                        None => {
                            let state_path = state_file_path(&state_dir, &bkey);
                            let history: SharedHistory =
                                Arc::new(Mutex::new(RecordBuffer::load(buffer_conf, &state_path)?));
                            shared.insert(bkey, history.clone());
                            buffers.push((state_path, history.clone()));
                            history
                        }
                    }
                }
                None => Arc::new(Mutex::new(DummyBuffer::default())),
            };

            let alarm = if tail.num_errors_alarm > 0 {
                ErrorAlarm::Tail(TailProcAlarm::new(
                    &key,
                    app.as_str(),
                    tail.num_errors_alarm,
                    tail.err_count_time_range_secs,
                    env.notifier.clone(),
                ))
            } else {
                ErrorAlarm::Null
            };

            let processor = FileProcessor::new(
                &key,
                file_conf.tz_shift,
                LineParser::for_app(app),
                transformer,
                history,
                env.geo.clone(),
                alarm,
                env.sinks.clone(),
            );
            info!(path = %key, app_type = %app, "Tailing log file");
            files.push(TailFile {
                key: key.clone(),
                app_type: app.as_str().to_string(),
                reader: TailReader::new(&file_conf.path),
                processor,
                inactivity: Inactivity {
                    last_growth: Utc::now(),
                    alarmed: false,
                },
            });
        }

        Ok(Self {
            files,
            worklog,
            buffers,
            interval: Duration::from_secs(tail.interval_secs.max(1)),
            max_lines: tail.max_lines_per_check,
            inactivity_secs: config.alarm_max_log_inactivity_secs,
            env,
        })
    }

    pub fn files(&self) -> impl Iterator<Item = &TailFile> {
        self.files.iter()
    }

    pub fn worklog(&self) -> &Arc<Worklog> {
        &self.worklog
    }

    /// Check every file once, concurrently, and flush the worklog
    pub async fn run_tick(&mut self) -> Result<TickSummary> {
        let mut handles = Vec::with_capacity(self.files.len());
        for mut file in self.files.drain(..) {
            let worklog = self.worklog.clone();
            let max_lines = self.max_lines;
            handles.push(tokio::spawn(async move {
                let report = check_file(&mut file, worklog, max_lines).await;
                (file, report)
            }));
        }

        let mut summary = TickSummary::default();
        let now = Utc::now();
        for joined in futures::future::join_all(handles).await {
            let (mut file, report) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!(error = %e, "File check task failed, file dropped from tailing");
                    continue;
                }
            };
            summary.files += 1;
            summary.failures += report.outcome.failures;
            match &report.read {
                Ok(stats) => {
                    summary.lines += stats.lines;
                    self.watch_inactivity(&mut file, stats.bytes > 0, now);
                }
                Err(e) if e.is_transient() => {
                    summary.unavailable += 1;
                    debug!(path = %file.key, error = %e, "Log file not available");
                    self.watch_inactivity(&mut file, false, now);
                }
                Err(e) => {
                    summary.unavailable += 1;
                    error!(path = %file.key, error = %e, "Failed to read log file");
                }
            }
            self.files.push(file);
        }

        if !self.env.dry_run {
            self.worklog.flush()?;
        }
        if summary.lines > 0 {
            info!(
                files = summary.files,
                lines = summary.lines,
                failures = summary.failures,
                "Tick finished"
            );
        }
        Ok(summary)
    }

    fn watch_inactivity(&self, file: &mut TailFile, grew: bool, now: DateTime<Utc>) {
        if grew {
            file.inactivity.last_growth = now;
            file.inactivity.alarmed = false;
            return;
        }
        if self.inactivity_secs == 0 || file.inactivity.alarmed {
            return;
        }
        let idle_secs = (now - file.inactivity.last_growth).num_seconds().max(0) as u64;
        if idle_secs > self.inactivity_secs {
            warn!(path = %file.key, idle_secs, "Log file is inactive");
            self.env.notifier.notify(
                Notification::new(
                    &file.app_type,
                    format!("logfeed for {}: log file inactive", file.app_type),
                    NotificationKind::LogInactivity {
                        path: file.key.clone(),
                        idle_secs,
                    },
                )
                .line(format!("file {} has not grown for {} seconds", file.key, idle_secs)),
            );
            file.inactivity.alarmed = true;
        }
    }

    /// Tick until `cancel` fires, then persist everything.
    ///
    /// A tick that is in progress when the token fires runs to completion.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            files = self.files.len(),
            interval_secs = self.interval.as_secs(),
            "Tail supervisor started"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    self.run_tick().await?;
                }
            }
        }
        self.shutdown()
    }

    pub fn shutdown(mut self) -> Result<()> {
        for file in self.files.iter_mut() {
            file.processor.on_quit();
        }
        if self.env.dry_run {
            info!("Dry run, worklog and buffer states are not saved");
            return Ok(());
        }
        self.worklog.flush()?;
        for (path, history) in &self.buffers {
            let history = history.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = history.persist(path) {
                error!(path = %path.display(), error = %e, "Failed to save buffer state");
            }
        }
        info!("Tail supervisor stopped");
        Ok(())
    }
}

async fn check_file(file: &mut TailFile, worklog: Arc<Worklog>, max_lines: usize) -> FileReport {
    if let Ok(metadata) = std::fs::metadata(file.reader.path()) {
        worklog.rewind_truncated(&file.key, get_inode(&metadata), metadata.len());
    }
    let last = worklog.get(&file.key);
    let session = file.processor.on_check_start();
    let follow = follow_check(session, worklog.clone(), Arc::from(file.key.as_str()));
    let read = file
        .reader
        .apply_new_content(&mut file.processor, last, max_lines)
        .await;
    file.processor.on_check_stop();
    let outcome = match follow.await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(path = %file.key, error = %e, "Confirmation follower failed");
            CheckOutcome::default()
        }
    };

    if let Ok(stats) = &read {
        if !worklog.contains(&file.key) {
            if let Some(inode) = stats.inode {
                // empty or fully unconfirmed file still gets an entry
                worklog.update(
                    &file.key,
                    LogRange {
                        inode: Some(inode),
                        seek_start: 0,
                        seek_end: 0,
                        written: true,
                    },
                );
            }
        }
        if outcome.unconfirmed > 0 {
            warn!(
                path = %file.key,
                unconfirmed = outcome.unconfirmed,
                "Some lines were not confirmed by the sinks, they will be read again"
            );
        }
    }
    FileReport { read, outcome }
}

/// Resolves on ctrl-c or, on unix, SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Interrupt received"),
        _ = terminate => info!("Terminate signal received"),
    }
}

/// State file used for a file's buffer
pub fn buffer_state_path(tail: &TailConfig, file: &TailFileConfig) -> PathBuf {
    state_file_path(&tail.buffer_state_dir(), &buffer_key(file))
}
