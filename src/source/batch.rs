//! One-shot catch-up over a directory of log files.

use crate::alarm::{BatchProcAlarm, ErrorAlarm};
use crate::buffer::state::state_file_path;
use crate::buffer::{BufferError, DummyBuffer, RecordBuffer, SharedHistory};
use crate::config::types::{BatchFileConfig, Config};
use crate::pipeline::ledger::follow_check;
use crate::pipeline::processor::{FileProcessor, TimeFilter};
use crate::pipeline::PipelineEnv;
use crate::record::LogRange;
use crate::services::{self, ExcludeIpList, LineParser, ServiceError, Transformer, TransformerContext};
use crate::source::reader::{ReaderError, TailReader};
use crate::source::timestamp::{TimestampDetector, TimestampError};
use crate::storage::{BatchWorklog, Worklog, WorklogError};
use chrono::{DateTime, TimeZone, Utc};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("cannot list log directory {path}: {source}")]
    ListDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Reader(#[from] ReaderError),

    #[error(transparent)]
    Timestamp(#[from] TimestampError),

    #[error(transparent)]
    Worklog(#[from] WorklogError),

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error(transparent)]
    Service(#[from] ServiceError),
}

pub type Result<T> = std::result::Result<T, BatchError>;

/// File picked for a batch run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFile {
    pub path: PathBuf,
    /// Time of the first line, or the modification time when it has none
    pub start: DateTime<Utc>,
}

fn modified(metadata: &std::fs::Metadata) -> Option<DateTime<Utc>> {
    metadata.modified().ok().map(DateTime::<Utc>::from)
}

fn first_line_time(path: &Path, detector: &TimestampDetector) -> Option<DateTime<Utc>> {
    let file = std::fs::File::open(path).ok()?;
    let mut line = String::new();
    BufReader::new(file).read_line(&mut line).ok()?;
    detector.detect(&line)
}

/// List files of `conf.src_path` worth reading for records newer than `min`.
///
/// A file qualifies when its first line is not older than `min`. With
/// `partiallyMatchingFiles` an older file still qualifies if it was
/// modified after `min`. Files are returned ordered by their start.
pub fn select_files(
    conf: &BatchFileConfig,
    min: Option<DateTime<Utc>>,
    detector: &TimestampDetector,
) -> Result<Vec<BatchFile>> {
    let entries = std::fs::read_dir(&conf.src_path).map_err(|source| BatchError::ListDir {
        path: conf.src_path.clone(),
        source,
    })?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| BatchError::ListDir {
            path: conf.src_path.clone(),
            source,
        })?;
        let path = entry.path();
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        let mtime = modified(&metadata);
        let (start, selected) = match (first_line_time(&path, detector), min) {
            (Some(first), None) => (first, true),
            (Some(first), Some(min)) if first >= min => (first, true),
            (Some(first), Some(min)) => (
                first,
                conf.partially_matching_files && mtime.map(|m| m >= min).unwrap_or(false),
            ),
            (None, min) => match mtime {
                Some(mtime) => (mtime, min.map(|min| mtime >= min).unwrap_or(true)),
                None => {
                    warn!(path = %path.display(), "No usable timestamp, skipping file");
                    continue;
                }
            },
        };
        if selected {
            files.push(BatchFile { path, start });
        } else {
            debug!(path = %path.display(), start = %start, "File older than the last run, skipping");
        }
    }
    files.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.path.cmp(&b.path)));
    Ok(files)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    pub files: usize,
    pub lines: usize,
    pub emitted: usize,
    pub failures: usize,
    pub app_errors: usize,
}

/// Reader of all selected files of one `logFiles` entry
pub struct BatchReader {
    conf: BatchFileConfig,
    worklog: BatchWorklog,
    history: SharedHistory,
    state_path: Option<PathBuf>,
    context: TransformerContext,
    env: PipelineEnv,
}

impl BatchReader {
    pub fn new(config: &Config, conf: &BatchFileConfig, env: PipelineEnv) -> Result<Self> {
        services::resolve(&conf.app_type, &conf.version)?;
        let context = TransformerContext {
            anonymous_users: config.anonymous_users.clone(),
            exclude_ips: ExcludeIpList::default(),
            buffer: conf.buffer.clone(),
            notifier: env.notifier.clone(),
        };
        // a configured buffer keeps its state even without lookup items
        let (history, state_path): (SharedHistory, Option<PathBuf>) = match &conf.buffer {
            Some(buffer) => {
                let dir = conf
                    .worklog_path
                    .parent()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("."));
                let path = state_file_path(&dir, &conf.src_path.to_string_lossy());
                let history = RecordBuffer::load(buffer, &path)?;
                (Arc::new(Mutex::new(history)), Some(path))
            }
            None => (Arc::new(Mutex::new(DummyBuffer::default())), None),
        };
        Ok(Self {
            conf: conf.clone(),
            worklog: BatchWorklog::new(&conf.worklog_path),
            history,
            state_path,
            context,
            env,
        })
    }

    pub fn batch_worklog(&self) -> &BatchWorklog {
        &self.worklog
    }

    /// Process every selected file.
    ///
    /// `from` overrides the time of the last run stored in the batch
    /// worklog. The run is recorded only when every chunk was written.
    pub async fn run(&self, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Result<BatchSummary> {
        let min = match from {
            Some(from) => Some(from),
            None => self
                .worklog
                .last_record()?
                .and_then(|ts| Utc.timestamp_opt(ts, 0).single()),
        };
        let detector = TimestampDetector::new(self.conf.tz_shift)?;
        let files = select_files(&self.conf, min, &detector)?;
        info!(
            src = %self.conf.src_path.display(),
            files = files.len(),
            min = ?min,
            "Starting batch run"
        );

        let mut summary = BatchSummary::default();
        for file in &files {
            self.read_file(&file.path, TimeFilter { from: min, to }, &mut summary)
                .await?;
        }

        if self.env.dry_run {
            info!("Dry run, batch worklog and buffer state are not saved");
        } else {
            if summary.failures == 0 {
                self.worklog.save(Utc::now().timestamp())?;
            } else {
                warn!(
                    failures = summary.failures,
                    "Some chunks were not written, the run is not recorded"
                );
            }
            if let Some(path) = &self.state_path {
                let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
                history.persist(path)?;
            }
        }
        info!(
            files = summary.files,
            lines = summary.lines,
            emitted = summary.emitted,
            app_errors = summary.app_errors,
            "Batch run finished"
        );
        Ok(summary)
    }

    async fn read_file(&self, path: &Path, filter: TimeFilter, summary: &mut BatchSummary) -> Result<()> {
        let app = services::resolve(&self.conf.app_type, &self.conf.version)?;
        let key = path.to_string_lossy().to_string();
        let mut processor = FileProcessor::new(
            &key,
            self.conf.tz_shift,
            LineParser::for_app(app),
            Transformer::for_app(app, self.context.clone()),
            self.history.clone(),
            self.env.geo.clone(),
            ErrorAlarm::Batch(BatchProcAlarm::default()),
            self.env.sinks.clone(),
        )
        .with_time_filter(filter);
        let mut reader = TailReader::new(path).with_partial_lines(true);

        info!(path = %key, "Processing batch file");
        let session = processor.on_check_start();
        let follow = follow_check(session, Arc::new(Worklog::in_memory()), Arc::from(key.as_str()));
        let read = reader
            .apply_new_content(&mut processor, LogRange::unknown(), usize::MAX)
            .await;
        processor.on_check_stop();
        let outcome = follow.await.unwrap_or_else(|e| {
            error!(path = %key, error = %e, "Confirmation follower failed");
            Default::default()
        });
        let stats = processor.stats();
        processor.on_quit();
        read?;

        summary.files += 1;
        summary.lines += stats.lines;
        summary.emitted += stats.emitted;
        summary.app_errors += stats.app_errors;
        summary.failures += outcome.failures;
        Ok(())
    }
}
