#![allow(dead_code)]

use async_trait::async_trait;
use logfeed::config::types::{TailConfig, TailFileConfig};
use logfeed::config::Config;
use logfeed::geo::NullGeoLookup;
use logfeed::notify::Notifier;
use logfeed::pipeline::supervisor::TailSupervisor;
use logfeed::pipeline::{PipelineEnv, SinkSpec};
use logfeed::record::{BoundOutputRecord, ServiceOutput};
use logfeed::sink::{BulkWriter, Result, SinkError, SinkKind};
use logfeed::storage::Worklog;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Keeps written record ids, the first `fail_next` writes fail
pub struct RecordingWriter {
    kind: SinkKind,
    fail_next: AtomicUsize,
    calls: AtomicUsize,
    fail_calls: Mutex<Vec<usize>>,
    pub written: Mutex<Vec<String>>,
}

impl RecordingWriter {
    pub fn new(kind: SinkKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            fail_next: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            fail_calls: Mutex::new(Vec::new()),
            written: Mutex::new(Vec::new()),
        })
    }

    pub fn fail_next(&self, writes: usize) {
        self.fail_next.store(writes, Ordering::SeqCst);
    }

    /// Fail the `call`th write, counting from 1
    pub fn fail_call(&self, call: usize) {
        self.fail_calls.lock().unwrap().push(call);
    }

    pub fn count(&self) -> usize {
        self.written.lock().unwrap().len()
    }
}

#[async_trait]
impl BulkWriter for RecordingWriter {
    fn kind(&self) -> SinkKind {
        self.kind
    }

    async fn write_chunk(&self, chunk: &[BoundOutputRecord]) -> Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
            || self.fail_calls.lock().unwrap().contains(&call);
        if failing {
            return Err(SinkError::Status {
                status: 503,
                message: "index unavailable".to_string(),
            });
        }
        let mut written = self.written.lock().unwrap();
        written.extend(chunk.iter().map(|item| item.rec.id().to_string()));
        Ok(())
    }
}

pub fn mapka_line(second: u32, session: &str) -> String {
    mapka_line_at(&format!("2024-05-02T08:15:{:02}.000+00:00", second), session, second)
}

pub fn mapka_line_at(datetime: &str, session: &str, tile: u32) -> String {
    format!(
        r#"{{"type":"mapka","message":"request","level_name":"INFO","datetime":"{}","extra":{{"session_selector":"{}","user_id":"1024","url":"https://mapy.example.org/api/tiles/12/{}","ip":"10.1.1.1","http_method":"GET"}}}}"#,
        datetime, session, tile
    )
}

pub fn lines(from: u32, to: u32) -> String {
    (from..to).map(|s| mapka_line(s, "s1") + "\n").collect()
}

pub fn append(path: &Path, text: &str) {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    file.write_all(text.as_bytes()).unwrap();
}

pub fn tail_config(dir: &Path, files: &[&Path]) -> TailConfig {
    TailConfig {
        interval_secs: 1,
        worklog_path: dir.join("state").join("worklog.json"),
        max_lines_per_check: 1000,
        num_errors_alarm: 0,
        err_count_time_range_secs: 0,
        exclude_ip_list: Vec::new(),
        buffer_state_dir: None,
        files: files
            .iter()
            .map(|path| TailFileConfig {
                path: path.to_path_buf(),
                app_type: "mapka".to_string(),
                version: "3".to_string(),
                tz_shift: 0,
                buffer: None,
            })
            .collect(),
    }
}

pub fn env(writers: &[Arc<RecordingWriter>], chunk_size: usize) -> PipelineEnv {
    PipelineEnv {
        sinks: writers
            .iter()
            .map(|w| SinkSpec::new(w.clone() as Arc<dyn BulkWriter>, chunk_size))
            .collect(),
        geo: Arc::new(NullGeoLookup),
        notifier: Notifier::default(),
        dry_run: false,
    }
}

pub fn supervisor(tail: &TailConfig, env: PipelineEnv) -> (TailSupervisor, Arc<Worklog>) {
    let worklog = Arc::new(Worklog::load(&tail.worklog_path).unwrap());
    let supervisor =
        TailSupervisor::from_config(&Config::default(), tail, worklog.clone(), env).unwrap();
    (supervisor, worklog)
}

pub fn key(path: &PathBuf) -> String {
    path.to_string_lossy().to_string()
}

pub fn file_len(path: &Path) -> u64 {
    std::fs::metadata(path).unwrap().len()
}
