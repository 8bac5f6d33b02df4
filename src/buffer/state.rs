use super::sample::ReservoirSample;
use super::{BufferError, RecordBuffer};
use crate::config::types::BufferConfig;
use crate::record::InputRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const STATE_VERSION: u32 = 1;

/// Analysis state kept alongside the buffered records
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisState {
    pub prev_nums: ReservoirSample,
    #[serde(rename = "timestamp")]
    pub last_check: Option<DateTime<Utc>>,
    pub total_processed: u64,
    #[serde(default)]
    pub total_ignored: u64,
    /// Open clustering sessions by clustering key
    #[serde(default)]
    pub sessions: HashMap<String, SessionState>,
}

impl AnalysisState {
    /// Align loaded state with the current configuration
    pub fn normalize(&mut self, conf: &BufferConfig) {
        let sample_size = conf
            .bot_detection
            .as_ref()
            .map(|b| b.prev_num_reqs_sample_size)
            .unwrap_or(0);
        if self.prev_nums.cap != sample_size {
            info!(
                from = self.prev_nums.cap,
                to = sample_size,
                "Resizing previous requests sample"
            );
            self.prev_nums.resize(sample_size);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub size: usize,
    /// First record of the session, emitted once the session closes
    pub record: InputRecord,
}

#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    version: u32,
    state: AnalysisState,
    records: Vec<InputRecord>,
}

/// State file location for a buffer, named by a hash of its source key
pub fn state_file_path(dir: &Path, source_key: &str) -> PathBuf {
    let digest = Sha256::digest(source_key.as_bytes());
    let name: String = digest[..8].iter().map(|b| format!("{:02x}", b)).collect();
    dir.join(format!("{}.json", name))
}

impl RecordBuffer {
    /// Persist state and records, replacing the file atomically
    pub fn save(&self, path: &Path) -> Result<(), BufferError> {
        let mut records = Vec::with_capacity(self.len());
        self.for_each_in_time_order(|rec| records.push(rec.clone()));
        let file = StateFile {
            version: STATE_VERSION,
            state: self.state.clone(),
            records,
        };
        let json = serde_json::to_vec(&file)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        info!(path = %path.display(), records = file.records.len(), "Saved buffer state");
        Ok(())
    }

    /// Load a buffer from its state file, starting fresh when there is none
    pub fn load(conf: &BufferConfig, path: &Path) -> Result<Self, BufferError> {
        let mut buffer = RecordBuffer::new(conf);
        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No buffer state found, starting empty");
                return Ok(buffer);
            }
            Err(e) => return Err(e.into()),
        };
        let file: StateFile = serde_json::from_slice(&raw)?;
        if file.version != STATE_VERSION {
            warn!(
                "Buffer state version mismatch: {} vs {}, starting with fresh state",
                file.version, STATE_VERSION
            );
            return Ok(buffer);
        }
        let mut state = file.state;
        state.normalize(conf);
        let num_records = file.records.len();
        for rec in file.records {
            buffer.insert(rec);
        }
        buffer.state = state;
        info!(path = %path.display(), records = num_records, "Loaded buffer state");
        Ok(buffer)
    }
}

/// Remove a state file, a missing file is not an error
pub fn remove_state_file(path: &Path) -> Result<(), BufferError> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            info!(path = %path.display(), "Removed buffer state");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::HistoryStore;
    use crate::config::types::BotDetectionConfig;
    use crate::record::ServiceInput;
    use crate::services::kontext::KontextParser;
    use tempfile::TempDir;

    fn conf(sample_size: usize) -> BufferConfig {
        BufferConfig {
            id: None,
            history_lookup_items: 10,
            max_age_secs: 3600,
            analysis_interval_secs: 60,
            bot_detection: Some(BotDetectionConfig {
                prev_num_reqs_sample_size: sample_size,
                traffic_reporting_threshold: 3.0,
                ip_outlier_min_freq: 10,
                ip_outlier_coeff: 1.5,
                blocklist_ip: vec![],
            }),
        }
    }

    fn record(second: u32) -> InputRecord {
        let line = format!(
            r#"{{"logger":"QUERY","date":"2024-05-02 08:15:{:02}.0","user_id":1,"action":"query_submit","request":{{"REMOTE_ADDR":"10.0.0.1"}}}}"#,
            second
        );
        InputRecord::Kontext(KontextParser.parse(&line, 1).unwrap())
    }

    #[test]
    fn test_state_file_name_is_stable() {
        let dir = Path::new("/var/lib/logfeed");
        let a = state_file_path(dir, "/var/log/kontext/query.log");
        let b = state_file_path(dir, "/var/log/kontext/query.log");
        assert_eq!(a, b);
        assert_ne!(a, state_file_path(dir, "/var/log/other.log"));
        assert_eq!(a.extension().unwrap(), "json");
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");

        let mut buffer = RecordBuffer::new(&conf(20));
        buffer.add(record(1));
        buffer.add(record(2));
        let mut state = buffer.take_state();
        state.prev_nums.add(40);
        state.last_check = Some(record(2).time());
        buffer.set_state(state);
        buffer.save(&path).unwrap();

        let loaded = RecordBuffer::load(&conf(20), &path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.state, buffer.state);
    }

    #[test]
    fn test_load_resizes_sample() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");

        let mut buffer = RecordBuffer::new(&conf(4));
        let mut state = buffer.take_state();
        for v in [1, 2, 3, 4] {
            state.prev_nums.add(v);
        }
        buffer.set_state(state);
        buffer.save(&path).unwrap();

        let mut loaded = RecordBuffer::load(&conf(2), &path).unwrap();
        let state = loaded.take_state();
        assert_eq!(state.prev_nums.cap, 2);
        assert_eq!(state.prev_nums.data, vec![1, 2]);
    }

    #[test]
    fn test_unknown_version_starts_fresh() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(
            &path,
            r#"{"version": 99, "state": {"prevNums": {"data": [], "cap": 0}, "timestamp": null, "totalProcessed": 5}, "records": []}"#,
        )
        .unwrap();

        let mut loaded = RecordBuffer::load(&conf(20), &path).unwrap();
        assert_eq!(loaded.take_state().total_processed, 0);
    }

    #[test]
    fn test_missing_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let loaded = RecordBuffer::load(&conf(20), &dir.path().join("none.json")).unwrap();
        assert_eq!(loaded.len(), 0);
    }

    #[test]
    fn test_remove_missing_state_file() {
        let dir = TempDir::new().unwrap();
        assert!(remove_state_file(&dir.path().join("none.json")).is_ok());
    }
}
