//! Per-source history of recent input records used by the analyzers.

pub mod sample;
pub mod state;

use crate::config::types::BufferConfig;
use crate::record::{InputRecord, ServiceInput};
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

pub use state::{AnalysisState, SessionState};

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Storage of recent records grouped by clustering key
pub trait HistoryStore: Send {
    fn add(&mut self, rec: InputRecord);

    fn num_of_records(&self, key: &str) -> usize;

    fn for_each(&self, key: &str, f: &mut dyn FnMut(&InputRecord));

    /// Visit all records in time order
    fn total_for_each(&self, f: &mut dyn FnMut(&InputRecord));

    /// Number of records strictly newer than `since`
    fn total_num_of_records_since(&self, since: DateTime<Utc>) -> usize;

    /// Drop records older than `cutoff`, returning how many were removed
    fn clear_old_records(&mut self, cutoff: DateTime<Utc>) -> usize;

    fn take_state(&mut self) -> AnalysisState;

    fn set_state(&mut self, state: AnalysisState);

    /// Write the store to its state file
    fn persist(&self, path: &Path) -> Result<(), BufferError>;
}

pub type SharedHistory = Arc<Mutex<dyn HistoryStore>>;

#[derive(Debug)]
pub struct RecordBuffer {
    capacity: usize,
    max_age: Duration,
    records: HashMap<String, VecDeque<InputRecord>>,
    pub(crate) state: AnalysisState,
}

impl RecordBuffer {
    pub fn new(conf: &BufferConfig) -> Self {
        let sample_size = conf
            .bot_detection
            .as_ref()
            .map(|b| b.prev_num_reqs_sample_size)
            .unwrap_or(0);
        Self {
            capacity: conf.history_lookup_items,
            max_age: Duration::seconds(conf.max_age_secs as i64),
            records: HashMap::new(),
            state: AnalysisState {
                prev_nums: sample::ReservoirSample::new(sample_size),
                ..Default::default()
            },
        }
    }

    pub fn len(&self) -> usize {
        self.records.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.records.values().all(VecDeque::is_empty)
    }

    /// Sorted insert into the key's queue, enforcing capacity
    pub(crate) fn insert(&mut self, rec: InputRecord) {
        let key = rec.clustering_client_id();
        let queue = self.records.entry(key).or_default();
        let time = rec.time();
        let pos = queue.partition_point(|r| r.time() <= time);
        queue.insert(pos, rec);
        while queue.len() > self.capacity {
            queue.pop_front();
        }
    }

    pub(crate) fn for_each_in_time_order(&self, mut f: impl FnMut(&InputRecord)) {
        let mut all: Vec<&InputRecord> = self.records.values().flatten().collect();
        all.sort_by_key(|r| r.time());
        for rec in all {
            f(rec);
        }
    }
}

impl HistoryStore for RecordBuffer {
    fn add(&mut self, rec: InputRecord) {
        if self.capacity == 0 {
            return;
        }
        let cutoff = rec.time() - self.max_age;
        self.insert(rec);
        // zero max age keeps records until the capacity evicts them
        if self.max_age > Duration::zero() {
            self.clear_old_records(cutoff);
        }
        self.state.total_processed += 1;
    }

    fn num_of_records(&self, key: &str) -> usize {
        self.records.get(key).map(VecDeque::len).unwrap_or(0)
    }

    fn for_each(&self, key: &str, f: &mut dyn FnMut(&InputRecord)) {
        if let Some(queue) = self.records.get(key) {
            queue.iter().for_each(f);
        }
    }

    fn total_for_each(&self, f: &mut dyn FnMut(&InputRecord)) {
        self.for_each_in_time_order(f);
    }

    fn total_num_of_records_since(&self, since: DateTime<Utc>) -> usize {
        self.records
            .values()
            .map(|queue| queue.iter().rev().take_while(|r| r.time() > since).count())
            .sum()
    }

    fn clear_old_records(&mut self, cutoff: DateTime<Utc>) -> usize {
        let mut removed = 0;
        for queue in self.records.values_mut() {
            while queue.front().map(|r| r.time() < cutoff).unwrap_or(false) {
                queue.pop_front();
                removed += 1;
            }
        }
        self.records.retain(|_, queue| !queue.is_empty());
        removed
    }

    fn take_state(&mut self) -> AnalysisState {
        std::mem::take(&mut self.state)
    }

    fn set_state(&mut self, state: AnalysisState) {
        self.state = state;
    }

    fn persist(&self, path: &Path) -> Result<(), BufferError> {
        self.save(path)
    }
}

/// Used by sources with no history configured
#[derive(Debug, Default)]
pub struct DummyBuffer {
    state: AnalysisState,
}

impl HistoryStore for DummyBuffer {
    fn add(&mut self, _rec: InputRecord) {}

    fn num_of_records(&self, _key: &str) -> usize {
        0
    }

    fn for_each(&self, _key: &str, _f: &mut dyn FnMut(&InputRecord)) {}

    fn total_for_each(&self, _f: &mut dyn FnMut(&InputRecord)) {}

    fn total_num_of_records_since(&self, _since: DateTime<Utc>) -> usize {
        0
    }

    fn clear_old_records(&mut self, _cutoff: DateTime<Utc>) -> usize {
        0
    }

    fn take_state(&mut self) -> AnalysisState {
        std::mem::take(&mut self.state)
    }

    fn set_state(&mut self, state: AnalysisState) {
        self.state = state;
    }

    fn persist(&self, _path: &Path) -> Result<(), BufferError> {
        Ok(())
    }
}
