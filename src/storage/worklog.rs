use crate::record::LogRange;
use crate::source::reader::get_inode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum WorklogError {
    #[error("worklog io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid worklog {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, WorklogError>;

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> WorklogError + '_ {
    move |source| WorklogError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Confirmed position within one file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorklogEntry {
    pub inode: u64,
    pub seek_end: u64,
}

/// Durable cursor state of the tail engine, keyed by file path.
///
/// Updates live in memory until [`Worklog::flush`], which replaces the
/// file atomically and keeps the previous version as `<path>.bak`.
#[derive(Debug)]
pub struct Worklog {
    path: PathBuf,
    entries: Mutex<HashMap<String, WorklogEntry>>,
}

impl Worklog {
    /// Read the worklog, a missing file means an empty one
    pub fn load(path: &Path) -> Result<Self> {
        let entries = match std::fs::read(path) {
            Ok(raw) if raw.iter().all(u8::is_ascii_whitespace) => HashMap::new(),
            Ok(raw) => serde_json::from_slice(&raw).map_err(|source| WorklogError::Json {
                path: path.to_path_buf(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No worklog found, starting from scratch");
                HashMap::new()
            }
            Err(e) => return Err(io_err(path)(e)),
        };
        Ok(Self {
            path: path.to_path_buf(),
            entries: Mutex::new(entries),
        })
    }

    /// Positions which are never written to disk, used by batch runs
    pub fn in_memory() -> Self {
        Self {
            path: PathBuf::new(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, WorklogEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stored position, [`LogRange::unknown`] for paths never seen
    pub fn get(&self, file_path: &str) -> LogRange {
        match self.entries().get(file_path) {
            Some(entry) => LogRange {
                inode: Some(entry.inode),
                seek_start: entry.seek_end,
                seek_end: entry.seek_end,
                written: true,
            },
            None => LogRange::unknown(),
        }
    }

    pub fn contains(&self, file_path: &str) -> bool {
        self.entries().contains_key(file_path)
    }

    /// Advance the entry to `range`.
    ///
    /// Only written ranges count, and within one inode the position never
    /// moves backwards. Returns whether the entry changed.
    pub fn update(&self, file_path: &str, range: LogRange) -> bool {
        let Some(inode) = range.inode else {
            return false;
        };
        if !range.written {
            return false;
        }
        let mut entries = self.entries();
        let new_entry = WorklogEntry {
            inode,
            seek_end: range.seek_end,
        };
        match entries.get(file_path) {
            Some(old) if old.inode == inode && range.seek_end < old.seek_end => {
                debug!(
                    path = file_path,
                    old = old.seek_end,
                    new = range.seek_end,
                    "Ignoring backward worklog update"
                );
                false
            }
            Some(old) if *old == new_entry => false,
            _ => {
                entries.insert(file_path.to_string(), new_entry);
                true
            }
        }
    }

    /// Point the entry at the start of the file's current inode
    pub fn reset_file(&self, file_path: &str) -> Result<u64> {
        let path = Path::new(file_path);
        let metadata = std::fs::metadata(path).map_err(io_err(path))?;
        let inode = get_inode(&metadata);
        self.entries().insert(
            file_path.to_string(),
            WorklogEntry { inode, seek_end: 0 },
        );
        info!(path = file_path, inode, "Worklog entry reset");
        Ok(inode)
    }

    /// Rewind the entry to 0 when its inode shrank below the stored position.
    ///
    /// A copy-truncated file keeps its inode, so [`Worklog::update`] would
    /// otherwise refuse every position below the old one.
    pub fn rewind_truncated(&self, file_path: &str, inode: u64, len: u64) -> bool {
        let mut entries = self.entries();
        match entries.get_mut(file_path) {
            Some(entry) if entry.inode == inode && len < entry.seek_end => {
                info!(
                    path = file_path,
                    inode,
                    size = len,
                    seek_end = entry.seek_end,
                    "File truncated, worklog entry rewound"
                );
                entry.seek_end = 0;
                true
            }
            _ => false,
        }
    }

    /// Write the worklog: backup of the previous file, temp file, rename
    pub fn flush(&self) -> Result<()> {
        let snapshot = self.entries().clone();
        let json = serde_json::to_vec_pretty(&snapshot).map_err(|source| WorklogError::Json {
            path: self.path.clone(),
            source,
        })?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        if self.path.exists() {
            let backup = self.sibling("bak");
            std::fs::copy(&self.path, &backup).map_err(io_err(&backup))?;
        }
        let tmp = self.sibling("tmp");
        std::fs::write(&tmp, json).map_err(io_err(&tmp))?;
        std::fs::rename(&tmp, &self.path).map_err(io_err(&self.path))?;
        debug!(path = %self.path.display(), entries = snapshot.len(), "Worklog flushed");
        Ok(())
    }

    pub fn close(self) -> Result<()> {
        self.flush()
    }

    fn sibling(&self, ext: &str) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".");
        name.push(ext);
        PathBuf::from(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    fn written(inode: u64, seek_end: u64) -> LogRange {
        LogRange::new(inode, 0, seek_end).confirmed()
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let worklog = Worklog::load(&dir.path().join("worklog.json")).unwrap();
        assert_eq!(worklog.get("/log/a.log"), LogRange::unknown());
    }

    #[test]
    fn test_update_rules() {
        let dir = TempDir::new().unwrap();
        let worklog = Worklog::load(&dir.path().join("worklog.json")).unwrap();

        assert!(!worklog.update("/log/a.log", LogRange::new(42, 0, 100)));
        assert!(worklog.update("/log/a.log", written(42, 100)));
        assert!(!worklog.update("/log/a.log", written(42, 50)));
        assert_eq!(worklog.get("/log/a.log").seek_end, 100);

        // a new inode may start over
        assert!(worklog.update("/log/a.log", written(43, 10)));
        let pos = worklog.get("/log/a.log");
        assert_eq!((pos.inode, pos.seek_end), (Some(43), 10));
    }

    #[test]
    fn test_flush_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("worklog.json");
        let worklog = Worklog::load(&path).unwrap();
        worklog.update("/log/a.log", written(42, 120));
        worklog.flush().unwrap();

        let raw: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["/log/a.log"]["inode"], 42);
        assert_eq!(raw["/log/a.log"]["seekEnd"], 120);

        worklog.update("/log/a.log", written(42, 200));
        worklog.close().unwrap();
        assert!(dir.path().join("worklog.json.bak").exists());
        assert!(!dir.path().join("worklog.json.tmp").exists());

        let reloaded = Worklog::load(&path).unwrap();
        assert_eq!(reloaded.get("/log/a.log").seek_end, 200);
        let backup = Worklog::load(&dir.path().join("worklog.json.bak")).unwrap();
        assert_eq!(backup.get("/log/a.log").seek_end, 120);
    }

    #[test]
    fn test_reset_file_uses_current_inode() {
        let dir = TempDir::new().unwrap();
        let mut log = NamedTempFile::new().unwrap();
        writeln!(log, "line").unwrap();
        let log_path = log.path().to_string_lossy().to_string();

        let worklog = Worklog::load(&dir.path().join("worklog.json")).unwrap();
        worklog.update(&log_path, written(1, 999));
        let inode = worklog.reset_file(&log_path).unwrap();
        let pos = worklog.get(&log_path);
        assert_eq!(pos.inode, Some(inode));
        assert_eq!(pos.seek_end, 0);
    }

    #[test]
    fn test_rewind_truncated_same_inode_only() {
        let dir = TempDir::new().unwrap();
        let worklog = Worklog::load(&dir.path().join("worklog.json")).unwrap();
        worklog.update("/log/a.log", written(42, 500));

        assert!(!worklog.rewind_truncated("/log/a.log", 42, 800));
        assert!(!worklog.rewind_truncated("/log/a.log", 43, 10));
        assert!(!worklog.rewind_truncated("/log/b.log", 42, 10));
        assert_eq!(worklog.get("/log/a.log").seek_end, 500);

        assert!(worklog.rewind_truncated("/log/a.log", 42, 120));
        assert_eq!(worklog.get("/log/a.log").seek_end, 0);
        // positions after the rewind are accepted again
        assert!(worklog.update("/log/a.log", written(42, 120)));
        assert_eq!(worklog.get("/log/a.log").seek_end, 120);
    }

    #[test]
    fn test_invalid_json_is_error() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{{broken").unwrap();
        assert!(matches!(
            Worklog::load(file.path()),
            Err(WorklogError::Json { .. })
        ));
    }
}
