use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

use super::worklog::{Result, WorklogError};

/// Append-only list of unix timestamps of finished batch runs.
///
/// Lines starting with `#` are comments, the last timestamp wins.
#[derive(Debug, Clone)]
pub struct BatchWorklog {
    path: PathBuf,
}

impl BatchWorklog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Timestamp of the last finished run, `None` when nothing ran yet
    pub fn last_record(&self) -> Result<Option<i64>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "No batch worklog present, all found files will be processed");
                return Ok(None);
            }
            Err(source) => {
                return Err(WorklogError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        Ok(raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .last()
            .and_then(|line| line.parse().ok()))
    }

    pub fn save(&self, timestamp: i64) -> Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| WorklogError::Io {
                path: self.path.clone(),
                source,
            })?;
        writeln!(file, "{}", timestamp).map_err(|source| WorklogError::Io {
            path: self.path.clone(),
            source,
        })
    }

    pub fn reset(&self) -> Result<()> {
        match std::fs::write(&self.path, "") {
            Ok(()) => Ok(()),
            Err(source) => Err(WorklogError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_last_record_skips_comments() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("batch.worklog");
        std::fs::write(&path, "# started manually\n1700000000\n1700003600\n# note\n\n").unwrap();
        let worklog = BatchWorklog::new(&path);
        assert_eq!(worklog.last_record().unwrap(), Some(1700003600));
    }

    #[test]
    fn test_save_appends() {
        let dir = TempDir::new().unwrap();
        let worklog = BatchWorklog::new(dir.path().join("batch.worklog"));
        assert_eq!(worklog.last_record().unwrap(), None);
        worklog.save(100).unwrap();
        worklog.save(200).unwrap();
        assert_eq!(worklog.last_record().unwrap(), Some(200));
        worklog.reset().unwrap();
        assert_eq!(worklog.last_record().unwrap(), None);
    }
}
