use crate::record::LogRange;
use async_trait::async_trait;
use std::fs::{File, Metadata};
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("log file {0} does not exist")]
    Missing(PathBuf),
}

impl ReaderError {
    /// Errors which only postpone reading to the next check
    pub fn is_transient(&self) -> bool {
        matches!(self, ReaderError::Missing(_))
    }
}

/// Receiver of lines read from a tailed file
#[async_trait]
pub trait FileTailProcessor: Send {
    /// `range` covers the line including its terminating newline
    async fn on_entry(&mut self, line: &str, line_num: i64, range: LogRange);

    /// Checked after every line, `true` ends the current check early
    fn should_stop(&self) -> bool {
        false
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReadStats {
    pub lines: usize,
    pub bytes: u64,
    pub inode: Option<u64>,
    /// position after the last line handed to the processor
    pub seek: u64,
    pub eof: bool,
}

/// Inode-aware incremental reader for one file.
///
/// The reader is kept between checks. Each call to
/// [`TailReader::apply_new_content`] reconciles the internal position with
/// the last known worklog position and hands at most `max_lines` complete
/// lines to the processor.
#[derive(Debug)]
pub struct TailReader {
    path: PathBuf,
    file: Option<BufReader<File>>,
    inode: Option<u64>,
    seek: u64,
    line_num: i64,
    partial_lines: bool,
}

impl TailReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
            inode: None,
            seek: 0,
            line_num: 0,
            partial_lines: false,
        }
    }

    /// Also emit a final line missing its newline (batch reading)
    pub fn with_partial_lines(mut self, partial_lines: bool) -> Self {
        self.partial_lines = partial_lines;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn inode(&self) -> Option<u64> {
        self.inode
    }

    pub fn seek(&self) -> u64 {
        self.seek
    }

    fn open(&mut self, inode: u64) -> Result<(), ReaderError> {
        let file = File::open(&self.path).map_err(|e| self.map_open_error(e))?;
        self.file = Some(BufReader::new(file));
        self.inode = Some(inode);
        self.seek = 0;
        self.line_num = 0;
        Ok(())
    }

    fn map_open_error(&self, e: std::io::Error) -> ReaderError {
        if e.kind() == std::io::ErrorKind::NotFound {
            ReaderError::Missing(self.path.clone())
        } else {
            ReaderError::Io(e)
        }
    }

    /// Decide where this check starts reading
    fn reconcile(&mut self, metadata: &Metadata, last: &LogRange) -> Result<(), ReaderError> {
        let current_inode = get_inode(metadata);
        if self.file.is_none() || self.inode != Some(current_inode) {
            let reopened = self.file.is_some();
            self.open(current_inode)?;
            if last.inode == Some(current_inode) {
                self.seek = if last.written {
                    last.seek_end
                } else {
                    last.seek_start
                };
            } else if last.inode.is_some() || reopened {
                info!(
                    path = %self.path.display(),
                    old_inode = ?last.inode,
                    new_inode = current_inode,
                    "Log rotation detected, reading new file from the start"
                );
            }
        } else if last.inode != Some(current_inode) {
            // the stored position belongs to another file
            self.seek = 0;
        } else if !last.written {
            debug!(path = %self.path.display(), seek = last.seek_start, "Retrying unconfirmed range");
            self.seek = last.seek_start;
        } else if self.seek != last.seek_end {
            debug!(
                path = %self.path.display(),
                internal = self.seek,
                stored = last.seek_end,
                "Reader position corrected"
            );
            self.seek = last.seek_end;
        }

        if metadata.len() < self.seek {
            info!(
                path = %self.path.display(),
                size = metadata.len(),
                seek = self.seek,
                "File truncated, reading from the start"
            );
            self.seek = 0;
            self.line_num = 0;
        }
        Ok(())
    }

    /// Read new lines and pass them to `processor`
    pub async fn apply_new_content<P>(
        &mut self,
        processor: &mut P,
        last: LogRange,
        max_lines: usize,
    ) -> Result<ReadStats, ReaderError>
    where
        P: FileTailProcessor + ?Sized,
    {
        let metadata = std::fs::metadata(&self.path).map_err(|e| self.map_open_error(e))?;
        self.reconcile(&metadata, &last)?;

        let mut stats = ReadStats {
            inode: self.inode,
            seek: self.seek,
            ..Default::default()
        };
        let (Some(file), Some(inode)) = (self.file.as_mut(), self.inode) else {
            return Ok(stats);
        };
        file.seek(SeekFrom::Start(self.seek))?;

        let mut buf = Vec::new();
        while stats.lines < max_lines {
            buf.clear();
            let n = file.read_until(b'\n', &mut buf)?;
            if n == 0 {
                stats.eof = true;
                break;
            }
            if buf.last() != Some(&b'\n') && !self.partial_lines {
                // the rest of the line has not been written yet
                file.seek(SeekFrom::Start(self.seek))?;
                stats.eof = true;
                break;
            }
            let start = self.seek;
            self.seek += n as u64;
            self.line_num += 1;
            let text = String::from_utf8_lossy(&buf);
            let line = text.trim_end_matches(['\n', '\r']);
            processor
                .on_entry(line, self.line_num, LogRange::new(inode, start, self.seek))
                .await;
            stats.lines += 1;
            stats.bytes += n as u64;
            if processor.should_stop() {
                break;
            }
        }
        stats.seek = self.seek;
        Ok(stats)
    }
}

// Platform-specific inode retrieval
#[cfg(unix)]
pub fn get_inode(metadata: &Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.ino()
}

#[cfg(not(unix))]
pub fn get_inode(metadata: &Metadata) -> u64 {
    // no stable file identity, creation time is the best proxy
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    if let Ok(created) = metadata.created() {
        created.hash(&mut hasher);
    }
    hasher.finish()
}

/// Inode of the file currently at `path`
pub fn inode_of(path: &Path) -> Option<u64> {
    std::fs::metadata(path).ok().map(|m| get_inode(&m))
}
