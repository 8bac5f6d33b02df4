use super::OutputRecord;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Byte range within a file identified by its inode.
///
/// `written == false` means the range has been emitted but not yet confirmed
/// by the sinks. `inode == None` is the "unknown file" marker returned for
/// paths without a worklog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRange {
    pub inode: Option<u64>,
    pub seek_start: u64,
    pub seek_end: u64,
    pub written: bool,
}

impl LogRange {
    pub fn new(inode: u64, seek_start: u64, seek_end: u64) -> Self {
        Self {
            inode: Some(inode),
            seek_start,
            seek_end,
            written: false,
        }
    }

    /// Position for a path that has never been seen
    pub fn unknown() -> Self {
        Self {
            inode: None,
            seek_start: 0,
            seek_end: 0,
            written: true,
        }
    }

    pub fn confirmed(mut self) -> Self {
        self.written = true;
        self
    }

    pub fn len(&self) -> u64 {
        self.seek_end.saturating_sub(self.seek_start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Output record travelling to a sink together with its origin
#[derive(Debug, Clone)]
pub struct BoundOutputRecord {
    pub rec: Arc<OutputRecord>,
    pub file_path: Arc<str>,
    pub range: LogRange,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_range() {
        let r = LogRange::unknown();
        assert_eq!(r.inode, None);
        assert_eq!(r.seek_end, 0);
        assert!(r.written);
    }

    #[test]
    fn test_new_range_is_unwritten() {
        let r = LogRange::new(42, 10, 25);
        assert!(!r.written);
        assert_eq!(r.len(), 15);
        assert!(r.confirmed().written);
    }

    #[test]
    fn test_serialized_field_names() {
        let json = serde_json::to_value(LogRange::new(7, 1, 2)).unwrap();
        assert_eq!(json["inode"], 7);
        assert_eq!(json["seekStart"], 1);
        assert_eq!(json["seekEnd"], 2);
        assert_eq!(json["written"], false);
    }
}
