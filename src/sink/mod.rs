//! Chunked bulk writers for the document index and the time-series store.
//!
//! Each consumer owns its input channel, groups records into chunks and
//! reports one [`Confirmation`] per chunk. Failed chunks are not retried,
//! the tail engine re-reads unconfirmed byte ranges on the next check.

pub mod dummy;
pub mod elastic;
pub mod influx;

use crate::pipeline::channel::{create_channel, Receiver};
use crate::record::{BoundOutputRecord, LogRange};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Capacity of each consumer's confirmation channel
pub const CONFIRMATION_BUFFER: usize = 10;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("sink returned error status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("bulk write reported item errors: {0}")]
    ItemErrors(String),
}

pub type Result<T> = std::result::Result<T, SinkError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SinkKind {
    Doc,
    TimeSeries,
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkKind::Doc => f.write_str("doc"),
            SinkKind::TimeSeries => f.write_str("timeseries"),
        }
    }
}

/// Outcome of one chunk write
#[derive(Debug, Clone)]
pub struct Confirmation {
    pub sink: SinkKind,
    pub file_path: Arc<str>,
    /// `written` mirrors `error.is_none()`
    pub range: LogRange,
    pub records: usize,
    pub error: Option<String>,
}

impl Confirmation {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[async_trait]
pub trait BulkWriter: Send + Sync {
    fn kind(&self) -> SinkKind;

    async fn write_chunk(&self, chunk: &[BoundOutputRecord]) -> Result<()>;
}

fn chunk_range(chunk: &[BoundOutputRecord]) -> LogRange {
    match (chunk.first(), chunk.last()) {
        (Some(first), Some(last)) => LogRange {
            inode: first.range.inode,
            seek_start: first.range.seek_start,
            seek_end: last.range.seek_end,
            written: false,
        },
        _ => LogRange::default(),
    }
}

async fn flush_chunk(
    writer: &dyn BulkWriter,
    chunk: &mut Vec<BoundOutputRecord>,
) -> Option<Confirmation> {
    let first = chunk.first()?;
    let file_path = first.file_path.clone();
    let mut range = chunk_range(chunk);
    let records = chunk.len();
    let error = match writer.write_chunk(chunk).await {
        Ok(()) => {
            debug!(sink = %writer.kind(), records, path = %file_path, "Chunk written");
            range.written = true;
            None
        }
        Err(e) => {
            error!(sink = %writer.kind(), records, path = %file_path, error = %e, "Failed to write chunk");
            Some(e.to_string())
        }
    };
    chunk.clear();
    Some(Confirmation {
        sink: writer.kind(),
        file_path,
        range,
        records,
        error,
    })
}

/// Start a consumer task draining `input` into `writer`.
///
/// A chunk is written once it holds `chunk_size` records, when records of
/// another file arrive, or when the input closes. The returned channel
/// closes after the last confirmation.
pub fn run_write_consumer(
    writer: Arc<dyn BulkWriter>,
    mut input: Receiver<BoundOutputRecord>,
    chunk_size: usize,
) -> (Receiver<Confirmation>, JoinHandle<()>) {
    let (tx, rx) = create_channel(CONFIRMATION_BUFFER);
    let chunk_size = chunk_size.max(1);
    let handle = tokio::spawn(async move {
        let mut chunk: Vec<BoundOutputRecord> = Vec::with_capacity(chunk_size);
        while let Some(item) = input.recv().await {
            let other_file = chunk
                .first()
                .map(|first| first.file_path != item.file_path)
                .unwrap_or(false);
            if other_file {
                if let Some(conf) = flush_chunk(writer.as_ref(), &mut chunk).await {
                    if tx.send(conf).await.is_err() {
                        debug!("Confirmation receiver dropped");
                    }
                }
            }
            chunk.push(item);
            if chunk.len() >= chunk_size {
                if let Some(conf) = flush_chunk(writer.as_ref(), &mut chunk).await {
                    if tx.send(conf).await.is_err() {
                        debug!("Confirmation receiver dropped");
                    }
                }
            }
        }
        if let Some(conf) = flush_chunk(writer.as_ref(), &mut chunk).await {
            if tx.send(conf).await.is_err() {
                debug!("Confirmation receiver dropped");
            }
        }
    });
    (rx, handle)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::record::OutputRecord;
    use crate::services::kontext::KontextParser;
    use crate::services::{AppType, Transformer, TransformerContext};
    use std::sync::Mutex;

    /// Records chunks in memory, optionally failing every write
    pub struct MemoryWriter {
        pub kind: SinkKind,
        pub fail: bool,
        pub chunks: Mutex<Vec<Vec<String>>>,
    }

    impl MemoryWriter {
        pub fn new(kind: SinkKind, fail: bool) -> Self {
            Self {
                kind,
                fail,
                chunks: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl BulkWriter for MemoryWriter {
        fn kind(&self) -> SinkKind {
            self.kind
        }

        async fn write_chunk(&self, chunk: &[BoundOutputRecord]) -> Result<()> {
            if self.fail {
                return Err(SinkError::Status {
                    status: 500,
                    message: "unavailable".to_string(),
                });
            }
            use crate::record::ServiceOutput;
            self.chunks
                .lock()
                .unwrap()
                .push(chunk.iter().map(|r| r.rec.id().to_string()).collect());
            Ok(())
        }
    }

    pub fn output(user_id: i64) -> OutputRecord {
        let line = format!(
            r#"{{"logger":"QUERY","date":"2024-05-02 08:15:01.0","user_id":{},"action":"query_submit","request":{{"REMOTE_ADDR":"10.0.0.1"}},"args":{{"corpname":"syn2020"}}}}"#,
            user_id
        );
        let rec = crate::record::InputRecord::Kontext(KontextParser.parse(&line, 1).unwrap());
        Transformer::for_app(AppType::Kontext, TransformerContext::default())
            .transform(&rec, 0)
            .unwrap()
    }

    pub fn bound(path: &str, user_id: i64, start: u64, end: u64) -> BoundOutputRecord {
        BoundOutputRecord {
            rec: Arc::new(output(user_id)),
            file_path: Arc::from(path),
            range: LogRange::new(42, start, end),
        }
    }
}
