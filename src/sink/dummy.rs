use super::{BulkWriter, Result, SinkKind};
use crate::record::BoundOutputRecord;
use async_trait::async_trait;
use std::io::Write;

/// Dry-run writer printing records as JSON lines to stdout
#[derive(Debug)]
pub struct PrintWriter {
    kind: SinkKind,
}

impl PrintWriter {
    pub fn new(kind: SinkKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl BulkWriter for PrintWriter {
    fn kind(&self) -> SinkKind {
        self.kind
    }

    async fn write_chunk(&self, chunk: &[BoundOutputRecord]) -> Result<()> {
        // the time-series writer only acknowledges, records are printed once
        if self.kind != SinkKind::Doc {
            return Ok(());
        }
        let mut out = String::new();
        for item in chunk {
            out.push_str(&item.rec.to_json()?);
            out.push('\n');
        }
        let stdout = std::io::stdout();
        let mut lock = stdout.lock();
        let _ = lock.write_all(out.as_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::testing::bound;

    #[tokio::test]
    async fn test_print_writer_acknowledges() {
        let writer = PrintWriter::new(SinkKind::TimeSeries);
        assert!(writer
            .write_chunk(&[bound("/log/a.log", 1, 0, 10)])
            .await
            .is_ok());
    }
}
