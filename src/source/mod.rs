//! Line sources: the incremental tail reader and the batch directory scan.

pub mod batch;
pub mod reader;
pub mod timestamp;

pub use batch::{BatchError, BatchReader, BatchSummary};
pub use reader::{FileTailProcessor, ReadStats, ReaderError, TailReader};
pub use timestamp::TimestampDetector;
