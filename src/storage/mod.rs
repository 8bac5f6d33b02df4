pub mod batch_worklog;
pub mod worklog;

pub use batch_worklog::BatchWorklog;
pub use worklog::{Worklog, WorklogEntry, WorklogError};
