use crate::alarm::ErrorAlarm;
use crate::buffer::SharedHistory;
use crate::geo::{apply_location, GeoLookup};
use crate::pipeline::channel::{create_channel, Sender};
use crate::pipeline::ledger::{merge_confirmations, CheckSession, Tracked};
use crate::record::{BoundOutputRecord, InputRecord, LogRange, OutputRecord, ServiceInput};
use crate::services::{LineParser, ParseError, Transformer};
use crate::sink::{run_write_consumer, BulkWriter, SinkKind};
use crate::source::reader::FileTailProcessor;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// A sink writer together with its chunk size
#[derive(Clone)]
pub struct SinkSpec {
    pub writer: Arc<dyn BulkWriter>,
    pub chunk_size: usize,
}

impl SinkSpec {
    pub fn new(writer: Arc<dyn BulkWriter>, chunk_size: usize) -> Self {
        Self { writer, chunk_size }
    }

    /// Input buffer of the consumer, the document sink gets two chunks
    fn buffer_size(&self) -> usize {
        match self.writer.kind() {
            SinkKind::Doc => 2 * self.chunk_size.max(1),
            SinkKind::TimeSeries => self.chunk_size.max(1),
        }
    }
}

impl std::fmt::Debug for SinkSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkSpec")
            .field("kind", &self.writer.kind())
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}

/// Optional `[from, to]` window on record time
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeFilter {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

#[derive(Debug, PartialEq, Eq)]
enum Window {
    Before,
    Inside,
    After,
}

impl TimeFilter {
    fn check(&self, time: DateTime<Utc>) -> Window {
        if self.from.map(|from| time < from).unwrap_or(false) {
            Window::Before
        } else if self.to.map(|to| time > to).unwrap_or(false) {
            Window::After
        } else {
            Window::Inside
        }
    }

    pub fn is_empty(&self) -> bool {
        self.from.is_none() && self.to.is_none()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorStats {
    pub lines: usize,
    pub emitted: usize,
    pub ignored: usize,
    pub parse_errors: usize,
    pub app_errors: usize,
    pub transform_errors: usize,
}

struct ActiveCheck {
    inputs: Vec<Sender<BoundOutputRecord>>,
    tracked: mpsc::UnboundedSender<Tracked>,
}

impl ActiveCheck {
    fn track(&self, item: Tracked) {
        if self.tracked.send(item).is_err() {
            debug!("Check follower is gone");
        }
    }
}

/// Per-file coordinator: parse, preprocess, transform, enrich and fan out
pub struct FileProcessor {
    file_path: Arc<str>,
    tz_shift: i32,
    parser: LineParser,
    transformer: Transformer,
    history: SharedHistory,
    geo: Arc<dyn GeoLookup>,
    alarm: ErrorAlarm,
    sinks: Vec<SinkSpec>,
    filter: TimeFilter,
    check: Option<ActiveCheck>,
    past_window: bool,
    stats: ProcessorStats,
}

impl FileProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        file_path: &str,
        tz_shift: i32,
        parser: LineParser,
        transformer: Transformer,
        history: SharedHistory,
        geo: Arc<dyn GeoLookup>,
        alarm: ErrorAlarm,
        sinks: Vec<SinkSpec>,
    ) -> Self {
        Self {
            file_path: Arc::from(file_path),
            tz_shift,
            parser,
            transformer,
            history,
            geo,
            alarm,
            sinks,
            filter: TimeFilter::default(),
            check: None,
            past_window: false,
            stats: ProcessorStats::default(),
        }
    }

    pub fn with_time_filter(mut self, filter: TimeFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn file_path(&self) -> &str {
        &self.file_path
    }

    pub fn app_type(&self) -> &'static str {
        self.transformer.app_type().as_str()
    }

    pub fn history(&self) -> &SharedHistory {
        &self.history
    }

    pub fn stats(&self) -> ProcessorStats {
        self.stats
    }

    /// Start the sink consumers of a new check.
    ///
    /// With no sinks configured every line is tracked as ignored.
    pub fn on_check_start(&mut self) -> CheckSession {
        let (tracked_tx, tracked_rx) = mpsc::unbounded_channel();
        let mut inputs = Vec::with_capacity(self.sinks.len());
        let mut confirmations = Vec::with_capacity(self.sinks.len());
        for sink in &self.sinks {
            let (tx, rx) = create_channel(sink.buffer_size());
            let (conf_rx, _handle) = run_write_consumer(sink.writer.clone(), rx, sink.chunk_size);
            inputs.push(tx);
            confirmations.push(conf_rx);
        }
        self.check = Some(ActiveCheck {
            inputs,
            tracked: tracked_tx,
        });
        self.past_window = false;
        self.stats = ProcessorStats::default();
        CheckSession {
            sinks: self.sinks.iter().map(|s| s.writer.kind()).collect(),
            confirmations: merge_confirmations(confirmations),
            tracked: tracked_rx,
        }
    }

    /// Close the sink inputs, the consumers flush their last chunks
    pub fn on_check_stop(&mut self) {
        self.check = None;
        self.alarm.evaluate();
        if self.stats.lines > 0 {
            debug!(
                path = %self.file_path,
                lines = self.stats.lines,
                emitted = self.stats.emitted,
                ignored = self.stats.ignored,
                parse_errors = self.stats.parse_errors,
                "Check finished"
            );
        }
    }

    pub fn on_quit(&mut self) {
        self.check = None;
        self.alarm.reset();
        info!(path = %self.file_path, "Processor stopped");
    }

    fn handle_parse_error(&mut self, err: ParseError) {
        match err {
            ParseError::LineParsing { .. } => {
                self.stats.parse_errors += 1;
                info!(path = %self.file_path, error = %err, "Skipping unparseable line");
            }
            ParseError::AppLog { time, .. } => {
                self.stats.app_errors += 1;
                self.alarm.on_error(time);
            }
            ParseError::Other(_) => {
                self.stats.parse_errors += 1;
                warn!(path = %self.file_path, error = %err, "Failed to process line");
            }
        }
    }

    /// Synchronous part of a line: everything up to the sink hand-off
    fn process_line(&mut self, line: &str, line_num: i64) -> Vec<Arc<OutputRecord>> {
        let rec = match self.parser.parse(line, line_num) {
            Ok(rec) => rec,
            Err(e) => {
                self.handle_parse_error(e);
                return Vec::new();
            }
        };
        if !rec.is_processable() {
            return Vec::new();
        }
        match self.filter.check(rec.time()) {
            Window::Before => return Vec::new(),
            Window::After => {
                self.past_window = true;
                return Vec::new();
            }
            Window::Inside => {}
        }

        let records: Vec<InputRecord> = {
            let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
            let records = self.transformer.preprocess(rec, &mut *history);
            if records.is_empty() {
                let mut state = history.take_state();
                state.total_ignored += 1;
                history.set_state(state);
            }
            for rec in &records {
                history.add(rec.clone());
            }
            records
        };

        let mut outputs = Vec::with_capacity(records.len());
        for rec in &records {
            match self.transformer.transform(rec, self.tz_shift) {
                Ok(mut out) => {
                    apply_location(&mut out, self.geo.as_ref());
                    outputs.push(Arc::new(out));
                }
                Err(e) => {
                    self.stats.transform_errors += 1;
                    warn!(path = %self.file_path, error = %e, "Failed to transform record");
                }
            }
        }
        outputs
    }
}

#[async_trait]
impl FileTailProcessor for FileProcessor {
    async fn on_entry(&mut self, line: &str, line_num: i64, range: LogRange) {
        self.stats.lines += 1;
        let outputs = if line.trim().is_empty() {
            Vec::new()
        } else {
            self.process_line(line, line_num)
        };

        let Some(check) = self.check.as_ref() else {
            error!(path = %self.file_path, "Line received outside of a check");
            return;
        };
        if outputs.is_empty() || check.inputs.is_empty() {
            self.stats.ignored += 1;
            check.track(Tracked::Ignored { range });
            return;
        }

        self.stats.emitted += outputs.len();
        check.track(Tracked::Emitted {
            range,
            records: outputs.len(),
        });
        for rec in outputs {
            for input in &check.inputs {
                let item = BoundOutputRecord {
                    rec: rec.clone(),
                    file_path: self.file_path.clone(),
                    range,
                };
                if input.send(item).await.is_err() {
                    error!(path = %self.file_path, "Sink consumer stopped, record not delivered");
                }
            }
        }
    }

    fn should_stop(&self) -> bool {
        self.past_window
    }
}
