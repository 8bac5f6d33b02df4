//! Bookkeeping between what a check emitted and what the sinks confirmed.
//!
//! Every line read during a check is tracked in file order, either as
//! ignored or as emitted together with the number of output records it
//! produced. Sink confirmations consume those records from the front. The
//! worklog may only move to the end of the longest prefix of lines that
//! every sink has written.

use crate::pipeline::channel::{create_channel, Receiver};
use crate::record::LogRange;
use crate::sink::{Confirmation, SinkKind, CONFIRMATION_BUFFER};
use crate::storage::Worklog;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tracked {
    /// `records` output records were sent to every sink
    Emitted { range: LogRange, records: usize },
    /// nothing was sent, the line only has to be skipped
    Ignored { range: LogRange },
}

impl Tracked {
    pub fn range(&self) -> LogRange {
        match self {
            Tracked::Emitted { range, .. } | Tracked::Ignored { range } => *range,
        }
    }
}

#[derive(Debug)]
struct Entry {
    range: LogRange,
    /// unconfirmed records per sink, indexed like `Ledger::sinks`
    pending: Vec<usize>,
    failed: bool,
}

impl Entry {
    fn is_done(&self) -> bool {
        !self.failed && self.pending.iter().all(|p| *p == 0)
    }
}

#[derive(Debug)]
pub struct Ledger {
    sinks: Vec<SinkKind>,
    entries: VecDeque<Entry>,
    failures: usize,
}

impl Ledger {
    pub fn new(sinks: &[SinkKind]) -> Self {
        Self {
            sinks: sinks.to_vec(),
            entries: VecDeque::new(),
            failures: 0,
        }
    }

    pub fn track(&mut self, tracked: Tracked) {
        let pending = match tracked {
            Tracked::Emitted { records, .. } if !self.sinks.is_empty() => {
                vec![records; self.sinks.len()]
            }
            _ => vec![0; self.sinks.len()],
        };
        self.entries.push_back(Entry {
            range: tracked.range(),
            pending,
            failed: false,
        });
    }

    pub fn confirm(&mut self, confirmation: &Confirmation) {
        let Some(idx) = self.sinks.iter().position(|s| *s == confirmation.sink) else {
            warn!(sink = %confirmation.sink, "Confirmation from an unknown sink");
            return;
        };
        if !confirmation.is_ok() {
            self.failures += 1;
        }
        let mut remaining = confirmation.records;
        for entry in self.entries.iter_mut() {
            if remaining == 0 {
                break;
            }
            let pending = &mut entry.pending[idx];
            if *pending == 0 {
                continue;
            }
            let take = (*pending).min(remaining);
            *pending -= take;
            remaining -= take;
            if !confirmation.is_ok() {
                entry.failed = true;
            }
        }
        if remaining > 0 {
            warn!(
                sink = %confirmation.sink,
                unmatched = remaining,
                "Confirmation covers more records than were tracked"
            );
        }
    }

    /// Drop the confirmed prefix, returning the range it covered
    pub fn advance(&mut self) -> Option<LogRange> {
        let mut advanced: Option<LogRange> = None;
        while self.entries.front().map(Entry::is_done).unwrap_or(false) {
            let Some(entry) = self.entries.pop_front() else {
                break;
            };
            advanced = Some(match advanced {
                Some(acc) if acc.inode == entry.range.inode => LogRange {
                    seek_end: entry.range.seek_end,
                    ..acc
                },
                _ => entry.range.confirmed(),
            });
        }
        advanced
    }

    /// Entries not yet confirmed by every sink
    pub fn pending(&self) -> usize {
        self.entries.len()
    }

    pub fn failures(&self) -> usize {
        self.failures
    }
}

/// Receivers for one check of one file
#[derive(Debug)]
pub struct CheckSession {
    pub sinks: Vec<SinkKind>,
    pub confirmations: Receiver<Confirmation>,
    pub tracked: mpsc::UnboundedReceiver<Tracked>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CheckOutcome {
    pub confirmations: usize,
    pub failures: usize,
    /// lines left unconfirmed, they are read again next time
    pub unconfirmed: usize,
    pub position: Option<LogRange>,
}

/// Forward several confirmation channels into one
pub fn merge_confirmations(inputs: Vec<Receiver<Confirmation>>) -> Receiver<Confirmation> {
    let (tx, rx) = create_channel(CONFIRMATION_BUFFER);
    for mut input in inputs {
        let tx = tx.clone();
        tokio::spawn(async move {
            while let Some(conf) = input.recv().await {
                if tx.send(conf).await.is_err() {
                    debug!("Merged confirmation receiver dropped");
                    break;
                }
            }
        });
    }
    rx
}

/// Apply a check's confirmations to the worklog until both channels close
pub fn follow_check(
    session: CheckSession,
    worklog: Arc<Worklog>,
    file_path: Arc<str>,
) -> JoinHandle<CheckOutcome> {
    tokio::spawn(async move {
        let CheckSession {
            sinks,
            mut confirmations,
            mut tracked,
        } = session;
        let mut ledger = Ledger::new(&sinks);
        let mut outcome = CheckOutcome::default();
        let mut tracked_open = true;
        let mut confirmations_open = true;

        while tracked_open || confirmations_open {
            tokio::select! {
                item = tracked.recv(), if tracked_open => match item {
                    Some(item) => ledger.track(item),
                    None => tracked_open = false,
                },
                conf = confirmations.recv(), if confirmations_open => match conf {
                    Some(conf) => {
                        // records are tracked before they reach a sink
                        while let Ok(item) = tracked.try_recv() {
                            ledger.track(item);
                        }
                        if let Some(e) = &conf.error {
                            error!(path = %file_path, sink = %conf.sink, error = %e, "Chunk not written, range will be re-read");
                        }
                        outcome.confirmations += 1;
                        ledger.confirm(&conf);
                    }
                    None => confirmations_open = false,
                },
            }
            if let Some(range) = ledger.advance() {
                if worklog.update(&file_path, range) {
                    debug!(path = %file_path, seek_end = range.seek_end, "Worklog advanced");
                }
                outcome.position = Some(range);
            }
        }
        outcome.failures = ledger.failures();
        outcome.unconfirmed = ledger.pending();
        outcome
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOTH: [SinkKind; 2] = [SinkKind::Doc, SinkKind::TimeSeries];

    fn emitted(start: u64, end: u64, records: usize) -> Tracked {
        Tracked::Emitted {
            range: LogRange::new(42, start, end),
            records,
        }
    }

    fn confirmation(sink: SinkKind, records: usize, ok: bool) -> Confirmation {
        Confirmation {
            sink,
            file_path: Arc::from("/log/a.log"),
            range: LogRange::new(42, 0, 0),
            records,
            error: if ok { None } else { Some("status 500".to_string()) },
        }
    }

    #[test]
    fn test_ignored_lines_advance_immediately() {
        let mut ledger = Ledger::new(&BOTH);
        ledger.track(Tracked::Ignored {
            range: LogRange::new(42, 0, 10),
        });
        ledger.track(Tracked::Ignored {
            range: LogRange::new(42, 10, 25),
        });
        let range = ledger.advance().unwrap();
        assert_eq!((range.seek_start, range.seek_end), (0, 25));
        assert!(range.written);
        assert_eq!(ledger.advance(), None);
    }

    #[test]
    fn test_needs_every_sink() {
        let mut ledger = Ledger::new(&BOTH);
        ledger.track(emitted(0, 10, 1));
        ledger.track(emitted(10, 20, 1));
        ledger.confirm(&confirmation(SinkKind::Doc, 2, true));
        assert_eq!(ledger.advance(), None);

        ledger.confirm(&confirmation(SinkKind::TimeSeries, 1, true));
        assert_eq!(ledger.advance().unwrap().seek_end, 10);
        ledger.confirm(&confirmation(SinkKind::TimeSeries, 1, true));
        assert_eq!(ledger.advance().unwrap().seek_end, 20);
        assert_eq!(ledger.pending(), 0);
    }

    #[test]
    fn test_ignored_waits_behind_emitted() {
        let mut ledger = Ledger::new(&[SinkKind::Doc]);
        ledger.track(emitted(0, 10, 1));
        ledger.track(Tracked::Ignored {
            range: LogRange::new(42, 10, 20),
        });
        assert_eq!(ledger.advance(), None);
        ledger.confirm(&confirmation(SinkKind::Doc, 1, true));
        assert_eq!(ledger.advance().unwrap().seek_end, 20);
    }

    #[test]
    fn test_failure_blocks_the_rest() {
        let mut ledger = Ledger::new(&[SinkKind::Doc]);
        ledger.track(emitted(0, 10, 1));
        ledger.track(emitted(10, 20, 1));
        ledger.track(emitted(20, 30, 1));
        ledger.confirm(&confirmation(SinkKind::Doc, 1, true));
        ledger.confirm(&confirmation(SinkKind::Doc, 1, false));
        ledger.confirm(&confirmation(SinkKind::Doc, 1, true));
        assert_eq!(ledger.advance().unwrap().seek_end, 10);
        assert_eq!(ledger.advance(), None);
        assert_eq!(ledger.failures(), 1);
        assert_eq!(ledger.pending(), 2);
    }

    #[test]
    fn test_expanded_lines_need_all_records() {
        let mut ledger = Ledger::new(&[SinkKind::Doc]);
        ledger.track(emitted(0, 10, 3));
        ledger.confirm(&confirmation(SinkKind::Doc, 2, true));
        assert_eq!(ledger.advance(), None);
        ledger.confirm(&confirmation(SinkKind::Doc, 1, true));
        assert_eq!(ledger.advance().unwrap().seek_end, 10);
    }

    #[test]
    fn test_no_sinks_emitted_counts_as_done() {
        let mut ledger = Ledger::new(&[]);
        ledger.track(emitted(0, 10, 2));
        assert_eq!(ledger.advance().unwrap().seek_end, 10);
    }

    #[tokio::test]
    async fn test_follow_check_updates_worklog() {
        let dir = tempfile::TempDir::new().unwrap();
        let worklog = Arc::new(Worklog::load(&dir.path().join("worklog.json")).unwrap());
        let (tracked_tx, tracked_rx) = mpsc::unbounded_channel();
        let (conf_tx, conf_rx) = create_channel(4);
        let handle = follow_check(
            CheckSession {
                sinks: vec![SinkKind::Doc],
                confirmations: conf_rx,
                tracked: tracked_rx,
            },
            worklog.clone(),
            Arc::from("/log/a.log"),
        );

        tracked_tx.send(emitted(0, 10, 1)).unwrap();
        tracked_tx.send(emitted(10, 20, 1)).unwrap();
        drop(tracked_tx);
        conf_tx
            .send(confirmation(SinkKind::Doc, 1, true))
            .await
            .unwrap();
        conf_tx
            .send(confirmation(SinkKind::Doc, 1, false))
            .await
            .unwrap();
        drop(conf_tx);

        let outcome = handle.await.unwrap();
        assert_eq!(outcome.confirmations, 2);
        assert_eq!(outcome.failures, 1);
        assert_eq!(outcome.unconfirmed, 1);
        let pos = worklog.get("/log/a.log");
        assert_eq!((pos.inode, pos.seek_end), (Some(42), 10));
    }

    #[tokio::test]
    async fn test_merge_confirmations() {
        let (a_tx, a_rx) = create_channel(2);
        let (b_tx, b_rx) = create_channel(2);
        let mut merged = merge_confirmations(vec![a_rx, b_rx]);
        a_tx.send(confirmation(SinkKind::Doc, 1, true)).await.unwrap();
        b_tx.send(confirmation(SinkKind::TimeSeries, 1, true))
            .await
            .unwrap();
        drop(a_tx);
        drop(b_tx);
        let mut kinds = Vec::new();
        while let Some(c) = merged.recv().await {
            kinds.push(c.sink);
        }
        kinds.sort_by_key(|k| k.to_string());
        assert_eq!(kinds, vec![SinkKind::Doc, SinkKind::TimeSeries]);
    }
}
