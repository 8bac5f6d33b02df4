//! Counting of errors logged by the services themselves.

use crate::notify::{Notification, NotificationKind, Notifier};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use tracing::info;

#[derive(Debug)]
pub enum ErrorAlarm {
    Null,
    Tail(TailProcAlarm),
    Batch(BatchProcAlarm),
}

impl ErrorAlarm {
    pub fn on_error(&mut self, time: DateTime<Utc>) {
        match self {
            ErrorAlarm::Null => {}
            ErrorAlarm::Tail(a) => a.on_error(time),
            ErrorAlarm::Batch(a) => a.on_error(),
        }
    }

    pub fn evaluate(&mut self) {
        match self {
            ErrorAlarm::Null => {}
            ErrorAlarm::Tail(a) => a.evaluate(),
            ErrorAlarm::Batch(a) => a.evaluate(),
        }
    }

    pub fn reset(&mut self) {
        match self {
            ErrorAlarm::Null => {}
            ErrorAlarm::Tail(a) => a.reset(),
            ErrorAlarm::Batch(a) => a.reset(),
        }
    }
}

/// Fires once `max_errors` errors fall within `range_secs` of each other
#[derive(Debug)]
pub struct TailProcAlarm {
    path: String,
    app_type: String,
    max_errors: usize,
    range_secs: u64,
    last_errors: VecDeque<i64>,
    notifier: Notifier,
}

impl TailProcAlarm {
    pub fn new(
        path: &str,
        app_type: &str,
        max_errors: usize,
        range_secs: u64,
        notifier: Notifier,
    ) -> Self {
        Self {
            path: path.to_string(),
            app_type: app_type.to_string(),
            max_errors,
            range_secs,
            last_errors: VecDeque::with_capacity(max_errors),
            notifier,
        }
    }

    pub fn on_error(&mut self, time: DateTime<Utc>) {
        if self.max_errors == 0 {
            return;
        }
        if self.last_errors.len() == self.max_errors {
            self.last_errors.pop_front();
        }
        self.last_errors.push_back(time.timestamp());
    }

    pub fn evaluate(&mut self) {
        if self.max_errors == 0 || self.last_errors.len() < self.max_errors {
            return;
        }
        let oldest = self.last_errors.iter().min().copied().unwrap_or_default();
        let newest = self.last_errors.iter().max().copied().unwrap_or_default();
        if newest - oldest > self.range_secs as i64 {
            return;
        }
        info!(path = %self.path, "Sending alarm notification");
        self.notifier.notify(
            Notification::new(
                &self.app_type,
                format!(
                    "logfeed ERROR alarm for file {} (type {})",
                    self.path, self.app_type
                ),
                NotificationKind::ErrorAlarm {
                    count: self.max_errors,
                    range_secs: self.range_secs,
                },
            )
            .line(format!(
                "Too many errors ({}) logged within file {} during defined interval of {} seconds",
                self.max_errors, self.path, self.range_secs
            )),
        );
        self.reset();
    }

    pub fn reset(&mut self) {
        self.last_errors.clear();
    }
}

#[derive(Debug, Default)]
pub struct BatchProcAlarm {
    num_errors: usize,
}

impl BatchProcAlarm {
    pub fn on_error(&mut self) {
        self.num_errors += 1;
    }

    pub fn evaluate(&self) {
        info!(num_errors = self.num_errors, "Number of logged errors");
    }

    pub fn reset(&mut self) {
        self.num_errors = 0;
    }

    pub fn num_errors(&self) -> usize {
        self.num_errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(second: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 2, 8, 0, 0).unwrap() + Duration::seconds(second)
    }

    #[test]
    fn test_fires_when_ring_full_within_range() {
        let (notifier, mut rx) = Notifier::channel(None);
        let mut alarm = TailProcAlarm::new("/var/log/a.log", "kontext", 3, 60, notifier);
        alarm.on_error(at(0));
        alarm.on_error(at(10));
        alarm.evaluate();
        assert!(rx.try_recv().is_err());

        alarm.on_error(at(20));
        alarm.evaluate();
        let n = rx.try_recv().unwrap();
        assert!(n.subject.contains("/var/log/a.log"));

        // reset after firing
        alarm.evaluate();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_spread_errors_do_not_fire() {
        let (notifier, mut rx) = Notifier::channel(None);
        let mut alarm = TailProcAlarm::new("/var/log/a.log", "kontext", 2, 60, notifier);
        alarm.on_error(at(0));
        alarm.on_error(at(120));
        alarm.evaluate();
        assert!(rx.try_recv().is_err());

        alarm.on_error(at(150));
        alarm.evaluate();
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_batch_counts() {
        let mut alarm = ErrorAlarm::Batch(BatchProcAlarm::default());
        alarm.on_error(at(0));
        alarm.on_error(at(1));
        match &alarm {
            ErrorAlarm::Batch(a) => assert_eq!(a.num_errors(), 2),
            _ => unreachable!(),
        }
        alarm.reset();
        match &alarm {
            ErrorAlarm::Batch(a) => assert_eq!(a.num_errors(), 0),
            _ => unreachable!(),
        }
    }
}
