use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TimestampError {
    #[error("regex compilation failed: {0}")]
    InvalidRegex(#[from] regex::Error),

    #[error("invalid time zone shift of {0} minutes")]
    InvalidShift(i32),
}

#[derive(Debug, Clone)]
enum TimestampFormat {
    /// format carries its own offset
    Zoned(&'static str),
    /// local time of the log, shifted by the configured offset
    Local(&'static str),
    Rfc3339,
}

const PATTERNS: &[(&str, TimestampFormat)] = &[
    (
        r"\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:\d{2})",
        TimestampFormat::Rfc3339,
    ),
    (
        r"\d{2}/[A-Z][a-z]{2}/\d{4}:\d{2}:\d{2}:\d{2} [+-]\d{4}",
        TimestampFormat::Zoned("%d/%b/%Y:%H:%M:%S %z"),
    ),
    (
        r"\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}(?:\.\d+)?",
        TimestampFormat::Local("%Y-%m-%d %H:%M:%S%.f"),
    ),
    (
        r"\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d+)?",
        TimestampFormat::Local("%Y-%m-%dT%H:%M:%S%.f"),
    ),
];

/// Finds the first recognizable timestamp anywhere in a log line.
///
/// Used to decide which files of a directory are worth reading. Service
/// line formats are not consulted.
#[derive(Debug)]
pub struct TimestampDetector {
    patterns: Vec<(Regex, TimestampFormat)>,
    local: FixedOffset,
}

impl TimestampDetector {
    /// `tz_shift_min` is the offset of timestamps without zone information
    pub fn new(tz_shift_min: i32) -> Result<Self, TimestampError> {
        let local = tz_shift_min
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .ok_or(TimestampError::InvalidShift(tz_shift_min))?;
        let patterns = PATTERNS
            .iter()
            .map(|(pattern, format)| Ok((Regex::new(pattern)?, format.clone())))
            .collect::<Result<Vec<_>, TimestampError>>()?;
        Ok(Self { patterns, local })
    }

    pub fn detect(&self, line: &str) -> Option<DateTime<Utc>> {
        self.patterns.iter().find_map(|(pattern, format)| {
            let value = pattern.find(line)?.as_str();
            self.parse(value, format)
        })
    }

    fn parse(&self, value: &str, format: &TimestampFormat) -> Option<DateTime<Utc>> {
        match format {
            TimestampFormat::Rfc3339 => DateTime::parse_from_rfc3339(value)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
            TimestampFormat::Zoned(fmt) => DateTime::parse_from_str(value, fmt)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
            TimestampFormat::Local(fmt) => {
                let naive = NaiveDateTime::parse_from_str(value, fmt).ok()?;
                self.local
                    .from_local_datetime(&naive)
                    .single()
                    .map(|dt| dt.with_timezone(&Utc))
            }
        }
    }
}
