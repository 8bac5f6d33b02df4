//! Registry of supported services.
//!
//! Each service contributes a line parser, input and output record types and
//! a transformer. The pipeline only sees the dispatching enums defined here.

pub mod accesslog;
pub mod kontext;
pub mod mapka;

use crate::analysis::bot::BotAnalyzer;
use crate::analysis::clustering::ClusteringAnalyzer;
use crate::buffer::HistoryStore;
use crate::config::types::BufferConfig;
use crate::notify::Notifier;
use crate::record::{InputRecord, OutputRecord, ServiceInput};
use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("unknown application type '{0}'")]
    UnknownAppType(String),

    #[error("unsupported version '{version}' of '{app_type}'")]
    UnsupportedVersion { app_type: String, version: String },
}

/// Line-level failures, classified by how the pipeline treats them
#[derive(Debug, Error)]
pub enum ParseError {
    /// recoverable, the line is skipped
    #[error("failed to parse line {line_num}: {message}")]
    LineParsing { line_num: i64, message: String },

    /// the service logged an error of its own
    #[error("application error logged at {time}: {message}")]
    AppLog {
        time: DateTime<Utc>,
        message: String,
    },

    #[error("{0}")]
    Other(String),
}

impl ParseError {
    pub fn line(line_num: i64, message: impl Into<String>) -> Self {
        ParseError::LineParsing {
            line_num,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("transformer for {expected} received a {found} record")]
    RecordType {
        expected: &'static str,
        found: &'static str,
    },

    #[error("invalid time zone shift of {0} minutes")]
    TimeZone(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AppType {
    Kontext,
    Mapka,
    AccessLog,
}

impl AppType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppType::Kontext => "kontext",
            AppType::Mapka => "mapka",
            AppType::AccessLog => "accesslog",
        }
    }

    fn supported_versions(&self) -> &'static [&'static str] {
        match self {
            AppType::Kontext => &["0.18", "0.19"],
            AppType::Mapka => &["3"],
            AppType::AccessLog => &["1"],
        }
    }
}

impl fmt::Display for AppType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppType {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "kontext" => Ok(AppType::Kontext),
            "mapka" => Ok(AppType::Mapka),
            "accesslog" => Ok(AppType::AccessLog),
            other => Err(ServiceError::UnknownAppType(other.to_string())),
        }
    }
}

/// Resolve a configured `(appType, version)` pair
pub fn resolve(app_type: &str, version: &str) -> Result<AppType, ServiceError> {
    let app = AppType::from_str(app_type)?;
    if !app.supported_versions().contains(&version) {
        return Err(ServiceError::UnsupportedVersion {
            app_type: app_type.to_string(),
            version: version.to_string(),
        });
    }
    Ok(app)
}

#[derive(Debug, Clone)]
pub enum LineParser {
    Kontext(kontext::KontextParser),
    Mapka(mapka::MapkaParser),
    AccessLog(accesslog::AccessLogParser),
}

impl LineParser {
    pub fn for_app(app: AppType) -> Self {
        match app {
            AppType::Kontext => LineParser::Kontext(kontext::KontextParser),
            AppType::Mapka => LineParser::Mapka(mapka::MapkaParser),
            AppType::AccessLog => LineParser::AccessLog(accesslog::AccessLogParser),
        }
    }

    pub fn parse(&self, line: &str, line_num: i64) -> Result<InputRecord, ParseError> {
        match self {
            LineParser::Kontext(p) => p.parse(line, line_num).map(InputRecord::Kontext),
            LineParser::Mapka(p) => p.parse(line, line_num).map(InputRecord::Mapka),
            LineParser::AccessLog(p) => p.parse(line, line_num).map(InputRecord::AccessLog),
        }
    }
}

/// Everything a transformer needs from the configuration
#[derive(Debug, Clone, Default)]
pub struct TransformerContext {
    pub anonymous_users: Vec<i64>,
    pub exclude_ips: ExcludeIpList,
    pub buffer: Option<BufferConfig>,
    pub notifier: Notifier,
}

#[derive(Debug)]
pub enum Transformer {
    Kontext(kontext::KontextTransformer),
    Mapka(mapka::MapkaTransformer),
    AccessLog(accesslog::AccessLogTransformer),
}

impl Transformer {
    pub fn for_app(app: AppType, ctx: TransformerContext) -> Self {
        match app {
            AppType::Kontext => Transformer::Kontext(kontext::KontextTransformer::new(ctx)),
            AppType::Mapka => Transformer::Mapka(mapka::MapkaTransformer::new(ctx)),
            AppType::AccessLog => {
                Transformer::AccessLog(accesslog::AccessLogTransformer::new(ctx))
            }
        }
    }

    pub fn transform(
        &self,
        rec: &InputRecord,
        tz_shift_min: i32,
    ) -> Result<OutputRecord, TransformError> {
        match (self, rec) {
            (Transformer::Kontext(t), InputRecord::Kontext(r)) => {
                t.transform(r, tz_shift_min).map(OutputRecord::Kontext)
            }
            (Transformer::Mapka(t), InputRecord::Mapka(r)) => {
                t.transform(r, tz_shift_min).map(OutputRecord::Mapka)
            }
            (Transformer::AccessLog(t), InputRecord::AccessLog(r)) => {
                t.transform(r, tz_shift_min).map(OutputRecord::AccessLog)
            }
            (t, r) => Err(TransformError::RecordType {
                expected: t.app_type().as_str(),
                found: r.service_name(),
            }),
        }
    }

    /// Zero records swallows the input, more than one expands it
    pub fn preprocess(&self, rec: InputRecord, history: &mut dyn HistoryStore) -> Vec<InputRecord> {
        match self {
            Transformer::Kontext(t) => t.preprocess(rec, history),
            Transformer::Mapka(t) => t.preprocess(rec, history),
            Transformer::AccessLog(t) => t.preprocess(rec, history),
        }
    }

    pub fn history_lookup_items(&self) -> usize {
        match self {
            Transformer::Kontext(t) => t.history_lookup_items(),
            Transformer::Mapka(t) => t.history_lookup_items(),
            Transformer::AccessLog(t) => t.history_lookup_items(),
        }
    }

    pub fn app_type(&self) -> AppType {
        match self {
            Transformer::Kontext(_) => AppType::Kontext,
            Transformer::Mapka(_) => AppType::Mapka,
            Transformer::AccessLog(_) => AppType::AccessLog,
        }
    }
}

/// Bot analyzer for services with bot detection configured
pub(crate) fn bot_analyzer_for(app: AppType, ctx: &TransformerContext) -> Option<BotAnalyzer> {
    let buffer = ctx.buffer.as_ref()?;
    let bot = buffer.bot_detection.as_ref()?;
    Some(BotAnalyzer::new(
        app.as_str(),
        bot.clone(),
        buffer.analysis_interval_secs,
        ctx.notifier.clone(),
    ))
}

pub(crate) fn clustering_analyzer_for(
    app: AppType,
    ctx: &TransformerContext,
) -> Option<ClusteringAnalyzer> {
    let buffer = ctx.buffer.as_ref()?;
    Some(ClusteringAnalyzer::new(
        app.as_str(),
        buffer.analysis_interval_secs,
    ))
}

/// Addresses whose records are dropped during preprocessing
#[derive(Debug, Clone, Default)]
pub struct ExcludeIpList(Vec<IpAddr>);

impl ExcludeIpList {
    pub fn new(ips: &[String]) -> Self {
        Self(ips.iter().filter_map(|ip| ip.trim().parse().ok()).collect())
    }

    pub fn excludes(&self, rec: &InputRecord) -> bool {
        match rec.client_ip() {
            Some(ip) => self.0.contains(&ip),
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Time zone shift in minutes as a fixed offset
pub(crate) fn tz_offset(tz_shift_min: i32) -> Result<FixedOffset, TransformError> {
    tz_shift_min
        .checked_mul(60)
        .and_then(FixedOffset::east_opt)
        .ok_or(TransformError::TimeZone(tz_shift_min))
}

/// Parse the datetime flavours found in service logs.
///
/// Values without an explicit offset are taken as UTC.
pub fn parse_datetime(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%dT%H:%M:%S%.f%z"] {
        if let Ok(dt) = DateTime::parse_from_str(value, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, fmt) {
            return Some(dt.and_utc());
        }
    }
    None
}

/// First usable address from a list of header values
pub(crate) fn first_ip(candidates: &[&str]) -> Option<IpAddr> {
    candidates
        .iter()
        .filter(|c| !c.is_empty())
        .find_map(|c| c.split(',').next().and_then(|ip| ip.trim().parse().ok()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn test_resolve_known_services() {
        assert_eq!(resolve("kontext", "0.18").unwrap(), AppType::Kontext);
        assert_eq!(resolve("mapka", "3").unwrap(), AppType::Mapka);
        assert_eq!(resolve("accesslog", "1").unwrap(), AppType::AccessLog);
    }

    #[test]
    fn test_resolve_unknown() {
        assert!(matches!(
            resolve("wag", "1"),
            Err(ServiceError::UnknownAppType(_))
        ));
        assert!(matches!(
            resolve("kontext", "0.9"),
            Err(ServiceError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn test_parse_datetime_variants() {
        let dt = parse_datetime("2024-03-01 10:20:30.123456").unwrap();
        assert_eq!((dt.hour(), dt.minute(), dt.second()), (10, 20, 30));

        let dt = parse_datetime("2024-03-01T10:20:30.5+01:00").unwrap();
        assert_eq!(dt.hour(), 9);

        let dt = parse_datetime("2024-03-01 10:20:30").unwrap();
        assert_eq!(dt.day(), 1);

        assert!(parse_datetime("yesterday").is_none());
    }

    #[test]
    fn test_first_ip_prefers_earlier_candidates() {
        let ip = first_ip(&["", "1.2.3.4, 10.0.0.1", "10.0.0.2"]).unwrap();
        assert_eq!(ip.to_string(), "1.2.3.4");
        assert!(first_ip(&["", "not-an-ip"]).is_none());
    }

    #[test]
    fn test_tz_offset() {
        assert_eq!(tz_offset(120).unwrap().local_minus_utc(), 7200);
        assert!(tz_offset(100_000).is_err());
    }
}
