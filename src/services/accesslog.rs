//! Combined-format HTTP access log.

use super::{bot_analyzer_for, tz_offset, AppType, ExcludeIpList};
use super::{ParseError, TransformError, TransformerContext};
use crate::analysis::bot::BotAnalyzer;
use crate::buffer::HistoryStore;
use crate::geo::GeoDataRecord;
use crate::record::cluster_id::clustering_id;
use crate::record::{
    deterministic_id, FieldValue, InputRecord, ServiceInput, ServiceOutput, TimeSeriesPoint,
};
use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

const TIME_FORMAT: &str = "%d/%b/%Y:%H:%M:%S %z";

const BOT_AGENT_MARKERS: &[&str] = &[
    "bot",
    "crawler",
    "spider",
    "curl",
    "wget",
    "python-requests",
    "scrapy",
];

const STATIC_SUFFIXES: &[&str] = &[
    ".css", ".js", ".png", ".jpg", ".jpeg", ".gif", ".svg", ".ico", ".woff", ".woff2",
];

/// Split a line into space separated tokens, keeping `"..."` and `[...]`
/// groups together. Delimiters are stripped, `\"` is kept verbatim.
pub fn tokenize(line: &str) -> Result<Vec<&str>, String> {
    let mut tokens = Vec::new();
    let bytes = line.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b' ' => i += 1,
            b'"' => {
                let start = i + 1;
                let mut j = start;
                while j < bytes.len() && bytes[j] != b'"' {
                    if bytes[j] == b'\\' {
                        j += 1;
                    }
                    j += 1;
                }
                if j >= bytes.len() {
                    return Err(format!("unterminated quoted token at {}", i));
                }
                tokens.push(&line[start..j]);
                i = j + 1;
            }
            b'[' => {
                let start = i + 1;
                let end = line[start..]
                    .find(']')
                    .map(|pos| start + pos)
                    .ok_or_else(|| format!("unterminated bracket token at {}", i))?;
                tokens.push(&line[start..end]);
                i = end + 1;
            }
            _ => {
                let start = i;
                while i < bytes.len() && bytes[i] != b' ' {
                    i += 1;
                }
                tokens.push(&line[start..i]);
            }
        }
    }
    Ok(tokens)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessLogInput {
    pub ip: String,
    pub ident: String,
    pub user: String,
    pub time: DateTime<FixedOffset>,
    pub method: String,
    pub path: String,
    pub protocol: String,
    pub status: u16,
    pub bytes: Option<u64>,
    pub referrer: String,
    pub user_agent: String,
}

impl AccessLogInput {
    /// Canonical combined-format rendering
    pub fn format_line(&self) -> String {
        format!(
            "{} {} {} [{}] \"{} {} {}\" {} {} \"{}\" \"{}\"",
            self.ip,
            self.ident,
            self.user,
            self.time.format(TIME_FORMAT),
            self.method,
            self.path,
            self.protocol,
            self.status,
            self.bytes
                .map(|b| b.to_string())
                .unwrap_or_else(|| "-".to_string()),
            self.referrer,
            self.user_agent
        )
    }

    fn is_static_resource(&self) -> bool {
        let path = self.path.split('?').next().unwrap_or("").to_lowercase();
        STATIC_SUFFIXES.iter().any(|s| path.ends_with(s))
    }
}

impl ServiceInput for AccessLogInput {
    fn time(&self) -> DateTime<Utc> {
        self.time.with_timezone(&Utc)
    }

    fn client_ip(&self) -> Option<IpAddr> {
        self.ip.parse().ok()
    }

    fn user_agent(&self) -> &str {
        &self.user_agent
    }

    fn is_processable(&self) -> bool {
        true
    }

    fn clustering_client_id(&self) -> String {
        let user = if self.user == "-" { "" } else { &self.user };
        clustering_id("", user, self.client_ip())
    }

    fn cluster_size(&self) -> usize {
        0
    }

    fn set_cluster_size(&mut self, _size: usize) {}

    fn is_suspicious(&self) -> bool {
        let agent = self.user_agent.to_lowercase();
        if agent.is_empty() || agent == "-" {
            return true;
        }
        if BOT_AGENT_MARKERS.iter().any(|m| agent.contains(m)) {
            return true;
        }
        (400..500).contains(&self.status) && !self.is_static_resource()
    }

    fn should_be_analyzed(&self) -> bool {
        !self.is_static_resource()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AccessLogParser;

impl AccessLogParser {
    pub fn parse(&self, line: &str, line_num: i64) -> Result<AccessLogInput, ParseError> {
        let tokens = tokenize(line).map_err(|e| ParseError::line(line_num, e))?;
        if tokens.len() < 9 {
            return Err(ParseError::line(
                line_num,
                format!("expected 9 fields, found {}", tokens.len()),
            ));
        }
        let time = DateTime::parse_from_str(tokens[3], TIME_FORMAT)
            .map_err(|e| ParseError::line(line_num, format!("invalid time '{}': {}", tokens[3], e)))?;
        let mut request = tokens[4].splitn(3, ' ');
        let (method, path, protocol) = match (request.next(), request.next(), request.next()) {
            (Some(m), Some(p), Some(proto)) => (m, p, proto),
            _ => {
                return Err(ParseError::line(
                    line_num,
                    format!("malformed request '{}'", tokens[4]),
                ))
            }
        };
        let status = tokens[5]
            .parse::<u16>()
            .map_err(|_| ParseError::line(line_num, format!("invalid status '{}'", tokens[5])))?;
        let bytes = match tokens[6] {
            "-" => None,
            b => Some(b.parse::<u64>().map_err(|_| {
                ParseError::line(line_num, format!("invalid byte count '{}'", b))
            })?),
        };
        Ok(AccessLogInput {
            ip: tokens[0].to_string(),
            ident: tokens[1].to_string(),
            user: tokens[2].to_string(),
            time,
            method: method.to_string(),
            path: path.to_string(),
            protocol: protocol.to_string(),
            status,
            bytes,
            referrer: tokens[7].to_string(),
            user_agent: tokens[8].to_string(),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessLogOutput {
    #[serde(skip)]
    pub id: String,
    #[serde(rename = "type")]
    pub rec_type: String,
    pub datetime: String,
    #[serde(skip)]
    pub time: DateTime<Utc>,
    pub ip_address: String,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub bytes: u64,
    pub referrer: String,
    pub user_agent: String,
    pub user_id: String,
    pub is_anonymous: bool,
    pub is_bot: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geoip: Option<GeoDataRecord>,
}

impl ServiceOutput for AccessLogOutput {
    fn id(&self) -> &str {
        &self.id
    }

    fn record_type(&self) -> &str {
        &self.rec_type
    }

    fn time(&self) -> DateTime<Utc> {
        self.time
    }

    fn ip_address(&self) -> &str {
        &self.ip_address
    }

    fn to_time_series(&self) -> TimeSeriesPoint {
        TimeSeriesPoint::default()
            .tag("method", self.method.clone())
            .tag("status", self.status.to_string())
            .value("bytes", FieldValue::Int(self.bytes as i64))
    }

    fn set_geo_location(&mut self, geo: GeoDataRecord) {
        self.geoip = Some(geo);
    }
}

#[derive(Debug)]
pub struct AccessLogTransformer {
    exclude_ips: ExcludeIpList,
    analyzer: Option<BotAnalyzer>,
    history_lookup_items: usize,
}

impl AccessLogTransformer {
    pub fn new(ctx: TransformerContext) -> Self {
        Self {
            analyzer: bot_analyzer_for(AppType::AccessLog, &ctx),
            history_lookup_items: ctx
                .buffer
                .as_ref()
                .map(|b| b.history_lookup_items)
                .unwrap_or(0),
            exclude_ips: ctx.exclude_ips,
        }
    }

    pub fn transform(
        &self,
        rec: &AccessLogInput,
        tz_shift_min: i32,
    ) -> Result<AccessLogOutput, TransformError> {
        let offset = tz_offset(tz_shift_min)?;
        let time = rec.time();
        let datetime = time
            .with_timezone(&offset)
            .to_rfc3339_opts(SecondsFormat::Secs, true);
        let rec_type = AppType::AccessLog.as_str().to_string();
        let status = rec.status.to_string();
        let id = deterministic_id(&[
            &rec_type,
            &datetime,
            &rec.ip,
            &rec.method,
            &rec.path,
            &status,
            &rec.user_agent,
        ]);
        let user_id = if rec.user == "-" {
            String::new()
        } else {
            rec.user.clone()
        };
        Ok(AccessLogOutput {
            id,
            rec_type,
            datetime,
            time,
            ip_address: rec.ip.clone(),
            method: rec.method.clone(),
            path: rec.path.clone(),
            status: rec.status,
            bytes: rec.bytes.unwrap_or(0),
            referrer: rec.referrer.clone(),
            user_agent: rec.user_agent.clone(),
            is_anonymous: user_id.is_empty(),
            user_id,
            is_bot: rec.is_suspicious(),
            geoip: None,
        })
    }

    pub fn preprocess(&self, rec: InputRecord, history: &mut dyn HistoryStore) -> Vec<InputRecord> {
        if self.exclude_ips.excludes(&rec) {
            return Vec::new();
        }
        match &self.analyzer {
            Some(analyzer) => analyzer.preprocess(rec, history),
            None => vec![rec],
        }
    }

    pub fn history_lookup_items(&self) -> usize {
        self.history_lookup_items
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINE: &str = r#"195.113.53.66 - frank [10/Oct/2023:13:55:36 -0700] "GET /corpora/syn2020?page=2 HTTP/1.1" 200 2326 "https://example.org/start" "Mozilla/5.0 (X11; Linux x86_64)""#;

    #[test]
    fn test_tokenize_groups() {
        let tokens = tokenize(LINE).unwrap();
        assert_eq!(tokens.len(), 9);
        assert_eq!(tokens[3], "10/Oct/2023:13:55:36 -0700");
        assert_eq!(tokens[4], "GET /corpora/syn2020?page=2 HTTP/1.1");
        assert_eq!(tokens[8], "Mozilla/5.0 (X11; Linux x86_64)");
    }

    #[test]
    fn test_tokenize_unterminated_quote() {
        assert!(tokenize(r#"1.2.3.4 "GET /"#).is_err());
    }

    #[test]
    fn test_parse_and_format_roundtrip() {
        let rec = AccessLogParser.parse(LINE, 1).unwrap();
        assert_eq!(rec.format_line(), LINE);
    }

    #[test]
    fn test_parse_missing_bytes() {
        let line = LINE.replace(" 200 2326 ", " 304 - ");
        let rec = AccessLogParser.parse(&line, 1).unwrap();
        assert_eq!(rec.bytes, None);
        assert_eq!(rec.format_line(), line);
    }

    #[test]
    fn test_parse_short_line() {
        assert!(matches!(
            AccessLogParser.parse("1.2.3.4 - -", 3),
            Err(ParseError::LineParsing { line_num: 3, .. })
        ));
    }

    #[test]
    fn test_suspicious_agents() {
        let bot = LINE.replace("Mozilla/5.0 (X11; Linux x86_64)", "Googlebot/2.1");
        assert!(AccessLogParser.parse(&bot, 1).unwrap().is_suspicious());
        assert!(!AccessLogParser.parse(LINE, 1).unwrap().is_suspicious());

        let not_found = LINE.replace(" 200 ", " 404 ");
        assert!(AccessLogParser.parse(&not_found, 1).unwrap().is_suspicious());
    }

    #[test]
    fn test_static_resources_are_not_analyzed() {
        let line = LINE.replace("/corpora/syn2020?page=2", "/static/app.js");
        assert!(!AccessLogParser.parse(&line, 1).unwrap().should_be_analyzed());
    }

    #[test]
    fn test_transform() {
        let rec = AccessLogParser.parse(LINE, 1).unwrap();
        let t = AccessLogTransformer::new(TransformerContext::default());
        let out = t.transform(&rec, 0).unwrap();
        assert_eq!(out.datetime, "2023-10-10T20:55:36Z");
        assert_eq!(out.user_id, "frank");
        assert!(!out.is_anonymous);
        assert_eq!(out.bytes, 2326);
        let point = out.to_time_series();
        assert_eq!(point.tags["status"], "200");
    }
}
