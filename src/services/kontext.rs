//! KonText query log (JSON lines).

use super::{first_ip, parse_datetime, tz_offset, ExcludeIpList, ParseError, TransformError};
use super::{bot_analyzer_for, AppType, TransformerContext};
use crate::analysis::bot::BotAnalyzer;
use crate::buffer::HistoryStore;
use crate::geo::GeoDataRecord;
use crate::record::cluster_id::random_clustering_id;
use crate::record::{
    deterministic_id, user_belongs_to_list, FieldValue, InputRecord, ServiceInput, ServiceOutput,
    TimeSeriesPoint,
};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::net::IpAddr;

const ENTRY_QUERY_ACTIONS: &[&str] = &[
    "query_submit",
    "wordlist/submit",
    "pquery/freq_intersection",
];

const ANALYZED_ACTIONS: &[&str] = &[
    "query_submit",
    "create_view",
    "create_lazy_view",
    "wordlist/submit",
    "pquery/freq_intersection",
];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub anchor: String,
}

#[derive(Debug, Default, Deserialize)]
struct RequestLine {
    #[serde(rename = "HTTP_X_FORWARDED_FOR", default)]
    forwarded_for: String,
    #[serde(rename = "HTTP_USER_AGENT", default)]
    user_agent: String,
    #[serde(rename = "HTTP_REMOTE_ADDR", default)]
    http_remote_addr: String,
    #[serde(rename = "REMOTE_ADDR", default)]
    remote_addr: String,
}

#[derive(Debug, Deserialize)]
struct KontextLine {
    #[serde(default)]
    logger: String,
    #[serde(default)]
    level: String,
    #[serde(default)]
    message: String,
    date: String,
    #[serde(default)]
    user_id: Option<i64>,
    #[serde(default)]
    proc_time: f64,
    #[serde(default)]
    action: String,
    #[serde(default)]
    is_indirect_call: bool,
    #[serde(default)]
    request: RequestLine,
    #[serde(default)]
    args: Map<String, Value>,
    #[serde(default)]
    error: Option<ErrorRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KontextInput {
    pub time: DateTime<Utc>,
    pub logger: String,
    pub action: String,
    pub user_id: Option<i64>,
    pub proc_time: f64,
    pub is_indirect_call: bool,
    pub forwarded_for: String,
    pub http_remote_addr: String,
    pub remote_addr: String,
    pub user_agent: String,
    pub args: Map<String, Value>,
    pub error: Option<ErrorRecord>,
}

impl KontextInput {
    fn string_arg(&self, name: &str) -> &str {
        self.args.get(name).and_then(Value::as_str).unwrap_or("")
    }

    fn corpora(&self) -> Vec<String> {
        match self.args.get("corpora") {
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn corpus(&self) -> String {
        let corpname = self.string_arg("corpname");
        if !corpname.is_empty() {
            return corpname.to_string();
        }
        self.corpora().into_iter().next().unwrap_or_default()
    }

    pub fn aligned_corpora(&self) -> Vec<String> {
        self.corpora().into_iter().skip(1).collect()
    }
}

impl ServiceInput for KontextInput {
    fn time(&self) -> DateTime<Utc> {
        self.time
    }

    fn client_ip(&self) -> Option<IpAddr> {
        first_ip(&[
            &self.forwarded_for,
            &self.http_remote_addr,
            &self.remote_addr,
        ])
    }

    fn user_agent(&self) -> &str {
        &self.user_agent
    }

    fn is_processable(&self) -> bool {
        self.logger == "QUERY"
    }

    /// Every query counts on its own in traffic analysis
    fn clustering_client_id(&self) -> String {
        random_clustering_id()
    }

    fn cluster_size(&self) -> usize {
        0
    }

    fn set_cluster_size(&mut self, _size: usize) {}

    fn is_suspicious(&self) -> bool {
        false
    }

    fn should_be_analyzed(&self) -> bool {
        ANALYZED_ACTIONS.contains(&self.action.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct KontextParser;

impl KontextParser {
    pub fn parse(&self, line: &str, line_num: i64) -> Result<KontextInput, ParseError> {
        let raw: KontextLine = serde_json::from_str(line)
            .map_err(|e| ParseError::line(line_num, format!("json unmarshal error: {}", e)))?;
        let time = parse_datetime(&raw.date).ok_or_else(|| {
            ParseError::line(line_num, format!("invalid datetime '{}'", raw.date))
        })?;
        if raw.level == "ERROR" {
            return Err(ParseError::AppLog {
                time,
                message: raw.message,
            });
        }
        Ok(KontextInput {
            time,
            logger: raw.logger,
            action: raw.action,
            user_id: raw.user_id,
            proc_time: raw.proc_time,
            is_indirect_call: raw.is_indirect_call,
            forwarded_for: raw.request.forwarded_for,
            http_remote_addr: raw.request.http_remote_addr,
            remote_addr: raw.request.remote_addr,
            user_agent: raw.request.user_agent,
            args: raw.args,
            error: raw.error.filter(|e| !e.name.is_empty()),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KontextOutput {
    #[serde(skip)]
    pub id: String,
    #[serde(rename = "type")]
    pub rec_type: String,
    pub action: String,
    pub corpus: String,
    pub aligned_corpora: Vec<String>,
    pub datetime: String,
    #[serde(skip)]
    pub time: DateTime<Utc>,
    pub ip_address: String,
    pub is_anonymous: bool,
    pub is_query: bool,
    pub proc_time: f64,
    pub query_type: String,
    pub user_agent: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geoip: Option<GeoDataRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
    pub args: Map<String, Value>,
}

impl KontextOutput {
    fn generate_id(&self) -> String {
        deterministic_id(&[
            &self.action,
            &self.corpus,
            &self.datetime,
            &self.ip_address,
            &self.rec_type,
            &self.user_agent,
            &self.user_id,
        ])
    }
}

impl ServiceOutput for KontextOutput {
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
            .tag("corpname", self.corpus.clone())
            .tag("queryType", self.query_type.clone())
            .tag("isAnonymous", self.is_anonymous.to_string())
            .tag("isQuery", self.is_query.to_string())
            .value("procTime", FieldValue::Float(self.proc_time))
    }

    fn set_geo_location(&mut self, geo: GeoDataRecord) {
        self.geoip = Some(geo);
    }
}

#[derive(Debug)]
pub struct KontextTransformer {
    anonymous_users: Vec<i64>,
    exclude_ips: ExcludeIpList,
    analyzer: Option<BotAnalyzer>,
    history_lookup_items: usize,
}

impl KontextTransformer {
    pub fn new(ctx: TransformerContext) -> Self {
        let analyzer = bot_analyzer_for(AppType::Kontext, &ctx);
        Self {
            history_lookup_items: ctx
                .buffer
                .as_ref()
                .map(|b| b.history_lookup_items)
                .unwrap_or(0),
            anonymous_users: ctx.anonymous_users,
            exclude_ips: ctx.exclude_ips,
            analyzer,
        }
    }

    pub fn transform(
        &self,
        rec: &KontextInput,
        tz_shift_min: i32,
    ) -> Result<KontextOutput, TransformError> {
        let offset = tz_offset(tz_shift_min)?;
        let mut out = KontextOutput {
            id: String::new(),
            rec_type: AppType::Kontext.as_str().to_string(),
            action: rec.action.clone(),
            corpus: rec.corpus(),
            aligned_corpora: rec.aligned_corpora(),
            datetime: rec
                .time
                .with_timezone(&offset)
                .to_rfc3339_opts(SecondsFormat::Secs, true),
            time: rec.time,
            ip_address: rec.client_ip().map(|ip| ip.to_string()).unwrap_or_default(),
            is_anonymous: rec.user_id.is_none()
                || user_belongs_to_list(rec.user_id, &self.anonymous_users),
            is_query: ENTRY_QUERY_ACTIONS.contains(&rec.action.as_str()) && !rec.is_indirect_call,
            proc_time: rec.proc_time,
            query_type: rec.string_arg("qtype").to_string(),
            user_agent: rec.user_agent.clone(),
            user_id: rec.user_id.map(|id| id.to_string()).unwrap_or_default(),
            geoip: None,
            error: rec.error.clone(),
            args: rec
                .args
                .iter()
                .filter(|(k, _)| k.as_str() != "corpora" && k.as_str() != "corpname")
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        out.id = out.generate_id();
        Ok(out)
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
    use crate::buffer::DummyBuffer;

    const QUERY_LINE: &str = r#"{"logger":"QUERY","level":"INFO","date":"2024-05-02 08:15:01.251","user_id":42,"proc_time":0.71,"action":"query_submit","is_indirect_call":false,"request":{"HTTP_X_FORWARDED_FOR":"","HTTP_USER_AGENT":"Mozilla/5.0","HTTP_REMOTE_ADDR":"195.113.53.66","REMOTE_ADDR":"127.0.0.1"},"args":{"corpora":["syn2020","intercorp_en"],"qtype":"simple","pagesize":40}}"#;

    fn transformer() -> KontextTransformer {
        KontextTransformer::new(TransformerContext {
            anonymous_users: vec![0],
            ..Default::default()
        })
    }

    #[test]
    fn test_parse_query_line() {
        let rec = KontextParser.parse(QUERY_LINE, 1).unwrap();
        assert!(rec.is_processable());
        assert_eq!(rec.action, "query_submit");
        assert_eq!(rec.user_id, Some(42));
        assert_eq!(rec.client_ip().unwrap().to_string(), "195.113.53.66");
        assert_eq!(rec.corpus(), "syn2020");
        assert_eq!(rec.aligned_corpora(), vec!["intercorp_en".to_string()]);
        assert!(rec.should_be_analyzed());
    }

    #[test]
    fn test_non_query_logger_is_not_processable() {
        let line = QUERY_LINE.replace(r#""logger":"QUERY""#, r#""logger":"DEBUG""#);
        let rec = KontextParser.parse(&line, 1).unwrap();
        assert!(!rec.is_processable());
    }

    #[test]
    fn test_invalid_json_is_line_parsing_error() {
        let err = KontextParser.parse("{not json", 7).unwrap_err();
        assert!(matches!(err, ParseError::LineParsing { line_num: 7, .. }));
    }

    #[test]
    fn test_error_level_is_app_error() {
        let line = QUERY_LINE.replace(r#""level":"INFO""#, r#""level":"ERROR""#);
        let err = KontextParser.parse(&line, 1).unwrap_err();
        assert!(matches!(err, ParseError::AppLog { .. }));
    }

    #[test]
    fn test_transform_fields() {
        let rec = KontextParser.parse(QUERY_LINE, 1).unwrap();
        let out = transformer().transform(&rec, 120).unwrap();
        assert_eq!(out.datetime, "2024-05-02T10:15:01+02:00");
        assert_eq!(out.corpus, "syn2020");
        assert_eq!(out.query_type, "simple");
        assert!(out.is_query);
        assert!(!out.is_anonymous);
        assert_eq!(out.user_id, "42");
        assert!(out.args.contains_key("pagesize"));
        assert!(!out.args.contains_key("corpora"));
        assert_eq!(out.id.len(), 40);
    }

    #[test]
    fn test_transform_is_deterministic() {
        let rec = KontextParser.parse(QUERY_LINE, 1).unwrap();
        let a = transformer().transform(&rec, 0).unwrap();
        let b = transformer().transform(&rec, 0).unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn test_anonymous_user() {
        let line = QUERY_LINE.replace(r#""user_id":42"#, r#""user_id":0"#);
        let rec = KontextParser.parse(&line, 1).unwrap();
        let out = transformer().transform(&rec, 0).unwrap();
        assert!(out.is_anonymous);
    }

    #[test]
    fn test_excluded_ip_is_swallowed() {
        let t = KontextTransformer::new(TransformerContext {
            exclude_ips: ExcludeIpList::new(&["195.113.53.66".to_string()]),
            ..Default::default()
        });
        let rec = InputRecord::Kontext(KontextParser.parse(QUERY_LINE, 1).unwrap());
        let mut history = DummyBuffer::default();
        assert!(t.preprocess(rec, &mut history).is_empty());
    }

    #[test]
    fn test_time_series() {
        let rec = KontextParser.parse(QUERY_LINE, 1).unwrap();
        let point = transformer().transform(&rec, 0).unwrap().to_time_series();
        assert_eq!(point.tags["corpname"], "syn2020");
        assert_eq!(point.values["procTime"], FieldValue::Float(0.71));
    }
}
