//! Map browser interaction log (JSON lines).
//!
//! Individual requests are collapsed into user interactions by the
//! clustering analyzer, only finished sessions reach the sinks.

use super::{clustering_analyzer_for, first_ip, parse_datetime, tz_offset};
use super::{AppType, ParseError, TransformError, TransformerContext};
use crate::analysis::clustering::ClusteringAnalyzer;
use crate::buffer::HistoryStore;
use crate::geo::GeoDataRecord;
use crate::record::cluster_id::clustering_id;
use crate::record::{
    deterministic_id, FieldValue, InputRecord, ServiceInput, ServiceOutput, TimeSeriesPoint,
};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};

#[derive(Debug, Default, Deserialize)]
struct ExtraLine {
    #[serde(default)]
    session_selector: String,
    #[serde(default)]
    user_id: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    ip: String,
    #[serde(default)]
    forwarded_for: String,
    #[serde(default)]
    http_method: String,
}

#[derive(Debug, Deserialize)]
struct MapkaLine {
    #[serde(default)]
    message: String,
    #[serde(default)]
    level_name: String,
    datetime: String,
    #[serde(default)]
    extra: ExtraLine,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapkaInput {
    pub time: DateTime<Utc>,
    pub session_selector: String,
    pub user_id: String,
    pub url: String,
    pub ip: String,
    pub forwarded_for: String,
    pub http_method: String,
    #[serde(default)]
    pub cluster_size: usize,
}

impl MapkaInput {
    /// URL path without query string
    pub fn path(&self) -> &str {
        let without_query = self.url.split(['?', '#']).next().unwrap_or("");
        match without_query.find("://") {
            Some(scheme_end) => {
                let rest = &without_query[scheme_end + 3..];
                rest.find('/').map(|i| &rest[i..]).unwrap_or("/")
            }
            None => without_query,
        }
    }
}

impl ServiceInput for MapkaInput {
    fn time(&self) -> DateTime<Utc> {
        self.time
    }

    fn client_ip(&self) -> Option<IpAddr> {
        first_ip(&[&self.forwarded_for, &self.ip])
    }

    fn user_agent(&self) -> &str {
        ""
    }

    fn is_processable(&self) -> bool {
        true
    }

    fn clustering_client_id(&self) -> String {
        clustering_id(&self.session_selector, &self.user_id, self.client_ip())
    }

    fn cluster_size(&self) -> usize {
        self.cluster_size
    }

    fn set_cluster_size(&mut self, size: usize) {
        self.cluster_size = size;
    }

    fn is_suspicious(&self) -> bool {
        false
    }

    fn should_be_analyzed(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MapkaParser;

impl MapkaParser {
    pub fn parse(&self, line: &str, line_num: i64) -> Result<MapkaInput, ParseError> {
        let raw: MapkaLine = serde_json::from_str(line)
            .map_err(|e| ParseError::line(line_num, format!("json unmarshal error: {}", e)))?;
        let time = parse_datetime(&raw.datetime).ok_or_else(|| {
            ParseError::line(line_num, format!("invalid datetime '{}'", raw.datetime))
        })?;
        if raw.level_name == "ERROR" {
            return Err(ParseError::AppLog {
                time,
                message: raw.message,
            });
        }
        Ok(MapkaInput {
            time,
            session_selector: raw.extra.session_selector,
            user_id: raw.extra.user_id,
            url: raw.extra.url,
            ip: raw.extra.ip,
            forwarded_for: raw.extra.forwarded_for,
            http_method: raw.extra.http_method,
            cluster_size: 0,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MapkaOutput {
    #[serde(skip)]
    pub id: String,
    #[serde(rename = "type")]
    pub rec_type: String,
    pub action: String,
    pub path: String,
    pub datetime: String,
    #[serde(skip)]
    pub time: DateTime<Utc>,
    pub ip_address: String,
    pub user_agent: String,
    pub user_id: String,
    pub is_anonymous: bool,
    pub is_query: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geoip: Option<GeoDataRecord>,
    pub cluster_size: usize,
}

impl ServiceOutput for MapkaOutput {
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
            .tag("isAnonymous", self.is_anonymous.to_string())
            .tag("isQuery", self.is_query.to_string())
            .value("clusterSize", FieldValue::Int(self.cluster_size as i64))
    }

    fn set_geo_location(&mut self, geo: GeoDataRecord) {
        self.geoip = Some(geo);
    }
}

#[derive(Debug)]
pub struct MapkaTransformer {
    anonymous_users: Vec<i64>,
    analyzer: Option<ClusteringAnalyzer>,
    history_lookup_items: usize,
}

impl MapkaTransformer {
    pub fn new(ctx: TransformerContext) -> Self {
        Self {
            analyzer: clustering_analyzer_for(AppType::Mapka, &ctx),
            history_lookup_items: ctx
                .buffer
                .as_ref()
                .map(|b| b.history_lookup_items)
                .unwrap_or(0),
            anonymous_users: ctx.anonymous_users,
        }
    }

    pub fn transform(
        &self,
        rec: &MapkaInput,
        tz_shift_min: i32,
    ) -> Result<MapkaOutput, TransformError> {
        let offset = tz_offset(tz_shift_min)?;
        let shifted = rec.time.with_timezone(&offset);
        let ip_address = rec
            .client_ip()
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
            .to_string();
        let is_anonymous = rec.user_id.is_empty()
            || rec
                .user_id
                .parse::<i64>()
                .map(|id| self.anonymous_users.contains(&id))
                .unwrap_or(false);
        let rec_type = AppType::Mapka.as_str().to_string();
        let path = rec.path().to_string();
        let id = deterministic_id(&[
            &rec_type,
            &path,
            &shifted.to_rfc3339_opts(SecondsFormat::Nanos, true),
            &ip_address,
            &rec.user_id,
        ]);
        Ok(MapkaOutput {
            id,
            rec_type,
            action: "interaction".to_string(),
            path,
            datetime: shifted.to_rfc3339_opts(SecondsFormat::Secs, true),
            time: rec.time,
            ip_address,
            user_agent: String::new(),
            user_id: rec.user_id.clone(),
            is_anonymous,
            is_query: rec.cluster_size > 0,
            geoip: None,
            cluster_size: rec.cluster_size,
        })
    }

    pub fn preprocess(&self, rec: InputRecord, history: &mut dyn HistoryStore) -> Vec<InputRecord> {
        match &self.analyzer {
            Some(analyzer) => analyzer.preprocess(rec, history),
            None => vec![rec],
        }
    }

    pub fn history_lookup_items(&self) -> usize {
        self.history_lookup_items
    }
}
