pub mod cluster_id;
pub mod range;

use crate::geo::GeoDataRecord;
use crate::services::{accesslog, kontext, mapka};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::net::IpAddr;

pub use range::{BoundOutputRecord, LogRange};

/// Capabilities every service-specific input record provides to the pipeline
/// and to the analyzers.
pub trait ServiceInput {
    fn time(&self) -> DateTime<Utc>;

    /// Client address, `None` when the line carries no usable address
    fn client_ip(&self) -> Option<IpAddr>;

    fn user_agent(&self) -> &str;

    fn is_processable(&self) -> bool;

    /// Stable hash identifying the user session the record belongs to
    fn clustering_client_id(&self) -> String;

    fn cluster_size(&self) -> usize;

    fn set_cluster_size(&mut self, size: usize);

    fn is_suspicious(&self) -> bool;

    /// Whether the record takes part in bot analysis
    fn should_be_analyzed(&self) -> bool;
}

/// Capabilities of the canonical records sent to sinks
pub trait ServiceOutput {
    /// Deterministic document id
    fn id(&self) -> &str;

    fn record_type(&self) -> &str;

    fn time(&self) -> DateTime<Utc>;

    fn ip_address(&self) -> &str;

    fn to_time_series(&self) -> TimeSeriesPoint;

    fn set_geo_location(&mut self, geo: GeoDataRecord);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "service", rename_all = "lowercase")]
pub enum InputRecord {
    Kontext(kontext::KontextInput),
    Mapka(mapka::MapkaInput),
    #[serde(rename = "accesslog")]
    AccessLog(accesslog::AccessLogInput),
}

impl InputRecord {
    fn inner(&self) -> &dyn ServiceInput {
        match self {
            InputRecord::Kontext(r) => r,
            InputRecord::Mapka(r) => r,
            InputRecord::AccessLog(r) => r,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn ServiceInput {
        match self {
            InputRecord::Kontext(r) => r,
            InputRecord::Mapka(r) => r,
            InputRecord::AccessLog(r) => r,
        }
    }

    pub fn service_name(&self) -> &'static str {
        match self {
            InputRecord::Kontext(_) => "kontext",
            InputRecord::Mapka(_) => "mapka",
            InputRecord::AccessLog(_) => "accesslog",
        }
    }
}

impl ServiceInput for InputRecord {
    fn time(&self) -> DateTime<Utc> {
        self.inner().time()
    }

    fn client_ip(&self) -> Option<IpAddr> {
        self.inner().client_ip()
    }

    fn user_agent(&self) -> &str {
        self.inner().user_agent()
    }

    fn is_processable(&self) -> bool {
        self.inner().is_processable()
    }

    fn clustering_client_id(&self) -> String {
        self.inner().clustering_client_id()
    }

    fn cluster_size(&self) -> usize {
        self.inner().cluster_size()
    }

    fn set_cluster_size(&mut self, size: usize) {
        self.inner_mut().set_cluster_size(size)
    }

    fn is_suspicious(&self) -> bool {
        self.inner().is_suspicious()
    }

    fn should_be_analyzed(&self) -> bool {
        self.inner().should_be_analyzed()
    }
}

/// Canonical record, serialized as the bare service struct
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum OutputRecord {
    Kontext(kontext::KontextOutput),
    Mapka(mapka::MapkaOutput),
    AccessLog(accesslog::AccessLogOutput),
}

impl OutputRecord {
    fn inner(&self) -> &dyn ServiceOutput {
        match self {
            OutputRecord::Kontext(r) => r,
            OutputRecord::Mapka(r) => r,
            OutputRecord::AccessLog(r) => r,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn ServiceOutput {
        match self {
            OutputRecord::Kontext(r) => r,
            OutputRecord::Mapka(r) => r,
            OutputRecord::AccessLog(r) => r,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl ServiceOutput for OutputRecord {
    fn id(&self) -> &str {
        self.inner().id()
    }

    fn record_type(&self) -> &str {
        self.inner().record_type()
    }

    fn time(&self) -> DateTime<Utc> {
        self.inner().time()
    }

    fn ip_address(&self) -> &str {
        self.inner().ip_address()
    }

    fn to_time_series(&self) -> TimeSeriesPoint {
        self.inner().to_time_series()
    }

    fn set_geo_location(&mut self, geo: GeoDataRecord) {
        self.inner_mut().set_geo_location(geo)
    }
}

/// Field value of a time-series point
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimeSeriesPoint {
    pub tags: BTreeMap<String, String>,
    pub values: BTreeMap<String, FieldValue>,
}

impl TimeSeriesPoint {
    pub fn tag(mut self, key: &str, value: impl Into<String>) -> Self {
        self.tags.insert(key.to_string(), value.into());
        self
    }

    pub fn value(mut self, key: &str, value: FieldValue) -> Self {
        self.values.insert(key.to_string(), value);
        self
    }
}

/// SHA-1 hex digest over the concatenation of the given fields
pub fn deterministic_id(fields: &[&str]) -> String {
    let mut hasher = Sha1::new();
    for field in fields {
        hasher.update(field.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Whether a numeric user id belongs to the configured anonymous accounts
pub fn user_belongs_to_list(user_id: Option<i64>, anonymous_users: &[i64]) -> bool {
    match user_id {
        Some(id) => anonymous_users.contains(&id),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic_id_is_stable() {
        let a = deterministic_id(&["query_submit", "syn2020", "1.2.3.4"]);
        let b = deterministic_id(&["query_submit", "syn2020", "1.2.3.4"]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 40);
    }

    #[test]
    fn test_deterministic_id_matches_plain_concatenation() {
        // Field boundaries are not encoded, only the concatenated bytes
        assert_eq!(deterministic_id(&["ab", "c"]), deterministic_id(&["a", "bc"]));
        assert_ne!(deterministic_id(&["abc"]), deterministic_id(&["abd"]));
    }

    #[test]
    fn test_sha1_known_digest() {
        assert_eq!(
            deterministic_id(&["abc"]),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn test_user_belongs_to_list() {
        assert!(user_belongs_to_list(Some(0), &[0, 1]));
        assert!(!user_belongs_to_list(Some(5), &[0, 1]));
        assert!(!user_belongs_to_list(None, &[0, 1]));
    }

    #[test]
    fn test_time_series_builder() {
        let point = TimeSeriesPoint::default()
            .tag("method", "GET")
            .value("bytes", FieldValue::Int(10));
        assert_eq!(point.tags.get("method").map(String::as_str), Some("GET"));
        assert_eq!(point.values.get("bytes"), Some(&FieldValue::Int(10)));
    }
}
