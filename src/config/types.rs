use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub log_files: Vec<BatchFileConfig>,
    #[serde(default)]
    pub log_tail: Option<TailConfig>,
    #[serde(default)]
    pub geo_ip_db_path: Option<PathBuf>,
    #[serde(default)]
    pub anonymous_users: Vec<i64>,
    #[serde(default)]
    pub elastic_search: Option<ElasticConfig>,
    #[serde(default)]
    pub influx_db: Option<InfluxConfig>,
    #[serde(default)]
    pub email_notification: Option<EmailConfig>,
    #[serde(default)]
    pub conomi_notification: Option<ConomiConfig>,
    /// Local time zone as a fixed offset, e.g. `+02:00`
    #[serde(default, with = "offset_format")]
    pub time_zone: Option<FixedOffset>,
    #[serde(default)]
    pub alarm_max_log_inactivity_secs: u64,
    #[serde(default)]
    pub notification_tag: Option<String>,
    #[serde(default)]
    pub doc_update: Option<DocUpdateConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TailConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    pub worklog_path: PathBuf,
    #[serde(default = "default_max_lines_per_check")]
    pub max_lines_per_check: usize,
    #[serde(default)]
    pub num_errors_alarm: usize,
    #[serde(default)]
    pub err_count_time_range_secs: u64,
    #[serde(default)]
    pub exclude_ip_list: Vec<String>,
    /// Defaults to the worklog's directory
    #[serde(default)]
    pub buffer_state_dir: Option<PathBuf>,
    pub files: Vec<TailFileConfig>,
}

impl TailConfig {
    pub fn buffer_state_dir(&self) -> PathBuf {
        match &self.buffer_state_dir {
            Some(dir) => dir.clone(),
            None => self
                .worklog_path
                .parent()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
        }
    }
}

fn default_interval_secs() -> u64 {
    15
}

fn default_max_lines_per_check() -> usize {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TailFileConfig {
    pub path: PathBuf,
    pub app_type: String,
    pub version: String,
    /// Minutes
    #[serde(default)]
    pub tz_shift: i32,
    #[serde(default)]
    pub buffer: Option<BufferConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferConfig {
    /// Files with the same id share one buffer
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub history_lookup_items: usize,
    #[serde(default)]
    pub max_age_secs: u64,
    #[serde(default)]
    pub analysis_interval_secs: u64,
    #[serde(default)]
    pub bot_detection: Option<BotDetectionConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotDetectionConfig {
    pub prev_num_reqs_sample_size: usize,
    pub traffic_reporting_threshold: f64,
    #[serde(rename = "IPOutlierMinFreq")]
    pub ip_outlier_min_freq: usize,
    #[serde(rename = "IPOutlierCoeff")]
    pub ip_outlier_coeff: f64,
    #[serde(rename = "blocklistIP", default)]
    pub blocklist_ip: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchFileConfig {
    pub src_path: PathBuf,
    #[serde(default)]
    pub partially_matching_files: bool,
    pub worklog_path: PathBuf,
    pub app_type: String,
    pub version: String,
    #[serde(default)]
    pub tz_shift: i32,
    #[serde(default)]
    pub num_errors_alarm: usize,
    #[serde(default)]
    pub buffer: Option<BufferConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElasticConfig {
    pub server: String,
    pub index: String,
    #[serde(default = "default_push_chunk_size")]
    pub push_chunk_size: usize,
    #[serde(default = "default_req_timeout_secs")]
    pub req_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfluxConfig {
    pub server: String,
    pub database: String,
    pub measurement: String,
    #[serde(default = "default_push_chunk_size")]
    pub push_chunk_size: usize,
    #[serde(default)]
    pub retention_policy: String,
    #[serde(default = "default_req_timeout_secs")]
    pub req_timeout_secs: u64,
}

fn default_push_chunk_size() -> usize {
    500
}

fn default_req_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailConfig {
    #[serde(default)]
    pub sender: String,
    pub recipients: Vec<String>,
    #[serde(default)]
    pub smtp_server: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConomiConfig {
    pub server: String,
    #[serde(default = "default_conomi_app")]
    pub app: String,
    #[serde(default)]
    pub instance: String,
    #[serde(default = "default_req_timeout_secs")]
    pub req_timeout_secs: u64,
}

fn default_conomi_app() -> String {
    "logfeed".to_string()
}

/// Selection of documents for the maintenance actions. Filters combine
/// as a conjunction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocUpdateConfig {
    #[serde(default)]
    pub filters: Vec<DocUpdateFilter>,
    #[serde(default)]
    pub update: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub remove_key: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocUpdateFilter {
    #[serde(default)]
    pub app_type: Option<String>,
    #[serde(default)]
    pub from_date: Option<String>,
    #[serde(default)]
    pub to_date: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
}

// Custom serde module for `+HH:MM` offsets
mod offset_format {
    use chrono::FixedOffset;
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(offset: &Option<FixedOffset>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match offset {
            Some(o) => serializer.serialize_str(&o.to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<FixedOffset>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = Option::<String>::deserialize(deserializer)?;
        match s {
            None => Ok(None),
            Some(s) if s.is_empty() => Ok(None),
            Some(s) => parse_offset(&s).map(Some).map_err(serde::de::Error::custom),
        }
    }

    pub(super) fn parse_offset(s: &str) -> Result<FixedOffset, String> {
        let s = s.trim();
        if s == "Z" || s == "UTC" {
            return FixedOffset::east_opt(0).ok_or_else(|| "invalid offset".to_string());
        }
        let (sign, rest) = match s.as_bytes().first() {
            Some(b'+') => (1, &s[1..]),
            Some(b'-') => (-1, &s[1..]),
            _ => return Err(format!("invalid time zone offset: {}", s)),
        };
        let (hours, minutes) = rest
            .split_once(':')
            .unwrap_or((rest, "0"));
        let hours: i32 = hours
            .parse()
            .map_err(|_| format!("invalid time zone offset: {}", s))?;
        let minutes: i32 = minutes
            .parse()
            .map_err(|_| format!("invalid time zone offset: {}", s))?;
        FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
            .ok_or_else(|| format!("time zone offset out of range: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_offset() {
        assert_eq!(
            offset_format::parse_offset("+02:00").unwrap().local_minus_utc(),
            7200
        );
        assert_eq!(
            offset_format::parse_offset("-05:30").unwrap().local_minus_utc(),
            -19800
        );
        assert_eq!(offset_format::parse_offset("Z").unwrap().local_minus_utc(), 0);
        assert!(offset_format::parse_offset("Europe/Prague").is_err());
    }

    #[test]
    fn test_tail_defaults() {
        let conf: TailConfig = serde_json::from_str(
            r#"{"worklogPath": "/var/lib/logfeed/worklog.json", "files": []}"#,
        )
        .unwrap();
        assert_eq!(conf.interval_secs, 15);
        assert_eq!(conf.max_lines_per_check, 1000);
        assert_eq!(conf.buffer_state_dir(), PathBuf::from("/var/lib/logfeed"));
    }

    #[test]
    fn test_bot_detection_keys() {
        let conf: BotDetectionConfig = serde_json::from_str(
            r#"{"prevNumReqsSampleSize": 20, "trafficReportingThreshold": 3.0,
                "IPOutlierMinFreq": 10, "IPOutlierCoeff": 1.5, "blocklistIP": ["1.2.3.4"]}"#,
        )
        .unwrap();
        assert_eq!(conf.ip_outlier_min_freq, 10);
        assert_eq!(conf.blocklist_ip, vec!["1.2.3.4".to_string()]);
    }
}
