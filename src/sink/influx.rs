use super::{BulkWriter, Result, SinkError, SinkKind};
use crate::config::types::InfluxConfig;
use crate::record::{BoundOutputRecord, FieldValue, ServiceOutput};
use async_trait::async_trait;
use std::time::Duration;

fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

fn escape_key(s: &str) -> String {
    s.replace(',', "\\,").replace('=', "\\=").replace(' ', "\\ ")
}

fn format_field(value: &FieldValue) -> String {
    match value {
        FieldValue::Int(v) => format!("{}i", v),
        FieldValue::Float(v) => format!("{}", v),
        FieldValue::Bool(v) => v.to_string(),
        FieldValue::Str(v) => format!("\"{}\"", v.replace('\\', "\\\\").replace('"', "\\\"")),
    }
}

/// A point in line protocol, `None` for records without fields.
/// Tags with empty values are left out.
pub fn line_protocol(measurement: &str, item: &BoundOutputRecord) -> Option<String> {
    let point = item.rec.to_time_series();
    if point.values.is_empty() {
        return None;
    }
    let mut line = escape_measurement(measurement);
    for (key, value) in point.tags.iter().filter(|(_, v)| !v.is_empty()) {
        line.push(',');
        line.push_str(&escape_key(key));
        line.push('=');
        line.push_str(&escape_key(value));
    }
    line.push(' ');
    let fields: Vec<String> = point
        .values
        .iter()
        .map(|(key, value)| format!("{}={}", escape_key(key), format_field(value)))
        .collect();
    line.push_str(&fields.join(","));
    let ts = item.rec.time().timestamp_nanos_opt().unwrap_or_default();
    line.push_str(&format!(" {}", ts));
    Some(line)
}

/// Time-series store client speaking the InfluxDB 1.x write API
#[derive(Debug)]
pub struct InfluxWriter {
    url: String,
    measurement: String,
    client: reqwest::Client,
}

impl InfluxWriter {
    pub fn new(config: &InfluxConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.req_timeout_secs))
            .build()?;
        let mut url = format!(
            "{}/write?db={}",
            config.server.trim_end_matches('/'),
            config.database
        );
        if !config.retention_policy.is_empty() {
            url.push_str(&format!("&rp={}", config.retention_policy));
        }
        url.push_str("&precision=ns");
        Ok(Self {
            url,
            measurement: config.measurement.clone(),
            client,
        })
    }
}

#[async_trait]
impl BulkWriter for InfluxWriter {
    fn kind(&self) -> SinkKind {
        SinkKind::TimeSeries
    }

    async fn write_chunk(&self, chunk: &[BoundOutputRecord]) -> Result<()> {
        let lines: Vec<String> = chunk
            .iter()
            .filter_map(|item| line_protocol(&self.measurement, item))
            .collect();
        if lines.is_empty() {
            return Ok(());
        }
        let response = self
            .client
            .post(&self.url)
            .body(lines.join("\n"))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SinkError::Status {
                status: response.status().as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }
}
