use super::{BulkWriter, Result, SinkError, SinkKind};
use crate::config::types::{DocUpdateConfig, DocUpdateFilter, ElasticConfig};
use crate::record::{BoundOutputRecord, ServiceOutput};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Deserialize)]
struct BulkItemStatus {
    #[serde(default)]
    status: u16,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<std::collections::HashMap<String, BulkItemStatus>>,
}

impl BulkResponse {
    fn first_error(&self) -> Option<String> {
        if !self.errors {
            return None;
        }
        self.items
            .iter()
            .flat_map(|item| item.values())
            .find_map(|status| {
                status
                    .error
                    .as_ref()
                    .map(|e| format!("status {}: {}", status.status, e))
            })
    }
}

/// Bulk body with one metadata line and one document line per record
pub fn bulk_body(index: &str, chunk: &[BoundOutputRecord]) -> Result<String> {
    let mut body = String::new();
    for item in chunk {
        let meta = json!({
            "index": {
                "_index": format!("{}_{}", index, item.rec.record_type()),
                "_id": item.rec.id(),
                "_type": "_doc",
            }
        });
        body.push_str(&serde_json::to_string(&meta)?);
        body.push('\n');
        body.push_str(&item.rec.to_json()?);
        body.push('\n');
    }
    body.push('\n');
    Ok(body)
}

/// Document index client (Elasticsearch compatible)
#[derive(Debug)]
pub struct ElasticWriter {
    server: String,
    index: String,
    client: reqwest::Client,
}

impl ElasticWriter {
    pub fn new(config: &ElasticConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.req_timeout_secs))
            .build()?;
        Ok(Self {
            server: config.server.trim_end_matches('/').to_string(),
            index: config.index.clone(),
            client,
        })
    }

    async fn post(&self, path: &str, content_type: &str, body: String) -> Result<Value> {
        let url = format!("{}{}", self.server, path);
        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await?;

        let status = response.status().as_u16();
        if status >= 400 {
            return Err(SinkError::Status {
                status,
                message: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response.json().await?)
    }

    /// Set fields of all matching documents, returns the number updated
    pub async fn update_by_query(&self, app_type: &str, conf: &DocUpdateConfig) -> Result<u64> {
        let body = json!({
            "query": search_query(&conf.filters),
            "script": update_script(&conf.update),
        });
        self.run_update_by_query(app_type, body).await
    }

    /// Remove a field from all matching documents
    pub async fn remove_key(&self, app_type: &str, conf: &DocUpdateConfig, key: &str) -> Result<u64> {
        let body = json!({
            "query": search_query(&conf.filters),
            "script": remove_key_script(key),
        });
        self.run_update_by_query(app_type, body).await
    }

    async fn run_update_by_query(&self, app_type: &str, body: Value) -> Result<u64> {
        let path = format!("/{}_{}/_update_by_query?conflicts=proceed", self.index, app_type);
        let response = self
            .post(&path, "application/json", serde_json::to_string(&body)?)
            .await?;
        let updated = response["updated"].as_u64().unwrap_or(0);
        info!(index = %self.index, app_type, updated, "Update by query finished");
        Ok(updated)
    }
}

/// Painless script setting every field of `fields`, names travel as params
pub fn update_script(fields: &Map<String, Value>) -> Value {
    json!({
        "source": "for (entry in params.fields.entrySet()) { ctx._source[entry.getKey()] = entry.getValue(); }",
        "lang": "painless",
        "params": {"fields": fields},
    })
}

pub fn remove_key_script(key: &str) -> Value {
    json!({
        "source": "ctx._source.remove(params.key)",
        "lang": "painless",
        "params": {"key": key},
    })
}

/// Conjunction of the configured filters as a bool query
pub fn search_query(filters: &[DocUpdateFilter]) -> Value {
    let mut must = Vec::new();
    for f in filters {
        if let Some(app_type) = &f.app_type {
            must.push(json!({"term": {"type": app_type}}));
        }
        if let Some(ip) = &f.ip_address {
            must.push(json!({"term": {"ipAddress": ip}}));
        }
        if let Some(ua) = &f.user_agent {
            must.push(json!({"match_phrase": {"userAgent": ua}}));
        }
        if f.from_date.is_some() || f.to_date.is_some() {
            let mut range = serde_json::Map::new();
            if let Some(from) = &f.from_date {
                range.insert("gte".to_string(), json!(from));
            }
            if let Some(to) = &f.to_date {
                range.insert("lte".to_string(), json!(to));
            }
            must.push(json!({"range": {"datetime": range}}));
        }
    }
    if must.is_empty() {
        json!({"match_all": {}})
    } else {
        json!({"bool": {"must": must}})
    }
}

#[async_trait]
impl BulkWriter for ElasticWriter {
    fn kind(&self) -> SinkKind {
        SinkKind::Doc
    }

    async fn write_chunk(&self, chunk: &[BoundOutputRecord]) -> Result<()> {
        let body = bulk_body(&self.index, chunk)?;
        let response = self.post("/_bulk", "application/x-ndjson", body).await?;
        let parsed: BulkResponse = serde_json::from_value(response)?;
        match parsed.first_error() {
            Some(e) => Err(SinkError::ItemErrors(e)),
            None => Ok(()),
        }
    }
}
