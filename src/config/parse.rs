use super::types::*;
use crate::analysis::bot::MIN_PREV_NUM_REQUESTS_SAMPLE_SIZE;
use crate::config::{expand_env_vars, expand_tilde, unexpanded_env_vars};
use crate::services;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse JSON in '{path}': {source}")]
    JsonParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("validation failed:\n{}", .0.join("\n"))]
    ValidationList(Vec<String>),

    #[error("validation failed: {0}")]
    Validation(String),
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&raw, path)
}

/// Parse and validate config text, `origin` is only used in messages
pub fn parse_config(raw: &str, origin: &Path) -> Result<Config, ConfigError> {
    let expanded = expand_env_vars(raw);
    check_unexpanded_vars(&expanded)?;

    let mut config: Config =
        serde_json::from_str(&expanded).map_err(|source| ConfigError::JsonParse {
            path: origin.to_path_buf(),
            source,
        })?;
    expand_paths(&mut config);
    validate_config(&config)?;
    Ok(config)
}

fn check_unexpanded_vars(text: &str) -> Result<(), ConfigError> {
    let vars = unexpanded_env_vars(text);
    match vars.len() {
        0 => Ok(()),
        1 => Err(ConfigError::Validation(format!(
            "environment variable $env{{{0}}} is not set, export {0} or replace it in the config file",
            vars[0]
        ))),
        _ => Err(ConfigError::Validation(format!(
            "environment variables are not set: {}",
            vars.join(", ")
        ))),
    }
}

/// Expands tilde (~) in all path fields
fn expand_paths(config: &mut Config) {
    if let Some(tail) = config.log_tail.as_mut() {
        tail.worklog_path = expand_tilde(&tail.worklog_path);
        if let Some(dir) = tail.buffer_state_dir.as_mut() {
            *dir = expand_tilde(dir);
        }
        for file in tail.files.iter_mut() {
            file.path = expand_tilde(&file.path);
        }
    }
    for batch in config.log_files.iter_mut() {
        batch.src_path = expand_tilde(&batch.src_path);
        batch.worklog_path = expand_tilde(&batch.worklog_path);
    }
    if let Some(path) = config.geo_ip_db_path.as_mut() {
        *path = expand_tilde(path);
    }
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    if let Some(tail) = &config.log_tail {
        validate_tail(tail, &mut errors);
    }
    for (i, batch) in config.log_files.iter().enumerate() {
        let context = format!("logFiles[{}]", i);
        validate_app(&context, &batch.app_type, &batch.version, &mut errors);
        if let Some(buffer) = &batch.buffer {
            validate_buffer(&context, buffer, &mut errors);
        }
    }
    if let Some(es) = &config.elastic_search {
        if es.push_chunk_size == 0 {
            errors.push("elasticSearch.pushChunkSize must be > 0".to_string());
        }
        if es.server.is_empty() {
            errors.push("elasticSearch.server must not be empty".to_string());
        }
    }
    if let Some(influx) = &config.influx_db {
        if influx.push_chunk_size == 0 {
            errors.push("influxDb.pushChunkSize must be > 0".to_string());
        }
        if influx.server.is_empty() {
            errors.push("influxDb.server must not be empty".to_string());
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationList(errors))
    }
}

fn validate_tail(tail: &TailConfig, errors: &mut Vec<String>) {
    if tail.interval_secs == 0 {
        errors.push("logTail.intervalSecs must be > 0".to_string());
    }
    if tail.max_lines_per_check == 0 {
        errors.push("logTail.maxLinesPerCheck must be > 0".to_string());
    }
    if (tail.num_errors_alarm == 0) != (tail.err_count_time_range_secs == 0) {
        errors.push(
            "logTail.numErrorsAlarm and logTail.errCountTimeRangeSecs must be set together"
                .to_string(),
        );
    }

    let mut shared: HashMap<&str, (&str, &str, String)> = HashMap::new();
    for (i, file) in tail.files.iter().enumerate() {
        let context = format!("logTail.files[{}]", i);
        validate_app(&context, &file.app_type, &file.version, errors);
        let Some(buffer) = &file.buffer else {
            continue;
        };
        validate_buffer(&context, buffer, errors);
        if let Some(id) = buffer.id.as_deref() {
            match shared.get(id) {
                Some((app_type, version, first))
                    if *app_type != file.app_type || *version != file.version =>
                {
                    errors.push(format!(
                        "{}: shared buffer '{}' is used by {} with {} {}, found {} {}",
                        context, id, first, app_type, version, file.app_type, file.version
                    ));
                }
                Some(_) => {}
                None => {
                    shared.insert(id, (&file.app_type, &file.version, context.clone()));
                }
            }
        }
    }
}

fn validate_app(context: &str, app_type: &str, version: &str, errors: &mut Vec<String>) {
    if let Err(e) = services::resolve(app_type, version) {
        errors.push(format!("{}: {}", context, e));
    }
}

fn validate_buffer(context: &str, buffer: &BufferConfig, errors: &mut Vec<String>) {
    let Some(bot) = &buffer.bot_detection else {
        return;
    };
    if buffer.analysis_interval_secs == 0 {
        errors.push(format!(
            "{}: buffer.analysisIntervalSecs must be > 0 with bot detection",
            context
        ));
    }
    if bot.prev_num_reqs_sample_size < MIN_PREV_NUM_REQUESTS_SAMPLE_SIZE {
        errors.push(format!(
            "{}: botDetection.prevNumReqsSampleSize must be at least {}",
            context, MIN_PREV_NUM_REQUESTS_SAMPLE_SIZE
        ));
    }
    if bot.traffic_reporting_threshold <= 0.0 {
        errors.push(format!(
            "{}: botDetection.trafficReportingThreshold must be > 0",
            context
        ));
    }
    if bot.ip_outlier_coeff <= 0.0 {
        errors.push(format!("{}: botDetection.IPOutlierCoeff must be > 0", context));
    }
    if bot.ip_outlier_min_freq == 0 {
        errors.push(format!("{}: botDetection.IPOutlierMinFreq must be > 0", context));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Result<Config, ConfigError> {
        parse_config(raw, Path::new("test.json"))
    }

    const TAIL: &str = r#"{
        "logTail": {
            "intervalSecs": 5,
            "worklogPath": "/var/lib/logfeed/worklog.json",
            "numErrorsAlarm": 3,
            "errCountTimeRangeSecs": 60,
            "files": [
                {"path": "/var/log/kontext.log", "appType": "kontext", "version": "0.18", "tzShift": 120,
                 "buffer": {"id": "kontext", "historyLookupItems": 100, "analysisIntervalSecs": 60,
                            "botDetection": {"prevNumReqsSampleSize": 20, "trafficReportingThreshold": 3.0,
                                             "IPOutlierMinFreq": 10, "IPOutlierCoeff": 1.5, "blocklistIP": ["1.2.3.5"]}}},
                {"path": "/var/log/kontext2.log", "appType": "kontext", "version": "0.18",
                 "buffer": {"id": "kontext", "historyLookupItems": 100}}
            ]
        },
        "elasticSearch": {"server": "http://es:9200", "index": "logs"},
        "anonymousUsers": [0, 1]
    }"#;

    #[test]
    fn test_valid_tail_config() {
        let config = parse(TAIL).unwrap();
        let tail = config.log_tail.unwrap();
        assert_eq!(tail.files.len(), 2);
        assert_eq!(tail.max_lines_per_check, 1000);
        assert_eq!(tail.files[0].tz_shift, 120);
        let bot = tail.files[0].buffer.as_ref().unwrap().bot_detection.as_ref().unwrap();
        assert_eq!(bot.blocklist_ip, vec!["1.2.3.5".to_string()]);
        assert_eq!(config.elastic_search.unwrap().push_chunk_size, 500);
        assert_eq!(config.anonymous_users, vec![0, 1]);
    }

    #[test]
    fn test_collects_all_problems() {
        let raw = r#"{
            "logTail": {
                "intervalSecs": 0,
                "worklogPath": "/tmp/w.json",
                "numErrorsAlarm": 3,
                "files": [
                    {"path": "/a.log", "appType": "unknown", "version": "1"},
                    {"path": "/b.log", "appType": "kontext", "version": "0.18", "buffer": {"id": "x", "historyLookupItems": 5}},
                    {"path": "/c.log", "appType": "mapka", "version": "3", "buffer": {"id": "x", "historyLookupItems": 5}}
                ]
            },
            "influxDb": {"server": "http://influx", "database": "db", "measurement": "m", "pushChunkSize": 0}
        }"#;
        match parse(raw) {
            Err(ConfigError::ValidationList(errors)) => {
                assert_eq!(errors.len(), 5, "{:?}", errors);
                assert!(errors.iter().any(|e| e.contains("intervalSecs")));
                assert!(errors.iter().any(|e| e.contains("unknown")));
                assert!(errors.iter().any(|e| e.contains("shared buffer 'x'")));
                assert!(errors.iter().any(|e| e.contains("errCountTimeRangeSecs")));
                assert!(errors.iter().any(|e| e.contains("influxDb.pushChunkSize")));
            }
            other => panic!("expected validation errors, got {:?}", other),
        }
    }

    #[test]
    fn test_small_request_sample_is_rejected() {
        let raw = TAIL.replace(r#""prevNumReqsSampleSize": 20"#, r#""prevNumReqsSampleSize": 5"#);
        match parse(&raw) {
            Err(ConfigError::ValidationList(errors)) => {
                assert_eq!(errors.len(), 1, "{:?}", errors);
                assert!(errors[0].contains("prevNumReqsSampleSize must be at least 10"));
            }
            other => panic!("expected validation errors, got {:?}", other),
        }
        let raw = TAIL.replace(r#""prevNumReqsSampleSize": 20"#, r#""prevNumReqsSampleSize": 10"#);
        assert!(parse(&raw).is_ok());
    }

    #[test]
    fn test_env_expansion() {
        std::env::set_var("LOGFEED_PARSE_TEST_DIR", "/srv/logs");
        let raw = r#"{"logTail": {"worklogPath": "$env{LOGFEED_PARSE_TEST_DIR}/w.json", "files": []}}"#;
        let config = parse(raw).unwrap();
        assert_eq!(
            config.log_tail.unwrap().worklog_path,
            PathBuf::from("/srv/logs/w.json")
        );
        std::env::remove_var("LOGFEED_PARSE_TEST_DIR");
    }

    #[test]
    fn test_unset_env_var_is_error() {
        let raw = r#"{"geoIpDbPath": "$env{LOGFEED_SURELY_UNSET}/geo.json"}"#;
        assert!(matches!(parse(raw), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(parse("{"), Err(ConfigError::JsonParse { .. })));
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            load_config(Path::new("/nonexistent/logfeed.json")),
            Err(ConfigError::Io { .. })
        ));
    }
}
