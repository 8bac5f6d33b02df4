use logfeed::config::{load_config, ConfigError};
use logfeed::pipeline::{EnvOptions, PipelineEnv};
use logfeed::notify::Notifier;
use std::fs;
use tempfile::TempDir;

#[test]
fn test_full_config_from_file() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("logfeed.json");
    let geo_path = temp_dir.path().join("geo.json");
    fs::write(
        &geo_path,
        r#"[{"prefix": "195.113.0.0/16", "countryName": "Czechia", "latitude": 50.0, "longitude": 14.4}]"#,
    )
    .unwrap();
    let raw = format!(
        r#"{{
            "logTail": {{
                "intervalSecs": 10,
                "worklogPath": "{dir}/worklog.json",
                "files": [{{"path": "{dir}/mapka.log", "appType": "mapka", "version": "3"}}]
            }},
            "logFiles": [{{"srcPath": "{dir}/archive", "worklogPath": "{dir}/batch.worklog", "appType": "kontext", "version": "0.19"}}],
            "geoIpDbPath": "{geo}",
            "elasticSearch": {{"server": "http://localhost:9200", "index": "logs"}},
            "influxDb": {{"server": "http://localhost:8086", "database": "logs", "measurement": "requests"}},
            "timeZone": "+01:00",
            "notificationTag": "test"
        }}"#,
        dir = temp_dir.path().display(),
        geo = geo_path.display()
    );
    fs::write(&config_path, raw).unwrap();

    let config = load_config(&config_path).expect("config should be valid");
    assert_eq!(config.log_tail.as_ref().unwrap().interval_secs, 10);
    assert_eq!(config.log_files.len(), 1);
    assert_eq!(config.time_zone.unwrap().local_minus_utc(), 3600);

    let env = PipelineEnv::from_config(&config, EnvOptions::default(), Notifier::default()).unwrap();
    assert_eq!(env.sinks.len(), 2);
}

#[test]
fn test_unknown_service_version() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("logfeed.json");
    fs::write(
        &config_path,
        r#"{"logTail": {"worklogPath": "/tmp/w.json", "files": [{"path": "/tmp/a.log", "appType": "kontext", "version": "0.1"}]}}"#,
    )
    .unwrap();

    match load_config(&config_path) {
        Err(ConfigError::ValidationList(errors)) => {
            assert_eq!(errors.len(), 1);
            assert!(errors[0].contains("logTail.files[0]"));
        }
        other => panic!("expected validation error, got {:?}", other),
    }
}

#[test]
fn test_missing_geo_database_fails_startup() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("logfeed.json");
    fs::write(&config_path, r#"{"geoIpDbPath": "/nonexistent/geo.json"}"#).unwrap();
    let config = load_config(&config_path).unwrap();
    assert!(PipelineEnv::from_config(&config, EnvOptions::default(), Notifier::default()).is_err());
}
