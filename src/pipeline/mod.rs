pub mod channel;
pub mod ledger;
pub mod processor;
pub mod supervisor;

use crate::config::Config;
use crate::geo::{GeoError, GeoLookup, NullGeoLookup, StaticGeoLookup};
use crate::notify::Notifier;
use crate::sink::dummy::PrintWriter;
use crate::sink::elastic::ElasticWriter;
use crate::sink::influx::InfluxWriter;
use crate::sink::{SinkError, SinkKind};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

pub use channel::{create_channel, Receiver, Sender};
pub use ledger::{CheckOutcome, CheckSession, Tracked};
pub use processor::{FileProcessor, ProcessorStats, SinkSpec, TimeFilter};
pub use supervisor::{SupervisorError, TailSupervisor};

#[derive(Debug, Error)]
pub enum EnvError {
    #[error("failed to set up sink: {0}")]
    Sink(#[from] SinkError),

    #[error("failed to load geo database: {0}")]
    Geo(#[from] GeoError),
}

/// How the processors of one run are wired
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnvOptions {
    /// Print records instead of writing them, persist nothing
    pub dry_run: bool,
    /// Feed the analyzers only, no sink is created
    pub analysis_only: bool,
}

/// Shared collaborators handed to every file processor
#[derive(Clone)]
pub struct PipelineEnv {
    pub sinks: Vec<SinkSpec>,
    pub geo: Arc<dyn GeoLookup>,
    pub notifier: Notifier,
    pub dry_run: bool,
}

impl std::fmt::Debug for PipelineEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineEnv")
            .field("sinks", &self.sinks)
            .field("dry_run", &self.dry_run)
            .finish()
    }
}

impl PipelineEnv {
    pub fn from_config(config: &Config, options: EnvOptions, notifier: Notifier) -> Result<Self, EnvError> {
        let geo: Arc<dyn GeoLookup> = match &config.geo_ip_db_path {
            Some(path) => Arc::new(StaticGeoLookup::load(path)?),
            None => Arc::new(NullGeoLookup),
        };
        let sinks = if options.analysis_only {
            info!("Analysis only, records are not written anywhere");
            Vec::new()
        } else {
            build_sinks(config, options.dry_run)?
        };
        Ok(Self {
            sinks,
            geo,
            notifier,
            dry_run: options.dry_run,
        })
    }
}

fn build_sinks(config: &Config, dry_run: bool) -> Result<Vec<SinkSpec>, SinkError> {
    let mut sinks = Vec::new();
    if let Some(es) = &config.elastic_search {
        if dry_run {
            sinks.push(SinkSpec::new(Arc::new(PrintWriter::new(SinkKind::Doc)), es.push_chunk_size));
        } else {
            sinks.push(SinkSpec::new(Arc::new(ElasticWriter::new(es)?), es.push_chunk_size));
        }
    }
    if let Some(influx) = &config.influx_db {
        if dry_run {
            sinks.push(SinkSpec::new(
                Arc::new(PrintWriter::new(SinkKind::TimeSeries)),
                influx.push_chunk_size,
            ));
        } else {
            sinks.push(SinkSpec::new(
                Arc::new(InfluxWriter::new(influx)?),
                influx.push_chunk_size,
            ));
        }
    }
    if dry_run && sinks.is_empty() {
        sinks.push(SinkSpec::new(Arc::new(PrintWriter::new(SinkKind::Doc)), 100));
    }
    Ok(sinks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{ElasticConfig, InfluxConfig};

    fn config() -> Config {
        Config {
            elastic_search: Some(ElasticConfig {
                server: "http://localhost:9200".to_string(),
                index: "logs".to_string(),
                push_chunk_size: 50,
                req_timeout_secs: 5,
            }),
            influx_db: Some(InfluxConfig {
                server: "http://localhost:8086".to_string(),
                database: "logs".to_string(),
                measurement: "requests".to_string(),
                push_chunk_size: 20,
                retention_policy: String::new(),
                req_timeout_secs: 5,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_sinks_follow_config() {
        let env = PipelineEnv::from_config(&config(), EnvOptions::default(), Notifier::default()).unwrap();
        let kinds: Vec<SinkKind> = env.sinks.iter().map(|s| s.writer.kind()).collect();
        assert_eq!(kinds, vec![SinkKind::Doc, SinkKind::TimeSeries]);
        assert_eq!(env.sinks[0].chunk_size, 50);
    }

    #[test]
    fn test_analysis_only_has_no_sinks() {
        let options = EnvOptions {
            analysis_only: true,
            ..Default::default()
        };
        let env = PipelineEnv::from_config(&config(), options, Notifier::default()).unwrap();
        assert!(env.sinks.is_empty());
    }

    #[test]
    fn test_dry_run_prints_without_sink_config() {
        let options = EnvOptions {
            dry_run: true,
            ..Default::default()
        };
        let env = PipelineEnv::from_config(&Config::default(), options, Notifier::default()).unwrap();
        assert_eq!(env.sinks.len(), 1);
        assert!(env.dry_run);
    }
}
