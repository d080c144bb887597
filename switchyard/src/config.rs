use dispatcher::config::Config as DispatcherConfig;
use serde::Deserialize;
use std::fs::File;

#[derive(Debug, Deserialize)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
}

#[derive(Debug, Deserialize)]
struct CommonConfig {
    metrics: Option<MetricsConfig>,
}

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(flatten)]
    common: CommonConfig,
    pub dispatcher: Option<DispatcherConfig>,
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let data = serde_yaml::from_reader(file)?;

        Ok(data)
    }

    pub fn metrics(&self) -> Option<&MetricsConfig> {
        self.common.metrics.as_ref()
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatcher::config::{KvBackend, Listener};
    use std::io::Write;

    fn write_tmp_file(s: &str) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        write!(tmp, "{}", s).expect("write yaml");

        tmp
    }

    #[test]
    fn dispatcher_config() {
        let yaml = r#"
            metrics:
                statsd_host: 127.0.0.1
                statsd_port: 8125
            dispatcher:
                listener: {host: 0.0.0.0, port: 8080}
                stores:
                    kv: {type: rest, url: "http://kv.internal"}
                    control_url: "http://control.internal"
                    events: {type: rest, url: "http://events.internal"}
                    assets: {type: filesystem, path: /srv/assets}
                    drives: {type: filesystem, path: /srv/drives}
            "#;
        let tmp = write_tmp_file(yaml);
        let config = Config::from_file(tmp.path()).expect("load config");
        assert_eq!(config.metrics().unwrap().statsd_port, 8125);

        let dispatcher = config.dispatcher.expect("dispatcher config");
        assert_eq!(
            dispatcher.listener,
            Listener {
                host: "0.0.0.0".into(),
                port: 8080
            }
        );
        assert_eq!(
            dispatcher.stores.kv,
            KvBackend::Rest {
                url: "http://kv.internal".into()
            }
        );
    }

    #[test]
    fn metrics_section_is_optional() {
        let tmp = write_tmp_file("dispatcher:\n");
        let config = Config::from_file(tmp.path()).expect("load config");
        assert!(config.metrics().is_none());
    }
}
