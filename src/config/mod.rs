//! Configuration for netsensor.
//!
//! Process settings come from environment variables ([`ServerConfig`]);
//! everything about what to probe comes from a YAML file that is
//! normalized once into a [`SensorConfig`].

mod model;
pub mod normalize;

pub use model::*;

use std::env;
use std::fs;
use std::path::Path;

use thiserror::Error;

/// Configuration error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Process configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Path to the sensor YAML file (default: "/etc/netsensor/config.yaml")
    pub config_path: String,
    /// Overrides `metrics_port` from the YAML file
    pub metrics_port: Option<u16>,
    /// Overrides `results.db_path` from the YAML file
    pub db_path: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            config_path: "/etc/netsensor/config.yaml".to_string(),
            metrics_port: None,
            db_path: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `NETSENSOR_CONFIG`: YAML config path
    /// - `NETSENSOR_METRICS_PORT`: HTTP port for metrics and API
    /// - `NETSENSOR_DB_PATH`: results database file path
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(path) = env::var("NETSENSOR_CONFIG") {
            cfg.config_path = path;
        }

        if let Ok(port_str) = env::var("NETSENSOR_METRICS_PORT") {
            if let Ok(port) = port_str.parse() {
                cfg.metrics_port = Some(port);
            }
        }

        if let Ok(db_path) = env::var("NETSENSOR_DB_PATH") {
            cfg.db_path = Some(db_path);
        }

        cfg
    }

    /// Apply environment overrides on top of the file configuration.
    pub fn apply(&self, sensor: &mut SensorConfig) {
        if let Some(port) = self.metrics_port {
            sensor.metrics_port = port;
        }
        if let Some(db_path) = &self.db_path {
            sensor.results.db_path = db_path.clone();
        }
    }
}

/// Read and normalize the sensor YAML file. An empty file yields all defaults.
pub fn load_sensor_config<P: AsRef<Path>>(path: P) -> Result<SensorConfig, ConfigError> {
    let text = fs::read_to_string(path)?;
    let root: serde_yaml::Value = if text.trim().is_empty() {
        serde_yaml::Value::Null
    } else {
        serde_yaml::from_str(&text)?
    };
    Ok(normalize::normalize(&root))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.config_path, "/etc/netsensor/config.yaml");
        assert!(cfg.metrics_port.is_none());
        assert!(cfg.db_path.is_none());
    }

    #[test]
    fn test_load_sensor_config() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "sensor_name: bench\nwired:\n  - iface: eth0").unwrap();

        let mut cfg = load_sensor_config(file.path()).unwrap();
        assert_eq!(cfg.sensor_name, "bench");
        assert_eq!(cfg.networks.len(), 1);
        assert_eq!(cfg.metrics_port, 9105);

        let server = ServerConfig {
            metrics_port: Some(9999),
            db_path: Some("/tmp/r.db".to_string()),
            ..Default::default()
        };
        server.apply(&mut cfg);
        assert_eq!(cfg.metrics_port, 9999);
        assert_eq!(cfg.results.db_path, "/tmp/r.db");
    }

    #[test]
    fn test_load_sensor_config_errors() {
        assert!(matches!(
            load_sensor_config("/nonexistent/netsensor.yaml"),
            Err(ConfigError::Io(_))
        ));

        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "wifi: [unclosed").unwrap();
        assert!(matches!(load_sensor_config(file.path()), Err(ConfigError::Yaml(_))));

        let empty = NamedTempFile::new().unwrap();
        assert!(load_sensor_config(empty.path()).unwrap().networks.is_empty());
    }
}
