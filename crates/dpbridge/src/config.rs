//! Configuration file parsing and structures.
//!
//! dpbridge uses TOML for declarative configuration. Every section is
//! optional; an empty file is a valid configuration with no sources.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use tracing_subscriber::filter::LevelFilter;

#[cfg(feature = "source_mqtt")]
use crate::sources::mqtt::MqttConfig;
use crate::virtual_handlers::DescriptorsByCategory;

/// Top-level configuration structure
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub manager: ManagerConfig,

    #[serde(default)]
    pub sources: SourcesConfig,

    /// Entity descriptors by platform, then device category
    #[serde(default)]
    pub descriptors: BTreeMap<String, DescriptorsByCategory>,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default)]
    pub level: LogLevel,

    /// Per-target levels, e.g. `"dpbridge::merge" = "debug"`
    #[serde(default)]
    pub overrides: HashMap<String, LogLevel>,
}

fn default_authority_window_secs() -> u64 {
    10
}

fn default_refresh_interval_secs() -> u64 {
    300
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ManagerConfig {
    /// Devices whose traffic is traced at warn level
    #[serde(default)]
    pub watched_devices: Vec<String>,

    /// How long a source stays authoritative for a code it reported.
    /// Zero disables arbitration.
    #[serde(default = "default_authority_window_secs")]
    pub authority_window_secs: u64,

    /// Period of the device cache refresh. Zero disables it.
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            watched_devices: Vec::new(),
            authority_window_secs: default_authority_window_secs(),
            refresh_interval_secs: default_refresh_interval_secs(),
        }
    }
}

/// Source plugin configuration; a plugin without a section is not loaded
#[derive(Debug, Default, Deserialize)]
pub struct SourcesConfig {
    #[cfg(feature = "source_mqtt")]
    #[serde(default)]
    pub mqtt: Option<MqttConfig>,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(path.as_ref().to_path_buf(), e))?;
        toml::from_str(&contents).map_err(ConfigError::Parse)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_parse_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.logging.level, LogLevel::Info);
        assert_eq!(config.manager, ManagerConfig::default());
        assert_eq!(config.manager.authority_window_secs, 10);
        assert!(config.descriptors.is_empty());
    }

    #[test]
    fn test_parse_logging_and_manager() {
        let toml = r#"
            [logging]
            level = "warn"

            [logging.overrides]
            "dpbridge::merge" = "trace"

            [manager]
            watched_devices = ["bf1"]
            authority_window_secs = 0
        "#;

        let config: Config = toml::from_str(toml).unwrap();

        assert_eq!(config.logging.level, LogLevel::Warn);
        assert_eq!(
            config.logging.overrides.get("dpbridge::merge"),
            Some(&LogLevel::Trace)
        );
        assert_eq!(config.manager.watched_devices, vec!["bf1"]);
        assert_eq!(config.manager.authority_window_secs, 0);
        assert_eq!(config.manager.refresh_interval_secs, 300);
    }

    #[test]
    fn test_parse_descriptors() {
        let toml = r#"
            [[descriptors.sensor.dlq]]
            key = "add_ele"
            virtual_state = ["copy_to_multiple_state_name"]
            vs_copy_delta_to_state = ["add_ele_today"]

            [[descriptors.sensor.dlq]]
            key = "add_ele_today"
            reset_daily = true

            [[descriptors.button.dlq]]
            key = "reset_add_ele"
            virtual_function = ["reset_state"]
            vf_reset_state = ["add_ele_today"]
        "#;

        let config: Config = toml::from_str(toml).unwrap();

        let sensors = &config.descriptors["sensor"]["dlq"];
        assert_eq!(sensors.len(), 2);
        assert!(sensors[0].virtual_state.copy_to_multiple_state_name);
        assert!(sensors[1].reset_daily);
        let buttons = &config.descriptors["button"]["dlq"];
        assert!(buttons[0].virtual_function.reset_state);
    }

    #[cfg(feature = "source_mqtt")]
    #[test]
    fn test_parse_mqtt_source() {
        let toml = r#"
            [sources.mqtt]
            broker = "localhost"
            username = "dpbridge"
        "#;

        let config: Config = toml::from_str(toml).unwrap();

        let mqtt = config.sources.mqtt.as_ref().unwrap();
        assert_eq!(mqtt.broker, "localhost");
        assert_eq!(mqtt.port, 1883);
        assert_eq!(mqtt.topic_prefix, "dpbridge");
        assert_eq!(mqtt.username.as_deref(), Some("dpbridge"));
        assert_eq!(mqtt.password, None);
    }

    #[test]
    fn test_parse_example_config() {
        let config: Config = toml::from_str(include_str!("../dpbridge.example.toml")).unwrap();

        assert_eq!(
            config.logging.overrides.get("dpbridge::merge"),
            Some(&LogLevel::Debug)
        );
        assert_eq!(config.manager.watched_devices, vec!["bf1234"]);
        assert_eq!(config.descriptors["sensor"]["dlq"].len(), 2);
        assert_eq!(
            config.descriptors["button"]["dlq"][0].vf_reset_state,
            vec!["add_ele_today"]
        );
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[manager]\nrefresh_interval_secs = 60").unwrap();

        let config = Config::from_file(file.path()).unwrap();

        assert_eq!(config.manager.refresh_interval_secs, 60);
    }

    #[test]
    fn test_from_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.toml");

        let err = Config::from_file(&path).unwrap_err();

        assert!(matches!(err, ConfigError::Io(ref p, _) if p == &path));
    }

    #[test]
    fn test_invalid_toml() {
        let err = toml::from_str::<Config>("[manager\n").unwrap_err();
        assert!(!ConfigError::Parse(err).to_string().is_empty());
    }
}
