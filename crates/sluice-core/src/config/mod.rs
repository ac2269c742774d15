//! Configuration helpers shared by sluice binaries.

mod vars;

pub use vars::{InterpolationResult, interpolate};

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::error::{ConfigError, ReadFileSnafu, YamlParseSnafu};

/// Metrics configuration for the Prometheus endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    /// Address to bind the metrics HTTP server (default: "0.0.0.0:9090").
    #[serde(default = "default_metrics_address")]
    pub address: String,
    /// Whether to start the HTTP endpoint at all.
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            address: default_metrics_address(),
            enabled: default_metrics_enabled(),
        }
    }
}

fn default_metrics_address() -> String {
    crate::metrics::DEFAULT_METRICS_ADDR.to_string()
}

fn default_metrics_enabled() -> bool {
    true
}

/// Interpolate environment variables in `contents` and deserialize the result as YAML.
pub fn parse_yaml<T: DeserializeOwned>(contents: &str) -> Result<T, ConfigError> {
    let result = interpolate(contents);
    if !result.is_ok() {
        return Err(ConfigError::EnvInterpolation {
            message: result.errors.join("\n"),
        });
    }

    serde_yaml::from_str(&result.text).context(YamlParseSnafu)
}

/// Read a YAML file from disk and parse it with [`parse_yaml`].
pub fn load_yaml_file<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let contents = std::fs::read_to_string(path).context(ReadFileSnafu {
        path: path.to_path_buf(),
    })?;
    parse_yaml(&contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_config_defaults() {
        let config: MetricsConfig = parse_yaml("{}").unwrap();
        assert_eq!(config, MetricsConfig::default());
        assert!(config.enabled);
    }

    #[test]
    fn test_metrics_config_rejects_unknown_fields() {
        let result: Result<MetricsConfig, _> = parse_yaml("adress: 127.0.0.1:1");
        assert!(matches!(result, Err(ConfigError::YamlParse { .. })));
    }

    #[test]
    fn test_load_yaml_file_missing() {
        let result: Result<MetricsConfig, _> =
            load_yaml_file(Path::new("/definitely/not/here.yaml"));
        assert!(matches!(result, Err(ConfigError::ReadFile { .. })));
    }
}
