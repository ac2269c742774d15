//! Configuration for the sluice binary.
//!
//! ```yaml
//! schema:
//!   data_source: wikipedia
//!   aggregators:
//!     - { type: count, name: rows }
//!     - { type: long_sum, name: added, field_name: added }
//! plumber:
//!   segment_granularity: hour
//!   window_period_secs: 600
//!   base_persist_directory: /var/lib/sluice
//! rejection_policy: { type: server_time, window_secs: 600 }
//! deep_storage: { url: "s3://segments/prod" }
//! metadata_store: { url: "file:///var/lib/sluice-meta" }
//! ```

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::policy::{RejectionPolicy, VersioningPolicy};
use crate::schema::Schema;
use crate::school::PlumberConfig;
use crate::time::SegmentGranularity;
pub use sluice_core::config::{MetricsConfig, load_yaml_file, parse_yaml};

#[derive(Parser, Debug)]
#[command(version)]
pub struct CliArgs {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    pub config: PathBuf,

    /// NDJSON file to ingest instead of stdin
    #[arg(short, long)]
    pub input: Option<PathBuf>,
}

/// Plumber settings as written in YAML. Durations are whole seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PlumberSection {
    #[serde(default)]
    pub segment_granularity: SegmentGranularity,
    #[serde(default = "default_window_period")]
    pub window_period_secs: u64,
    #[serde(default = "default_persist_period")]
    pub persist_period_secs: u64,
    #[serde(default = "default_base_persist_directory")]
    pub base_persist_directory: PathBuf,
    #[serde(default = "default_max_rows_in_memory")]
    pub max_rows_in_memory: usize,
    #[serde(default = "default_finish_timeout")]
    pub finish_timeout_secs: u64,
    #[serde(default = "default_handoff_check_period")]
    pub handoff_check_period_secs: u64,
    #[serde(default = "default_close_retry_base")]
    pub close_retry_base_secs: u64,
    #[serde(default = "default_close_retry_max")]
    pub close_retry_max_secs: u64,
    #[serde(default = "default_handoff_warn_after")]
    pub handoff_warn_after_secs: u64,
}

fn default_window_period() -> u64 {
    600
}

fn default_persist_period() -> u64 {
    600
}

fn default_base_persist_directory() -> PathBuf {
    PathBuf::from("/tmp/sluice")
}

fn default_max_rows_in_memory() -> usize {
    500_000
}

fn default_finish_timeout() -> u64 {
    60
}

fn default_handoff_check_period() -> u64 {
    60
}

fn default_close_retry_base() -> u64 {
    10
}

fn default_close_retry_max() -> u64 {
    600
}

fn default_handoff_warn_after() -> u64 {
    900
}

impl Default for PlumberSection {
    fn default() -> Self {
        Self {
            segment_granularity: SegmentGranularity::default(),
            window_period_secs: default_window_period(),
            persist_period_secs: default_persist_period(),
            base_persist_directory: default_base_persist_directory(),
            max_rows_in_memory: default_max_rows_in_memory(),
            finish_timeout_secs: default_finish_timeout(),
            handoff_check_period_secs: default_handoff_check_period(),
            close_retry_base_secs: default_close_retry_base(),
            close_retry_max_secs: default_close_retry_max(),
            handoff_warn_after_secs: default_handoff_warn_after(),
        }
    }
}

impl PlumberSection {
    pub fn to_plumber_config(&self) -> PlumberConfig {
        PlumberConfig::default()
            .with_segment_granularity(self.segment_granularity)
            .with_window_period(Duration::from_secs(self.window_period_secs))
            .with_persist_period(Duration::from_secs(self.persist_period_secs))
            .with_base_persist_directory(self.base_persist_directory.clone())
            .with_max_rows_in_memory(self.max_rows_in_memory)
            .with_finish_timeout(Duration::from_secs(self.finish_timeout_secs))
            .with_handoff_check_period(Duration::from_secs(self.handoff_check_period_secs))
            .with_close_retry(
                Duration::from_secs(self.close_retry_base_secs),
                Duration::from_secs(self.close_retry_max_secs),
            )
            .with_handoff_warn_after(Duration::from_secs(self.handoff_warn_after_secs))
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum RejectionPolicyConfig {
    #[default]
    Noop,
    ServerTime { window_secs: u64 },
}

impl RejectionPolicyConfig {
    pub fn to_policy(self) -> RejectionPolicy {
        match self {
            RejectionPolicyConfig::Noop => RejectionPolicy::Noop,
            RejectionPolicyConfig::ServerTime { window_secs } => {
                RejectionPolicy::server_time(Duration::from_secs(window_secs))
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum VersioningPolicyConfig {
    #[default]
    IntervalStart,
    Fixed { version: String },
}

impl VersioningPolicyConfig {
    pub fn to_policy(&self) -> VersioningPolicy {
        match self {
            VersioningPolicyConfig::IntervalStart => VersioningPolicy::IntervalStart,
            VersioningPolicyConfig::Fixed { version } => VersioningPolicy::fixed(version.clone()),
        }
    }
}

/// An object store location: local path, `file://`, `memory://` or `s3://bucket/prefix`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StorageSection {
    pub url: String,
    /// Backend options (credentials, region, endpoint, ...)
    #[serde(default)]
    pub options: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct HandoffSection {
    /// Treat a published segment as served by a local historical. Single-node deployments
    /// have no other source of handoff confirmations.
    #[serde(default = "default_assume_served_on_publish")]
    pub assume_served_on_publish: bool,
}

fn default_assume_served_on_publish() -> bool {
    true
}

impl Default for HandoffSection {
    fn default() -> Self {
        Self {
            assume_served_on_publish: default_assume_served_on_publish(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub schema: Schema,
    #[serde(default)]
    pub plumber: PlumberSection,
    #[serde(default)]
    pub rejection_policy: RejectionPolicyConfig,
    #[serde(default)]
    pub versioning_policy: VersioningPolicyConfig,
    pub deep_storage: StorageSection,
    pub metadata_store: StorageSection,
    #[serde(default)]
    pub handoff: HandoffSection,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = load_yaml_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = parse_yaml(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.schema.validate()?;
        self.plumber.to_plumber_config().validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::AggregatorSpec;

    const MINIMAL: &str = r#"
schema:
  data_source: wikipedia
  aggregators:
    - type: count
      name: rows
deep_storage:
  url: memory://deep
metadata_store:
  url: memory://meta
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::parse(MINIMAL).unwrap();
        assert_eq!(config.schema.data_source, "wikipedia");
        assert_eq!(
            config.schema.aggregators,
            vec![AggregatorSpec::Count {
                name: "rows".into()
            }]
        );
        assert_eq!(config.plumber, PlumberSection::default());
        assert_eq!(config.rejection_policy, RejectionPolicyConfig::Noop);
        assert!(config.handoff.assume_served_on_publish);

        let plumber = config.plumber.to_plumber_config();
        assert_eq!(plumber.window_period, Duration::from_secs(600));
        assert_eq!(plumber.segment_granularity, SegmentGranularity::Hour);
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
schema:
  data_source: wikipedia
  dimensions: [page, language]
  query_granularity: minute
  shard_spec: { type: linear, partition_num: 2 }
  aggregators:
    - { type: count, name: rows }
    - { type: double_sum, name: added, field_name: added }
plumber:
  segment_granularity: fifteen_minute
  window_period_secs: 30
  persist_period_secs: 5
  base_persist_directory: /data/sluice
  max_rows_in_memory: 1000
rejection_policy:
  type: server_time
  window_secs: 120
versioning_policy:
  type: fixed
  version: v7
deep_storage:
  url: s3://segments/prod
  options:
    aws_region: us-east-1
metadata_store:
  url: file:///var/lib/sluice-meta
handoff:
  assume_served_on_publish: false
metrics:
  address: 127.0.0.1:9100
"#;
        let config = Config::parse(yaml).unwrap();
        let plumber = config.plumber.to_plumber_config();
        assert_eq!(plumber.segment_granularity, SegmentGranularity::FifteenMinute);
        assert_eq!(plumber.persist_period, Duration::from_secs(5));
        assert_eq!(plumber.max_rows_in_memory, 1000);
        assert_eq!(
            config.rejection_policy.to_policy(),
            RejectionPolicy::server_time(Duration::from_secs(120))
        );
        assert_eq!(
            config.deep_storage.options.get("aws_region").map(String::as_str),
            Some("us-east-1")
        );
        assert!(!config.handoff.assume_served_on_publish);
        assert_eq!(config.metrics.address, "127.0.0.1:9100");
        assert_eq!(config.schema.shard_spec.partition_num(), 2);
    }

    #[test]
    fn test_env_interpolation() {
        // SAFETY: test-only, single-threaded access to this variable
        unsafe { std::env::set_var("SLUICE_TEST_DEEP_URL", "memory://from-env") };
        let yaml = MINIMAL.replace("memory://deep", "${SLUICE_TEST_DEEP_URL}");
        let config = Config::parse(&yaml).unwrap();
        assert_eq!(config.deep_storage.url, "memory://from-env");
    }

    #[test]
    fn test_zero_persist_period_rejected() {
        let yaml = format!("{MINIMAL}plumber:\n  persist_period_secs: 0\n");
        assert!(matches!(
            Config::parse(&yaml),
            Err(ConfigError::ZeroPeriod {
                field: "persist_period"
            })
        ));
    }

    #[test]
    fn test_missing_schema_rejected() {
        let yaml = "deep_storage: { url: x }\nmetadata_store: { url: y }\n";
        assert!(matches!(
            Config::parse(yaml),
            Err(ConfigError::YamlParse { .. })
        ));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let yaml = format!("{MINIMAL}plumbr: {{}}\n");
        assert!(Config::parse(&yaml).is_err());
    }

    #[test]
    fn test_cli_args() {
        let args = CliArgs::parse_from(["sluice", "--config", "plumber.yaml", "-i", "rows.ndjson"]);
        assert_eq!(args.config, PathBuf::from("plumber.yaml"));
        assert_eq!(args.input, Some(PathBuf::from("rows.ndjson")));
    }
}
