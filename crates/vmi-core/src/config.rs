// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Importer configuration.
//!
//! The configuration is loaded from a YAML file with two top-level
//! sections: the fixed `vmi_config` section mapping to [`VmiConfig`] and an
//! opaque `generators` section handed verbatim to the importer's own
//! generator-config type:
//!
//! ```yaml
//! vmi_config:
//!   instance: vmi
//!   use_short_hostname: false
//!   shutdown_max_wait_secs: 5
//!   log_config:
//!     level: info
//!   compressor_pool_config:
//!     batch_target_size: 65536
//!   http_endpoint_pool_config:
//!     endpoints:
//!       - url: http://localhost:8428/api/v1/import/prometheus
//!   scheduler_config:
//!     num_workers: -1
//!   internal_metrics_config:
//!     interval_secs: 5
//! generators:
//!   gen1: ...
//! ```

use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;

use crate::compressor_pool::CompressorPoolConfig;
use crate::http_endpoint_pool::HttpEndpointPoolConfig;
use crate::internal_metrics::InternalMetricsConfig;
use crate::scheduler::SchedulerConfig;

pub const INSTANCE_DEFAULT: &str = "vmi";

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// trace, debug, info, warn or error.
    pub level: String,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        LoggerConfig {
            level: "info".to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct VmiConfig {
    /// The instance name; may be overridden by the --instance command line
    /// arg.
    pub instance: String,

    /// Strip the domain part off the hostname obtained from the OS. A
    /// hostname given via --hostname is used as-is.
    pub use_short_hostname: bool,

    /// How long to wait for a graceful shutdown. Negative waits
    /// indefinitely, 0 exits abruptly.
    pub shutdown_max_wait_secs: f64,

    pub log_config: LoggerConfig,
    pub compressor_pool_config: CompressorPoolConfig,
    pub http_endpoint_pool_config: HttpEndpointPoolConfig,
    pub scheduler_config: SchedulerConfig,
    pub internal_metrics_config: InternalMetricsConfig,
}

impl Default for VmiConfig {
    fn default() -> Self {
        VmiConfig {
            instance: INSTANCE_DEFAULT.to_string(),
            use_short_hostname: false,
            shutdown_max_wait_secs: 5.,
            log_config: LoggerConfig::default(),
            compressor_pool_config: CompressorPoolConfig::default(),
            http_endpoint_pool_config: HttpEndpointPoolConfig::default(),
            scheduler_config: SchedulerConfig::default(),
            internal_metrics_config: InternalMetricsConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("file {path:?}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("file {path:?}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
}

#[derive(Deserialize)]
#[serde(bound = "G: DeserializeOwned")]
struct ConfigDoc<G> {
    // Option, so that an empty section (YAML null) also falls back to the
    // defaults.
    vmi_config: Option<VmiConfig>,
    generators: Option<G>,
}

/// Parse a configuration document: the `vmi_config` section (defaulted when
/// absent or empty) plus the `generators` section decoded into `G`.
pub fn parse_config<G: DeserializeOwned>(
    text: &str,
    path: &str,
) -> Result<(VmiConfig, Option<G>), ConfigError> {
    if text.trim().is_empty() {
        return Ok((VmiConfig::default(), None));
    }
    let doc: ConfigDoc<G> = serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
        path: path.to_string(),
        source,
    })?;
    Ok((doc.vmi_config.unwrap_or_default(), doc.generators))
}

pub fn load_config<G: DeserializeOwned>(path: &str) -> Result<(VmiConfig, Option<G>), ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_string(),
        source,
    })?;
    parse_config(&text, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_parse_defaults_from_empty_sections() {
        let (cfg, generators) =
            parse_config::<HashMap<String, String>>("vmi_config:\n", "test.yaml").unwrap();
        assert_eq!(cfg.instance, "vmi");
        assert!(!cfg.use_short_hostname);
        assert_eq!(cfg.shutdown_max_wait_secs, 5.);
        assert_eq!(cfg.scheduler_config.num_workers, -1);
        assert_eq!(cfg.compressor_pool_config.batch_target_size, 64 * 1024);
        assert!(generators.is_none());
    }

    #[test]
    fn test_parse_full_document() {
        let text = r#"
vmi_config:
  instance: edge-importer
  use_short_hostname: true
  shutdown_max_wait_secs: 2.5
  log_config:
    level: debug
  scheduler_config:
    num_workers: 3
  compressor_pool_config:
    num_compressors: 2
    compression_level: 1
    batch_target_size: 1024
    flush_interval_secs: 0.5
  http_endpoint_pool_config:
    endpoints:
      - url: http://host1:8428/api/v1/import/prometheus
      - url: http://host2:8428/api/v1/import/prometheus
        mark_unhealthy_threshold: 3
    username: importer
    password: "env:VMI_PASSWORD"
    rate_limit_mbps: "100:100ms"
  internal_metrics_config:
    interval_secs: 10
    full_metrics_factor: 6
generators:
  knob: eleven
"#;
        let (cfg, generators) =
            parse_config::<HashMap<String, String>>(text, "test.yaml").unwrap();
        assert_eq!(cfg.instance, "edge-importer");
        assert!(cfg.use_short_hostname);
        assert_eq!(cfg.shutdown_max_wait_secs, 2.5);
        assert_eq!(cfg.log_config.level, "debug");
        assert_eq!(cfg.scheduler_config.num_workers, 3);
        assert_eq!(cfg.compressor_pool_config.num_compressors, 2);
        assert_eq!(cfg.compressor_pool_config.flush_interval_secs, 0.5);
        let pool = &cfg.http_endpoint_pool_config;
        assert_eq!(pool.endpoints.len(), 2);
        assert_eq!(pool.endpoints[1].mark_unhealthy_threshold, 3);
        assert_eq!(pool.username, "importer");
        assert_eq!(pool.rate_limit_mbps, "100:100ms");
        assert_eq!(cfg.internal_metrics_config.full_metrics_factor, 6);
        assert_eq!(generators.unwrap()["knob"], "eleven");
    }

    #[test]
    fn test_parse_error_is_reported() {
        let err = parse_config::<HashMap<String, String>>("vmi_config: [not, a, map]", "bad.yaml")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("bad.yaml"));
    }

    #[test]
    fn test_load_config_missing_file() {
        let err = load_config::<HashMap<String, String>>("/definitely/not/there.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
