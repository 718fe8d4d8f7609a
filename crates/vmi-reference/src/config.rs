// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Generator configuration, populated from the `generators` section of the
//! YAML config file.

use serde::Deserialize;

use crate::categorical::CategoricalMetricsConfig;
use crate::counter::CounterMetricsConfig;
use crate::gauge::GaugeMetricsConfig;

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ReferenceConfig {
    pub gauge_metrics: GaugeMetricsConfig,
    pub counter_metrics: CounterMetricsConfig,
    pub categorical_metrics: CategoricalMetricsConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ReferenceConfig::default();
        assert_eq!(cfg.gauge_metrics.interval_secs, 2.);
        assert_eq!(cfg.gauge_metrics.full_metrics_factor, 10);
        assert_eq!(cfg.counter_metrics.interval_secs, 2.);
        assert_eq!(cfg.categorical_metrics.interval_secs, 5.);
        assert_eq!(cfg.categorical_metrics.full_metrics_factor, 12);
    }

    #[test]
    fn test_deserialize_generators_section() {
        let text = r#"
gauge_metrics:
  interval_secs: 0.5
  full_metrics_factor: 4
  source_config:
    min: 0
    max: 100
    max_repeat: 5
    seed: 42
counter_metrics:
  interval_secs: 1
  source_config:
    init: 1000
    min_inc: 1
    max_inc: 50
categorical_metrics:
  interval_secs: 3
  source_config:
    choices: [red, green, blue]
    max_repeat: 4
"#;
        let cfg: ReferenceConfig = serde_yaml::from_str(text).unwrap();
        assert_eq!(cfg.gauge_metrics.interval_secs, 0.5);
        assert_eq!(cfg.gauge_metrics.source_config.max, 100);
        assert_eq!(cfg.gauge_metrics.source_config.seed, 42);
        assert_eq!(cfg.counter_metrics.source_config.init, 1000);
        assert_eq!(cfg.counter_metrics.source_config.max_inc, 50);
        assert_eq!(
            cfg.categorical_metrics.source_config.choices,
            vec!["red", "green", "blue"]
        );
    }
}
