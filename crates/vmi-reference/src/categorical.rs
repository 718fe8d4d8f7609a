// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pseudo-categorical metrics generator: one labeled time series per
//! category, the active one at 1. When the choice moves from X to Y, two
//! samples go out with the same timestamp: `{choice="X"} 0` then
//! `{choice="Y"} 1`. On a full cycle without a change the current choice is
//! re-emitted at 1.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use vmi_core::generator::{
    GeneratorBase, MetricsGenerator, VmiContext, HOSTNAME_LABEL_NAME, INSTANCE_LABEL_NAME,
};
use vmi_core::runner::GeneratorBuildError;

use crate::config::ReferenceConfig;
use crate::sources::{RandomCategoricalSource, RandomCategoricalSourceConfig};

pub const CATEGORICAL_METRICS_ID: &str = "categorical";
const CATEGORICAL_METRIC: &str = "refvmi_categorical";
const CATEGORY_LABEL: &str = "choice";

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(default)]
pub struct CategoricalMetricsConfig {
    /// How often to generate the metrics, in seconds; <= 0 disables the
    /// generator.
    pub interval_secs: f64,
    /// Every N cycles the active choice is emitted even without a change; 0
    /// emits it on every cycle.
    pub full_metrics_factor: usize,
    pub source_config: RandomCategoricalSourceConfig,
}

impl Default for CategoricalMetricsConfig {
    fn default() -> Self {
        CategoricalMetricsConfig {
            interval_secs: 5.,
            full_metrics_factor: 12,
            source_config: RandomCategoricalSourceConfig::default(),
        }
    }
}

pub struct CategoricalMetrics {
    base: GeneratorBase,
    source: RandomCategoricalSource,
    // The previous choice:
    val: Vec<u8>,
    // The metric for the current choice; rebuilt on every transition, kept
    // so the outgoing choice can be zeroed first.
    categorical_metric: Option<Vec<u8>>,
}

impl CategoricalMetrics {
    pub fn new(ctx: &VmiContext, cfg: &CategoricalMetricsConfig) -> Self {
        CategoricalMetrics {
            base: GeneratorBase::new(
                ctx,
                CATEGORICAL_METRICS_ID,
                Duration::from_secs_f64(cfg.interval_secs.max(0.)),
                cfg.full_metrics_factor,
            ),
            source: RandomCategoricalSource::new(&cfg.source_config),
            val: Vec::new(),
            categorical_metric: None,
        }
    }

    fn build_metric(&self, choice: &[u8]) -> Vec<u8> {
        format!(
            // N.B. space before value is included
            "{}{{{}=\"{}\",{}=\"{}\",{}=\"{}\"}} ",
            CATEGORICAL_METRIC,
            INSTANCE_LABEL_NAME,
            self.base.instance,
            HOSTNAME_LABEL_NAME,
            self.base.hostname,
            CATEGORY_LABEL,
            String::from_utf8_lossy(choice)
        )
        .into_bytes()
    }

    async fn emit(&mut self, curr_val: &[u8]) -> bool {
        let ts = self.base.now();
        let queue = Arc::clone(&self.base.metrics_queue);
        let mut buf = queue.get_buf();
        let (mut metrics_count, _) = self.base.metrics_start(&mut buf, ts);

        let changed = curr_val != self.val.as_slice();
        if changed {
            self.val = curr_val.to_vec();
            if let Some(previous_metric) = &self.categorical_metric {
                // Mark the previous category as inactive:
                buf.extend_from_slice(previous_metric);
                buf.push(b'0');
                buf.extend_from_slice(self.base.ts_suffix());
                metrics_count += 1;
            }
            self.categorical_metric = Some(self.build_metric(curr_val));
        }
        if self.base.cycle_num == 0 || changed {
            if let Some(current_metric) = &self.categorical_metric {
                buf.extend_from_slice(current_metric);
                buf.push(b'1');
                buf.extend_from_slice(self.base.ts_suffix());
                metrics_count += 1;
            }
        }

        self.base
            .update_stats(metrics_count as u64, buf.len() as u64);
        queue.queue_buf(buf).await;

        self.base.advance_cycle();
        true
    }
}

#[async_trait]
impl MetricsGenerator for CategoricalMetrics {
    fn id(&self) -> &str {
        &self.base.id
    }

    fn interval(&self) -> Duration {
        self.base.interval
    }

    async fn generate(&mut self) -> bool {
        self.source.advance();
        let curr_val = self.source.val().to_vec();
        self.emit(&curr_val).await
    }
}

pub fn categorical_task_builder(
    ctx: &Arc<VmiContext>,
    cfg: &ReferenceConfig,
) -> Result<Vec<Box<dyn MetricsGenerator>>, GeneratorBuildError> {
    let categorical_config = &cfg.categorical_metrics;
    if categorical_config.interval_secs <= 0. {
        info!(
            interval_secs = categorical_config.interval_secs,
            "categorical metrics disabled"
        );
        return Ok(Vec::new());
    }
    info!(
        interval_secs = categorical_config.interval_secs,
        full_metrics_factor = categorical_config.full_metrics_factor,
        choices = categorical_config.source_config.choices.len(),
        max_repeat = categorical_config.source_config.max_repeat,
        seed = categorical_config.source_config.seed,
        "categorical metrics"
    );
    Ok(vec![Box::new(CategoricalMetrics::new(
        ctx,
        categorical_config,
    ))])
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmi_core::testutils::TestBufferQueue;

    fn test_setup() -> (Arc<TestBufferQueue>, Arc<VmiContext>) {
        let queue = Arc::new(TestBufferQueue::new());
        let ctx = Arc::new(VmiContext::new(
            "tvmi",
            "thost",
            "0.0.0",
            "n/a",
            Arc::clone(&queue) as Arc<dyn vmi_core::generator::BufferQueue>,
        ));
        (queue, ctx)
    }

    fn categorical_lines(queue: &TestBufferQueue) -> Vec<String> {
        queue
            .queued_text()
            .lines()
            .filter(|line| line.starts_with(CATEGORICAL_METRIC))
            .map(|line| line.to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_transition_emits_zero_then_one_with_same_timestamp() {
        let (queue, ctx) = test_setup();
        let mut categorical = CategoricalMetrics::new(
            &ctx,
            &CategoricalMetricsConfig {
                full_metrics_factor: 100,
                ..Default::default()
            },
        );
        categorical.emit(b"red").await;
        queue.clear();
        categorical.emit(b"blue").await;

        let lines = categorical_lines(&queue);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with(
            "refvmi_categorical{vmi_inst=\"tvmi\",hostname=\"thost\",choice=\"red\"} 0 "
        ));
        assert!(lines[1].starts_with(
            "refvmi_categorical{vmi_inst=\"tvmi\",hostname=\"thost\",choice=\"blue\"} 1 "
        ));
        // Both samples carry the same timestamp:
        let ts = |line: &str| line.rsplit(' ').next().unwrap().to_string();
        assert_eq!(ts(&lines[0]), ts(&lines[1]));
    }

    #[tokio::test]
    async fn test_first_run_emits_single_active_sample() {
        let (queue, ctx) = test_setup();
        let mut categorical =
            CategoricalMetrics::new(&ctx, &CategoricalMetricsConfig::default());
        categorical.emit(b"red").await;
        let lines = categorical_lines(&queue);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("choice=\"red\"} 1 "));
    }

    #[tokio::test]
    async fn test_stable_choice_reemitted_on_full_cycle_only() {
        let (queue, ctx) = test_setup();
        let mut categorical = CategoricalMetrics::new(
            &ctx,
            &CategoricalMetricsConfig {
                full_metrics_factor: 3,
                ..Default::default()
            },
        );
        assert_eq!(categorical.base.cycle_num, 0);
        categorical.emit(b"red").await; // cycle 0: emitted
        queue.clear();
        categorical.emit(b"red").await; // cycle 1: suppressed
        categorical.emit(b"red").await; // cycle 2: suppressed
        assert!(categorical_lines(&queue).is_empty());
        categorical.emit(b"red").await; // cycle 0: re-emitted
        let lines = categorical_lines(&queue);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("choice=\"red\"} 1 "));
    }
}
