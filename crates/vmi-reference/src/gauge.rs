// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Gauge metrics generator: emits the current source value when it changed
//! since the previous scan, plus unconditionally on every full cycle.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use vmi_core::generator::{
    GeneratorBase, MetricsGenerator, VmiContext, HOSTNAME_LABEL_NAME, INSTANCE_LABEL_NAME,
};
use vmi_core::runner::GeneratorBuildError;

use crate::config::ReferenceConfig;
use crate::sources::{RandomGaugeSource, RandomGaugeSourceConfig};

pub const GAUGE_METRICS_ID: &str = "gauge";
const GAUGE_METRIC: &str = "refvmi_gauge";

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(default)]
pub struct GaugeMetricsConfig {
    /// How often to generate the metrics, in seconds; <= 0 disables the
    /// generator.
    pub interval_secs: f64,
    /// Every N cycles the value is emitted even without a change; 0
    /// emits it on every cycle.
    pub full_metrics_factor: usize,
    pub source_config: RandomGaugeSourceConfig,
}

impl Default for GaugeMetricsConfig {
    fn default() -> Self {
        GaugeMetricsConfig {
            interval_secs: 2.,
            full_metrics_factor: 10,
            source_config: RandomGaugeSourceConfig::default(),
        }
    }
}

pub struct GaugeMetrics {
    base: GeneratorBase,
    source: RandomGaugeSource,
    // Dual slots for current/previous value, needed for the delta approach:
    val_cache: [Vec<u8>; 2],
    // Slot holding the current value; None until the first run, which then
    // stores into slot 0 without comparing.
    current_index: Option<usize>,
    gauge_metric: Vec<u8>,
}

impl GaugeMetrics {
    pub fn new(ctx: &VmiContext, cfg: &GaugeMetricsConfig) -> Self {
        let gauge_metric = format!(
            // N.B. space before value is included
            "{}{{{}=\"{}\",{}=\"{}\"}} ",
            GAUGE_METRIC, INSTANCE_LABEL_NAME, ctx.instance, HOSTNAME_LABEL_NAME, ctx.hostname
        )
        .into_bytes();
        GaugeMetrics {
            base: GeneratorBase::new(
                ctx,
                GAUGE_METRICS_ID,
                Duration::from_secs_f64(cfg.interval_secs.max(0.)),
                cfg.full_metrics_factor,
            ),
            source: RandomGaugeSource::new(&cfg.source_config),
            val_cache: [Vec::new(), Vec::new()],
            current_index: None,
            gauge_metric,
        }
    }

    async fn emit(&mut self, curr_val: &[u8]) -> bool {
        let ts = self.base.now();

        // Update the value cache:
        let curr_index = self.current_index.unwrap_or(0);
        let has_prev = self.current_index.is_some();
        self.val_cache[curr_index].clear();
        self.val_cache[curr_index].extend_from_slice(curr_val);

        let queue = Arc::clone(&self.base.metrics_queue);
        let mut buf = queue.get_buf();
        let (mut metrics_count, _) = self.base.metrics_start(&mut buf, ts);

        let prev_val = &self.val_cache[1 - curr_index];
        if !has_prev || self.base.cycle_num == 0 || curr_val != prev_val.as_slice() {
            buf.extend_from_slice(&self.gauge_metric);
            buf.extend_from_slice(curr_val);
            buf.extend_from_slice(self.base.ts_suffix());
            metrics_count += 1;
        }

        self.base
            .update_stats(metrics_count as u64, buf.len() as u64);
        queue.queue_buf(buf).await;

        // Toggle the dual cache slot:
        self.current_index = Some(1 - curr_index);
        self.base.advance_cycle();
        true
    }
}

#[async_trait]
impl MetricsGenerator for GaugeMetrics {
    fn id(&self) -> &str {
        &self.base.id
    }

    fn interval(&self) -> Duration {
        self.base.interval
    }

    async fn generate(&mut self) -> bool {
        self.source.refresh();
        let curr_val = self.source.val_bytes().to_vec();
        self.emit(&curr_val).await
    }
}

pub fn gauge_task_builder(
    ctx: &Arc<VmiContext>,
    cfg: &ReferenceConfig,
) -> Result<Vec<Box<dyn MetricsGenerator>>, GeneratorBuildError> {
    let gauge_config = &cfg.gauge_metrics;
    if gauge_config.interval_secs <= 0. {
        info!(
            interval_secs = gauge_config.interval_secs,
            "gauge metrics disabled"
        );
        return Ok(Vec::new());
    }
    info!(
        interval_secs = gauge_config.interval_secs,
        full_metrics_factor = gauge_config.full_metrics_factor,
        min = gauge_config.source_config.min,
        max = gauge_config.source_config.max,
        max_repeat = gauge_config.source_config.max_repeat,
        seed = gauge_config.source_config.seed,
        "gauge metrics"
    );
    Ok(vec![Box::new(GaugeMetrics::new(ctx, gauge_config))])
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

    fn gauge_lines(queue: &TestBufferQueue) -> Vec<String> {
        queue
            .queued_text()
            .lines()
            .filter(|line| line.starts_with(GAUGE_METRIC))
            .map(|line| line.to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_stable_value_emitted_once_per_full_cycle() {
        let (queue, ctx) = test_setup();
        let mut gauge = GaugeMetrics::new(
            &ctx,
            &GaugeMetricsConfig {
                full_metrics_factor: 4,
                ..Default::default()
            },
        );
        // A fresh context starts the cycle at 0, so the first run doubles as
        // the full cycle.
        assert_eq!(gauge.base.cycle_num, 0);

        // Two full rotations with a stable value: one emission per rotation
        // (cycle 0), nothing in between.
        for rotation in 0..2 {
            queue.clear();
            for _ in 0..4 {
                assert!(gauge.emit(b"7").await);
            }
            let lines = gauge_lines(&queue);
            assert_eq!(lines.len(), 1, "rotation {rotation}: {lines:?}");
            assert!(lines[0].starts_with("refvmi_gauge{vmi_inst=\"tvmi\",hostname=\"thost\"} 7 "));
        }
    }

    #[tokio::test]
    async fn test_changed_value_emitted_mid_cycle() {
        let (queue, ctx) = test_setup();
        let mut gauge = GaugeMetrics::new(
            &ctx,
            &GaugeMetricsConfig {
                full_metrics_factor: 8,
                ..Default::default()
            },
        );
        gauge.emit(b"1").await; // cycle 0, full emission
        queue.clear();
        gauge.emit(b"1").await; // unchanged, suppressed
        assert!(gauge_lines(&queue).is_empty());
        gauge.emit(b"2").await; // changed, emitted
        let lines = gauge_lines(&queue);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("} 2 "));
    }

    #[tokio::test]
    async fn test_first_run_always_emits() {
        let (queue, ctx) = test_setup();
        let config = GaugeMetricsConfig {
            full_metrics_factor: 4,
            ..Default::default()
        };
        // Cycle rotation: the second generator from this context starts at
        // cycle 1, yet its first run must still emit.
        let _first = GaugeMetrics::new(&ctx, &config);
        let mut gauge = GaugeMetrics::new(&ctx, &config);
        assert_eq!(gauge.base.cycle_num, 1);
        gauge.emit(b"3").await;
        assert_eq!(gauge_lines(&queue).len(), 1);
    }

    #[tokio::test]
    async fn test_dtime_metric_from_second_run() {
        let (queue, ctx) = test_setup();
        let mut gauge = GaugeMetrics::new(&ctx, &GaugeMetricsConfig::default());
        gauge.emit(b"5").await;
        let text = queue.queued_text();
        assert!(!text.contains("vmi_metrics_gen_dtime_sec"));
        gauge.emit(b"5").await;
        let text = queue.queued_text();
        assert!(text.contains("vmi_metrics_gen_dtime_sec"));
        assert!(text.contains("gen_id=\"gauge\""));
    }
}
