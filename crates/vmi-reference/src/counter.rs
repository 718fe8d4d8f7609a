// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Counter metrics generator: emits the delta since the previous scan and
//! the derived per-second rate. A run of zero deltas is emitted only once,
//! then suppressed until either the delta changes or a full cycle comes up.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use vmi_core::generator::{
    GeneratorBase, MetricsGenerator, VmiContext, HOSTNAME_LABEL_NAME, INSTANCE_LABEL_NAME,
};
use vmi_core::runner::GeneratorBuildError;

use crate::config::ReferenceConfig;
use crate::sources::{RandomCounterSource, RandomCounterSourceConfig};

pub const COUNTER_METRICS_ID: &str = "counter";
const COUNTER_DELTA_METRIC: &str = "refvmi_counter_delta";
const COUNTER_RATE_METRIC: &str = "refvmi_counter_rate";
const COUNTER_RATE_METRIC_PRECISION: usize = 3;

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(default)]
pub struct CounterMetricsConfig {
    /// How often to generate the metrics, in seconds; <= 0 disables the
    /// generator.
    pub interval_secs: f64,
    /// Every N cycles the metrics are emitted even without a change; 0
    /// emits them on every cycle.
    pub full_metrics_factor: usize,
    pub source_config: RandomCounterSourceConfig,
}

impl Default for CounterMetricsConfig {
    fn default() -> Self {
        CounterMetricsConfig {
            interval_secs: 2.,
            full_metrics_factor: 10,
            source_config: RandomCounterSourceConfig::default(),
        }
    }
}

pub struct CounterMetrics {
    base: GeneratorBase,
    source: RandomCounterSource,
    // Dual slots for current/previous value, needed for the delta approach:
    val_cache: [u32; 2],
    // Whether the previous delta was 0:
    zero_delta: bool,
    // Slot holding the current value; None until the first run.
    current_index: Option<usize>,
    counter_delta_metric: Vec<u8>,
    counter_rate_metric: Vec<u8>,
}

impl CounterMetrics {
    pub fn new(ctx: &VmiContext, cfg: &CounterMetricsConfig) -> Self {
        let labels = format!(
            "{{{}=\"{}\",{}=\"{}\"}} ", // N.B. space before value is included
            INSTANCE_LABEL_NAME, ctx.instance, HOSTNAME_LABEL_NAME, ctx.hostname
        );
        CounterMetrics {
            base: GeneratorBase::new(
                ctx,
                COUNTER_METRICS_ID,
                Duration::from_secs_f64(cfg.interval_secs.max(0.)),
                cfg.full_metrics_factor,
            ),
            source: RandomCounterSource::new(&cfg.source_config),
            val_cache: [0, 0],
            zero_delta: false,
            current_index: None,
            counter_delta_metric: format!("{COUNTER_DELTA_METRIC}{labels}").into_bytes(),
            counter_rate_metric: format!("{COUNTER_RATE_METRIC}{labels}").into_bytes(),
        }
    }

    async fn emit(&mut self, curr_val: u32) -> bool {
        let ts = self.base.now();

        // Update the value cache:
        let curr_index = self.current_index.unwrap_or(0);
        let has_prev = self.current_index.is_some();
        self.val_cache[curr_index] = curr_val;

        let queue = Arc::clone(&self.base.metrics_queue);
        let mut buf = queue.get_buf();
        let (mut metrics_count, last_ts) = self.base.metrics_start(&mut buf, ts);

        // All metrics depend upon having a previous value:
        if has_prev {
            let delta = curr_val.wrapping_sub(self.val_cache[1 - curr_index]);
            let delta_sec = last_ts
                .and_then(|last| ts.duration_since(last).ok())
                .unwrap_or_default()
                .as_secs_f64();
            let zero_delta = delta == 0;
            if !zero_delta || self.base.cycle_num == 0 || !self.zero_delta {
                buf.extend_from_slice(&self.counter_delta_metric);
                let _ = write!(buf, "{delta}");
                buf.extend_from_slice(self.base.ts_suffix());
                metrics_count += 1;

                if delta_sec > 0. {
                    buf.extend_from_slice(&self.counter_rate_metric);
                    let _ = write!(
                        buf,
                        "{:.*}",
                        COUNTER_RATE_METRIC_PRECISION,
                        delta as f64 / delta_sec
                    );
                    buf.extend_from_slice(self.base.ts_suffix());
                    metrics_count += 1;
                }
            }
            self.zero_delta = zero_delta;
        }

        self.base
            .update_stats(metrics_count as u64, buf.len() as u64);
        queue.queue_buf(buf).await;

        // Toggle the dual cache slot:
        self.current_index = Some(1 - curr_index);
        self.base.advance_cycle();
        true
    }

    #[cfg(test)]
    fn set_now_fn(&mut self, now_fn: fn() -> std::time::SystemTime) {
        self.base.set_now_fn(now_fn);
    }
}

#[async_trait]
impl MetricsGenerator for CounterMetrics {
    fn id(&self) -> &str {
        &self.base.id
    }

    fn interval(&self) -> Duration {
        self.base.interval
    }

    async fn generate(&mut self) -> bool {
        self.source.advance();
        let curr_val = self.source.val;
        self.emit(curr_val).await
    }
}

pub fn counter_task_builder(
    ctx: &Arc<VmiContext>,
    cfg: &ReferenceConfig,
) -> Result<Vec<Box<dyn MetricsGenerator>>, GeneratorBuildError> {
    let counter_config = &cfg.counter_metrics;
    if counter_config.interval_secs <= 0. {
        info!(
            interval_secs = counter_config.interval_secs,
            "counter metrics disabled"
        );
        return Ok(Vec::new());
    }
    info!(
        interval_secs = counter_config.interval_secs,
        full_metrics_factor = counter_config.full_metrics_factor,
        init = counter_config.source_config.init,
        min_inc = counter_config.source_config.min_inc,
        max_inc = counter_config.source_config.max_inc,
        max_repeat = counter_config.source_config.max_repeat,
        seed = counter_config.source_config.seed,
        "counter metrics"
    );
    Ok(vec![Box::new(CounterMetrics::new(ctx, counter_config))])
}
