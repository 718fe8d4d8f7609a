// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Self-metrics generator.
//!
//! Publishes the scheduler, compressor-pool, endpoint-pool and generator
//! stats as deltas between two successive snapshots, plus uptime and build
//! info. Snapshots live in a current/previous pair toggled after every
//! generation, so the stat sources are only locked for the brief copy.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use crate::compressor_pool::{CompressorPool, CompressorPoolStats};
use crate::generator::{
    BufferQueue, GeneratorBase, GeneratorStatsContainer, GeneratorStatsMap, MetricsGenerator,
    VmiContext, GENERATOR_ID_LABEL_NAME, HOSTNAME_LABEL_NAME, INSTANCE_LABEL_NAME,
};
use crate::http_endpoint_pool::{HttpEndpointPool, HttpEndpointPoolStats};
use crate::scheduler::{Scheduler, SchedulerStats};

pub const INTERNAL_METRICS_ID: &str = "internal_metrics";

// Importer heartbeat and build info:
const VMI_UPTIME_METRIC: &str = "vmi_uptime_sec";
const VMI_BUILDINFO_METRIC: &str = "vmi_buildinfo";
const VMI_VERSION_LABEL_NAME: &str = "vmi_version";
const VMI_GIT_INFO_LABEL_NAME: &str = "vmi_git_info";
const UPTIME_METRIC_PRECISION: usize = 6;

// Task scheduler deltas since the previous internal metrics interval:
const TASK_STATS_SCHEDULED_DELTA_METRIC: &str = "vmi_task_scheduled_delta";
const TASK_STATS_DELAYED_DELTA_METRIC: &str = "vmi_task_delayed_delta";
const TASK_STATS_OVERRUN_DELTA_METRIC: &str = "vmi_task_overrun_delta";
const TASK_STATS_EXECUTED_DELTA_METRIC: &str = "vmi_task_executed_delta";
const TASK_STATS_NEXT_TS_HACK_DELTA_METRIC: &str = "vmi_task_next_ts_hack_delta";
const TASK_STATS_AVG_RUNTIME_METRIC: &str = "vmi_task_avg_runtime_sec";
const TASK_STATS_AVG_RUNTIME_METRIC_PRECISION: usize = 6;

// Compressor deltas since the previous internal metrics interval:
const COMPRESSOR_STATS_READ_DELTA_METRIC: &str = "vmi_compressor_read_delta";
const COMPRESSOR_STATS_READ_BYTE_DELTA_METRIC: &str = "vmi_compressor_read_byte_delta";
const COMPRESSOR_STATS_SEND_DELTA_METRIC: &str = "vmi_compressor_send_delta";
const COMPRESSOR_STATS_SEND_BYTE_DELTA_METRIC: &str = "vmi_compressor_send_byte_delta";
const COMPRESSOR_STATS_TIMEOUT_FLUSH_DELTA_METRIC: &str = "vmi_compressor_tout_flush_delta";
const COMPRESSOR_STATS_SEND_ERROR_DELTA_METRIC: &str = "vmi_compressor_send_error_delta";
const COMPRESSOR_STATS_WRITE_ERROR_DELTA_METRIC: &str = "vmi_compressor_write_error_delta";
const COMPRESSOR_STATS_COMPRESSION_FACTOR_METRIC: &str = "vmi_compressor_compression_factor";
const COMPRESSOR_ID_LABEL_NAME: &str = "compressor";
const COMPRESSION_FACTOR_METRIC_PRECISION: usize = 2;

// HTTP endpoint deltas since the previous internal metrics interval:
const HTTP_ENDPOINT_STATS_SEND_BUFFER_DELTA_METRIC: &str = "vmi_http_ep_send_buffer_delta";
const HTTP_ENDPOINT_STATS_SEND_BUFFER_BYTE_DELTA_METRIC: &str =
    "vmi_http_ep_send_buffer_byte_delta";
const HTTP_ENDPOINT_STATS_SEND_BUFFER_ERROR_DELTA_METRIC: &str =
    "vmi_http_ep_send_buffer_error_delta";
const HTTP_ENDPOINT_STATS_HEALTH_CHECK_DELTA_METRIC: &str = "vmi_http_ep_healthcheck_delta";
const HTTP_ENDPOINT_STATS_HEALTH_CHECK_ERROR_DELTA_METRIC: &str =
    "vmi_http_ep_healthcheck_error_delta";
const HTTP_ENDPOINT_URL_LABEL_NAME: &str = "url";
const HTTP_ENDPOINT_POOL_STATS_HEALTHY_ROTATE_DELTA_METRIC: &str =
    "vmi_http_ep_pool_healthy_rotate_delta";
const HTTP_ENDPOINT_POOL_STATS_NO_HEALTHY_EP_ERROR_DELTA_METRIC: &str =
    "vmi_http_ep_pool_no_healthy_ep_error_delta";

// Generator deltas since the previous internal metrics interval:
const METRICS_GENERATOR_INVOCATION_DELTA_METRIC: &str = "vmi_metrics_gen_invocation_delta";
const METRICS_GENERATOR_METRICS_DELTA_METRIC: &str = "vmi_metrics_gen_metrics_delta";
const METRICS_GENERATOR_BYTE_DELTA_METRIC: &str = "vmi_metrics_gen_byte_delta";

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct InternalMetricsConfig {
    pub interval_secs: f64,
    pub full_metrics_factor: usize,
}

impl Default for InternalMetricsConfig {
    fn default() -> Self {
        InternalMetricsConfig {
            interval_secs: 5.,
            full_metrics_factor: 12,
        }
    }
}

fn metric_with_labels(name: &str, labels: &[(&str, &str)]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(name.as_bytes());
    out.push(b'{');
    for (index, (label, value)) in labels.iter().enumerate() {
        if index > 0 {
            out.push(b',');
        }
        let _ = write!(out, "{label}=\"{value}\"");
    }
    // N.B. the space separating the metric from the value is included.
    out.extend_from_slice(b"} ");
    out
}

// Accumulates metric lines into buffers pulled from the queue, cutting a new
// buffer whenever the target size is reached.
struct Emitter<'a> {
    queue: &'a dyn BufferQueue,
    target_size: usize,
    ts_suffix: &'a [u8],
    buf: Option<Vec<u8>>,
    metrics_count: usize,
    queued_byte_count: usize,
}

impl<'a> Emitter<'a> {
    fn new(queue: &'a dyn BufferQueue, ts_suffix: &'a [u8], buf: Vec<u8>) -> Self {
        Emitter {
            target_size: queue.target_size(),
            queue,
            ts_suffix,
            buf: Some(buf),
            metrics_count: 0,
            queued_byte_count: 0,
        }
    }

    fn buf(&mut self) -> &mut Vec<u8> {
        if self.buf.is_none() {
            self.buf = Some(self.queue.get_buf());
        }
        #[allow(clippy::unwrap_used)]
        self.buf.as_mut().unwrap()
    }

    fn emit_u64(&mut self, metric: &[u8], value: u64) {
        let ts_suffix = self.ts_suffix;
        let buf = self.buf();
        buf.extend_from_slice(metric);
        let _ = write!(buf, "{value}");
        buf.extend_from_slice(ts_suffix);
        self.metrics_count += 1;
    }

    fn emit_f64(&mut self, metric: &[u8], value: f64, precision: usize) {
        let ts_suffix = self.ts_suffix;
        let buf = self.buf();
        buf.extend_from_slice(metric);
        let _ = write!(buf, "{:.*}", precision, value);
        buf.extend_from_slice(ts_suffix);
        self.metrics_count += 1;
    }

    /// For metrics carrying their value in the cached prefix (e.g. `... 1`).
    fn emit_const(&mut self, metric: &[u8]) {
        let ts_suffix = self.ts_suffix;
        let buf = self.buf();
        buf.extend_from_slice(metric);
        buf.extend_from_slice(ts_suffix);
        self.metrics_count += 1;
    }

    async fn cut_if_full(&mut self) {
        let full = self
            .buf
            .as_ref()
            .map(|buf| self.target_size > 0 && buf.len() >= self.target_size)
            .unwrap_or(false);
        if full {
            if let Some(buf) = self.buf.take() {
                self.queued_byte_count += buf.len();
                self.queue.queue_buf(buf).await;
            }
        }
    }
}

#[derive(Default)]
struct SchedulerInternalMetrics {
    snaps: [SchedulerStats; 2],
    curr_index: usize,
    cache: HashMap<String, TaskMetricsCache>,
}

struct TaskMetricsCache {
    scheduled: Vec<u8>,
    delayed: Vec<u8>,
    overrun: Vec<u8>,
    executed: Vec<u8>,
    next_ts_hack: Vec<u8>,
    avg_runtime: Vec<u8>,
}

impl SchedulerInternalMetrics {
    fn snap(&mut self, scheduler: &Scheduler) {
        scheduler.snap_stats(&mut self.snaps[self.curr_index]);
    }

    async fn generate(&mut self, emitter: &mut Emitter<'_>, instance: &str, hostname: &str) {
        let (curr, prev) = split_snaps(&self.snaps, self.curr_index);
        for (task_id, curr_stats) in curr {
            let cache = self.cache.entry(task_id.clone()).or_insert_with(|| {
                let labels = [
                    (INSTANCE_LABEL_NAME, instance),
                    (HOSTNAME_LABEL_NAME, hostname),
                    (GENERATOR_ID_LABEL_NAME, task_id.as_str()),
                ];
                TaskMetricsCache {
                    scheduled: metric_with_labels(TASK_STATS_SCHEDULED_DELTA_METRIC, &labels),
                    delayed: metric_with_labels(TASK_STATS_DELAYED_DELTA_METRIC, &labels),
                    overrun: metric_with_labels(TASK_STATS_OVERRUN_DELTA_METRIC, &labels),
                    executed: metric_with_labels(TASK_STATS_EXECUTED_DELTA_METRIC, &labels),
                    next_ts_hack: metric_with_labels(TASK_STATS_NEXT_TS_HACK_DELTA_METRIC, &labels),
                    avg_runtime: metric_with_labels(TASK_STATS_AVG_RUNTIME_METRIC, &labels),
                }
            });
            let prev_stats = prev.and_then(|prev| prev.get(task_id));
            let delta = |curr_val: u64, prev_val: u64| curr_val.wrapping_sub(prev_val);
            let prev_or_zero = prev_stats.cloned().unwrap_or_default();

            emitter.emit_u64(
                &cache.scheduled,
                delta(curr_stats.scheduled_count, prev_or_zero.scheduled_count),
            );
            emitter.emit_u64(
                &cache.delayed,
                delta(curr_stats.delayed_count, prev_or_zero.delayed_count),
            );
            emitter.emit_u64(
                &cache.overrun,
                delta(curr_stats.overrun_count, prev_or_zero.overrun_count),
            );
            let executed = delta(curr_stats.executed_count, prev_or_zero.executed_count);
            emitter.emit_u64(&cache.executed, executed);
            emitter.emit_u64(
                &cache.next_ts_hack,
                delta(
                    curr_stats.deadline_hack_count,
                    prev_or_zero.deadline_hack_count,
                ),
            );
            if executed > 0 {
                let runtime = delta(
                    curr_stats.total_runtime_usec,
                    prev_or_zero.total_runtime_usec,
                );
                emitter.emit_f64(
                    &cache.avg_runtime,
                    runtime as f64 / 1_000_000. / executed as f64,
                    TASK_STATS_AVG_RUNTIME_METRIC_PRECISION,
                );
            }
            emitter.cut_if_full().await;
        }
        self.curr_index = 1 - self.curr_index;
    }
}

#[derive(Default)]
struct CompressorPoolInternalMetrics {
    snaps: [CompressorPoolStats; 2],
    curr_index: usize,
    cache: Vec<CompressorMetricsCache>,
}

struct CompressorMetricsCache {
    read: Vec<u8>,
    read_bytes: Vec<u8>,
    send: Vec<u8>,
    send_bytes: Vec<u8>,
    timeout_flush: Vec<u8>,
    send_errors: Vec<u8>,
    write_errors: Vec<u8>,
    compression_factor: Vec<u8>,
}

impl CompressorPoolInternalMetrics {
    fn snap(&mut self, pool: &CompressorPool) {
        pool.snap_stats(&mut self.snaps[self.curr_index]);
    }

    async fn generate(&mut self, emitter: &mut Emitter<'_>, instance: &str, hostname: &str) {
        let curr_index = self.curr_index;
        let prev_has_data = !self.snaps[1 - curr_index].is_empty();
        for compressor in 0..self.snaps[curr_index].len() {
            if self.cache.len() <= compressor {
                let compressor_id = compressor.to_string();
                let labels = [
                    (INSTANCE_LABEL_NAME, instance),
                    (HOSTNAME_LABEL_NAME, hostname),
                    (COMPRESSOR_ID_LABEL_NAME, compressor_id.as_str()),
                ];
                self.cache.push(CompressorMetricsCache {
                    read: metric_with_labels(COMPRESSOR_STATS_READ_DELTA_METRIC, &labels),
                    read_bytes: metric_with_labels(
                        COMPRESSOR_STATS_READ_BYTE_DELTA_METRIC,
                        &labels,
                    ),
                    send: metric_with_labels(COMPRESSOR_STATS_SEND_DELTA_METRIC, &labels),
                    send_bytes: metric_with_labels(
                        COMPRESSOR_STATS_SEND_BYTE_DELTA_METRIC,
                        &labels,
                    ),
                    timeout_flush: metric_with_labels(
                        COMPRESSOR_STATS_TIMEOUT_FLUSH_DELTA_METRIC,
                        &labels,
                    ),
                    send_errors: metric_with_labels(
                        COMPRESSOR_STATS_SEND_ERROR_DELTA_METRIC,
                        &labels,
                    ),
                    write_errors: metric_with_labels(
                        COMPRESSOR_STATS_WRITE_ERROR_DELTA_METRIC,
                        &labels,
                    ),
                    compression_factor: metric_with_labels(
                        COMPRESSOR_STATS_COMPRESSION_FACTOR_METRIC,
                        &labels,
                    ),
                });
            }
            let cache = &self.cache[compressor];
            let curr = self.snaps[curr_index][compressor].clone();
            let prev = if prev_has_data {
                self.snaps[1 - curr_index][compressor].clone()
            } else {
                Default::default()
            };

            emitter.emit_u64(&cache.read, curr.read_count.wrapping_sub(prev.read_count));
            emitter.emit_u64(
                &cache.read_bytes,
                curr.read_byte_count.wrapping_sub(prev.read_byte_count),
            );
            emitter.emit_u64(&cache.send, curr.send_count.wrapping_sub(prev.send_count));
            emitter.emit_u64(
                &cache.send_bytes,
                curr.send_byte_count.wrapping_sub(prev.send_byte_count),
            );
            emitter.emit_u64(
                &cache.timeout_flush,
                curr.timeout_flush_count
                    .wrapping_sub(prev.timeout_flush_count),
            );
            emitter.emit_u64(
                &cache.send_errors,
                curr.send_error_count.wrapping_sub(prev.send_error_count),
            );
            emitter.emit_u64(
                &cache.write_errors,
                curr.write_error_count.wrapping_sub(prev.write_error_count),
            );
            emitter.emit_f64(
                &cache.compression_factor,
                curr.compression_factor,
                COMPRESSION_FACTOR_METRIC_PRECISION,
            );
            emitter.cut_if_full().await;
        }
        self.curr_index = 1 - self.curr_index;
    }
}

#[derive(Default)]
struct HttpEndpointPoolInternalMetrics {
    snaps: [HttpEndpointPoolStats; 2],
    curr_index: usize,
    endpoint_cache: HashMap<String, EndpointMetricsCache>,
    pool_cache: Option<PoolMetricsCache>,
}

struct EndpointMetricsCache {
    send_buffer: Vec<u8>,
    send_buffer_bytes: Vec<u8>,
    send_buffer_errors: Vec<u8>,
    health_checks: Vec<u8>,
    health_check_errors: Vec<u8>,
}

struct PoolMetricsCache {
    healthy_rotates: Vec<u8>,
    no_healthy_ep_errors: Vec<u8>,
}

impl HttpEndpointPoolInternalMetrics {
    fn snap(&mut self, pool: &HttpEndpointPool) {
        pool.snap_stats(&mut self.snaps[self.curr_index]);
    }

    async fn generate(&mut self, emitter: &mut Emitter<'_>, instance: &str, hostname: &str) {
        let (curr, prev) = {
            let [first, second] = &self.snaps;
            if self.curr_index == 0 {
                (first, second)
            } else {
                (second, first)
            }
        };
        for (url, curr_stats) in &curr.endpoints {
            let cache = self.endpoint_cache.entry(url.clone()).or_insert_with(|| {
                let labels = [
                    (INSTANCE_LABEL_NAME, instance),
                    (HOSTNAME_LABEL_NAME, hostname),
                    (HTTP_ENDPOINT_URL_LABEL_NAME, url.as_str()),
                ];
                EndpointMetricsCache {
                    send_buffer: metric_with_labels(
                        HTTP_ENDPOINT_STATS_SEND_BUFFER_DELTA_METRIC,
                        &labels,
                    ),
                    send_buffer_bytes: metric_with_labels(
                        HTTP_ENDPOINT_STATS_SEND_BUFFER_BYTE_DELTA_METRIC,
                        &labels,
                    ),
                    send_buffer_errors: metric_with_labels(
                        HTTP_ENDPOINT_STATS_SEND_BUFFER_ERROR_DELTA_METRIC,
                        &labels,
                    ),
                    health_checks: metric_with_labels(
                        HTTP_ENDPOINT_STATS_HEALTH_CHECK_DELTA_METRIC,
                        &labels,
                    ),
                    health_check_errors: metric_with_labels(
                        HTTP_ENDPOINT_STATS_HEALTH_CHECK_ERROR_DELTA_METRIC,
                        &labels,
                    ),
                }
            });
            let prev_stats = prev.endpoints.get(url).cloned().unwrap_or_default();
            emitter.emit_u64(
                &cache.send_buffer,
                curr_stats
                    .send_buffer_count
                    .wrapping_sub(prev_stats.send_buffer_count),
            );
            emitter.emit_u64(
                &cache.send_buffer_bytes,
                curr_stats
                    .send_buffer_byte_count
                    .wrapping_sub(prev_stats.send_buffer_byte_count),
            );
            emitter.emit_u64(
                &cache.send_buffer_errors,
                curr_stats
                    .send_buffer_error_count
                    .wrapping_sub(prev_stats.send_buffer_error_count),
            );
            emitter.emit_u64(
                &cache.health_checks,
                curr_stats
                    .health_check_count
                    .wrapping_sub(prev_stats.health_check_count),
            );
            emitter.emit_u64(
                &cache.health_check_errors,
                curr_stats
                    .health_check_error_count
                    .wrapping_sub(prev_stats.health_check_error_count),
            );
            emitter.cut_if_full().await;
        }

        let pool_cache = self.pool_cache.get_or_insert_with(|| {
            let labels = [
                (INSTANCE_LABEL_NAME, instance),
                (HOSTNAME_LABEL_NAME, hostname),
            ];
            PoolMetricsCache {
                healthy_rotates: metric_with_labels(
                    HTTP_ENDPOINT_POOL_STATS_HEALTHY_ROTATE_DELTA_METRIC,
                    &labels,
                ),
                no_healthy_ep_errors: metric_with_labels(
                    HTTP_ENDPOINT_POOL_STATS_NO_HEALTHY_EP_ERROR_DELTA_METRIC,
                    &labels,
                ),
            }
        });
        emitter.emit_u64(
            &pool_cache.healthy_rotates,
            curr.pool
                .healthy_rotate_count
                .wrapping_sub(prev.pool.healthy_rotate_count),
        );
        emitter.emit_u64(
            &pool_cache.no_healthy_ep_errors,
            curr.pool
                .no_healthy_ep_error_count
                .wrapping_sub(prev.pool.no_healthy_ep_error_count),
        );
        emitter.cut_if_full().await;

        self.curr_index = 1 - self.curr_index;
    }
}

#[derive(Default)]
struct GeneratorInternalMetrics {
    snaps: [GeneratorStatsMap; 2],
    curr_index: usize,
    cache: HashMap<String, GeneratorMetricsCache>,
}

struct GeneratorMetricsCache {
    invocations: Vec<u8>,
    metrics: Vec<u8>,
    bytes: Vec<u8>,
}

impl GeneratorInternalMetrics {
    fn snap(&mut self, container: &GeneratorStatsContainer) {
        container.snap(&mut self.snaps[self.curr_index]);
    }

    fn cache_for(
        cache: &mut HashMap<String, GeneratorMetricsCache>,
        generator_id: &str,
        instance: &str,
        hostname: &str,
    ) -> GeneratorMetricsCache {
        let entry = cache.entry(generator_id.to_string()).or_insert_with(|| {
            let labels = [
                (INSTANCE_LABEL_NAME, instance),
                (HOSTNAME_LABEL_NAME, hostname),
                (GENERATOR_ID_LABEL_NAME, generator_id),
            ];
            GeneratorMetricsCache {
                invocations: metric_with_labels(
                    METRICS_GENERATOR_INVOCATION_DELTA_METRIC,
                    &labels,
                ),
                metrics: metric_with_labels(METRICS_GENERATOR_METRICS_DELTA_METRIC, &labels),
                bytes: metric_with_labels(METRICS_GENERATOR_BYTE_DELTA_METRIC, &labels),
            }
        });
        GeneratorMetricsCache {
            invocations: entry.invocations.clone(),
            metrics: entry.metrics.clone(),
            bytes: entry.bytes.clone(),
        }
    }

    async fn generate(&mut self, emitter: &mut Emitter<'_>, instance: &str, hostname: &str) {
        let curr_index = self.curr_index;
        let generator_ids: Vec<String> = self.snaps[curr_index].keys().cloned().collect();
        for generator_id in generator_ids {
            let cache = Self::cache_for(&mut self.cache, &generator_id, instance, hostname);
            let curr = self.snaps[curr_index][&generator_id];
            let prev = self.snaps[1 - curr_index]
                .get(&generator_id)
                .copied()
                .unwrap_or_default();
            emitter.emit_u64(
                &cache.invocations,
                curr.invocation_count.wrapping_sub(prev.invocation_count),
            );
            emitter.emit_u64(
                &cache.metrics,
                curr.metrics_count.wrapping_sub(prev.metrics_count),
            );
            emitter.emit_u64(&cache.bytes, curr.byte_count.wrapping_sub(prev.byte_count));
            emitter.cut_if_full().await;
        }
        self.curr_index = 1 - self.curr_index;
    }
}

fn split_snaps<'a>(
    snaps: &'a [SchedulerStats; 2],
    curr_index: usize,
) -> (&'a SchedulerStats, Option<&'a SchedulerStats>) {
    let curr = &snaps[curr_index];
    let prev = &snaps[1 - curr_index];
    (curr, (!prev.is_empty()).then_some(prev))
}

pub struct InternalMetrics {
    base: GeneratorBase,
    scheduler: Arc<Scheduler>,
    compressor_pool: Option<Arc<CompressorPool>>,
    endpoint_pool: Option<Arc<HttpEndpointPool>>,
    generator_stats: Arc<GeneratorStatsContainer>,
    scheduler_metrics: SchedulerInternalMetrics,
    compressor_metrics: CompressorPoolInternalMetrics,
    endpoint_metrics: HttpEndpointPoolInternalMetrics,
    generator_metrics: GeneratorInternalMetrics,
    uptime_metric: Vec<u8>,
    buildinfo_metric: Vec<u8>,
    start_ts: SystemTime,
    first_pass: bool,
}

impl InternalMetrics {
    pub fn new(
        ctx: &VmiContext,
        cfg: &InternalMetricsConfig,
        scheduler: Arc<Scheduler>,
        compressor_pool: Option<Arc<CompressorPool>>,
        endpoint_pool: Option<Arc<HttpEndpointPool>>,
    ) -> Self {
        let base = GeneratorBase::new(
            ctx,
            INTERNAL_METRICS_ID,
            Duration::from_secs_f64(cfg.interval_secs.max(0.)),
            cfg.full_metrics_factor,
        );
        let uptime_metric = metric_with_labels(
            VMI_UPTIME_METRIC,
            &[
                (INSTANCE_LABEL_NAME, ctx.instance.as_str()),
                (HOSTNAME_LABEL_NAME, ctx.hostname.as_str()),
            ],
        );
        // Value included:
        let mut buildinfo_metric = metric_with_labels(
            VMI_BUILDINFO_METRIC,
            &[
                (INSTANCE_LABEL_NAME, ctx.instance.as_str()),
                (HOSTNAME_LABEL_NAME, ctx.hostname.as_str()),
                (VMI_VERSION_LABEL_NAME, ctx.version.as_str()),
                (VMI_GIT_INFO_LABEL_NAME, ctx.git_info.as_str()),
            ],
        );
        buildinfo_metric.push(b'1');
        info!(
            id = INTERNAL_METRICS_ID,
            interval_secs = cfg.interval_secs,
            full_metrics_factor = cfg.full_metrics_factor,
            "internal metrics"
        );
        InternalMetrics {
            base,
            scheduler,
            compressor_pool,
            endpoint_pool,
            generator_stats: Arc::clone(&ctx.generator_stats),
            scheduler_metrics: SchedulerInternalMetrics::default(),
            compressor_metrics: CompressorPoolInternalMetrics::default(),
            endpoint_metrics: HttpEndpointPoolInternalMetrics::default(),
            generator_metrics: GeneratorInternalMetrics::default(),
            uptime_metric,
            buildinfo_metric,
            start_ts: SystemTime::now(),
            first_pass: true,
        }
    }
}

#[async_trait]
impl MetricsGenerator for InternalMetrics {
    fn id(&self) -> &str {
        &self.base.id
    }

    fn interval(&self) -> Duration {
        self.base.interval
    }

    async fn generate(&mut self) -> bool {
        // Collect stats from the various sources:
        self.scheduler_metrics.snap(&self.scheduler);
        if let Some(pool) = &self.compressor_pool {
            self.compressor_metrics.snap(pool);
        }
        if let Some(pool) = &self.endpoint_pool {
            self.endpoint_metrics.snap(pool);
        }
        self.generator_metrics.snap(&self.generator_stats);

        // Timestamp when all stats were collected:
        let ts = self.base.now();
        let queue = Arc::clone(&self.base.metrics_queue);
        let mut buf = queue.get_buf();
        // Always start with the base metrics; this also refreshes the
        // timestamp suffix:
        let (mut metrics_count, _) = self.base.metrics_start(&mut buf, ts);

        let instance = self.base.instance.clone();
        let hostname = self.base.hostname.clone();
        let ts_suffix = self.base.ts_suffix().to_vec();
        let mut emitter = Emitter::new(queue.as_ref(), &ts_suffix, buf);

        self.scheduler_metrics
            .generate(&mut emitter, &instance, &hostname)
            .await;
        self.generator_metrics
            .generate(&mut emitter, &instance, &hostname)
            .await;
        if self.compressor_pool.is_some() {
            self.compressor_metrics
                .generate(&mut emitter, &instance, &hostname)
                .await;
        }
        if self.endpoint_pool.is_some() {
            self.endpoint_metrics
                .generate(&mut emitter, &instance, &hostname)
                .await;
        }

        let uptime = ts
            .duration_since(self.start_ts)
            .unwrap_or_default()
            .as_secs_f64();
        emitter.emit_f64(&self.uptime_metric, uptime, UPTIME_METRIC_PRECISION);
        if self.first_pass || self.base.cycle_num == 0 {
            emitter.emit_const(&self.buildinfo_metric);
        }

        // This generator's own stats are written by hand: it is the one
        // producing such metrics, so it cannot observe itself through the
        // shared container within this pass.
        let own_cache = GeneratorInternalMetrics::cache_for(
            &mut self.generator_metrics.cache,
            INTERNAL_METRICS_ID,
            &instance,
            &hostname,
        );
        metrics_count += emitter.metrics_count + 3;
        emitter.emit_u64(&own_cache.invocations, 1);
        {
            let ts_suffix_len = ts_suffix.len();
            let queued_byte_count = emitter.queued_byte_count;
            let buf = emitter.buf();
            buf.extend_from_slice(&own_cache.metrics);
            let _ = write!(buf, "{metrics_count}");
            buf.extend_from_slice(&ts_suffix);

            buf.extend_from_slice(&own_cache.bytes);
            // The byte count must include the digits of its own
            // representation: start with one digit and widen until the
            // total fits.
            let mut byte_count = queued_byte_count + buf.len() + ts_suffix_len + 1;
            let mut pow10 = 1usize;
            loop {
                pow10 *= 10;
                if byte_count < pow10 {
                    break;
                }
                byte_count += 1;
            }
            let _ = write!(buf, "{byte_count}");
            buf.extend_from_slice(&ts_suffix);
        }

        let queued_byte_count = emitter.queued_byte_count;
        let final_buf = emitter.buf.take();
        let mut total_bytes = queued_byte_count as u64;
        if let Some(final_buf) = final_buf {
            total_bytes += final_buf.len() as u64;
            queue.queue_buf(final_buf).await;
        }
        self.base.update_stats(metrics_count as u64, total_bytes);

        self.first_pass = false;
        self.base.advance_cycle();
        true
    }
}
