// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Support layer shared by metrics generators: the buffer-queue seam towards
//! the compressor pool, the base state embedded in every generator (cycle
//! counter, timestamp suffix, dtime self-metric) and the per-generator stats
//! container sampled by the internal-metrics task.

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

// Labels common to all metrics:
pub const INSTANCE_LABEL_NAME: &str = "vmi_inst";
pub const HOSTNAME_LABEL_NAME: &str = "hostname";
pub const GENERATOR_ID_LABEL_NAME: &str = "gen_id";

// Actual interval since the previous invocation of a generator. It should be
// close to the configured interval but may be longer if the generator is
// busy; dashboards use it to derive rates out of deltas.
pub const GENERATOR_DTIME_METRIC: &str = "vmi_metrics_gen_dtime_sec";
const GENERATOR_DTIME_METRIC_PRECISION: usize = 6;

/// The queue metrics generators write into. Buffers move by value: a buffer
/// pulled via `get_buf` has exactly one owner until it is queued or returned.
#[async_trait]
pub trait BufferQueue: Send + Sync {
    fn get_buf(&self) -> Vec<u8>;
    fn return_buf(&self, buf: Vec<u8>);
    async fn queue_buf(&self, buf: Vec<u8>);
    /// Batch target size; generators producing more than this per invocation
    /// should cut their output into multiple buffers.
    fn target_size(&self) -> usize;
}

/// A metrics generator, schedulable as a periodic task. Returning `false`
/// from [`MetricsGenerator::generate`] removes the task from rotation.
#[async_trait]
pub trait MetricsGenerator: Send {
    fn id(&self) -> &str;
    fn interval(&self) -> Duration;
    async fn generate(&mut self) -> bool;
}

/// Per-generator stats common to all generators, keyed by generator id.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GeneratorStats {
    pub invocation_count: u64,
    pub metrics_count: u64,
    pub byte_count: u64,
}

pub type GeneratorStatsMap = HashMap<String, GeneratorStats>;

#[derive(Default)]
pub struct GeneratorStatsContainer {
    stats: Mutex<GeneratorStatsMap>,
}

impl GeneratorStatsContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, generator_id: &str, metrics_count: u64, byte_count: u64) {
        #[allow(clippy::expect_used)]
        let mut stats = self.stats.lock().expect("lock poisoned");
        let entry = stats.entry(generator_id.to_string()).or_default();
        entry.invocation_count += 1;
        entry.metrics_count += metrics_count;
        entry.byte_count += byte_count;
    }

    /// Copy the current stats into `to`, preserving entries for generators
    /// not seen in this snapshot.
    pub fn snap(&self, to: &mut GeneratorStatsMap) {
        #[allow(clippy::expect_used)]
        let stats = self.stats.lock().expect("lock poisoned");
        for (id, gen_stats) in stats.iter() {
            to.insert(id.clone(), *gen_stats);
        }
    }

    pub fn clear(&self) {
        #[allow(clippy::expect_used)]
        self.stats.lock().expect("lock poisoned").clear();
    }
}

/// Process-wide context threaded through components: instance/hostname
/// labels, build info, the active metrics queue and the shared generator
/// stats. The runner owns one and dependency-injects it.
pub struct VmiContext {
    pub instance: String,
    pub hostname: String,
    pub version: String,
    pub git_info: String,
    pub metrics_queue: Arc<dyn BufferQueue>,
    pub generator_stats: Arc<GeneratorStatsContainer>,
    // Rotating seed for initial cycle numbers, so that generators sharing a
    // full-metrics factor do not all hit their full cycle at once.
    initial_cycle: AtomicUsize,
}

impl VmiContext {
    pub fn new(
        instance: impl Into<String>,
        hostname: impl Into<String>,
        version: impl Into<String>,
        git_info: impl Into<String>,
        metrics_queue: Arc<dyn BufferQueue>,
    ) -> Self {
        VmiContext {
            instance: instance.into(),
            hostname: hostname.into(),
            version: version.into(),
            git_info: git_info.into(),
            metrics_queue,
            generator_stats: Arc::new(GeneratorStatsContainer::new()),
            initial_cycle: AtomicUsize::new(0),
        }
    }

    /// Initial cycle number for a new generator with the given full-metrics
    /// factor; each call advances the rotation.
    pub fn initial_cycle_num(&self, full_metrics_factor: usize) -> usize {
        if full_metrics_factor <= 1 {
            return 0;
        }
        self.initial_cycle.fetch_add(1, Ordering::Relaxed) % full_metrics_factor
    }
}

pub fn unix_millis(ts: SystemTime) -> u64 {
    ts.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// State embedded in every metrics generator.
///
/// The emission protocol per invocation:
///  1. [`GeneratorBase::metrics_start`] with the output buffer and the scan
///     timestamp; this emits the dtime metric (from the second invocation
///     on) and rebuilds the timestamp suffix.
///  2. The generator writes its own metrics, terminating each with
///     [`GeneratorBase::ts_suffix`].
///  3. The generator reports `(metric_count, buf.len())` via
///     [`GeneratorBase::update_stats`].
///  4. The generator queues the buffer.
///  5. [`GeneratorBase::advance_cycle`].
pub struct GeneratorBase {
    pub id: String,
    pub interval: Duration,
    pub full_metrics_factor: usize,
    pub cycle_num: usize,
    pub instance: String,
    pub hostname: String,
    pub metrics_queue: Arc<dyn BufferQueue>,
    generator_stats: Arc<GeneratorStatsContainer>,
    last_ts: Option<SystemTime>,
    dtime_metric: Vec<u8>,
    ts_suffix: Vec<u8>,
    now_fn: fn() -> SystemTime,
}

impl GeneratorBase {
    pub fn new(
        ctx: &VmiContext,
        id: impl Into<String>,
        interval: Duration,
        full_metrics_factor: usize,
    ) -> Self {
        let id = id.into();
        let dtime_metric = format!(
            // N.B. space before value is included
            "{}{{{}=\"{}\",{}=\"{}\",{}=\"{}\"}} ",
            GENERATOR_DTIME_METRIC,
            INSTANCE_LABEL_NAME,
            ctx.instance,
            HOSTNAME_LABEL_NAME,
            ctx.hostname,
            GENERATOR_ID_LABEL_NAME,
            id
        )
        .into_bytes();
        GeneratorBase {
            cycle_num: ctx.initial_cycle_num(full_metrics_factor),
            instance: ctx.instance.clone(),
            hostname: ctx.hostname.clone(),
            metrics_queue: Arc::clone(&ctx.metrics_queue),
            generator_stats: Arc::clone(&ctx.generator_stats),
            id,
            interval,
            full_metrics_factor,
            last_ts: None,
            dtime_metric,
            ts_suffix: Vec::new(),
            now_fn: SystemTime::now,
        }
    }

    /// Test hook: replace the time source.
    pub fn set_now_fn(&mut self, now_fn: fn() -> SystemTime) {
        self.now_fn = now_fn;
    }

    pub fn now(&self) -> SystemTime {
        (self.now_fn)()
    }

    /// Start a metrics generation run: rebuild the timestamp suffix for `ts`
    /// and, if there was a previous run, emit the dtime metric into `buf`.
    /// Returns the number of metrics written and the previous timestamp.
    pub fn metrics_start(
        &mut self,
        buf: &mut Vec<u8>,
        ts: SystemTime,
    ) -> (usize, Option<SystemTime>) {
        let valid_prev = !self.ts_suffix.is_empty();
        self.ts_suffix.clear();
        // N.B. the leading space and the ending `\n` are included.
        let _ = write!(self.ts_suffix, " {}\n", unix_millis(ts));

        let mut metrics_count = 0;
        let last_ts = self.last_ts;
        if valid_prev {
            if let Some(last) = last_ts {
                let dtime = ts.duration_since(last).unwrap_or_default().as_secs_f64();
                buf.extend_from_slice(&self.dtime_metric);
                let _ = write!(buf, "{:.*}", GENERATOR_DTIME_METRIC_PRECISION, dtime);
                buf.extend_from_slice(&self.ts_suffix);
                metrics_count += 1;
            }
        }
        self.last_ts = Some(ts);
        (metrics_count, last_ts)
    }

    /// The ` <unix_millis>\n` suffix established by the latest
    /// [`GeneratorBase::metrics_start`].
    pub fn ts_suffix(&self) -> &[u8] {
        &self.ts_suffix
    }

    pub fn update_stats(&self, metrics_count: u64, byte_count: u64) {
        self.generator_stats
            .update(&self.id, metrics_count, byte_count);
    }

    /// Advance the cycle number modulo the full-metrics factor. With a
    /// factor of 0 or 1 the cycle stays 0, i.e. every cycle is a full one.
    pub fn advance_cycle(&mut self) {
        self.cycle_num += 1;
        if self.cycle_num >= self.full_metrics_factor {
            self.cycle_num = 0;
        }
    }
}
