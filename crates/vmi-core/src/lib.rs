// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Framework core for building high-frequency metrics importers that push
//! Prometheus-exposition time series to remote ingestion endpoints (e.g.
//! VictoriaMetrics).
//!
//! The core is a four-stage concurrent pipeline:
//!
//! 1. A deadline-driven periodic [`scheduler`] dispatching metrics-generation
//!    tasks to a worker pool.
//! 2. A [`compressor_pool`] consolidating generator output buffers into
//!    gzip-compressed batches.
//! 3. An [`http_endpoint_pool`] with health management, round-robin rotation,
//!    retry across endpoints and token-bucket rate limiting.
//! 4. A [`generator`] support layer providing partial/full-cycle delta
//!    emission and dual-buffer state.
//!
//! Data flows scheduler -> worker -> generator -> buffer -> compressor ->
//! gzip batch -> endpoint pool -> URL; control flows top-down by time and
//! bottom-up by backpressure on the bounded queues in between.

pub mod buf_pool;
pub mod compressor_pool;
pub mod config;
pub mod generator;
pub mod http_endpoint_pool;
pub mod internal_metrics;
pub mod rate_limit;
pub mod runner;
pub mod scheduler;
pub mod stdout_queue;
pub mod testutils;

pub use buf_pool::BufferPool;
pub use compressor_pool::{BatchSender, CompressorPool, CompressorPoolConfig};
pub use config::{load_config, LoggerConfig, VmiConfig};
pub use generator::{
    BufferQueue, GeneratorBase, GeneratorStatsContainer, MetricsGenerator, VmiContext,
};
pub use http_endpoint_pool::{
    HttpClientDoer, HttpEndpointConfig, HttpEndpointPool, HttpEndpointPoolConfig, SendBufferError,
};
pub use rate_limit::{CreditReader, RateLimiter};
pub use runner::{run, GeneratorBuildError, RunnerSpec, TaskBuilderFn};
pub use scheduler::{Scheduler, SchedulerConfig, Task, TaskAction};
