// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The runner is the main entry point for an importer instance.
//!
//! It loads the configuration, applies command line overrides, sets up
//! logging, wires endpoint pool -> compressor pool -> scheduler, invokes the
//! registered task builders with the generators configuration, adds the
//! resulting tasks plus the internal-metrics task to the scheduler and
//! blocks on SIGINT/SIGTERM. On signal the components are shut down in
//! reverse construction order under the configured budget; if the budget
//! elapses, the process is terminated forcibly.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::compressor_pool::CompressorPool;
use crate::config::{load_config, LoggerConfig, VmiConfig};
use crate::generator::{BufferQueue, MetricsGenerator, VmiContext};
use crate::http_endpoint_pool::HttpEndpointPool;
use crate::internal_metrics::InternalMetrics;
use crate::scheduler::{Scheduler, Task};
use crate::stdout_queue::StdoutMetricsQueue;

/// Exit code for a shutdown that exceeded its budget (or a zero budget).
const FORCED_SHUTDOWN_EXIT_CODE: i32 = 2;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct GeneratorBuildError(pub String);

/// Builds the metrics generators for one family out of the deserialized
/// `generators` config section.
pub type TaskBuilderFn<G> =
    fn(&Arc<VmiContext>, &G) -> Result<Vec<Box<dyn MetricsGenerator>>, GeneratorBuildError>;

/// Everything an importer binary contributes to the runner.
pub struct RunnerSpec<G> {
    /// Default instance name, also the stem of the default config file name
    /// (`<instance>-config.yaml`).
    pub instance_default: &'static str,
    pub version: &'static str,
    pub git_info: &'static str,
    pub task_builders: Vec<TaskBuilderFn<G>>,
}

#[derive(Debug, Parser)]
#[command(disable_version_flag = true)]
struct CliArgs {
    /// Print the version and exit.
    #[arg(long)]
    version: bool,

    /// Config file to load.
    #[arg(long)]
    config: Option<String>,

    /// Override the value returned by the hostname syscall.
    #[arg(long)]
    hostname: Option<String>,

    /// Override the vmi_config.instance config setting.
    #[arg(long)]
    instance: Option<String>,

    /// Override the vmi_config.http_endpoint_pool_config.endpoints config
    /// setting with a comma-separated URL list.
    #[arg(long)]
    http_pool_endpoints: Option<String>,

    /// Print metrics to stdout instead of sending to import endpoints.
    #[arg(long)]
    use_stdout_metrics_queue: bool,

    /// Override the vmi_config.log_config.level config setting.
    #[arg(long)]
    log_level: Option<String>,
}

fn init_logging(cfg: &LoggerConfig) -> Result<(), String> {
    let filter = EnvFilter::try_new(format!("h2=off,hyper=off,rustls=off,{}", cfg.level))
        .map_err(|e| format!("could not parse log level {:?}: {e}", cfg.level))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| e.to_string())
}

/// The hostname as reported by the OS.
fn os_hostname() -> Result<String, String> {
    if let Ok(hostname) = std::env::var("HOSTNAME") {
        if !hostname.trim().is_empty() {
            return Ok(hostname.trim().to_string());
        }
    }
    for path in ["/proc/sys/kernel/hostname", "/etc/hostname"] {
        if let Ok(content) = std::fs::read_to_string(path) {
            let content = content.trim();
            if !content.is_empty() {
                return Ok(content.to_string());
            }
        }
    }
    Err("unable to determine the hostname".to_string())
}

fn resolve_hostname(arg: Option<&str>, use_short_hostname: bool) -> Result<String, String> {
    // A hostname given on the command line is used as-is:
    if let Some(hostname) = arg {
        return Ok(hostname.to_string());
    }
    let mut hostname = os_hostname()?;
    if use_short_hostname {
        if let Some(dot) = hostname.find('.') {
            if dot > 0 {
                hostname.truncate(dot);
            }
        }
    }
    Ok(hostname)
}

async fn wait_for_shutdown_signal() -> &'static str {
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(sigterm) => sigterm,
        Err(err) => {
            error!("cannot install SIGTERM handler: {err}");
            let _ = tokio::signal::ctrl_c().await;
            return "SIGINT";
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    }
}

/// Run an importer to completion. Returns the process exit code: 0 for a
/// clean run, 1 for an initialization error; a shutdown overrunning its
/// budget force-exits the process with a non-zero code instead of returning.
pub async fn run<G: DeserializeOwned + Default>(spec: RunnerSpec<G>) -> i32 {
    let args = CliArgs::parse();

    if args.version {
        eprintln!("Version: {}, GitInfo: {}", spec.version, spec.git_info);
        return 0;
    }

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| format!("{}-config.yaml", spec.instance_default));
    let (mut vmi_config, generators_config): (VmiConfig, Option<G>) =
        match load_config(&config_path) {
            Ok(loaded) => loaded,
            Err(err) => {
                eprintln!("Error loading config file: {err}");
                return 1;
            }
        };
    let generators_config = generators_config.unwrap_or_default();

    // Command line overrides:
    if let Some(instance) = &args.instance {
        vmi_config.instance = instance.clone();
    }
    if let Some(endpoints) = &args.http_pool_endpoints {
        vmi_config
            .http_endpoint_pool_config
            .override_endpoints(endpoints);
    }
    if let Some(level) = &args.log_level {
        vmi_config.log_config.level = level.clone();
    }

    if let Err(err) = init_logging(&vmi_config.log_config) {
        eprintln!("Error setting the logger: {err}");
        return 1;
    }

    let hostname = match resolve_hostname(args.hostname.as_deref(), vmi_config.use_short_hostname)
    {
        Ok(hostname) => hostname,
        Err(err) => {
            error!("{err}");
            return 1;
        }
    };

    // Metrics queue: the real compressor -> endpoint pool chain, or the
    // stdout substitute.
    let mut endpoint_pool: Option<Arc<HttpEndpointPool>> = None;
    let mut compressor_pool: Option<Arc<CompressorPool>> = None;
    let metrics_queue: Arc<dyn BufferQueue> = if args.use_stdout_metrics_queue {
        Arc::new(StdoutMetricsQueue::new(&vmi_config.compressor_pool_config))
    } else {
        let pool = match HttpEndpointPool::new(&vmi_config.http_endpoint_pool_config) {
            Ok(pool) => pool,
            Err(err) => {
                error!("{err}");
                return 1;
            }
        };
        let compressors = match CompressorPool::new(&vmi_config.compressor_pool_config) {
            Ok(compressors) => Arc::new(compressors),
            Err(err) => {
                error!("{err}");
                return 1;
            }
        };
        compressors.start(Arc::clone(&pool) as Arc<dyn crate::compressor_pool::BatchSender>);
        endpoint_pool = Some(pool);
        compressor_pool = Some(Arc::clone(&compressors));
        compressors
    };

    let scheduler = Arc::new(Scheduler::new(&vmi_config.scheduler_config));
    scheduler.start();

    let ctx = Arc::new(VmiContext::new(
        vmi_config.instance.clone(),
        hostname,
        spec.version,
        spec.git_info,
        Arc::clone(&metrics_queue),
    ));

    // Initialize the metrics generators:
    let mut generators: Vec<Box<dyn MetricsGenerator>> = Vec::new();
    for task_builder in &spec.task_builders {
        match task_builder(&ctx, &generators_config) {
            Ok(mut generator_tasks) => generators.append(&mut generator_tasks),
            Err(err) => {
                error!("{err}");
                return 1;
            }
        }
    }
    // Plus the internal metrics:
    if vmi_config.internal_metrics_config.interval_secs > 0. {
        generators.push(Box::new(InternalMetrics::new(
            &ctx,
            &vmi_config.internal_metrics_config,
            Arc::clone(&scheduler),
            compressor_pool.clone(),
            endpoint_pool.clone(),
        )));
    } else {
        info!(
            interval_secs = vmi_config.internal_metrics_config.interval_secs,
            "internal metrics disabled"
        );
    }

    for generator in generators {
        if let Err(err) = scheduler.add_task(Task::from_generator(generator)).await {
            error!("{err}");
            return 1;
        }
    }

    // Log instance and hostname, useful for dashboard variable selection:
    info!(
        instance = %ctx.instance,
        hostname = %ctx.hostname,
        "importer running"
    );

    let signal = wait_for_shutdown_signal().await;
    let budget_secs = vmi_config.shutdown_max_wait_secs;
    if budget_secs == 0. {
        error!("{signal} signal received, force exit");
        return FORCED_SHUTDOWN_EXIT_CODE;
    }
    warn!("{signal} signal received, shutting down");

    if budget_secs > 0. {
        // Watchdog: if the graceful path below stalls past the budget, the
        // process is terminated forcibly.
        let budget = Duration::from_secs_f64(budget_secs);
        tokio::spawn(async move {
            tokio::time::sleep(budget).await;
            error!("shutdown timed out after {budget:?}, force exit");
            std::process::exit(FORCED_SHUTDOWN_EXIT_CODE);
        });
    }

    // Reverse construction order:
    scheduler.shutdown().await;
    if let Some(compressors) = &compressor_pool {
        compressors.shutdown().await;
    }
    if let Some(pool) = &endpoint_pool {
        // May run into the budget if all endpoints are down.
        pool.shutdown().await;
    }
    0
}
