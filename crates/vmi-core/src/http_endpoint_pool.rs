// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pool of HTTP import endpoints with health management.
//!
//! The usable endpoints sit on the healthy list and its head is the one
//! currently used for requests. On a transport error the endpoint is moved
//! to the back of the list; once its consecutive error count reaches the
//! unhealthy threshold it is taken off the list and probed periodically with
//! a test request until it responds, at which point it rejoins the tail.
//!
//! To balance use across endpoints the healthy list is rotated so that each
//! endpoint eventually reaches the head. Rotation can run on every
//! selection, on a timer, or not at all.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use bytes::Bytes;
use rand::seq::SliceRandom;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::rate_limit::{CreditReader, RateLimiter, CREDIT_READER_MIN_CREDIT_DEFAULT};

pub const HTTP_ENDPOINT_URL_DEFAULT: &str = "http://localhost:8428/api/v1/import/prometheus";
const MARK_UNHEALTHY_THRESHOLD_DEFAULT: u32 = 1;

const HEALTH_CHECK_MIN_INTERVAL: Duration = Duration::from_secs(1);
const HEALTHY_POLL_INTERVAL: Duration = Duration::from_millis(500);
const HEALTH_CHECK_ERR_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// HTTP codes that denote success.
const SUCCESS_STATUS_CODES: &[StatusCode] = &[StatusCode::OK, StatusCode::NO_CONTENT];

/// HTTP codes worth retrying on another endpoint. Empty, so any non-success
/// response aborts the send; transport errors are always retried.
const RETRY_STATUS_CODES: &[StatusCode] = &[];

fn is_success(status: StatusCode) -> bool {
    SUCCESS_STATUS_CODES.contains(&status)
}

fn is_retryable(status: StatusCode) -> bool {
    RETRY_STATUS_CODES.contains(&status)
}

#[derive(Debug, Error)]
pub enum SendBufferError {
    #[error("no healthy HTTP endpoint available")]
    NoHealthyEndpoint,
    #[error("PUT {url}: status {status}")]
    NonRetryableStatus { url: String, status: StatusCode },
}

#[derive(Debug, Error)]
pub enum HttpEndpointPoolError {
    #[error("invalid endpoint URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("rate_limit_mbps: {0}")]
    RateSpec(#[from] crate::rate_limit::RateSpecError),
    #[error("password file {path:?}: {reason}")]
    PasswordFile { path: String, reason: String },
    #[error("invalid authorization credentials")]
    InvalidCredentials,
    #[error("failed to build HTTP client: {0}")]
    ClientBuild(String),
}

/// Transport-level failure reported by the client doer; any response, even a
/// failing status, is a [`DoerResponse`] instead.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct DoerError(pub String);

pub struct DoerResponse {
    pub status: StatusCode,
}

/// The payload of an import request. Cloning is cheap (`Bytes` is
/// reference-counted), which is how a body is "rewound" for a retry: the
/// next attempt simply starts from a fresh clone.
#[derive(Clone)]
pub enum RequestPayload {
    Plain(Bytes),
    RateLimited {
        data: Bytes,
        credit: Arc<RateLimiter>,
        min_credit: usize,
    },
}

impl RequestPayload {
    pub fn len(&self) -> usize {
        match self {
            RequestPayload::Plain(data) => data.len(),
            RequestPayload::RateLimited { data, .. } => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain the payload into a single buffer, honoring the credit pacing if
    /// any. Used by mock clients; the real client streams instead.
    pub async fn collect(self) -> Bytes {
        match self {
            RequestPayload::Plain(data) => data,
            RequestPayload::RateLimited {
                data,
                credit,
                min_credit,
            } => {
                let mut reader = CreditReader::new(credit, min_credit, data);
                let mut out = Vec::new();
                loop {
                    let chunk = reader.read_chunk(8192).await;
                    if chunk.is_empty() {
                        break;
                    }
                    out.extend_from_slice(&chunk);
                }
                Bytes::from(out)
            }
        }
    }

    fn into_reqwest_body(self) -> reqwest::Body {
        match self {
            RequestPayload::Plain(data) => reqwest::Body::from(data),
            RequestPayload::RateLimited {
                data,
                credit,
                min_credit,
            } => reqwest::Body::wrap_stream(CreditReader::new(credit, min_credit, data).into_stream()),
        }
    }
}

pub struct DoerRequest {
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<RequestPayload>,
}

/// Mockable substitute for the HTTP client; all pool requests are PUTs.
#[async_trait]
pub trait HttpClientDoer: Send + Sync {
    async fn execute(&self, req: DoerRequest) -> Result<DoerResponse, DoerError>;
}

/// The production doer, a thin veneer over reqwest.
pub struct ReqwestClientDoer {
    client: reqwest::Client,
}

impl ReqwestClientDoer {
    pub fn new(cfg: &HttpEndpointPoolConfig) -> Result<Self, HttpEndpointPoolError> {
        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs_f64(cfg.response_timeout_secs.max(0.)))
            .connect_timeout(Duration::from_secs_f64(cfg.tcp_conn_timeout_secs.max(0.)))
            .tcp_keepalive(Duration::from_secs_f64(cfg.tcp_keep_alive_secs.max(0.)))
            .pool_idle_timeout(Duration::from_secs_f64(cfg.idle_conn_timeout_secs.max(0.)))
            .pool_max_idle_per_host(cfg.max_idle_conns_per_host);
        if cfg.ignore_tls_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder
            .build()
            .map_err(|e| HttpEndpointPoolError::ClientBuild(e.to_string()))?;
        Ok(ReqwestClientDoer { client })
    }
}

#[async_trait]
impl HttpClientDoer for ReqwestClientDoer {
    async fn execute(&self, req: DoerRequest) -> Result<DoerResponse, DoerError> {
        let mut builder = self.client.put(req.url).headers(req.headers);
        if let Some(payload) = req.body {
            builder = builder.body(payload.into_reqwest_body());
        }
        match builder.send().await {
            Ok(response) => Ok(DoerResponse {
                status: response.status(),
            }),
            Err(err) => Err(DoerError(err.to_string())),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct HttpEndpointConfig {
    pub url: String,
    /// 0 falls back to the pool-level threshold.
    pub mark_unhealthy_threshold: u32,
}

impl Default for HttpEndpointConfig {
    fn default() -> Self {
        HttpEndpointConfig {
            url: HTTP_ENDPOINT_URL_DEFAULT.to_string(),
            mark_unhealthy_threshold: 0,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct HttpEndpointPoolConfig {
    pub endpoints: Vec<HttpEndpointConfig>,
    pub username: String,
    /// Password spec: `file:PATH` (env-expanded), `env:NAME`, `pass:LITERAL`
    /// or a verbatim value.
    pub password: String,
    /// Consecutive-error threshold for declaring an endpoint unhealthy; may
    /// be > 1 when the URL host is a DNS pool resolving to several members.
    pub mark_unhealthy_threshold: u32,
    pub shuffle: bool,
    /// How often to rotate the healthy list: 0 rotates on every use, < 0
    /// disables rotation.
    pub healthy_rotate_interval_secs: f64,
    /// Errors older than this no longer count against the unhealthy
    /// threshold; 0 disables the reset.
    pub error_reset_interval_secs: f64,
    /// How often an unhealthy endpoint is probed; floored at 1s.
    pub health_check_interval_secs: f64,
    /// How long to wait for a healthy endpoint when the list is empty;
    /// normally > the health check interval.
    pub healthy_max_wait_secs: f64,
    /// Per send_buffer call budget; normally longer than healthy_max_wait
    /// and the HTTP timeouts.
    pub send_buffer_timeout_secs: f64,
    /// `"F"` or `"F:INTERVAL"`, F in Mbps; empty disables rate limiting.
    pub rate_limit_mbps: String,
    pub ignore_tls_verify: bool,
    pub tcp_conn_timeout_secs: f64,
    pub tcp_keep_alive_secs: f64,
    pub max_idle_conns_per_host: usize,
    pub idle_conn_timeout_secs: f64,
    pub response_timeout_secs: f64,
}

impl Default for HttpEndpointPoolConfig {
    fn default() -> Self {
        HttpEndpointPoolConfig {
            endpoints: Vec::new(),
            username: String::new(),
            password: String::new(),
            mark_unhealthy_threshold: 0,
            shuffle: false,
            healthy_rotate_interval_secs: 300.,
            error_reset_interval_secs: 60.,
            health_check_interval_secs: 5.,
            healthy_max_wait_secs: 10.,
            send_buffer_timeout_secs: 20.,
            rate_limit_mbps: String::new(),
            ignore_tls_verify: false,
            tcp_conn_timeout_secs: 2.,
            tcp_keep_alive_secs: 15.,
            max_idle_conns_per_host: 1,
            idle_conn_timeout_secs: 60.,
            response_timeout_secs: 5.,
        }
    }
}

impl HttpEndpointPoolConfig {
    /// Replace the endpoint list from a comma-separated URL list, used for
    /// command line overrides.
    pub fn override_endpoints(&mut self, url_list: &str) {
        self.endpoints = url_list
            .split(',')
            .map(|url| HttpEndpointConfig {
                url: url.to_string(),
                mark_unhealthy_threshold: 0,
            })
            .collect();
    }
}

/// Minimal `$VAR` / `${VAR}` environment expansion for password file paths.
fn expand_env(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let braced = matches!(chars.peek(), Some((_, '{')));
        if braced {
            chars.next();
        }
        let mut name = String::new();
        while let Some(&(_, nc)) = chars.peek() {
            if nc.is_ascii_alphanumeric() || nc == '_' {
                name.push(nc);
                chars.next();
            } else {
                break;
            }
        }
        if braced {
            if let Some(&(_, '}')) = chars.peek() {
                chars.next();
            }
        }
        if name.is_empty() {
            out.push('$');
        } else {
            out.push_str(&std::env::var(&name).unwrap_or_default());
        }
    }
    out
}

/// Resolve a password spec: `file:PATH` reads the (env-expanded) file and
/// strips whitespace, `env:NAME` reads the environment, `pass:LITERAL` uses
/// the remainder verbatim, anything else is used as-is.
pub fn load_password_spec(password: &str) -> Result<String, HttpEndpointPoolError> {
    if let Some(path) = password.strip_prefix("file:") {
        let path = expand_env(path);
        let content =
            std::fs::read_to_string(&path).map_err(|e| HttpEndpointPoolError::PasswordFile {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        Ok(content.trim().to_string())
    } else if let Some(name) = password.strip_prefix("env:") {
        Ok(std::env::var(name).unwrap_or_default())
    } else if let Some(literal) = password.strip_prefix("pass:") {
        Ok(literal.to_string())
    } else {
        Ok(password.to_string())
    }
}

/// Build the `Basic` authorization header value, or None without a username.
pub fn build_basic_auth(
    username: &str,
    password: &str,
) -> Result<Option<HeaderValue>, HttpEndpointPoolError> {
    if username.is_empty() {
        return Ok(None);
    }
    let password = load_password_spec(password)?;
    let encoded = BASE64_STANDARD.encode(format!("{username}:{password}"));
    HeaderValue::from_str(&format!("Basic {encoded}"))
        .map(Some)
        .map_err(|_| HttpEndpointPoolError::InvalidCredentials)
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EndpointStats {
    pub send_buffer_count: u64,
    pub send_buffer_byte_count: u64,
    pub send_buffer_error_count: u64,
    pub health_check_count: u64,
    pub health_check_error_count: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub healthy_rotate_count: u64,
    pub no_healthy_ep_error_count: u64,
}

#[derive(Clone, Debug, Default)]
pub struct HttpEndpointPoolStats {
    pub pool: PoolStats,
    /// Keyed by endpoint URL.
    pub endpoints: HashMap<String, EndpointStats>,
}

struct EndpointState {
    url: String,
    parsed: Url,
    mark_unhealthy_threshold: u32,
    healthy: bool,
    num_errors: u32,
    error_ts: Option<Instant>,
}

enum RotatePolicy {
    EveryUse,
    Interval(Duration),
    Never,
}

struct PoolInner {
    // Arena of endpoints; the healthy list holds indices into it, so there
    // are no owning pointer cycles to manage.
    endpoints: Vec<EndpointState>,
    healthy: VecDeque<usize>,
    // Rotation occurs *before* selection and must be suppressed for the
    // first use of a head that was just promoted.
    first_use: bool,
    head_change_ts: Instant,
    shutdown: bool,
    stats: HttpEndpointPoolStats,
}

pub struct HttpEndpointPool {
    // Needed to hand an owning reference to spawned health probes.
    self_ref: Weak<HttpEndpointPool>,
    inner: Mutex<PoolInner>,
    authorization: Option<HeaderValue>,
    rotate_policy: RotatePolicy,
    error_reset_interval: Option<Duration>,
    health_check_interval: Duration,
    healthy_max_wait: Duration,
    healthy_poll_interval: Duration,
    health_check_err_log_interval: Duration,
    send_buffer_timeout: Duration,
    credit: Option<Arc<RateLimiter>>,
    client: Arc<dyn HttpClientDoer>,
    cancel: CancellationToken,
    probes: Mutex<Vec<JoinHandle<()>>>,
}

impl HttpEndpointPool {
    pub fn new(cfg: &HttpEndpointPoolConfig) -> Result<Arc<Self>, HttpEndpointPoolError> {
        let client = Arc::new(ReqwestClientDoer::new(cfg)?);
        Self::with_client_doer(cfg, client)
    }

    /// Construct with a custom client doer; this is how tests substitute a
    /// playback mock for the real client.
    pub fn with_client_doer(
        cfg: &HttpEndpointPoolConfig,
        client: Arc<dyn HttpClientDoer>,
    ) -> Result<Arc<Self>, HttpEndpointPoolError> {
        let authorization = build_basic_auth(&cfg.username, &cfg.password)?;

        let credit = if cfg.rate_limit_mbps.is_empty() {
            None
        } else {
            Some(RateLimiter::from_spec(&cfg.rate_limit_mbps)?)
        };

        let rotate_policy = if cfg.healthy_rotate_interval_secs == 0. {
            RotatePolicy::EveryUse
        } else if cfg.healthy_rotate_interval_secs > 0. {
            RotatePolicy::Interval(Duration::from_secs_f64(cfg.healthy_rotate_interval_secs))
        } else {
            RotatePolicy::Never
        };

        let error_reset_interval = if cfg.error_reset_interval_secs > 0. {
            Some(Duration::from_secs_f64(cfg.error_reset_interval_secs))
        } else {
            None
        };

        let mut health_check_interval =
            Duration::from_secs_f64(cfg.health_check_interval_secs.max(0.));
        if health_check_interval < HEALTH_CHECK_MIN_INTERVAL {
            warn!(
                "health_check_interval {:?} too small, adjusted to {:?}",
                health_check_interval, HEALTH_CHECK_MIN_INTERVAL
            );
            health_check_interval = HEALTH_CHECK_MIN_INTERVAL;
        }

        let mut endpoint_cfgs = cfg.endpoints.clone();
        if endpoint_cfgs.is_empty() {
            endpoint_cfgs.push(HttpEndpointConfig::default());
        }
        if cfg.shuffle && endpoint_cfgs.len() > 1 {
            info!("shuffle the endpoint list");
            endpoint_cfgs.shuffle(&mut rand::thread_rng());
        }

        let mut endpoints = Vec::with_capacity(endpoint_cfgs.len());
        let mut stats = HttpEndpointPoolStats::default();
        for ep_cfg in &endpoint_cfgs {
            let url = if ep_cfg.url.is_empty() {
                HTTP_ENDPOINT_URL_DEFAULT.to_string()
            } else {
                ep_cfg.url.clone()
            };
            let parsed = Url::parse(&url).map_err(|e| HttpEndpointPoolError::InvalidUrl {
                url: url.clone(),
                reason: e.to_string(),
            })?;
            let mut threshold = ep_cfg.mark_unhealthy_threshold;
            if threshold == 0 {
                threshold = cfg.mark_unhealthy_threshold;
            }
            if threshold == 0 {
                threshold = MARK_UNHEALTHY_THRESHOLD_DEFAULT;
            }
            stats.endpoints.insert(url.clone(), EndpointStats::default());
            endpoints.push(EndpointState {
                url,
                parsed,
                mark_unhealthy_threshold: threshold,
                healthy: true,
                num_errors: 0,
                error_ts: None,
            });
        }
        let healthy: VecDeque<usize> = (0..endpoints.len()).collect();

        info!(
            healthy_rotate_interval_secs = cfg.healthy_rotate_interval_secs,
            error_reset_interval_secs = cfg.error_reset_interval_secs,
            health_check_interval_secs = health_check_interval.as_secs_f64(),
            healthy_max_wait_secs = cfg.healthy_max_wait_secs,
            send_buffer_timeout_secs = cfg.send_buffer_timeout_secs,
            rate_limit_mbps = %cfg.rate_limit_mbps,
            num_endpoints = endpoints.len(),
            "http endpoint pool"
        );

        Ok(Arc::new_cyclic(|self_ref| HttpEndpointPool {
            self_ref: self_ref.clone(),
            inner: Mutex::new(PoolInner {
                endpoints,
                healthy,
                first_use: true,
                head_change_ts: Instant::now(),
                shutdown: false,
                stats,
            }),
            authorization,
            rotate_policy,
            error_reset_interval,
            health_check_interval,
            healthy_max_wait: Duration::from_secs_f64(cfg.healthy_max_wait_secs.max(0.)),
            healthy_poll_interval: HEALTHY_POLL_INTERVAL,
            health_check_err_log_interval: HEALTH_CHECK_ERR_LOG_INTERVAL,
            send_buffer_timeout: Duration::from_secs_f64(cfg.send_buffer_timeout_secs.max(0.)),
            credit,
            client,
            cancel: CancellationToken::new(),
            probes: Mutex::new(Vec::new()),
        }))
    }

    fn base_headers(&self, gzipped: bool) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));
        if gzipped {
            headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        }
        if let Some(authorization) = &self.authorization {
            headers.insert(AUTHORIZATION, authorization.clone());
        }
        headers
    }

    /// Get the current healthy endpoint, polling for up to `max_wait` if the
    /// healthy list is empty. `None` uses the pool default wait. Returns the
    /// endpoint arena index and its parsed URL.
    pub async fn current_healthy(&self, max_wait: Option<Duration>) -> Option<(usize, Url)> {
        let max_wait = max_wait.unwrap_or(self.healthy_max_wait);
        let deadline = Instant::now() + max_wait;

        // Poll until deadline or shutdown, waiting for a healthy endpoint.
        // Not the normal operating condition, so polling is fine.
        loop {
            {
                #[allow(clippy::expect_used)]
                let inner = self.inner.lock().expect("lock poisoned");
                if !inner.healthy.is_empty() || inner.shutdown {
                    break;
                }
            }
            let time_left = deadline.saturating_duration_since(Instant::now());
            if time_left.is_zero() {
                return None;
            }
            tokio::time::sleep(self.healthy_poll_interval.min(time_left)).await;
        }

        #[allow(clippy::expect_used)]
        let mut inner = self.inner.lock().expect("lock poisoned");
        let inner = &mut *inner;
        let mut head = *inner.healthy.front()?;

        // Rotate as needed:
        if inner.first_use {
            inner.head_change_ts = Instant::now();
            inner.first_use = false;
        } else {
            let rotate_due = match self.rotate_policy {
                RotatePolicy::EveryUse => true,
                RotatePolicy::Interval(interval) => inner.head_change_ts.elapsed() >= interval,
                RotatePolicy::Never => false,
            };
            if rotate_due && inner.healthy.len() > 1 {
                if let Some(front) = inner.healthy.pop_front() {
                    inner.healthy.push_back(front);
                }
                head = *inner.healthy.front()?;
                inner.head_change_ts = Instant::now();
                inner.stats.pool.healthy_rotate_count += 1;
                debug!(url = %inner.endpoints[head].url, "rotated to healthy list head");
            }
        }

        // Apply the error reset as needed:
        let ep = &mut inner.endpoints[head];
        if ep.num_errors > 0 {
            if let (Some(reset), Some(error_ts)) = (self.error_reset_interval, ep.error_ts) {
                if error_ts.elapsed() >= reset {
                    info!(url = %ep.url, "error#: {} -> 0", ep.num_errors);
                    ep.num_errors = 0;
                }
            }
        }
        Some((head, ep.parsed.clone()))
    }

    /// Account an error against an endpoint: rotate it to the tail while
    /// under its threshold, otherwise take it off the healthy list and start
    /// a health probe for it.
    pub fn report_error(&self, index: usize) {
        #[allow(clippy::expect_used)]
        let mut inner = self.inner.lock().expect("lock poisoned");
        let inner = &mut *inner;
        let ep = &mut inner.endpoints[index];
        ep.num_errors += 1;
        ep.error_ts = Some(Instant::now());
        warn!(
            url = %ep.url,
            "error#: {}, threshold: {}", ep.num_errors, ep.mark_unhealthy_threshold
        );
        if !ep.healthy {
            return;
        }
        if ep.num_errors < ep.mark_unhealthy_threshold {
            if inner.healthy.len() > 1 {
                inner.healthy.retain(|&i| i != index);
                inner.healthy.push_back(index);
                inner.first_use = true;
                debug!(url = %inner.endpoints[index].url, "rotated to healthy list tail");
            }
        } else {
            let url = ep.url.clone();
            ep.healthy = false;
            inner.healthy.retain(|&i| i != index);
            if !inner.shutdown {
                if let Some(pool) = self.self_ref.upgrade() {
                    warn!(url = %url, "moved to health check");
                    #[allow(clippy::expect_used)]
                    self.probes
                        .lock()
                        .expect("lock poisoned")
                        .push(tokio::spawn(pool.health_probe(index)));
                }
            }
        }
        match inner.healthy.front() {
            None => warn!("no healthy HTTP endpoint available"),
            Some(&head) => {
                debug!(url = %inner.endpoints[head].url, "at the head of the healthy list");
            }
        }
    }

    /// Reinstate an endpoint at the healthy-list tail with a clean error
    /// count. No-op if it is already healthy.
    pub fn move_to_healthy(&self, index: usize) {
        #[allow(clippy::expect_used)]
        let mut inner = self.inner.lock().expect("lock poisoned");
        let inner = &mut *inner;
        let ep = &mut inner.endpoints[index];
        if ep.healthy {
            return;
        }
        ep.healthy = true;
        ep.num_errors = 0;
        let url = ep.url.clone();
        inner.healthy.push_back(index);
        if inner.healthy.len() == 1 {
            info!(url = %url, "at the head of the healthy list");
        } else {
            info!(url = %url, "appended to the healthy list");
        }
    }

    // Periodically probe an unhealthy endpoint with an empty PUT until it
    // answers with a success status, then move it back to healthy and exit.
    // Repeated identical failures are logged at most once per
    // health_check_err_log_interval.
    async fn health_probe(self: Arc<Self>, index: usize) {
        let (url, parsed) = {
            #[allow(clippy::expect_used)]
            let inner = self.inner.lock().expect("lock poisoned");
            let ep = &inner.endpoints[index];
            (ep.url.clone(), ep.parsed.clone())
        };
        warn!(url = %url, "start health check");

        let mut prev_error: Option<String> = None;
        let mut prev_status: Option<StatusCode> = None;
        let mut repeat_count = 0u64;
        let mut error_log_ts = Instant::now();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    warn!(url = %url, "cancel health check");
                    return;
                }
                _ = tokio::time::sleep(self.health_check_interval) => {}
            }

            let request = DoerRequest {
                url: parsed.clone(),
                headers: self.base_headers(false),
                body: None,
            };
            let result = tokio::select! {
                _ = self.cancel.cancelled() => {
                    warn!(url = %url, "cancel health check");
                    return;
                }
                result = self.client.execute(request) => result,
            };
            let healthy = matches!(&result, Ok(response) if is_success(response.status));

            {
                #[allow(clippy::expect_used)]
                let mut inner = self.inner.lock().expect("lock poisoned");
                if let Some(ep_stats) = inner.stats.endpoints.get_mut(&url) {
                    ep_stats.health_check_count += 1;
                    if !healthy {
                        ep_stats.health_check_error_count += 1;
                    }
                }
            }

            match result {
                Ok(response) if healthy => {
                    info!(url = %url, "PUT: {}", response.status);
                    self.move_to_healthy(index);
                    return;
                }
                Ok(response) => {
                    let status = Some(response.status);
                    if prev_error.is_some() || prev_status != status {
                        repeat_count = 1;
                    } else {
                        repeat_count += 1;
                    }
                    if repeat_count == 1
                        || error_log_ts.elapsed() >= self.health_check_err_log_interval
                    {
                        error_log_ts = Instant::now();
                        warn!(
                            url = %url,
                            "PUT: {}{}", response.status, repeat_suffix(repeat_count)
                        );
                    }
                    prev_error = None;
                    prev_status = status;
                }
                Err(err) => {
                    let error = Some(err.to_string());
                    if prev_error != error || prev_status.is_some() {
                        repeat_count = 1;
                    } else {
                        repeat_count += 1;
                    }
                    if repeat_count == 1
                        || error_log_ts.elapsed() >= self.health_check_err_log_interval
                    {
                        error_log_ts = Instant::now();
                        warn!(url = %url, "{err}{}", repeat_suffix(repeat_count));
                    }
                    prev_error = error;
                    prev_status = None;
                }
            }
        }
    }

    /// Send a metrics buffer to the current healthy endpoint, retrying on
    /// other endpoints until the deadline. `None` timeout uses the pool
    /// default. The body is rewound between attempts.
    pub async fn send_buffer(
        &self,
        body: Bytes,
        timeout: Option<Duration>,
        gzipped: bool,
    ) -> Result<(), SendBufferError> {
        let headers = self.base_headers(gzipped);
        let byte_count = body.len() as u64;
        let payload = match &self.credit {
            Some(credit) => RequestPayload::RateLimited {
                data: body,
                credit: Arc::clone(credit),
                min_credit: CREDIT_READER_MIN_CREDIT_DEFAULT,
            },
            None => RequestPayload::Plain(body),
        };

        let timeout = timeout.unwrap_or(self.send_buffer_timeout);
        let deadline = Instant::now() + timeout;
        for attempt in 1u64.. {
            let max_wait = deadline.saturating_duration_since(Instant::now());
            let Some((index, url)) = self.current_healthy(Some(max_wait)).await else {
                {
                    #[allow(clippy::expect_used)]
                    let mut inner = self.inner.lock().expect("lock poisoned");
                    inner.stats.pool.no_healthy_ep_error_count += 1;
                }
                warn!("send buffer attempt# {attempt}: no healthy HTTP endpoint available");
                return Err(SendBufferError::NoHealthyEndpoint);
            };
            let url_str = url.to_string();

            let result = self
                .client
                .execute(DoerRequest {
                    url,
                    headers: headers.clone(),
                    // A fresh clone is a rewound body:
                    body: Some(payload.clone()),
                })
                .await;

            let (sent, success, non_retryable, status) = match &result {
                Ok(response) => (
                    true,
                    is_success(response.status),
                    !is_retryable(response.status),
                    Some(response.status),
                ),
                Err(_) => (false, false, false, None),
            };

            {
                #[allow(clippy::expect_used)]
                let mut inner = self.inner.lock().expect("lock poisoned");
                let ep_url = inner.endpoints[index].url.clone();
                if let Some(ep_stats) = inner.stats.endpoints.get_mut(&ep_url) {
                    ep_stats.send_buffer_count += 1;
                    if sent {
                        ep_stats.send_buffer_byte_count += byte_count;
                    }
                    if !success {
                        ep_stats.send_buffer_error_count += 1;
                    }
                }
            }

            if success {
                return Ok(());
            }
            if non_retryable {
                #[allow(clippy::unwrap_used)] // non_retryable implies a response
                let status = status.unwrap();
                warn!("send buffer attempt# {attempt}: PUT {url_str}: {status}");
                return Err(SendBufferError::NonRetryableStatus {
                    url: url_str,
                    status,
                });
            }
            match &result {
                Err(err) => warn!("send buffer attempt# {attempt}: {err}"),
                Ok(response) => {
                    warn!("send buffer attempt# {attempt}: PUT {url_str}: {}", response.status)
                }
            }
            // There is something wrong with the endpoint:
            self.report_error(index);
        }
        unreachable!()
    }

    /// Copy the current stats into `to`.
    pub fn snap_stats(&self, to: &mut HttpEndpointPoolStats) {
        #[allow(clippy::expect_used)]
        let inner = self.inner.lock().expect("lock poisoned");
        to.pool = inner.stats.pool.clone();
        for (url, ep_stats) in &inner.stats.endpoints {
            to.endpoints.insert(url.clone(), ep_stats.clone());
        }
    }

    /// Stop health probes and the rate-limit replenisher. Idempotent.
    pub async fn shutdown(&self) {
        {
            #[allow(clippy::expect_used)]
            let mut inner = self.inner.lock().expect("lock poisoned");
            if inner.shutdown {
                warn!("pool already shutdown");
                return;
            }
            inner.shutdown = true;
        }
        info!("initiate pool shutdown");
        self.cancel.cancel();
        let probes = {
            #[allow(clippy::expect_used)]
            std::mem::take(&mut *self.probes.lock().expect("lock poisoned"))
        };
        for probe in probes {
            let _ = probe.await;
        }
        info!("all health check tasks completed");
        if let Some(credit) = &self.credit {
            credit.shutdown().await;
        }
        info!("pool shutdown complete");
    }

    /// Snapshot of the healthy-list URLs, head first. Test and logging aid.
    pub fn healthy_urls(&self) -> Vec<String> {
        #[allow(clippy::expect_used)]
        let inner = self.inner.lock().expect("lock poisoned");
        inner
            .healthy
            .iter()
            .map(|&i| inner.endpoints[i].url.clone())
            .collect()
    }
}

fn repeat_suffix(repeat_count: u64) -> String {
    if repeat_count > 1 {
        format!(" ({repeat_count} times)")
    } else {
        String::new()
    }
}

#[async_trait]
impl crate::compressor_pool::BatchSender for HttpEndpointPool {
    async fn send_buffer(
        &self,
        body: Bytes,
        timeout: Option<Duration>,
        gzipped: bool,
    ) -> Result<(), SendBufferError> {
        HttpEndpointPool::send_buffer(self, body, timeout, gzipped).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env() {
        std::env::set_var("VMI_TEST_DIR", "/etc/vmi");
        assert_eq!(expand_env("$VMI_TEST_DIR/secret"), "/etc/vmi/secret");
        assert_eq!(expand_env("${VMI_TEST_DIR}/secret"), "/etc/vmi/secret");
        assert_eq!(expand_env("no vars here"), "no vars here");
        assert_eq!(expand_env("$"), "$");
        assert_eq!(expand_env("$VMI_TEST_UNSET_123/x"), "/x");
    }

    #[test]
    fn test_load_password_spec() {
        std::env::set_var("VMI_TEST_PASSWORD", "s3cret");
        assert_eq!(load_password_spec("env:VMI_TEST_PASSWORD").unwrap(), "s3cret");
        assert_eq!(load_password_spec("pass:file:keep").unwrap(), "file:keep");
        assert_eq!(load_password_spec("verbatim").unwrap(), "verbatim");

        let dir = std::env::temp_dir();
        let path = dir.join("vmi_test_password");
        std::fs::write(&path, "  from-file\n").unwrap();
        let spec = format!("file:{}", path.display());
        assert_eq!(load_password_spec(&spec).unwrap(), "from-file");
        std::fs::remove_file(&path).unwrap();

        assert!(load_password_spec("file:/definitely/not/there").is_err());
    }

    #[test]
    fn test_build_basic_auth() {
        // echo -n 'user:pass' | base64 => dXNlcjpwYXNz
        let header = build_basic_auth("user", "pass:pass").unwrap().unwrap();
        assert_eq!(header.to_str().unwrap(), "Basic dXNlcjpwYXNz");
        assert!(build_basic_auth("", "ignored").unwrap().is_none());
    }

    #[test]
    fn test_override_endpoints() {
        let mut cfg = HttpEndpointPoolConfig::default();
        cfg.override_endpoints("http://host1:8428,http://host2:8428");
        assert_eq!(cfg.endpoints.len(), 2);
        assert_eq!(cfg.endpoints[0].url, "http://host1:8428");
        assert_eq!(cfg.endpoints[1].url, "http://host2:8428");
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let cfg = HttpEndpointPoolConfig {
            endpoints: vec![HttpEndpointConfig {
                url: "not a url".to_string(),
                mark_unhealthy_threshold: 0,
            }],
            ..Default::default()
        };
        assert!(HttpEndpointPool::new(&cfg).is_err());

        let cfg = HttpEndpointPoolConfig {
            rate_limit_mbps: "not-a-rate".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            HttpEndpointPool::new(&cfg),
            Err(HttpEndpointPoolError::RateSpec(_))
        ));
    }
}
