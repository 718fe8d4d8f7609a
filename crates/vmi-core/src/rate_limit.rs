// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Credit-based rate limiting.
//!
//! The credit is a numerical quantity replenished periodically, at intervals
//! `T`, with a constant amount `N`, optionally capped at `M >= N`. `N/T` is
//! the target rate and `M - N` the burst allowance. A user in need of `n`
//! units requests a credit in the range `min_acceptable..=n` before
//! proceeding and then uses no more than the granted amount.
//!
//! One credit equals one byte when used for bandwidth limiting, which is how
//! the HTTP endpoint pool throttles request bodies.

use std::io::SeekFrom;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Credit value signalled to waiters once the controller shuts down; any
/// request past that point is granted in full.
const CREDIT_UNLIMITED: i64 = -1;

/// Default floor for credit requests issued by [`CreditReader`].
pub const CREDIT_READER_MIN_CREDIT_DEFAULT: usize = 128;

/// Chunk cap for the streaming request-body adapter.
const CREDIT_READER_STREAM_CHUNK: usize = 8192;

#[derive(Debug, Error)]
pub enum RateSpecError {
    #[error("invalid rate spec {spec:?}: bad rate value")]
    BadRate { spec: String },
    #[error("invalid rate spec {spec:?}: bad interval")]
    BadInterval { spec: String },
}

/// Parse a `"F"` or `"F:INTERVAL"` rate spec, `F` being Mbps as a float and
/// `INTERVAL` a duration such as `"100ms"` or `"1s"` (default `1s`). Returns
/// the replenish value in bytes and the replenish interval.
pub fn parse_rate_spec(spec: &str) -> Result<(i64, Duration), RateSpecError> {
    let (mbps, interval) = match spec.split_once(':') {
        Some((m, i)) => (m, i),
        None => (spec, "1s"),
    };
    let mbps: f64 = mbps.parse().map_err(|_| RateSpecError::BadRate {
        spec: spec.to_string(),
    })?;
    if !mbps.is_finite() || mbps < 0. {
        return Err(RateSpecError::BadRate {
            spec: spec.to_string(),
        });
    }
    let interval = parse_duration(interval).ok_or_else(|| RateSpecError::BadInterval {
        spec: spec.to_string(),
    })?;
    if interval.is_zero() {
        return Err(RateSpecError::BadInterval {
            spec: spec.to_string(),
        });
    }
    let replenish_value = (mbps * 1_000_000. / 8. * interval.as_secs_f64()) as i64;
    Ok((replenish_value, interval))
}

/// Parse a duration with an `ms`, `s`, `m` or `h` suffix; the value part may
/// be fractional.
fn parse_duration(s: &str) -> Option<Duration> {
    let (value, scale) = if let Some(v) = s.strip_suffix("ms") {
        (v, 0.001)
    } else if let Some(v) = s.strip_suffix('s') {
        (v, 1.)
    } else if let Some(v) = s.strip_suffix('m') {
        (v, 60.)
    } else if let Some(v) = s.strip_suffix('h') {
        (v, 3600.)
    } else {
        return None;
    };
    let value: f64 = value.parse().ok()?;
    let secs = value * scale;
    // Bound to something sane so Duration::from_secs_f64 cannot panic.
    if !secs.is_finite() || !(0. ..=1e9).contains(&secs) {
        return None;
    }
    Some(Duration::from_secs_f64(secs))
}

/// Token bucket with a background replenisher task.
pub struct RateLimiter {
    current: Mutex<i64>,
    // Bumped after every replenish (and at shutdown) to wake blocked
    // acquirers.
    replenished: watch::Sender<u64>,
    cancel: CancellationToken,
    replenisher: Mutex<Option<JoinHandle<()>>>,
    replenish_value: i64,
    replenish_interval: Duration,
    max_value: i64,
}

impl RateLimiter {
    /// `max_value == 0` leaves the bucket unbounded; otherwise it is raised
    /// to at least `replenish_value`. Must be called within a tokio runtime:
    /// the replenisher task starts immediately.
    pub fn new(replenish_value: i64, max_value: i64, replenish_interval: Duration) -> Arc<Self> {
        let max_value = if max_value > 0 {
            max_value.max(replenish_value)
        } else {
            max_value
        };
        let limiter = Arc::new(RateLimiter {
            current: Mutex::new(replenish_value),
            replenished: watch::Sender::new(0),
            cancel: CancellationToken::new(),
            replenisher: Mutex::new(None),
            replenish_value,
            replenish_interval,
            max_value,
        });
        let handle = tokio::spawn(Arc::clone(&limiter).replenish_loop());
        #[allow(clippy::expect_used)]
        limiter
            .replenisher
            .lock()
            .expect("lock poisoned")
            .replace(handle);
        limiter
    }

    pub fn from_spec(spec: &str) -> Result<Arc<Self>, RateSpecError> {
        let (replenish_value, replenish_interval) = parse_rate_spec(spec)?;
        Ok(Self::new(replenish_value, 0, replenish_interval))
    }

    async fn replenish_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.replenish_interval);
        ticker.tick().await; // discard first tick, which is instantaneous
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    #[allow(clippy::expect_used)]
                    {
                        *self.current.lock().expect("lock poisoned") = CREDIT_UNLIMITED;
                    }
                    self.replenished.send_modify(|epoch| *epoch += 1);
                    return;
                }
                _ = ticker.tick() => {
                    #[allow(clippy::expect_used)]
                    {
                        let mut current = self.current.lock().expect("lock poisoned");
                        *current += self.replenish_value;
                        if self.max_value > 0 && *current > self.max_value {
                            *current = self.max_value;
                        }
                    }
                    self.replenished.send_modify(|epoch| *epoch += 1);
                }
            }
        }
    }

    /// Block until at least `min_acceptable` credits are available, then
    /// take and return up to `desired` of them. A `min_acceptable` of 0 or
    /// greater than `desired` collapses to `desired`. After shutdown the
    /// full `desired` amount is returned (unlimited semantics).
    pub async fn acquire(&self, desired: usize, min_acceptable: usize) -> usize {
        let min_acceptable = if min_acceptable == 0 || min_acceptable > desired {
            desired
        } else {
            min_acceptable
        };

        loop {
            let mut replenished = self.replenished.subscribe();
            {
                #[allow(clippy::expect_used)]
                let mut current = self.current.lock().expect("lock poisoned");
                if *current < 0 {
                    return desired;
                }
                if *current >= min_acceptable as i64 {
                    let got = desired.min(*current as usize);
                    *current -= got as i64;
                    return got;
                }
            }
            // The subscription predates the check above, so a replenish
            // between unlock and await is observed by changed().
            if replenished.changed().await.is_err() {
                return desired;
            }
        }
    }

    pub fn replenish_value(&self) -> i64 {
        self.replenish_value
    }

    pub fn replenish_interval(&self) -> Duration {
        self.replenish_interval
    }

    /// Stop the replenisher and release all waiters with unlimited credit.
    /// Idempotent.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = {
            #[allow(clippy::expect_used)]
            self.replenisher.lock().expect("lock poisoned").take()
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

#[derive(Debug, Error)]
pub enum CreditReaderSeekError {
    #[error("seek: invalid offset")]
    InvalidOffset,
}

/// Rate-limited reader over a flat byte payload, usable as an HTTP request
/// body across retries: it is seekable and rewindable, and `Bytes` makes the
/// wrap copy-free.
///
/// Each read requests up to the chunk length in credits, with a floor of
/// `min_credit`. Closing is idempotent; reads after close yield empty chunks
/// and no error.
pub struct CreditReader {
    credit: Arc<RateLimiter>,
    min_credit: usize,
    data: Bytes,
    pos: usize,
    closed: bool,
}

impl CreditReader {
    pub fn new(credit: Arc<RateLimiter>, min_credit: usize, data: Bytes) -> Self {
        CreditReader {
            credit,
            min_credit,
            data,
            pos: 0,
            closed: false,
        }
    }

    /// Read the next chunk of at most `max` bytes, waiting for credit as
    /// needed. An empty chunk means end of data or a closed reader.
    pub async fn read_chunk(&mut self, max: usize) -> Bytes {
        if self.closed || max == 0 {
            return Bytes::new();
        }
        let available = self.data.len() - self.pos;
        if available == 0 {
            return Bytes::new();
        }
        let desired = max.min(available);
        let got = self.credit.acquire(desired, self.min_credit).await;
        if got == 0 {
            return Bytes::new();
        }
        let start = self.pos;
        self.pos += got;
        self.data.slice(start..self.pos)
    }

    /// Seek within the payload. While closed, reports the frozen position
    /// without moving it.
    pub fn seek(&mut self, from: SeekFrom) -> Result<u64, CreditReaderSeekError> {
        let pos = match from {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(offset) => self.pos as i64 + offset,
            SeekFrom::End(offset) => self.data.len() as i64 - 1 + offset,
        };
        if pos < 0 || pos >= self.data.len() as i64 {
            return Err(CreditReaderSeekError::InvalidOffset);
        }
        if !self.closed {
            self.pos = pos as usize;
        }
        Ok(pos as u64)
    }

    /// Reuse with the same data, for HTTP retries.
    pub fn rewind(&mut self) {
        self.pos = 0;
        self.closed = false;
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    /// Adapt into a chunk stream suitable for a streaming HTTP request body.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send {
        futures::stream::unfold(self, |mut reader| async move {
            let chunk = reader.read_chunk(CREDIT_READER_STREAM_CHUNK).await;
            if chunk.is_empty() {
                None
            } else {
                Some((Ok(chunk), reader))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_parse_rate_spec() {
        let (value, interval) = parse_rate_spec("100").unwrap();
        assert_eq!(value, 100 * 1_000_000 / 8);
        assert_eq!(interval, Duration::from_secs(1));

        let (value, interval) = parse_rate_spec("100:100ms").unwrap();
        assert_eq!(value, 100 * 1_000_000 / 8 / 10);
        assert_eq!(interval, Duration::from_millis(100));

        let (value, _) = parse_rate_spec("0.5:1s").unwrap();
        assert_eq!(value, 62_500);

        assert!(parse_rate_spec("").is_err());
        assert!(parse_rate_spec("abc").is_err());
        assert!(parse_rate_spec("100:").is_err());
        assert!(parse_rate_spec("100:12").is_err());
        assert!(parse_rate_spec("100:-1s").is_err());
        assert!(parse_rate_spec("-100").is_err());
    }

    #[tokio::test]
    async fn test_acquire_normalization() {
        let limiter = RateLimiter::new(1000, 0, Duration::from_secs(3600));
        // min_acceptable == 0 or > desired collapses to desired.
        assert_eq!(limiter.acquire(100, 0).await, 100);
        assert_eq!(limiter.acquire(100, 500).await, 100);
        // Partial grant between min and desired.
        assert_eq!(limiter.acquire(5000, 100).await, 800);
        limiter.shutdown().await;
    }

    #[tokio::test]
    async fn test_acquire_after_shutdown_is_unlimited() {
        let limiter = RateLimiter::new(10, 0, Duration::from_secs(3600));
        limiter.shutdown().await;
        assert_eq!(limiter.acquire(1_000_000, 1_000_000).await, 1_000_000);
    }

    #[tokio::test]
    async fn test_shutdown_releases_waiters() {
        let limiter = RateLimiter::new(1, 0, Duration::from_secs(3600));
        limiter.acquire(1, 1).await;
        let waiter = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.acquire(100, 100).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        limiter.shutdown().await;
        assert_eq!(waiter.await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_observed_rate_with_concurrent_requestors() {
        // V=2000 per I=20ms, N=4 clients over ~500ms: observed rate within
        // 20% of V/I.
        let interval = Duration::from_millis(20);
        let limiter = RateLimiter::new(2000, 0, interval);
        let run_for = Duration::from_millis(500);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                let start = Instant::now();
                let mut total = 0u64;
                while start.elapsed() < run_for {
                    total += limiter.acquire(256, 128).await as u64;
                }
                total
            }));
        }
        let mut total = 0u64;
        for handle in handles {
            total += handle.await.unwrap();
        }
        limiter.shutdown().await;

        let target_rate = 2000. / interval.as_secs_f64();
        let observed_rate = total as f64 / run_for.as_secs_f64();
        let relative_err = (observed_rate - target_rate).abs() / target_rate;
        assert!(
            relative_err <= 0.2,
            "observed rate {observed_rate:.0} B/s vs target {target_rate:.0} B/s"
        );
    }

    #[tokio::test]
    async fn test_no_starvation_when_undersubscribed() {
        // Per-client targets sum below capacity: every client must reach its
        // target within D + I.
        let interval = Duration::from_millis(20);
        let limiter = RateLimiter::new(1000, 0, interval);
        let per_client_target = 4000u64; // 3 clients * 4000 over 300ms < 1000/20ms * 320ms

        let mut handles = Vec::new();
        for _ in 0..3 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                let mut total = 0u64;
                while total < per_client_target {
                    total += limiter.acquire(200, 100).await as u64;
                }
                total
            }));
        }
        let deadline = Duration::from_millis(320) + interval;
        for handle in handles {
            let total = tokio::time::timeout(deadline, handle)
                .await
                .expect("client starved")
                .unwrap();
            assert!(total >= per_client_target);
        }
        limiter.shutdown().await;
    }

    #[tokio::test]
    async fn test_credit_reader_reads_all_data() {
        let limiter = RateLimiter::new(1_000_000, 0, Duration::from_secs(1));
        let data = Bytes::from(vec![7u8; 10_000]);
        let mut reader = CreditReader::new(Arc::clone(&limiter), 128, data.clone());

        let mut out = Vec::new();
        loop {
            let chunk = reader.read_chunk(4096).await;
            if chunk.is_empty() {
                break;
            }
            out.extend_from_slice(&chunk);
        }
        assert_eq!(out, data.as_ref());
        limiter.shutdown().await;
    }

    #[tokio::test]
    async fn test_credit_reader_close_and_rewind() {
        let limiter = RateLimiter::new(1_000_000, 0, Duration::from_secs(1));
        let mut reader = CreditReader::new(Arc::clone(&limiter), 1, Bytes::from_static(b"payload"));

        assert_eq!(reader.read_chunk(3).await, Bytes::from_static(b"pay"));
        reader.close();
        // Reads after close yield no data and no error.
        assert!(reader.read_chunk(3).await.is_empty());
        // Seek while closed reports the frozen position.
        assert_eq!(reader.seek(SeekFrom::Start(0)).unwrap(), 0);
        assert!(reader.read_chunk(3).await.is_empty());

        reader.rewind();
        assert_eq!(reader.read_chunk(7).await, Bytes::from_static(b"payload"));
        limiter.shutdown().await;
    }

    #[tokio::test]
    async fn test_credit_reader_seek_bounds() {
        let limiter = RateLimiter::new(1_000_000, 0, Duration::from_secs(1));
        let mut reader = CreditReader::new(Arc::clone(&limiter), 1, Bytes::from_static(b"0123456789"));

        assert_eq!(reader.seek(SeekFrom::Start(4)).unwrap(), 4);
        assert_eq!(reader.read_chunk(2).await, Bytes::from_static(b"45"));
        assert_eq!(reader.seek(SeekFrom::Current(-6)).unwrap(), 0);
        assert_eq!(reader.seek(SeekFrom::End(0)).unwrap(), 9);
        assert!(reader.seek(SeekFrom::Start(10)).is_err());
        assert!(reader.seek(SeekFrom::Current(-100)).is_err());
        limiter.shutdown().await;
    }
}
