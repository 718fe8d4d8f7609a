// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pool of gzip compressors consolidating generator output into batches.
//!
//! Generators queue buffers into a bounded channel; N compressors drain it
//! and feed a gzip stream until the batch is projected to have reached the
//! target compressed size or a flush timer fires, at which point the batch
//! is handed to the sender.
//!
//! The exact batch size cannot be observed while compressing (part of it
//! sits in the encoder's internal state), so it is projected from the number
//! of raw bytes read so far divided by the estimated compression factor
//! `CF`. `CF` is updated at batch end with exponential decay:
//! `CF = (1 - alpha) * batch_cf + alpha * CF`.

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Deserialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::buf_pool::BufferPool;
use crate::generator::BufferQueue;
use crate::http_endpoint_pool::SendBufferError;

pub const COMPRESSOR_POOL_MAX_NUM_COMPRESSORS: usize = 4;

const INITIAL_COMPRESSION_FACTOR: f64 = 2.;
const COMPRESSION_FACTOR_EXP_DECAY_ALPHA: f64 = 0.8;
// A compressed batch should be at least this size to be used for updating
// the compression factor:
const COMPRESSED_BATCH_MIN_SIZE_FOR_CF: usize = 128;

/// The downstream surface of the HTTP endpoint pool, as seen by the
/// compressors; mockable in tests.
#[async_trait]
pub trait BatchSender: Send + Sync {
    async fn send_buffer(
        &self,
        body: Bytes,
        timeout: Option<Duration>,
        gzipped: bool,
    ) -> Result<(), SendBufferError>;
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CompressorStats {
    pub read_count: u64,
    pub read_byte_count: u64,
    pub send_count: u64,
    pub send_byte_count: u64,
    pub timeout_flush_count: u64,
    pub send_error_count: u64,
    pub write_error_count: u64,
    /// Exponentially smoothed raw/compressed ratio.
    pub compression_factor: f64,
}

/// Indexed by compressor number.
pub type CompressorPoolStats = Vec<CompressorStats>;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CompressorPoolConfig {
    /// The number of compressors. -1 matches the number of available cores,
    /// in both cases capped at [`COMPRESSOR_POOL_MAX_NUM_COMPRESSORS`].
    pub num_compressors: i32,
    /// How many idle buffers are kept for reuse; buffers are created as
    /// demanded but discarded on return past this count.
    pub buffer_pool_max_size: usize,
    /// Metrics queue depth; it should be deep enough to accommodate the
    /// buffers produced over a send_buffer timeout.
    pub metrics_queue_size: usize,
    /// gzip level 0..=9; 0 still produces a gzip container, just stored.
    pub compression_level: u32,
    /// Target compressed batch size, in bytes.
    pub batch_target_size: usize,
    /// How long to wait before sending a partially filled batch, to bound
    /// staleness. 0 disables the time flush.
    pub flush_interval_secs: f64,
}

impl Default for CompressorPoolConfig {
    fn default() -> Self {
        CompressorPoolConfig {
            num_compressors: -1,
            buffer_pool_max_size: 64,
            metrics_queue_size: 64,
            compression_level: 6,
            batch_target_size: 64 * 1024,
            flush_interval_secs: 5.,
        }
    }
}

#[derive(Debug, Error)]
pub enum CompressorPoolError {
    #[error("invalid compression_level {0}, expected 0..=9")]
    InvalidCompressionLevel(u32),
    #[error("invalid batch_target_size 0")]
    InvalidBatchTargetSize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RunState {
    Created,
    Running,
    Stopped,
}

struct CompressorShared {
    stats: Mutex<CompressorPoolStats>,
    state: Mutex<RunState>,
}

pub struct CompressorPool {
    num_compressors: usize,
    buf_pool: Arc<BufferPool>,
    queue_tx: async_channel::Sender<Vec<u8>>,
    queue_rx: async_channel::Receiver<Vec<u8>>,
    compression_level: u32,
    batch_target_size: usize,
    flush_interval: Duration,
    shared: Arc<CompressorShared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl CompressorPool {
    pub fn new(cfg: &CompressorPoolConfig) -> Result<Self, CompressorPoolError> {
        if cfg.compression_level > 9 {
            return Err(CompressorPoolError::InvalidCompressionLevel(
                cfg.compression_level,
            ));
        }
        if cfg.batch_target_size == 0 {
            return Err(CompressorPoolError::InvalidBatchTargetSize);
        }

        let mut num_compressors = if cfg.num_compressors <= 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            cfg.num_compressors as usize
        };
        if num_compressors > COMPRESSOR_POOL_MAX_NUM_COMPRESSORS {
            num_compressors = COMPRESSOR_POOL_MAX_NUM_COMPRESSORS;
        }

        let (queue_tx, queue_rx) = async_channel::bounded(cfg.metrics_queue_size.max(1));
        info!(
            num_compressors,
            buffer_pool_max_size = cfg.buffer_pool_max_size,
            metrics_queue_size = cfg.metrics_queue_size,
            compression_level = cfg.compression_level,
            batch_target_size = cfg.batch_target_size,
            flush_interval_secs = cfg.flush_interval_secs,
            "compressor pool"
        );

        Ok(CompressorPool {
            num_compressors,
            buf_pool: Arc::new(BufferPool::new(cfg.buffer_pool_max_size)),
            queue_tx,
            queue_rx,
            compression_level: cfg.compression_level,
            batch_target_size: cfg.batch_target_size,
            flush_interval: Duration::from_secs_f64(cfg.flush_interval_secs.max(0.)),
            shared: Arc::new(CompressorShared {
                stats: Mutex::new(vec![CompressorStats::default(); num_compressors]),
                state: Mutex::new(RunState::Created),
            }),
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn num_compressors(&self) -> usize {
        self.num_compressors
    }

    pub fn start(&self, sender: Arc<dyn BatchSender>) {
        {
            #[allow(clippy::expect_used)]
            let mut state = self.shared.state.lock().expect("lock poisoned");
            if *state != RunState::Created {
                warn!("compressor pool can only be started once, current state {state:?}");
                return;
            }
            *state = RunState::Running;
        }

        #[allow(clippy::expect_used)]
        let mut handles = self.handles.lock().expect("lock poisoned");
        for index in 0..self.num_compressors {
            handles.push(tokio::spawn(compressor_loop(
                index,
                Arc::clone(&self.shared),
                self.queue_rx.clone(),
                Arc::clone(&self.buf_pool),
                Arc::clone(&sender),
                self.compression_level,
                self.batch_target_size,
                self.flush_interval,
            )));
        }
    }

    /// Close the input queue; compressors drain it, flush any partial batch
    /// and exit. Idempotent.
    pub async fn shutdown(&self) {
        {
            #[allow(clippy::expect_used)]
            let mut state = self.shared.state.lock().expect("lock poisoned");
            if *state == RunState::Stopped {
                warn!("compressor pool already stopped");
                return;
            }
            *state = RunState::Stopped;
        }
        warn!("closing compressor pool queue");
        self.queue_tx.close();
        let handles = {
            #[allow(clippy::expect_used)]
            std::mem::take(&mut *self.handles.lock().expect("lock poisoned"))
        };
        for handle in handles {
            let _ = handle.await;
        }
        info!("all compressors stopped");
    }

    /// Copy the current stats into `to`, resized as needed.
    pub fn snap_stats(&self, to: &mut CompressorPoolStats) {
        #[allow(clippy::expect_used)]
        let stats = self.shared.stats.lock().expect("lock poisoned");
        to.resize(stats.len(), CompressorStats::default());
        to.clone_from_slice(&stats);
    }
}

#[async_trait]
impl BufferQueue for CompressorPool {
    fn get_buf(&self) -> Vec<u8> {
        self.buf_pool.get()
    }

    fn return_buf(&self, buf: Vec<u8>) {
        self.buf_pool.put(buf);
    }

    async fn queue_buf(&self, buf: Vec<u8>) {
        if self.queue_tx.send(buf).await.is_err() {
            warn!("metrics queue closed, buffer dropped");
        }
    }

    fn target_size(&self) -> usize {
        self.batch_target_size
    }
}

#[allow(clippy::too_many_arguments)]
async fn compressor_loop(
    index: usize,
    shared: Arc<CompressorShared>,
    queue_rx: async_channel::Receiver<Vec<u8>>,
    buf_pool: Arc<BufferPool>,
    sender: Arc<dyn BatchSender>,
    compression_level: u32,
    batch_target_size: usize,
    flush_interval: Duration,
) {
    info!(compressor = index, "start compressor");

    let mut estimated_cf = if compression_level == 0 {
        1.
    } else {
        INITIAL_COMPRESSION_FACTOR
    };
    let mut read_byte_limit = (batch_target_size as f64 * estimated_cf) as u64;

    let mut encoder: Option<GzEncoder<Vec<u8>>> = None;
    let mut flush_timer: Option<std::pin::Pin<Box<tokio::time::Sleep>>> = None;
    let mut batch_read_count = 0u64;
    let mut batch_read_bytes = 0u64;

    let mut open = true;
    while open {
        let mut do_send = false;
        let mut timeout_flush = false;

        #[allow(clippy::unwrap_used)] // guarded by the branch precondition
        {
            tokio::select! {
                received = queue_rx.recv() => {
                    match received {
                        Ok(buf) => {
                            if !buf.is_empty() {
                                if batch_read_count == 0 {
                                    // First read of the batch:
                                    encoder = Some(GzEncoder::new(
                                        Vec::new(),
                                        Compression::new(compression_level),
                                    ));
                                    if flush_interval > Duration::ZERO {
                                        flush_timer =
                                            Some(Box::pin(tokio::time::sleep(flush_interval)));
                                    }
                                }
                                batch_read_count += 1;
                                batch_read_bytes += buf.len() as u64;
                                let write_res = match encoder.as_mut() {
                                    Some(encoder) => encoder.write_all(&buf),
                                    None => Ok(()),
                                };
                                buf_pool.put(buf);
                                if let Err(err) = write_res {
                                    // Writes go to memory, so this should
                                    // never happen; discard the batch and
                                    // recreate the encoder on the next one.
                                    warn!(compressor = index, "gzip write: {err}");
                                    flush_timer = None;
                                    batch_read_count = 0;
                                    batch_read_bytes = 0;
                                    encoder = None;
                                    #[allow(clippy::expect_used)]
                                    {
                                        shared.stats.lock().expect("lock poisoned")[index]
                                            .write_error_count += 1;
                                    }
                                }
                            }
                            do_send = batch_read_bytes >= read_byte_limit;
                        }
                        Err(_) => {
                            open = false;
                            do_send = batch_read_bytes > 0;
                        }
                    }
                }
                _ = async { flush_timer.as_mut().unwrap().as_mut().await }, if flush_timer.is_some() => {
                    do_send = true;
                    timeout_flush = true;
                    flush_timer = None;
                }
            }
        }

        if do_send && batch_read_count > 0 {
            flush_timer = None;
            let Some(active) = encoder.take() else {
                batch_read_count = 0;
                batch_read_bytes = 0;
                continue;
            };
            match active.finish() {
                Ok(gz_out) => {
                    let mut sent_bytes = gz_out.len() as u64;
                    let mut send_errors = 0u64;
                    if gz_out.len() >= COMPRESSED_BATCH_MIN_SIZE_FOR_CF {
                        let batch_cf = batch_read_bytes as f64 / gz_out.len() as f64;
                        estimated_cf = (1. - COMPRESSION_FACTOR_EXP_DECAY_ALPHA) * batch_cf
                            + COMPRESSION_FACTOR_EXP_DECAY_ALPHA * estimated_cf;
                        read_byte_limit = (batch_target_size as f64 * estimated_cf) as u64;
                    }

                    if let Err(err) = sender.send_buffer(Bytes::from(gz_out), None, true).await {
                        warn!(compressor = index, "{err}, batch discarded");
                        sent_bytes = 0;
                        send_errors = 1;
                    }

                    #[allow(clippy::expect_used)]
                    {
                        let mut stats = shared.stats.lock().expect("lock poisoned");
                        let stats = &mut stats[index];
                        stats.read_count += batch_read_count;
                        stats.read_byte_count += batch_read_bytes;
                        stats.send_count += 1;
                        stats.send_byte_count += sent_bytes;
                        stats.timeout_flush_count += timeout_flush as u64;
                        stats.send_error_count += send_errors;
                        stats.compression_factor = estimated_cf;
                    }
                }
                Err(err) => {
                    warn!(compressor = index, "gzip finish: {err}");
                    #[allow(clippy::expect_used)]
                    {
                        shared.stats.lock().expect("lock poisoned")[index].write_error_count += 1;
                    }
                }
            }
            batch_read_count = 0;
            batch_read_bytes = 0;
        }
    }
    info!(compressor = index, "compressor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{gunzip, CapturingSender};

    fn test_pool(cfg: CompressorPoolConfig) -> (Arc<CompressorPool>, Arc<CapturingSender>) {
        let pool = Arc::new(CompressorPool::new(&cfg).unwrap());
        let sender = Arc::new(CapturingSender::new());
        pool.start(Arc::clone(&sender) as Arc<dyn BatchSender>);
        (pool, sender)
    }

    #[tokio::test]
    async fn test_batch_flushed_on_shutdown() {
        let (pool, sender) = test_pool(CompressorPoolConfig {
            num_compressors: 1,
            flush_interval_secs: 0.,
            ..Default::default()
        });

        pool.queue_buf(b"line one 1 1000\n".to_vec()).await;
        pool.queue_buf(b"line two 2 1000\n".to_vec()).await;
        pool.shutdown().await;

        let batches = sender.batches();
        assert_eq!(batches.len(), 1);
        assert!(batches[0].gzipped);
        assert_eq!(
            gunzip(&batches[0].body),
            b"line one 1 1000\nline two 2 1000\n"
        );

        let mut stats = CompressorPoolStats::new();
        pool.snap_stats(&mut stats);
        assert_eq!(stats[0].read_count, 2);
        assert_eq!(stats[0].read_byte_count, 32);
        assert_eq!(stats[0].send_count, 1);
        assert_eq!(stats[0].timeout_flush_count, 0);
    }

    #[tokio::test]
    async fn test_timeout_flush() {
        let (pool, sender) = test_pool(CompressorPoolConfig {
            num_compressors: 1,
            flush_interval_secs: 0.05,
            ..Default::default()
        });

        pool.queue_buf(b"solitary line 1 1000\n".to_vec()).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let batches = sender.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(gunzip(&batches[0].body), b"solitary line 1 1000\n");

        let mut stats = CompressorPoolStats::new();
        pool.snap_stats(&mut stats);
        assert_eq!(stats[0].timeout_flush_count, 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_size_triggered_flush_updates_compression_factor() {
        let (pool, sender) = test_pool(CompressorPoolConfig {
            num_compressors: 1,
            batch_target_size: 256,
            flush_interval_secs: 0.,
            ..Default::default()
        });

        // Random-ish payload compresses poorly, so the projected limit
        // (target * CF = 512 raw bytes) is hit quickly.
        let mut line = Vec::new();
        for i in 0..64u32 {
            line.extend_from_slice(
                format!("m{i} {} 1000\n", i.wrapping_mul(2654435761) % 997).as_bytes(),
            );
        }
        for _ in 0..4 {
            pool.queue_buf(line.clone()).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        pool.shutdown().await;

        assert!(!sender.batches().is_empty());
        let mut stats = CompressorPoolStats::new();
        pool.snap_stats(&mut stats);
        assert!(stats[0].send_count >= 1);
        // CF was refreshed away from the initial estimate.
        assert!(stats[0].compression_factor > 0.);
    }

    #[tokio::test]
    async fn test_send_error_discards_batch() {
        let pool = Arc::new(
            CompressorPool::new(&CompressorPoolConfig {
                num_compressors: 1,
                flush_interval_secs: 0.,
                ..Default::default()
            })
            .unwrap(),
        );
        let sender = Arc::new(CapturingSender::failing());
        pool.start(Arc::clone(&sender) as Arc<dyn BatchSender>);

        pool.queue_buf(b"doomed 1 1000\n".to_vec()).await;
        pool.shutdown().await;

        let mut stats = CompressorPoolStats::new();
        pool.snap_stats(&mut stats);
        assert_eq!(stats[0].send_error_count, 1);
        assert_eq!(stats[0].send_byte_count, 0);
        assert_eq!(stats[0].send_count, 1);
    }

    #[tokio::test]
    async fn test_each_line_sent_exactly_once() {
        let (pool, sender) = test_pool(CompressorPoolConfig {
            num_compressors: 1,
            batch_target_size: 1024,
            flush_interval_secs: 0.5,
            ..Default::default()
        });

        let mut want = Vec::new();
        for i in 0..15 {
            let line = format!("distinct_line_{i} {i} 1000\n");
            want.push(line.clone());
            pool.queue_buf(line.into_bytes()).await;
        }
        tokio::time::sleep(Duration::from_millis(900)).await;
        pool.shutdown().await;

        let mut inflated = Vec::new();
        for batch in sender.batches() {
            inflated.extend_from_slice(&gunzip(&batch.body));
        }
        let inflated = String::from_utf8(inflated).unwrap();
        for line in want {
            assert_eq!(
                inflated.matches(&line).count(),
                1,
                "line {line:?} not seen exactly once"
            );
        }
        pool.shutdown().await;
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(CompressorPool::new(&CompressorPoolConfig {
            compression_level: 10,
            ..Default::default()
        })
        .is_err());
        assert!(CompressorPool::new(&CompressorPoolConfig {
            batch_target_size: 0,
            ..Default::default()
        })
        .is_err());
    }
}
