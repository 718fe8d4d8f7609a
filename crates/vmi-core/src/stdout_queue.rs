// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Debugging substitute for the compressor pool: queued buffers are printed
//! to stdout instead of being compressed and sent to import endpoints.
//! Selected with --use-stdout-metrics-queue.

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::buf_pool::BufferPool;
use crate::compressor_pool::CompressorPoolConfig;
use crate::generator::BufferQueue;

pub struct StdoutMetricsQueue {
    buf_pool: BufferPool,
    batch_target_size: usize,
}

impl StdoutMetricsQueue {
    pub fn new(cfg: &CompressorPoolConfig) -> Self {
        StdoutMetricsQueue {
            buf_pool: BufferPool::new(cfg.buffer_pool_max_size),
            batch_target_size: cfg.batch_target_size,
        }
    }
}

#[async_trait]
impl BufferQueue for StdoutMetricsQueue {
    fn get_buf(&self) -> Vec<u8> {
        self.buf_pool.get()
    }

    fn return_buf(&self, buf: Vec<u8>) {
        self.buf_pool.put(buf);
    }

    async fn queue_buf(&self, buf: Vec<u8>) {
        let mut stdout = tokio::io::stdout();
        if let Err(err) = stdout.write_all(&buf).await {
            warn!("stdout metrics queue: {err}");
        }
        let _ = stdout.flush().await;
        self.buf_pool.put(buf);
    }

    fn target_size(&self) -> usize {
        self.batch_target_size
    }
}
