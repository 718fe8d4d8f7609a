// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Whole-pipeline test: a periodic generator fills buffers, the compressor
//! pool batches them into gzip streams, the endpoint pool PUTs them against
//! a mock client, and the inflated bodies must carry every generated line
//! exactly once.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use vmi_core::compressor_pool::{BatchSender, CompressorPool, CompressorPoolConfig};
use vmi_core::generator::{BufferQueue, GeneratorBase, MetricsGenerator, VmiContext};
use vmi_core::http_endpoint_pool::{
    DoerResponse, HttpClientDoer, HttpEndpointConfig, HttpEndpointPool, HttpEndpointPoolConfig,
};
use vmi_core::scheduler::{Scheduler, SchedulerConfig, SchedulerStats, Task};
use vmi_core::testutils::{gunzip, MockClientDoer};

struct PipelineGenerator {
    base: GeneratorBase,
    invocation: usize,
    written_lines: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl MetricsGenerator for PipelineGenerator {
    fn id(&self) -> &str {
        &self.base.id
    }

    fn interval(&self) -> Duration {
        self.base.interval
    }

    async fn generate(&mut self) -> bool {
        let ts = self.base.now();
        let queue = Arc::clone(&self.base.metrics_queue);
        let mut buf = queue.get_buf();
        let (mut metrics_count, _) = self.base.metrics_start(&mut buf, ts);

        let line_start = buf.len();
        buf.extend_from_slice(
            format!("pipeline_metric_{:06} {}", self.invocation, self.invocation).as_bytes(),
        );
        buf.extend_from_slice(self.base.ts_suffix());
        metrics_count += 1;
        self.written_lines
            .lock()
            .unwrap()
            .push(String::from_utf8_lossy(&buf[line_start..]).to_string());
        self.invocation += 1;

        self.base
            .update_stats(metrics_count as u64, buf.len() as u64);
        queue.queue_buf(buf).await;
        self.base.advance_cycle();
        true
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pipeline_delivers_every_line_exactly_once() {
    // Endpoint pool against a mock client answering every request with 200:
    let mock = MockClientDoer::new(Duration::from_secs(30));
    let pool_cfg = HttpEndpointPoolConfig {
        endpoints: vec![HttpEndpointConfig {
            url: "http://host1".to_string(),
            mark_unhealthy_threshold: 1,
        }],
        healthy_rotate_interval_secs: -1.,
        ..Default::default()
    };
    let endpoint_pool =
        HttpEndpointPool::with_client_doer(&pool_cfg, Arc::clone(&mock) as Arc<dyn HttpClientDoer>)
            .unwrap();

    let received_bodies = Arc::new(Mutex::new(Vec::new()));
    let responder = {
        let mock = Arc::clone(&mock);
        let received_bodies = Arc::clone(&received_bodies);
        tokio::spawn(async move {
            while let Ok(request) = mock.get_request("http://host1").await {
                if let Some(body) = request.body {
                    received_bodies.lock().unwrap().push(body);
                }
                if mock
                    .send_response(
                        "http://host1",
                        Ok(DoerResponse {
                            status: StatusCode::OK,
                        }),
                    )
                    .await
                    .is_err()
                {
                    break;
                }
            }
        })
    };

    // Compressor pool feeding the endpoint pool:
    let compressor_pool = Arc::new(
        CompressorPool::new(&CompressorPoolConfig {
            num_compressors: 1,
            batch_target_size: 4 * 1024,
            flush_interval_secs: 0.2,
            ..Default::default()
        })
        .unwrap(),
    );
    compressor_pool.start(Arc::clone(&endpoint_pool) as Arc<dyn BatchSender>);

    // Scheduler driving one periodic generator:
    let ctx = VmiContext::new(
        "pipeline",
        "testhost",
        "0.0.0",
        "n/a",
        Arc::clone(&compressor_pool) as Arc<dyn BufferQueue>,
    );
    let written_lines = Arc::new(Mutex::new(Vec::new()));
    let generator = PipelineGenerator {
        base: GeneratorBase::new(&ctx, "pipeline_gen", Duration::from_millis(100), 0),
        invocation: 0,
        written_lines: Arc::clone(&written_lines),
    };

    let scheduler = Scheduler::new(&SchedulerConfig { num_workers: 2 });
    scheduler.start();
    scheduler
        .add_task(Task::from_generator(Box::new(generator)))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(650)).await;

    // Shutdown in reverse construction order; the compressor drains and
    // flushes whatever is still queued.
    scheduler.shutdown().await;
    let mut stats = SchedulerStats::new();
    scheduler.snap_stats(&mut stats);
    compressor_pool.shutdown().await;
    endpoint_pool.shutdown().await;
    mock.cancel();
    responder.await.unwrap();

    let written = written_lines.lock().unwrap().clone();
    assert!(written.len() >= 4, "generator barely ran: {}", written.len());
    assert_eq!(stats["pipeline_gen"].executed_count as usize, written.len());

    let mut inflated = String::new();
    for body in received_bodies.lock().unwrap().iter() {
        inflated.push_str(&String::from_utf8_lossy(&gunzip(body)));
    }
    for line in &written {
        assert_eq!(
            inflated.matches(line.as_str()).count(),
            1,
            "line {line:?} not delivered exactly once"
        );
    }
    // The per-generator dtime self-metric rode along from the second
    // invocation on:
    assert_eq!(
        inflated.matches("vmi_metrics_gen_dtime_sec").count(),
        written.len() - 1
    );
}
