// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Test doubles shared by the unit and integration suites: a playbook-driven
//! mock HTTP client, capture-only implementations of the sender and buffer
//! queue seams, and a gzip inflate helper.

use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{StatusCode, Url};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::compressor_pool::BatchSender;
use crate::generator::BufferQueue;
use crate::http_endpoint_pool::{
    DoerError, DoerRequest, DoerResponse, HttpClientDoer, SendBufferError,
};

/// Inflate a gzip body; panics on malformed input, which is what a test
/// wants.
pub fn gunzip(data: &[u8]) -> Vec<u8> {
    let mut decoder = flate2::read::GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).expect("invalid gzip body");
    out
}

#[derive(Debug, Error)]
pub enum MockClientError {
    #[error("mock client cancelled")]
    Cancelled,
    #[error("playbook error at entry {0}")]
    Playbook(usize),
}

/// One step of a playback: the endpoint expected to be hit next and either
/// the status to answer with or a transport error.
pub struct PlaybookEntry {
    pub url: &'static str,
    pub response: Result<StatusCode, &'static str>,
}

impl PlaybookEntry {
    pub fn ok(url: &'static str, status: u16) -> Self {
        PlaybookEntry {
            url,
            response: Ok(StatusCode::from_u16(status).expect("bad status")),
        }
    }

    pub fn transport_error(url: &'static str) -> Self {
        PlaybookEntry {
            url,
            response: Err("mock transport error"),
        }
    }
}

/// A request observed by the mock, body already drained (through the credit
/// reader when the payload was rate limited).
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

struct UrlChannels {
    req_tx: async_channel::Sender<RecordedRequest>,
    req_rx: async_channel::Receiver<RecordedRequest>,
    resp_tx: async_channel::Sender<Result<DoerResponse, DoerError>>,
    resp_rx: async_channel::Receiver<Result<DoerResponse, DoerError>>,
}

impl UrlChannels {
    fn new() -> Self {
        let (req_tx, req_rx) = async_channel::bounded(1);
        let (resp_tx, resp_rx) = async_channel::bounded(1);
        UrlChannels {
            req_tx,
            req_rx,
            resp_tx,
            resp_rx,
        }
    }
}

/// Mock [`HttpClientDoer`] pairing each executed request with a response
/// provided by the test, over rendezvous channels keyed by URL. The typical
/// use runs [`MockClientDoer::play`] concurrently with the code under test.
pub struct MockClientDoer {
    channels: Mutex<HashMap<String, Arc<UrlChannels>>>,
    cancel: CancellationToken,
}

impl MockClientDoer {
    /// The whole exchange is abandoned (and pending calls released) after
    /// `timeout`, so a deadlocked test fails instead of hanging.
    pub fn new(timeout: Duration) -> Arc<Self> {
        let mock = Arc::new(MockClientDoer {
            channels: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        });
        let cancel = mock.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            cancel.cancel();
        });
        mock
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    fn url_key(url: &str) -> String {
        Url::parse(url).map(|u| u.to_string()).unwrap_or_else(|_| url.to_string())
    }

    fn get_channels(&self, url: &str) -> Arc<UrlChannels> {
        let mut channels = self.channels.lock().expect("lock poisoned");
        Arc::clone(
            channels
                .entry(Self::url_key(url))
                .or_insert_with(|| Arc::new(UrlChannels::new())),
        )
    }

    /// Wait for the next request issued against `url`.
    pub async fn get_request(&self, url: &str) -> Result<RecordedRequest, MockClientError> {
        let channels = self.get_channels(url);
        tokio::select! {
            _ = self.cancel.cancelled() => Err(MockClientError::Cancelled),
            received = channels.req_rx.recv() => {
                received.map_err(|_| MockClientError::Cancelled)
            }
        }
    }

    /// Answer the pending (or next) request against `url`.
    pub async fn send_response(
        &self,
        url: &str,
        response: Result<DoerResponse, DoerError>,
    ) -> Result<(), MockClientError> {
        let channels = self.get_channels(url);
        tokio::select! {
            _ = self.cancel.cancelled() => Err(MockClientError::Cancelled),
            sent = channels.resp_tx.send(response) => {
                sent.map_err(|_| MockClientError::Cancelled)
            }
        }
    }

    /// Run a playbook to completion: for each entry, receive one request on
    /// the entry's URL and answer it. Returns the recorded requests in
    /// playbook order.
    pub async fn play(
        &self,
        playbook: &[PlaybookEntry],
    ) -> Result<Vec<RecordedRequest>, MockClientError> {
        let mut requests = Vec::with_capacity(playbook.len());
        for (index, entry) in playbook.iter().enumerate() {
            let request = self
                .get_request(entry.url)
                .await
                .map_err(|_| MockClientError::Playbook(index))?;
            let response = match entry.response {
                Ok(status) => Ok(DoerResponse { status }),
                Err(message) => Err(DoerError(message.to_string())),
            };
            self.send_response(entry.url, response)
                .await
                .map_err(|_| MockClientError::Playbook(index))?;
            requests.push(request);
        }
        Ok(requests)
    }
}

#[async_trait]
impl HttpClientDoer for MockClientDoer {
    async fn execute(&self, req: DoerRequest) -> Result<DoerResponse, DoerError> {
        let url = req.url.to_string();
        let body = match req.body {
            Some(payload) => Some(payload.collect().await),
            None => None,
        };
        let recorded = RecordedRequest {
            url: url.clone(),
            headers: req.headers,
            body,
        };
        let channels = self.get_channels(&url);
        tokio::select! {
            _ = self.cancel.cancelled() => {
                return Err(DoerError(format!("PUT {url}: mock cancelled")));
            }
            sent = channels.req_tx.send(recorded) => {
                if sent.is_err() {
                    return Err(DoerError(format!("PUT {url}: mock cancelled")));
                }
            }
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(DoerError(format!("PUT {url}: mock cancelled"))),
            received = channels.resp_rx.recv() => match received {
                Ok(response) => response,
                Err(_) => Err(DoerError(format!("PUT {url}: mock cancelled"))),
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct SentBatch {
    pub body: Bytes,
    pub gzipped: bool,
}

/// [`BatchSender`] that records every batch (optionally failing them all),
/// for compressor tests.
pub struct CapturingSender {
    batches: Mutex<Vec<SentBatch>>,
    fail: bool,
}

impl CapturingSender {
    pub fn new() -> Self {
        CapturingSender {
            batches: Mutex::new(Vec::new()),
            fail: false,
        }
    }

    /// A sender whose send_buffer always reports no healthy endpoint.
    pub fn failing() -> Self {
        CapturingSender {
            batches: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn batches(&self) -> Vec<SentBatch> {
        self.batches.lock().expect("lock poisoned").clone()
    }
}

impl Default for CapturingSender {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BatchSender for CapturingSender {
    async fn send_buffer(
        &self,
        body: Bytes,
        _timeout: Option<Duration>,
        gzipped: bool,
    ) -> Result<(), SendBufferError> {
        if self.fail {
            return Err(SendBufferError::NoHealthyEndpoint);
        }
        self.batches
            .lock()
            .expect("lock poisoned")
            .push(SentBatch { body, gzipped });
        Ok(())
    }
}

/// [`BufferQueue`] that captures queued buffers, for generator tests.
pub struct TestBufferQueue {
    queued: Mutex<Vec<Vec<u8>>>,
    target_size: usize,
}

impl TestBufferQueue {
    pub fn new() -> Self {
        Self::with_target_size(64 * 1024)
    }

    pub fn with_target_size(target_size: usize) -> Self {
        TestBufferQueue {
            queued: Mutex::new(Vec::new()),
            target_size,
        }
    }

    pub fn queued(&self) -> Vec<Vec<u8>> {
        self.queued.lock().expect("lock poisoned").clone()
    }

    /// All queued buffers concatenated into one string.
    pub fn queued_text(&self) -> String {
        let mut out = String::new();
        for buf in self.queued.lock().expect("lock poisoned").iter() {
            out.push_str(&String::from_utf8_lossy(buf));
        }
        out
    }

    pub fn clear(&self) {
        self.queued.lock().expect("lock poisoned").clear();
    }
}

impl Default for TestBufferQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BufferQueue for TestBufferQueue {
    fn get_buf(&self) -> Vec<u8> {
        Vec::new()
    }

    fn return_buf(&self, _buf: Vec<u8>) {}

    async fn queue_buf(&self, buf: Vec<u8>) {
        self.queued.lock().expect("lock poisoned").push(buf);
    }

    fn target_size(&self) -> usize {
        self.target_size
    }
}
