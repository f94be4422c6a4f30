//! Payload fetchers.
//!
//! A fetcher produces the payload byte stream as bounded chunks, in strictly
//! increasing contiguous offset order. The download stage pulls chunks one
//! at a time, so writes and hashing stay ordered without locks; cancellation
//! lands between pulls.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use thiserror::Error;
use tracing::{debug, info};

/// Upper bound on the size of a single delivered chunk. The last chunk of a
/// transfer may be smaller; boundaries carry no meaning beyond that.
pub const CHUNK_MAX: usize = 64 * 1024;

/// One run of payload bytes at an absolute offset.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub offset: u64,
    pub data: Bytes,
}

impl Chunk {
    /// Absolute offset of the first byte past this chunk.
    pub fn end_offset(&self) -> u64 {
        self.offset + self.data.len() as u64
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("server returned status {0}")]
    Status(u16),
    #[error("transfer terminated")]
    Terminated,
}

/// Chunk source for one payload transfer.
///
/// `next_chunk` returning `Ok(None)` means the transfer completed
/// successfully. After `terminate` the fetcher has released its connection
/// and every further pull reports `FetchError::Terminated`.
#[async_trait]
pub trait PayloadFetcher: Send {
    /// Request a ranged transfer beginning at byte `offset`. Only honored
    /// before the first `next_chunk` call.
    fn set_offset(&mut self, offset: u64);

    async fn next_chunk(&mut self) -> Result<Option<Chunk>, FetchError>;

    async fn terminate(&mut self);
}

type BodyStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

enum HttpTransfer {
    Unstarted,
    Streaming(BodyStream),
    Drained,
    Terminated,
}

/// Streaming HTTP fetcher with resume support.
pub struct HttpFetcher {
    client: reqwest::Client,
    url: String,
    offset: u64,
    position: u64,
    carry: BytesMut,
    transfer: HttpTransfer,
}

impl HttpFetcher {
    pub fn new(url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300)) // 5 minute timeout for large payloads
            .connect_timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");

        Self::with_client(client, url)
    }

    pub fn with_client(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            offset: 0,
            position: 0,
            carry: BytesMut::new(),
            transfer: HttpTransfer::Unstarted,
        }
    }

    async fn begin(&mut self) -> Result<BodyStream, FetchError> {
        let mut request = self.client.get(&self.url);
        if self.offset > 0 {
            debug!(offset = self.offset, "Requesting ranged transfer");
            request = request.header("Range", format!("bytes={}-", self.offset));
        }

        let response = request
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let status = response.status();
        let ranged_ok = self.offset > 0 && status == reqwest::StatusCode::PARTIAL_CONTENT;
        let full_ok = self.offset == 0 && status.is_success();
        if !ranged_ok && !full_ok {
            return Err(FetchError::Status(status.as_u16()));
        }

        info!(url = %self.url, offset = self.offset, "Transfer started");
        self.position = self.offset;
        Ok(Box::pin(response.bytes_stream()))
    }

    fn emit(&mut self) -> Chunk {
        let take = self.carry.len().min(CHUNK_MAX);
        let data = self.carry.split_to(take).freeze();
        let chunk = Chunk { offset: self.position, data };
        self.position = chunk.end_offset();
        chunk
    }
}

#[async_trait]
impl PayloadFetcher for HttpFetcher {
    fn set_offset(&mut self, offset: u64) {
        if matches!(self.transfer, HttpTransfer::Unstarted) {
            self.offset = offset;
        }
    }

    async fn next_chunk(&mut self) -> Result<Option<Chunk>, FetchError> {
        if matches!(self.transfer, HttpTransfer::Terminated) {
            return Err(FetchError::Terminated);
        }

        if matches!(self.transfer, HttpTransfer::Unstarted) {
            let stream = self.begin().await?;
            self.transfer = HttpTransfer::Streaming(stream);
        }

        loop {
            if !self.carry.is_empty() {
                return Ok(Some(self.emit()));
            }

            let stream = match &mut self.transfer {
                HttpTransfer::Streaming(stream) => stream,
                HttpTransfer::Drained => return Ok(None),
                // Unreachable by construction; report rather than panic.
                _ => return Err(FetchError::Terminated),
            };

            match stream.next().await {
                Some(Ok(bytes)) => self.carry.extend_from_slice(&bytes),
                Some(Err(e)) => {
                    self.transfer = HttpTransfer::Drained;
                    return Err(FetchError::Transport(e.to_string()));
                }
                None => {
                    self.transfer = HttpTransfer::Drained;
                }
            }
        }
    }

    async fn terminate(&mut self) {
        // Dropping the body stream closes the connection.
        self.transfer = HttpTransfer::Terminated;
        self.carry.clear();
        debug!(url = %self.url, "Transfer terminated");
    }
}

/// In-memory fetcher for tests.
///
/// Delivers its buffer in `CHUNK_MAX`-sized chunks, yielding to the
/// scheduler between pulls so cancellation can interleave the way it does
/// against a real network peer.
pub struct MockPayloadFetcher {
    data: Vec<u8>,
    offset: u64,
    position: u64,
    started: bool,
    terminated: bool,
    fail_after_chunks: Option<usize>,
    chunks_sent: usize,
    chunk_delay: Option<Duration>,
}

impl MockPayloadFetcher {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            offset: 0,
            position: 0,
            started: false,
            terminated: false,
            fail_after_chunks: None,
            chunks_sent: 0,
            chunk_delay: None,
        }
    }

    /// Report a transport failure after `n` chunks have been delivered.
    pub fn fail_after_chunks(mut self, n: usize) -> Self {
        self.fail_after_chunks = Some(n);
        self
    }

    /// Pause before each chunk, approximating a slow network peer.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }
}

#[async_trait]
impl PayloadFetcher for MockPayloadFetcher {
    fn set_offset(&mut self, offset: u64) {
        if !self.started {
            self.offset = offset;
        }
    }

    async fn next_chunk(&mut self) -> Result<Option<Chunk>, FetchError> {
        match self.chunk_delay {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }

        if self.terminated {
            return Err(FetchError::Terminated);
        }
        if !self.started {
            self.started = true;
            self.position = self.offset.min(self.data.len() as u64);
        }
        if self.fail_after_chunks == Some(self.chunks_sent) {
            return Err(FetchError::Transport("injected transport failure".into()));
        }
        if self.position >= self.data.len() as u64 {
            return Ok(None);
        }

        let start = self.position as usize;
        let len = (self.data.len() - start).min(CHUNK_MAX);
        let chunk = Chunk {
            offset: self.position,
            data: Bytes::copy_from_slice(&self.data[start..start + len]),
        };
        self.position += len as u64;
        self.chunks_sent += 1;
        Ok(Some(chunk))
    }

    async fn terminate(&mut self) {
        self.terminated = true;
    }
}
