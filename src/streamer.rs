#![forbid(unsafe_code)]

//! Relays the bytes behind a direct media URL.
//!
//! The upstream body is re-framed through [`StreamReader`]/[`ReaderStream`]
//! so every chunk handed to the HTTP layer is at most `chunk_size` bytes.
//! Nothing is read ahead: the next chunk is only pulled from the socket when
//! the consumer polls, and dropping the stream drops the upstream response.

use std::{io, pin::Pin, time::Duration};

use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use reqwest::{
    StatusCode,
    header::{self, HeaderMap, HeaderValue},
    redirect::Policy,
};
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, warn};

use crate::error::StreamError;

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Bytes, StreamError>> + Send>>;

const MAX_REDIRECTS: usize = 10;

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub chunk_size: usize,
    pub timeout: Duration,
    pub user_agent: String,
}

/// Per-request knobs: byte range to forward and the page the media belongs
/// to (sent as `Referer` for hosts with hot-link protection).
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub range: Option<HeaderValue>,
    pub referer: Option<String>,
}

/// Upstream response head plus the lazily pulled body.
pub struct UpstreamBody {
    pub status: StatusCode,
    pub content_length: Option<u64>,
    pub content_type: Option<HeaderValue>,
    pub content_range: Option<HeaderValue>,
    pub accept_ranges: Option<HeaderValue>,
    pub chunks: ChunkStream,
}

pub struct Streamer {
    client: reqwest::Client,
    chunk_size: usize,
}

impl Streamer {
    pub fn new(config: StreamConfig) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent)
            .redirect(Policy::limited(MAX_REDIRECTS))
            .connect_timeout(Duration::from_secs(15))
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            client,
            chunk_size: config.chunk_size.max(1),
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub async fn open(&self, direct_url: &str, options: &FetchOptions) -> Result<UpstreamBody, StreamError> {
        let mut request = self.client.get(direct_url);
        if let Some(range) = &options.range {
            request = request.header(header::RANGE, range.clone());
        }
        if let Some(referer) = &options.referer {
            request = request.header(header::REFERER, referer.as_str());
        }

        let response = request.send().await?;
        let status = response.status();
        if status.as_u16() >= 400 {
            warn!(status = status.as_u16(), "upstream rejected media request");
            return Err(StreamError::UpstreamStatus(status.as_u16()));
        }

        let headers = response.headers();
        let content_length = content_length(headers);
        let content_type = headers.get(header::CONTENT_TYPE).cloned();
        let content_range = headers.get(header::CONTENT_RANGE).cloned();
        let accept_ranges = headers.get(header::ACCEPT_RANGES).cloned();
        debug!(status = status.as_u16(), ?content_length, "upstream stream opened");

        let bytes = response.bytes_stream().map_err(io::Error::other);
        let chunks = rechunk(bytes, self.chunk_size);

        Ok(UpstreamBody {
            status,
            content_length,
            content_type,
            content_range,
            accept_ranges,
            chunks,
        })
    }
}

/// Re-frames any byte stream into chunks of at most `chunk_size` bytes.
pub fn rechunk<S>(source: S, chunk_size: usize) -> ChunkStream
where
    S: Stream<Item = io::Result<Bytes>> + Send + 'static,
{
    let reader = StreamReader::new(source);
    ReaderStream::with_capacity(reader, chunk_size)
        .map(|chunk| chunk.map_err(StreamError::Transfer))
        .boxed()
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}
