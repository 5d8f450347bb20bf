//! The pluggable fetch pipeline: each strategy either skips an address,
//! opens a stream, asks for the pipeline to restart, or fails.

mod fs_cache;
mod local;
mod remote;

pub(crate) use fs_cache::FileSystemCache;
pub(crate) use local::LocalFetch;
pub(crate) use remote::RemoteFetch;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio_util::io::ReaderStream;

use crate::buffer::ByteStream;
use crate::error::FetchError;
use crate::state::FetchState;
use crate::store::PartFile;

/// Read size for cached and local body files.
const FILE_CHUNK_SIZE: usize = 64 * 1024;

/// What one strategy attempt decided.
pub(crate) enum StrategyOutcome {
    /// The strategy does not apply to this address; try the next one.
    Skip,
    /// A stream has been opened; the attempt is settled.
    Open(Opened),
    /// Re-run the pipeline from the first strategy.
    Restart(Restart),
}

/// A pipeline restart request, returned instead of mutating shared
/// pipeline state.
pub(crate) struct Restart {
    /// How long to wait before the next pass.
    pub delay: Duration,
    /// Whether this restart consumes one unit of retry budget.
    pub charge: bool,
    /// Error to surface if the budget turns out to be exhausted.
    pub error: Option<FetchError>,
}

impl Restart {
    /// Immediate restart that spends no budget (redirects).
    pub fn now() -> Self {
        Self {
            delay: Duration::ZERO,
            charge: false,
            error: None,
        }
    }

    /// Backoff restart that spends one retry (5xx, transient network).
    pub fn later(delay: Duration, error: FetchError) -> Self {
        Self {
            delay,
            charge: true,
            error: Some(error),
        }
    }
}

/// An opened response: status line, public headers, and the byte source
/// the driver will pump.
pub(crate) struct Opened {
    pub status: u16,
    pub message: String,
    pub headers: BTreeMap<String, String>,
    pub body: Body,
}

/// Where the bytes of an opened response come from.
pub(crate) enum Body {
    /// A cached or local file, already positioned at the resume offset.
    File(ByteStream),
    /// A live HTTP body, optionally teed into a cache part file.
    Remote {
        stream: ByteStream,
        writer: Option<PartFile>,
    },
}

impl Body {
    pub fn from_file(file: tokio::fs::File) -> Self {
        let stream = ReaderStream::with_capacity(file, FILE_CHUNK_SIZE)
            .map(|chunk| chunk.map_err(FetchError::from))
            .boxed();
        Body::File(stream)
    }

    pub async fn next_chunk(&mut self) -> Option<Result<Bytes, FetchError>> {
        match self {
            Body::File(stream) => stream.next().await,
            Body::Remote { stream, .. } => stream.next().await,
        }
    }

    pub fn writer_mut(&mut self) -> Option<&mut Option<PartFile>> {
        match self {
            Body::Remote { writer, .. } => Some(writer),
            Body::File(_) => None,
        }
    }

    /// Detach the cache writer, if any, so it can be parked or
    /// discarded.
    pub fn take_writer(&mut self) -> Option<PartFile> {
        match self {
            Body::Remote { writer, .. } => writer.take(),
            Body::File(_) => None,
        }
    }
}

/// A handler in the ordered fetch pipeline.
#[async_trait]
pub(crate) trait FetchStrategy: Send + Sync {
    /// Name used in pipeline logs.
    fn name(&self) -> &'static str;

    /// Attempt to serve the state's address.
    async fn fetch(&self, state: &mut FetchState) -> Result<StrategyOutcome, FetchError>;
}
