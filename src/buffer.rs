//! Pass-through byte plumbing between the transfer driver and the caller.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::Stream;
use tokio::sync::mpsc;

use crate::error::FetchError;

/// The byte stream handed to callers.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, FetchError>> + Send>>;

/// How many chunks may sit between producer and consumer before the
/// producer (and with it the cache writer) is backpressured.
const CHANNEL_CAPACITY: usize = 16;

/// Sending half of the caller-facing byte stream.
///
/// Forwards chunks unchanged and tracks the cumulative number of bytes
/// forwarded. The count is what lets a retried attempt resume at the
/// right offset: bytes the consumer has already been handed are never
/// produced twice.
#[derive(Debug, Clone)]
pub struct BufferStream {
    tx: mpsc::Sender<Result<Bytes, FetchError>>,
    len: Arc<AtomicU64>,
}

impl BufferStream {
    /// Create a buffer plus the receiver that becomes the caller's
    /// stream.
    pub(crate) fn channel() -> (Self, mpsc::Receiver<Result<Bytes, FetchError>>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        (
            Self {
                tx,
                len: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Forward one chunk to the consumer. Fails when the consumer has
    /// dropped its stream.
    pub(crate) async fn send(&self, chunk: Bytes) -> Result<(), ()> {
        let n = chunk.len() as u64;
        self.tx.send(Ok(chunk)).await.map_err(|_| ())?;
        self.len.fetch_add(n, Ordering::Relaxed);
        Ok(())
    }

    /// Deliver a terminal error on the stream.
    pub(crate) async fn fail(&self, err: FetchError) {
        let _ = self.tx.send(Err(err)).await;
    }

    /// Total bytes forwarded so far.
    pub fn len(&self) -> u64 {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
