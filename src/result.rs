//! The facade a successful fetch resolves to.

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::sync::mpsc;

use crate::address::Address;
use crate::buffer::ByteStream;
use crate::error::FetchError;

/// Messages from a [`CacheResult`] to the transfer driver.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Control {
    /// Restart the pipeline from the first strategy, resuming at the
    /// forwarded-byte offset.
    Retry,
    /// Terminate the transfer and reject the stream.
    Abort,
}

/// A successfully opened fetch: the byte stream plus response metadata.
///
/// The result observes the in-flight transfer but does not own it; the
/// driver task keeps running until the body ends, fails, or is aborted.
/// Dropping the result cancels the transfer.
impl std::fmt::Debug for CacheResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheResult")
            .field("address", &self.address)
            .field("status", &self.status)
            .field("message", &self.message)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

pub struct CacheResult {
    /// The response body. Bytes arrive in request order; a transfer
    /// error after open is delivered here as a stream item.
    pub stream: ByteStream,
    /// Final address after any redirects.
    pub address: Address,
    /// HTTP status (200 for local files and default sidecars).
    pub status: u16,
    /// Status reason phrase.
    pub message: String,
    /// Response headers with internal bookkeeping fields removed.
    pub headers: BTreeMap<String, String>,

    control: mpsc::UnboundedSender<Control>,
}

impl CacheResult {
    pub(crate) fn new(
        stream: ByteStream,
        address: Address,
        status: u16,
        message: String,
        headers: BTreeMap<String, String>,
        control: mpsc::UnboundedSender<Control>,
    ) -> Self {
        Self {
            stream,
            address,
            status,
            message,
            headers,
            control,
        }
    }

    /// Restart the fetch pipeline from the top, e.g. after detecting
    /// mid-stream corruption. Bytes already consumed are not re-sent;
    /// the transfer resumes at the current offset. A retry without
    /// remaining budget is a no-op.
    pub fn retry(&self) {
        let _ = self.control.send(Control::Retry);
    }

    /// Terminate the in-flight transfer. The stream yields
    /// [`FetchError::Aborted`] and ends.
    pub fn abort(&self) {
        let _ = self.control.send(Control::Abort);
    }

    /// Drain the stream into one buffer.
    pub async fn bytes(mut self) -> Result<Bytes, FetchError> {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.stream.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out.freeze())
    }

    /// Drain the stream and decode it as UTF-8, lossily.
    pub async fn text(self) -> Result<String, FetchError> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}
