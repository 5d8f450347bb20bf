//! Mutable per-fetch context, owned by the pipeline until the stream
//! opens and by the driver task afterwards.

use std::time::Duration;

use reqwest::Client;

use crate::address::Address;
use crate::buffer::BufferStream;
use crate::client::create_client;
use crate::config::FetchOptions;
use crate::error::FetchError;

/// Context threaded through every strategy attempt of one fetch.
pub struct FetchState {
    /// Current address; mutated when a redirect is followed.
    pub address: Address,
    pub options: FetchOptions,
    /// The caller-facing byte channel, preserved across retries so a
    /// partially drained consumer resumes mid-sequence.
    pub buffer: BufferStream,
    /// Remaining retry budget.
    pub retries_remaining: u32,
    /// Remaining redirect budget, spent on live and cached redirects
    /// alike.
    pub redirects_remaining: u32,

    next_delay: Duration,
    client: Option<Client>,
}

impl FetchState {
    /// `client` is the cache's shared HTTP client when this fetch's
    /// options build the same one; a fetch with its own client-affecting
    /// options builds a private client on first use instead.
    pub fn new(
        address: Address,
        options: FetchOptions,
        buffer: BufferStream,
        client: Option<Client>,
    ) -> Self {
        let retries_remaining = options.retry_count;
        let redirects_remaining = options.redirect_count;
        let next_delay = options.retry_delay;
        Self {
            address,
            options,
            buffer,
            retries_remaining,
            redirects_remaining,
            next_delay,
            client,
        }
    }

    /// Byte offset the next attempt should resume from: everything
    /// before it has already been delivered to the consumer.
    pub fn resume_offset(&self) -> u64 {
        self.buffer.len()
    }

    /// Current backoff delay; each call grows the next one by the
    /// configured factor.
    pub fn next_retry_delay(&mut self) -> Duration {
        let delay = self.next_delay;
        let factor = self.options.retry_backoff_factor.max(1.0);
        self.next_delay = self.next_delay.mul_f64(factor);
        delay
    }

    /// The HTTP client for this fetch: the cache's shared one, or a
    /// private one built on first use when the options diverge.
    pub fn client(&mut self) -> Result<&Client, FetchError> {
        if self.client.is_none() {
            self.client = Some(create_client(&self.options)?);
        }
        Ok(self.client.as_ref().expect("client just initialized"))
    }
}
