//! Network strategy: one HTTP GET per transfer, with redirect
//! interception, retry classification, and the cache tee.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use humansize::{format_size, BINARY};
use reqwest::{header, StatusCode};
use tracing::{debug, info, warn};

use crate::buffer::ByteStream;
use crate::error::FetchError;
use crate::meta::{canonical_reason, CacheMetadata};
use crate::state::FetchState;
use crate::store::CacheStore;
use crate::strategy::{Body, FetchStrategy, Opened, Restart, StrategyOutcome};

/// Strategy that downloads remote addresses, teeing bytes into the
/// cache mirror as they stream to the caller.
pub(crate) struct RemoteFetch {
    store: Arc<CacheStore>,
}

impl RemoteFetch {
    pub fn new(store: Arc<CacheStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl FetchStrategy for RemoteFetch {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn fetch(&self, state: &mut FetchState) -> Result<StrategyOutcome, FetchError> {
        if !state.address.is_remote() {
            return Ok(StrategyOutcome::Skip);
        }
        if !state.options.allow_remote {
            return Err(FetchError::AccessDenied("remote access is not permitted"));
        }
        RemoteTransfer::new(self.store.clone()).run(state).await
    }
}

/// One HTTP GET attempt against the state's current address.
struct RemoteTransfer {
    store: Arc<CacheStore>,
}

impl RemoteTransfer {
    fn new(store: Arc<CacheStore>) -> Self {
        Self { store }
    }

    async fn run(&self, state: &mut FetchState) -> Result<StrategyOutcome, FetchError> {
        let url = state
            .address
            .url()
            .cloned()
            .ok_or_else(|| FetchError::Address(format!("unfetchable uri {}", state.address.raw())))?;
        let url = state.options.apply_rewrite(url);
        let offset = state.resume_offset();

        let client = state.client()?.clone();
        let mut request = client.get(url.clone());
        if let Some((user, pass)) = state.options.basic_auth() {
            let (user, pass) = (user.to_string(), pass.to_string());
            request = request.basic_auth(user, Some(pass));
        }
        if offset > 0 {
            request = request.header(header::RANGE, format!("bytes={offset}-"));
        }

        debug!(url = %url, offset, "starting transfer");
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                let err = FetchError::from(e);
                if err.is_transient() {
                    warn!(url = %url, error = %err, "transient network failure");
                    return Ok(StrategyOutcome::Restart(Restart::later(
                        state.next_retry_delay(),
                        err,
                    )));
                }
                return Err(err);
            }
        };

        let status = response.status();

        if status.is_redirection() {
            if let Some(location) = response
                .headers()
                .get(header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
            {
                if state.redirects_remaining == 0 {
                    return Err(FetchError::too_many_redirects(status.as_u16()));
                }
                state.redirects_remaining -= 1;

                info!(url = %url, status = status.as_u16(), location = %location, "following redirect");
                let snapshot = CacheMetadata::from_response(status, response.headers());
                state.address.redirect(&location, false, Some(snapshot));
                // Restart so the new URL is checked against the cache
                // before any network request goes out.
                return Ok(StrategyOutcome::Restart(Restart::now()));
            }
        }

        if status.is_server_error() {
            let err = FetchError::Cached {
                status: status.as_u16(),
                message: canonical_reason(status),
                headers: CacheMetadata::from_response(status, response.headers()).public_headers(),
            };
            warn!(url = %url, status = status.as_u16(), "server error, scheduling retry");
            return Ok(StrategyOutcome::Restart(Restart::later(
                state.next_retry_delay(),
                err,
            )));
        }

        if !status.is_success() {
            let meta = CacheMetadata::from_response(status, response.headers());
            if state.options.allow_cache_write {
                if let Some(key) = state.address.cache_key() {
                    // Persist the failure so future fetches short-circuit
                    // without touching the network.
                    if let Err(e) = self.store.write_sidecar(key, &meta).await {
                        warn!(key, error = %e, "failed to persist error sidecar");
                    }
                }
            }
            return Err(FetchError::Cached {
                status: status.as_u16(),
                message: meta.reason(),
                headers: meta.public_headers(),
            });
        }

        if let Some(len) = response.content_length() {
            info!(url = %url, size = %format_size(len, BINARY), "transfer opened");
        } else {
            debug!(url = %url, "transfer opened, length unknown");
        }

        let meta = CacheMetadata::from_response(status, response.headers());
        let mut writer = None;
        if state.options.allow_cache_write {
            if let Some(key) = state.address.cache_key().map(str::to_string) {
                if offset == 0 {
                    if let Err(e) = self.store.write_sidecar(&key, &meta).await {
                        warn!(key = %key, error = %e, "failed to write sidecar");
                    }
                    self.store.write_redirect_history(&state.address).await;
                }
                match self.store.create_part(&key, offset).await {
                    Ok(part) => writer = Some(part),
                    Err(e) => warn!(key = %key, error = %e, "cache body will not be written"),
                }
            }
        }

        let stream: ByteStream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(FetchError::from))
            .boxed();
        // A 200 answer to a ranged request means the origin ignored the
        // range; drop the bytes the consumer already has.
        let stream = if offset > 0 && status == StatusCode::OK {
            skip_bytes(stream, offset)
        } else {
            stream
        };

        Ok(StrategyOutcome::Open(Opened {
            status: status.as_u16(),
            message: canonical_reason(status),
            headers: meta.public_headers(),
            body: Body::Remote { stream, writer },
        }))
    }
}

/// Discard the first `skip` bytes of a stream, passing errors through.
fn skip_bytes(stream: ByteStream, mut skip: u64) -> ByteStream {
    stream
        .filter_map(move |item| {
            let mapped = match item {
                Ok(mut chunk) => {
                    if skip == 0 {
                        Some(Ok(chunk))
                    } else if (chunk.len() as u64) <= skip {
                        skip -= chunk.len() as u64;
                        None
                    } else {
                        let rest = chunk.split_off(skip as usize);
                        skip = 0;
                        Some(Ok(rest))
                    }
                }
                Err(e) => Some(Err(e)),
            };
            futures::future::ready(mapped)
        })
        .boxed()
}
