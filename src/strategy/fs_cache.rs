//! Cache-read strategy: resolves sidecar chains and serves bodies from
//! the mirror.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::FetchError;
use crate::meta::CacheMetadata;
use crate::state::FetchState;
use crate::store::CacheStore;
use crate::strategy::{Body, FetchStrategy, Opened, StrategyOutcome};

/// Strategy that serves cacheable addresses from the filesystem mirror.
pub(crate) struct FileSystemCache {
    store: Arc<CacheStore>,
}

impl FileSystemCache {
    pub fn new(store: Arc<CacheStore>) -> Self {
        Self { store }
    }

    /// Walk the cached sidecar chain from the state's address.
    ///
    /// Cached 3xx entries mutate the address toward their target, each
    /// hop spending redirect budget; a cached failure status is
    /// authoritative and raised as [`FetchError::Cached`]. Returns the
    /// metadata of the final entry (defaults when no sidecar exists).
    async fn resolve_chain(&self, state: &mut FetchState) -> Result<CacheMetadata, FetchError> {
        loop {
            let key = state
                .address
                .cache_key()
                .ok_or_else(|| {
                    FetchError::Address(format!("{} has no cache key", state.address.raw()))
                })?
                .to_string();

            let meta = self.store.read_sidecar(&key).await?.unwrap_or_default();

            if meta.is_redirect() {
                let target = meta.target.clone().expect("redirect entries carry a target");
                if state.redirects_remaining == 0 {
                    return Err(FetchError::too_many_redirects(meta.status_code()));
                }
                state.redirects_remaining -= 1;
                debug!(from = %key, to = %target, "following cached redirect");
                state.address.redirect(&target, false, Some(meta));
                continue;
            }

            if meta.status_code() >= 400 {
                return Err(FetchError::Cached {
                    status: meta.status_code(),
                    message: meta.reason(),
                    headers: meta.public_headers(),
                });
            }

            return Ok(meta);
        }
    }
}

#[async_trait]
impl FetchStrategy for FileSystemCache {
    fn name(&self) -> &'static str {
        "cache"
    }

    async fn fetch(&self, state: &mut FetchState) -> Result<StrategyOutcome, FetchError> {
        // Local files are never cached; urns and explicit keys are.
        if state.address.is_local() || state.address.cache_key().is_none() {
            return Ok(StrategyOutcome::Skip);
        }
        if !state.options.allow_cache_read {
            return Ok(StrategyOutcome::Skip);
        }

        let meta = self.resolve_chain(state).await?;
        let key = state
            .address
            .cache_key()
            .expect("resolve_chain requires a cache key")
            .to_string();

        let offset = state.resume_offset();
        let file = self.store.open_body(&key, offset).await?;
        info!(key = %key, status = meta.status_code(), offset, "cache hit");

        Ok(StrategyOutcome::Open(Opened {
            status: meta.status_code(),
            message: meta.reason(),
            headers: meta.public_headers(),
            body: Body::from_file(file),
        }))
    }
}
