//! The cache orchestrator: composes the strategy pipeline, bounds
//! concurrency, and keeps each transfer running after its stream opens.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::StreamExt;
use reqwest::Client;
use tokio::sync::{mpsc, Semaphore};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, instrument, warn};

use crate::address::Address;
use crate::buffer::BufferStream;
use crate::client::create_client;
use crate::config::{CacheOptions, FetchOptions};
use crate::error::FetchError;
use crate::meta::CacheMetadata;
use crate::result::{CacheResult, Control};
use crate::state::FetchState;
use crate::store::{CacheStore, StoreBody};
use crate::strategy::{
    Body, FetchStrategy, FileSystemCache, LocalFetch, Opened, RemoteFetch, StrategyOutcome,
};

/// A streaming fetch cache over one mirror directory.
///
/// Fetches run through an ordered strategy pipeline (local file, cache
/// read, remote download); whichever strategy opens a stream settles the
/// fetch, and the body keeps flowing to both the caller and the mirror
/// afterwards.
pub struct Cache {
    store: Arc<CacheStore>,
    strategies: Arc<Vec<Arc<dyn FetchStrategy>>>,
    limiter: Arc<Semaphore>,
    /// Shared HTTP client, built once so its connection pool survives
    /// across fetches.
    client: Client,
    options: CacheOptions,
}

impl Cache {
    /// Open a cache over `base` with default options.
    pub fn new(base: impl Into<PathBuf>) -> Result<Self, FetchError> {
        Self::with_options(base, CacheOptions::default())
    }

    pub fn with_options(
        base: impl Into<PathBuf>,
        options: CacheOptions,
    ) -> Result<Self, FetchError> {
        let client = create_client(&options.fetch)?;
        let store = Arc::new(CacheStore::new(base, options.index_name.clone()));
        let strategies: Vec<Arc<dyn FetchStrategy>> = vec![
            Arc::new(LocalFetch),
            Arc::new(FileSystemCache::new(store.clone())),
            Arc::new(RemoteFetch::new(store.clone())),
        ];
        let permits = options.concurrency.clamp(1, Semaphore::MAX_PERMITS);
        Ok(Self {
            store,
            strategies: Arc::new(strategies),
            limiter: Arc::new(Semaphore::new(permits)),
            client,
            options,
        })
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    pub fn base_path(&self) -> &Path {
        self.store.root()
    }

    /// Fetch `uri` with the cache's default options.
    pub async fn fetch(&self, uri: &str) -> Result<CacheResult, FetchError> {
        self.fetch_with(uri, self.options.fetch.clone()).await
    }

    /// Fetch `uri` with per-call options.
    ///
    /// Resolves once the stream is open (or no strategy could serve the
    /// address). A concurrency permit is held from pipeline entry until
    /// open; body transfer itself is not bounded.
    #[instrument(skip(self, options), level = "debug")]
    pub async fn fetch_with(
        &self,
        uri: &str,
        options: FetchOptions,
    ) -> Result<CacheResult, FetchError> {
        let base = options.base_url();
        let address = Address::parse(uri, base.as_ref(), options.cache_key.clone());
        let (buffer, rx) = BufferStream::channel();
        // Reuse the pooled client unless this call's options would build
        // a different one.
        let client = options
            .client_config_matches(&self.options.fetch)
            .then(|| self.client.clone());
        let mut state = FetchState::new(address, options, buffer, client);

        let opened = {
            let _permit = self
                .limiter
                .acquire()
                .await
                .expect("fetch limiter is never closed");
            run_pipeline(&self.strategies, &mut state).await?
        };
        let Opened {
            status,
            message,
            headers,
            body,
        } = opened;

        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let result = CacheResult::new(
            ReceiverStream::new(rx).boxed(),
            state.address.clone(),
            status,
            message,
            headers,
            ctrl_tx,
        );

        tokio::spawn(drive(
            state,
            self.strategies.clone(),
            self.limiter.clone(),
            body,
            ctrl_rx,
        ));

        Ok(result)
    }

    /// Store a body and/or sidecar metadata for `uri` directly.
    pub async fn store(
        &self,
        uri: &str,
        body: Option<StoreBody>,
        meta: Option<&CacheMetadata>,
    ) -> Result<(), FetchError> {
        let base = self.options.fetch.base_url();
        let address = Address::parse(uri, base.as_ref(), None);
        self.store.store(&address, body, meta).await
    }

    /// Store against an already-parsed address.
    pub async fn store_address(
        &self,
        address: &Address,
        body: Option<StoreBody>,
        meta: Option<&CacheMetadata>,
    ) -> Result<(), FetchError> {
        self.store.store(address, body, meta).await
    }
}

/// Run the strategy pipeline until a stream opens or every strategy has
/// refused.
///
/// A strategy error is remembered and the pipeline moves on, except for
/// cached HTTP failures, which are authoritative. A restart request
/// re-enters at the first strategy, spending retry budget when charged.
pub(crate) async fn run_pipeline(
    strategies: &[Arc<dyn FetchStrategy>],
    state: &mut FetchState,
) -> Result<Opened, FetchError> {
    let mut last_err: Option<FetchError> = None;
    'restart: loop {
        for strategy in strategies {
            match strategy.fetch(state).await {
                Ok(StrategyOutcome::Skip) => {}
                Ok(StrategyOutcome::Open(opened)) => {
                    debug!(strategy = strategy.name(), "stream opened");
                    return Ok(opened);
                }
                Ok(StrategyOutcome::Restart(restart)) => {
                    if restart.charge {
                        if state.retries_remaining == 0 {
                            return Err(restart
                                .error
                                .or_else(|| last_err.take())
                                .unwrap_or_else(|| not_handled(state)));
                        }
                        state.retries_remaining -= 1;
                    }
                    if let Some(err) = restart.error {
                        last_err = Some(err);
                    }
                    if !restart.delay.is_zero() {
                        debug!(
                            delay_ms = restart.delay.as_millis() as u64,
                            "pipeline restart after delay"
                        );
                        tokio::time::sleep(restart.delay).await;
                    }
                    continue 'restart;
                }
                Err(e) if e.is_cached() => return Err(e),
                Err(e) => {
                    debug!(strategy = strategy.name(), error = %e, "strategy failed");
                    last_err = Some(e);
                }
            }
        }
        return Err(last_err.take().unwrap_or_else(|| not_handled(state)));
    }
}

fn not_handled(state: &FetchState) -> FetchError {
    FetchError::NotHandled(state.address.raw().to_string())
}

/// Why one pumping pass ended.
enum PumpEnd {
    Done,
    Failed(FetchError),
    Retry,
    Abort,
    ConsumerGone,
}

/// Post-open owner of the fetch: pumps body bytes to the consumer and
/// the cache tee, and services retry/abort requests from the
/// [`CacheResult`].
async fn drive(
    mut state: FetchState,
    strategies: Arc<Vec<Arc<dyn FetchStrategy>>>,
    limiter: Arc<Semaphore>,
    mut body: Body,
    mut ctrl: mpsc::UnboundedReceiver<Control>,
) {
    loop {
        match pump(&mut state, &mut body, &mut ctrl).await {
            PumpEnd::Done => {
                if let Some(writer) = body.take_writer() {
                    match writer.commit().await {
                        Ok(path) => debug!(path = %path.display(), "cached body committed"),
                        Err(e) => warn!(error = %e, "failed to commit cached body"),
                    }
                }
                return;
            }
            PumpEnd::Failed(e) if e.is_transient() && state.retries_remaining > 0 => {
                state.retries_remaining -= 1;
                warn!(error = %e, "transient failure mid-stream, resuming");
                let delay = state.next_retry_delay();
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                match reopen(&mut state, &strategies, &limiter, &mut body).await {
                    Ok(()) => {}
                    Err(e) => {
                        state.buffer.fail(e).await;
                        return;
                    }
                }
            }
            PumpEnd::Failed(e) => {
                if let Some(writer) = body.take_writer() {
                    writer.discard().await;
                }
                state.buffer.fail(e).await;
                return;
            }
            PumpEnd::Retry => {
                if state.retries_remaining == 0 {
                    debug!("retry requested without remaining budget, ignoring");
                    continue;
                }
                state.retries_remaining -= 1;
                match reopen(&mut state, &strategies, &limiter, &mut body).await {
                    Ok(()) => {}
                    Err(e) => {
                        state.buffer.fail(e).await;
                        return;
                    }
                }
            }
            PumpEnd::Abort => {
                if let Some(writer) = body.take_writer() {
                    writer.discard().await;
                }
                state.buffer.fail(FetchError::Aborted).await;
                return;
            }
            PumpEnd::ConsumerGone => {
                if let Some(writer) = body.take_writer() {
                    writer.discard().await;
                }
                debug!("consumer dropped the stream, cancelling transfer");
                return;
            }
        }
    }
}

/// Forward body chunks until the body ends, fails, or a control message
/// arrives. Cache-write failures downgrade to an uncached transfer; the
/// consumer keeps streaming.
async fn pump(
    state: &mut FetchState,
    body: &mut Body,
    ctrl: &mut mpsc::UnboundedReceiver<Control>,
) -> PumpEnd {
    let mut ctrl_open = true;
    loop {
        let chunk = tokio::select! {
            msg = ctrl.recv(), if ctrl_open => match msg {
                Some(Control::Retry) => return PumpEnd::Retry,
                Some(Control::Abort) => return PumpEnd::Abort,
                // The result was dropped; completion is now decided by
                // the body itself (or by a failed send below).
                None => {
                    ctrl_open = false;
                    continue;
                }
            },
            chunk = body.next_chunk() => chunk,
        };

        let bytes = match chunk {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => return PumpEnd::Failed(e),
            None => return PumpEnd::Done,
        };

        if let Some(writer_slot) = body.writer_mut() {
            if let Some(writer) = writer_slot.as_mut() {
                if let Err(e) = writer.write(&bytes).await {
                    warn!(error = %e, "cache write failed, body will not be mirrored");
                    if let Some(writer) = writer_slot.take() {
                        writer.discard().await;
                    }
                }
            }
        }

        // Forward the chunk, staying responsive to abort/retry even
        // while the consumer backpressures the channel.
        loop {
            if !ctrl_open {
                if state.buffer.send(bytes).await.is_err() {
                    return PumpEnd::ConsumerGone;
                }
                break;
            }
            tokio::select! {
                sent = state.buffer.send(bytes.clone()) => {
                    if sent.is_err() {
                        return PumpEnd::ConsumerGone;
                    }
                    break;
                }
                msg = ctrl.recv() => match msg {
                    Some(Control::Retry) => return PumpEnd::Retry,
                    Some(Control::Abort) => return PumpEnd::Abort,
                    None => ctrl_open = false,
                },
            }
        }
    }
}

/// Re-run the pipeline for a resumed attempt and swap in the new body.
///
/// The old cache writer is parked first so a resumed remote attempt can
/// append to it; if the new attempt serves from somewhere else, the
/// stale part file is removed.
async fn reopen(
    state: &mut FetchState,
    strategies: &[Arc<dyn FetchStrategy>],
    limiter: &Semaphore,
    body: &mut Body,
) -> Result<(), FetchError> {
    let parked = match body.take_writer() {
        Some(writer) => match writer.park().await {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(error = %e, "failed to park cache writer");
                None
            }
        },
        None => None,
    };

    let reopened = {
        let _permit = limiter
            .acquire()
            .await
            .expect("fetch limiter is never closed");
        run_pipeline(strategies, state).await?
    };
    let new_body = reopened.body;

    if let Some(path) = parked {
        let resumed_tee = matches!(new_body, Body::Remote { writer: Some(_), .. });
        if !resumed_tee {
            let _ = tokio::fs::remove_file(&path).await;
        }
    }

    *body = new_body;
    Ok(())
}
