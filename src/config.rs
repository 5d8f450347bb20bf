//! Cache-level and per-fetch configuration.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};
use url::Url;

use crate::builder::FetchOptionsBuilder;
use crate::proxy::ProxyConfig;

const DEFAULT_USER_AGENT: &str = concat!("cget/", env!("CARGO_PKG_VERSION"));

/// URL rewrite hook, re-applied on every followed redirect.
pub type RewriteFn = Arc<dyn Fn(Url) -> Url + Send + Sync>;

/// Options for the underlying HTTP client, applied when a fetch first
/// needs the network.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestConfig {
    /// User agent string
    pub user_agent: String,

    /// Custom HTTP headers sent with every request
    pub headers: HeaderMap,

    /// Proxy configuration (optional)
    pub proxy: Option<ProxyConfig>,

    /// Whether to use system proxy settings if available
    pub use_system_proxy: bool,

    pub danger_accept_invalid_certs: bool,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: RequestConfig::get_default_headers(),
            proxy: None,
            use_system_proxy: true,
            danger_accept_invalid_certs: false,
        }
    }
}

impl RequestConfig {
    pub fn get_default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();

        default_headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );

        default_headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_static("*/*"),
        );

        // No Accept-Encoding here: a pinned value would switch off the
        // client's transparent gzip decoding.
        default_headers
    }
}

/// Per-fetch options. The cache holds a default set; a call-site set
/// replaces it wholesale for that fetch.
#[derive(Clone)]
pub struct FetchOptions {
    /// Serve `file://` and relative-path addresses from disk.
    pub allow_local: bool,
    /// Go to the network for remote addresses.
    pub allow_remote: bool,
    /// Consult the cache mirror before the network.
    pub allow_cache_read: bool,
    /// Write fetched bodies and sidecars into the mirror.
    pub allow_cache_write: bool,

    /// Rewrite every requested URL, including each followed redirect.
    pub rewrite: Option<RewriteFn>,

    /// Basic auth, sent only when both parts are present.
    pub username: Option<String>,
    pub password: Option<String>,

    /// Overall request timeout. Zero means none.
    pub timeout: Duration,

    /// Base directory for resolving relative URIs. Defaults to the
    /// process working directory.
    pub cwd: Option<PathBuf>,

    /// Overrides scheme-derived cache-key derivation and is preserved
    /// across redirects.
    pub cache_key: Option<String>,

    /// Underlying HTTP client options.
    pub request: RequestConfig,

    /// How many times a failed attempt may re-enter the pipeline.
    pub retry_count: u32,
    /// Delay before the first retry.
    pub retry_delay: Duration,
    /// Multiplier applied to the delay after each retry.
    pub retry_backoff_factor: f64,

    /// Redirect budget, spent on both live 3xx responses and cached
    /// redirect entries.
    pub redirect_count: u32,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            allow_local: false,
            allow_remote: true,
            allow_cache_read: true,
            allow_cache_write: true,
            rewrite: None,
            username: None,
            password: None,
            timeout: Duration::ZERO,
            cwd: None,
            cache_key: None,
            request: RequestConfig::default(),
            retry_count: 0,
            retry_delay: Duration::from_millis(500),
            retry_backoff_factor: 2.0,
            redirect_count: 10,
        }
    }
}

impl FetchOptions {
    pub fn builder() -> FetchOptionsBuilder {
        FetchOptionsBuilder::new()
    }

    /// Base URL for resolving relative URIs: the configured working
    /// directory, falling back to the process one.
    pub(crate) fn base_url(&self) -> Option<Url> {
        self.cwd
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .and_then(|dir| Url::from_directory_path(dir).ok())
    }

    pub(crate) fn apply_rewrite(&self, url: Url) -> Url {
        match &self.rewrite {
            Some(rewrite) => rewrite(url),
            None => url,
        }
    }

    pub(crate) fn basic_auth(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some((user, pass)),
            _ => None,
        }
    }

    /// Whether `other` would build an identical HTTP client, so an
    /// already-built one (and its connection pool) can be shared.
    pub(crate) fn client_config_matches(&self, other: &FetchOptions) -> bool {
        self.timeout == other.timeout && self.request == other.request
    }
}

impl fmt::Debug for FetchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchOptions")
            .field("allow_local", &self.allow_local)
            .field("allow_remote", &self.allow_remote)
            .field("allow_cache_read", &self.allow_cache_read)
            .field("allow_cache_write", &self.allow_cache_write)
            .field("rewrite", &self.rewrite.as_ref().map(|_| "<fn>"))
            .field("username", &self.username)
            .field("timeout", &self.timeout)
            .field("cwd", &self.cwd)
            .field("cache_key", &self.cache_key)
            .field("request", &self.request)
            .field("retry_count", &self.retry_count)
            .field("retry_delay", &self.retry_delay)
            .field("retry_backoff_factor", &self.retry_backoff_factor)
            .field("redirect_count", &self.redirect_count)
            .finish()
    }
}

/// Construction-time options for a [`Cache`](crate::Cache).
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Defaults applied to every `fetch` that does not bring its own
    /// [`FetchOptions`].
    pub fetch: FetchOptions,

    /// File name appended to cache keys ending in `/`.
    pub index_name: String,

    /// How many fetches may be opening concurrently. Body transfer does
    /// not count against this. `usize::MAX` means unbounded.
    pub concurrency: usize,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            fetch: FetchOptions::default(),
            index_name: "index.html".to_string(),
            concurrency: 2,
        }
    }
}

impl CacheOptions {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_index_name(mut self, index_name: impl Into<String>) -> Self {
        self.index_name = index_name.into();
        self
    }

    pub fn with_fetch_defaults(mut self, fetch: FetchOptions) -> Self {
        self.fetch = fetch;
        self
    }
}
