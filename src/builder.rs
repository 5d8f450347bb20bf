//! Builder for per-fetch options.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use cget::FetchOptions;
//!
//! let options = FetchOptions::builder()
//!     .with_local(true)
//!     .with_timeout(Duration::from_secs(30))
//!     .with_retries(3, Duration::from_millis(250), 2.0)
//!     .with_header("x-api-key", "secret")
//!     .build();
//! assert!(options.allow_local);
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::HeaderValue;
use url::Url;

use crate::config::{FetchOptions, RewriteFn};
use crate::proxy::ProxyConfig;

/// Fluent builder for [`FetchOptions`].
#[derive(Debug, Clone, Default)]
pub struct FetchOptionsBuilder {
    options: FetchOptions,
}

impl FetchOptionsBuilder {
    pub fn new() -> Self {
        Self {
            options: FetchOptions::default(),
        }
    }

    /// Allow serving `file://` and relative-path addresses.
    pub fn with_local(mut self, allow: bool) -> Self {
        self.options.allow_local = allow;
        self
    }

    /// Allow going to the network.
    pub fn with_remote(mut self, allow: bool) -> Self {
        self.options.allow_remote = allow;
        self
    }

    /// Allow reading from the cache mirror.
    pub fn with_cache_read(mut self, allow: bool) -> Self {
        self.options.allow_cache_read = allow;
        self
    }

    /// Allow writing fetched content into the cache mirror.
    pub fn with_cache_write(mut self, allow: bool) -> Self {
        self.options.allow_cache_write = allow;
        self
    }

    /// Rewrite every requested URL, including followed redirects.
    pub fn with_rewrite(mut self, rewrite: impl Fn(Url) -> Url + Send + Sync + 'static) -> Self {
        self.options.rewrite = Some(Arc::new(rewrite) as RewriteFn);
        self
    }

    /// Basic-auth credentials, sent only when both are set.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.options.username = Some(username.into());
        self.options.password = Some(password.into());
        self
    }

    /// Overall request timeout; zero disables it.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = timeout;
        self
    }

    /// Base directory for resolving relative URIs.
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.options.cwd = Some(cwd.into());
        self
    }

    /// Pin the cache key instead of deriving it from the URL.
    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.options.cache_key = Some(key.into());
        self
    }

    /// Retry budget: attempts beyond the first, the delay before the
    /// first retry, and the backoff multiplier.
    pub fn with_retries(mut self, count: u32, delay: Duration, backoff_factor: f64) -> Self {
        self.options.retry_count = count;
        self.options.retry_delay = delay;
        self.options.retry_backoff_factor = backoff_factor;
        self
    }

    /// Redirect budget.
    pub fn with_redirect_count(mut self, count: u32) -> Self {
        self.options.redirect_count = count;
        self
    }

    /// Set the user agent string.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.options.request.user_agent = user_agent.into();
        self
    }

    /// Add a custom HTTP header sent with every request.
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        if let (Ok(name), Ok(value)) = (
            name.as_ref().parse::<reqwest::header::HeaderName>(),
            HeaderValue::from_str(value.as_ref()),
        ) {
            self.options.request.headers.insert(name, value);
        }
        self
    }

    /// Route requests through an explicit proxy (overrides the system
    /// proxy).
    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.options.request.proxy = Some(proxy);
        self.options.request.use_system_proxy = false;
        self
    }

    /// Honor system proxy settings (ignored when an explicit proxy is
    /// configured).
    pub fn with_system_proxy(mut self, use_system_proxy: bool) -> Self {
        if self.options.request.proxy.is_none() {
            self.options.request.use_system_proxy = use_system_proxy;
        }
        self
    }

    /// Accept invalid TLS certificates.
    ///
    /// # Warning
    /// Only for testing or controlled environments.
    pub fn danger_accept_invalid_certs(mut self, accept: bool) -> Self {
        self.options.request.danger_accept_invalid_certs = accept;
        self
    }

    pub fn build(self) -> FetchOptions {
        self.options
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ProxyType;

    #[test]
    fn builder_defaults_match_options_defaults() {
        let built = FetchOptionsBuilder::new().build();
        assert!(!built.allow_local);
        assert!(built.allow_remote);
        assert_eq!(built.retry_count, 0);
        assert!(built.request.use_system_proxy);
    }

    #[test]
    fn builder_customization() {
        let built = FetchOptionsBuilder::new()
            .with_local(true)
            .with_remote(false)
            .with_timeout(Duration::from_secs(5))
            .with_retries(2, Duration::from_millis(10), 1.5)
            .with_user_agent("probe/1.0")
            .with_header("x-custom", "value")
            .build();

        assert!(built.allow_local);
        assert!(!built.allow_remote);
        assert_eq!(built.timeout, Duration::from_secs(5));
        assert_eq!(built.retry_count, 2);
        assert_eq!(built.retry_backoff_factor, 1.5);
        assert_eq!(built.request.user_agent, "probe/1.0");
        assert_eq!(
            built.request.headers.get("x-custom").unwrap().to_str().unwrap(),
            "value"
        );
    }

    #[test]
    fn explicit_proxy_disables_system_proxy() {
        let built = FetchOptionsBuilder::new()
            .with_proxy(ProxyConfig {
                url: "http://proxy.example.com:8080".to_string(),
                proxy_type: ProxyType::Http,
                auth: None,
            })
            .with_system_proxy(true)
            .build();
        assert!(built.request.proxy.is_some());
        assert!(!built.request.use_system_proxy);
    }

    #[test]
    fn credentials_set_both_parts() {
        let built = FetchOptionsBuilder::new()
            .with_credentials("user", "pass")
            .build();
        assert_eq!(built.username.as_deref(), Some("user"));
        assert_eq!(built.password.as_deref(), Some("pass"));
    }
}
