//! Optional proxy routing for remote fetches.

use reqwest::Proxy;

use crate::error::FetchError;

/// Which traffic a proxy should carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyType {
    Http,
    Https,
    Socks5,
    /// Route every scheme through the proxy.
    All,
}

/// Credentials for an authenticating proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyAuth {
    pub username: String,
    pub password: String,
}

/// A proxy to route remote fetches through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Proxy endpoint, e.g. `http://proxy.example.com:8080`.
    pub url: String,
    pub proxy_type: ProxyType,
    pub auth: Option<ProxyAuth>,
}

impl ProxyConfig {
    /// Convert into the reqwest proxy installed on the client.
    pub(crate) fn to_proxy(&self) -> Result<Proxy, FetchError> {
        let bad = |e: reqwest::Error| FetchError::Address(format!("proxy {}: {e}", self.url));

        let mut proxy = match self.proxy_type {
            ProxyType::Http => Proxy::http(&self.url).map_err(bad)?,
            ProxyType::Https => Proxy::https(&self.url).map_err(bad)?,
            ProxyType::All => Proxy::all(&self.url).map_err(bad)?,
            ProxyType::Socks5 => {
                let url = if self.url.starts_with("socks5://") {
                    self.url.clone()
                } else {
                    format!("socks5://{}", self.url)
                };
                Proxy::all(&url).map_err(bad)?
            }
        };

        if let Some(auth) = &self.auth {
            proxy = proxy.basic_auth(&auth.username, &auth.password);
        }

        Ok(proxy)
    }
}
