use reqwest::Client;
use rustls::{crypto::ring, ClientConfig};
use rustls_platform_verifier::BuilderVerifierExt;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::FetchOptions;
use crate::error::FetchError;

/// Create a reqwest Client for one fetch's options.
///
/// Redirects are never followed by the client itself: the remote transfer
/// interprets 3xx responses so the cache can record the chain and consult
/// the mirror for the target.
pub(crate) fn create_client(options: &FetchOptions) -> Result<Client, FetchError> {
    let provider = Arc::new(ring::default_provider());

    let tls_config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .expect("Failed to configure default TLS protocol versions")
        .with_platform_verifier()
        .expect("Failed to initialize platform certificate verifier")
        .with_no_client_auth();

    let request = &options.request;
    let mut client_builder = Client::builder()
        .user_agent(&request.user_agent)
        .default_headers(request.headers.clone())
        .use_preconfigured_tls(tls_config)
        .danger_accept_invalid_certs(request.danger_accept_invalid_certs)
        .gzip(true)
        .redirect(reqwest::redirect::Policy::none());

    if !options.timeout.is_zero() {
        client_builder = client_builder.timeout(options.timeout);
    }

    if let Some(proxy_config) = &request.proxy {
        let proxy = proxy_config.to_proxy()?;
        client_builder = client_builder.proxy(proxy);
        info!(proxy_url = %proxy_config.url, "Using explicitly configured proxy for fetches");
    } else if request.use_system_proxy {
        // reqwest picks up system proxy settings unless no_proxy() is set
        info!("Using system proxy settings for fetches");
    } else {
        client_builder = client_builder.no_proxy();
        debug!("Proxy disabled for fetches");
    }

    client_builder.build().map_err(FetchError::from)
}
