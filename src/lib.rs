//! # cget
//!
//! A streaming, content-addressable HTTP fetch cache. For any URI
//! (http(s), `file://`, `urn:`, or a relative path) it produces a byte
//! stream plus response metadata, serving from a local filesystem
//! mirror when possible and falling back to the network.
//!
//! The mirror is directly browsable: each remote resource is a plain
//! file at a path derived from its URL, with response metadata in a
//! `.header.json` sidecar next to it. Redirects are cached as
//! sidecar-only entries pointing at their final target, so a previously
//! followed chain resolves entirely offline.
//!
//! ## Features
//!
//! - Ordered strategy pipeline: local file, cache read, remote download
//! - Bodies stream to the caller and the mirror simultaneously
//! - Redirect-aware cache hits, including cached error responses
//! - Retry with exponential backoff and transient-error classification
//! - Mid-stream retry/abort through the returned [`CacheResult`]
//! - Bounded open-concurrency with unbounded body transfer
//!
//! ## Example
//!
//! ```no_run
//! use cget::Cache;
//!
//! # async fn demo() -> Result<(), cget::FetchError> {
//! let cache = Cache::new("/var/cache/mirror")?;
//! let result = cache.fetch("http://example.com/data.json").await?;
//! println!("{} {}", result.status, result.message);
//! let _body = result.bytes().await?;
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod buffer;
pub mod builder;
pub mod cache;
mod client;
pub mod config;
pub mod error;
pub mod meta;
pub mod path_util;
pub mod proxy;
pub mod result;
mod state;
pub mod store;
mod strategy;

#[cfg(test)]
pub(crate) mod test_utils;

pub use address::{Address, AddressHop, AddressKind};
pub use buffer::{BufferStream, ByteStream};
pub use builder::FetchOptionsBuilder;
pub use cache::Cache;
pub use config::{CacheOptions, FetchOptions, RequestConfig, RewriteFn};
pub use error::FetchError;
pub use meta::CacheMetadata;
pub use proxy::{ProxyAuth, ProxyConfig, ProxyType};
pub use result::CacheResult;
pub use store::{CacheStore, StoreBody};
