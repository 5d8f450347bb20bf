//! URI classification and cache-key derivation.

use std::path::PathBuf;

use percent_encoding::percent_decode_str;
use url::Url;

use crate::meta::CacheMetadata;
use crate::path_util::sanitize_part;

/// What kind of resource a URI names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    /// A `file://` URL or a relative/absolute filesystem path.
    Local,
    /// A `urn:` identifier; not reachable over the network but cacheable.
    Urn,
    /// An http(s) URL (or anything else that must go to the network).
    Remote,
}

/// One prior location of a redirected address.
#[derive(Debug, Clone)]
pub struct AddressHop {
    pub url: Option<Url>,
    pub cache_key: Option<String>,
    pub path: Option<PathBuf>,
    /// Response headers recorded at the moment the redirect was followed.
    pub meta: Option<CacheMetadata>,
}

/// A parsed URI with its scheme classification, cache key, derived
/// filesystem path, and redirect history.
#[derive(Debug, Clone)]
pub struct Address {
    kind: AddressKind,
    url: Option<Url>,
    raw: String,
    path: Option<PathBuf>,
    cache_key: Option<String>,
    explicit_key: bool,
    history: Vec<AddressHop>,
    was_local: bool,
    was_remote: bool,
}

impl Address {
    /// Parse a URI, resolving relative references against `base`.
    ///
    /// Parsing never fails: anything the URL parser rejects is treated as
    /// a remote address whose sanitized key may come out empty, which the
    /// strategies then refuse.
    pub fn parse(uri: &str, base: Option<&Url>, cache_key: Option<String>) -> Self {
        let url = Url::options().base_url(base).parse(uri).ok();
        let explicit_key = cache_key.is_some();
        let mut addr = Self {
            kind: AddressKind::Remote,
            url,
            raw: uri.to_string(),
            path: None,
            cache_key,
            explicit_key,
            history: Vec::new(),
            was_local: false,
            was_remote: false,
        };
        addr.classify();
        addr
    }

    /// Follow a redirect to `location`, resolved against the current URL.
    ///
    /// Unless `fake`, the current location is pushed onto the history
    /// together with `meta` (the response headers that caused the hop) so
    /// the chain can later be materialized as sidecar-only cache entries.
    pub fn redirect(&mut self, location: &str, fake: bool, meta: Option<CacheMetadata>) {
        let next = match &self.url {
            Some(current) => current
                .join(location)
                .ok()
                .or_else(|| Url::parse(location).ok()),
            None => Url::parse(location).ok(),
        };

        if !fake {
            self.history.push(AddressHop {
                url: self.url.clone(),
                cache_key: self.cache_key.clone(),
                path: self.path.clone(),
                meta,
            });
        }

        match self.kind {
            AddressKind::Local => self.was_local = true,
            AddressKind::Remote => self.was_remote = true,
            AddressKind::Urn => {}
        }

        self.url = next;
        self.raw = self
            .url
            .as_ref()
            .map(|u| u.to_string())
            .unwrap_or_else(|| location.to_string());
        self.classify();
    }

    fn classify(&mut self) {
        self.kind = match self.url.as_ref().map(|u| u.scheme()) {
            Some("file") => AddressKind::Local,
            Some("urn") => AddressKind::Urn,
            _ => AddressKind::Remote,
        };

        match self.kind {
            AddressKind::Local => {
                self.path = self
                    .url
                    .as_ref()
                    .and_then(|u| u.to_file_path().ok());
                if !self.explicit_key {
                    self.cache_key = None;
                }
            }
            AddressKind::Urn => {
                if !self.explicit_key {
                    self.cache_key = self.url.as_ref().map(urn_key);
                }
                self.path = self.cache_key.as_deref().map(key_to_path);
            }
            AddressKind::Remote => {
                if !self.explicit_key {
                    self.cache_key = Some(match &self.url {
                        Some(u) => remote_key(u),
                        None => raw_key(&self.raw),
                    });
                }
                self.path = self.cache_key.as_deref().map(key_to_path);
            }
        }
    }

    pub fn kind(&self) -> AddressKind {
        self.kind
    }

    pub fn is_local(&self) -> bool {
        self.kind == AddressKind::Local
    }

    pub fn is_remote(&self) -> bool {
        self.kind == AddressKind::Remote
    }

    /// Whether an earlier hop of this address was local.
    pub fn was_local(&self) -> bool {
        self.was_local
    }

    /// Whether an earlier hop of this address was remote.
    pub fn was_remote(&self) -> bool {
        self.was_remote
    }

    pub fn url(&self) -> Option<&Url> {
        self.url.as_ref()
    }

    /// The URI as given (or as rewritten by the latest redirect).
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// On-disk location: the concrete file for local addresses, the
    /// mirror-relative sanitized path otherwise.
    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }

    /// Logical cache key, `/`-separated. A trailing `/` means the body
    /// file gets the configured index name appended.
    pub fn cache_key(&self) -> Option<&str> {
        self.cache_key.as_deref()
    }

    pub fn history(&self) -> &[AddressHop] {
        &self.history
    }
}

/// Derive the cache key for a remote URL: host (no port) + path + query,
/// split on `/:?`, percent-decoded per part, sanitized, re-joined.
fn remote_key(url: &Url) -> String {
    let mut raw = String::new();
    if let Some(host) = url.host_str() {
        raw.push_str(host);
    }
    raw.push_str(url.path());
    if let Some(query) = url.query() {
        raw.push('?');
        raw.push_str(query);
    }
    derive_key(&raw)
}

/// `urn:a:b:c` maps to the key `a/b/c`.
fn urn_key(url: &Url) -> String {
    let parts: Vec<String> = url.path().split(':').flat_map(expand_part).collect();
    parts.join("/")
}

/// Fallback derivation for strings the URL parser rejected.
fn raw_key(raw: &str) -> String {
    let rest = raw.split_once("://").map(|(_, rest)| rest).unwrap_or(raw);
    derive_key(rest)
}

fn derive_key(raw: &str) -> String {
    let trailing = raw.ends_with('/');
    let parts: Vec<String> = raw.split(['/', ':', '?']).flat_map(expand_part).collect();
    let mut key = parts.join("/");
    if trailing && !key.is_empty() {
        key.push('/');
    }
    key
}

/// Decode and sanitize one raw component. Percent-decoding can surface
/// separator bytes (`%2F`), so the sanitized text is split again and each
/// segment re-trimmed; that is what keeps `..` out of derived keys.
fn expand_part(part: &str) -> Vec<String> {
    let decoded = percent_decode_str(part).decode_utf8_lossy();
    sanitize_part(&decoded)
        .split('/')
        .map(|seg| {
            seg.trim_matches(|c| matches!(c, '-' | '_' | '.' | '/'))
                .to_string()
        })
        .filter(|seg| !seg.is_empty())
        .collect()
}

fn key_to_path(key: &str) -> PathBuf {
    key.split('/').filter(|part| !part.is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(uri: &str) -> Address {
        Address::parse(uri, None, None)
    }

    #[test]
    fn classifies_http_as_remote() {
        let addr = parse("http://example/");
        assert!(addr.is_remote());
        assert!(!addr.is_local());
        assert_eq!(addr.cache_key(), Some("example/"));
        assert_eq!(addr.path(), Some(&PathBuf::from("example")));
    }

    #[test]
    fn classifies_file_url_as_local() {
        let addr = parse("file:///tmp/fixture.html");
        assert!(addr.is_local());
        assert!(!addr.is_remote());
        assert_eq!(addr.cache_key(), None);
        assert_eq!(addr.path(), Some(&PathBuf::from("/tmp/fixture.html")));
    }

    #[test]
    fn urn_is_neither_local_nor_remote_but_has_a_key() {
        let addr = parse("urn:a:b:c");
        assert_eq!(addr.kind(), AddressKind::Urn);
        assert!(!addr.is_local());
        assert!(!addr.is_remote());
        assert_eq!(addr.cache_key(), Some("a/b/c"));
    }

    #[test]
    fn key_drops_port_and_decodes_percent_escapes() {
        let addr = parse("http://host:8080/a%20b/c");
        assert_eq!(addr.cache_key(), Some("host/a_b/c"));
    }

    #[test]
    fn query_joins_the_key_as_a_component() {
        let addr = parse("http://host/p?x=1&y=2");
        assert_eq!(addr.cache_key(), Some("host/p/x_1_y_2"));
    }

    #[test]
    fn key_contains_only_safe_characters_and_no_dotdot() {
        for uri in [
            "http://host/../..%2f../we~ird/$$$/ok",
            "http://host/a%2F..%2Fb",
        ] {
            let addr = parse(uri);
            let key = addr.cache_key().unwrap();
            assert!(
                key.chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/')),
                "unsafe byte in {key:?}"
            );
            assert!(!key.split('/').any(|part| part == ".." || part.is_empty()));
        }
    }

    #[test]
    fn relative_uri_resolves_against_base() {
        let base = Url::from_directory_path("/work/dir").unwrap();
        let addr = Address::parse("./fixtures/index.html", Some(&base), None);
        assert!(addr.is_local());
        assert_eq!(
            addr.path(),
            Some(&PathBuf::from("/work/dir/fixtures/index.html"))
        );
    }

    #[test]
    fn explicit_cache_key_overrides_derivation() {
        let addr = Address::parse("http://host/whatever", None, Some("pinned/key".to_string()));
        assert_eq!(addr.cache_key(), Some("pinned/key"));
        assert_eq!(addr.path(), Some(&PathBuf::from("pinned/key")));
    }

    #[test]
    fn explicit_cache_key_survives_redirects() {
        let mut addr =
            Address::parse("http://host/start", None, Some("pinned/key".to_string()));
        addr.redirect("http://elsewhere/end", false, None);
        assert_eq!(addr.cache_key(), Some("pinned/key"));
        assert_eq!(addr.url().unwrap().as_str(), "http://elsewhere/end");
    }

    #[test]
    fn redirect_pushes_history_and_sets_sticky_flags() {
        let mut addr = parse("http://origin/a");
        addr.redirect("/b", false, None);
        assert_eq!(addr.history().len(), 1);
        assert!(addr.was_remote());
        assert_eq!(addr.url().unwrap().as_str(), "http://origin/b");
        assert_eq!(
            addr.history()[0].url.as_ref().unwrap().as_str(),
            "http://origin/a"
        );
        assert_eq!(addr.history()[0].cache_key.as_deref(), Some("origin/a"));
    }

    #[test]
    fn fake_redirect_skips_history() {
        let mut addr = parse("http://origin/a");
        addr.redirect("/b", true, None);
        assert!(addr.history().is_empty());
        assert_eq!(addr.cache_key(), Some("origin/b"));
    }

    #[test]
    fn reparsing_the_resolved_url_rederives_the_same_path() {
        for uri in [
            "http://example/",
            "http://host/a/b/c",
            "http://host/p?x=1",
            "http://host:9999/q%20r",
        ] {
            let first = parse(uri);
            let again = parse(first.url().unwrap().as_str());
            assert_eq!(first.path(), again.path(), "for {uri}");
        }
    }

    #[test]
    fn malformed_uri_falls_through_to_remote() {
        let addr = parse("http://");
        assert!(addr.is_remote());
        // The derived key may be empty; strategies report that as failure.
    }
}
