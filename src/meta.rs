//! Sidecar metadata stored next to each cached body.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

/// Reserved sidecar fields all start with this prefix; everything else in
/// the JSON object is an ordinary response header.
const RESERVED_PREFIX: &str = "cget-";

/// Metadata for a cached resource, serialized as the `.header.json`
/// sidecar file.
///
/// Every reserved field is optional on disk; readers fall back to
/// `200 OK` when the sidecar is missing fields or missing entirely.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheMetadata {
    /// Milliseconds since epoch at store time.
    #[serde(rename = "cget-stamp", skip_serializing_if = "Option::is_none")]
    pub stamp: Option<u64>,

    /// HTTP status of the stored response.
    #[serde(rename = "cget-status", skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,

    /// Status reason phrase.
    #[serde(rename = "cget-message", skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// For 3xx entries, the final target URI of the redirect chain.
    #[serde(rename = "cget-target", skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    /// Arbitrary response headers, flattened into the same JSON object.
    #[serde(flatten)]
    pub headers: BTreeMap<String, serde_json::Value>,
}

impl CacheMetadata {
    /// Snapshot an HTTP response into sidecar form, stamped now.
    pub fn from_response(status: StatusCode, headers: &HeaderMap) -> Self {
        let mut map = BTreeMap::new();
        for (name, value) in headers {
            // A header spoofing the reserved prefix would collide with
            // the bookkeeping fields on serialization.
            if name.as_str().starts_with(RESERVED_PREFIX) {
                continue;
            }
            if let Ok(v) = value.to_str() {
                map.insert(
                    name.as_str().to_string(),
                    serde_json::Value::String(v.to_string()),
                );
            }
        }
        Self {
            stamp: Some(now_ms()),
            status: Some(status.as_u16()),
            message: Some(canonical_reason(status)),
            target: None,
            headers: map,
        }
    }

    /// Metadata for a plain `200 OK` with the given stamp.
    pub fn ok_at(stamp_ms: u64) -> Self {
        Self {
            stamp: Some(stamp_ms),
            status: Some(200),
            message: Some("OK".to_string()),
            target: None,
            headers: BTreeMap::new(),
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Stored status, defaulting to 200.
    pub fn status_code(&self) -> u16 {
        self.status.unwrap_or(200)
    }

    /// Stored reason phrase, defaulting to "OK".
    pub fn reason(&self) -> String {
        self.message.clone().unwrap_or_else(|| "OK".to_string())
    }

    pub fn is_redirect(&self) -> bool {
        (300..=308).contains(&self.status_code()) && self.target.is_some()
    }

    /// Response headers with all internal `cget-*` bookkeeping removed.
    pub fn public_headers(&self) -> BTreeMap<String, String> {
        self.headers
            .iter()
            .filter(|(name, _)| !name.starts_with(RESERVED_PREFIX))
            .map(|(name, value)| {
                let rendered = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (name.clone(), rendered)
            })
            .collect()
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub(crate) fn canonical_reason(status: StatusCode) -> String {
    status.canonical_reason().unwrap_or("").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_sidecar_defaults_to_200_ok() {
        let meta: CacheMetadata = serde_json::from_str("{}").unwrap();
        assert_eq!(meta.status_code(), 200);
        assert_eq!(meta.reason(), "OK");
        assert!(!meta.is_redirect());
        assert!(meta.public_headers().is_empty());
    }

    #[test]
    fn reserved_fields_roundtrip_with_renames() {
        let meta = CacheMetadata {
            stamp: Some(1234),
            status: Some(302),
            message: Some("Found".to_string()),
            target: Some("http://example/a".to_string()),
            headers: BTreeMap::new(),
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["cget-stamp"], 1234);
        assert_eq!(json["cget-status"], 302);
        assert_eq!(json["cget-message"], "Found");
        assert_eq!(json["cget-target"], "http://example/a");

        let back: CacheMetadata = serde_json::from_value(json).unwrap();
        assert!(back.is_redirect());
    }

    #[test]
    fn headers_flatten_into_the_same_object() {
        let json = r#"{"cget-status":404,"content-type":"text/plain","x-trace":"abc"}"#;
        let meta: CacheMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(meta.status_code(), 404);
        let public = meta.public_headers();
        assert_eq!(public.get("content-type").map(String::as_str), Some("text/plain"));
        assert_eq!(public.get("x-trace").map(String::as_str), Some("abc"));
        assert!(!public.contains_key("cget-status"));
    }

    #[test]
    fn from_response_snapshots_headers_and_stamp() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "text/html".parse().unwrap());
        let meta = CacheMetadata::from_response(StatusCode::OK, &headers);
        assert_eq!(meta.status_code(), 200);
        assert_eq!(meta.reason(), "OK");
        assert!(meta.stamp.unwrap() > 0);
        assert_eq!(
            meta.public_headers().get("content-type").map(String::as_str),
            Some("text/html")
        );
    }
}
