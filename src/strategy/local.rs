//! Serves `file://` and relative-path addresses straight from disk.

use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncSeekExt;
use tracing::debug;

use crate::error::FetchError;
use crate::state::FetchState;
use crate::strategy::{Body, FetchStrategy, Opened, StrategyOutcome};

/// Strategy that reads local files. Never writes to the cache.
pub(crate) struct LocalFetch;

#[async_trait]
impl FetchStrategy for LocalFetch {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn fetch(&self, state: &mut FetchState) -> Result<StrategyOutcome, FetchError> {
        if !state.address.is_local() {
            return Ok(StrategyOutcome::Skip);
        }
        if !state.options.allow_local {
            return Err(FetchError::AccessDenied("local access is not permitted"));
        }

        let path = state
            .address
            .path()
            .cloned()
            .ok_or_else(|| FetchError::Address(format!("{} has no file path", state.address.raw())))?;

        let meta = fs::metadata(&path).await?;
        let stamp = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();

        let mut file = fs::File::open(&path).await?;
        let offset = state.resume_offset();
        if offset > 0 {
            file.seek(SeekFrom::Start(offset)).await?;
        }

        debug!(
            path = %path.display(),
            size = meta.len(),
            modified_ms = stamp,
            offset,
            "serving local file"
        );

        Ok(StrategyOutcome::Open(Opened {
            status: 200,
            message: "OK".to_string(),
            headers: BTreeMap::new(),
            body: Body::from_file(file),
        }))
    }
}
