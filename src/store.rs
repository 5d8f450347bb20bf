//! Filesystem layer of the cache mirror: path resolution, sidecar I/O,
//! and the part-file staging that keeps bodies atomic on disk.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use futures::StreamExt;
use rand::Rng;
use tokio::fs;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::address::Address;
use crate::buffer::ByteStream;
use crate::error::FetchError;
use crate::meta::CacheMetadata;
use crate::path_util::mkdirp;

/// Suffix of the sidecar file next to each cached body.
const SIDECAR_SUFFIX: &str = ".header.json";

/// Suffix of in-flight body files; renamed away on completed transfer.
const PART_SUFFIX: &str = ".part";

/// Body payload accepted by [`Cache::store`](crate::Cache::store).
pub enum StoreBody {
    Bytes(Bytes),
    Stream(ByteStream),
}

impl From<Bytes> for StoreBody {
    fn from(bytes: Bytes) -> Self {
        StoreBody::Bytes(bytes)
    }
}

impl From<Vec<u8>> for StoreBody {
    fn from(bytes: Vec<u8>) -> Self {
        StoreBody::Bytes(Bytes::from(bytes))
    }
}

impl From<String> for StoreBody {
    fn from(text: String) -> Self {
        StoreBody::Bytes(Bytes::from(text))
    }
}

impl From<&'static str> for StoreBody {
    fn from(text: &'static str) -> Self {
        StoreBody::Bytes(Bytes::from_static(text.as_bytes()))
    }
}

impl From<ByteStream> for StoreBody {
    fn from(stream: ByteStream) -> Self {
        StoreBody::Stream(stream)
    }
}

/// The on-disk mirror under one base directory.
///
/// Each cacheable address maps to `<root>/<sanitized key>`; keys ending
/// in `/` get `index_name` appended. The sidecar lives next to the body
/// with `.header.json` appended to the full file name.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
    index_name: String,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>, index_name: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            index_name: index_name.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    /// Map a cache key to its body path without consulting the disk.
    pub(crate) fn body_path(&self, key: &str) -> Result<PathBuf, FetchError> {
        let parts: Vec<&str> = key
            .split('/')
            .filter(|part| !part.is_empty() && *part != "..")
            .collect();
        if parts.is_empty() {
            return Err(FetchError::Address(format!(
                "key {key:?} yields no cache path"
            )));
        }
        let mut path = self.root.clone();
        path.extend(parts.iter().copied());
        if key.ends_with('/') {
            path.push(&self.index_name);
        }
        Ok(path)
    }

    /// Like [`body_path`](Self::body_path), but when a longer key has
    /// already turned the location into a directory, the body lives
    /// inside it as `index_name`.
    pub(crate) async fn resolve_body_path(&self, key: &str) -> Result<PathBuf, FetchError> {
        let mut path = self.body_path(key)?;
        if let Ok(meta) = fs::metadata(&path).await {
            if meta.is_dir() {
                path.push(&self.index_name);
            }
        }
        Ok(path)
    }

    pub(crate) fn sidecar_path(body_path: &Path) -> PathBuf {
        let mut os = body_path.as_os_str().to_owned();
        os.push(SIDECAR_SUFFIX);
        PathBuf::from(os)
    }

    /// Read the sidecar for `key`. A missing or unreadable sidecar is
    /// `None`; callers fall back to default metadata.
    pub(crate) async fn read_sidecar(&self, key: &str) -> Result<Option<CacheMetadata>, FetchError> {
        let body = self.resolve_body_path(key).await?;
        let path = Self::sidecar_path(&body);
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice(&raw) {
            Ok(meta) => Ok(Some(meta)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring unparseable sidecar");
                Ok(None)
            }
        }
    }

    /// Write the sidecar for `key` atomically (temp file + rename).
    pub(crate) async fn write_sidecar(
        &self,
        key: &str,
        meta: &CacheMetadata,
    ) -> Result<(), FetchError> {
        let body = self.resolve_body_path(key).await?;
        if let Some(parent) = body.parent() {
            mkdirp(parent, &self.index_name).await?;
        }
        let path = Self::sidecar_path(&body);
        let json = serde_json::to_vec(meta)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let tmp = path.with_extension(format!("tmp{:08x}", rand::rng().random::<u32>()));
        fs::write(&tmp, &json).await?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        debug!(key, path = %path.display(), "wrote sidecar");
        Ok(())
    }

    /// Open the cached body for `key`, positioned at `offset`.
    pub(crate) async fn open_body(&self, key: &str, offset: u64) -> Result<fs::File, FetchError> {
        let path = self.resolve_body_path(key).await?;
        let mut file = fs::File::open(&path).await?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset)).await?;
        }
        Ok(file)
    }

    /// Open the staging file a downloaded body streams into.
    ///
    /// At offset zero this truncates any stale part file; a resumed
    /// attempt appends, and refuses to continue if the part file does
    /// not hold exactly the bytes already forwarded.
    pub(crate) async fn create_part(&self, key: &str, offset: u64) -> Result<PartFile, FetchError> {
        let final_path = self.resolve_body_path(key).await?;
        if let Some(parent) = final_path.parent() {
            mkdirp(parent, &self.index_name).await?;
        }
        let part_path = {
            let mut os = final_path.as_os_str().to_owned();
            os.push(PART_SUFFIX);
            PathBuf::from(os)
        };

        let file = if offset == 0 {
            fs::File::create(&part_path).await?
        } else {
            let meta = fs::metadata(&part_path).await?;
            if meta.len() != offset {
                return Err(FetchError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!(
                        "part file {} holds {} bytes, resume expects {offset}",
                        part_path.display(),
                        meta.len()
                    ),
                )));
            }
            fs::OpenOptions::new().append(true).open(&part_path).await?
        };

        Ok(PartFile {
            file,
            part_path,
            final_path,
            index_name: self.index_name.clone(),
        })
    }

    /// Store a body and/or sidecar for an address, as
    /// [`Cache::store`](crate::Cache::store) does.
    pub async fn store(
        &self,
        address: &Address,
        body: Option<StoreBody>,
        meta: Option<&CacheMetadata>,
    ) -> Result<(), FetchError> {
        if address.is_local() {
            return Err(FetchError::Address(format!(
                "refusing to store local address {}",
                address.raw()
            )));
        }
        let key = address
            .cache_key()
            .ok_or_else(|| FetchError::Address(format!("{} has no cache key", address.raw())))?
            .to_string();

        match body {
            Some(StoreBody::Bytes(bytes)) => {
                let mut part = self.create_part(&key, 0).await?;
                part.write(&bytes).await?;
                part.commit().await?;
            }
            Some(StoreBody::Stream(mut stream)) => {
                let mut part = self.create_part(&key, 0).await?;
                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(bytes) => part.write(&bytes).await?,
                        Err(e) => {
                            part.discard().await;
                            return Err(e);
                        }
                    }
                }
                part.commit().await?;
            }
            None => {}
        }

        if let Some(meta) = meta {
            self.write_sidecar(&key, meta).await?;
        }
        Ok(())
    }

    /// Persist the redirect hops of a finished fetch as sidecar-only
    /// entries pointing at the final URI. Best-effort: a failed write is
    /// logged and the remaining hops still go out.
    pub(crate) async fn write_redirect_history(&self, address: &Address) {
        let Some(target) = address.url().map(|u| u.to_string()) else {
            return;
        };
        for hop in address.history() {
            let (Some(key), Some(meta)) = (&hop.cache_key, &hop.meta) else {
                continue;
            };
            let entry = meta.clone().with_target(target.clone());
            if let Err(e) = self.write_sidecar(key, &entry).await {
                warn!(key = %key, error = %e, "failed to persist redirect entry");
            }
        }
    }
}

/// An in-flight cache body: bytes stream into `<body>.part` and the file
/// is renamed into place only on a completed transfer.
pub(crate) struct PartFile {
    file: fs::File,
    part_path: PathBuf,
    final_path: PathBuf,
    index_name: String,
}

impl PartFile {
    pub async fn write(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        self.file.write_all(chunk).await
    }

    /// Finish the transfer: rename the part file onto the body path. If
    /// a racing longer key has turned that path into a directory, the
    /// body lands inside it as the index file instead.
    pub async fn commit(mut self) -> std::io::Result<PathBuf> {
        self.file.flush().await?;
        let PartFile {
            file,
            part_path,
            final_path,
            index_name,
        } = self;
        drop(file);

        match fs::rename(&part_path, &final_path).await {
            Ok(()) => Ok(final_path),
            Err(e) => {
                let is_dir = fs::metadata(&final_path)
                    .await
                    .map(|m| m.is_dir())
                    .unwrap_or(false);
                if !is_dir {
                    let _ = fs::remove_file(&part_path).await;
                    return Err(e);
                }
                let inside = final_path.join(&index_name);
                match fs::rename(&part_path, &inside).await {
                    Ok(()) => Ok(inside),
                    Err(e) => {
                        let _ = fs::remove_file(&part_path).await;
                        Err(e)
                    }
                }
            }
        }
    }

    /// Stop writing but keep the part file for a resumed attempt.
    pub async fn park(mut self) -> std::io::Result<PathBuf> {
        self.file.flush().await?;
        Ok(self.part_path)
    }

    /// Abandon the transfer and remove the part file.
    pub async fn discard(self) {
        drop(self.file);
        let _ = fs::remove_file(&self.part_path).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;

    fn store_in(dir: &Path) -> CacheStore {
        CacheStore::new(dir, "index.html")
    }

    #[test]
    fn trailing_slash_key_gets_the_index_name() {
        let store = store_in(Path::new("/base"));
        assert_eq!(
            store.body_path("example/").unwrap(),
            PathBuf::from("/base/example/index.html")
        );
        assert_eq!(
            store.body_path("example/a").unwrap(),
            PathBuf::from("/base/example/a")
        );
    }

    #[test]
    fn empty_key_is_refused() {
        let store = store_in(Path::new("/base"));
        assert!(store.body_path("").is_err());
        assert!(store.body_path("/").is_err());
    }

    #[test]
    fn sidecar_appends_to_the_file_name() {
        let body = PathBuf::from("/base/example/index.html");
        assert_eq!(
            CacheStore::sidecar_path(&body),
            PathBuf::from("/base/example/index.html.header.json")
        );
    }

    #[tokio::test]
    async fn store_writes_body_and_sidecar() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        let address = Address::parse("http://example/", None, None);
        let meta = CacheMetadata::ok_at(1);

        store
            .store(&address, Some("hi".into()), Some(&meta))
            .await
            .unwrap();

        let body = fs::read(tmp.path().join("example/index.html")).await.unwrap();
        assert_eq!(body, b"hi");
        let sidecar = store.read_sidecar("example/").await.unwrap().unwrap();
        assert_eq!(sidecar.status_code(), 200);
    }

    #[tokio::test]
    async fn store_rejects_local_addresses() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        let address = Address::parse("file:///tmp/something", None, None);
        let err = store
            .store(&address, Some("data".into()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Address(_)));
    }

    #[tokio::test]
    async fn unparseable_sidecar_reads_as_absent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        fs::create_dir_all(tmp.path().join("host")).await.unwrap();
        fs::write(tmp.path().join("host/page"), b"body").await.unwrap();
        fs::write(tmp.path().join("host/page.header.json"), b"not json")
            .await
            .unwrap();

        assert!(store.read_sidecar("host/page").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn commit_lands_inside_a_directory_that_appeared() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());

        let mut part = store.create_part("host/a", 0).await.unwrap();
        part.write(b"A").await.unwrap();
        // A fetch of host/a/b turns the body location into a directory
        // before this transfer finishes.
        fs::create_dir_all(tmp.path().join("host/a")).await.unwrap();
        let landed = part.commit().await.unwrap();

        assert_eq!(landed, tmp.path().join("host/a/index.html"));
        assert_eq!(fs::read(&landed).await.unwrap(), b"A");
    }

    #[tokio::test]
    async fn resumed_part_appends_at_the_expected_offset() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());

        let mut part = store.create_part("host/file", 0).await.unwrap();
        part.write(b"abc").await.unwrap();
        part.park().await.unwrap();

        let mut resumed = store.create_part("host/file", 3).await.unwrap();
        resumed.write(b"def").await.unwrap();
        let landed = resumed.commit().await.unwrap();
        assert_eq!(fs::read(&landed).await.unwrap(), b"abcdef");
    }

    #[tokio::test]
    async fn resume_refuses_a_mismatched_part() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());

        let mut part = store.create_part("host/file", 0).await.unwrap();
        part.write(b"ab").await.unwrap();
        part.park().await.unwrap();

        assert!(store.create_part("host/file", 5).await.is_err());
    }

    #[tokio::test]
    async fn discard_removes_the_part_file() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());

        let mut part = store.create_part("host/x", 0).await.unwrap();
        part.write(b"junk").await.unwrap();
        part.discard().await;

        assert!(!tmp.path().join("host/x.part").exists());
        assert!(!tmp.path().join("host/x").exists());
    }
}
