//! Filesystem-side helpers for the cache mirror: component sanitizing and
//! conflict-healing directory creation.

use std::io;
use std::path::{Component, Path, PathBuf};

use rand::Rng;
use tokio::fs;
use tracing::debug;

/// Sanitize one logical path component of a cache key.
///
/// Every byte outside `[-_./0-9A-Za-z]` becomes `_`, then leading and
/// trailing runs of `-_./` are stripped. This keeps keys browsable on any
/// filesystem and makes `..` components impossible.
pub fn sanitize_part(part: &str) -> String {
    let mapped: String = part
        .bytes()
        .map(|b| match b {
            b'-' | b'_' | b'.' | b'/' | b'0'..=b'9' | b'A'..=b'Z' | b'a'..=b'z' => b as char,
            _ => '_',
        })
        .collect();
    mapped
        .trim_matches(|c| matches!(c, '-' | '_' | '.' | '/'))
        .to_string()
}

/// Create `dir` and any missing parents, healing file-vs-directory
/// conflicts along the way.
///
/// Two fetches whose keys share a prefix may race to create the same
/// directory, and an earlier fetch may have cached `host/a` as a plain
/// file while a later one needs `host/a/` as a directory. Walking the
/// components top-down: an existing directory is kept, a missing one is
/// created (`AlreadyExists` from a racing writer is re-checked, not
/// failed), and a file in the way is renamed aside, replaced by a
/// directory, and moved back inside as `index_name`.
pub async fn mkdirp(dir: &Path, index_name: &str) -> io::Result<()> {
    let mut current = PathBuf::new();
    for comp in dir.components() {
        current.push(comp);
        if !matches!(comp, Component::Normal(_)) {
            continue;
        }
        match fs::metadata(&current).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => heal_file_conflict(&current, index_name).await?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                match fs::create_dir(&current).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                        // A racing writer got there first; it may have
                        // created either the directory or a body file.
                        let meta = fs::metadata(&current).await?;
                        if !meta.is_dir() {
                            heal_file_conflict(&current, index_name).await?;
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Turn a cached body file at `path` into a directory containing the old
/// body as `index_name`.
async fn heal_file_conflict(path: &Path, index_name: &str) -> io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stash = parent.join(format!(".{}.{:08x}", name, rand::rng().random::<u32>()));

    match fs::rename(path, &stash).await {
        Ok(()) => {
            debug!(path = %path.display(), "healing file/directory conflict");
            if let Err(e) = fs::create_dir(path).await {
                if e.kind() != io::ErrorKind::AlreadyExists {
                    return Err(e);
                }
            }
            fs::rename(&stash, path.join(index_name)).await
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            // Another worker renamed it away already; all that matters is
            // that a directory is in place now.
            let meta = fs::metadata(path).await?;
            if meta.is_dir() {
                Ok(())
            } else {
                Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} is contended by another writer", path.display()),
                ))
            }
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_passes_safe_bytes() {
        assert_eq!(sanitize_part("index.html"), "index.html");
        assert_eq!(sanitize_part("a-b_c"), "a-b_c");
    }

    #[test]
    fn sanitize_replaces_unsafe_bytes() {
        assert_eq!(sanitize_part("a=b&c"), "a_b_c");
        assert_eq!(sanitize_part("héllo"), "h_llo");
    }

    #[test]
    fn sanitize_strips_edge_runs() {
        assert_eq!(sanitize_part(".hidden"), "hidden");
        assert_eq!(sanitize_part("..."), "");
        assert_eq!(sanitize_part("--name--"), "name");
        assert_eq!(sanitize_part("..secret.txt"), "secret.txt");
    }

    #[tokio::test]
    async fn mkdirp_creates_nested_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("a").join("b").join("c");
        mkdirp(&target, "index.html").await.unwrap();
        assert!(target.is_dir());
    }

    #[tokio::test]
    async fn mkdirp_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("x").join("y");
        mkdirp(&target, "index.html").await.unwrap();
        mkdirp(&target, "index.html").await.unwrap();
        assert!(target.is_dir());
    }

    #[tokio::test]
    async fn mkdirp_heals_file_in_the_way() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("a");
        fs::write(&blocker, b"cached body").await.unwrap();

        mkdirp(&blocker.join("b"), "index.html").await.unwrap();

        assert!(blocker.is_dir());
        assert!(blocker.join("b").is_dir());
        let moved = fs::read(blocker.join("index.html")).await.unwrap();
        assert_eq!(moved, b"cached body");
    }

    #[tokio::test]
    async fn mkdirp_tolerates_concurrent_creation() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("shared").join("deep").join("tree");
        let a = mkdirp(&target, "index.html");
        let b = mkdirp(&target, "index.html");
        let (ra, rb) = tokio::join!(a, b);
        ra.unwrap();
        rb.unwrap();
        assert!(target.is_dir());
    }
}
