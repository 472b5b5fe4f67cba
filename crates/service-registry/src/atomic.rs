//! Crash-safe JSON files
//!
//! Writers produce a sibling temp file, fsync it, and rename it over the
//! target. Readers therefore see either the previous complete file or the
//! new complete file, never a torn one. A missing file reads as the
//! type's default value.

use crate::error::{Error, Result};
use futures::io::AsyncWriteExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// The final step of an atomic write. Swappable so tests can inject
/// rename failures.
pub type RenameFn = Arc<dyn Fn(&Path, &Path) -> io::Result<()> + Send + Sync>;

/// `std::fs::rename`, which is atomic on POSIX within one filesystem
pub fn default_rename() -> RenameFn {
    Arc::new(|from, to| std::fs::rename(from, to))
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{}.tmp", std::process::id()));
    path.with_file_name(name)
}

/// Atomically replace `path` with `bytes`.
pub async fn write_atomic(path: &Path, bytes: &[u8], rename: &RenameFn) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        async_fs::create_dir_all(parent).await?;
    }

    let tmp = temp_path(path);
    let result = async {
        let mut file = async_fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        rename(&tmp, path)
    }
    .await;

    if let Err(e) = &result {
        warn!(path = %path.display(), error = %e, "Atomic write failed, discarding temp file");
        let _ = async_fs::remove_file(&tmp).await;
    }
    result
}

/// Serialize `value` as pretty JSON and write it atomically.
pub async fn write_json<T: Serialize + ?Sized>(
    path: &Path,
    value: &T,
    rename: &RenameFn,
) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes, rename)
        .await
        .map_err(|source| Error::Persist {
            path: path.to_path_buf(),
            source,
        })?;
    debug!(path = %path.display(), bytes = bytes.len(), "Wrote state file");
    Ok(())
}

/// Read JSON from `path`, treating a missing or empty file as `T::default()`.
pub async fn read_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    match async_fs::read(path).await {
        Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(T::default()),
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn failing_rename() -> RenameFn {
        Arc::new(|_, _| Err(io::Error::other("injected rename failure")))
    }

    #[smol_potat::test]
    async fn test_missing_file_reads_as_default() {
        let dir = tempfile::tempdir().unwrap();
        let map: BTreeMap<String, u32> = read_json(&dir.path().join("absent.json")).await.unwrap();
        assert!(map.is_empty());
    }

    #[smol_potat::test]
    async fn test_write_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/state/data.json");

        write_json(&path, &vec![1, 2, 3], &default_rename()).await.unwrap();

        let back: Vec<u32> = read_json(&path).await.unwrap();
        assert_eq!(back, vec![1, 2, 3]);
    }

    #[smol_potat::test]
    async fn test_rename_failure_keeps_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");

        let before = BTreeMap::from([("a".to_string(), 1u32)]);
        write_json(&path, &before, &default_rename()).await.unwrap();

        let after = BTreeMap::from([("a".to_string(), 2u32), ("b".to_string(), 3)]);
        let err = write_json(&path, &after, &failing_rename()).await.unwrap_err();
        assert!(matches!(err, Error::Persist { .. }));

        let on_disk: BTreeMap<String, u32> = read_json(&path).await.unwrap();
        assert_eq!(on_disk, before);

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("data.json")]);
    }
}
