//! TTL and hash invalidated key/value cache

use crate::atomic::{self, RenameFn};
use crate::error::Result;
use chrono::{DateTime, Utc};
use futures::lock::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, warn};

/// Hex SHA-256 of a value's JSON form, for use as an invalidation hash
pub fn hash_of<T: Serialize + ?Sized>(value: &T) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    format!("{:x}", Sha256::digest(&bytes))
}

/// One cached value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    /// Cached payload
    pub value: Value,
    /// When the value was stored
    pub inserted_at: DateTime<Utc>,
    /// Lifetime in milliseconds
    pub ttl_ms: u64,
    /// Hash of whatever the value was derived from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl CacheEntry {
    fn expires_at(&self) -> DateTime<Utc> {
        let ttl = i64::try_from(self.ttl_ms)
            .ok()
            .and_then(chrono::Duration::try_milliseconds)
            .unwrap_or(chrono::Duration::MAX);
        self.inserted_at
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Still inside its TTL at `now`
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at()
    }

    /// A hit requires both a live TTL and an identical hash
    pub fn is_fresh(&self, now: DateTime<Utc>, current_hash: Option<&str>) -> bool {
        self.is_live(now) && self.hash.as_deref() == current_hash
    }
}

/// Key/value cache whose reads miss after TTL expiry or on hash mismatch
///
/// Optionally backed by a JSON file rewritten atomically on every change.
pub struct CacheManager {
    path: Option<PathBuf>,
    rename: RenameFn,
    entries: RwLock<HashMap<String, CacheEntry>>,
    writer: Mutex<()>,
}

impl CacheManager {
    /// A cache that lives only in memory
    pub fn in_memory() -> Self {
        Self {
            path: None,
            rename: atomic::default_rename(),
            entries: RwLock::new(HashMap::new()),
            writer: Mutex::new(()),
        }
    }

    /// Open a file-backed cache, discarding expired entries on load.
    ///
    /// A corrupt cache file is logged and treated as empty.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut entries: HashMap<String, CacheEntry> = match atomic::read_json(&path).await {
            Ok(entries) => entries,
            Err(crate::Error::Json(e)) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable cache file");
                HashMap::new()
            }
            Err(e) => return Err(e),
        };
        let now = Utc::now();
        entries.retain(|_, entry| entry.is_live(now));
        debug!(path = %path.display(), entries = entries.len(), "Opened cache");

        Ok(Self {
            path: Some(path),
            rename: atomic::default_rename(),
            entries: RwLock::new(entries),
            writer: Mutex::new(()),
        })
    }

    /// Backing file, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Look up `key`; a hit requires a live TTL and a matching hash
    pub fn get(&self, key: &str, current_hash: Option<&str>) -> Option<Value> {
        self.get_at(key, current_hash, Utc::now())
    }

    /// [`get`](Self::get) evaluated at an explicit instant
    pub fn get_at(&self, key: &str, current_hash: Option<&str>, now: DateTime<Utc>) -> Option<Value> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let entry = entries.get(key)?;
        if entry.is_fresh(now, current_hash) {
            Some(entry.value.clone())
        } else {
            None
        }
    }

    /// Typed [`get`](Self::get); a value that no longer deserializes is a miss
    pub fn get_as<T: DeserializeOwned>(&self, key: &str, current_hash: Option<&str>) -> Option<T> {
        let value = self.get(key, current_hash)?;
        serde_json::from_value(value).ok()
    }

    /// Store `value` under `key` for `ttl`, tagged with `hash`
    pub async fn set(
        &self,
        key: impl Into<String>,
        value: Value,
        ttl: Duration,
        hash: Option<String>,
    ) -> Result<()> {
        let entry = CacheEntry {
            value,
            inserted_at: Utc::now(),
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
            hash,
        };
        let key = key.into();
        self.change(|entries| {
            entries.insert(key, entry);
        })
        .await
    }

    /// Typed [`set`](Self::set)
    pub async fn set_as<T: Serialize>(
        &self,
        key: impl Into<String>,
        value: &T,
        ttl: Duration,
        hash: Option<String>,
    ) -> Result<()> {
        self.set(key, serde_json::to_value(value)?, ttl, hash).await
    }

    /// Drop one key
    pub async fn invalidate(&self, key: &str) -> Result<()> {
        self.change(|entries| {
            entries.remove(key);
        })
        .await
    }

    /// Drop every expired entry, returning how many were removed
    pub async fn prune(&self) -> Result<usize> {
        let now = Utc::now();
        let mut removed = 0;
        self.change(|entries| {
            let before = entries.len();
            entries.retain(|_, entry| entry.is_live(now));
            removed = before - entries.len();
        })
        .await?;
        Ok(removed)
    }

    /// Number of stored entries, expired or not
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn change(&self, f: impl FnOnce(&mut HashMap<String, CacheEntry>)) -> Result<()> {
        let _writer = self.writer.lock().await;
        let snapshot = {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            f(&mut entries);
            self.path.as_ref().map(|_| entries.clone())
        };
        if let (Some(path), Some(snapshot)) = (&self.path, snapshot) {
            atomic::write_json(path, &snapshot, &self.rename).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("path", &self.path)
            .field("entries", &self.len())
            .finish()
    }
}
