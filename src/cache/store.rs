//! Cache store abstraction
//!
//! Entries live in named stores. Store names carry the generation tag
//! (`shell-<version>`, `runtime-<version>`) so an upgrade can drop every
//! stale generation wholesale. Writes are last-writer-wins per key.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A cached response body with its content type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// Cache persistence trait
/// Implementations must be thread-safe; concurrent reads are expected.
#[async_trait]
pub trait CacheStore: Send + Sync + 'static {
    /// Look up an entry by request key.
    async fn get(&self, store: &str, key: &str) -> Result<Option<CacheEntry>>;

    /// Insert or overwrite an entry.
    async fn put(&self, store: &str, key: &str, entry: CacheEntry) -> Result<()>;

    /// Whether a key is present without reading its body.
    async fn contains(&self, store: &str, key: &str) -> Result<bool> {
        Ok(self.get(store, key).await?.is_some())
    }

    /// Names of all existing stores, across generations.
    async fn list_stores(&self) -> Result<Vec<String>>;

    /// Drop a whole store and everything in it.
    async fn delete_store(&self, store: &str) -> Result<()>;
}

/// Filesystem-backed store: one directory per generation, one body file
/// plus one metadata file per entry.
pub struct FsCacheStore {
    root: PathBuf,
}

#[derive(Serialize, Deserialize)]
struct EntryMeta {
    key: String,
    content_type: Option<String>,
}

impl FsCacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("failed to create cache root {}", root.display()))?;
        Ok(Self { root })
    }

    /// Request keys are arbitrary URLs; hash them into stable file names.
    fn file_stem(key: &str) -> String {
        let digest = Sha256::digest(key.as_bytes());
        hex_of(&digest[..16])
    }

    fn body_path(&self, store: &str, key: &str) -> PathBuf {
        self.root.join(store).join(format!("{}.bin", Self::file_stem(key)))
    }

    fn meta_path(&self, store: &str, key: &str) -> PathBuf {
        self.root.join(store).join(format!("{}.json", Self::file_stem(key)))
    }
}

fn hex_of(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

#[async_trait]
impl CacheStore for FsCacheStore {
    async fn get(&self, store: &str, key: &str) -> Result<Option<CacheEntry>> {
        let body_path = self.body_path(store, key);
        let meta_path = self.meta_path(store, key);
        let bytes = match tokio::fs::read(&body_path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).context("failed to read cache entry body"),
        };
        let content_type = match tokio::fs::read(&meta_path).await {
            Ok(raw) => serde_json::from_slice::<EntryMeta>(&raw)
                .ok()
                .and_then(|m| m.content_type),
            Err(_) => None,
        };
        Ok(Some(CacheEntry { bytes, content_type }))
    }

    async fn put(&self, store: &str, key: &str, entry: CacheEntry) -> Result<()> {
        let dir = self.root.join(store);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create store directory {}", dir.display()))?;
        let meta = EntryMeta {
            key: key.to_string(),
            content_type: entry.content_type.clone(),
        };
        tokio::fs::write(self.body_path(store, key), &entry.bytes)
            .await
            .context("failed to write cache entry body")?;
        tokio::fs::write(self.meta_path(store, key), serde_json::to_vec(&meta)?)
            .await
            .context("failed to write cache entry metadata")?;
        Ok(())
    }

    async fn contains(&self, store: &str, key: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.body_path(store, key)).await?)
    }

    async fn list_stores(&self) -> Result<Vec<String>> {
        let mut stores = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .context("failed to list cache root")?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    stores.push(name.to_string());
                }
            }
        }
        Ok(stores)
    }

    async fn delete_store(&self, store: &str) -> Result<()> {
        let dir = self.root.join(store);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("failed to delete store {store}")),
        }
    }
}

/// In-memory store, used by tests and embedders that do not want disk
/// persistence.
#[derive(Default)]
pub struct MemoryCacheStore {
    stores: RwLock<HashMap<String, HashMap<String, CacheEntry>>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seed a store, bypassing the worker. Test helper.
    pub fn seed(&self, store: &str, key: &str, entry: CacheEntry) {
        self.stores
            .write()
            .entry(store.to_string())
            .or_default()
            .insert(key.to_string(), entry);
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, store: &str, key: &str) -> Result<Option<CacheEntry>> {
        Ok(self
            .stores
            .read()
            .get(store)
            .and_then(|entries| entries.get(key))
            .cloned())
    }

    async fn put(&self, store: &str, key: &str, entry: CacheEntry) -> Result<()> {
        self.stores
            .write()
            .entry(store.to_string())
            .or_default()
            .insert(key.to_string(), entry);
        Ok(())
    }

    async fn list_stores(&self) -> Result<Vec<String>> {
        Ok(self.stores.read().keys().cloned().collect())
    }

    async fn delete_store(&self, store: &str) -> Result<()> {
        self.stores.write().remove(store);
        Ok(())
    }
}
