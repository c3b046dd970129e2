//! Document storage for plugin records, workflows and settings.
//!
//! Stores are opaque key/value collections of JSON documents with an
//! optimistic revision counter. A write must name the revision it replaces;
//! a stale revision is rejected with [`PluginError::Conflict`].

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{PluginError, PluginResult};

/// A stored document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    /// Revision, incremented on every write.
    pub rev: u64,
    pub body: Value,
}

/// A collection of documents.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Get a document by id.
    async fn get(&self, id: &str) -> PluginResult<Option<Document>>;

    /// Write a document. `rev` must be the current revision, or `None` for a new id.
    async fn put(&self, id: &str, body: Value, rev: Option<u64>) -> PluginResult<u64>;

    /// Remove a document, returning whether it existed.
    async fn remove(&self, id: &str) -> PluginResult<bool>;

    /// All documents ordered by id.
    async fn all(&self) -> PluginResult<Vec<Document>>;

    /// Write a document over whatever revision is current.
    async fn upsert(&self, id: &str, body: Value) -> PluginResult<u64> {
        let current = self.get(id).await?.map(|d| d.rev);
        self.put(id, body, current).await
    }
}

/// Opens named stores (`config`, `<workspace>_workspace`, ...).
pub trait StoreProvider: Send + Sync {
    fn open(&self, name: &str) -> PluginResult<Arc<dyn DocumentStore>>;
}

fn check_rev(id: &str, current: Option<u64>, expected: Option<u64>) -> PluginResult<u64> {
    if current != expected {
        return Err(PluginError::Conflict(id.to_string()));
    }
    Ok(current.unwrap_or(0) + 1)
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: Mutex<BTreeMap<String, Document>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, id: &str) -> PluginResult<Option<Document>> {
        Ok(self.docs.lock().get(id).cloned())
    }

    async fn put(&self, id: &str, body: Value, rev: Option<u64>) -> PluginResult<u64> {
        let mut docs = self.docs.lock();
        let next = check_rev(id, docs.get(id).map(|d| d.rev), rev)?;
        docs.insert(id.to_string(), Document { id: id.to_string(), rev: next, body });
        Ok(next)
    }

    async fn remove(&self, id: &str) -> PluginResult<bool> {
        Ok(self.docs.lock().remove(id).is_some())
    }

    async fn all(&self) -> PluginResult<Vec<Document>> {
        Ok(self.docs.lock().values().cloned().collect())
    }
}

/// Provider handing out shared in-memory stores.
#[derive(Debug, Default)]
pub struct MemoryStoreProvider {
    stores: Mutex<HashMap<String, Arc<MemoryStore>>>,
}

impl MemoryStoreProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StoreProvider for MemoryStoreProvider {
    fn open(&self, name: &str) -> PluginResult<Arc<dyn DocumentStore>> {
        let store: Arc<dyn DocumentStore> = self.stores.lock().entry(name.to_string()).or_default().clone();
        Ok(store)
    }
}

/// Store keeping one JSON file per document in a directory.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    // Serializes read-modify-write cycles within this process.
    write_lock: tokio::sync::Mutex<()>,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), write_lock: tokio::sync::Mutex::new(()) }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", urlencoding::encode(id)))
    }

    async fn read(path: &Path) -> PluginResult<Option<Document>> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PluginError::Storage(format!("{}: {e}", path.display()))),
        }
    }
}

#[async_trait]
impl DocumentStore for FileStore {
    async fn get(&self, id: &str) -> PluginResult<Option<Document>> {
        Self::read(&self.path_for(id)).await
    }

    async fn put(&self, id: &str, body: Value, rev: Option<u64>) -> PluginResult<u64> {
        let _guard = self.write_lock.lock().await;
        let path = self.path_for(id);

        let current = Self::read(&path).await?.map(|d| d.rev);
        let next = check_rev(id, current, rev)?;

        tokio::fs::create_dir_all(&self.dir).await?;
        let doc = Document { id: id.to_string(), rev: next, body };
        tokio::fs::write(&path, serde_json::to_string_pretty(&doc)?).await?;
        Ok(next)
    }

    async fn remove(&self, id: &str) -> PluginResult<bool> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn all(&self) -> PluginResult<Vec<Document>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut docs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read(&path).await {
                Ok(Some(doc)) => docs.push(doc),
                Ok(None) => {}
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable document"),
            }
        }
        docs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(docs)
    }
}

/// Provider opening file stores under a data directory.
#[derive(Debug, Clone)]
pub struct FileStoreProvider {
    root: PathBuf,
}

impl FileStoreProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl StoreProvider for FileStoreProvider {
    fn open(&self, name: &str) -> PluginResult<Arc<dyn DocumentStore>> {
        if name.is_empty() || name.contains(['/', '\\']) || name == ".." {
            return Err(PluginError::Storage(format!("invalid store name: {name:?}")));
        }
        Ok(Arc::new(FileStore::new(self.root.join(name))))
    }
}
