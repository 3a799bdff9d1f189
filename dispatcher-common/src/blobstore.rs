//! `BlobStore`: externalizes oversized envelopes, keyed by an opaque string.
//! All implementations are idempotent on `delete` and report `exists = false`
//! for missing keys.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use base64::Engine;
use uuid::Uuid;

#[derive(thiserror::Error, Debug)]
pub enum BlobStoreError {
    #[error("blob store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("blob store backend error: {0}")]
    Backend(String),
}

#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    fn name(&self) -> &str;
    async fn store(&self, key: &str, bytes: Vec<u8>) -> Result<(), BlobStoreError>;
    async fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>, BlobStoreError>;
    async fn delete(&self, key: &str) -> Result<(), BlobStoreError>;
    async fn exists(&self, key: &str) -> Result<bool, BlobStoreError>;
    fn generate_key(&self) -> String {
        Uuid::now_v7().to_string()
    }
}

/// A filesystem-backed `BlobStore`: one JSON-wrapped file per key, all
/// access serialized behind a mutex the way a single-process file store
/// needs to avoid torn writes.
pub struct FilesystemBlobStore {
    name: String,
    root: PathBuf,
    lock: Mutex<()>,
}

impl FilesystemBlobStore {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            lock: Mutex::new(()),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.json"))
    }
}

#[async_trait::async_trait]
impl BlobStore for FilesystemBlobStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn store(&self, key: &str, bytes: Vec<u8>) -> Result<(), BlobStoreError> {
        let path = self.path_for(key);
        let _guard = self.lock.lock().expect("poisoned mutex");
        std::fs::create_dir_all(&self.root)?;
        let envelope = serde_json::json!({ "bytes": base64::engine::general_purpose::STANDARD.encode(&bytes) });
        std::fs::write(path, serde_json::to_vec(&envelope).expect("envelope always serializes"))?;
        Ok(())
    }

    async fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>, BlobStoreError> {
        let path = self.path_for(key);
        let _guard = self.lock.lock().expect("poisoned mutex");
        match std::fs::read(path) {
            Ok(raw) => {
                let envelope: serde_json::Value = serde_json::from_slice(&raw)
                    .map_err(|e| BlobStoreError::Backend(e.to_string()))?;
                let encoded = envelope["bytes"]
                    .as_str()
                    .ok_or_else(|| BlobStoreError::Backend("malformed blob envelope".to_owned()))?;
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(encoded)
                    .map_err(|e| BlobStoreError::Backend(e.to_string()))?;
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), BlobStoreError> {
        let path = self.path_for(key);
        let _guard = self.lock.lock().expect("poisoned mutex");
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, BlobStoreError> {
        Ok(self.path_for(key).exists())
    }
}

/// An in-memory `BlobStore` fake for tests.
#[derive(Default)]
pub struct InMemoryBlobStore {
    name: String,
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryBlobStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            blobs: Mutex::default(),
        }
    }
}

#[async_trait::async_trait]
impl BlobStore for InMemoryBlobStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn store(&self, key: &str, bytes: Vec<u8>) -> Result<(), BlobStoreError> {
        self.blobs.lock().expect("poisoned mutex").insert(key.to_owned(), bytes);
        Ok(())
    }

    async fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>, BlobStoreError> {
        Ok(self.blobs.lock().expect("poisoned mutex").get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), BlobStoreError> {
        self.blobs.lock().expect("poisoned mutex").remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, BlobStoreError> {
        Ok(self.blobs.lock().expect("poisoned mutex").contains_key(key))
    }
}

/// `{"$ref": {"store": "<name>", "key": "<opaque>"}}`, the externalization
/// marker used for oversized envelopes.
pub fn external_ref(store_name: &str, key: &str) -> serde_json::Value {
    serde_json::json!({ "$ref": { "store": store_name, "key": key } })
}

pub fn as_external_ref(value: &serde_json::Value) -> Option<(&str, &str)> {
    let reference = value.get("$ref")?;
    Some((reference.get("store")?.as_str()?, reference.get("key")?.as_str()?))
}

/// Externalize `envelope` to `store` if its serialized size exceeds
/// `threshold_bytes`; otherwise return it unchanged.
pub async fn externalize_if_oversized(
    envelope: serde_json::Value,
    store: &dyn BlobStore,
    threshold_bytes: usize,
) -> Result<serde_json::Value, BlobStoreError> {
    let serialized = serde_json::to_vec(&envelope).expect("envelope always serializes");
    if serialized.len() <= threshold_bytes {
        return Ok(envelope);
    }

    let key = store.generate_key();
    store.store(&key, serialized).await?;
    Ok(external_ref(store.name(), &key))
}

/// Resolve `value` transparently if it is an externalization reference,
/// otherwise return it unchanged.
pub async fn resolve_ref(
    value: serde_json::Value,
    store: &dyn BlobStore,
) -> Result<serde_json::Value, BlobStoreError> {
    match as_external_ref(&value) {
        Some((store_name, key)) if store_name == store.name() => {
            let bytes = store
                .fetch(key)
                .await?
                .ok_or_else(|| BlobStoreError::Backend(format!("missing blob for key {key}")))?;
            serde_json::from_slice(&bytes).map_err(|e| BlobStoreError::Backend(e.to_string()))
        }
        _ => Ok(value),
    }
}
