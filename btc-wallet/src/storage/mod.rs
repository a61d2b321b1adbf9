//! Storage abstraction for the wallet.
//!
//! All persistence goes through a flat key-value interface. Each component
//! works against a [`StoreHandle`], a named sub-instance of the shared
//! backend that prefixes every key, so backends stay oblivious to the
//! wallet's layout.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{StorageError, StorageResult};

pub use memory::MemoryStore;

/// Key-value backend trait.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a value.
    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Write a value.
    async fn set(&self, key: &str, value: &[u8]) -> StorageResult<()>;

    /// Delete a value. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// All `(key, value)` pairs whose key starts with `prefix`.
    async fn entries(&self, prefix: &str) -> StorageResult<Vec<(String, Vec<u8>)>>;

    /// Remove everything.
    async fn clear(&self) -> StorageResult<()>;
}

/// A named view onto the backend. Cloning is cheap; handles created via
/// [`StoreHandle::namespace`] share the backend with their parent.
#[derive(Clone)]
pub struct StoreHandle {
    backend: Arc<dyn KeyValueStore>,
    prefix: String,
}

impl StoreHandle {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self {
            backend,
            prefix: String::new(),
        }
    }

    /// Spawn a named sub-instance.
    pub fn namespace(&self, name: &str) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            prefix: format!("{}{}/", self.prefix, name),
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    pub async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        self.backend.get(&self.full_key(key)).await
    }

    pub async fn set(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        self.backend.set(&self.full_key(key), value).await
    }

    pub async fn delete(&self, key: &str) -> StorageResult<()> {
        self.backend.delete(&self.full_key(key)).await
    }

    /// Entries under this namespace, keys returned with the namespace
    /// prefix stripped.
    pub async fn entries(&self, prefix: &str) -> StorageResult<Vec<(String, Vec<u8>)>> {
        let full = self.full_key(prefix);
        let raw = self.backend.entries(&full).await?;
        Ok(raw
            .into_iter()
            .map(|(k, v)| (k[self.prefix.len()..].to_string(), v))
            .collect())
    }

    /// Delete every entry under this namespace.
    pub async fn clear(&self) -> StorageResult<()> {
        if self.prefix.is_empty() {
            return self.backend.clear().await;
        }
        for (key, _) in self.backend.entries(&self.prefix).await? {
            self.backend.delete(&key).await?;
        }
        Ok(())
    }

    /// Read and deserialize a JSON value.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> StorageResult<Option<T>> {
        match self.get(key).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StorageError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    /// Serialize and write a JSON value.
    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T) -> StorageResult<()> {
        let bytes =
            serde_json::to_vec(value).map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.set(key, &bytes).await
    }
}
