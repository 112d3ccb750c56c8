use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Mutex;

use super::ObjectStore;
use crate::error::{ServiceResult, StorageError};

/// In-memory object store. Keeps a log of deletes so tests can assert on them.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<(String, String), Bytes>>,
    deletes: Mutex<Vec<(String, String)>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `(container, key)` passed to `delete`, in call order.
    pub fn deleted(&self) -> Vec<(String, String)> {
        self.deletes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Total number of stored objects across all containers.
    pub fn len(&self) -> usize {
        self.objects.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, container: &str, key: &str) -> ServiceResult<Bytes> {
        let objects = self.objects.lock().unwrap_or_else(|p| p.into_inner());
        objects
            .get(&(container.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| {
                StorageError::NotFound {
                    container: container.to_string(),
                    key: key.to_string(),
                }
                .into()
            })
    }

    async fn put(&self, container: &str, key: &str, data: Bytes) -> ServiceResult<()> {
        self.objects
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert((container.to_string(), key.to_string()), data);
        Ok(())
    }

    async fn delete(&self, container: &str, key: &str) -> ServiceResult<()> {
        let id = (container.to_string(), key.to_string());
        self.objects
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&id);
        self.deletes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(id);
        Ok(())
    }

    async fn list(&self, container: &str) -> ServiceResult<Vec<String>> {
        let objects = self.objects.lock().unwrap_or_else(|p| p.into_inner());
        Ok(objects
            .keys()
            .filter(|(c, _)| c == container)
            .map(|(_, k)| k.clone())
            .collect())
    }

    async fn exists(&self, container: &str, key: &str) -> ServiceResult<bool> {
        let objects = self.objects.lock().unwrap_or_else(|p| p.into_inner());
        Ok(objects.contains_key(&(container.to_string(), key.to_string())))
    }
}
