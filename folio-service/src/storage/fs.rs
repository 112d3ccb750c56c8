use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::ObjectStore;
use crate::error::{ServiceResult, StorageError};

const TEMP_PREFIX: &str = ".tmp-";

/// Objects stored as `<root>/<container>/<key>`.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn container_dir(&self, container: &str) -> Result<PathBuf, StorageError> {
        validate_name(container)?;
        Ok(self.root.join(container))
    }

    fn object_path(&self, container: &str, key: &str) -> Result<PathBuf, StorageError> {
        validate_name(key)?;
        Ok(self.container_dir(container)?.join(key))
    }
}

/// Names map straight onto path components, so anything that could escape
/// the container directory or collide with temp files is refused.
fn validate_name(name: &str) -> Result<(), StorageError> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
        || name.starts_with(TEMP_PREFIX);
    if bad {
        return Err(StorageError::InvalidName {
            name: name.to_string(),
        });
    }
    Ok(())
}

fn io_error(path: &Path, source: std::io::Error) -> StorageError {
    StorageError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn get(&self, container: &str, key: &str) -> ServiceResult<Bytes> {
        let path = self.object_path(container, key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::NotFound {
                container: container.to_string(),
                key: key.to_string(),
            }
            .into()),
            Err(e) => Err(io_error(&path, e).into()),
        }
    }

    async fn put(&self, container: &str, key: &str, data: Bytes) -> ServiceResult<()> {
        let path = self.object_path(container, key)?;
        let dir = self.container_dir(container)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error(&dir, e))?;

        // Write beside the target then rename, so readers never see a partial object
        let temp = dir.join(format!("{TEMP_PREFIX}{}", Uuid::new_v4()));
        if let Err(e) = tokio::fs::write(&temp, &data).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(io_error(&temp, e).into());
        }
        if let Err(e) = tokio::fs::rename(&temp, &path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(io_error(&path, e).into());
        }
        Ok(())
    }

    async fn delete(&self, container: &str, key: &str) -> ServiceResult<()> {
        let path = self.object_path(container, key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&path, e).into()),
        }
    }

    async fn list(&self, container: &str) -> ServiceResult<Vec<String>> {
        let dir = self.container_dir(container)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&dir, e).into()),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(&dir, e))? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(TEMP_PREFIX) {
                continue;
            }
            keys.push(name);
        }
        keys.sort();
        Ok(keys)
    }

    async fn exists(&self, container: &str, key: &str) -> ServiceResult<bool> {
        let path = self.object_path(container, key)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| io_error(&path, e).into())
    }
}
