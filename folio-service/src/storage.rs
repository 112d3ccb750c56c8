//! Container/key object storage.
//!
//! Implementations:
//! - `FsObjectStore`: one directory per container under a root
//! - `MemoryObjectStore`: process-local map, for tests

mod fs;
mod memory;

pub use fs::FsObjectStore;
pub use memory::MemoryObjectStore;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Url;

use crate::error::{ServiceResult, StorageError};

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch an object. Missing objects fail with `StorageError::NotFound`.
    async fn get(&self, container: &str, key: &str) -> ServiceResult<Bytes>;

    /// Create or overwrite an object.
    async fn put(&self, container: &str, key: &str, data: Bytes) -> ServiceResult<()>;

    /// Remove an object. Already absent is success.
    async fn delete(&self, container: &str, key: &str) -> ServiceResult<()>;

    /// Keys in a container, sorted. A missing container lists as empty.
    async fn list(&self, container: &str) -> ServiceResult<Vec<String>>;

    async fn exists(&self, container: &str, key: &str) -> ServiceResult<bool>;
}

/// Where an uploaded blob lives, resolved from its URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectLocation {
    pub container: String,
    pub key: String,
}

impl ObjectLocation {
    /// Resolve `https://<account>/<container>/<key>` or
    /// `file:///<root>/<container>/<key>`. The key is percent-decoded.
    pub fn parse(blob_url: &str) -> Result<Self, StorageError> {
        let invalid = || StorageError::InvalidLocation {
            url: blob_url.to_string(),
        };

        let url = Url::parse(blob_url).map_err(|_| invalid())?;
        let segments: Vec<&str> = url
            .path_segments()
            .map(|s| s.filter(|seg| !seg.is_empty()).collect())
            .unwrap_or_default();

        let (container, key_segments) = match url.scheme() {
            // Local files: only the last two segments matter
            "file" if segments.len() >= 2 => {
                let split = segments.len() - 1;
                (segments[split - 1], &segments[split..])
            }
            "http" | "https" if segments.len() >= 2 => (segments[0], &segments[1..]),
            _ => return Err(invalid()),
        };

        let decode = |raw: &str| {
            urlencoding::decode(raw)
                .map(|s| s.into_owned())
                .map_err(|_| invalid())
        };
        let key = key_segments
            .iter()
            .map(|&seg| decode(seg))
            .collect::<Result<Vec<_>, _>>()?
            .join("/");

        Ok(Self {
            container: decode(container)?,
            key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_blob_url() {
        let loc = ObjectLocation::parse(
            "https://acct.blob.core.windows.net/u1-idx1-lz/Quarterly%20Report.pdf",
        )
        .unwrap();
        assert_eq!(loc.container, "u1-idx1-lz");
        assert_eq!(loc.key, "Quarterly Report.pdf");
    }

    #[test]
    fn test_parse_file_url() {
        let loc = ObjectLocation::parse("file:///var/lib/folio/objects/u1-idx1-lz/report.pdf")
            .unwrap();
        assert_eq!(loc.container, "u1-idx1-lz");
        assert_eq!(loc.key, "report.pdf");
    }

    #[test]
    fn test_parse_rejects_urls_without_key() {
        assert!(ObjectLocation::parse("https://acct.blob.core.windows.net/only-container").is_err());
        assert!(ObjectLocation::parse("not a url").is_err());
    }
}
