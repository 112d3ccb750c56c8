//! Queue message payloads and the per-page object naming convention.

use serde::{Deserialize, Serialize};

use crate::error::MessageError;

/// Reserved separator between the original filename and the page suffix.
pub const PAGE_SEPARATOR: &str = "___";

/// Upload queue payload: one landed PDF waiting to be split into pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadMessage {
    pub filename: String,
    pub user_id: String,
    pub index_name: String,
    pub is_restricted: bool,
    pub num_pages: u32,
    pub blob_url: String,
    #[serde(default)]
    pub is_multimodal: bool,
    pub ingestion_container: String,
    pub reference_container: String,
    pub lz_container: String,
}

/// Indexing queue payload. `job_id` always equals `container_name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexingJobMessage {
    pub job_id: String,
    pub container_name: String,
    pub user_id: String,
    pub index_name: String,
    pub is_restricted: bool,
}

impl UploadMessage {
    pub fn decode(body: &str) -> Result<Self, MessageError> {
        serde_json::from_str(body).map_err(MessageError::Decode)
    }

    pub fn encode(&self) -> Result<String, MessageError> {
        serde_json::to_string(self).map_err(MessageError::Encode)
    }
}

impl IndexingJobMessage {
    pub fn decode(body: &str) -> Result<Self, MessageError> {
        let message: Self = serde_json::from_str(body).map_err(MessageError::Decode)?;
        if message.job_id != message.container_name {
            return Err(MessageError::JobIdMismatch {
                job_id: message.job_id,
                container_name: message.container_name,
            });
        }
        Ok(message)
    }

    pub fn encode(&self) -> Result<String, MessageError> {
        serde_json::to_string(self).map_err(MessageError::Encode)
    }
}

/// The three artifacts produced for every page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    /// Single-page PDF, reference store
    Pdf,
    /// Rendered page image, reference store
    Png,
    /// Extracted markdown, ingestion store
    Markdown,
}

impl ArtifactKind {
    pub fn extension(&self) -> &'static str {
        match self {
            ArtifactKind::Pdf => "pdf",
            ArtifactKind::Png => "png",
            ArtifactKind::Markdown => "md",
        }
    }
}

/// `{filename}___Page{page_index + 1}.{ext}`; downstream retrieval joins on this.
pub fn page_object_key(filename: &str, page_index: u32, kind: ArtifactKind) -> String {
    format!(
        "{filename}{PAGE_SEPARATOR}Page{}.{}",
        page_index + 1,
        kind.extension()
    )
}

/// Reject upload filenames that would make page keys ambiguous.
pub fn validate_upload_filename(filename: &str) -> Result<(), MessageError> {
    if filename.contains(PAGE_SEPARATOR) {
        return Err(MessageError::ReservedSeparator {
            filename: filename.to_string(),
        });
    }
    Ok(())
}
