//! Storage container names derived from (user, index, restriction flag).
//!
//! Every per-index resource hangs off one sanitized base name, so the
//! ingestion container name doubles as the indexing job id.

use serde::{Deserialize, Serialize};

use crate::error::{ServiceError, ServiceResult};

/// Upper bound imposed by the blob service on container names.
pub const MAX_CONTAINER_NAME_LENGTH: usize = 63;

const INGESTION_SUFFIX: &str = "-ingestion";
const REFERENCE_SUFFIX: &str = "-reference";
const LZ_SUFFIX: &str = "-lz";
const GRDATA_SUFFIX: &str = "-grdata";
const GRREP_SUFFIX: &str = "-grrep";
const GRCACHE_SUFFIX: &str = "-grcache";

/// The full set of containers belonging to one index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerNames {
    base: String,
}

impl ContainerNames {
    pub fn derive(user_id: &str, index_name: &str, is_restricted: bool) -> ServiceResult<Self> {
        let prefix = if is_restricted {
            format!("{user_id}-")
        } else {
            "open-".to_string()
        };
        let base = sanitize_container_name(&format!("{prefix}{index_name}"));

        let longest_suffix = [
            INGESTION_SUFFIX,
            REFERENCE_SUFFIX,
            LZ_SUFFIX,
            GRDATA_SUFFIX,
            GRREP_SUFFIX,
            GRCACHE_SUFFIX,
        ]
        .iter()
        .map(|s| s.len())
        .max()
        .unwrap_or_default();
        let max_base = MAX_CONTAINER_NAME_LENGTH - longest_suffix;

        if base.is_empty() {
            return Err(ServiceError::InvalidRequest {
                message: "index name produces an empty container name".to_string(),
            });
        }
        if base.len() > max_base {
            return Err(ServiceError::InvalidRequest {
                message: format!(
                    "combined user id and index name must be at most {max_base} characters after sanitization"
                ),
            });
        }

        Ok(Self { base })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn ingestion(&self) -> String {
        format!("{}{INGESTION_SUFFIX}", self.base)
    }

    pub fn reference(&self) -> String {
        format!("{}{REFERENCE_SUFFIX}", self.base)
    }

    pub fn landing_zone(&self) -> String {
        format!("{}{LZ_SUFFIX}", self.base)
    }

    pub fn graph_data(&self) -> String {
        format!("{}{GRDATA_SUFFIX}", self.base)
    }

    pub fn graph_reports(&self) -> String {
        format!("{}{GRREP_SUFFIX}", self.base)
    }

    pub fn graph_cache(&self) -> String {
        format!("{}{GRCACHE_SUFFIX}", self.base)
    }

    /// Search index built by the external indexer; named after the ingestion container.
    pub fn search_index(&self) -> String {
        self.ingestion()
    }
}

/// Lowercase, map anything outside `[a-z0-9-]` to `-`, trim and collapse hyphens.
pub fn sanitize_container_name(name: &str) -> String {
    let mut sanitized = String::with_capacity(name.len());
    for c in name.to_lowercase().chars() {
        let c = if c.is_ascii_lowercase() || c.is_ascii_digit() {
            c
        } else {
            '-'
        };
        if c == '-' && (sanitized.is_empty() || sanitized.ends_with('-')) {
            continue;
        }
        sanitized.push(c);
    }
    while sanitized.ends_with('-') {
        sanitized.pop();
    }
    sanitized.truncate(MAX_CONTAINER_NAME_LENGTH);
    sanitized
}
