use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ServiceError, ServiceResult};

/// Service configuration, read once at startup.
///
/// Sources, later ones winning: built-in defaults, an optional `config.*`
/// file in the working directory, then `FOLIO__SECTION__KEY` env vars.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_storage")]
    pub storage: StorageConfig,

    #[serde(default = "default_upload_queue")]
    pub upload_queue: QueueConfig,

    #[serde(default = "default_indexing_queue")]
    pub indexing_queue: QueueConfig,

    #[serde(default)]
    pub indexing: IndexingConfig,

    #[serde(default)]
    pub graph: GraphConfig,

    #[serde(default)]
    pub layout: LayoutConfig,

    #[serde(default)]
    pub captioning: CaptioningConfig,

    #[serde(default)]
    pub rendering: RenderingConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub workers: WorkersConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Local storage layout
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl StorageConfig {
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("folio.db")
    }

    pub fn objects_dir(&self) -> PathBuf {
        self.data_dir.join("objects")
    }

    /// Parent for per-document temporary working directories.
    pub fn scratch_dir(&self) -> PathBuf {
        self.data_dir.join("scratch")
    }
}

/// Polling and poison policy for one work queue
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    pub name: String,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,

    /// Deliveries beyond this count are dropped as poison (2 = three attempts).
    #[serde(default = "default_max_dequeue_count")]
    pub max_dequeue_count: u32,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Messages from one batch handled at the same time.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl QueueConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// External indexer (ingestion job API + search service)
#[derive(Debug, Clone, Deserialize)]
pub struct IndexingConfig {
    #[serde(default)]
    pub endpoint: String,

    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_indexing_api_version")]
    pub api_version: String,

    #[serde(default)]
    pub search_endpoint: String,

    #[serde(default)]
    pub search_api_key: String,

    #[serde(default = "default_search_api_version")]
    pub search_api_version: String,

    #[serde(default)]
    pub storage_account: String,

    #[serde(default)]
    pub subscription_id: String,

    #[serde(default)]
    pub resource_group: String,

    #[serde(default)]
    pub embedding_deployment: String,

    #[serde(default = "default_max_chunk_size_tokens")]
    pub max_chunk_size_tokens: u32,

    #[serde(default = "default_status_poll_interval_secs")]
    pub status_poll_interval_secs: u64,

    /// How long a terminal status row stays readable before it is deleted.
    #[serde(default = "default_cleanup_grace_secs")]
    pub cleanup_grace_secs: u64,

    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl IndexingConfig {
    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_secs(self.status_poll_interval_secs)
    }

    pub fn cleanup_grace(&self) -> Duration {
        Duration::from_secs(self.cleanup_grace_secs)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: String::new(),
            api_version: default_indexing_api_version(),
            search_endpoint: String::new(),
            search_api_key: String::new(),
            search_api_version: default_search_api_version(),
            storage_account: String::new(),
            subscription_id: String::new(),
            resource_group: String::new(),
            embedding_deployment: String::new(),
            max_chunk_size_tokens: default_max_chunk_size_tokens(),
            status_poll_interval_secs: default_status_poll_interval_secs(),
            cleanup_grace_secs: default_cleanup_grace_secs(),
            job_timeout_secs: default_job_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Graph-processing service
#[derive(Debug, Clone, Deserialize)]
pub struct GraphConfig {
    #[serde(default)]
    pub endpoint: String,

    #[serde(default)]
    pub api_key: String,

    /// The graph stage runs synchronously and can take a long time.
    #[serde(default = "default_graph_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: String::new(),
            request_timeout_secs: default_graph_timeout_secs(),
        }
    }
}

/// Layout-extraction service
#[derive(Debug, Clone, Deserialize)]
pub struct LayoutConfig {
    #[serde(default)]
    pub endpoint: String,

    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_layout_api_version")]
    pub api_version: String,

    #[serde(default = "default_layout_model")]
    pub model: String,

    #[serde(default = "default_layout_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_layout_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_layout_max_polls")]
    pub max_polls: u32,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: String::new(),
            api_version: default_layout_api_version(),
            model: default_layout_model(),
            request_timeout_secs: default_layout_timeout_secs(),
            poll_interval_ms: default_layout_poll_interval_ms(),
            max_polls: default_layout_max_polls(),
        }
    }
}

/// Vision model used to caption figures on multimodal uploads
#[derive(Debug, Clone, Deserialize)]
pub struct CaptioningConfig {
    #[serde(default = "default_captioning_url")]
    pub base_url: String,

    /// Empty disables figure captioning even for multimodal uploads.
    #[serde(default)]
    pub model: String,

    #[serde(default = "default_captioning_prompt")]
    pub prompt: String,

    #[serde(default = "default_layout_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for CaptioningConfig {
    fn default() -> Self {
        Self {
            base_url: default_captioning_url(),
            model: String::new(),
            prompt: default_captioning_prompt(),
            request_timeout_secs: default_layout_timeout_secs(),
        }
    }
}

/// Page rasterization
#[derive(Debug, Clone, Deserialize)]
pub struct RenderingConfig {
    #[serde(default = "default_dpi")]
    pub dpi: u32,

    /// Directory holding libpdfium; falls back to ./ and the system library path.
    #[serde(default)]
    pub pdfium_library_dir: Option<PathBuf>,
}

impl Default for RenderingConfig {
    fn default() -> Self {
        Self {
            dpi: default_dpi(),
            pdfium_library_dir: None,
        }
    }
}

/// Backoff for rate-limited external calls
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_min_delay_secs")]
    pub min_delay_secs: u64,

    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            min_delay_secs: default_min_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
        }
    }
}

/// Which consumers this process runs
#[derive(Debug, Clone, Deserialize)]
pub struct WorkersConfig {
    #[serde(default = "default_true")]
    pub upload_enabled: bool,

    #[serde(default = "default_true")]
    pub indexing_enabled: bool,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            upload_enabled: true,
            indexing_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsConfig {
    /// e.g. "0.0.0.0:9100". No exporter is installed when unset.
    #[serde(default)]
    pub listen_addr: Option<String>,
}

impl Settings {
    /// Load settings from `config.*` and `FOLIO__*` environment variables.
    pub fn load() -> ServiceResult<Self> {
        Self::from_builder(
            Config::builder()
                .add_source(File::with_name("config").required(false))
                .add_source(
                    Environment::with_prefix("FOLIO")
                        .separator("__")
                        .try_parsing(true),
                ),
        )
    }

    fn from_builder(builder: ConfigBuilder<DefaultState>) -> ServiceResult<Self> {
        let builder = queue_defaults(builder, "upload_queue", &default_upload_queue())
            .and_then(|builder| {
                queue_defaults(builder, "indexing_queue", &default_indexing_queue())
            })
            .map_err(|e| ServiceError::Config {
                message: format!("Failed to set queue defaults: {}", e),
            })?;

        let settings: Settings = builder
            .build()
            .map_err(|e| ServiceError::Config {
                message: format!("Failed to build config: {}", e),
            })?
            .try_deserialize()
            .map_err(|e| ServiceError::Config {
                message: format!("Failed to deserialize config: {}", e),
            })?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> ServiceResult<()> {
        for queue in [&self.upload_queue, &self.indexing_queue] {
            if queue.name.trim().is_empty() {
                return Err(ServiceError::Config {
                    message: "queue name must not be empty".to_string(),
                });
            }
            if queue.batch_size == 0 || queue.concurrency == 0 {
                return Err(ServiceError::Config {
                    message: format!(
                        "queue {}: batch_size and concurrency must be at least 1",
                        queue.name
                    ),
                });
            }
        }
        if self.upload_queue.name == self.indexing_queue.name {
            return Err(ServiceError::Config {
                message: "upload and indexing queues must have different names".to_string(),
            });
        }
        if self.rendering.dpi == 0 {
            return Err(ServiceError::Config {
                message: "rendering.dpi must be positive".to_string(),
            });
        }
        Ok(())
    }
}

// ==================== Default Value Functions ====================

fn default_storage() -> StorageConfig {
    StorageConfig {
        data_dir: default_data_dir(),
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_upload_queue() -> QueueConfig {
    QueueConfig {
        name: "ingestion".to_string(),
        batch_size: default_batch_size(),
        visibility_timeout_secs: 300,
        max_dequeue_count: default_max_dequeue_count(),
        poll_interval_secs: 5,
        concurrency: default_concurrency(),
    }
}

fn default_indexing_queue() -> QueueConfig {
    QueueConfig {
        name: "indexing".to_string(),
        batch_size: default_batch_size(),
        visibility_timeout_secs: 600,
        max_dequeue_count: default_max_dequeue_count(),
        poll_interval_secs: 10,
        concurrency: default_concurrency(),
    }
}

/// Registers every key of one queue section as a default, so a source that
/// sets a single key still inherits that queue's name and timings.
fn queue_defaults(
    builder: ConfigBuilder<DefaultState>,
    section: &str,
    defaults: &QueueConfig,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    builder
        .set_default(format!("{section}.name"), defaults.name.as_str())?
        .set_default(format!("{section}.batch_size"), defaults.batch_size as u64)?
        .set_default(
            format!("{section}.visibility_timeout_secs"),
            defaults.visibility_timeout_secs,
        )?
        .set_default(
            format!("{section}.max_dequeue_count"),
            u64::from(defaults.max_dequeue_count),
        )?
        .set_default(
            format!("{section}.poll_interval_secs"),
            defaults.poll_interval_secs,
        )?
        .set_default(format!("{section}.concurrency"), defaults.concurrency as u64)
}

fn default_batch_size() -> usize {
    32
}

fn default_visibility_timeout_secs() -> u64 {
    300
}

fn default_max_dequeue_count() -> u32 {
    2
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_concurrency() -> usize {
    1
}

fn default_indexing_api_version() -> String {
    "2024-05-01-preview".to_string()
}

fn default_search_api_version() -> String {
    "2020-06-30".to_string()
}

fn default_max_chunk_size_tokens() -> u32 {
    2048
}

fn default_status_poll_interval_secs() -> u64 {
    60
}

fn default_cleanup_grace_secs() -> u64 {
    60
}

fn default_job_timeout_secs() -> u64 {
    24 * 60 * 60 // 24 hours
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_graph_timeout_secs() -> u64 {
    60 * 60
}

fn default_layout_api_version() -> String {
    "2024-11-30".to_string()
}

fn default_layout_model() -> String {
    "prebuilt-layout".to_string()
}

fn default_layout_timeout_secs() -> u64 {
    120
}

fn default_layout_poll_interval_ms() -> u64 {
    1000
}

fn default_layout_max_polls() -> u32 {
    120
}

fn default_captioning_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_captioning_prompt() -> String {
    "Describe this figure from a document page. Focus on what it shows \
     (charts, diagrams, photos, tables) and any legible text or numbers. \
     Be concise but complete; the description replaces the figure for search."
        .to_string()
}

fn default_dpi() -> u32 {
    200
}

fn default_max_attempts() -> u32 {
    10
}

fn default_min_delay_secs() -> u64 {
    4
}

fn default_max_delay_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_sources() {
        let settings = Settings::from_builder(Config::builder()).unwrap();

        assert_eq!(settings.upload_queue.name, "ingestion");
        assert_eq!(settings.upload_queue.batch_size, 32);
        assert_eq!(settings.upload_queue.visibility_timeout_secs, 300);
        assert_eq!(settings.upload_queue.max_dequeue_count, 2);
        assert_eq!(settings.upload_queue.poll_interval_secs, 5);

        assert_eq!(settings.indexing_queue.name, "indexing");
        assert_eq!(settings.indexing_queue.visibility_timeout_secs, 600);
        assert_eq!(settings.indexing_queue.poll_interval_secs, 10);

        assert_eq!(settings.indexing.status_poll_interval(), Duration::from_secs(60));
        assert_eq!(settings.indexing.cleanup_grace(), Duration::from_secs(60));
        assert_eq!(settings.rendering.dpi, 200);
        assert_eq!(settings.retry.max_attempts, 10);
        assert!(settings.workers.upload_enabled && settings.workers.indexing_enabled);
        assert!(settings.metrics.listen_addr.is_none());
        assert_eq!(
            settings.storage.database_path(),
            PathBuf::from("./data/folio.db")
        );
    }

    #[test]
    fn test_overrides_apply() {
        let builder = Config::builder()
            .set_override("upload_queue.name", "uploads")
            .unwrap()
            .set_override("upload_queue.max_dequeue_count", 5)
            .unwrap()
            .set_override("indexing.cleanup_grace_secs", 0)
            .unwrap();

        let settings = Settings::from_builder(builder).unwrap();
        assert_eq!(settings.upload_queue.name, "uploads");
        assert_eq!(settings.upload_queue.max_dequeue_count, 5);
        // Unset keys within an overridden section keep their defaults
        assert_eq!(settings.upload_queue.batch_size, 32);
        assert_eq!(settings.indexing.cleanup_grace(), Duration::ZERO);
    }

    #[test]
    fn test_single_queue_key_keeps_queue_defaults() {
        let builder = Config::builder()
            .set_override("upload_queue.max_dequeue_count", 4)
            .unwrap()
            .set_override("indexing_queue.max_dequeue_count", 5)
            .unwrap();

        let settings = Settings::from_builder(builder).unwrap();
        assert_eq!(settings.upload_queue.name, "ingestion");
        assert_eq!(settings.upload_queue.max_dequeue_count, 4);
        assert_eq!(settings.upload_queue.visibility_timeout_secs, 300);

        assert_eq!(settings.indexing_queue.name, "indexing");
        assert_eq!(settings.indexing_queue.max_dequeue_count, 5);
        assert_eq!(settings.indexing_queue.visibility_timeout_secs, 600);
        assert_eq!(settings.indexing_queue.poll_interval_secs, 10);
    }

    #[test]
    fn test_same_queue_names_rejected() {
        let builder = Config::builder()
            .set_override("upload_queue.name", "shared")
            .unwrap()
            .set_override("indexing_queue.name", "shared")
            .unwrap();

        assert!(matches!(
            Settings::from_builder(builder),
            Err(ServiceError::Config { .. })
        ));
    }
}
