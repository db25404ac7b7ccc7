//! Configuration management for the pipeline, using the `prefer` crate for
//! discovery (same pattern the teacher used for its own `Config`) scoped down
//! to the pipeline's own settings.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// `pdf_chunk_threshold_pages` (§2/§6): documents at or under this page count
/// are processed synchronously in one job.
fn default_chunk_threshold_pages() -> u32 {
    15
}

/// `pdf_chunk_size_pages` (§2/§6): page count per chunk once a document is
/// routed to chunked processing.
fn default_chunk_size_pages() -> u32 {
    15
}

fn default_worker_concurrency() -> usize {
    crate::worker::DEFAULT_CONCURRENCY
}

fn default_task_soft_timeout_s() -> u64 {
    crate::worker::SOFT_TIMEOUT.as_secs()
}

fn default_task_hard_timeout_s() -> u64 {
    crate::worker::HARD_TIMEOUT.as_secs()
}

fn default_job_stale_timeout_minutes() -> i64 {
    crate::recovery::JOB_STALE_TIMEOUT_MINUTES
}

fn default_chunk_stale_timeout_minutes() -> i64 {
    crate::recovery::CHUNK_STALE_TIMEOUT_MINUTES
}

fn default_job_max_recovery_retries() -> u32 {
    crate::recovery::JOB_MAX_RECOVERY_RETRIES
}

fn default_chunk_lock_ttl_s() -> u64 {
    crate::pipeline::ocr_chunk::CHUNK_LOCK_TTL.as_secs()
}

fn default_cache_query_ttl_s() -> u64 {
    crate::cache::DEFAULT_QUERY_TTL_SECS
}

fn default_chunk_parent_tokens_min() -> u32 {
    crate::models::PARENT_TOKENS_MIN
}

fn default_chunk_parent_tokens_max() -> u32 {
    crate::models::PARENT_TOKENS_MAX
}

fn default_chunk_child_tokens_min() -> u32 {
    crate::models::CHILD_TOKENS_MIN
}

fn default_chunk_child_tokens_max() -> u32 {
    crate::models::CHILD_TOKENS_MAX
}

fn default_chunk_child_overlap_ratio() -> f32 {
    crate::models::CHILD_OVERLAP_RATIO
}

fn default_websocket_ping_interval_s() -> u64 {
    crate::realtime::DEFAULT_PING_INTERVAL.as_secs()
}

fn default_ocr_provider() -> String {
    "ocr-vendor-a".to_string()
}

fn default_embedding_provider() -> String {
    "embedding-vendor-a".to_string()
}

fn default_extraction_provider() -> String {
    "extraction-vendor-a".to_string()
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_database_filename() -> String {
    "pipeline.db".to_string()
}

/// Per-provider rate limit, matching the `{max_concurrent, min_delay_s, rpm}`
/// shape enumerated in §6.
#[derive(Debug, Clone, Serialize, Deserialize, prefer::FromValue)]
pub struct ProviderLimitConfig {
    #[serde(default = "default_max_concurrent")]
    #[prefer(default = "4")]
    pub max_concurrent: u32,
    #[serde(default = "default_min_delay_s")]
    #[prefer(default = "0")]
    pub min_delay_s: f64,
    #[serde(default)]
    #[prefer(default)]
    pub rpm: Option<u32>,
}

fn default_max_concurrent() -> u32 {
    4
}

fn default_min_delay_s() -> f64 {
    0.0
}

impl Default for ProviderLimitConfig {
    fn default() -> Self {
        Self { max_concurrent: default_max_concurrent(), min_delay_s: default_min_delay_s(), rpm: None }
    }
}

/// Top-level pipeline configuration (§6's enumerated config keys).
#[derive(Debug, Clone, Serialize, Deserialize, prefer::FromValue)]
pub struct PipelineConfig {
    #[serde(default = "default_data_dir")]
    #[prefer(default = "./data")]
    pub data_dir: String,

    #[serde(default = "default_database_filename")]
    #[prefer(default = "pipeline.db")]
    pub database_filename: String,

    #[serde(default = "default_chunk_threshold_pages")]
    #[prefer(default = "15")]
    pub pdf_chunk_threshold_pages: u32,

    #[serde(default = "default_chunk_size_pages")]
    #[prefer(default = "15")]
    pub pdf_chunk_size_pages: u32,

    #[serde(default = "default_worker_concurrency")]
    #[prefer(default = "50")]
    pub worker_concurrency: usize,

    #[serde(default = "default_task_soft_timeout_s")]
    #[prefer(default = "3300")]
    pub task_soft_timeout_s: u64,

    #[serde(default = "default_task_hard_timeout_s")]
    #[prefer(default = "3600")]
    pub task_hard_timeout_s: u64,

    #[serde(default = "default_job_stale_timeout_minutes")]
    #[prefer(default = "30")]
    pub job_stale_timeout_minutes: i64,

    #[serde(default = "default_chunk_stale_timeout_minutes")]
    #[prefer(default = "5")]
    pub chunk_stale_timeout_minutes: i64,

    #[serde(default = "default_job_max_recovery_retries")]
    #[prefer(default = "3")]
    pub job_max_recovery_retries: u32,

    #[serde(default = "default_chunk_lock_ttl_s")]
    #[prefer(default = "120")]
    pub chunk_lock_ttl_s: u64,

    #[serde(default = "default_cache_query_ttl_s")]
    #[prefer(default = "3600")]
    pub cache_query_ttl_s: u64,

    #[serde(default = "default_chunk_parent_tokens_min")]
    #[prefer(default = "1500")]
    pub chunk_parent_tokens_min: u32,
    #[serde(default = "default_chunk_parent_tokens_max")]
    #[prefer(default = "2000")]
    pub chunk_parent_tokens_max: u32,
    #[serde(default = "default_chunk_child_tokens_min")]
    #[prefer(default = "400")]
    pub chunk_child_tokens_min: u32,
    #[serde(default = "default_chunk_child_tokens_max")]
    #[prefer(default = "700")]
    pub chunk_child_tokens_max: u32,
    #[serde(default = "default_chunk_child_overlap_ratio")]
    #[prefer(default = "0.14")]
    pub chunk_child_overlap_ratio: f32,

    #[serde(default = "default_websocket_ping_interval_s")]
    #[prefer(default = "30")]
    pub websocket_ping_interval_s: u64,

    /// Per-provider rate limits, keyed by provider name (e.g. `"ocr-vendor-a"`).
    #[serde(default)]
    #[prefer(default)]
    pub provider_limits: std::collections::HashMap<String, ProviderLimitConfig>,

    /// Per-provider base URLs for [`crate::llm::HttpLlmProvider`], keyed the
    /// same way as `provider_limits`.
    #[serde(default)]
    #[prefer(default)]
    pub provider_endpoints: std::collections::HashMap<String, String>,

    /// Provider name the runner passes to `ocr_pdf_range` when a document
    /// doesn't pin its own (no per-document override exists yet; see
    /// `DESIGN.md`).
    #[serde(default = "default_ocr_provider")]
    #[prefer(default = "ocr-vendor-a")]
    pub default_ocr_provider: String,
    #[serde(default = "default_embedding_provider")]
    #[prefer(default = "embedding-vendor-a")]
    pub default_embedding_provider: String,
    #[serde(default = "default_extraction_provider")]
    #[prefer(default = "extraction-vendor-a")]
    pub default_extraction_provider: String,

    /// `redis://...` URL for the lock/cache backends. `None` runs both
    /// in-memory, suitable for single-process deployments only.
    #[serde(default)]
    #[prefer(default)]
    pub redis_url: Option<String>,

    #[serde(skip)]
    #[prefer(skip)]
    pub source_path: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            database_filename: default_database_filename(),
            pdf_chunk_threshold_pages: default_chunk_threshold_pages(),
            pdf_chunk_size_pages: default_chunk_size_pages(),
            worker_concurrency: default_worker_concurrency(),
            task_soft_timeout_s: default_task_soft_timeout_s(),
            task_hard_timeout_s: default_task_hard_timeout_s(),
            job_stale_timeout_minutes: default_job_stale_timeout_minutes(),
            chunk_stale_timeout_minutes: default_chunk_stale_timeout_minutes(),
            job_max_recovery_retries: default_job_max_recovery_retries(),
            chunk_lock_ttl_s: default_chunk_lock_ttl_s(),
            cache_query_ttl_s: default_cache_query_ttl_s(),
            chunk_parent_tokens_min: default_chunk_parent_tokens_min(),
            chunk_parent_tokens_max: default_chunk_parent_tokens_max(),
            chunk_child_tokens_min: default_chunk_child_tokens_min(),
            chunk_child_tokens_max: default_chunk_child_tokens_max(),
            chunk_child_overlap_ratio: default_chunk_child_overlap_ratio(),
            websocket_ping_interval_s: default_websocket_ping_interval_s(),
            provider_limits: std::collections::HashMap::new(),
            provider_endpoints: std::collections::HashMap::new(),
            default_ocr_provider: default_ocr_provider(),
            default_embedding_provider: default_embedding_provider(),
            default_extraction_provider: default_extraction_provider(),
            redis_url: None,
            source_path: None,
        }
    }
}

impl PipelineConfig {
    /// Discover and load configuration the same way the teacher's `Config`
    /// does: `prefer`'s auto-discovery first, falling back to defaults (with
    /// env overrides layered on afterward by the caller).
    pub async fn load() -> Self {
        match prefer::load("pipeline").await {
            Ok(pref_config) => match pref_config.source_path() {
                Some(path) => Self::load_from_path(path).await.unwrap_or_default(),
                None => Self::default(),
            },
            Err(_) => Self::default(),
        }
    }

    pub async fn load_from_path(path: &Path) -> Result<Self, String> {
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| format!("failed to read config file: {e}"))?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

        let mut config: PipelineConfig = match ext {
            "toml" => toml::from_str(&contents).map_err(|e| format!("failed to parse TOML config: {e}"))?,
            "yaml" | "yml" => serde_yaml::from_str(&contents).map_err(|e| format!("failed to parse YAML config: {e}"))?,
            _ => serde_json::from_str(&contents).map_err(|e| format!("failed to parse JSON config: {e}"))?,
        };

        config.source_path = Some(path.to_path_buf());
        Ok(config)
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir().join(&self.database_filename)
    }

    pub fn objects_dir(&self) -> PathBuf {
        self.data_dir().join("objects")
    }

    pub fn ensure_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.data_dir())?;
        std::fs::create_dir_all(self.objects_dir())?;
        Ok(())
    }

    pub fn provider_limit(&self, provider: &str) -> ProviderLimitConfig {
        self.provider_limits.get(provider).cloned().unwrap_or_default()
    }
}

/// Build the filesystem [`ObjectStore`] rooted at this config's `objects_dir`.
pub fn build_object_store(config: &PipelineConfig) -> crate::object_store::FsObjectStore {
    crate::object_store::FsObjectStore::new(config.objects_dir())
}

/// Build the [`ObjectStore`]'s [`crate::pipeline::LlmProvider`] counterpart
/// from this config's provider endpoint/limit tables.
pub fn build_llm_provider(config: &PipelineConfig) -> crate::llm::HttpLlmProvider {
    crate::llm::HttpLlmProvider::new(config.provider_endpoints.clone(), &config.provider_limits)
}
