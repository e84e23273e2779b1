//! Configuration loading, validation, and management for Canopy.
//!
//! Loads configuration from a TOML file with environment variable overrides.
//! Validates all settings at startup; settings that are merely suspicious
//! (a buffer too small for the summarizer to ever fire) produce warnings
//! rather than hard errors.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// LM backend settings.
    #[serde(default)]
    pub lm: LmConfig,

    /// Per-node message buffer settings.
    #[serde(default)]
    pub buffer: BufferConfig,

    /// Rolling summarization cadence.
    #[serde(default)]
    pub summarization: SummarizationConfig,

    /// Archive retrieval settings.
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Vector archive settings.
    #[serde(default)]
    pub archive: ArchiveConfig,

    /// HTTP gateway settings.
    #[serde(default)]
    pub gateway: GatewayConfig,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct LmConfig {
    /// API key for the LM provider. Absent ⇒ the echo fallback is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Base URL of the OpenAI-compatible endpoint.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Model for chat completion.
    #[serde(default = "default_model_primary")]
    pub model_primary: String,

    /// Model for intent classification + sub-query generation (may be smaller).
    #[serde(default = "default_model_decomposition")]
    pub model_decomposition: String,

    /// Sampling temperature for chat completion.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Max tokens per LM response.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Deadline for every LM call, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Upper bound on concurrent LM calls; exhaustion yields a retryable 503.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

fn default_base_url() -> String {
    "https://api.groq.com/openai/v1".into()
}
fn default_model_primary() -> String {
    "llama-3.1-8b-instant".into()
}
fn default_model_decomposition() -> String {
    "llama-3.1-8b-instant".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    1000
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_max_concurrency() -> usize {
    16
}

impl Default for LmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_base_url(),
            model_primary: default_model_primary(),
            model_decomposition: default_model_decomposition(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_timeout_secs(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

impl std::fmt::Debug for LmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LmConfig")
            .field("api_key", &redact(&self.api_key))
            .field("base_url", &self.base_url)
            .field("model_primary", &self.model_primary)
            .field("model_decomposition", &self.model_decomposition)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("timeout_secs", &self.timeout_secs)
            .field("max_concurrency", &self.max_concurrency)
            .finish()
    }
}

/// Redact a secret for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Per-node buffer capacity in turns. Minimum 1.
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
}

fn default_max_turns() -> usize {
    15
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummarizationConfig {
    /// Messages processed before the first summary is built.
    #[serde(default = "default_start_threshold")]
    pub start_threshold: u64,

    /// Messages between subsequent summaries.
    #[serde(default = "default_interval")]
    pub interval: u64,
}

fn default_start_threshold() -> u64 {
    15
}
fn default_interval() -> u64 {
    5
}

impl Default for SummarizationConfig {
    fn default() -> Self {
        Self {
            start_threshold: default_start_threshold(),
            interval: default_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Half-width of the temporal context window, in seconds.
    #[serde(default = "default_window_seconds")]
    pub window_seconds: f64,

    /// Overall number of hits whose windows are emitted.
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Results requested from the archive per sub-query.
    #[serde(default = "default_top_k")]
    pub top_k_per_subquery: usize,

    /// Whether turns run retrieval unless the request opts out.
    #[serde(default = "default_true")]
    pub enabled_default: bool,
}

fn default_window_seconds() -> f64 {
    60.0
}
fn default_top_k() -> usize {
    5
}
fn default_true() -> bool {
    true
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            window_seconds: default_window_seconds(),
            top_k: default_top_k(),
            top_k_per_subquery: default_top_k(),
            enabled_default: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Persistent storage location for the vector store.
    #[serde(default = "default_archive_path")]
    pub path: String,

    /// Name of the embedding model. Changing this requires a fresh archive.
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    /// Embedding vector dimension; a property of the model.
    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: usize,

    /// Deadline for best-effort index writes, in seconds.
    #[serde(default = "default_index_timeout_secs")]
    pub index_timeout_secs: u64,
}

fn default_archive_path() -> String {
    "./canopy-archive/archive.db".into()
}
fn default_embedding_model() -> String {
    "hash-embed-v1".into()
}
fn default_embedding_dimensions() -> usize {
    384
}
fn default_index_timeout_secs() -> u64 {
    5
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            path: default_archive_path(),
            embedding_model: default_embedding_model(),
            embedding_dimensions: default_embedding_dimensions(),
            index_timeout_secs: default_index_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8000
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            lm: LmConfig::default(),
            buffer: BufferConfig::default(),
            summarization: SummarizationConfig::default(),
            retrieval: RetrievalConfig::default(),
            archive: ArchiveConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("lm", &self.lm)
            .field("buffer", &self.buffer)
            .field("summarization", &self.summarization)
            .field("retrieval", &self.retrieval)
            .field("archive", &self.archive)
            .field("gateway", &self.gateway)
            .finish()
    }
}

impl AppConfig {
    /// Load configuration from the given path (falls back to defaults when the
    /// file is absent), then apply environment variable overrides:
    ///
    /// - `CANOPY_API_KEY` (highest priority), `GROQ_API_KEY`, `OPENAI_API_KEY`
    /// - `CANOPY_LM_BASE_URL`, `CANOPY_MODEL`
    /// - `CANOPY_ARCHIVE_PATH`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_from(path)?;

        if config.lm.api_key.is_none() {
            config.lm.api_key = std::env::var("CANOPY_API_KEY")
                .ok()
                .or_else(|| std::env::var("GROQ_API_KEY").ok())
                .or_else(|| std::env::var("OPENAI_API_KEY").ok());
        }

        if let Ok(base_url) = std::env::var("CANOPY_LM_BASE_URL") {
            config.lm.base_url = base_url;
        }

        if let Ok(model) = std::env::var("CANOPY_MODEL") {
            config.lm.model_primary = model;
        }

        if let Ok(path) = std::env::var("CANOPY_ARCHIVE_PATH") {
            config.archive.path = path;
        }

        Ok(config)
    }

    /// Load configuration from a specific file path without env overrides.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            let config = Self::default();
            config.validate()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration. Hard limits only; see `warnings()`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer.max_turns < 1 {
            return Err(ConfigError::ValidationError(
                "buffer.max_turns must be >= 1".into(),
            ));
        }
        if self.summarization.start_threshold < 1 || self.summarization.interval < 1 {
            return Err(ConfigError::ValidationError(
                "summarization thresholds must be >= 1".into(),
            ));
        }
        if self.retrieval.window_seconds <= 0.0 {
            return Err(ConfigError::ValidationError(
                "retrieval.window_seconds must be > 0".into(),
            ));
        }
        if self.retrieval.top_k < 1 || self.retrieval.top_k_per_subquery < 1 {
            return Err(ConfigError::ValidationError(
                "retrieval.top_k values must be >= 1".into(),
            ));
        }
        if !(0.0..=2.0).contains(&self.lm.temperature) {
            return Err(ConfigError::ValidationError(
                "lm.temperature must be between 0.0 and 2.0".into(),
            ));
        }
        if self.lm.max_concurrency == 0 {
            return Err(ConfigError::ValidationError(
                "lm.max_concurrency must be >= 1".into(),
            ));
        }
        Ok(())
    }

    /// Suspicious-but-legal settings, surfaced at startup.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if (self.buffer.max_turns as u64) < self.summarization.start_threshold {
            warnings.push(format!(
                "buffer.max_turns ({}) is below summarization.start_threshold ({}); \
                 summaries will be built from an already-partial buffer",
                self.buffer.max_turns, self.summarization.start_threshold
            ));
        }
        if self.lm.api_key.is_none() {
            warnings.push("no LM API key configured; falling back to the echo provider".into());
        }
        warnings
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.lm.api_key.is_some()
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.buffer.max_turns, 15);
        assert_eq!(config.summarization.start_threshold, 15);
        assert_eq!(config.summarization.interval, 5);
        assert_eq!(config.retrieval.top_k, 5);
        assert!((config.retrieval.window_seconds - 60.0).abs() < f64::EPSILON);
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let back: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(back.buffer.max_turns, config.buffer.max_turns);
        assert_eq!(back.gateway.port, config.gateway.port);
    }

    #[test]
    fn zero_max_turns_rejected() {
        let mut config = AppConfig::default();
        config.buffer.max_turns = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn nonpositive_window_rejected() {
        let mut config = AppConfig::default();
        config.retrieval.window_seconds = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn small_buffer_warns_but_validates() {
        let mut config = AppConfig::default();
        config.buffer.max_turns = 5;
        assert!(config.validate().is_ok());
        let warnings = config.warnings();
        assert!(warnings.iter().any(|w| w.contains("start_threshold")));
    }

    #[test]
    fn debug_redacts_api_key() {
        let mut config = AppConfig::default();
        config.lm.api_key = Some("sk-secret".into());
        let debug = format!("{config:?}");
        assert!(!debug.contains("sk-secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let config: AppConfig = toml::from_str("[buffer]\nmax_turns = 7\n").unwrap();
        assert_eq!(config.buffer.max_turns, 7);
        assert_eq!(config.summarization.interval, 5);
        assert_eq!(config.gateway.port, 8000);
    }
}
