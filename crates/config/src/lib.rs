//! Configuration loading, validation, and management for Parley.
//!
//! Loads configuration from `~/.parley/config.toml` (or an explicit path)
//! with environment variable overrides. Validates all settings at startup.

use parley_core::OperationKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.parley/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// System instructions sent with every round
    #[serde(default = "default_instructions")]
    pub instructions: String,

    /// Model service settings
    #[serde(default)]
    pub model: ModelConfig,

    /// Per-turn resource limits
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Retrieval pipeline settings
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Operation dispatcher settings
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Speech synthesis settings
    #[serde(default)]
    pub speech: SpeechConfig,

    /// Context compaction settings
    #[serde(default)]
    pub context: ContextConfig,
}

fn default_instructions() -> String {
    "You are a helpful assistant. Use the available operations to act on the \
     user's behalf, and call end_turn once the request is fully handled."
        .into()
}

fn default_true() -> bool {
    true
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// API key for the model and embedding endpoints
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Base URL of an OpenAI-compatible API
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_model")]
    pub name: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Max tokens per model response
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Timeout for one model round-trip
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    1024
}
fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_base_url(),
            name: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl std::fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelConfig")
            .field("api_key", &redact(&self.api_key))
            .field("base_url", &self.base_url)
            .field("name", &self.name)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Model rounds per turn
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Operations executed from a single round
    #[serde(default = "default_max_ops_per_turn")]
    pub max_ops_per_turn: usize,

    /// Operations executed across the whole turn
    #[serde(default = "default_max_total_ops")]
    pub max_total_ops: u32,
}

fn default_max_iterations() -> u32 {
    10
}
fn default_max_ops_per_turn() -> usize {
    20
}
fn default_max_total_ops() -> u32 {
    50
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_ops_per_turn: default_max_ops_per_turn(),
            max_total_ops: default_max_total_ops(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    #[serde(default = "default_true")]
    pub use_hybrid: bool,

    #[serde(default = "default_true")]
    pub use_rerank: bool,

    /// Token budget for retrieved context
    #[serde(default = "default_retrieval_max_tokens")]
    pub max_tokens: usize,

    /// Minimum cosine similarity for semantic hits
    #[serde(default = "default_similarity_floor")]
    pub similarity_floor: f32,

    /// Maximum Jaccard overlap with an already accepted chunk
    #[serde(default = "default_diversity_threshold")]
    pub diversity_threshold: f32,

    #[serde(default = "default_rrf_k")]
    pub rrf_k: f32,

    #[serde(default = "default_bm25_k1")]
    pub bm25_k1: f32,

    #[serde(default = "default_bm25_b")]
    pub bm25_b: f32,

    /// Maximum characters per ingested chunk
    #[serde(default = "default_chunk_max_chars")]
    pub chunk_max_chars: usize,

    /// Embedding model; "hashing" selects the offline embedder
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
}

fn default_top_k() -> usize {
    8
}
fn default_retrieval_max_tokens() -> usize {
    2000
}
fn default_similarity_floor() -> f32 {
    0.25
}
fn default_diversity_threshold() -> f32 {
    0.7
}
fn default_rrf_k() -> f32 {
    60.0
}
fn default_bm25_k1() -> f32 {
    1.2
}
fn default_bm25_b() -> f32 {
    0.75
}
fn default_chunk_max_chars() -> usize {
    1200
}
fn default_embedding_model() -> String {
    "hashing".into()
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            use_hybrid: true,
            use_rerank: true,
            max_tokens: default_retrieval_max_tokens(),
            similarity_floor: default_similarity_floor(),
            diversity_threshold: default_diversity_threshold(),
            rrf_k: default_rrf_k(),
            bm25_k1: default_bm25_k1(),
            bm25_b: default_bm25_b(),
            chunk_max_chars: default_chunk_max_chars(),
            embedding_model: default_embedding_model(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,

    /// Per-kind timeout overrides, keyed by operation wire name
    #[serde(default)]
    pub timeout_overrides: HashMap<String, u64>,
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_timeout_secs(),
            timeout_overrides: HashMap::new(),
        }
    }
}

impl DispatcherConfig {
    /// Overrides with their kinds parsed. Unknown names are skipped.
    pub fn parsed_overrides(&self) -> HashMap<OperationKind, u64> {
        self.timeout_overrides
            .iter()
            .filter_map(|(name, secs)| name.parse().ok().map(|kind| (kind, *secs)))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Speech model name sent to `/audio/speech`
    #[serde(default = "default_speech_model")]
    pub model: String,

    #[serde(default = "default_voice")]
    pub voice: String,
}

fn default_speech_model() -> String {
    "tts-1".into()
}
fn default_voice() -> String {
    "alloy".into()
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            model: default_speech_model(),
            voice: default_voice(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Most recent history messages sent to the model
    #[serde(default = "default_history_window")]
    pub history_window: usize,

    /// Max characters kept from one operation result
    #[serde(default = "default_result_summary_chars")]
    pub result_summary_chars: usize,

    /// Max characters of operation results kept per round
    #[serde(default = "default_round_summary_chars")]
    pub round_summary_chars: usize,
}

fn default_history_window() -> usize {
    20
}
fn default_result_summary_chars() -> usize {
    1500
}
fn default_round_summary_chars() -> usize {
    6000
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            history_window: default_history_window(),
            result_summary_chars: default_result_summary_chars(),
            round_summary_chars: default_round_summary_chars(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.parley/config.toml).
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        Self::load_with_env(&config_path)
    }

    /// Load from `path` and apply environment overrides:
    /// - `PARLEY_API_KEY` (highest priority), then `OPENAI_API_KEY`
    /// - `PARLEY_MODEL`
    /// - `PARLEY_BASE_URL`
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_from(path)?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from an environment lookup.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup("PARLEY_API_KEY").or_else(|| {
            if self.model.api_key.is_none() {
                lookup("OPENAI_API_KEY")
            } else {
                None
            }
        }) {
            self.model.api_key = Some(key);
        }

        if let Some(model) = lookup("PARLEY_MODEL") {
            self.model.name = model;
        }

        if let Some(url) = lookup("PARLEY_BASE_URL") {
            self.model.base_url = url;
        }
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
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

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".parley")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.model.temperature) {
            return Err(ConfigError::ValidationError(
                "model.temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.limits.max_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "limits.max_iterations must be > 0".into(),
            ));
        }

        if self.limits.max_ops_per_turn == 0 || self.limits.max_total_ops == 0 {
            return Err(ConfigError::ValidationError(
                "limits.max_ops_per_turn and limits.max_total_ops must be > 0".into(),
            ));
        }

        let r = &self.retrieval;
        if r.top_k == 0 {
            return Err(ConfigError::ValidationError(
                "retrieval.top_k must be > 0".into(),
            ));
        }
        if !(-1.0..=1.0).contains(&r.similarity_floor) {
            return Err(ConfigError::ValidationError(
                "retrieval.similarity_floor must be between -1.0 and 1.0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&r.diversity_threshold) {
            return Err(ConfigError::ValidationError(
                "retrieval.diversity_threshold must be between 0.0 and 1.0".into(),
            ));
        }
        if r.rrf_k <= 0.0 || r.bm25_k1 < 0.0 || !(0.0..=1.0).contains(&r.bm25_b) {
            return Err(ConfigError::ValidationError(
                "retrieval.rrf_k must be > 0, bm25_k1 >= 0 and bm25_b in [0, 1]".into(),
            ));
        }
        if r.chunk_max_chars < 16 {
            return Err(ConfigError::ValidationError(
                "retrieval.chunk_max_chars must be at least 16".into(),
            ));
        }

        if self.dispatcher.default_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "dispatcher.default_timeout_secs must be > 0".into(),
            ));
        }
        for (name, secs) in &self.dispatcher.timeout_overrides {
            if name.parse::<OperationKind>().is_err() {
                return Err(ConfigError::ValidationError(format!(
                    "dispatcher.timeout_overrides: unknown operation '{name}'"
                )));
            }
            if *secs == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "dispatcher.timeout_overrides.{name} must be > 0"
                )));
            }
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.model.api_key.is_some()
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            instructions: default_instructions(),
            model: ModelConfig::default(),
            limits: LimitsConfig::default(),
            retrieval: RetrievalConfig::default(),
            dispatcher: DispatcherConfig::default(),
            speech: SpeechConfig::default(),
            context: ContextConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
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
    use std::io::Write;

    #[test]
    fn defaults_match_documented_limits() {
        let config = AppConfig::default();
        assert_eq!(config.limits.max_iterations, 10);
        assert_eq!(config.limits.max_ops_per_turn, 20);
        assert_eq!(config.limits.max_total_ops, 50);
        assert_eq!(config.dispatcher.default_timeout_secs, 30);
        assert_eq!(config.retrieval.rrf_k, 60.0);
        assert!((config.retrieval.similarity_floor - 0.25).abs() < f32::EPSILON);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.model.name, config.model.name);
        assert_eq!(parsed.retrieval.top_k, config.retrieval.top_k);
    }

    #[test]
    fn invalid_temperature_rejected() {
        let mut config = AppConfig::default();
        config.model.temperature = 5.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_timeout_override_rejected() {
        let mut config = AppConfig::default();
        config
            .dispatcher
            .timeout_overrides
            .insert("launch_rocket".into(), 5);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("launch_rocket"));
    }

    #[test]
    fn parsed_overrides_are_keyed_by_kind() {
        let mut config = DispatcherConfig::default();
        config.timeout_overrides.insert("web_search".into(), 5);
        let parsed = config.parsed_overrides();
        assert_eq!(parsed.get(&OperationKind::WebSearch), Some(&5));
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let config = AppConfig::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.model.name, "gpt-4o-mini");
    }

    #[test]
    fn load_partial_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[model]
name = "local-model"

[limits]
max_iterations = 3

[dispatcher.timeout_overrides]
web_search = 10
"#
        )
        .unwrap();

        let config = AppConfig::load_from(file.path()).unwrap();
        assert_eq!(config.model.name, "local-model");
        assert_eq!(config.limits.max_iterations, 3);
        assert_eq!(config.limits.max_total_ops, 50);
        assert_eq!(config.dispatcher.timeout_overrides.get("web_search"), Some(&10));
    }

    #[test]
    fn malformed_file_is_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[limits\nmax_iterations = ").unwrap();
        let err = AppConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn out_of_range_file_is_validation_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[retrieval]\ndiversity_threshold = 1.5").unwrap();
        let err = AppConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = AppConfig::default();
        config.apply_env(|key| match key {
            "OPENAI_API_KEY" => Some("sk-openai".into()),
            "PARLEY_MODEL" => Some("other".into()),
            _ => None,
        });
        assert_eq!(config.model.api_key.as_deref(), Some("sk-openai"));
        assert_eq!(config.model.name, "other");
    }

    #[test]
    fn parley_key_beats_config_and_openai_key() {
        let mut config = AppConfig::default();
        config.model.api_key = Some("from-file".into());
        config.apply_env(|key| match key {
            "PARLEY_API_KEY" => Some("sk-parley".into()),
            "OPENAI_API_KEY" => Some("sk-openai".into()),
            _ => None,
        });
        assert_eq!(config.model.api_key.as_deref(), Some("sk-parley"));

        let mut config = AppConfig::default();
        config.model.api_key = Some("from-file".into());
        config.apply_env(|key| (key == "OPENAI_API_KEY").then(|| "sk-openai".to_string()));
        assert_eq!(config.model.api_key.as_deref(), Some("from-file"));
    }

    #[test]
    fn api_key_is_redacted_in_debug() {
        let mut config = AppConfig::default();
        config.model.api_key = Some("sk-secret".into());
        let debug = format!("{config:?}");
        assert!(!debug.contains("sk-secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = AppConfig::default_toml();
        assert!(toml_str.contains("gpt-4o-mini"));
        assert!(toml_str.contains("max_iterations"));
    }
}
