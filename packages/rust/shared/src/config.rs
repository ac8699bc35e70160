//! Application configuration for Leadscope.
//!
//! User config lives at `~/.leadscope/leadscope.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LeadscopeError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "leadscope.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".leadscope";

// ---------------------------------------------------------------------------
// Config structs (matching leadscope.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Search provider settings.
    #[serde(default)]
    pub search: SearchConfig,

    /// Classification provider settings.
    #[serde(default)]
    pub classifier: ClassifierConfig,

    /// Pipeline tunables.
    #[serde(default)]
    pub pipeline: PipelineSection,

    /// Priority tier lower bounds.
    #[serde(default)]
    pub tiers: TierBoundaries,
}

/// `[search]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_search_key_env")]
    pub api_key_env: String,

    /// Base URL of the search API.
    #[serde(default = "default_search_base_url")]
    pub base_url: String,

    /// Maximum results requested per entity.
    #[serde(default = "default_max_results")]
    pub max_results: u32,

    /// Results scoring below this relevance are dropped.
    #[serde(default = "default_min_relevance")]
    pub min_relevance: f64,

    /// Provider search depth: "basic" or "advanced".
    #[serde(default = "default_search_depth")]
    pub search_depth: String,

    /// Per-request timeout in seconds.
    #[serde(default = "default_search_timeout")]
    pub timeout_secs: u64,

    /// Attempts per fetch for transient provider errors.
    #[serde(default = "default_fetch_attempts")]
    pub max_attempts: u32,

    /// Base delay for the fetch backoff in milliseconds.
    #[serde(default = "default_fetch_backoff_ms")]
    pub retry_base_delay_ms: u64,

    /// Append `{name}.com|.ai|.io` guesses to the query.
    #[serde(default = "default_true")]
    pub domain_guesses: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_search_key_env(),
            base_url: default_search_base_url(),
            max_results: default_max_results(),
            min_relevance: default_min_relevance(),
            search_depth: default_search_depth(),
            timeout_secs: default_search_timeout(),
            max_attempts: default_fetch_attempts(),
            retry_base_delay_ms: default_fetch_backoff_ms(),
            domain_guesses: true,
        }
    }
}

fn default_search_key_env() -> String {
    "TAVILY_API_KEY".into()
}
fn default_search_base_url() -> String {
    "https://api.tavily.com".into()
}
fn default_max_results() -> u32 {
    10
}
fn default_min_relevance() -> f64 {
    0.3
}
fn default_search_depth() -> String {
    "advanced".into()
}
fn default_search_timeout() -> u64 {
    30
}
fn default_fetch_attempts() -> u32 {
    3
}
fn default_fetch_backoff_ms() -> u64 {
    2_000
}
fn default_true() -> bool {
    true
}

/// `[classifier]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Name of the env var holding the API key.
    #[serde(default = "default_llm_key_env")]
    pub api_key_env: String,

    /// Base URL of the OpenAI-compatible API.
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,

    /// Model used for scoring.
    #[serde(default = "default_scoring_model")]
    pub scoring_model: String,

    /// Low-cost model used for evidence validation.
    #[serde(default = "default_validation_model")]
    pub validation_model: String,

    /// Scoring call timeout in seconds.
    #[serde(default = "default_scoring_timeout")]
    pub timeout_secs: u64,

    /// Validation call timeout in seconds.
    #[serde(default = "default_validation_timeout")]
    pub validation_timeout_secs: u64,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_top_p")]
    pub top_p: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_llm_key_env(),
            base_url: default_llm_base_url(),
            scoring_model: default_scoring_model(),
            validation_model: default_validation_model(),
            timeout_secs: default_scoring_timeout(),
            validation_timeout_secs: default_validation_timeout(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_llm_key_env() -> String {
    "LLM_API_KEY".into()
}
fn default_llm_base_url() -> String {
    "https://api.crusoe.ai/v1/".into()
}
fn default_scoring_model() -> String {
    "meta-llama/Llama-3.3-70B-Instruct".into()
}
fn default_validation_model() -> String {
    "meta-llama/Llama-3.1-8B-Instruct".into()
}
fn default_scoring_timeout() -> u64 {
    60
}
fn default_validation_timeout() -> u64 {
    30
}
fn default_temperature() -> f32 {
    0.3
}
fn default_top_p() -> f32 {
    0.9
}
fn default_max_tokens() -> u32 {
    2048
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    /// Maximum concurrent evidence fetches.
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: u32,

    /// Entities scored concurrently per Phase 2 batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Minimum validator confidence to accept evidence (inclusive).
    #[serde(default = "default_threshold")]
    pub validation_threshold: f64,

    /// Total fetch+validate attempts per entity.
    #[serde(default = "default_validation_retries")]
    pub max_validation_retries: u32,

    /// Base delay before a validation retry, in milliseconds.
    #[serde(default = "default_validation_backoff_ms")]
    pub validation_backoff_ms: u64,

    /// Hard cap on formatted evidence size in bytes.
    #[serde(default = "default_max_evidence_bytes")]
    pub max_evidence_bytes: usize,

    /// Evidence prefix shown to the validator, in characters.
    #[serde(default = "default_validation_prefix")]
    pub validation_prefix_chars: usize,

    /// Minimum evidence word count.
    #[serde(default = "default_min_words")]
    pub min_words: usize,

    /// Seconds without activity before a run is considered stalled.
    #[serde(default = "default_stall_threshold")]
    pub stall_threshold_secs: u64,

    /// Evidence database path (defaults to `~/.leadscope/leadscope.db`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<String>,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            fetch_concurrency: default_fetch_concurrency(),
            batch_size: default_batch_size(),
            validation_threshold: default_threshold(),
            max_validation_retries: default_validation_retries(),
            validation_backoff_ms: default_validation_backoff_ms(),
            max_evidence_bytes: default_max_evidence_bytes(),
            validation_prefix_chars: default_validation_prefix(),
            min_words: default_min_words(),
            stall_threshold_secs: default_stall_threshold(),
            database_path: None,
        }
    }
}

fn default_fetch_concurrency() -> u32 {
    50
}
fn default_batch_size() -> u32 {
    10
}
fn default_threshold() -> f64 {
    0.6
}
fn default_validation_retries() -> u32 {
    2
}
fn default_validation_backoff_ms() -> u64 {
    1_000
}
fn default_max_evidence_bytes() -> usize {
    100_000
}
fn default_validation_prefix() -> usize {
    4_000
}
fn default_min_words() -> usize {
    50
}
fn default_stall_threshold() -> u64 {
    300
}

/// `[tiers]` section: inclusive lower bounds on total score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierBoundaries {
    #[serde(default = "default_hot")]
    pub hot: u32,
    #[serde(default = "default_warm")]
    pub warm: u32,
    #[serde(default = "default_watch")]
    pub watch: u32,
}

impl Default for TierBoundaries {
    fn default() -> Self {
        Self {
            hot: default_hot(),
            warm: default_warm(),
            watch: default_watch(),
        }
    }
}

fn default_hot() -> u32 {
    75
}
fn default_warm() -> u32 {
    55
}
fn default_watch() -> u32 {
    35
}

// ---------------------------------------------------------------------------
// Pipeline config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime pipeline configuration, merged from the config file and CLI flags.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub fetch_concurrency: usize,
    pub batch_size: usize,
    pub validation_threshold: f64,
    pub max_validation_retries: u32,
    pub validation_backoff: Duration,
    pub max_evidence_bytes: usize,
    pub validation_prefix_chars: usize,
    pub min_words: usize,
    pub stall_threshold: Duration,
    pub tiers: TierBoundaries,
    pub max_results: u32,
    pub min_relevance: f64,
    pub search_depth: String,
    pub domain_guesses: bool,
    pub fetch_timeout: Duration,
    pub fetch_max_attempts: u32,
    pub fetch_retry_base: Duration,
    pub validation_timeout: Duration,
    pub scoring_timeout: Duration,
    pub scoring_model: String,
    pub validation_model: String,
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
}

impl From<&AppConfig> for PipelineConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            fetch_concurrency: config.pipeline.fetch_concurrency as usize,
            batch_size: config.pipeline.batch_size as usize,
            validation_threshold: config.pipeline.validation_threshold,
            max_validation_retries: config.pipeline.max_validation_retries,
            validation_backoff: Duration::from_millis(config.pipeline.validation_backoff_ms),
            max_evidence_bytes: config.pipeline.max_evidence_bytes,
            validation_prefix_chars: config.pipeline.validation_prefix_chars,
            min_words: config.pipeline.min_words,
            stall_threshold: Duration::from_secs(config.pipeline.stall_threshold_secs),
            tiers: config.tiers,
            max_results: config.search.max_results,
            min_relevance: config.search.min_relevance,
            search_depth: config.search.search_depth.clone(),
            domain_guesses: config.search.domain_guesses,
            fetch_timeout: Duration::from_secs(config.search.timeout_secs),
            fetch_max_attempts: config.search.max_attempts,
            fetch_retry_base: Duration::from_millis(config.search.retry_base_delay_ms),
            validation_timeout: Duration::from_secs(config.classifier.validation_timeout_secs),
            scoring_timeout: Duration::from_secs(config.classifier.timeout_secs),
            scoring_model: config.classifier.scoring_model.clone(),
            validation_model: config.classifier.validation_model.clone(),
            temperature: config.classifier.temperature,
            top_p: config.classifier.top_p,
            max_tokens: config.classifier.max_tokens,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl PipelineConfig {
    /// Reject tunables that would make the pipeline stall or accept everything.
    pub fn validate(&self) -> Result<()> {
        if self.fetch_concurrency == 0 {
            return Err(LeadscopeError::validation("fetch_concurrency must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(LeadscopeError::validation("batch_size must be at least 1"));
        }
        if self.max_validation_retries == 0 {
            return Err(LeadscopeError::validation(
                "max_validation_retries must be at least 1",
            ));
        }
        if self.fetch_max_attempts == 0 {
            return Err(LeadscopeError::validation("search max_attempts must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.validation_threshold) {
            return Err(LeadscopeError::validation(format!(
                "validation_threshold {} is outside [0, 1]",
                self.validation_threshold
            )));
        }
        if !(self.tiers.hot >= self.tiers.warm && self.tiers.warm >= self.tiers.watch) {
            return Err(LeadscopeError::validation(
                "tier bounds must satisfy hot >= warm >= watch",
            ));
        }
        if self.max_evidence_bytes < 1_024 {
            return Err(LeadscopeError::validation(
                "max_evidence_bytes must be at least 1024",
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.leadscope/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| LeadscopeError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.leadscope/leadscope.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| LeadscopeError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| LeadscopeError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| LeadscopeError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| LeadscopeError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| LeadscopeError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Check that both provider API key env vars are set and non-empty.
pub fn validate_api_keys(config: &AppConfig) -> Result<()> {
    for (var_name, provider) in [
        (&config.search.api_key_env, "search"),
        (&config.classifier.api_key_env, "classifier"),
    ] {
        match std::env::var(var_name) {
            Ok(val) if !val.is_empty() => {}
            _ => {
                return Err(LeadscopeError::config(format!(
                    "{provider} API key not found. Set the {var_name} environment variable."
                )));
            }
        }
    }
    Ok(())
}
