//! TOML configuration.
//!
//! Every section except `[db]` is optional and falls back to the defaults
//! below. [`load_config`] parses and validates in one step.
//!
//! ```toml
//! [db]
//! path = "./data/embedstore.sqlite"
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [freshness]
//! interval_secs = 3600
//! max_age_hours = 24
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use embedstore_core::chunk::{DEFAULT_CHUNK_WORDS, DEFAULT_OVERLAP_WORDS};
use embedstore_core::freshness::{ReembedOptions, DEFAULT_LIMIT, DEFAULT_MAX_AGE_HOURS};
use embedstore_core::search::{SearchParams, DEFAULT_K, DEFAULT_RECENT_WINDOW};

use crate::maintenance::{clamp_lists, DEFAULT_IVFFLAT_LISTS};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub freshness: FreshnessConfig,
    #[serde(default)]
    pub usage: UsageConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    /// Postgres connection URL; selects the pgvector store when the
    /// `postgres` feature is enabled.
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_words")]
    pub max_words: usize,
    #[serde(default = "default_overlap_words")]
    pub overlap_words: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_words: DEFAULT_CHUNK_WORDS,
            overlap_words: DEFAULT_OVERLAP_WORDS,
        }
    }
}

fn default_max_words() -> usize {
    DEFAULT_CHUNK_WORDS
}
fn default_overlap_words() -> usize {
    DEFAULT_OVERLAP_WORDS
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL override (OpenAI-compatible gateway or Ollama host).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            api_key_env: default_api_key_env(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default = "default_recent_window")]
    pub recent_window: usize,
    /// ivfflat probes for the pgvector store.
    #[serde(default)]
    pub probes: Option<u32>,
    /// `lists` for the pgvector ivfflat index created with the schema.
    /// Clamped to 10..=65535.
    #[serde(default = "default_ivfflat_lists")]
    pub ivfflat_lists: u32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            recent_window: DEFAULT_RECENT_WINDOW,
            probes: None,
            ivfflat_lists: DEFAULT_IVFFLAT_LISTS,
        }
    }
}

fn default_k() -> usize {
    DEFAULT_K
}
fn default_recent_window() -> usize {
    DEFAULT_RECENT_WINDOW
}
fn default_ivfflat_lists() -> u32 {
    DEFAULT_IVFFLAT_LISTS
}

impl RetrievalConfig {
    pub fn search_params(&self) -> SearchParams {
        SearchParams {
            recent_window: self.recent_window,
            probes: self.probes,
        }
    }

    pub fn ivfflat_lists(&self) -> u32 {
        clamp_lists(self.ivfflat_lists)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FreshnessConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default)]
    pub initial_delay_secs: u64,
    #[serde(default = "default_max_age_hours")]
    pub max_age_hours: u32,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub entity_type: Option<String>,
    #[serde(default)]
    pub scope_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

impl Default for FreshnessConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            initial_delay_secs: 0,
            max_age_hours: DEFAULT_MAX_AGE_HOURS,
            limit: DEFAULT_LIMIT,
            force: false,
            entity_type: None,
            scope_id: None,
            model: None,
        }
    }
}

fn default_interval_secs() -> u64 {
    3600
}
fn default_max_age_hours() -> u32 {
    DEFAULT_MAX_AGE_HOURS
}
fn default_limit() -> usize {
    DEFAULT_LIMIT
}

impl FreshnessConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }

    pub fn reembed_options(&self) -> ReembedOptions<'_> {
        ReembedOptions {
            max_age_hours: self.max_age_hours,
            limit: self.limit,
            model: self.model.as_deref(),
            entity_type: self.entity_type.as_deref(),
            scope_id: self.scope_id.as_deref(),
            force: self.force,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct UsageConfig {
    #[serde(default = "default_usage_enabled")]
    pub enabled: bool,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn default_usage_enabled() -> bool {
    true
}

impl Config {
    /// Config for a SQLite file with every other section defaulted.
    pub fn for_path(path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: path.into(),
                url: None,
            },
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            retrieval: RetrievalConfig::default(),
            freshness: FreshnessConfig::default(),
            usage: UsageConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate config text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_words == 0 {
        bail!("chunking.max_words must be > 0");
    }
    if config.chunking.overlap_words >= config.chunking.max_words {
        bail!("chunking.overlap_words must be < chunking.max_words");
    }

    if config.retrieval.k == 0 {
        bail!("retrieval.k must be >= 1");
    }
    if config.retrieval.probes == Some(0) {
        bail!("retrieval.probes must be >= 1 when set");
    }

    if config.freshness.interval_secs == 0 {
        bail!("freshness.interval_secs must be > 0");
    }

    if config.embedding.dims == Some(0) {
        bail!("embedding.dims must be > 0");
    }
    match config.embedding.provider.as_str() {
        "disabled" | "local" => {}
        "openai" | "ollama" => {
            if config.embedding.dims.is_none() {
                bail!(
                    "embedding.dims must be set when provider is '{}'",
                    config.embedding.provider
                );
            }
            if config.embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let cfg = parse_config("[db]\npath = \"./data/e.sqlite\"\n").unwrap();
        assert_eq!(cfg.chunking.max_words, 800);
        assert_eq!(cfg.chunking.overlap_words, 50);
        assert_eq!(cfg.retrieval.k, 8);
        assert_eq!(cfg.retrieval.recent_window, 200);
        assert_eq!(cfg.retrieval.ivfflat_lists(), 100);
        assert_eq!(cfg.freshness.interval(), Duration::from_secs(3600));
        assert_eq!(cfg.freshness.max_age_hours, 24);
        assert_eq!(cfg.freshness.limit, 200);
        assert!(!cfg.embedding.is_enabled());
        assert!(cfg.usage.enabled);
    }

    #[test]
    fn test_openai_requires_model_and_dims() {
        let err = parse_config(
            "[db]\npath = \"x.sqlite\"\n[embedding]\nprovider = \"openai\"\ndims = 1536\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("embedding.model"));

        let cfg = parse_config(
            "[db]\npath = \"x.sqlite\"\n[embedding]\nprovider = \"openai\"\nmodel = \"text-embedding-3-small\"\ndims = 1536\n",
        )
        .unwrap();
        assert_eq!(cfg.embedding.api_key_env, "OPENAI_API_KEY");
    }

    #[test]
    fn test_rejects_bad_values() {
        for body in [
            "[chunking]\nmax_words = 0\n",
            "[chunking]\nmax_words = 10\noverlap_words = 10\n",
            "[retrieval]\nk = 0\n",
            "[freshness]\ninterval_secs = 0\n",
            "[embedding]\nprovider = \"cohere\"\n",
        ] {
            let text = format!("[db]\npath = \"x.sqlite\"\n{}", body);
            assert!(parse_config(&text).is_err(), "accepted: {}", body);
        }
    }

    #[test]
    fn test_ivfflat_lists_clamped() {
        for (raw, expected) in [(1, 10), (250, 250), (1_000_000, 65535)] {
            let text = format!("[db]\npath = \"x.sqlite\"\n[retrieval]\nivfflat_lists = {}\n", raw);
            assert_eq!(parse_config(&text).unwrap().retrieval.ivfflat_lists(), expected);
        }
    }

    #[test]
    fn test_freshness_options() {
        let cfg = parse_config(
            "[db]\npath = \"x.sqlite\"\n[freshness]\nlimit = 5\nscope_id = \"123\"\nforce = true\n",
        )
        .unwrap();
        let opts = cfg.freshness.reembed_options();
        assert_eq!(opts.limit, 5);
        assert_eq!(opts.scope_id, Some("123"));
        assert!(opts.force);
    }
}
