//! Embedding clients.
//!
//! Concrete [`Embedder`] implementations for the providers the config can
//! name:
//!
//! | `embedding.provider` | Client |
//! |----------------------|--------|
//! | `"disabled"` | [`PlaceholderEmbedder`] (zero vectors) |
//! | `"openai"` | [`OpenAiEmbedder`], `POST {url}/v1/embeddings` |
//! | `"ollama"` | [`OllamaEmbedder`], `POST {url}/api/embed` |
//! | `"local"` | `LocalEmbedder` (fastembed, feature `local-embeddings`) |
//!
//! Each call is a single HTTP round trip with the configured timeout.
//! Clients do not retry; a failed call surfaces to the engine, which leaves
//! the store untouched.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use embedstore_core::embedding::{EmbedResponse, Embedder, EmbeddingItem, PlaceholderEmbedder};

use crate::config::EmbeddingConfig;

const OPENAI_BASE_URL: &str = "https://api.openai.com";
const OLLAMA_BASE_URL: &str = "http://localhost:11434";
/// Dimension used for placeholder vectors when `embedding.dims` is unset.
pub const PLACEHOLDER_DIMS: usize = 1536;

// ============ OpenAI ============

/// Client for OpenAI-compatible `/v1/embeddings` endpoints.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    dims: usize,
}

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct OpenAiResponse {
    #[serde(default)]
    model: Option<String>,
    data: Vec<OpenAiItem>,
}

#[derive(Deserialize)]
struct OpenAiItem {
    index: usize,
    embedding: Vec<f32>,
}

impl OpenAiEmbedder {
    pub fn new(
        api_key: &str,
        base_url: &str,
        model: String,
        dims: usize,
        timeout: Duration,
    ) -> Result<Self> {
        anyhow::ensure!(!api_key.trim().is_empty(), "missing OpenAI API key");
        anyhow::ensure!(!model.trim().is_empty(), "missing OpenAI model name");

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", api_key.trim()))
                .context("invalid OpenAI API key")?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build OpenAI HTTP client")?;

        Ok(Self {
            client,
            endpoint: format!("{}/v1/embeddings", base_url.trim_end_matches('/')),
            model,
            dims,
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn provider(&self) -> &str {
        "openai"
    }
    fn default_model(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String], model: Option<&str>) -> Result<EmbedResponse> {
        let model = model.unwrap_or(&self.model);
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&OpenAiRequest {
                model,
                input: texts,
            })
            .send()
            .await
            .context("OpenAI embeddings request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            bail!("OpenAI API error {}: {}", status, body);
        }

        let parsed: OpenAiResponse = resp
            .json()
            .await
            .context("failed to parse OpenAI embedding response")?;
        Ok(EmbedResponse {
            model: parsed.model.unwrap_or_else(|| model.to_string()),
            data: parsed
                .data
                .into_iter()
                .map(|item| EmbeddingItem {
                    text: texts.get(item.index).cloned().unwrap_or_default(),
                    index: item.index,
                    embedding: item.embedding,
                })
                .collect(),
        })
    }
}

// ============ Ollama ============

/// Client for a local Ollama instance.
pub struct OllamaEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
}

#[derive(Deserialize)]
struct OllamaResponse {
    #[serde(default)]
    model: Option<String>,
    embeddings: Vec<Vec<f32>>,
}

impl OllamaEmbedder {
    pub fn new(url: &str, model: String, dims: usize, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build Ollama HTTP client")?;
        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            model,
            dims,
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn provider(&self) -> &str {
        "ollama"
    }
    fn default_model(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String], model: Option<&str>) -> Result<EmbedResponse> {
        let model = model.unwrap_or(&self.model);
        let resp = self
            .client
            .post(format!("{}/api/embed", self.url))
            .json(&serde_json::json!({ "model": model, "input": texts }))
            .send()
            .await
            .with_context(|| format!("Ollama connection error (is Ollama running at {}?)", self.url))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("Ollama API error {}: {}", status, body);
        }

        let parsed: OllamaResponse = resp
            .json()
            .await
            .context("Invalid Ollama response")?;
        Ok(EmbedResponse {
            model: parsed.model.unwrap_or_else(|| model.to_string()),
            data: parsed
                .embeddings
                .into_iter()
                .zip(texts)
                .enumerate()
                .map(|(index, (embedding, text))| EmbeddingItem {
                    index,
                    embedding,
                    text: text.clone(),
                })
                .collect(),
        })
    }
}

// ============ Local (fastembed) ============

/// Offline embeddings via fastembed. The model is downloaded on first use
/// and inference runs on a blocking thread.
#[cfg(feature = "local-embeddings")]
pub struct LocalEmbedder {
    model: String,
    dims: usize,
}

#[cfg(feature = "local-embeddings")]
impl LocalEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .unwrap_or_else(|| "all-minilm-l6-v2".to_string());
        fastembed_model(&model)?;
        let dims = config.dims.unwrap_or(match model.as_str() {
            "bge-base-en-v1.5" | "nomic-embed-text-v1.5" => 768,
            "bge-large-en-v1.5" => 1024,
            _ => 384,
        });
        Ok(Self { model, dims })
    }
}

#[cfg(feature = "local-embeddings")]
fn fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        other => bail!(
            "Unknown local embedding model: '{}'. Supported models: all-minilm-l6-v2, \
             bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, nomic-embed-text-v1.5",
            other
        ),
    }
}

#[cfg(feature = "local-embeddings")]
#[async_trait]
impl Embedder for LocalEmbedder {
    fn provider(&self) -> &str {
        "local"
    }
    fn default_model(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String], model: Option<&str>) -> Result<EmbedResponse> {
        let name = model.unwrap_or(&self.model).to_string();
        let kind = fastembed_model(&name)?;
        let inputs = texts.to_vec();

        let vectors = tokio::task::spawn_blocking(move || -> Result<Vec<Vec<f32>>> {
            let mut model = fastembed::TextEmbedding::try_new(
                fastembed::InitOptions::new(kind).with_show_download_progress(false),
            )
            .map_err(|e| anyhow::anyhow!("Failed to initialize local embedding model: {}", e))?;
            model
                .embed(inputs, None)
                .map_err(|e| anyhow::anyhow!("Local embedding failed: {}", e))
        })
        .await??;

        Ok(EmbedResponse {
            model: name,
            data: vectors
                .into_iter()
                .zip(texts)
                .enumerate()
                .map(|(index, (embedding, text))| EmbeddingItem {
                    index,
                    embedding,
                    text: text.clone(),
                })
                .collect(),
        })
    }
}

/// Build the client named by `embedding.provider`.
///
/// An `openai` config whose API key variable is unset falls back to the
/// placeholder so rows can still be written and re-embedded later.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    let timeout = Duration::from_secs(config.timeout_secs);
    let dims = config.dims.unwrap_or(PLACEHOLDER_DIMS);

    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(PlaceholderEmbedder::new(dims))),
        "openai" => {
            let model = config
                .model
                .clone()
                .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
            match std::env::var(&config.api_key_env) {
                Ok(key) if !key.trim().is_empty() => {
                    let base = config.url.as_deref().unwrap_or(OPENAI_BASE_URL);
                    Ok(Arc::new(OpenAiEmbedder::new(&key, base, model, dims, timeout)?))
                }
                _ => {
                    warn!(
                        env = %config.api_key_env,
                        "API key not set, storing placeholder vectors"
                    );
                    Ok(Arc::new(PlaceholderEmbedder::new(dims)))
                }
            }
        }
        "ollama" => {
            let model = config
                .model
                .clone()
                .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
            let url = config.url.as_deref().unwrap_or(OLLAMA_BASE_URL);
            Ok(Arc::new(OllamaEmbedder::new(url, model, dims, timeout)?))
        }
        #[cfg(feature = "local-embeddings")]
        "local" => Ok(Arc::new(LocalEmbedder::new(config)?)),
        #[cfg(not(feature = "local-embeddings"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}
