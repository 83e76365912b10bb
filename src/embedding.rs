//! Embedding provider abstraction and implementations.
//!
//! Defines the [`EmbeddingProvider`] trait and concrete implementations:
//! - **[`DisabledProvider`]**: fails every call; used when embeddings are not configured.
//! - **[`OpenAIProvider`]**: calls the OpenAI embeddings API with batching, retry, and backoff.
//! - **[`OllamaProvider`]**: calls a local Ollama instance's `/api/embed` endpoint.
//!
//! Also provides the BLOB encoding used by the SQLite store:
//! - [`vec_to_blob`]: encode a `Vec<f64>` as little-endian bytes
//! - [`blob_to_vec`]: decode a BLOB back into a `Vec<f64>`
//!
//! # Retry Strategy
//!
//! The HTTP providers use exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)
//!
//! Vector dimensionality is whatever the provider returns; it is not checked
//! against `embedding.dims`.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::ProviderError;

/// Trait for embedding providers.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;

    /// Returns the declared vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;

    /// `false` only for [`DisabledProvider`].
    fn is_enabled(&self) -> bool {
        true
    }

    /// Whether [`embed_batch`](EmbeddingProvider::embed_batch) is a single
    /// upstream call rather than the default per-text loop.
    fn supports_batching(&self) -> bool {
        false
    }

    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f64>, ProviderError>;

    /// Embed several texts, returning vectors in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f64>>, ProviderError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }
}

/// Instantiate the provider named by `config.provider`.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>, ProviderError> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledProvider)),
        "openai" => Ok(Arc::new(OpenAIProvider::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaProvider::new(config)?)),
        other => Err(ProviderError::Config(format!(
            "Unknown embedding provider: {}",
            other
        ))),
    }
}

// ============ Disabled Provider ============

/// A provider that always fails. Used when `embedding.provider = "disabled"`.
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    fn is_enabled(&self) -> bool {
        false
    }
    async fn embed(&self, _text: &str) -> Result<Vec<f64>, ProviderError> {
        Err(ProviderError::Disabled)
    }
}

// ============ Shared HTTP plumbing ============

fn required_model(config: &EmbeddingConfig, provider: &str) -> Result<String, ProviderError> {
    config.model.clone().ok_or_else(|| {
        ProviderError::Config(format!("embedding.model required for {} provider", provider))
    })
}

fn required_dims(config: &EmbeddingConfig, provider: &str) -> Result<usize, ProviderError> {
    config.dims.ok_or_else(|| {
        ProviderError::Config(format!("embedding.dims required for {} provider", provider))
    })
}

fn build_client(config: &EmbeddingConfig) -> Result<reqwest::Client, ProviderError> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?)
}

/// POST `body` to `url` with retry/backoff, returning the parsed JSON.
async fn post_with_retry(
    client: &reqwest::Client,
    url: &str,
    bearer: Option<&str>,
    body: &serde_json::Value,
    max_retries: u32,
) -> Result<serde_json::Value, ProviderError> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            // Exponential backoff: 1s, 2s, 4s, 8s, ...
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        let mut request = client.post(url).json(body);
        if let Some(key) = bearer {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return Ok(response.json().await?);
                }

                let body_text = response.text().await.unwrap_or_default();
                let err = ProviderError::Api {
                    status: status.as_u16(),
                    body: body_text,
                };

                // Rate limited or server error, retry
                if status.as_u16() == 429 || status.is_server_error() {
                    tracing::debug!(attempt, %status, "embedding request failed, retrying");
                    last_err = Some(err);
                    continue;
                }

                // Client error (not 429), don't retry
                return Err(err);
            }
            Err(e) => {
                tracing::debug!(attempt, error = %e, "embedding transport error, retrying");
                last_err = Some(e.into());
                continue;
            }
        }
    }

    Err(last_err
        .unwrap_or_else(|| ProviderError::InvalidResponse("no attempts were made".to_string())))
}

fn parse_vector(value: &serde_json::Value) -> Result<Vec<f64>, ProviderError> {
    value
        .as_array()
        .ok_or_else(|| ProviderError::InvalidResponse("embedding is not an array".to_string()))?
        .iter()
        .map(|v| {
            v.as_f64()
                .ok_or_else(|| ProviderError::InvalidResponse("non-numeric component".to_string()))
        })
        .collect()
}

fn single(mut vectors: Vec<Vec<f64>>) -> Result<Vec<f64>, ProviderError> {
    if vectors.len() != 1 {
        return Err(ProviderError::InvalidResponse(format!(
            "expected 1 embedding, got {}",
            vectors.len()
        )));
    }
    Ok(vectors.remove(0))
}

// ============ OpenAI Provider ============

/// Embedding provider using the OpenAI API.
///
/// Calls `POST /v1/embeddings` with the configured model. Requires the
/// `OPENAI_API_KEY` environment variable.
pub struct OpenAIProvider {
    model: String,
    dims: usize,
    api_key: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, ProviderError> {
        let model = required_model(config, "OpenAI")?;
        let dims = required_dims(config, "OpenAI")?;
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| {
            ProviderError::Config("OPENAI_API_KEY environment variable not set".to_string())
        })?;

        Ok(Self {
            model,
            dims,
            api_key,
            max_retries: config.max_retries,
            client: build_client(config)?,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    fn supports_batching(&self) -> bool {
        true
    }

    async fn embed(&self, text: &str) -> Result<Vec<f64>, ProviderError> {
        single(self.embed_batch(&[text.to_string()]).await?)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f64>>, ProviderError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let json = post_with_retry(
            &self.client,
            "https://api.openai.com/v1/embeddings",
            Some(&self.api_key),
            &body,
            self.max_retries,
        )
        .await?;
        let vectors = parse_openai_response(&json)?;
        if vectors.len() != texts.len() {
            return Err(ProviderError::InvalidResponse(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                vectors.len()
            )));
        }
        Ok(vectors)
    }
}

/// Extracts `data[].embedding`, ordered by each item's `index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f64>>, ProviderError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| ProviderError::InvalidResponse("missing data array".to_string()))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .ok_or_else(|| ProviderError::InvalidResponse("missing embedding".to_string()))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .unwrap_or(pos as u64);
        indexed.push((index, parse_vector(embedding)?));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama Provider ============

/// Embedding provider using a local Ollama instance.
///
/// Calls `POST /api/embed` on the configured URL (default `http://localhost:11434`).
pub struct OllamaProvider {
    model: String,
    dims: usize,
    url: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, ProviderError> {
        let model = required_model(config, "Ollama")?;
        let dims = required_dims(config, "Ollama")?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        Ok(Self {
            model,
            dims,
            url,
            max_retries: config.max_retries,
            client: build_client(config)?,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    fn supports_batching(&self) -> bool {
        true
    }

    async fn embed(&self, text: &str) -> Result<Vec<f64>, ProviderError> {
        single(self.embed_batch(&[text.to_string()]).await?)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f64>>, ProviderError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let json = post_with_retry(
            &self.client,
            &format!("{}/api/embed", self.url.trim_end_matches('/')),
            None,
            &body,
            self.max_retries,
        )
        .await?;
        parse_ollama_response(&json)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f64>>, ProviderError> {
    json.get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| ProviderError::InvalidResponse("missing embeddings array".to_string()))?
        .iter()
        .map(parse_vector)
        .collect()
}

// ============ Vector encoding ============

/// Encode a vector as little-endian `f64` bytes.
pub fn vec_to_blob(vec: &[f64]) -> Vec<u8> {
    vec.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Decode little-endian `f64` bytes. Trailing partial values are ignored.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f64> {
    blob.chunks_exact(8)
        .map(|chunk| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(chunk);
            f64::from_le_bytes(bytes)
        })
        .collect()
}
