//! Embedding service abstraction and implementations.
//!
//! Defines the [`EmbeddingService`] trait and concrete implementations:
//! - **[`DisabledService`]** — returns errors; used when embeddings are not configured.
//! - **[`GeminiService`]** — calls the Gemini REST API (`countTokens` +
//!   `batchEmbedContents`).
//!
//! Also provides [`normalize_vector`], the unit-normalization applied to
//! every vector requested below the service's native dimensionality.
//!
//! # Error Taxonomy
//!
//! Embedding calls fail with a typed [`EmbedError`] so the batch pipeline can
//! tell a rate-limit signal (HTTP 429 — retryable with backoff) from every
//! other failure (abandon the batch, no retry). The service itself never
//! retries: retry scheduling belongs to the caller via
//! [`RetryPolicy`](crate::retry::RetryPolicy).
//!
//! # Normalization Policy
//!
//! Vectors requested at the service's native maximum dimensionality are
//! assumed already appropriately scaled and are returned as-is; at any other
//! dimensionality each vector is divided by its Euclidean norm. A zero-norm
//! vector is left unmodified.

use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

use crate::config::EmbeddingConfig;

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Model used for exact token counting.
const COUNT_TOKENS_MODEL: &str = "gemini-1.5-flash-latest";

/// A failure from the embedding service.
#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("embedding service is disabled")]
    Disabled,
    #[error("embedding service rate limited: {0}")]
    RateLimited(String),
    #[error("embedding API error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("embedding request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("invalid embedding response: {0}")]
    InvalidResponse(String),
}

/// A remote service that counts tokens and maps text to fixed-dimension vectors.
///
/// The output dimensionality is fixed at construction; `embed` returns one
/// vector per input text, in input order.
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    /// Configured output dimensionality (e.g. `768`).
    fn dims(&self) -> usize;

    /// The service's native maximum dimensionality (e.g. `3072`).
    fn native_dims(&self) -> usize;

    /// Whether vectors from this service must be unit-normalized locally.
    fn needs_normalization(&self) -> bool {
        self.dims() != self.native_dims()
    }

    /// Exact token count for one text.
    async fn count_tokens(&self, text: &str) -> Result<usize, EmbedError>;

    /// Embed a batch of texts in one call.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError>;
}

// ============ Disabled Service ============

/// A no-op embedding service that always returns errors.
///
/// Used when `embedding.provider = "disabled"` in the configuration.
pub struct DisabledService;

#[async_trait]
impl EmbeddingService for DisabledService {
    fn dims(&self) -> usize {
        0
    }

    fn native_dims(&self) -> usize {
        0
    }

    async fn count_tokens(&self, _text: &str) -> Result<usize, EmbedError> {
        Err(EmbedError::Disabled)
    }

    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        Err(EmbedError::Disabled)
    }
}

// ============ Gemini Service ============

/// Embedding service backed by the Gemini REST API.
///
/// Requires the `GEMINI_API_KEY` environment variable. Token counting uses
/// the `countTokens` endpoint; embedding uses `batchEmbedContents` with
/// `taskType: SEMANTIC_SIMILARITY` and the configured output dimensionality.
pub struct GeminiService {
    model: String,
    dims: usize,
    native_dims: usize,
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl GeminiService {
    /// Create a new Gemini service from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `model` is not set in config or if
    /// `GEMINI_API_KEY` is not in the environment.
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Gemini provider"))?;

        let api_key = std::env::var("GEMINI_API_KEY")
            .map_err(|_| anyhow::anyhow!("GEMINI_API_KEY environment variable not set"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            dims: config.dims,
            native_dims: config.native_dims,
            api_key,
            base_url: GEMINI_API_BASE.to_string(),
            client,
        })
    }

    async fn post(
        &self,
        url: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, EmbedError> {
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();

        if status.as_u16() == 429 {
            let body_text = response.text().await.unwrap_or_default();
            return Err(EmbedError::RateLimited(body_text));
        }

        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(EmbedError::Api {
                status: status.as_u16(),
                body: body_text,
            });
        }

        response.json().await.map_err(EmbedError::from)
    }
}

#[async_trait]
impl EmbeddingService for GeminiService {
    fn dims(&self) -> usize {
        self.dims
    }

    fn native_dims(&self) -> usize {
        self.native_dims
    }

    async fn count_tokens(&self, text: &str) -> Result<usize, EmbedError> {
        let url = format!(
            "{}/models/{}:countTokens",
            self.base_url, COUNT_TOKENS_MODEL
        );
        let body = json!({
            "contents": [{ "parts": [{ "text": text }] }],
        });

        let response = self.post(&url, body).await?;
        parse_count_response(&response)
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let url = format!(
            "{}/models/{}:batchEmbedContents",
            self.base_url, self.model
        );

        let requests: Vec<serde_json::Value> = texts
            .iter()
            .map(|text| {
                json!({
                    "model": format!("models/{}", self.model),
                    "content": { "parts": [{ "text": text }] },
                    "taskType": "SEMANTIC_SIMILARITY",
                    "outputDimensionality": self.dims,
                })
            })
            .collect();

        let response = self.post(&url, json!({ "requests": requests })).await?;
        let vectors = parse_batch_response(&response)?;

        if vectors.len() != texts.len() {
            return Err(EmbedError::InvalidResponse(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                vectors.len()
            )));
        }

        Ok(vectors)
    }
}

/// Parse the `countTokens` response JSON.
fn parse_count_response(json: &serde_json::Value) -> Result<usize, EmbedError> {
    json.get("totalTokens")
        .and_then(|t| t.as_u64())
        .map(|t| t as usize)
        .ok_or_else(|| EmbedError::InvalidResponse("missing totalTokens".to_string()))
}

/// Parse the `batchEmbedContents` response JSON.
///
/// Extracts the `embeddings[].values` arrays and returns them in order.
fn parse_batch_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, EmbedError> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| EmbedError::InvalidResponse("missing embeddings array".to_string()))?;

    let mut vectors = Vec::with_capacity(embeddings.len());

    for item in embeddings {
        let values = item
            .get("values")
            .and_then(|v| v.as_array())
            .ok_or_else(|| EmbedError::InvalidResponse("missing embedding values".to_string()))?;

        let vec: Vec<f32> = values
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();

        vectors.push(vec);
    }

    Ok(vectors)
}

/// Create the appropriate [`EmbeddingService`] based on configuration.
///
/// # Errors
///
/// Returns an error for unknown provider names or if the Gemini service
/// cannot be initialized (missing config or API key).
pub fn create_service(config: &EmbeddingConfig) -> anyhow::Result<Box<dyn EmbeddingService>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledService)),
        "gemini" => Ok(Box::new(GeminiService::new(config)?)),
        other => anyhow::bail!("Unknown embedding provider: {}", other),
    }
}

/// Divide a vector by its Euclidean norm, in place.
///
/// A zero-norm vector is left unmodified (guards divide-by-zero).
pub fn normalize_vector(vec: &mut [f32]) {
    let norm: f32 = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vec.iter_mut() {
            *v /= norm;
        }
    }
}
