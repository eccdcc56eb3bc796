//! OpenAI-compatible HTTP embedding provider.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use crate::config::EmbeddingConfig;
use crate::embedding::{Embedder, EmbeddingError};

/// Embedder calling an `/embeddings` endpoint.
pub struct HttpEmbedder {
    client: Client,
    url: String,
    model: String,
    api_key: Option<String>,
    dimension: usize,
}

impl HttpEmbedder {
    /// Build an embedder from config; the API key is read from the configured
    /// environment variable, if any.
    ///
    /// # Errors
    ///
    /// Returns `EmbeddingError::Unavailable` if the HTTP client cannot be built.
    pub fn new(cfg: &EmbeddingConfig, dimension: usize) -> Result<Self, EmbeddingError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(|e| EmbeddingError::Unavailable(e.to_string()))?;
        let api_key = cfg
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|key| !key.is_empty());

        Ok(Self {
            client,
            url: format!("{}{}", cfg.api_base.trim_end_matches('/'), cfg.path),
            model: cfg.model.clone(),
            api_key,
            dimension,
        })
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": [text],
            "dimensions": self.dimension,
        });

        let mut request = self.client.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let res = request
            .send()
            .await
            .map_err(|e| EmbeddingError::Unavailable(e.to_string()))?;
        let json: Value = res
            .error_for_status()
            .map_err(|e| EmbeddingError::Unavailable(e.to_string()))?
            .json()
            .await
            .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()))?;

        let vector = parse_embedding_response(&json)?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::InvalidResponse("empty data array".to_string()))?;

        if vector.len() != self.dimension {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(vector)
    }
}

fn parse_embedding_response(json: &Value) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let data = json
        .get("data")
        .and_then(|v| v.as_array())
        .ok_or_else(|| EmbeddingError::InvalidResponse("missing data array".to_string()))?;

    let mut indexed: Vec<(u64, Vec<f32>)> = Vec::with_capacity(data.len());
    for (fallback_index, item) in (0_u64..).zip(data) {
        let index = item
            .get("index")
            .and_then(Value::as_u64)
            .unwrap_or(fallback_index);
        let embedding = item
            .get("embedding")
            .and_then(|v| v.as_array())
            .ok_or_else(|| {
                EmbeddingError::InvalidResponse("item missing embedding array".to_string())
            })?;

        let mut vector = Vec::with_capacity(embedding.len());
        for value in embedding {
            let number = value.as_f64().ok_or_else(|| {
                EmbeddingError::InvalidResponse("embedding value must be numeric".to_string())
            })?;
            #[allow(clippy::cast_possible_truncation)]
            let component = number as f32;
            if !component.is_finite() {
                return Err(EmbeddingError::InvalidResponse(format!(
                    "embedding value {number} does not fit in f32"
                )));
            }
            vector.push(component);
        }
        indexed.push((index, vector));
    }

    indexed.sort_by_key(|(index, _)| *index);

    Ok(indexed.into_iter().map(|(_, vector)| vector).collect())
}
