//! Embedding capability and bundled embedders.
//!
//! The embedding model is an external collaborator: everything else only sees
//! the [`Embedder`] trait.

pub mod http;

use async_trait::async_trait;

use crate::corpus::normalize;

/// Errors returned by embedders.
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Embedding provider unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid embedding response: {0}")]
    InvalidResponse(String),

    #[error("Embedding has {actual} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Turns text into a fixed-length vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Length of every vector this embedder returns.
    fn dimension(&self) -> usize;

    /// Embed a single text.
    ///
    /// # Errors
    ///
    /// Returns `EmbeddingError` if the provider fails or answers with a vector
    /// of the wrong length.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

/// Deterministic feature-hashing embedder.
///
/// Each lowercase alphanumeric token is hashed into a signed bucket and the
/// result is scaled to unit length, so texts sharing words have positive
/// cosine similarity. No model, no network.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

/// Tokens too common to carry meaning in a hashed vector.
const HASHING_STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "in", "is", "it", "of", "on",
    "or", "that", "the", "this", "to", "was", "with",
];

impl HashingEmbedder {
    #[must_use]
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    /// Embed synchronously; the async trait method delegates here.
    #[must_use]
    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0_f32; self.dimension];
        if self.dimension == 0 {
            return vector;
        }

        for token in tokens(text) {
            let hash = blake3::hash(token.as_bytes());
            let bytes = hash.as_bytes();
            let mut head = [0_u8; 8];
            head.copy_from_slice(&bytes[..8]);
            let value = u64::from_le_bytes(head);

            #[allow(clippy::cast_possible_truncation)]
            let bucket = (value % self.dimension as u64) as usize;
            let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        normalize(&mut vector);
        vector
    }
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .filter(|t| !HASHING_STOPWORDS.contains(&t.as_str()))
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Ok(self.embed_sync(text))
    }
}
