use crate::error::{ErrorCode, GraphmindError};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VectorError {
    #[error("vector backend error: {0}")]
    Backend(String),
}

impl GraphmindError for VectorError {
    fn error_code(&self) -> ErrorCode {
        ErrorCode::Unavailable
    }
}

/// One nearest-neighbour result. Relevance is in `[0, 1]`; `1.0` is reserved
/// for exact semantic identity and drives vector-identity deduplication.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub id: String,
    pub text: String,
    pub relevance: f32,
}

/// Embedding-backed nearest-neighbour index over node description strings,
/// keyed by `(index, id)`.
#[async_trait]
pub trait VectorMemory: Send + Sync {
    /// Upserts the entry for `id` within `index`.
    async fn save(&self, index: &str, id: &str, text: &str) -> Result<(), VectorError>;

    /// Returns up to `limit` hits with relevance >= `min_relevance`, ordered
    /// by descending relevance.
    async fn search(
        &self,
        index: &str,
        query: &str,
        limit: usize,
        min_relevance: f32,
    ) -> Result<Vec<VectorHit>, VectorError>;

    async fn remove(&self, index: &str, id: &str) -> Result<(), VectorError>;
}

/// Produces the vector for a payload string.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Vec<f32>;
}
