use crate::vector::Embedder;
use async_trait::async_trait;
use sha2::{Digest, Sha256};

/// Hash-derived embedding: reproducible, model-free, useful for tests and
/// embedded deployments without an embedding provider.
pub fn deterministic_embedding(text: &str, dims: usize) -> Vec<f32> {
    let dims = dims.max(1);

    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();

    let mut out = Vec::with_capacity(dims);
    for i in 0..dims {
        let byte = digest[i % digest.len()];
        let value = (byte as f32 / 127.5) - 1.0;
        out.push(value);
    }

    out
}

pub struct DeterministicEmbedder {
    dims: usize,
}

impl DeterministicEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }
}

#[async_trait]
impl Embedder for DeterministicEmbedder {
    async fn embed(&self, text: &str) -> Vec<f32> {
        deterministic_embedding(text, self.dims)
    }
}
