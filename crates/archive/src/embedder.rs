//! Sentence embedders.
//!
//! `HashEmbedder` is the zero-setup default: a deterministic feature-hashing
//! embedding (token and bigram features hashed into a fixed 384-dim space,
//! L2-normalized). It needs no model files or network and identical inputs
//! always produce identical vectors, which is what the archive contract
//! requires. `ProviderEmbedder` delegates to a remote embedding endpoint
//! behind the `Provider` trait.

use async_trait::async_trait;
use canopy_core::{ArchiveError, Embedder, EmbeddingRequest, Provider};
use std::sync::Arc;

/// Output dimension of [`HashEmbedder`], matching the small
/// sentence-transformer models commonly used for this workload.
pub const HASH_EMBEDDER_DIM: usize = 384;

/// Deterministic feature-hashing sentence embedder.
pub struct HashEmbedder {
    name: String,
    dimensions: usize,
}

impl HashEmbedder {
    pub fn new() -> Self {
        Self {
            name: "hash-embed-v1".into(),
            dimensions: HASH_EMBEDDER_DIM,
        }
    }

    /// A variant with a custom dimension (tests use small spaces).
    pub fn with_dimensions(dimensions: usize) -> Self {
        Self {
            name: format!("hash-embed-v1-{dimensions}"),
            dimensions: dimensions.max(2),
        }
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut acc = vec![0.0f32; self.dimensions];

        let tokens: Vec<String> = text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(String::from)
            .collect();

        for token in &tokens {
            bump(&mut acc, token, 1.0);
        }
        // Bigram features give phrases like "my name" weight beyond their
        // individual tokens.
        for pair in tokens.windows(2) {
            bump(&mut acc, &format!("{} {}", pair[0], pair[1]), 0.5);
        }

        l2_normalize(&mut acc);
        acc
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash a feature into a slot with a deterministic sign.
fn bump(acc: &mut [f32], feature: &str, weight: f32) {
    let hash = fnv1a(feature.as_bytes());
    let slot = (hash % acc.len() as u64) as usize;
    let sign = if (hash >> 32) & 1 == 0 { 1.0 } else { -1.0 };
    acc[slot] += sign * weight;
}

/// FNV-1a over bytes.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

fn l2_normalize(vec: &mut [f32]) {
    let norm: f32 = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in vec.iter_mut() {
            *v /= norm;
        }
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn name(&self) -> &str {
        &self.name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ArchiveError> {
        Ok(self.embed_text(text))
    }
}

/// Embedder backed by a remote embedding model exposed through `Provider`.
pub struct ProviderEmbedder {
    provider: Arc<dyn Provider>,
    model: String,
    dimensions: usize,
}

impl ProviderEmbedder {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>, dimensions: usize) -> Self {
        Self {
            provider,
            model: model.into(),
            dimensions,
        }
    }
}

#[async_trait]
impl Embedder for ProviderEmbedder {
    fn name(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ArchiveError> {
        let response = self
            .provider
            .embed(EmbeddingRequest {
                model: self.model.clone(),
                inputs: vec![text.to_string()],
            })
            .await
            .map_err(|e| ArchiveError::EmbeddingFailed(e.to_string()))?;

        let embedding = response
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| ArchiveError::EmbeddingFailed("provider returned no vectors".into()))?;

        if embedding.len() != self.dimensions {
            return Err(ArchiveError::EmbeddingFailed(format!(
                "expected {} dimensions, got {}",
                self.dimensions,
                embedding.len()
            )));
        }

        Ok(embedding)
    }
}
