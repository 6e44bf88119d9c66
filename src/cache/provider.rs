use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub embedding: Vec<f32>,
    pub text: String,
    pub token_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchEmbedding {
    pub embeddings: Vec<Embedding>,
    pub total_tokens: u64,
    pub cost: f64,
}

/// Source of embeddings. Network calls live behind this trait, never in the core.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Stable identifier (provider plus model) mixed into cache keys.
    fn identity(&self) -> &str;

    async fn embed_text(&self, text: &str) -> Result<Embedding>;

    /// Must return one embedding per input, in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<BatchEmbedding>;
}

#[async_trait]
impl<P: EmbeddingProvider + ?Sized> EmbeddingProvider for Arc<P> {
    fn identity(&self) -> &str {
        (**self).identity()
    }

    async fn embed_text(&self, text: &str) -> Result<Embedding> {
        (**self).embed_text(text).await
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<BatchEmbedding> {
        (**self).embed_batch(texts).await
    }
}
