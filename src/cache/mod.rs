mod embedding;
mod provider;

pub use embedding::{CacheOptions, CacheStats, EmbeddingCache, cache_key};
pub use provider::{BatchEmbedding, Embedding, EmbeddingProvider};
