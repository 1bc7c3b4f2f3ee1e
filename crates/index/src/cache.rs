use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct CachedEmbedding {
    pub content_hash: String,
    pub vector: Arc<Vec<f32>>,
}

/// Chunk embeddings keyed by chunk id, and free-text embeddings keyed by
/// content hash. Safe to share between workers.
pub struct EmbeddingCache {
    chunks: DashMap<String, CachedEmbedding>,
    texts: DashMap<String, Arc<Vec<f32>>>,
    max_text_entries: usize,
}

impl EmbeddingCache {
    pub fn new(max_text_entries: usize) -> Self {
        Self {
            chunks: DashMap::new(),
            texts: DashMap::new(),
            max_text_entries: max_text_entries.max(1),
        }
    }

    /// Cached vector for a chunk, only if it was computed from the same content.
    pub fn chunk_embedding(&self, chunk_id: &str, content_hash: &str) -> Option<Arc<Vec<f32>>> {
        self.chunks
            .get(chunk_id)
            .filter(|entry| entry.content_hash == content_hash)
            .map(|entry| entry.vector.clone())
    }

    pub fn set_chunk_embedding(&self, chunk_id: &str, content_hash: &str, vector: Vec<f32>) {
        // Identical content from two workers writes an identical entry.
        self.chunks.insert(
            chunk_id.to_string(),
            CachedEmbedding {
                content_hash: content_hash.to_string(),
                vector: Arc::new(vector),
            },
        );
    }

    pub fn get_text_embedding(&self, text: &str) -> Option<Arc<Vec<f32>>> {
        self.texts.get(&hash_text(text)).map(|r| r.value().clone())
    }

    pub fn set_text_embedding(&self, text: &str, vector: Vec<f32>) -> Arc<Vec<f32>> {
        if self.texts.len() >= self.max_text_entries {
            // Simple eviction: clear 25% when full
            let to_remove: Vec<_> = self
                .texts
                .iter()
                .take((self.max_text_entries / 4).max(1))
                .map(|r| r.key().clone())
                .collect();
            for key in to_remove {
                self.texts.remove(&key);
            }
        }
        let vector = Arc::new(vector);
        self.texts.insert(hash_text(text), vector.clone());
        vector
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            chunk_embeddings: self.chunks.len(),
            text_embeddings: self.texts.len(),
        }
    }
}

impl Default for EmbeddingCache {
    fn default() -> Self {
        Self::new(10_000)
    }
}

fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub chunk_embeddings: usize,
    pub text_embeddings: usize,
}
