pub mod cache;
pub mod similarity;

pub use cache::{CacheStats, EmbeddingCache};
pub use similarity::cosine_similarity;

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use ingest::Chunk;
use llm::{Embedder, GenerationFailure, RetryPolicy};

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("embedding failed: {0}")]
    Embedding(#[from] GenerationFailure),
    #[error("embedding has dimension {actual}, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// A chunk ranked against a query.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct EmbedStats {
    pub computed: usize,
    pub cached: usize,
}

/// Chunks of the corpus, their embeddings, and an entity → chunk map.
pub struct RetrievalIndex {
    embedder: Arc<dyn Embedder>,
    retry: RetryPolicy,
    chunks: Vec<Chunk>,
    positions: HashMap<String, usize>,
    entity_index: HashMap<String, BTreeSet<String>>,
    cache: EmbeddingCache,
    dimension: Option<usize>,
}

impl RetrievalIndex {
    pub fn new(embedder: Arc<dyn Embedder>, retry: RetryPolicy) -> Self {
        let dimension = embedder.dimension();
        Self {
            embedder,
            retry,
            chunks: Vec::new(),
            positions: HashMap::new(),
            entity_index: HashMap::new(),
            cache: EmbeddingCache::default(),
            dimension,
        }
    }

    /// Registers chunks for entity lookups. A chunk id seen before is replaced.
    pub fn add_chunks(&mut self, chunks: &[Chunk]) {
        for chunk in chunks {
            if let Some(&pos) = self.positions.get(&chunk.chunk_id) {
                for entity in &self.chunks[pos].entities {
                    if let Some(ids) = self.entity_index.get_mut(entity) {
                        ids.remove(&chunk.chunk_id);
                    }
                }
                self.chunks[pos] = chunk.clone();
            } else {
                self.positions.insert(chunk.chunk_id.clone(), self.chunks.len());
                self.chunks.push(chunk.clone());
            }

            for entity in &chunk.entities {
                self.entity_index
                    .entry(entity.clone())
                    .or_default()
                    .insert(chunk.chunk_id.clone());
            }
        }

        debug!(
            chunks = self.chunks.len(),
            entities = self.entity_index.len(),
            "Index updated"
        );
    }

    /// Computes the embedding of every chunk whose content changed since it was
    /// last embedded. Unchanged chunks are not sent to the embedder again.
    pub async fn embed(&self, chunks: &[Chunk]) -> Result<EmbedStats, IndexError> {
        let mut stats = EmbedStats::default();

        for chunk in chunks {
            let hash = chunk.content_hash();
            if self.cache.chunk_embedding(&chunk.chunk_id, &hash).is_some() {
                stats.cached += 1;
                continue;
            }

            let vector = self.embed_uncached(&chunk.text).await?;
            self.cache.set_chunk_embedding(&chunk.chunk_id, &hash, vector);
            stats.computed += 1;
        }

        info!(
            computed = stats.computed,
            cached = stats.cached,
            "Chunk embeddings ready"
        );
        Ok(stats)
    }

    /// Embedding of arbitrary text (queries, questions), cached by content hash.
    pub async fn embed_text(&self, text: &str) -> Result<Arc<Vec<f32>>, IndexError> {
        if let Some(vector) = self.cache.get_text_embedding(text) {
            return Ok(vector);
        }
        let vector = self.embed_uncached(text).await?;
        Ok(self.cache.set_text_embedding(text, vector))
    }

    async fn embed_uncached(&self, text: &str) -> Result<Vec<f32>, IndexError> {
        let embedder = &self.embedder;
        let vector = self
            .retry
            .retry("embed", || embedder.embed(text))
            .await?
            .value;

        if let Some(expected) = self.dimension {
            if vector.len() != expected {
                return Err(IndexError::DimensionMismatch {
                    expected,
                    actual: vector.len(),
                });
            }
        }
        Ok(vector)
    }

    /// The `k` embedded chunks most similar to `query_text`, by descending
    /// cosine similarity with ties broken by chunk id.
    pub async fn nearest(&self, query_text: &str, k: usize) -> Result<Vec<ScoredChunk>, IndexError> {
        let query = self.embed_text(query_text).await?;

        let mut scored: Vec<ScoredChunk> = self
            .chunks
            .iter()
            .filter_map(|chunk| {
                let vector = self
                    .cache
                    .chunk_embedding(&chunk.chunk_id, &chunk.content_hash())?;
                let score = cosine_similarity(&query, &vector).unwrap_or(0.0);
                Some(ScoredChunk {
                    chunk: chunk.clone(),
                    score,
                })
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.chunk.chunk_id.cmp(&b.chunk.chunk_id))
        });
        scored.truncate(k);
        Ok(scored)
    }

    /// Chunks sharing at least one entity with `chunk`, from documents other
    /// than its own and not in `exclude_documents`, ordered by chunk id.
    pub fn entity_neighbors(&self, chunk: &Chunk, exclude_documents: &HashSet<String>) -> Vec<&Chunk> {
        let mut ids: BTreeSet<&str> = BTreeSet::new();
        for entity in &chunk.entities {
            if let Some(chunk_ids) = self.entity_index.get(entity) {
                ids.extend(chunk_ids.iter().map(String::as_str));
            }
        }

        ids.into_iter()
            .filter_map(|id| self.get(id))
            .filter(|c| c.doc_id != chunk.doc_id && !exclude_documents.contains(&c.doc_id))
            .collect()
    }

    pub fn get(&self, chunk_id: &str) -> Option<&Chunk> {
        self.positions.get(chunk_id).map(|&pos| &self.chunks[pos])
    }

    /// Registered chunks in the order they were added.
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

/// Entities present in both chunks.
pub fn shared_entities<'a>(a: &'a Chunk, b: &'a Chunk) -> BTreeSet<&'a str> {
    a.entities
        .intersection(&b.entities)
        .map(String::as_str)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use counting::CountingEmbedder;

    mod counting {
        use llm::{CapabilityError, Embedder, HashingEmbedder};
        use std::sync::atomic::{AtomicUsize, Ordering};

        pub struct CountingEmbedder {
            pub inner: HashingEmbedder,
            pub calls: AtomicUsize,
        }

        #[async_trait::async_trait]
        impl Embedder for CountingEmbedder {
            async fn embed(&self, text: &str) -> Result<Vec<f32>, CapabilityError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                self.inner.embed(text).await
            }
        }

        impl CountingEmbedder {
            pub fn calls(&self) -> usize {
                self.calls.load(Ordering::SeqCst)
            }
        }
    }

    fn chunk(doc: &str, ordinal: usize, text: &str, entities: &[&str]) -> Chunk {
        Chunk::new(
            doc.to_string(),
            ordinal,
            text.to_string(),
            format!("mem://{doc}"),
            (0, text.len()),
            entities.iter().map(|e| e.to_string()).collect(),
        )
    }

    fn index_with(embedder: Arc<dyn Embedder>, chunks: &[Chunk]) -> RetrievalIndex {
        let mut index = RetrievalIndex::new(embedder, RetryPolicy::new(0, 1, 1));
        index.add_chunks(chunks);
        index
    }

    #[tokio::test]
    async fn test_unchanged_chunks_are_embedded_once() {
        let embedder = Arc::new(CountingEmbedder {
            inner: llm::HashingEmbedder::new(64),
            calls: Default::default(),
        });
        let chunks = vec![chunk("d1", 0, "alpha beta", &[]), chunk("d2", 0, "gamma", &[])];
        let index = index_with(embedder.clone(), &chunks);

        let first = index.embed(&chunks).await.unwrap();
        let second = index.embed(&chunks).await.unwrap();
        assert_eq!(first, EmbedStats { computed: 2, cached: 0 });
        assert_eq!(second, EmbedStats { computed: 0, cached: 2 });
        assert_eq!(embedder.calls(), 2);
        assert_eq!(index.cache_stats().chunk_embeddings, 2);
    }

    #[tokio::test]
    async fn test_nearest_ranks_by_similarity() {
        let chunks = vec![
            chunk("d1", 0, "rivers and lakes of norway", &[]),
            chunk("d2", 0, "the capital of france is paris", &[]),
            chunk("d3", 0, "volcanoes of iceland", &[]),
        ];
        let index = index_with(Arc::new(llm::HashingEmbedder::new(256)), &chunks);
        index.embed(&chunks).await.unwrap();

        let ranked = index.nearest("capital of france", 2).await.unwrap();
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].chunk.doc_id, "d2");
        assert!(ranked[0].score >= ranked[1].score);

        index.nearest("capital of france", 1).await.unwrap();
        assert_eq!(
            index.cache_stats(),
            CacheStats {
                chunk_embeddings: 3,
                text_embeddings: 1
            }
        );
    }

    #[test]
    fn test_entity_neighbors_exclude_own_and_listed_documents() {
        let chunks = vec![
            chunk("d1", 0, "a", &["marie curie", "warsaw"]),
            chunk("d1", 1, "b", &["warsaw"]),
            chunk("d2", 0, "c", &["warsaw", "poland"]),
            chunk("d3", 0, "d", &["marie curie"]),
            chunk("d4", 0, "e", &["paris"]),
        ];
        let index = index_with(Arc::new(llm::HashingEmbedder::new(8)), &chunks);

        let neighbors = index.entity_neighbors(&chunks[0], &HashSet::new());
        let mut docs: Vec<&str> = neighbors.iter().map(|c| c.doc_id.as_str()).collect();
        docs.sort();
        assert_eq!(docs, vec!["d2", "d3"]);

        let ids: Vec<&str> = neighbors.iter().map(|c| c.chunk_id.as_str()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);

        let exclude: HashSet<String> = ["d2".to_string()].into();
        let neighbors = index.entity_neighbors(&chunks[0], &exclude);
        assert_eq!(neighbors.len(), 1);
        assert_eq!(neighbors[0].doc_id, "d3");
    }

    #[test]
    fn test_shared_entities() {
        let a = chunk("d1", 0, "a", &["b", "c"]);
        let b = chunk("d2", 0, "b", &["c", "d"]);
        assert_eq!(shared_entities(&a, &b).into_iter().collect::<Vec<_>>(), vec!["c"]);
    }
}
