use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

use crate::chunk::{content_hash, Chunk, Document};
use crate::chunker::{Chunker, ChunkerConfig};
use crate::IngestError;
use extract::{KeywordConfig, KeywordExtractor};

/// Documents and their chunks, in ingestion order.
pub struct CorpusStore {
    chunker: Chunker,
    extractor: KeywordExtractor,
    documents: Vec<Document>,
    chunks: Vec<Chunk>,
    hashes: HashMap<String, String>,
}

impl CorpusStore {
    pub fn new(chunker_config: ChunkerConfig, keyword_config: KeywordConfig) -> Self {
        Self {
            chunker: Chunker::new(chunker_config),
            extractor: KeywordExtractor::new(keyword_config),
            documents: Vec::new(),
            chunks: Vec::new(),
            hashes: HashMap::new(),
        }
    }

    /// Splits documents into chunks and appends them to the store.
    ///
    /// The whole batch is checked before anything is stored, so a failing
    /// document leaves the store untouched. A document already present with
    /// identical text is skipped; the returned chunks are the newly added ones.
    pub fn ingest(&mut self, documents: Vec<Document>) -> Result<Vec<Chunk>, IngestError> {
        let mut pending: Vec<(Document, String, Vec<Chunk>)> = Vec::new();
        let mut batch_ids: HashSet<String> = HashSet::new();

        for doc in documents {
            if doc.text.trim().is_empty() {
                return Err(IngestError::EmptyDocument { doc_id: doc.id });
            }

            let hash = content_hash(&doc.text);
            match self.hashes.get(&doc.id) {
                Some(existing) if *existing == hash => {
                    debug!(doc_id = %doc.id, "Document already ingested, skipping");
                    continue;
                }
                Some(_) => return Err(IngestError::DuplicateDocument { doc_id: doc.id }),
                None => {}
            }
            if !batch_ids.insert(doc.id.clone()) {
                return Err(IngestError::DuplicateDocument { doc_id: doc.id });
            }

            let chunks = self
                .chunker
                .chunk_text(&doc.id, &doc.text, &doc.source_uri, &self.extractor);
            if chunks.is_empty() {
                return Err(IngestError::NoChunks { doc_id: doc.id });
            }
            pending.push((doc, hash, chunks));
        }

        let mut added = Vec::new();
        for (doc, hash, chunks) in pending {
            debug!(doc_id = %doc.id, chunks = chunks.len(), "Document chunked");
            self.hashes.insert(doc.id.clone(), hash);
            self.documents.push(doc);
            self.chunks.extend(chunks.iter().cloned());
            added.extend(chunks);
        }

        info!(
            new_chunks = added.len(),
            total_chunks = self.chunks.len(),
            documents = self.documents.len(),
            "Ingestion complete"
        );
        Ok(added)
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn documents(&self) -> &[Document] {
        &self.documents
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

impl Default for CorpusStore {
    fn default() -> Self {
        Self::new(ChunkerConfig::default(), KeywordConfig::default())
    }
}
