use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub text: String,
    pub source_uri: String,
}

impl Document {
    pub fn new(id: impl Into<String>, text: impl Into<String>, source_uri: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            source_uri: source_uri.into(),
        }
    }

    /// Document whose id is derived from its path, so the same file always gets the same id.
    pub fn from_path(path: &str, text: String) -> Self {
        Self::new(crate::generate_doc_id(path), text, path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub doc_id: String,
    pub ordinal: usize,
    pub text: String,
    pub source: String,
    pub offset: (usize, usize), // [start, end) byte positions in the document
    pub entities: BTreeSet<String>,
}

impl Chunk {
    pub fn new(
        doc_id: String,
        ordinal: usize,
        text: String,
        source: String,
        offset: (usize, usize),
        entities: BTreeSet<String>,
    ) -> Self {
        let chunk_id = Self::generate_chunk_id(&doc_id, ordinal);

        Self {
            chunk_id,
            doc_id,
            ordinal,
            text,
            source,
            offset,
            entities,
        }
    }

    /// Stable id from (document id, ordinal): re-ingesting a corpus reproduces it.
    pub fn generate_chunk_id(doc_id: &str, ordinal: usize) -> String {
        let mut hasher = Sha256::new();
        hasher.update(doc_id.as_bytes());
        hasher.update(b":");
        hasher.update(ordinal.to_string().as_bytes());
        let result = hasher.finalize();
        hex::encode(&result[..16]) // Use first 16 bytes (32 hex chars)
    }

    /// Hash of the chunk text. Embeddings are recomputed only when this changes.
    pub fn content_hash(&self) -> String {
        content_hash(&self.text)
    }
}

pub fn content_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

pub fn tokens_for_words(word_count: usize) -> usize {
    (word_count as f64 * 1.3) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_id_depends_on_doc_and_ordinal_only() {
        let a = Chunk::new("doc".into(), 0, "one".into(), "s".into(), (0, 3), BTreeSet::new());
        let b = Chunk::new("doc".into(), 0, "two".into(), "s".into(), (5, 8), BTreeSet::new());
        let c = Chunk::new("doc".into(), 1, "one".into(), "s".into(), (0, 3), BTreeSet::new());
        assert_eq!(a.chunk_id, b.chunk_id);
        assert_ne!(a.chunk_id, c.chunk_id);
        assert_eq!(a.chunk_id.len(), 32);
        assert_ne!(a.content_hash(), b.content_hash());
    }
}
