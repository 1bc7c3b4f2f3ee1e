pub mod chunk;
pub mod chunker;
pub mod error;
pub mod reader;
pub mod store;

pub use chunk::{Chunk, Document};
pub use chunker::{Chunker, ChunkerConfig};
pub use error::IngestError;
pub use reader::FileReader;
pub use store::CorpusStore;

use sha2::{Digest, Sha256};

/// Generate a stable document ID from file path
pub fn generate_doc_id(path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..16])
}
