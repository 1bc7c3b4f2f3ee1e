use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("document {doc_id} is empty")]
    EmptyDocument { doc_id: String },
    #[error("document {doc_id} was already ingested with different content")]
    DuplicateDocument { doc_id: String },
    #[error("cannot read {path}: {reason}")]
    Unreadable { path: String, reason: String },
    #[error("document {doc_id} produced no chunks")]
    NoChunks { doc_id: String },
    #[error("corpus contains no documents")]
    EmptyCorpus,
}
