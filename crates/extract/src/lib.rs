pub mod keywords;
pub mod normalizer;
pub mod tokens;

pub use keywords::{KeywordConfig, KeywordExtractor};
pub use normalizer::EntityNormalizer;
pub use tokens::content_tokens;
