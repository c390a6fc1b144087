use thiserror::Error;

#[derive(Error, Debug)]
pub enum TokenizerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// A stored vocabulary is not a sorted list of distinct characters.
    #[error("Vocabulary mismatch: {0}")]
    VocabMismatch(String),

    #[error("Character not in vocabulary: {0:?}")]
    TokenNotFound(char),

    #[error("Token id {id} outside a vocabulary of {size}")]
    IdOutOfRange { id: i64, size: usize },
}

pub type Result<T> = std::result::Result<T, TokenizerError>;
