pub mod error;
pub mod vocab;

pub use error::TokenizerError;
pub use vocab::CharVocab;
