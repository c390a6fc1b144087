use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// A required field is missing or out of range. Raised at construction time.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The caller handed the model something it cannot score.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("non-finite {what}: {value}")]
    NonFinite { what: &'static str, value: f64 },

    #[error("torch error: {0}")]
    Tch(#[from] tch::TchError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    #[error("sampling error: {0}")]
    Sampling(#[from] rand::distributions::WeightedError),
}

pub type Result<T> = std::result::Result<T, Error>;
