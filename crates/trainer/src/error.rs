use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid data: {0}")]
    Data(String),

    #[error("the validation set has no windows; early stopping needs one")]
    EmptyValidation,

    #[error("training diverged at iteration {iteration}: {what} is {value}")]
    Diverged {
        iteration: usize,
        what: &'static str,
        value: f64,
    },

    #[error("device unavailable: {0}")]
    Device(String),

    #[error("no sweep run finished ({failed} failed)")]
    NoSuccessfulRun { failed: usize },

    #[error(transparent)]
    Model(#[from] tinylm_core::Error),

    #[error("vocabulary error: {0}")]
    Tokenizer(#[from] tokenizer::TokenizerError),

    #[error("loader pool error: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, TrainError>;
