pub mod attention;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod feedforward;
pub mod layer_norm;
pub mod model;
pub mod optim;
pub mod params;
pub mod sampling;
pub mod transformer;

pub use config::{ModelConfig, ModelType};
pub use error::{Error, Result};
pub use feedforward::Feedforward;
pub use model::{build_model, LanguageModel, Scores};
pub use optim::{build_optimizer, clip_grad_norm, OptimizerConfig};
pub use params::ParamGroups;
pub use sampling::{Sampler, SamplingParams};
pub use transformer::Gpt;
