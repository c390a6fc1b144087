pub mod config;
pub mod dataset;
pub mod device;
pub mod error;
pub mod report;
pub mod sweep;
pub mod train;

pub use config::{
    DataConfig, ExperimentConfig, Hyperparameters, ReportConfig, RunConfig, SweepGrid, SystemConfig,
};
pub use dataset::{CharDataset, Corpus};
pub use device::DeviceSelector;
pub use error::{Result, TrainError};
pub use sweep::{BestRun, FailedRun, Sweep, SweepOutcome};
pub use train::{EarlyStopping, IterationReport, RunSummary, Termination, Trainer};

use serde::{Deserialize, Serialize};
use tinylm_core::OptimizerConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub device: DeviceSelector,
    /// Threads assembling training batches; 0 assembles on the training thread.
    pub num_workers: usize,
    pub max_iters: usize,
    pub batch_size: usize,
    /// Windows per forward pass while validating.
    pub eval_batch_size: usize,
    pub learning_rate: f64,
    pub betas: (f64, f64),
    /// Only applied on matmul weights.
    pub weight_decay: f64,
    pub grad_norm_clip: f64,
    /// Consecutive non-improving validations before stopping.
    pub patience: usize,
    pub validation_interval: usize,
    pub min_relative_improvement: f64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            device: DeviceSelector::Auto,
            num_workers: 4,
            max_iters: 50000,
            batch_size: 64,
            eval_batch_size: 512,
            learning_rate: 5e-4,
            betas: (0.9, 0.95),
            weight_decay: 0.1,
            grad_norm_clip: 1.0,
            patience: 5,
            validation_interval: 2000,
            min_relative_improvement: 0.05,
        }
    }
}

impl TrainerConfig {
    pub fn optimizer(&self) -> OptimizerConfig {
        OptimizerConfig {
            learning_rate: self.learning_rate,
            betas: self.betas,
            weight_decay: self.weight_decay,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("max_iters", self.max_iters),
            ("batch_size", self.batch_size),
            ("eval_batch_size", self.eval_batch_size),
            ("patience", self.patience),
            ("validation_interval", self.validation_interval),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(TrainError::Config(format!("{name} must be positive")));
            }
        }
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(TrainError::Config(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if !(self.grad_norm_clip > 0.0) {
            return Err(TrainError::Config(format!(
                "grad_norm_clip must be positive, got {}",
                self.grad_norm_clip
            )));
        }
        let (b1, b2) = self.betas;
        if !(0.0..1.0).contains(&b1) || !(0.0..1.0).contains(&b2) {
            return Err(TrainError::Config(format!("betas must be in [0, 1), got ({b1}, {b2})")));
        }
        if !(self.weight_decay >= 0.0) {
            return Err(TrainError::Config("weight_decay must be non-negative".to_string()));
        }
        if !(self.min_relative_improvement >= 0.0) {
            return Err(TrainError::Config(
                "min_relative_improvement must be non-negative".to_string(),
            ));
        }
        Ok(())
    }
}
