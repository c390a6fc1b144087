use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tinylm_core::{ModelConfig, ModelType, SamplingParams};

use crate::error::{Result, TrainError};
use crate::TrainerConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Seeds parameter initialisation, dropout, batch sampling and samples.
    pub seed: u64,
    /// Receives checkpoints, per-run configurations and the vocabulary.
    pub work_dir: PathBuf,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            seed: 3407,
            work_dir: PathBuf::from("./out/chargpt"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub path: PathBuf,
    /// If you make this bigger, make sure to give sufficient initial context
    /// to the sample prompt.
    pub block_size: usize,
    /// Leading fraction of the corpus used for training.
    pub train_ratio: f64,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/input.txt"),
            block_size: 10,
            train_ratio: 0.7,
        }
    }
}

/// Console and checkpoint cadence of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// Iterations between progress lines; 0 disables them.
    pub log_interval: usize,
    /// Iterations between samples and checkpoint writes; 0 disables both.
    pub sample_interval: usize,
    pub sample_prompt: String,
    pub sample_tokens: usize,
    pub sampling: SamplingParams,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            log_interval: 500,
            sample_interval: 5000,
            sample_prompt: "O God, O God!".to_string(),
            sample_tokens: 500,
            sampling: SamplingParams {
                temperature: 1.0,
                top_k: Some(10),
                do_sample: true,
            },
        }
    }
}

/// Everything one training run needs besides the data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub system: SystemConfig,
    pub model: ModelConfig,
    pub trainer: TrainerConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self::feedforward()
    }
}

impl RunConfig {
    pub fn feedforward() -> Self {
        Self {
            system: SystemConfig::default(),
            model: ModelConfig::feedforward(),
            trainer: TrainerConfig::default(),
        }
    }

    pub fn gpt() -> Self {
        Self {
            system: SystemConfig::default(),
            model: ModelConfig::gpt(),
            trainer: TrainerConfig {
                validation_interval: 1000,
                ..TrainerConfig::default()
            },
        }
    }

    pub fn profile(model_type: ModelType) -> Self {
        match model_type {
            ModelType::Feedforward => Self::feedforward(),
            ModelType::Gpt => Self::gpt(),
        }
    }

    /// This configuration with the sweep's choices written in.
    pub fn with_hyperparameters(&self, hyperparameters: &Hyperparameters) -> Self {
        let mut config = self.clone();
        config.trainer.learning_rate = hyperparameters.learning_rate;
        config.model.hidden_dim = hyperparameters.hidden_dim;
        config.model.n_embd = hyperparameters.n_embd;
        config
    }
}

/// One point of the sweep grid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    pub learning_rate: f64,
    pub hidden_dim: i64,
    pub n_embd: i64,
}

impl fmt::Display for Hyperparameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Learning Rate: {} Hidden Dim: {} Embed Dim: {}",
            self.learning_rate, self.hidden_dim, self.n_embd
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepGrid {
    pub learning_rates: Vec<f64>,
    pub hidden_dims: Vec<i64>,
    pub n_embds: Vec<i64>,
}

impl Default for SweepGrid {
    fn default() -> Self {
        Self {
            learning_rates: vec![2e-4, 3e-4],
            hidden_dims: vec![200, 300, 400],
            n_embds: vec![48, 96],
        }
    }
}

impl SweepGrid {
    /// Cartesian product, learning rate outermost and embedding width innermost.
    pub fn combinations(&self) -> Vec<Hyperparameters> {
        let mut out = Vec::with_capacity(self.len());
        for &learning_rate in &self.learning_rates {
            for &hidden_dim in &self.hidden_dims {
                for &n_embd in &self.n_embds {
                    out.push(Hyperparameters {
                        learning_rate,
                        hidden_dim,
                        n_embd,
                    });
                }
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.learning_rates.len() * self.hidden_dims.len() * self.n_embds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Top-level configuration of a `tinylm-train` invocation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub data: DataConfig,
    pub run: RunConfig,
    pub grid: SweepGrid,
    pub report: ReportConfig,
}

impl ExperimentConfig {
    pub fn profile(model_type: ModelType) -> Self {
        Self {
            run: RunConfig::profile(model_type),
            ..Self::default()
        }
    }

    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.data.block_size == 0 {
            return Err(TrainError::Config("block_size must be positive".to_string()));
        }
        if !(self.data.train_ratio > 0.0 && self.data.train_ratio < 1.0) {
            return Err(TrainError::Config(format!(
                "train_ratio must be in (0, 1), got {}",
                self.data.train_ratio
            )));
        }
        if self.grid.is_empty() {
            return Err(TrainError::Config("the sweep grid has no combinations".to_string()));
        }
        self.run.trainer.validate()?;
        self.report.sampling.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_enumerates_in_nesting_order() {
        let grid = SweepGrid::default();
        let combos = grid.combinations();
        assert_eq!(combos.len(), 12);
        assert_eq!(
            combos[0],
            Hyperparameters {
                learning_rate: 2e-4,
                hidden_dim: 200,
                n_embd: 48
            }
        );
        assert_eq!(combos[1].n_embd, 96);
        assert_eq!(combos[2].hidden_dim, 300);
        assert_eq!(combos[6].learning_rate, 3e-4);
    }

    #[test]
    fn hyperparameters_override_the_profile() {
        let hp = Hyperparameters {
            learning_rate: 3e-4,
            hidden_dim: 400,
            n_embd: 96,
        };
        let base = RunConfig::gpt();
        let config = base.with_hyperparameters(&hp);
        assert_eq!(config.trainer.learning_rate, 3e-4);
        assert_eq!(config.model.hidden_dim, 400);
        assert_eq!(config.model.n_embd, 96);
        assert_eq!(config.model.model_type, ModelType::Gpt);
        assert_eq!(base.trainer.learning_rate, 5e-4);
    }

    #[test]
    fn profiles_differ_in_validation_interval() {
        assert_eq!(RunConfig::feedforward().trainer.validation_interval, 2000);
        assert_eq!(RunConfig::gpt().trainer.validation_interval, 1000);
    }

    #[test]
    fn yaml_overrides_are_partial() {
        let yaml = "\
run:
  model:
    model_type: gpt
  trainer:
    max_iters: 20
grid:
  learning_rates: [0.001]
";
        let config: ExperimentConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.run.model.model_type, ModelType::Gpt);
        assert_eq!(config.run.trainer.max_iters, 20);
        assert_eq!(config.grid.learning_rates, vec![0.001]);
        assert_eq!(config.grid.n_embds, vec![48, 96]);
        assert_eq!(config.data.block_size, 10);
        config.validate().unwrap();
    }

    #[test]
    fn unknown_model_type_is_a_config_error() {
        let yaml = "run:\n  model:\n    model_type: lstm\n";
        assert!(serde_yaml::from_str::<ExperimentConfig>(yaml).is_err());
    }
}
