use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Which network a run trains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelType {
    Feedforward,
    Gpt,
}

impl std::fmt::Display for ModelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelType::Feedforward => write!(f, "feedforward"),
            ModelType::Gpt => write!(f, "gpt"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub model_type: ModelType,
    /// Dimension of the token embeddings (and internal transformer states).
    pub n_embd: i64,
    /// Width of the hidden layer: the MLP expansion in GPT blocks, the single
    /// dense layer of the feedforward network.
    pub hidden_dim: i64,
    /// Number of transformer blocks. Ignored by the feedforward network.
    pub n_layer: i64,
    /// Number of attention heads. Ignored by the feedforward network.
    pub n_head: i64,
    /// Size of the vocabulary. Injected from the dataset.
    pub vocab_size: i64,
    /// Context length. Injected from the dataset.
    pub block_size: i64,
    pub embd_pdrop: f64,
    pub resid_pdrop: f64,
    pub attn_pdrop: f64,
    pub layer_norm_epsilon: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self::feedforward()
    }
}

impl ModelConfig {
    pub fn feedforward() -> Self {
        Self {
            model_type: ModelType::Feedforward,
            n_embd: 48,
            hidden_dim: 200,
            n_layer: 3,
            n_head: 3,
            vocab_size: 0,
            block_size: 0,
            embd_pdrop: 0.1,
            resid_pdrop: 0.1,
            attn_pdrop: 0.1,
            layer_norm_epsilon: 1e-5,
        }
    }

    /// The "nano" GPT shape: 3 layers, 3 heads, 48 wide.
    pub fn gpt() -> Self {
        Self {
            model_type: ModelType::Gpt,
            ..Self::feedforward()
        }
    }

    pub fn with_data(mut self, vocab_size: usize, block_size: usize) -> Self {
        self.vocab_size = vocab_size as i64;
        self.block_size = block_size as i64;
        self
    }

    pub fn head_size(&self) -> i64 {
        self.n_embd / self.n_head
    }

    pub fn validate(&self) -> Result<()> {
        fn positive(name: &str, value: i64) -> Result<()> {
            if value <= 0 {
                return Err(Error::Config(format!("{name} must be positive, got {value}")));
            }
            Ok(())
        }
        fn probability(name: &str, value: f64) -> Result<()> {
            if !(0.0..1.0).contains(&value) {
                return Err(Error::Config(format!("{name} must be in [0, 1), got {value}")));
            }
            Ok(())
        }

        positive("vocab_size", self.vocab_size)?;
        positive("block_size", self.block_size)?;
        positive("n_embd", self.n_embd)?;
        positive("hidden_dim", self.hidden_dim)?;
        probability("embd_pdrop", self.embd_pdrop)?;
        probability("resid_pdrop", self.resid_pdrop)?;

        if self.model_type == ModelType::Gpt {
            positive("n_layer", self.n_layer)?;
            positive("n_head", self.n_head)?;
            probability("attn_pdrop", self.attn_pdrop)?;
            if self.n_embd % self.n_head != 0 {
                return Err(Error::Config(format!(
                    "n_embd ({}) must be divisible by n_head ({})",
                    self.n_embd, self.n_head
                )));
            }
            if self.layer_norm_epsilon <= 0.0 {
                return Err(Error::Config("layer_norm_epsilon must be positive".to_string()));
            }
        }
        Ok(())
    }
}
