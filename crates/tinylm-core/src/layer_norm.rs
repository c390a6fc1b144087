use tch::{nn, Tensor};

use crate::config::ModelConfig;
use crate::params::{ParamGroups, ParamScope};

/// LayerNorm with learned scale and shift, both outside weight decay.
#[derive(Debug)]
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    normalized_shape: Vec<i64>,
    eps: f64,
}

impl LayerNorm {
    pub fn new(scope: &ParamScope, groups: &mut ParamGroups, config: &ModelConfig) -> Self {
        let weight = scope.undecayed(groups, "weight", &[config.n_embd], nn::Init::Const(1.0));
        let bias = scope.undecayed(groups, "bias", &[config.n_embd], nn::Init::Const(0.0));
        Self {
            weight,
            bias,
            normalized_shape: vec![config.n_embd],
            eps: config.layer_norm_epsilon,
        }
    }

    /// x: [batch, seq_len, n_embd]
    pub fn forward(&self, x: &Tensor) -> Tensor {
        x.layer_norm(
            self.normalized_shape.as_slice(),
            Some(&self.weight),
            Some(&self.bias),
            self.eps,
            true,
        )
    }
}
