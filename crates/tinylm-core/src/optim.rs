use serde::{Deserialize, Serialize};
use tch::nn::{self, OptimizerConfig as _};
use tch::{Kind, Tensor};

use crate::error::{Error, Result};
use crate::model::LanguageModel;
use crate::params::{DECAY_GROUP, NO_DECAY_GROUP};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    pub learning_rate: f64,
    pub betas: (f64, f64),
    /// Applied to the decay group only.
    pub weight_decay: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 5e-4,
            betas: (0.9, 0.95),
            weight_decay: 0.1,
        }
    }
}

/// AdamW over the model's parameters, weight decay restricted to the decay
/// group. Fails if the model's groups do not partition its variable store.
pub fn build_optimizer(
    model: &dyn LanguageModel,
    config: &OptimizerConfig,
) -> Result<nn::Optimizer> {
    let vs = model.var_store();
    model.param_groups().check_partition(vs)?;

    let adamw = nn::AdamW {
        beta1: config.betas.0,
        beta2: config.betas.1,
        wd: config.weight_decay,
        ..Default::default()
    };
    let mut optimizer = adamw.build(vs, config.learning_rate)?;
    optimizer.set_weight_decay_group(DECAY_GROUP, config.weight_decay);
    optimizer.set_weight_decay_group(NO_DECAY_GROUP, 0.0);
    Ok(optimizer)
}

/// Rescales all gradients of `vs` so their global L2 norm is at most
/// `max_norm`. Returns the norm before clipping.
pub fn clip_grad_norm(vs: &nn::VarStore, max_norm: f64) -> Result<f64> {
    let _guard = tch::no_grad_guard();
    let grads: Vec<_> = vs
        .trainable_variables()
        .iter()
        .map(|var| var.grad())
        .filter(|grad| grad.defined())
        .collect();

    if grads.is_empty() {
        return Ok(0.0);
    }

    // One host read for the whole store.
    let squares: Vec<Tensor> = grads
        .iter()
        .map(|grad| grad.pow_tensor_scalar(2.0).sum(Kind::Double))
        .collect();
    let norm = Tensor::f_stack(&squares, 0)?.sum(Kind::Double).double_value(&[]).sqrt();
    if !norm.is_finite() {
        return Err(Error::NonFinite { what: "gradient norm", value: norm });
    }

    if norm > max_norm {
        let scale = max_norm / (norm + 1e-6);
        for mut grad in grads {
            let _ = grad.g_mul_scalar_(scale);
        }
    }
    Ok(norm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::model::build_model;
    use tch::Device;

    #[test]
    fn clipping_bounds_the_global_norm() {
        let vs = nn::VarStore::new(Device::Cpu);
        let w = vs.root().var("w", &[3], nn::Init::Const(1.0));
        let loss = (&w * Tensor::from_slice(&[30.0f32, 40.0, 0.0])).sum(Kind::Float);
        loss.backward();

        let before = clip_grad_norm(&vs, 1.0).unwrap();
        assert!((before - 50.0).abs() < 1e-4);

        let after = clip_grad_norm(&vs, 1.0).unwrap();
        assert!((after - 1.0).abs() < 1e-4, "norm after clipping: {after}");
    }

    #[test]
    fn small_gradients_are_untouched() {
        let vs = nn::VarStore::new(Device::Cpu);
        let w = vs.root().var("w", &[2], nn::Init::Const(1.0));
        let loss = (&w * Tensor::from_slice(&[0.3f32, 0.4])).sum(Kind::Float);
        loss.backward();

        clip_grad_norm(&vs, 1.0).unwrap();
        let norm = clip_grad_norm(&vs, 1.0).unwrap();
        assert!((norm - 0.5).abs() < 1e-6);
    }

    #[test]
    fn norm_spans_every_variable() {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let a = root.var("a", &[1], nn::Init::Const(1.0));
        let b = root.var("b", &[1], nn::Init::Const(1.0));
        let loss = (&a * 3.0 + &b * 4.0).sum(Kind::Float);
        loss.backward();

        let norm = clip_grad_norm(&vs, 10.0).unwrap();
        assert!((norm - 5.0).abs() < 1e-6, "{norm}");
    }

    #[test]
    fn store_without_gradients_has_zero_norm() {
        let vs = nn::VarStore::new(Device::Cpu);
        let _w = vs.root().var("w", &[2], nn::Init::Const(1.0));
        assert_eq!(clip_grad_norm(&vs, 1.0).unwrap(), 0.0);
    }

    #[test]
    fn non_finite_gradients_are_fatal() {
        let vs = nn::VarStore::new(Device::Cpu);
        let w = vs.root().var("w", &[1], nn::Init::Const(0.0));
        let loss = w.sqrt().sum(Kind::Float);
        loss.backward();

        assert!(matches!(
            clip_grad_norm(&vs, 1.0),
            Err(Error::NonFinite { .. })
        ));
    }

    #[test]
    fn optimizer_builds_for_both_variants() {
        for config in [
            ModelConfig::feedforward().with_data(20, 4),
            ModelConfig::gpt().with_data(20, 4),
        ] {
            let model = build_model(&config, Device::Cpu).unwrap();
            assert!(build_optimizer(model.as_ref(), &OptimizerConfig::default()).is_ok());
        }
    }
}
