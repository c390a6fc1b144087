use rand::rngs::StdRng;
use tch::{nn, Device, IndexOp, Tensor};

use crate::config::{ModelConfig, ModelType};
use crate::error::{Error, Result};
use crate::feedforward::Feedforward;
use crate::params::ParamGroups;
use crate::sampling::{Sampler, SamplingParams};
use crate::transformer::Gpt;

/// Output of [`LanguageModel::score`].
pub struct Scores {
    /// [batch, positions, vocab_size]
    pub logits: Tensor,
    /// Mean cross-entropy over the scored positions, when targets were given.
    pub loss: Option<Tensor>,
}

/// What the trainer and the sweep need from a network.
pub trait LanguageModel {
    fn config(&self) -> &ModelConfig;

    /// The store owning every parameter of this model.
    fn var_store(&self) -> &nn::VarStore;

    /// Weight-decay partition of the parameters in [`Self::var_store`].
    fn param_groups(&self) -> &ParamGroups;

    /// idx: [batch, seq_len] token indices.
    /// Returns logits [batch, positions, vocab_size].
    fn forward_t(&self, idx: &Tensor, train: bool) -> Result<Tensor>;

    /// Selects the targets matching the positions `forward_t` scores.
    fn align_targets(&self, targets: &Tensor) -> Result<Tensor>;

    fn score(&self, idx: &Tensor, targets: Option<&Tensor>, train: bool) -> Result<Scores> {
        let logits = self.forward_t(idx, train)?;
        let loss = match targets {
            Some(targets) => {
                let (b, t, v) = logits.size3()?;
                let targets = self.align_targets(targets)?;
                if targets.size() != [b, t] {
                    return Err(Error::InvalidInput(format!(
                        "targets of shape {:?} do not match scores of shape {:?}",
                        targets.size(),
                        logits.size()
                    )));
                }
                let loss = logits
                    .reshape([b * t, v])
                    .cross_entropy_for_logits(&targets.reshape([b * t]));
                Some(loss)
            }
            None => None,
        };
        Ok(Scores { logits, loss })
    }

    /// Extends `seed` by `max_new_tokens` tokens, one at a time, feeding at
    /// most `block_size` trailing tokens back into the model.
    fn generate(
        &self,
        seed: &[i64],
        max_new_tokens: usize,
        params: &SamplingParams,
        rng: &mut StdRng,
    ) -> Result<Vec<i64>> {
        let config = self.config();
        if seed.is_empty() {
            return Err(Error::InvalidInput("generation needs a non-empty seed".to_string()));
        }
        if let Some(&bad) = seed.iter().find(|&&id| id < 0 || id >= config.vocab_size) {
            return Err(Error::InvalidInput(format!(
                "seed token {bad} is outside the vocabulary of {}",
                config.vocab_size
            )));
        }
        params.validate()?;

        let _guard = tch::no_grad_guard();
        let device = self.var_store().device();
        let block_size = config.block_size as usize;
        let mut tokens = seed.to_vec();
        tokens.reserve(max_new_tokens);

        for _ in 0..max_new_tokens {
            let start = tokens.len().saturating_sub(block_size);
            let context = &tokens[start..];
            let input = Tensor::from_slice(context)
                .view([1, context.len() as i64])
                .to(device);

            let logits = self.forward_t(&input, false)?;
            let next_token_logits = logits.i((0, -1, ..));
            let next_token = Sampler::sample(&next_token_logits, params, rng)?;
            tokens.push(next_token);
        }

        Ok(tokens)
    }

    fn num_parameters(&self) -> usize {
        self.var_store()
            .trainable_variables()
            .iter()
            .map(|t| t.numel())
            .sum()
    }
}

/// Builds a freshly initialised network of the configured type on `device`.
pub fn build_model(config: &ModelConfig, device: Device) -> Result<Box<dyn LanguageModel>> {
    Ok(match config.model_type {
        ModelType::Feedforward => Box::new(Feedforward::new(config, device)?),
        ModelType::Gpt => Box::new(Gpt::new(config, device)?),
    })
}
