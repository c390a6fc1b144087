use log::info;
use tch::{nn, Device, Tensor};

use crate::config::{ModelConfig, ModelType};
use crate::error::{Error, Result};
use crate::model::LanguageModel;
use crate::params::{linear, Embedding, ParamGroups, ParamScope, INIT_STD};

/// Fixed-window baseline: the embeddings of the whole window are concatenated
/// and passed through one tanh layer to score the next character.
pub struct Feedforward {
    vs: nn::VarStore,
    groups: ParamGroups,
    config: ModelConfig,
    wte: Embedding,
    fc1: nn::Linear,
    fc2: nn::Linear,
}

impl Feedforward {
    pub fn new(config: &ModelConfig, device: Device) -> Result<Self> {
        config.validate()?;
        if config.model_type != ModelType::Feedforward {
            return Err(Error::Config(format!(
                "cannot build a feedforward network from a {} configuration",
                config.model_type
            )));
        }

        let vs = nn::VarStore::new(device);
        let mut groups = ParamGroups::default();
        let root = ParamScope::new(vs.root());

        let wte = Embedding::new(&root.sub("wte"), &mut groups, config.vocab_size, config.n_embd);
        let fc1 = linear(
            &root.sub("fc1"),
            &mut groups,
            config.block_size * config.n_embd,
            config.hidden_dim,
            true,
            INIT_STD,
        );
        let fc2 = linear(
            &root.sub("fc2"),
            &mut groups,
            config.hidden_dim,
            config.vocab_size,
            true,
            INIT_STD,
        );
        drop(root);

        let model = Self {
            vs,
            groups,
            config: config.clone(),
            wte,
            fc1,
            fc2,
        };
        info!("number of parameters: {:.2}M", model.num_parameters() as f64 / 1e6);
        Ok(model)
    }
}

impl LanguageModel for Feedforward {
    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    fn param_groups(&self) -> &ParamGroups {
        &self.groups
    }

    /// Returns [batch, 1, vocab_size]: scores for the character after the window.
    /// Windows shorter than `block_size` are left-padded with zero embeddings.
    fn forward_t(&self, idx: &Tensor, train: bool) -> Result<Tensor> {
        let (b, t) = idx.size2()?;
        let block_size = self.config.block_size;
        if t == 0 || t > block_size {
            return Err(Error::InvalidInput(format!(
                "window of length {t} does not fit a context of {block_size}"
            )));
        }

        let mut emb = self.wte.forward(idx);
        if t < block_size {
            let pad = Tensor::zeros(
                [b, block_size - t, self.config.n_embd],
                (emb.kind(), emb.device()),
            );
            emb = Tensor::cat(&[pad, emb], 1);
        }

        let x = emb
            .reshape([b, block_size * self.config.n_embd])
            .dropout(self.config.embd_pdrop, train)
            .apply(&self.fc1)
            .tanh()
            .dropout(self.config.resid_pdrop, train)
            .apply(&self.fc2);

        Ok(x.unsqueeze(1))
    }

    /// Only the last target of each window is scored.
    fn align_targets(&self, targets: &Tensor) -> Result<Tensor> {
        let (_, t) = targets.size2()?;
        Ok(targets.narrow(1, t - 1, 1))
    }
}
