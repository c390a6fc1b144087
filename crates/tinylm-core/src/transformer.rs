use log::info;
use tch::{nn, Device, Tensor};

use crate::attention::CausalSelfAttention;
use crate::config::{ModelConfig, ModelType};
use crate::error::{Error, Result};
use crate::layer_norm::LayerNorm;
use crate::model::LanguageModel;
use crate::params::{linear, Embedding, ParamGroups, ParamScope, INIT_STD};

/// FeedForward block (MLP)
pub struct Mlp {
    c_fc: nn::Linear,
    c_proj: nn::Linear,
    dropout: f64,
}

impl Mlp {
    pub fn new(scope: &ParamScope, groups: &mut ParamGroups, config: &ModelConfig) -> Self {
        let proj_std = INIT_STD / (2.0 * config.n_layer as f64).sqrt();
        let (n_embd, hidden) = (config.n_embd, config.hidden_dim);
        let c_fc = linear(&scope.sub("c_fc"), groups, n_embd, hidden, true, INIT_STD);
        let c_proj = linear(&scope.sub("c_proj"), groups, hidden, n_embd, true, proj_std);

        Self {
            c_fc,
            c_proj,
            dropout: config.resid_pdrop,
        }
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Tensor {
        x.apply(&self.c_fc)
            .gelu("tanh")
            .apply(&self.c_proj)
            .dropout(self.dropout, train)
    }
}

/// Transformer Block
pub struct Block {
    ln_1: LayerNorm,
    attn: CausalSelfAttention,
    ln_2: LayerNorm,
    mlp: Mlp,
}

impl Block {
    pub fn new(
        scope: &ParamScope,
        groups: &mut ParamGroups,
        config: &ModelConfig,
        device: Device,
    ) -> Self {
        Self {
            ln_1: LayerNorm::new(&scope.sub("ln_1"), groups, config),
            attn: CausalSelfAttention::new(&scope.sub("attn"), groups, config, device),
            ln_2: LayerNorm::new(&scope.sub("ln_2"), groups, config),
            mlp: Mlp::new(&scope.sub("mlp"), groups, config),
        }
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let x = x + self.attn.forward_t(&self.ln_1.forward(x), train)?;
        let mlp_out = self.mlp.forward_t(&self.ln_2.forward(&x), train);
        Ok(x + mlp_out)
    }
}

/// GPT-style causal transformer over characters.
pub struct Gpt {
    vs: nn::VarStore,
    groups: ParamGroups,
    config: ModelConfig,
    wte: Embedding,
    wpe: Embedding,
    blocks: Vec<Block>,
    ln_f: LayerNorm,
    lm_head: nn::Linear,
}

impl Gpt {
    pub fn new(config: &ModelConfig, device: Device) -> Result<Self> {
        config.validate()?;
        if config.model_type != ModelType::Gpt {
            return Err(Error::Config(format!(
                "cannot build a transformer from a {} configuration",
                config.model_type
            )));
        }

        let vs = nn::VarStore::new(device);
        let mut groups = ParamGroups::default();
        let root = ParamScope::new(vs.root());

        let wte = Embedding::new(&root.sub("wte"), &mut groups, config.vocab_size, config.n_embd);
        let wpe = Embedding::new(&root.sub("wpe"), &mut groups, config.block_size, config.n_embd);
        let blocks = (0..config.n_layer)
            .map(|i| Block::new(&root.sub("h").sub(i), &mut groups, config, device))
            .collect();
        let ln_f = LayerNorm::new(&root.sub("ln_f"), &mut groups, config);
        let lm_head = linear(
            &root.sub("lm_head"),
            &mut groups,
            config.n_embd,
            config.vocab_size,
            false,
            INIT_STD,
        );
        drop(root);

        let model = Self {
            vs,
            groups,
            config: config.clone(),
            wte,
            wpe,
            blocks,
            ln_f,
            lm_head,
        };
        info!("number of parameters: {:.2}M", model.num_parameters() as f64 / 1e6);
        Ok(model)
    }
}

impl LanguageModel for Gpt {
    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    fn param_groups(&self) -> &ParamGroups {
        &self.groups
    }

    fn forward_t(&self, idx: &Tensor, train: bool) -> Result<Tensor> {
        let (_, t) = idx.size2()?;
        if t == 0 || t > self.config.block_size {
            return Err(Error::InvalidInput(format!(
                "window of length {t} does not fit a context of {}",
                self.config.block_size
            )));
        }

        let pos = Tensor::arange(t, (tch::Kind::Int64, idx.device()));
        let tok_emb = self.wte.forward(idx);
        let pos_emb = self.wpe.forward(&pos);
        let mut x = (tok_emb + pos_emb).dropout(self.config.embd_pdrop, train);

        for block in &self.blocks {
            x = block.forward_t(&x, train)?;
        }

        Ok(self.ln_f.forward(&x).apply(&self.lm_head))
    }

    fn align_targets(&self, targets: &Tensor) -> Result<Tensor> {
        Ok(targets.shallow_clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Kind;

    fn tiny_config() -> ModelConfig {
        let mut config = ModelConfig::gpt().with_data(11, 8);
        config.n_layer = 2;
        config.n_head = 2;
        config.n_embd = 16;
        config.hidden_dim = 32;
        config
    }

    fn window(tokens: &[i64]) -> Tensor {
        Tensor::from_slice(tokens).view([1, tokens.len() as i64])
    }

    #[test]
    fn scores_every_position() {
        tch::manual_seed(0);
        let model = Gpt::new(&tiny_config(), Device::Cpu).unwrap();
        for len in [1i64, 5, 8] {
            let idx = Tensor::randint(11, [3, len], (Kind::Int64, Device::Cpu));
            let logits = model.forward_t(&idx, false).unwrap();
            assert_eq!(logits.size(), vec![3, len, 11]);

            let sums = logits
                .softmax(-1, Kind::Float)
                .sum_dim_intlist(Some(&[-1i64][..]), false, Kind::Float);
            let max_err = (sums - 1.0).abs().max().double_value(&[]);
            assert!(max_err < 1e-5);
        }
    }

    #[test]
    fn window_longer_than_context_is_rejected() {
        let model = Gpt::new(&tiny_config(), Device::Cpu).unwrap();
        let idx = Tensor::zeros([1, 9], (Kind::Int64, Device::Cpu));
        assert!(matches!(model.forward_t(&idx, false), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn earlier_positions_ignore_later_tokens() {
        tch::manual_seed(1);
        let model = Gpt::new(&tiny_config(), Device::Cpu).unwrap();
        let base = [3i64, 1, 4, 1, 5, 9, 2, 6];

        for j in 0..base.len() {
            let mut perturbed = base;
            perturbed[j] = (perturbed[j] + 5) % 11;

            let a = model.forward_t(&window(&base), false).unwrap();
            let b = model.forward_t(&window(&perturbed), false).unwrap();

            if j > 0 {
                let prefix = (a.narrow(1, 0, j as i64) - b.narrow(1, 0, j as i64))
                    .abs()
                    .max()
                    .double_value(&[]);
                assert!(prefix < 1e-6, "position {j} leaked into earlier scores: {prefix}");
            }
            let at_j = (a.narrow(1, j as i64, 1) - b.narrow(1, j as i64, 1))
                .abs()
                .max()
                .double_value(&[]);
            assert!(at_j > 0.0);
        }
    }

    #[test]
    fn every_parameter_lands_in_one_group() {
        let model = Gpt::new(&tiny_config(), Device::Cpu).unwrap();
        let groups = model.param_groups();
        groups.check_partition(model.var_store()).unwrap();

        assert!(groups.decayed().contains("h.0.attn.c_attn.weight"));
        assert!(groups.decayed().contains("lm_head.weight"));
        assert!(groups.undecayed().contains("h.1.mlp.c_fc.bias"));
        assert!(groups.undecayed().contains("h.0.ln_1.weight"));
        assert!(groups.undecayed().contains("wpe.weight"));
        assert!(!groups.decayed().iter().any(|name| name.ends_with("bias")));
        assert_eq!(
            groups.decayed().len() + groups.undecayed().len(),
            model.var_store().variables().len()
        );
    }

    #[test]
    fn eval_forward_is_deterministic() {
        let model = Gpt::new(&tiny_config(), Device::Cpu).unwrap();
        let idx = window(&[1, 2, 3, 4]);
        let a = model.forward_t(&idx, false).unwrap();
        let b = model.forward_t(&idx, false).unwrap();
        assert!(a.equal(&b));
    }
}
