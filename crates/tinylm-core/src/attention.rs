use tch::{Device, Kind, Tensor};

use crate::config::ModelConfig;
use crate::error::Result;
use crate::params::{linear, ParamGroups, ParamScope, INIT_STD};

pub struct CausalSelfAttention {
    c_attn: tch::nn::Linear,
    c_proj: tch::nn::Linear,
    n_head: i64,
    attn_pdrop: f64,
    resid_pdrop: f64,
    /// Lower-triangular [1, 1, block_size, block_size] mask. Not a parameter.
    bias: Tensor,
}

impl CausalSelfAttention {
    pub fn new(
        scope: &ParamScope,
        groups: &mut ParamGroups,
        config: &ModelConfig,
        device: Device,
    ) -> Self {
        let n_embd = config.n_embd;
        let proj_std = INIT_STD / (2.0 * config.n_layer as f64).sqrt();

        let c_attn = linear(&scope.sub("c_attn"), groups, n_embd, 3 * n_embd, true, INIT_STD);
        let c_proj = linear(&scope.sub("c_proj"), groups, n_embd, n_embd, true, proj_std);

        let bs = config.block_size;
        let mask = Tensor::ones([bs, bs], (Kind::Float, device))
            .tril(0)
            .reshape([1, 1, bs, bs]);

        Self {
            c_attn,
            c_proj,
            n_head: config.n_head,
            attn_pdrop: config.attn_pdrop,
            resid_pdrop: config.resid_pdrop,
            bias: mask,
        }
    }

    /// x: [batch, seq_len, n_embd] with seq_len <= block_size.
    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let (b, t, c) = x.size3()?;
        let head_size = c / self.n_head;

        let qkv = x.apply(&self.c_attn);
        let chunks = qkv.split(c, 2);
        let (q, k, v) = (&chunks[0], &chunks[1], &chunks[2]);

        let q = q.view([b, t, self.n_head, head_size]).transpose(1, 2);
        let k = k.view([b, t, self.n_head, head_size]).transpose(1, 2);
        let v = v.view([b, t, self.n_head, head_size]).transpose(1, 2);

        // [b, nh, t, t]
        let att = q.matmul(&k.transpose(-2, -1)) * (1.0 / (head_size as f64).sqrt());
        let mask = self.bias.narrow(2, 0, t).narrow(3, 0, t);
        let att = att
            .masked_fill(&mask.eq(0.0), f64::NEG_INFINITY)
            .softmax(-1, Kind::Float)
            .dropout(self.attn_pdrop, train);

        let y = att.matmul(&v).transpose(1, 2).contiguous().view([b, t, c]);
        Ok(y.apply(&self.c_proj).dropout(self.resid_pdrop, train))
    }
}
