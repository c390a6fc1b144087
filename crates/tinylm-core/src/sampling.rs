use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tch::{Device, Kind, Tensor};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    /// Divides the scores before the softmax. Must be positive.
    pub temperature: f64,
    /// Keep only the k highest scores.
    pub top_k: Option<usize>,
    /// Draw from the distribution instead of taking its mode.
    pub do_sample: bool,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: None,
            do_sample: false,
        }
    }
}

impl SamplingParams {
    pub fn validate(&self) -> Result<()> {
        if !(self.temperature.is_finite() && self.temperature > 0.0) {
            return Err(Error::Config(format!(
                "temperature must be positive, got {}",
                self.temperature
            )));
        }
        if self.top_k == Some(0) {
            return Err(Error::Config("top_k must be at least 1".to_string()));
        }
        Ok(())
    }
}

pub struct Sampler;

impl Sampler {
    /// Picks a token id from `logits`, a [vocab_size] tensor.
    pub fn sample(logits: &Tensor, params: &SamplingParams, rng: &mut StdRng) -> Result<i64> {
        let _guard = tch::no_grad_guard();
        let scores = Vec::<f64>::try_from(&logits.to_device(Device::Cpu).to_kind(Kind::Double))?;
        Ok(Self::select(&scores, params, rng)? as i64)
    }

    /// Same as [`Sampler::sample`] over plain scores.
    pub fn select(scores: &[f64], params: &SamplingParams, rng: &mut StdRng) -> Result<usize> {
        params.validate()?;
        if let Some(&bad) = scores.iter().find(|s| s.is_nan()) {
            return Err(Error::NonFinite { what: "score", value: bad });
        }
        if scores.is_empty() {
            return Err(Error::InvalidInput("cannot sample from an empty vocabulary".to_string()));
        }

        // 1. Temperature scaling
        let scaled: Vec<f64> = scores.iter().map(|s| s / params.temperature).collect();

        // 2. Sort descending; the stable sort keeps the lowest index first on ties.
        let mut candidates: Vec<usize> = (0..scaled.len()).collect();
        candidates.sort_by(|&a, &b| scaled[b].total_cmp(&scaled[a]));

        // 3. Top-K cutoff
        if let Some(k) = params.top_k {
            candidates.truncate(k);
        }

        if !params.do_sample {
            return Ok(candidates[0]);
        }

        // 4. Softmax over the survivors
        let max = scaled[candidates[0]];
        let weights: Vec<f64> = candidates.iter().map(|&i| (scaled[i] - max).exp()).collect();

        // 5. Sample
        let dist = WeightedIndex::new(&weights)?;
        Ok(candidates[dist.sample(rng)])
    }
}
