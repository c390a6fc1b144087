use std::path::{Path, PathBuf};

use log::{info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tinylm_core::checkpoint::save_safetensors;
use tinylm_core::LanguageModel;
use tokenizer::CharVocab;

use crate::config::ReportConfig;
use crate::error::Result;
use crate::train::IterationReport;

pub fn checkpoint_path(work_dir: &Path, run_idx: usize) -> PathBuf {
    work_dir.join(format!("model_{run_idx}.safetensors"))
}

pub fn config_path(work_dir: &Path, run_idx: usize) -> PathBuf {
    work_dir.join(format!("config_{run_idx}.json"))
}

/// Per-iteration console output and periodic checkpoints of one sweep run.
pub struct Reporter<'a> {
    config: &'a ReportConfig,
    vocab: &'a CharVocab,
    checkpoint: PathBuf,
    rng: StdRng,
}

impl<'a> Reporter<'a> {
    pub fn new(
        config: &'a ReportConfig,
        vocab: &'a CharVocab,
        work_dir: &Path,
        run_idx: usize,
        seed: u64,
    ) -> Self {
        Self {
            config,
            vocab,
            checkpoint: checkpoint_path(work_dir, run_idx),
            rng: StdRng::seed_from_u64(seed.wrapping_add(run_idx as u64)),
        }
    }

    pub fn on_iteration(
        &mut self,
        report: &IterationReport,
        model: &dyn LanguageModel,
    ) -> Result<()> {
        let iteration = report.iteration;
        if self.config.log_interval > 0 && iteration % self.config.log_interval == 0 {
            info!(
                "iter_dt {:.2}ms; iter {}: train loss {:.5}",
                report.duration.as_secs_f64() * 1000.0,
                iteration,
                report.loss
            );
        }

        if self.config.sample_interval > 0 && iteration % self.config.sample_interval == 0 {
            if let Some(text) = self.sample(model)? {
                info!("sample at iter {iteration}:\n{text}");
            }
            self.save(model)?;
        }
        Ok(())
    }

    /// Writes the final checkpoint of the run.
    pub fn finish(&self, model: &dyn LanguageModel) -> Result<()> {
        self.save(model)
    }

    fn save(&self, model: &dyn LanguageModel) -> Result<()> {
        save_safetensors(model.var_store(), &self.checkpoint)?;
        info!("saved model to {}", self.checkpoint.display());
        Ok(())
    }

    /// `None` when the prompt is empty or not encodable.
    fn sample(&mut self, model: &dyn LanguageModel) -> Result<Option<String>> {
        let seed = match self.vocab.encode(&self.config.sample_prompt) {
            Ok(ids) => ids,
            Err(err) => {
                warn!("skipping sample: prompt is not encodable ({err})");
                return Ok(None);
            }
        };
        if seed.is_empty() {
            warn!("skipping sample: the prompt is empty");
            return Ok(None);
        }
        let ids = model.generate(
            &seed,
            self.config.sample_tokens,
            &self.config.sampling,
            &mut self.rng,
        )?;
        Ok(Some(self.vocab.decode(&ids)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tch::Device;
    use tinylm_core::{build_model, ModelConfig};

    #[test]
    fn sampling_writes_a_checkpoint() {
        let dir = std::env::temp_dir().join(format!("tinylm-report-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let vocab = CharVocab::from_text("abcdefgh");
        let mut config = ModelConfig::gpt().with_data(vocab.len(), 4);
        config.n_embd = 6;
        config.n_head = 2;
        config.n_layer = 1;
        let model = build_model(&config, Device::Cpu).unwrap();

        let report = ReportConfig {
            sample_interval: 2,
            sample_prompt: "zz".to_string(),
            sample_tokens: 5,
            ..ReportConfig::default()
        };
        let mut reporter = Reporter::new(&report, &vocab, &dir, 3, 0);
        let step = |iteration| IterationReport {
            iteration,
            loss: 1.0,
            duration: Duration::from_millis(1),
        };

        reporter.on_iteration(&step(1), model.as_ref()).unwrap();
        assert!(!checkpoint_path(&dir, 3).exists());
        // The prompt has unknown characters, so only the checkpoint is written.
        reporter.on_iteration(&step(2), model.as_ref()).unwrap();
        assert!(checkpoint_path(&dir, 3).exists());

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn feedforward_samples_from_a_short_prompt() {
        let vocab = CharVocab::from_text("abcdefgh");
        let mut config = ModelConfig::feedforward().with_data(vocab.len(), 4);
        config.n_embd = 4;
        config.hidden_dim = 8;
        let model = build_model(&config, Device::Cpu).unwrap();

        let report = ReportConfig {
            sample_prompt: "ab".to_string(),
            sample_tokens: 5,
            ..ReportConfig::default()
        };
        let dir = std::env::temp_dir();
        let mut reporter = Reporter::new(&report, &vocab, &dir, 0, 0);
        let text = reporter.sample(model.as_ref()).unwrap().unwrap();
        assert_eq!(text.chars().count(), 2 + 5);
        assert!(text.starts_with("ab"));
    }
}
