use std::fs::{self, File};
use std::io::BufWriter;

use log::{error, info};
use tinylm_core::{build_model, LanguageModel};

use crate::config::{ExperimentConfig, Hyperparameters};
use crate::dataset::Corpus;
use crate::error::{Result, TrainError};
use crate::report::{self, Reporter};
use crate::train::{RunSummary, Trainer};

/// The run with the lowest validation loss.
pub struct BestRun {
    pub run_idx: usize,
    pub hyperparameters: Hyperparameters,
    pub val_loss: f64,
    pub val_perplexity: f64,
    pub model: Box<dyn LanguageModel>,
}

#[derive(Debug, Clone)]
pub struct FailedRun {
    pub run_idx: usize,
    pub hyperparameters: Hyperparameters,
    pub error: String,
}

pub struct SweepOutcome {
    pub best: BestRun,
    pub completed: usize,
    pub failures: Vec<FailedRun>,
}

/// Grid search: one independent, freshly seeded run per combination.
pub struct Sweep {
    config: ExperimentConfig,
    corpus: Corpus,
}

impl Sweep {
    pub fn new(config: ExperimentConfig, corpus: Corpus) -> Result<Self> {
        config.validate()?;
        if corpus.block_size() != config.data.block_size {
            return Err(TrainError::Config(format!(
                "corpus windows of {} do not match block_size {}",
                corpus.block_size(),
                config.data.block_size
            )));
        }
        Ok(Self { config, corpus })
    }

    pub fn corpus(&self) -> &Corpus {
        &self.corpus
    }

    pub fn run(&self) -> Result<SweepOutcome> {
        let work_dir = &self.config.run.system.work_dir;
        fs::create_dir_all(work_dir)?;
        self.corpus.vocab.save(work_dir.join("vocab.json"))?;

        let combinations = self.config.grid.combinations();
        let total = combinations.len();
        let mut best: Option<BestRun> = None;
        let mut completed = 0;
        let mut failures = Vec::new();

        for (run_idx, hyperparameters) in combinations.into_iter().enumerate() {
            info!("run {}/{}: {}", run_idx + 1, total, hyperparameters);
            let (model, summary) = match self.run_one(run_idx, &hyperparameters) {
                Ok(result) => result,
                Err(err) => {
                    error!("run {run_idx} ({hyperparameters}) failed: {err}");
                    failures.push(FailedRun {
                        run_idx,
                        hyperparameters,
                        error: err.to_string(),
                    });
                    continue;
                }
            };
            completed += 1;
            info!(
                "run {}: {:?} after {} iterations, validation loss {:.5}, perplexity {:.5}",
                run_idx,
                summary.termination,
                summary.iterations,
                summary.best_val_loss,
                summary.best_val_perplexity
            );

            let is_better = best
                .as_ref()
                .map_or(true, |current| summary.best_val_loss < current.val_loss);
            if is_better {
                best = Some(BestRun {
                    run_idx,
                    hyperparameters,
                    val_loss: summary.best_val_loss,
                    val_perplexity: summary.best_val_perplexity,
                    model,
                });
            }
        }

        match best {
            Some(best) => Ok(SweepOutcome {
                best,
                completed,
                failures,
            }),
            None => Err(TrainError::NoSuccessfulRun {
                failed: failures.len(),
            }),
        }
    }

    fn run_one(
        &self,
        run_idx: usize,
        hyperparameters: &Hyperparameters,
    ) -> Result<(Box<dyn LanguageModel>, RunSummary)> {
        let mut config = self.config.run.with_hyperparameters(hyperparameters);
        config.model = config
            .model
            .with_data(self.corpus.vocab.len(), self.corpus.block_size());
        config.model.validate()?;
        config.trainer.validate()?;

        let work_dir = &config.system.work_dir;
        let writer = BufWriter::new(File::create(report::config_path(work_dir, run_idx))?);
        serde_json::to_writer_pretty(writer, &config)?;

        let device = config.trainer.device.resolve()?;
        let seed = config.system.seed;
        tch::manual_seed(seed as i64);
        let model = build_model(&config.model, device)?;

        let summary = {
            let mut trainer = Trainer::new(
                &config.trainer,
                model.as_ref(),
                &self.corpus.train,
                &self.corpus.val,
                seed,
            )?;
            let mut reporter = Reporter::new(
                &self.config.report,
                &self.corpus.vocab,
                work_dir,
                run_idx,
                seed,
            );
            let summary = trainer.run(|step, model| reporter.on_iteration(step, model))?;
            reporter.finish(model.as_ref())?;
            summary
        };

        Ok((model, summary))
    }
}
