use std::time::{Duration, Instant};

use log::{debug, info};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tch::{nn, Device};
use tinylm_core::{build_optimizer, clip_grad_norm, LanguageModel};

use crate::dataset::{BatchLoader, CharDataset};
use crate::error::{Result, TrainError};
use crate::TrainerConfig;

/// Handed to the caller after every optimizer step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IterationReport {
    /// Zero-based index of the step that just finished.
    pub iteration: usize,
    pub loss: f64,
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Validation stopped improving for `patience` consecutive checks.
    Converged,
    MaxItersReached,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunSummary {
    pub termination: Termination,
    pub iterations: usize,
    pub best_val_loss: f64,
    pub best_val_perplexity: f64,
}

/// Patience-based stopping on relative validation improvement.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    min_relative_improvement: f64,
    best: f64,
    stale: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize, min_relative_improvement: f64) -> Self {
        Self {
            patience,
            min_relative_improvement,
            best: f64::INFINITY,
            stale: 0,
        }
    }

    /// Records a validation loss. Returns whether it counted as an
    /// improvement; the first observation always does.
    pub fn observe(&mut self, loss: f64) -> bool {
        let improved = if self.best.is_infinite() {
            true
        } else {
            (self.best - loss) / self.best >= self.min_relative_improvement
        };
        if improved {
            self.best = loss;
            self.stale = 0;
        } else {
            self.stale += 1;
        }
        improved
    }

    pub fn should_stop(&self) -> bool {
        self.stale >= self.patience
    }

    pub fn best(&self) -> f64 {
        self.best
    }

    pub fn stale(&self) -> usize {
        self.stale
    }
}

pub struct Trainer<'a> {
    config: TrainerConfig,
    model: &'a dyn LanguageModel,
    train: &'a CharDataset,
    val: &'a CharDataset,
    optimizer: nn::Optimizer,
    loader: BatchLoader,
    rng: StdRng,
    device: Device,
}

impl<'a> Trainer<'a> {
    pub fn new(
        config: &TrainerConfig,
        model: &'a dyn LanguageModel,
        train: &'a CharDataset,
        val: &'a CharDataset,
        seed: u64,
    ) -> Result<Self> {
        config.validate()?;
        if val.is_empty() {
            return Err(TrainError::EmptyValidation);
        }
        if train.is_empty() {
            return Err(TrainError::Data("the training set has no windows".to_string()));
        }
        let block_size = model.config().block_size;
        for dataset in [train, val] {
            if dataset.block_size() as i64 != block_size {
                return Err(TrainError::Config(format!(
                    "dataset windows of {} do not match the model's block_size {}",
                    dataset.block_size(),
                    block_size
                )));
            }
        }

        let device = model.var_store().device();
        let optimizer = build_optimizer(model, &config.optimizer())?;
        let loader = BatchLoader::new(config.num_workers, device)?;

        Ok(Self {
            config: config.clone(),
            model,
            train,
            val,
            optimizer,
            loader,
            rng: StdRng::seed_from_u64(seed),
            device,
        })
    }

    /// Trains until early stopping fires or `max_iters` steps have run.
    /// `handler` sees every step; an error from it aborts the run.
    pub fn run<F>(&mut self, mut handler: F) -> Result<RunSummary>
    where
        F: FnMut(&IterationReport, &dyn LanguageModel) -> Result<()>,
    {
        let interval = self.config.validation_interval;
        let mut stopping =
            EarlyStopping::new(self.config.patience, self.config.min_relative_improvement);
        let mut iteration = 0;

        while iteration < self.config.max_iters {
            let report = self.step(iteration)?;
            handler(&report, self.model)?;
            iteration += 1;

            if iteration % interval == 0 {
                self.validate(iteration, &mut stopping)?;
                if stopping.should_stop() {
                    info!(
                        "no improvement in {} validations, stopping at iteration {}",
                        stopping.stale(),
                        iteration
                    );
                    return Ok(summary(Termination::Converged, iteration, &stopping));
                }
            }
        }

        if iteration % interval != 0 {
            self.validate(iteration, &mut stopping)?;
        }
        Ok(summary(Termination::MaxItersReached, iteration, &stopping))
    }

    fn step(&mut self, iteration: usize) -> Result<IterationReport> {
        let start = Instant::now();
        let (x, y) = self
            .loader
            .sample(self.train, self.config.batch_size, &mut self.rng)?;

        let scores = self.model.score(&x, Some(&y), true)?;
        let loss = scores.loss.ok_or_else(missing_loss)?;
        let loss_value = loss.double_value(&[]);
        if !loss_value.is_finite() {
            return Err(TrainError::Diverged {
                iteration,
                what: "training loss",
                value: loss_value,
            });
        }

        self.optimizer.zero_grad();
        loss.backward();
        clip_grad_norm(self.model.var_store(), self.config.grad_norm_clip).map_err(|err| {
            match err {
                tinylm_core::Error::NonFinite { what, value } => TrainError::Diverged {
                    iteration,
                    what,
                    value,
                },
                other => other.into(),
            }
        })?;
        self.optimizer.step();

        Ok(IterationReport {
            iteration,
            loss: loss_value,
            duration: start.elapsed(),
        })
    }

    fn validate(&self, iteration: usize, stopping: &mut EarlyStopping) -> Result<()> {
        let loss = self.evaluate()?;
        if !loss.is_finite() {
            return Err(TrainError::Diverged {
                iteration,
                what: "validation loss",
                value: loss,
            });
        }
        let improved = stopping.observe(loss);
        debug!(
            "iter {}: validation loss {:.5} (best {:.5}, improved: {}, stale: {})",
            iteration,
            loss,
            stopping.best(),
            improved,
            stopping.stale()
        );
        Ok(())
    }

    /// Mean loss over every validation window, without dropout or gradients.
    pub fn evaluate(&self) -> Result<f64> {
        evaluate(self.model, self.val, self.config.eval_batch_size, self.device)
    }
}

/// Mean per-window loss of `model` over all of `dataset`.
pub fn evaluate(
    model: &dyn LanguageModel,
    dataset: &CharDataset,
    batch_size: usize,
    device: Device,
) -> Result<f64> {
    if dataset.is_empty() {
        return Err(TrainError::EmptyValidation);
    }
    let _guard = tch::no_grad_guard();
    let mut total = 0.0;
    for (x, y) in dataset.sequential_batches(batch_size, device) {
        let rows = x.size()[0] as f64;
        let loss = model
            .score(&x, Some(&y), false)?
            .loss
            .ok_or_else(missing_loss)?;
        total += loss.double_value(&[]) * rows;
    }
    Ok(total / dataset.len() as f64)
}

fn missing_loss() -> TrainError {
    TrainError::Data("model returned no loss for a target batch".to_string())
}

fn summary(termination: Termination, iterations: usize, stopping: &EarlyStopping) -> RunSummary {
    let best_val_loss = stopping.best();
    RunSummary {
        termination,
        iterations,
        best_val_loss,
        best_val_perplexity: best_val_loss.exp(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tinylm_core::{build_model, ModelConfig};

    #[test]
    fn first_observation_always_improves() {
        let mut stopping = EarlyStopping::new(2, 0.05);
        assert!(stopping.observe(10.0));
        assert_eq!(stopping.best(), 10.0);
        assert!(!stopping.should_stop());
    }

    #[test]
    fn stops_exactly_when_the_streak_reaches_patience() {
        let mut stopping = EarlyStopping::new(3, 0.05);
        let losses = [4.0, 3.0, 2.95, 2.9, 2.0, 1.99, 1.98, 1.97, 1.0];
        let mut stopped_at = None;
        for (check, &loss) in losses.iter().enumerate() {
            stopping.observe(loss);
            if stopping.should_stop() {
                stopped_at = Some(check);
                break;
            }
        }
        // 2.95 and 2.9 are within 5% of 3.0; 2.0 resets; then 1.99, 1.98, 1.97.
        assert_eq!(stopped_at, Some(7));
        assert_eq!(stopping.best(), 2.0);
    }

    #[test]
    fn relative_threshold_is_inclusive() {
        let mut stopping = EarlyStopping::new(1, 0.5);
        stopping.observe(2.0);
        assert!(stopping.observe(1.0));
        assert!(!stopping.observe(0.6));
        assert!(stopping.should_stop());
    }

    fn tiny_model() -> Box<dyn LanguageModel> {
        let mut config = ModelConfig::feedforward().with_data(5, 4);
        config.n_embd = 4;
        config.hidden_dim = 16;
        tch::manual_seed(0);
        build_model(&config, Device::Cpu).unwrap()
    }

    fn datasets() -> (CharDataset, CharDataset) {
        let ids: Vec<i64> = (0..200).map(|i| i % 5).collect();
        (
            CharDataset::new(ids[..150].to_vec(), 4),
            CharDataset::new(ids[150..].to_vec(), 4),
        )
    }

    #[test]
    fn empty_validation_is_fatal() {
        let model = tiny_model();
        let (train, _) = datasets();
        let empty = CharDataset::new(vec![0, 1, 2], 4);
        let result = Trainer::new(&TrainerConfig::default(), model.as_ref(), &train, &empty, 0);
        assert!(matches!(result, Err(TrainError::EmptyValidation)));
    }

    #[test]
    fn mismatched_block_size_is_rejected() {
        let model = tiny_model();
        let train = CharDataset::new((0..50).map(|i| i % 5).collect(), 3);
        let val = CharDataset::new((0..20).map(|i| i % 5).collect(), 3);
        let result = Trainer::new(&TrainerConfig::default(), model.as_ref(), &train, &val, 0);
        assert!(matches!(result, Err(TrainError::Config(_))));
    }

    #[test]
    fn run_reports_every_iteration_and_validates_at_the_end() {
        let model = tiny_model();
        let (train, val) = datasets();
        let config = TrainerConfig {
            device: crate::DeviceSelector::Cpu,
            num_workers: 0,
            max_iters: 7,
            batch_size: 8,
            validation_interval: 5,
            patience: 10,
            learning_rate: 1e-2,
            ..TrainerConfig::default()
        };
        let mut trainer = Trainer::new(&config, model.as_ref(), &train, &val, 1).unwrap();
        let mut seen = Vec::new();
        let summary = trainer
            .run(|report, _| {
                seen.push(report.iteration);
                Ok(())
            })
            .unwrap();

        assert_eq!(seen, (0..7).collect::<Vec<_>>());
        assert_eq!(summary.termination, Termination::MaxItersReached);
        assert_eq!(summary.iterations, 7);
        assert!(summary.best_val_loss.is_finite());
        assert!((summary.best_val_perplexity - summary.best_val_loss.exp()).abs() < 1e-9);
    }

    #[test]
    fn run_converges_when_validation_stalls() {
        let model = tiny_model();
        let (train, val) = datasets();
        // A cross-entropy loss can never improve by 100%, so every check after
        // the first is stale.
        let config = TrainerConfig {
            num_workers: 0,
            max_iters: 1000,
            batch_size: 8,
            validation_interval: 5,
            patience: 3,
            min_relative_improvement: 1.0,
            ..TrainerConfig::default()
        };
        let eval_batch_size = config.eval_batch_size;
        let mut first_check = None;
        let mut trainer = Trainer::new(&config, model.as_ref(), &train, &val, 2).unwrap();
        let summary = trainer
            .run(|report, model| {
                if report.iteration + 1 == 5 {
                    first_check = Some(evaluate(model, &val, eval_batch_size, Device::Cpu)?);
                }
                Ok(())
            })
            .unwrap();

        assert_eq!(summary.termination, Termination::Converged);
        assert_eq!(summary.iterations, 5 * (3 + 1));
        assert_eq!(Some(summary.best_val_loss), first_check);
    }

    #[test]
    fn handler_errors_abort_the_run() {
        let model = tiny_model();
        let (train, val) = datasets();
        let config = TrainerConfig {
            num_workers: 0,
            max_iters: 10,
            batch_size: 4,
            ..TrainerConfig::default()
        };
        let mut trainer = Trainer::new(&config, model.as_ref(), &train, &val, 1).unwrap();
        let mut calls = 0;
        let result = trainer.run(|_, _| {
            calls += 1;
            Err(TrainError::Data("stop".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn evaluation_does_not_touch_parameters() {
        let model = tiny_model();
        let (_, val) = datasets();
        let before: Vec<f64> = model
            .var_store()
            .trainable_variables()
            .iter()
            .map(|t| t.sum(tch::Kind::Double).double_value(&[]))
            .collect();
        let a = evaluate(model.as_ref(), &val, 7, Device::Cpu).unwrap();
        let b = evaluate(model.as_ref(), &val, 64, Device::Cpu).unwrap();
        let after: Vec<f64> = model
            .var_store()
            .trainable_variables()
            .iter()
            .map(|t| t.sum(tch::Kind::Double).double_value(&[]))
            .collect();
        assert_eq!(before, after);
        assert!((a - b).abs() < 1e-5, "{a} vs {b}");
    }
}
