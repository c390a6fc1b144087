use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use env_logger::Env;
use log::{info, warn};

use tinylm_core::ModelType;
use trainer::{Corpus, ExperimentConfig, Sweep};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModelChoice {
    Feedforward,
    Gpt,
}

impl From<ModelChoice> for ModelType {
    fn from(choice: ModelChoice) -> Self {
        match choice {
            ModelChoice::Feedforward => ModelType::Feedforward,
            ModelChoice::Gpt => ModelType::Gpt,
        }
    }
}

/// Grid-searches a character-level language model over a text corpus.
#[derive(Parser, Debug)]
#[command(name = "tinylm-train", version, about)]
struct Cli {
    /// Model variant; overrides the one in --config
    #[arg(short, long, value_enum)]
    model: Option<ModelChoice>,

    /// Training corpus (plain text)
    #[arg(short, long)]
    data: Option<PathBuf>,

    /// YAML experiment configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for checkpoints, run configurations and the vocabulary
    #[arg(short, long)]
    work_dir: Option<PathBuf>,

    #[arg(long)]
    max_iters: Option<usize>,
}

fn load_config(cli: &Cli) -> Result<ExperimentConfig> {
    let mut config = match &cli.config {
        Some(path) => ExperimentConfig::from_yaml_file(path)
            .with_context(|| format!("failed to read configuration {}", path.display()))?,
        None => ExperimentConfig::profile(
            cli.model.map(ModelType::from).unwrap_or(ModelType::Feedforward),
        ),
    };

    if let (Some(choice), Some(_)) = (cli.model, &cli.config) {
        config.run.model.model_type = choice.into();
    }
    if let Some(data) = &cli.data {
        config.data.path = data.clone();
    }
    if let Some(work_dir) = &cli.work_dir {
        config.run.system.work_dir = work_dir.clone();
    }
    if let Some(max_iters) = cli.max_iters {
        config.run.trainer.max_iters = max_iters;
    }
    config.validate()?;
    Ok(config)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    info!(
        "{} model, data {}, work dir {}",
        config.run.model.model_type,
        config.data.path.display(),
        config.run.system.work_dir.display()
    );

    let data = &config.data;
    let corpus = Corpus::from_file(&data.path, data.train_ratio, data.block_size)
        .with_context(|| format!("failed to load corpus {}", config.data.path.display()))?;
    let sweep = Sweep::new(config, corpus)?;
    let outcome = sweep.run()?;

    if !outcome.failures.is_empty() {
        warn!(
            "{} of {} runs failed",
            outcome.failures.len(),
            outcome.failures.len() + outcome.completed
        );
        for failed in &outcome.failures {
            warn!("run {} ({}): {}", failed.run_idx, failed.hyperparameters, failed.error);
        }
    }

    let best = &outcome.best;
    info!(
        "Best Perplexity: {:.5} Best Validation Loss: {:.5} {}",
        best.val_perplexity, best.val_loss, best.hyperparameters
    );
    Ok(())
}
